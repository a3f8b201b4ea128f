use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::SearchConfig;
use crate::error::MappingError;
use crate::mapping::evidence::{
    Candidate, page_number_candidates, pick_nearest, pick_title_candidate, title_candidates,
    window,
};
use crate::mapping::oracle::{PageClassifier, PageOracle, PageRenderer};
use crate::model::{
    AnchorConfirmation, AnchorEvidence, OffsetEstimate, OffsetRegion, OffsetStatus, TocEntry,
};

/// Upper bound on reported confidence. The offset is a prior for the
/// resolver, never a substitute for checking pages.
pub const MAX_PRIOR_CONFIDENCE: f64 = 0.9;
const PAGE_NUMBER_WEIGHT: f64 = 0.7;
const PIECEWISE_PENALTY: f64 = 0.5;
const MAX_BISECT_PROBES: usize = 8;

pub struct OffsetEstimator<'a> {
    search: &'a SearchConfig,
    title_threshold: f64,
}

impl<'a> OffsetEstimator<'a> {
    pub fn new(search: &'a SearchConfig, title_threshold: f64) -> Self {
        Self {
            search,
            title_threshold,
        }
    }

    pub async fn estimate<R: PageRenderer, C: PageClassifier>(
        &self,
        toc: &[TocEntry],
        oracle: &PageOracle<R, C>,
    ) -> Result<OffsetEstimate, MappingError> {
        let positions = anchor_positions(toc.len(), self.search.anchor_count);
        if positions.is_empty() || oracle.total_pages() == 0 {
            return Ok(OffsetEstimate::failed(Vec::new()));
        }

        let mut anchors = Vec::<AnchorConfirmation>::new();
        let mut remaining = positions.iter().copied();
        for position in remaining.by_ref() {
            if let Some(anchor) = self.scan_for_anchor(toc, position, oracle).await? {
                info!(
                    title = %anchor.song_title,
                    pdf_index = anchor.pdf_index,
                    offset = anchor.offset,
                    "first anchor confirmed"
                );
                anchors.push(anchor);
                break;
            }
            warn!(title = %toc[position].song_title, "anchor not found");
        }

        let Some(prior) = anchors.first().map(|anchor| anchor.offset) else {
            warn!(anchors_tried = positions.len(), "offset estimation failed");
            return Ok(OffsetEstimate::failed(Vec::new()));
        };

        let later = remaining.collect::<Vec<usize>>();
        let checks = later
            .iter()
            .map(|position| self.confirm_with_prior(toc, *position, prior, oracle));
        for (position, checked) in later.iter().zip(join_all(checks).await) {
            match checked? {
                Some(anchor) => anchors.push(anchor),
                None => warn!(title = %toc[*position].song_title, "anchor not confirmed"),
            }
        }
        anchors.sort_by_key(|anchor| anchor.toc_position);

        let regions = self.build_regions(toc, &anchors, oracle).await?;
        let status = if regions.len() > 1 {
            OffsetStatus::Piecewise
        } else {
            OffsetStatus::Consistent
        };
        let confidence = confidence_for(&anchors, positions.len(), status);

        info!(
            status = ?status,
            confidence,
            regions = regions.len(),
            anchors = anchors.len(),
            "offset estimated"
        );
        Ok(OffsetEstimate {
            status,
            confidence,
            regions,
            anchors,
        })
    }

    /// No prior: ascending scan from page 0, one batch of `lookahead` pages at
    /// a time, stopping at the first batch with a title hit. Front matter of
    /// any length is crossed this way.
    async fn scan_for_anchor<R: PageRenderer, C: PageClassifier>(
        &self,
        toc: &[TocEntry],
        position: usize,
        oracle: &PageOracle<R, C>,
    ) -> Result<Option<AnchorConfirmation>, MappingError> {
        let entry = &toc[position];
        let Some(last) = oracle.total_pages().checked_sub(1) else {
            return Ok(None);
        };

        let batch = self.search.lookahead.max(1);
        let mut number_hits = Vec::<Candidate>::new();
        let mut start = 0;
        while start <= last {
            let end = (start + batch - 1).min(last);
            let observations = oracle.observe_many(start..=end).await?;

            let titled = title_candidates(&observations, toc, position, self.title_threshold, true);
            if let Some(hit) = pick_title_candidate(&titled, entry.printed_page, None) {
                return Ok(Some(confirmation(
                    toc,
                    position,
                    hit.pdf_index,
                    AnchorEvidence::Title,
                    false,
                )));
            }
            number_hits.extend(page_number_candidates(
                &observations,
                toc,
                position,
                self.title_threshold,
            ));
            start = end + 1;
        }

        Ok(pick_nearest(&number_hits, None).map(|hit| {
            confirmation(toc, position, hit.pdf_index, AnchorEvidence::PageNumber, false)
        }))
    }

    /// Narrow window around the prior prediction, widened once when the
    /// narrow look misses or disagrees with the prior.
    async fn confirm_with_prior<R: PageRenderer, C: PageClassifier>(
        &self,
        toc: &[TocEntry],
        position: usize,
        prior: i64,
        oracle: &PageOracle<R, C>,
    ) -> Result<Option<AnchorConfirmation>, MappingError> {
        let predicted = toc[position].printed_page + prior;

        let narrow = self
            .find_near(toc, position, predicted, self.search.neighborhood_radius, oracle)
            .await?;
        if let Some(anchor) = &narrow {
            if anchor.offset == prior {
                return Ok(narrow);
            }
        }

        debug!(
            title = %toc[position].song_title,
            predicted,
            "widening anchor search"
        );
        let wide = self
            .find_near(toc, position, predicted, self.search.max_search_radius, oracle)
            .await?;
        Ok(wide.map(|mut anchor| {
            anchor.widened = true;
            anchor
        }))
    }

    async fn find_near<R: PageRenderer, C: PageClassifier>(
        &self,
        toc: &[TocEntry],
        position: usize,
        predicted: i64,
        radius: usize,
        oracle: &PageOracle<R, C>,
    ) -> Result<Option<AnchorConfirmation>, MappingError> {
        let Some((first, last)) = window(predicted, radius, oracle.total_pages()) else {
            return Ok(None);
        };
        let observations = oracle.observe_many(first..=last).await?;

        let titled = title_candidates(&observations, toc, position, self.title_threshold, true);
        if let Some(hit) =
            pick_title_candidate(&titled, toc[position].printed_page, Some(predicted))
        {
            return Ok(Some(confirmation(
                toc,
                position,
                hit.pdf_index,
                AnchorEvidence::Title,
                false,
            )));
        }

        let numbered = page_number_candidates(&observations, toc, position, self.title_threshold);
        Ok(pick_nearest(&numbered, Some(predicted)).map(|hit| {
            confirmation(toc, position, hit.pdf_index, AnchorEvidence::PageNumber, false)
        }))
    }

    /// Groups agreeing neighbours into regions and, where two neighbours
    /// disagree, bisects the TOC between them to find where the offset shifts.
    async fn build_regions<R: PageRenderer, C: PageClassifier>(
        &self,
        toc: &[TocEntry],
        anchors: &[AnchorConfirmation],
        oracle: &PageOracle<R, C>,
    ) -> Result<Vec<OffsetRegion>, MappingError> {
        let mut starts = Vec::<(usize, i64)>::new();
        for anchor in anchors {
            match starts.last() {
                Some((_, offset)) if *offset == anchor.offset => {}
                Some(_) => {
                    let previous = anchors
                        .iter()
                        .rev()
                        .find(|other| other.toc_position < anchor.toc_position)
                        .map(|other| (other.toc_position, other.offset));
                    let boundary = match previous {
                        Some((low, low_offset)) => {
                            self.locate_transition(
                                toc,
                                low,
                                low_offset,
                                anchor.toc_position,
                                anchor.offset,
                                oracle,
                            )
                            .await?
                        }
                        None => anchor.toc_position,
                    };
                    starts.push((boundary, anchor.offset));
                }
                None => starts.push((0, anchor.offset)),
            }
        }

        let total_pages = oracle.total_pages();
        let mut regions = Vec::with_capacity(starts.len());
        for (index, (first_position, offset)) in starts.iter().enumerate() {
            let last_position = starts
                .get(index + 1)
                .map(|(next, _)| next - 1)
                .unwrap_or(toc.len() - 1);
            regions.push(OffsetRegion {
                offset: *offset,
                first_toc_position: *first_position,
                last_toc_position: last_position,
                first_pdf_index: clamp_index(
                    toc[*first_position].printed_page + offset,
                    total_pages,
                ),
                last_pdf_index: None,
            });
        }

        for index in 0..regions.len() {
            regions[index].last_pdf_index = match regions.get(index + 1) {
                Some(next) => next.first_pdf_index.and_then(|first| first.checked_sub(1)),
                None => total_pages.checked_sub(1),
            };
        }

        Ok(regions)
    }

    /// Returns the first TOC position that uses `high_offset`. Entries the
    /// probes cannot decide stay with the earlier region.
    async fn locate_transition<R: PageRenderer, C: PageClassifier>(
        &self,
        toc: &[TocEntry],
        low: usize,
        low_offset: i64,
        high: usize,
        high_offset: i64,
        oracle: &PageOracle<R, C>,
    ) -> Result<usize, MappingError> {
        let (mut low, mut high) = (low, high);
        let mut probes = 0usize;

        while high - low > 1 && probes < MAX_BISECT_PROBES {
            probes += 1;
            let middle = low + (high - low) / 2;
            let printed = toc[middle].printed_page;
            let pages = [printed + low_offset, printed + high_offset]
                .into_iter()
                .filter_map(|page| clamp_index(page, oracle.total_pages()));
            let observations = oracle.observe_many(pages).await?;
            let titled =
                title_candidates(&observations, toc, middle, self.title_threshold, true);

            let hit = |offset: i64| {
                titled
                    .iter()
                    .any(|candidate| candidate.pdf_index as i64 == printed + offset)
            };
            match (hit(low_offset), hit(high_offset)) {
                (true, false) => low = middle,
                (false, true) => high = middle,
                _ => {
                    debug!(
                        title = %toc[middle].song_title,
                        "offset transition undecided"
                    );
                    break;
                }
            }
        }

        info!(
            first_position = high,
            low_offset, high_offset, probes, "offset transition located"
        );
        Ok(high)
    }
}

/// Evenly spread TOC positions, first and last included.
pub(crate) fn anchor_positions(toc_len: usize, anchor_count: usize) -> Vec<usize> {
    if toc_len == 0 || anchor_count == 0 {
        return Vec::new();
    }
    if anchor_count == 1 || toc_len == 1 {
        return vec![0];
    }

    let mut positions = (0..anchor_count)
        .map(|slot| slot * (toc_len - 1) / (anchor_count - 1))
        .collect::<Vec<usize>>();
    positions.dedup();
    positions
}

fn confirmation(
    toc: &[TocEntry],
    position: usize,
    pdf_index: usize,
    evidence: AnchorEvidence,
    widened: bool,
) -> AnchorConfirmation {
    let entry = &toc[position];
    AnchorConfirmation {
        toc_position: position,
        song_title: entry.song_title.clone(),
        printed_page: entry.printed_page,
        pdf_index,
        offset: pdf_index as i64 - entry.printed_page,
        evidence,
        widened,
    }
}

fn confidence_for(anchors: &[AnchorConfirmation], selected: usize, status: OffsetStatus) -> f64 {
    if anchors.is_empty() || selected == 0 {
        return 0.0;
    }

    let coverage = anchors.len() as f64 / selected as f64;
    let weight = anchors
        .iter()
        .map(|anchor| match anchor.evidence {
            AnchorEvidence::Title => 1.0,
            AnchorEvidence::PageNumber => PAGE_NUMBER_WEIGHT,
        })
        .sum::<f64>()
        / anchors.len() as f64;
    let penalty = match status {
        OffsetStatus::Piecewise => PIECEWISE_PENALTY,
        OffsetStatus::Consistent | OffsetStatus::Failed => 1.0,
    };

    MAX_PRIOR_CONFIDENCE * coverage * weight * penalty
}

fn clamp_index(page: i64, total_pages: usize) -> Option<usize> {
    if page < 0 || page as usize >= total_pages {
        return None;
    }
    Some(page as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_positions_spread_and_dedupe() {
        assert_eq!(anchor_positions(10, 3), vec![0, 4, 9]);
        assert_eq!(anchor_positions(2, 3), vec![0, 1]);
        assert_eq!(anchor_positions(1, 3), vec![0]);
        assert_eq!(anchor_positions(5, 1), vec![0]);
        assert!(anchor_positions(0, 3).is_empty());
    }

    #[test]
    fn confidence_never_reaches_certainty() {
        let anchor = AnchorConfirmation {
            toc_position: 0,
            song_title: "Big Shot".to_string(),
            printed_page: 10,
            pdf_index: 2,
            offset: -8,
            evidence: AnchorEvidence::Title,
            widened: false,
        };
        let full = confidence_for(
            &[anchor.clone(), anchor.clone(), anchor.clone()],
            3,
            OffsetStatus::Consistent,
        );
        assert!((full - MAX_PRIOR_CONFIDENCE).abs() < 1e-9);

        let partial = confidence_for(&[anchor.clone()], 3, OffsetStatus::Piecewise);
        assert!(partial < full / 2.0);
        assert_eq!(confidence_for(&[], 3, OffsetStatus::Failed), 0.0);
    }
}
