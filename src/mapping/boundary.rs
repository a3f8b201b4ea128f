use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::config::SearchConfig;
use crate::error::MappingError;
use crate::mapping::evidence::{
    Candidate, page_number_candidates, pick_nearest, pick_title_candidate, title_candidates,
    window,
};
use crate::mapping::oracle::{PageClassifier, PageOracle, PageRenderer};
use crate::model::{MatchConfidence, OffsetEstimate, ResolutionIssue, SongSegment, TocEntry};

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub segments: Vec<SongSegment>,
    pub issues: Vec<ResolutionIssue>,
}

#[derive(Debug, Clone)]
struct Placement {
    toc_position: usize,
    start: usize,
    confidence: MatchConfidence,
    predicted: Option<i64>,
    evidence: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Previous {
    toc_position: usize,
    start: usize,
}

pub struct BoundaryResolver<'a> {
    search: &'a SearchConfig,
    title_threshold: f64,
}

impl<'a> BoundaryResolver<'a> {
    pub fn new(search: &'a SearchConfig, title_threshold: f64) -> Self {
        Self {
            search,
            title_threshold,
        }
    }

    /// Places every TOC entry in order. Starts are strictly increasing by
    /// construction, so the segments partition `[first start, last page]`.
    pub async fn resolve<R: PageRenderer, C: PageClassifier>(
        &self,
        toc: &[TocEntry],
        estimate: &OffsetEstimate,
        oracle: &PageOracle<R, C>,
    ) -> Result<Resolution, MappingError> {
        let total_pages = oracle.total_pages();
        let mut placements = Vec::<Placement>::with_capacity(toc.len());
        let mut issues = Vec::<ResolutionIssue>::new();
        let mut local_offset = None::<i64>;

        for position in 0..toc.len() {
            oracle.ensure_active()?;
            let entry = &toc[position];
            let previous = placements.last().map(|placement| Previous {
                toc_position: placement.toc_position,
                start: placement.start,
            });
            let lower = previous.map(|previous| previous.start + 1).unwrap_or(0);
            if lower >= total_pages {
                warn!(title = %entry.song_title, "no pages left for entry");
                issues.push(ResolutionIssue::UnplacedEntry {
                    toc_position: position,
                    song_title: entry.song_title.clone(),
                    printed_page: entry.printed_page,
                });
                continue;
            }

            let estimated = estimate.offset_for_entry(position);
            let placement = match estimated.or(local_offset) {
                Some(offset) => {
                    self.prefetch(toc, position, estimate, local_offset, oracle)
                        .await?;
                    self.place_predicted(
                        toc,
                        position,
                        entry.printed_page + offset,
                        previous,
                        oracle,
                        &mut issues,
                    )
                    .await?
                }
                None => self.place_by_scan(toc, position, lower, oracle, &mut issues).await?,
            };

            if estimated.is_none()
                && matches!(
                    placement.confidence,
                    MatchConfidence::DirectMatch | MatchConfidence::NeighborMatch
                )
            {
                local_offset = Some(placement.start as i64 - entry.printed_page);
            }

            debug!(
                title = %entry.song_title,
                start = placement.start,
                confidence = placement.confidence.as_str(),
                "entry placed"
            );
            placements.push(placement);
        }

        let segments = build_segments(toc, &placements, total_pages);
        info!(
            segments = segments.len(),
            issues = issues.len(),
            "boundaries resolved"
        );
        Ok(Resolution { segments, issues })
    }

    /// Classifies the neighbourhoods of the next `lookahead` entries together
    /// so their calls overlap; commits still happen one entry at a time.
    async fn prefetch<R: PageRenderer, C: PageClassifier>(
        &self,
        toc: &[TocEntry],
        position: usize,
        estimate: &OffsetEstimate,
        local_offset: Option<i64>,
        oracle: &PageOracle<R, C>,
    ) -> Result<(), MappingError> {
        let upcoming = position..(position + self.search.lookahead).min(toc.len());
        let mut pages = BTreeSet::<usize>::new();
        for ahead in upcoming {
            let Some(offset) = estimate.offset_for_entry(ahead).or(local_offset) else {
                continue;
            };
            if let Some((first, last)) = window(
                toc[ahead].printed_page + offset,
                self.search.neighborhood_radius,
                oracle.total_pages(),
            ) {
                pages.extend(first..=last);
            }
        }
        oracle.observe_many(pages).await?;
        Ok(())
    }

    async fn place_predicted<R: PageRenderer, C: PageClassifier>(
        &self,
        toc: &[TocEntry],
        position: usize,
        predicted: i64,
        previous: Option<Previous>,
        oracle: &PageOracle<R, C>,
        issues: &mut Vec<ResolutionIssue>,
    ) -> Result<Placement, MappingError> {
        let entry = &toc[position];
        let total_pages = oracle.total_pages();
        let lower = previous.map(|previous| previous.start + 1).unwrap_or(0);
        let neighborhood = window(predicted, self.search.neighborhood_radius, total_pages);

        let observations = match neighborhood {
            Some((first, last)) => oracle.observe_many(first..=last).await?,
            None => Vec::new(),
        };
        let near = title_candidates(&observations, toc, position, self.title_threshold, false);
        let (near_valid, mut inverted) = split_at_lower(near, lower);
        if let Some(hit) = pick_title_candidate(&near_valid, entry.printed_page, Some(predicted)) {
            let confidence = if hit.pdf_index as i64 == predicted {
                MatchConfidence::DirectMatch
            } else {
                MatchConfidence::NeighborMatch
            };
            return Ok(Placement {
                toc_position: position,
                start: hit.pdf_index,
                confidence,
                predicted: Some(predicted),
                evidence: indices(&near_valid),
            });
        }

        // Pages other entries already had classified stay usable here.
        let retained = window(predicted, self.search.max_search_radius, total_pages)
            .map(|(first, last)| oracle.cached(first..=last))
            .unwrap_or_default()
            .into_iter()
            .filter(|observation| {
                neighborhood.is_none_or(|(first, last)| {
                    observation.pdf_index < first || observation.pdf_index > last
                })
            })
            .collect::<Vec<_>>();
        let far = title_candidates(&retained, toc, position, self.title_threshold, true);
        let (far_valid, far_inverted) = split_at_lower(far, lower);
        inverted.extend(far_inverted);
        if let Some(hit) = pick_nearest(&far_valid, Some(predicted)) {
            return Ok(Placement {
                toc_position: position,
                start: hit.pdf_index,
                confidence: MatchConfidence::NeighborMatch,
                predicted: Some(predicted),
                evidence: indices(&far_valid),
            });
        }

        let numbered = page_number_candidates(&observations, toc, position, self.title_threshold);
        let (numbered_valid, _) = split_at_lower(numbered, lower);
        if let Some(hit) = pick_nearest(&numbered_valid, Some(predicted)) {
            return Ok(Placement {
                toc_position: position,
                start: hit.pdf_index,
                confidence: MatchConfidence::OffsetInferred,
                predicted: Some(predicted),
                evidence: indices(&numbered_valid),
            });
        }

        let start = (predicted.max(lower as i64) as usize).min(total_pages - 1);
        match previous {
            Some(previous) if predicted < lower as i64 || !inverted.is_empty() => {
                let candidate = pick_nearest(&inverted, Some(predicted))
                    .map(|hit| hit.pdf_index as i64)
                    .unwrap_or(predicted);
                let previous_entry = &toc[previous.toc_position];
                warn!(
                    previous = %previous_entry.song_title,
                    previous_start = previous.start,
                    current = %entry.song_title,
                    candidate,
                    "boundary inconsistent"
                );
                issues.push(ResolutionIssue::BoundaryInconsistent {
                    previous_title: previous_entry.song_title.clone(),
                    previous_printed_page: previous_entry.printed_page,
                    previous_start: previous.start,
                    current_title: entry.song_title.clone(),
                    current_printed_page: entry.printed_page,
                    current_candidate: candidate,
                });
            }
            _ => {
                warn!(
                    title = %entry.song_title,
                    predicted,
                    "no match found; using offset prediction"
                );
                issues.push(ResolutionIssue::NoMatchFound {
                    toc_position: position,
                    song_title: entry.song_title.clone(),
                    predicted_pdf_index: predicted,
                });
            }
        }

        Ok(Placement {
            toc_position: position,
            start,
            confidence: MatchConfidence::Fallback,
            predicted: Some(predicted),
            evidence: Vec::new(),
        })
    }

    /// No usable offset: walk forward from `lower` until a page carries the
    /// entry's title.
    async fn place_by_scan<R: PageRenderer, C: PageClassifier>(
        &self,
        toc: &[TocEntry],
        position: usize,
        lower: usize,
        oracle: &PageOracle<R, C>,
        issues: &mut Vec<ResolutionIssue>,
    ) -> Result<Placement, MappingError> {
        let entry = &toc[position];
        let total_pages = oracle.total_pages();
        let batch = self.search.lookahead.max(1);

        let mut start = lower;
        while start < total_pages {
            let end = (start + batch - 1).min(total_pages - 1);
            let observations = oracle.observe_many(start..=end).await?;
            let titled =
                title_candidates(&observations, toc, position, self.title_threshold, false);
            if let Some(hit) = pick_title_candidate(&titled, entry.printed_page, None) {
                return Ok(Placement {
                    toc_position: position,
                    start: hit.pdf_index,
                    confidence: MatchConfidence::NeighborMatch,
                    predicted: None,
                    evidence: indices(&titled),
                });
            }
            start = end + 1;
        }

        warn!(title = %entry.song_title, "title not found in linear scan");
        issues.push(ResolutionIssue::NoMatchFound {
            toc_position: position,
            song_title: entry.song_title.clone(),
            predicted_pdf_index: entry.printed_page,
        });
        let start = (entry.printed_page.max(lower as i64) as usize).min(total_pages - 1);
        Ok(Placement {
            toc_position: position,
            start,
            confidence: MatchConfidence::Fallback,
            predicted: None,
            evidence: Vec::new(),
        })
    }
}

fn split_at_lower(candidates: Vec<Candidate>, lower: usize) -> (Vec<Candidate>, Vec<Candidate>) {
    candidates
        .into_iter()
        .partition(|candidate| candidate.pdf_index >= lower)
}

fn indices(candidates: &[Candidate]) -> Vec<usize> {
    let mut out = candidates
        .iter()
        .map(|candidate| candidate.pdf_index)
        .collect::<Vec<usize>>();
    out.sort_unstable();
    out.dedup();
    out
}

fn build_segments(
    toc: &[TocEntry],
    placements: &[Placement],
    total_pages: usize,
) -> Vec<SongSegment> {
    placements
        .iter()
        .enumerate()
        .map(|(index, placement)| {
            let entry = &toc[placement.toc_position];
            let end_pdf_index = placements
                .get(index + 1)
                .map(|next| next.start - 1)
                .unwrap_or(total_pages - 1);
            SongSegment {
                toc_position: placement.toc_position,
                song_title: entry.song_title.clone(),
                printed_page: entry.printed_page,
                start_pdf_index: placement.start,
                end_pdf_index,
                match_confidence: placement.confidence,
                predicted_pdf_index: placement.predicted,
                evidence_pages: placement.evidence.clone(),
            }
        })
        .collect()
}

/// Checks that segments are ordered, non-overlapping, gap-free after the
/// first start, and run to the last page.
pub fn verify_partition(segments: &[SongSegment], total_pages: usize) -> Result<(), String> {
    for segment in segments {
        if segment.start_pdf_index > segment.end_pdf_index {
            return Err(format!(
                "segment '{}' is inverted: {}..={}",
                segment.song_title, segment.start_pdf_index, segment.end_pdf_index
            ));
        }
    }
    for pair in segments.windows(2) {
        if pair[1].start_pdf_index != pair[0].end_pdf_index + 1 {
            return Err(format!(
                "segments '{}' and '{}' are not adjacent: {} then {}",
                pair[0].song_title,
                pair[1].song_title,
                pair[0].end_pdf_index,
                pair[1].start_pdf_index
            ));
        }
    }
    if let Some(last) = segments.last() {
        if last.end_pdf_index + 1 != total_pages {
            return Err(format!(
                "last segment ends at {} in a {total_pages}-page document",
                last.end_pdf_index
            ));
        }
    }
    Ok(())
}
