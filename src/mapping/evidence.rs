use crate::mapping::title::title_similarity;
use crate::model::{PageObservation, TocEntry};

/// Other TOC positions, relative to the entry being placed, whose titles may
/// claim a page first.
const RIVAL_OFFSETS: [isize; 3] = [-1, 1, 2];

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Candidate {
    pub pdf_index: usize,
    pub score: f64,
    pub is_song_start: Option<bool>,
    pub printed_page: Option<i64>,
}

impl Candidate {
    fn from_observation(observation: &PageObservation, score: f64) -> Self {
        Self {
            pdf_index: observation.pdf_index,
            score,
            is_song_start: observation.is_song_start,
            printed_page: observation.printed_page,
        }
    }
}

/// Pages whose detected title matches `toc[position]`. A page whose title is
/// a strictly better match for a neighbouring entry is left for that entry.
pub(crate) fn title_candidates<'a>(
    observations: impl IntoIterator<Item = &'a PageObservation>,
    toc: &[TocEntry],
    position: usize,
    threshold: f64,
    require_start: bool,
) -> Vec<Candidate> {
    let expected = &toc[position].song_title;
    observations
        .into_iter()
        .filter(|observation| !(require_start && observation.is_song_start == Some(false)))
        .filter_map(|observation| {
            let detected = observation.detected_title.as_deref()?;
            let score = title_similarity(expected, detected);
            if score < threshold {
                return None;
            }
            if rival_claims(toc, position, detected, score) {
                return None;
            }
            Some(Candidate::from_observation(observation, score))
        })
        .collect()
}

fn rival_claims(toc: &[TocEntry], position: usize, detected: &str, score: f64) -> bool {
    RIVAL_OFFSETS.iter().any(|delta| {
        position
            .checked_add_signed(*delta)
            .and_then(|rival| toc.get(rival))
            .is_some_and(|rival| {
                rival.song_title != toc[position].song_title
                    && title_similarity(&rival.song_title, detected) > score
            })
    })
}

/// Whether `detected` names some TOC entry near `position` other than the
/// entry itself.
pub(crate) fn names_other_entry(
    toc: &[TocEntry],
    position: usize,
    detected: &str,
    threshold: f64,
) -> bool {
    let own = title_similarity(&toc[position].song_title, detected);
    if own >= threshold {
        return false;
    }
    RIVAL_OFFSETS.iter().any(|delta| {
        position
            .checked_add_signed(*delta)
            .and_then(|rival| toc.get(rival))
            .is_some_and(|rival| title_similarity(&rival.song_title, detected) >= threshold)
    })
}

/// Pages printing the entry's page number whose title (if any) does not
/// contradict the entry.
pub(crate) fn page_number_candidates<'a>(
    observations: impl IntoIterator<Item = &'a PageObservation>,
    toc: &[TocEntry],
    position: usize,
    threshold: f64,
) -> Vec<Candidate> {
    let expected = toc[position].printed_page;
    observations
        .into_iter()
        .filter(|observation| observation.printed_page == Some(expected))
        .filter(|observation| {
            observation
                .detected_title
                .as_deref()
                .is_none_or(|detected| !names_other_entry(toc, position, detected, threshold))
        })
        .map(|observation| Candidate::from_observation(observation, 0.0))
        .collect()
}

/// Tie-break among pages matching the same title:
/// 1. earliest page flagged as a song start;
/// 2. otherwise the page whose printed number is closest to the TOC's;
/// 3. otherwise the page nearest the offset prediction;
/// 4. otherwise the lower index.
pub(crate) fn pick_title_candidate(
    candidates: &[Candidate],
    expected_printed: i64,
    predicted: Option<i64>,
) -> Option<&Candidate> {
    let earliest_start = candidates
        .iter()
        .filter(|candidate| candidate.is_song_start == Some(true))
        .min_by_key(|candidate| candidate.pdf_index);
    if earliest_start.is_some() {
        return earliest_start;
    }

    candidates.iter().min_by_key(|candidate| {
        let printed_distance = candidate
            .printed_page
            .map(|printed| (printed - expected_printed).abs())
            .unwrap_or(i64::MAX);
        (
            printed_distance,
            prediction_distance(candidate.pdf_index, predicted),
            candidate.pdf_index,
        )
    })
}

/// Nearest to the prediction, lower index on ties.
pub(crate) fn pick_nearest(candidates: &[Candidate], predicted: Option<i64>) -> Option<&Candidate> {
    candidates.iter().min_by_key(|candidate| {
        (
            prediction_distance(candidate.pdf_index, predicted),
            candidate.pdf_index,
        )
    })
}

fn prediction_distance(pdf_index: usize, predicted: Option<i64>) -> i64 {
    predicted
        .map(|predicted| (pdf_index as i64 - predicted).abs())
        .unwrap_or(0)
}

/// Inclusive page window `center ± radius` clipped to the document.
pub(crate) fn window(center: i64, radius: usize, total_pages: usize) -> Option<(usize, usize)> {
    if total_pages == 0 {
        return None;
    }
    let radius = radius as i64;
    let first = (center - radius).max(0);
    let last = (center + radius).min(total_pages as i64 - 1);
    if first > last {
        return None;
    }
    Some((first as usize, last as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(
        pdf_index: usize,
        printed_page: Option<i64>,
        is_song_start: Option<bool>,
        title: Option<&str>,
    ) -> PageObservation {
        PageObservation {
            pdf_index,
            printed_page,
            is_song_start,
            detected_title: title.map(ToOwned::to_owned),
            unavailable: false,
        }
    }

    fn toc() -> Vec<TocEntry> {
        vec![
            TocEntry::new("Honesty", 19),
            TocEntry::new("Honesty (Reprise)", 23),
            TocEntry::new("My Life", 27),
        ]
    }

    #[test]
    fn earliest_start_flag_wins_the_tie_break() {
        let candidates = vec![
            Candidate {
                pdf_index: 12,
                score: 1.0,
                is_song_start: Some(true),
                printed_page: Some(20),
            },
            Candidate {
                pdf_index: 11,
                score: 1.0,
                is_song_start: Some(true),
                printed_page: None,
            },
            Candidate {
                pdf_index: 10,
                score: 1.0,
                is_song_start: Some(false),
                printed_page: Some(19),
            },
        ];

        let picked = pick_title_candidate(&candidates, 19, Some(12)).expect("picked");
        assert_eq!(picked.pdf_index, 11);
    }

    #[test]
    fn printed_page_then_prediction_break_ties_without_start_flags() {
        let candidates = vec![
            Candidate {
                pdf_index: 9,
                score: 1.0,
                is_song_start: None,
                printed_page: Some(17),
            },
            Candidate {
                pdf_index: 11,
                score: 1.0,
                is_song_start: Some(false),
                printed_page: Some(19),
            },
        ];
        assert_eq!(
            pick_title_candidate(&candidates, 19, Some(9))
                .expect("picked")
                .pdf_index,
            11
        );

        let unnumbered = vec![
            Candidate {
                pdf_index: 8,
                score: 1.0,
                is_song_start: None,
                printed_page: None,
            },
            Candidate {
                pdf_index: 12,
                score: 1.0,
                is_song_start: None,
                printed_page: None,
            },
        ];
        assert_eq!(
            pick_title_candidate(&unnumbered, 19, Some(11))
                .expect("picked")
                .pdf_index,
            12
        );
    }

    #[test]
    fn reprise_page_is_left_for_the_reprise_entry() {
        let pages = vec![
            observed(11, Some(19), Some(true), Some("Honesty")),
            observed(15, Some(23), Some(true), Some("Honesty (Reprise)")),
        ];

        let first = title_candidates(&pages, &toc(), 0, 0.8, false);
        assert_eq!(
            first.iter().map(|c| c.pdf_index).collect::<Vec<_>>(),
            vec![11]
        );

        let reprise = title_candidates(&pages, &toc(), 1, 0.8, false);
        assert_eq!(
            reprise.iter().map(|c| c.pdf_index).collect::<Vec<_>>(),
            vec![15]
        );
    }

    #[test]
    fn require_start_drops_pages_flagged_as_continuations() {
        let pages = vec![observed(11, None, Some(false), Some("Honesty"))];
        assert!(title_candidates(&pages, &toc(), 0, 0.8, true).is_empty());
        assert_eq!(title_candidates(&pages, &toc(), 0, 0.8, false).len(), 1);
    }

    #[test]
    fn page_number_candidates_skip_pages_titled_for_another_song() {
        let pages = vec![
            observed(18, Some(27), Some(true), Some("Honesty (Reprise)")),
            observed(19, Some(27), None, None),
        ];
        let found = page_number_candidates(&pages, &toc(), 2, 0.8);
        assert_eq!(
            found.iter().map(|c| c.pdf_index).collect::<Vec<_>>(),
            vec![19]
        );
    }

    #[test]
    fn window_clips_to_document() {
        assert_eq!(window(1, 2, 10), Some((0, 3)));
        assert_eq!(window(9, 2, 10), Some((7, 9)));
        assert_eq!(window(-5, 2, 10), None);
        assert_eq!(window(3, 0, 0), None);
    }
}
