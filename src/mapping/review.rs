use crate::model::{
    MatchConfidence, OffsetEstimate, OffsetStatus, ResolutionIssue, ReviewSummary, SongSegment,
};

/// Decides whether a resolved book can be trusted as-is. Review-required
/// books are still written; the flag is for whoever consumes the manifest.
pub fn summarize(
    segments: &[SongSegment],
    issues: &[ResolutionIssue],
    estimate: &OffsetEstimate,
    toc_len: usize,
    max_fallback_ratio: f64,
) -> ReviewSummary {
    let fallback_count = segments
        .iter()
        .filter(|segment| segment.match_confidence == MatchConfidence::Fallback)
        .count();
    let fallback_ratio = if toc_len == 0 {
        0.0
    } else {
        fallback_count as f64 / toc_len as f64
    };

    let inconsistent = issues
        .iter()
        .filter(|issue| matches!(issue, ResolutionIssue::BoundaryInconsistent { .. }))
        .count();
    let unplaced = issues
        .iter()
        .filter(|issue| matches!(issue, ResolutionIssue::UnplacedEntry { .. }))
        .count();

    let mut reasons = Vec::new();
    match estimate.status {
        OffsetStatus::Failed => reasons.push("offset estimation failed".to_string()),
        OffsetStatus::Piecewise => reasons.push(format!(
            "offset is piecewise across {} regions",
            estimate.regions.len()
        )),
        OffsetStatus::Consistent => {}
    }
    if inconsistent > 0 {
        reasons.push(format!("{inconsistent} inconsistent boundaries"));
    }
    if unplaced > 0 {
        reasons.push(format!("{unplaced} entries could not be placed"));
    }
    if fallback_ratio > max_fallback_ratio {
        reasons.push(format!(
            "fallback ratio {fallback_ratio:.2} exceeds {max_fallback_ratio:.2}"
        ));
    }

    ReviewSummary {
        review_required: !reasons.is_empty(),
        complete: inconsistent == 0 && unplaced == 0,
        fallback_count,
        fallback_ratio,
        max_fallback_ratio,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OffsetRegion;

    fn segment(position: usize, start: usize, confidence: MatchConfidence) -> SongSegment {
        SongSegment {
            toc_position: position,
            song_title: format!("Song {position}"),
            printed_page: start as i64,
            start_pdf_index: start,
            end_pdf_index: start,
            match_confidence: confidence,
            predicted_pdf_index: Some(start as i64),
            evidence_pages: Vec::new(),
        }
    }

    fn consistent() -> OffsetEstimate {
        OffsetEstimate {
            status: OffsetStatus::Consistent,
            confidence: 0.9,
            regions: vec![OffsetRegion {
                offset: 0,
                first_toc_position: 0,
                last_toc_position: 4,
                first_pdf_index: Some(0),
                last_pdf_index: Some(4),
            }],
            anchors: Vec::new(),
        }
    }

    #[test]
    fn clean_book_is_accepted() {
        let segments = (0..5)
            .map(|position| segment(position, position, MatchConfidence::DirectMatch))
            .collect::<Vec<_>>();
        let summary = summarize(&segments, &[], &consistent(), 5, 0.2);
        assert!(!summary.review_required);
        assert!(summary.complete);
        assert_eq!(summary.fallback_count, 0);
    }

    #[test]
    fn fallback_ratio_at_threshold_is_tolerated_and_above_is_not() {
        let mut segments = (0..5)
            .map(|position| segment(position, position, MatchConfidence::DirectMatch))
            .collect::<Vec<_>>();
        segments[0].match_confidence = MatchConfidence::Fallback;
        assert!(!summarize(&segments, &[], &consistent(), 5, 0.2).review_required);

        segments[1].match_confidence = MatchConfidence::Fallback;
        let summary = summarize(&segments, &[], &consistent(), 5, 0.2);
        assert!(summary.review_required);
        assert_eq!(summary.fallback_count, 2);
        assert!(summary.reasons[0].contains("fallback ratio"));
    }

    #[test]
    fn unplaced_entries_make_the_book_incomplete() {
        let issues = vec![ResolutionIssue::UnplacedEntry {
            toc_position: 3,
            song_title: "Song 3".to_string(),
            printed_page: 40,
        }];
        let summary = summarize(&[], &issues, &OffsetEstimate::failed(Vec::new()), 4, 0.2);
        assert!(summary.review_required);
        assert!(!summary.complete);
        assert_eq!(summary.reasons.len(), 2);
    }
}
