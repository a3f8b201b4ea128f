//! TOC-to-PDF mapping: estimate the printed-page offset, then resolve each
//! TOC entry to a PDF page range using classifier evidence.

pub mod boundary;
mod evidence;
pub mod offset;
pub mod oracle;
pub mod response;
pub mod retry;
pub mod review;
pub mod store;
pub mod title;


use tracing::{info, warn};

use crate::config::MappingConfig;
use crate::error::MappingError;
use crate::model::{
    ClassifierStats, OffsetEstimate, OffsetStatus, ResolutionIssue, ReviewSummary, SongSegment,
    TocEntry,
};

pub use boundary::{BoundaryResolver, verify_partition};
pub use offset::OffsetEstimator;
pub use oracle::{PageClassifier, PageImage, PageOracle, PageRenderer, StoreBinding};
pub use retry::{CancelSignal, RetryPolicy, cancel_pair};
pub use store::ObservationStore;

#[derive(Debug, Clone)]
pub struct BookResolution {
    pub estimate: OffsetEstimate,
    pub segments: Vec<SongSegment>,
    pub issues: Vec<ResolutionIssue>,
    pub review: ReviewSummary,
    pub stats: ClassifierStats,
}

pub fn validate_toc(toc: &[TocEntry]) -> Result<(), MappingError> {
    if toc.is_empty() {
        return Err(MappingError::invalid_toc("table of contents is empty"));
    }
    if let Some((position, _)) = toc
        .iter()
        .enumerate()
        .find(|(_, entry)| entry.song_title.trim().is_empty())
    {
        return Err(MappingError::invalid_toc(format!(
            "entry {position} has an empty title"
        )));
    }
    Ok(())
}

/// Maps one book end to end. Per-entry trouble becomes issues and lower
/// confidence; only an invalid TOC, a broken store or cancellation is an
/// error.
pub async fn resolve_book<R: PageRenderer, C: PageClassifier>(
    toc: &[TocEntry],
    oracle: &PageOracle<R, C>,
    config: &MappingConfig,
) -> Result<BookResolution, MappingError> {
    validate_toc(toc)?;
    if oracle.total_pages() == 0 {
        return Err(MappingError::invalid_input("document has no pages"));
    }
    let threshold = config.matching.title_threshold;

    let estimate = OffsetEstimator::new(&config.search, threshold)
        .estimate(toc, oracle)
        .await?;

    let mut issues = Vec::new();
    match estimate.status {
        OffsetStatus::Failed => issues.push(ResolutionIssue::OffsetEstimationFailed {
            anchors_tried: offset::anchor_positions(toc.len(), config.search.anchor_count).len(),
        }),
        OffsetStatus::Piecewise => issues.push(ResolutionIssue::OffsetAmbiguous {
            offsets: estimate.regions.iter().map(|region| region.offset).collect(),
        }),
        OffsetStatus::Consistent => {}
    }

    let resolution = BoundaryResolver::new(&config.search, threshold)
        .resolve(toc, &estimate, oracle)
        .await?;
    if let Err(problem) = verify_partition(&resolution.segments, oracle.total_pages()) {
        return Err(MappingError::invalid_input(format!(
            "resolved segments do not partition the document: {problem}"
        )));
    }
    issues.extend(resolution.issues);

    let stats = oracle.stats();
    if !stats.unavailable_pages.is_empty() {
        issues.push(ResolutionIssue::ClassifierUnavailable {
            pages: stats.unavailable_pages.clone(),
        });
    }

    let review = review::summarize(
        &resolution.segments,
        &issues,
        &estimate,
        toc.len(),
        config.review.max_fallback_ratio,
    );
    if review.review_required {
        warn!(reasons = ?review.reasons, "book needs review");
    }
    info!(
        entries = toc.len(),
        segments = resolution.segments.len(),
        fallback = review.fallback_count,
        classifier_calls = stats.classifier_calls,
        store_hits = stats.store_hits,
        "book resolved"
    );

    Ok(BookResolution {
        estimate,
        segments: resolution.segments,
        issues,
        review,
        stats,
    })
}
