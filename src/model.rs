use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    #[serde(alias = "title")]
    pub song_title: String,
    #[serde(alias = "page")]
    pub printed_page: i64,
}

impl TocEntry {
    #[cfg(test)]
    pub fn new(song_title: impl Into<String>, printed_page: i64) -> Self {
        Self {
            song_title: song_title.into(),
            printed_page,
        }
    }
}

/// What the classifier reported about one PDF page. Every field is optional
/// because the classifier may not see, may misread, or may never answer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageObservation {
    pub pdf_index: usize,
    pub printed_page: Option<i64>,
    pub is_song_start: Option<bool>,
    pub detected_title: Option<String>,
    /// Set when every classifier attempt for the page failed.
    pub unavailable: bool,
}

impl PageObservation {
    pub fn unavailable(pdf_index: usize) -> Self {
        Self {
            pdf_index,
            unavailable: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    /// Title confirmed on the exact offset-predicted page.
    DirectMatch,
    /// Title confirmed on a nearby page other than the predicted one.
    NeighborMatch,
    /// Printed page number matched but no title confirmation.
    OffsetInferred,
    /// Pure offset arithmetic; needs human review.
    Fallback,
}

impl MatchConfidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectMatch => "direct_match",
            Self::NeighborMatch => "neighbor_match",
            Self::OffsetInferred => "offset_inferred",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongSegment {
    pub toc_position: usize,
    pub song_title: String,
    pub printed_page: i64,
    pub start_pdf_index: usize,
    /// Inclusive.
    pub end_pdf_index: usize,
    pub match_confidence: MatchConfidence,
    pub predicted_pdf_index: Option<i64>,
    pub evidence_pages: Vec<usize>,
}

impl SongSegment {
    pub fn page_count(&self) -> usize {
        self.end_pdf_index + 1 - self.start_pdf_index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorEvidence {
    Title,
    PageNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorConfirmation {
    pub toc_position: usize,
    pub song_title: String,
    pub printed_page: i64,
    pub pdf_index: usize,
    pub offset: i64,
    pub evidence: AnchorEvidence,
    pub widened: bool,
}

/// One contiguous stretch of TOC entries sharing a printed-to-PDF offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRegion {
    pub offset: i64,
    pub first_toc_position: usize,
    /// Inclusive.
    pub last_toc_position: usize,
    pub first_pdf_index: Option<usize>,
    pub last_pdf_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetStatus {
    Consistent,
    Piecewise,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetEstimate {
    pub status: OffsetStatus,
    pub confidence: f64,
    pub regions: Vec<OffsetRegion>,
    pub anchors: Vec<AnchorConfirmation>,
}

impl OffsetEstimate {
    pub fn failed(anchors: Vec<AnchorConfirmation>) -> Self {
        Self {
            status: OffsetStatus::Failed,
            confidence: 0.0,
            regions: Vec::new(),
            anchors,
        }
    }

    pub fn global_offset(&self) -> Option<i64> {
        match self.status {
            OffsetStatus::Consistent => self.regions.first().map(|region| region.offset),
            OffsetStatus::Piecewise | OffsetStatus::Failed => None,
        }
    }

    /// Offset valid for the TOC entry at `toc_position`, if any region covers it.
    pub fn offset_for_entry(&self, toc_position: usize) -> Option<i64> {
        if self.status == OffsetStatus::Failed {
            return None;
        }

        self.regions
            .iter()
            .find(|region| {
                toc_position >= region.first_toc_position
                    && toc_position <= region.last_toc_position
            })
            .or_else(|| self.regions.last())
            .map(|region| region.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionIssue {
    OffsetEstimationFailed {
        anchors_tried: usize,
    },
    OffsetAmbiguous {
        offsets: Vec<i64>,
    },
    BoundaryInconsistent {
        previous_title: String,
        previous_printed_page: i64,
        previous_start: usize,
        current_title: String,
        current_printed_page: i64,
        current_candidate: i64,
    },
    NoMatchFound {
        toc_position: usize,
        song_title: String,
        predicted_pdf_index: i64,
    },
    ClassifierUnavailable {
        pages: Vec<usize>,
    },
    UnplacedEntry {
        toc_position: usize,
        song_title: String,
        printed_page: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub review_required: bool,
    pub complete: bool,
    pub fallback_count: usize,
    pub fallback_ratio: f64,
    pub max_fallback_ratio: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierStats {
    pub pages_observed: usize,
    pub store_hits: usize,
    pub classifier_calls: usize,
    pub retries: usize,
    pub unavailable_pages: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRef {
    pub book_id: String,
    pub pdf_path: String,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub book: BookRef,
    pub toc_entry_count: usize,
    pub offset: OffsetEstimate,
    pub segments: Vec<SongSegment>,
    pub issues: Vec<ResolutionIssue>,
    pub review: ReviewSummary,
    pub classifier: ClassifierStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookEntry {
    pub stem: String,
    pub pdf_filename: String,
    pub toc_filename: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookInventoryManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub source_directory: String,
    pub book_count: usize,
    pub books: Vec<BookEntry>,
    pub missing_toc: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookOutcome {
    Accepted,
    ReviewRequired,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchBookResult {
    pub stem: String,
    pub outcome: BookOutcome,
    pub segment_count: usize,
    pub fallback_count: usize,
    pub artifact_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub started_at: String,
    pub updated_at: String,
    pub books_dir: String,
    pub jobs: usize,
    pub books: Vec<BatchBookResult>,
    pub warnings: Vec<String>,
}
