use thiserror::Error;

/// Failure of a single render or classify call. Always transient from the
/// resolver's point of view: the page degrades to an unavailable observation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PageCallError {
    #[error("page call timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },
    #[error("classifier unavailable: {message}")]
    ClassifierUnavailable { message: String },
    #[error("render failed for page {pdf_index}: {message}")]
    Render { pdf_index: usize, message: String },
    #[error("cancelled")]
    Cancelled,
}

impl PageCallError {
    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        Self::ClassifierUnavailable {
            message: message.into(),
        }
    }

    pub(crate) fn render(pdf_index: usize, err: impl std::fmt::Display) -> Self {
        Self::Render {
            pdf_index,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("invalid table of contents: {message}")]
    InvalidToc { message: String },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("observation store error while {context}: {source}")]
    Store {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("book resolution cancelled")]
    Cancelled,
}

impl MappingError {
    pub(crate) fn invalid_toc(message: impl Into<String>) -> Self {
        Self::InvalidToc {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub(crate) fn store(context: &'static str, source: rusqlite::Error) -> Self {
        Self::Store { context, source }
    }
}
