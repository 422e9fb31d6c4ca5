//! Error taxonomy for the intake pipeline.
//!
//! Every stage raises its own variant. The coordinator logs the stage
//! error and hands the caller a single [`PipelineError::Processing`];
//! only [`PipelineError::Input`] is surfaced as-is, since it describes
//! the caller's own payload.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or unusable source reference in the inbound payload.
    #[error("invalid input: {0}")]
    Input(String),

    /// Network failure, idle timeout or size ceiling while downloading.
    #[error("fetch failed for '{url}': {reason}")]
    Fetch { url: String, reason: String },

    /// Downloaded bytes carry no supported signature.
    #[error("unsupported file format: {0}")]
    Format(String),

    /// Upload to durable storage failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Recognition call failure, missing job results or malformed output.
    #[error("OCR failed: {0}")]
    Ocr(String),

    /// Generic failure reported to the caller once a stage has failed.
    #[error("error processing the document")]
    Processing,
}

impl PipelineError {
    pub(crate) fn fetch(url: &str, reason: impl std::fmt::Display) -> Self {
        Self::Fetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short stage label used in logs.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Input(_) => "input",
            Self::Fetch { .. } => "fetch",
            Self::Format(_) => "format",
            Self::Publish(_) => "publish",
            Self::Ocr(_) => "ocr",
            Self::Processing => "processing",
        }
    }
}

/// Render an `anyhow` error with its whole cause chain on one line.
pub(crate) fn chain(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}
