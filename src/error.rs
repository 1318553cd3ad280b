//! Error types that cross the pipeline boundary.
//!
//! Internally, most of this crate uses [`anyhow::Result`]. But the caller of
//! the pipeline needs to tell a bad upload from a system fault, and needs to
//! report per-page problems inside an otherwise successful result, so those
//! errors get real types here.

use schemars::JsonSchema;
use thiserror::Error;

use crate::prelude::*;

/// A job-fatal error found while turning a document into pages.
#[derive(Clone, Debug, Error, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestError {
    /// We don't know how to read this kind of file.
    #[error("unsupported format: {detail}")]
    UnsupportedFormat { detail: String },

    /// The file claims to be something we support, but we can't parse it.
    #[error("corrupt input: {detail}")]
    CorruptInput { detail: String },

    /// The file is too big (too many pages, or too many pixels) to process.
    #[error("resource limit exceeded: {detail}")]
    ResourceLimitExceeded { detail: String },

    /// The tool we use to render paginated documents isn't available. This is
    /// our fault, not the uploader's.
    #[error("renderer unavailable: {detail}")]
    RendererUnavailable { detail: String },
}

impl IngestError {
    pub(crate) fn unsupported(detail: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            detail: detail.into(),
        }
    }

    pub(crate) fn corrupt(detail: impl Into<String>) -> Self {
        Self::CorruptInput {
            detail: detail.into(),
        }
    }

    pub(crate) fn too_large(detail: impl Into<String>) -> Self {
        Self::ResourceLimitExceeded {
            detail: detail.into(),
        }
    }

    /// Which broad category does this error fall into?
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnsupportedFormat { .. } => ErrorCategory::UnsupportedMediaType,
            Self::CorruptInput { .. } => ErrorCategory::UnprocessableInput,
            Self::ResourceLimitExceeded { .. } => ErrorCategory::PayloadTooLarge,
            Self::RendererUnavailable { .. } => ErrorCategory::ServiceUnavailable,
        }
    }
}

/// A problem with a single page. These never abort the job.
#[derive(Clone, Debug, Deserialize, Error, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageError {
    /// Recognition didn't finish in time.
    #[error("recognition timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The OCR engine reported an error.
    #[error("OCR engine failed: {message}")]
    EngineFailure { message: String },

    /// The page could not be rendered from the source document.
    #[error("page could not be rendered: {message}")]
    RenderFailure { message: String },

    /// The text was recognized, but the engine isn't confident about it.
    #[error("confidence {confidence:.2} is below threshold {threshold:.2}")]
    LowConfidence { confidence: f32, threshold: f32 },
}

/// Errors returned by [`crate::pipeline::Pipeline`].
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The document could not be turned into pages.
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// The job was cancelled before it finished.
    #[error("job was cancelled")]
    Cancelled,

    /// Something went wrong inside the pipeline itself.
    #[error("internal pipeline error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Which broad category does this error fall into?
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Ingest(err) => err.category(),
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}

/// Broad error categories, for callers who need to report errors over HTTP.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    UnsupportedMediaType,
    UnprocessableInput,
    PayloadTooLarge,
    ServiceUnavailable,
    Cancelled,
    Internal,
}

impl ErrorCategory {
    /// The HTTP status code which best describes this category.
    pub fn http_status(self) -> u16 {
        match self {
            Self::UnsupportedMediaType => 415,
            Self::UnprocessableInput => 422,
            Self::PayloadTooLarge => 413,
            Self::ServiceUnavailable => 503,
            // Not standard, but widely used for "client went away".
            Self::Cancelled => 499,
            Self::Internal => 500,
        }
    }

    /// Was this caused by the input, rather than by us?
    pub fn is_client_error(self) -> bool {
        (400..500).contains(&self.http_status())
    }
}
