//! The values that flow through the pipeline.
//!
//! A [`Document`] goes in, the normalizer turns it into [`Page`]s, each page
//! becomes a [`PreprocessedPage`] and then a [`PageResult`], and the results
//! are gathered into one [`DocumentResult`]. Every stage produces a new value
//! rather than mutating the previous one.

use std::sync::Arc;

use image::DynamicImage;
use schemars::JsonSchema;

use crate::{error::PageError, insights::Insights, prelude::*};

/// Is this a single picture, or something with pages?
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Image,
    Paginated,
}

/// A submitted document. Immutable once created.
#[derive(Clone, Debug)]
pub struct Document {
    job_id: String,
    bytes: Arc<[u8]>,
    declared_mime: Option<String>,
}

impl Document {
    /// Create a new document. `declared_mime` is whatever the submitter told
    /// us, and may be wrong.
    pub fn new(
        job_id: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
        declared_mime: Option<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            bytes: bytes.into(),
            declared_mime: declared_mime.filter(|m| !m.trim().is_empty()),
        }
    }

    /// Create a new document with a random job ID.
    pub fn with_generated_id(
        bytes: impl Into<Arc<[u8]>>,
        declared_mime: Option<String>,
    ) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), bytes, declared_mime)
    }

    /// Read a document from disk.
    pub async fn from_path(
        job_id: impl Into<String>,
        path: &Path,
        declared_mime: Option<String>,
    ) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {:?}", path.display()))?;
        Ok(Self::new(job_id, bytes, declared_mime))
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// A cheap, shareable handle to our bytes.
    pub fn shared_bytes(&self) -> Arc<[u8]> {
        self.bytes.clone()
    }

    pub fn declared_mime(&self) -> Option<&str> {
        self.declared_mime.as_deref()
    }
}

/// One rasterized page. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Page {
    /// 0-based position in the source document.
    pub index: usize,

    /// The pixels.
    pub image: Arc<DynamicImage>,

    /// Source resolution, if known.
    pub dpi: Option<u32>,
}

impl Page {
    pub fn new(index: usize, image: DynamicImage, dpi: Option<u32>) -> Self {
        Self {
            index,
            image: Arc::new(image),
            dpi,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Preprocessing steps, in the order they run.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Grayscale,
    Binarize,
    Deskew,
    Denoise,
}

/// What happened when we tried to run a [`Transform`].
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransformOutcome {
    Applied {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Skipped {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

/// One entry in a page's preprocessing log.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct TransformRecord {
    pub transform: Transform,
    #[serde(flatten)]
    pub outcome: TransformOutcome,
}

impl TransformRecord {
    pub fn was_applied(&self) -> bool {
        matches!(self.outcome, TransformOutcome::Applied { .. })
    }
}

/// A page that is ready for recognition.
#[derive(Clone, Debug)]
pub struct PreprocessedPage {
    /// The transformed pixels.
    pub image: Arc<DynamicImage>,

    /// The page we started from, kept so that recognition can retry from it.
    pub original: Page,

    /// What we did, in order.
    pub transforms: Vec<TransformRecord>,
}

impl PreprocessedPage {
    /// Wrap a page without changing it.
    pub fn passthrough(page: Page, transforms: Vec<TransformRecord>) -> Self {
        Self {
            image: page.image.clone(),
            original: page,
            transforms,
        }
    }

    pub fn index(&self) -> usize {
        self.original.index
    }

    pub fn dpi(&self) -> Option<u32> {
        self.original.dpi
    }

    /// Did any transform actually change the pixels?
    pub fn any_applied(&self) -> bool {
        self.transforms.iter().any(TransformRecord::was_applied)
    }
}

/// Status of a single page.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Ok,
    LowConfidence,
    Failed,
}

/// Recognition output for one page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PageResult {
    pub page_index: usize,

    /// Extracted text. Empty for failed pages.
    pub text: String,

    /// Between 0 and 1.
    pub confidence: f32,

    pub status: PageStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PageError>,

    /// Preprocessing log.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<TransformRecord>,

    /// Did we fall back to the unprocessed raster?
    #[serde(default)]
    pub used_original_raster: bool,

    /// Time spent on this page, in milliseconds.
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl PageResult {
    /// A failed page with no text.
    pub fn failed(page_index: usize, error: PageError) -> Self {
        Self {
            page_index,
            text: String::new(),
            confidence: 0.0,
            status: PageStatus::Failed,
            error: Some(error),
            transforms: vec![],
            used_original_raster: false,
            elapsed_ms: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == PageStatus::Failed
    }
}

/// Overall status of a document.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// No page failed.
    Success,
    /// Some pages failed, some didn't.
    Partial,
    /// Every page failed.
    Failed,
}

/// The result of a job.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct DocumentResult {
    pub job_id: String,

    /// Always equal to `pages.len()`.
    pub page_count: usize,

    pub status: DocumentStatus,

    /// What the document turned out to be, once its contents were checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<DocumentKind>,

    /// The detected MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_mime_type: Option<String>,

    /// One entry per page, sorted by page index.
    pub pages: Vec<PageResult>,

    /// All page texts, joined with the page-boundary marker.
    pub text: String,

    /// Non-fatal problems noticed along the way.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights: Option<Insights>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_declared_mime_is_ignored() {
        let doc = Document::new("job", vec![1u8, 2, 3], Some(" ".to_owned()));
        assert_eq!(doc.declared_mime(), None);
        assert_eq!(doc.bytes(), &[1, 2, 3]);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = Document::with_generated_id(Vec::<u8>::new(), None);
        let b = Document::with_generated_id(Vec::<u8>::new(), None);
        assert_ne!(a.job_id(), b.job_id());
    }

    #[test]
    fn transform_records_serialize_flat() {
        let record = TransformRecord {
            transform: Transform::Deskew,
            outcome: TransformOutcome::Skipped {
                reason: "angle below minimum".to_owned(),
            },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "transform": "deskew",
                "outcome": "skipped",
                "reason": "angle below minimum",
            })
        );
    }

    #[test]
    fn failed_page_has_no_text() {
        let result = PageResult::failed(3, PageError::Timeout { timeout_ms: 5 });
        assert!(result.is_failed());
        assert!(result.text.is_empty());
        assert_eq!(result.confidence, 0.0);
    }
}
