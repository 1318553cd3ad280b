//! Drive an OCR engine over one page at a time.
//!
//! The engine itself is an external capability. We only lease it, enforce a
//! hard deadline, translate its failures into [`PageError`]s and turn its
//! regions into a page-level confidence.

use std::{sync::Arc, time::Instant as StdInstant};

use image::DynamicImage;
use thiserror::Error;
use tokio::time::{Duration, Instant};

use crate::{
    config::RecognizeConfig,
    document::{PageResult, PageStatus, PreprocessedPage},
    error::PageError,
    prelude::*,
};

mod blocking;
mod pool;
mod tesseract;

pub use self::{
    blocking::{BlockingEngine, RecognizeRaster},
    pool::{EngineLease, EnginePool},
    tesseract::TesseractEngine,
};

/// Everything an engine needs to recognize one raster.
#[derive(Clone, Debug)]
pub struct RecognitionRequest {
    pub page_index: usize,
    pub image: Arc<DynamicImage>,
    /// Engine-specific language hint, such as `eng`.
    pub language: String,
    pub dpi: Option<u32>,
}

/// A chunk of recognized text, usually a line.
#[derive(Clone, Debug, PartialEq)]
pub struct TextRegion {
    pub text: String,
    /// Between 0 and 1.
    pub confidence: f32,
}

impl TextRegion {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// An OCR engine.
///
/// Implementations should be cancel-safe: if the returned future is dropped,
/// any work it started (such as a child process) should stop.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    async fn recognize_raster(&self, request: &RecognitionRequest) -> Result<Vec<TextRegion>>;
}

/// Returned by an engine that can't run at all, such as when its binary is
/// missing. Retrying the page won't help.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct EngineUnavailable(pub String);

/// A failed attempt, and whether another attempt might succeed.
struct AttemptFailure {
    error: PageError,
    retryable: bool,
}

impl From<PageError> for AttemptFailure {
    fn from(error: PageError) -> Self {
        Self {
            error,
            retryable: false,
        }
    }
}

/// Runs recognition for single pages.
#[derive(Clone)]
pub struct RecognitionInvoker {
    pool: EnginePool,
    config: RecognizeConfig,
}

impl RecognitionInvoker {
    pub fn new(pool: EnginePool, config: RecognizeConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &RecognizeConfig {
        &self.config
    }

    /// Recognize `page`, giving up after `timeout`.
    ///
    /// If the engine fails on the preprocessed raster, and preprocessing
    /// actually changed something, we try once more on the original raster
    /// within the same deadline.
    #[instrument(level = "debug", skip_all, fields(page = page.index()))]
    pub async fn recognize(&self, page: &PreprocessedPage, timeout: Duration) -> PageResult {
        let started = StdInstant::now();
        let deadline = Instant::now() + timeout;

        let mut used_original_raster = false;
        let mut outcome = self.attempt(page, page.image.clone(), deadline, timeout).await;
        if let Err(AttemptFailure {
            error: PageError::EngineFailure { message },
            retryable: true,
        }) = &outcome
            && self.config.retry_with_original
            && page.any_applied()
        {
            warn!(
                page = page.index(),
                "engine failed on preprocessed page, retrying with original: {message}"
            );
            used_original_raster = true;
            outcome = self
                .attempt(page, page.original.image.clone(), deadline, timeout)
                .await;
        }

        let mut result = match outcome.map_err(|failure| failure.error) {
            Ok(regions) => {
                page_result_from_regions(page.index(), &regions, self.config.low_confidence_threshold)
            }
            Err(err) => {
                warn!(page = page.index(), "recognition failed: {err}");
                PageResult::failed(page.index(), err)
            }
        };
        result.transforms = page.transforms.clone();
        result.used_original_raster = used_original_raster;
        result.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        result
    }

    /// One call to the engine, bounded by `deadline`.
    async fn attempt(
        &self,
        page: &PreprocessedPage,
        image: Arc<DynamicImage>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Vec<TextRegion>, AttemptFailure> {
        let request = RecognitionRequest {
            page_index: page.index(),
            image,
            language: self.config.language.clone(),
            dpi: page.dpi(),
        };
        let timed_out = || PageError::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };

        let lease = tokio::time::timeout_at(deadline, self.pool.acquire())
            .await
            .map_err(|_| timed_out())?
            .map_err(|err| PageError::EngineFailure {
                message: format!("{err:#}"),
            })?;
        let regions = tokio::time::timeout_at(deadline, lease.recognize_raster(&request))
            .await
            .map_err(|_| timed_out())?
            .map_err(|err| AttemptFailure {
                retryable: err.downcast_ref::<EngineUnavailable>().is_none(),
                error: PageError::EngineFailure {
                    message: format!("{err:#}"),
                },
            })?;
        Ok(regions)
    }
}

/// Combine an engine's regions into a page result.
pub fn page_result_from_regions(
    page_index: usize,
    regions: &[TextRegion],
    low_confidence_threshold: f32,
) -> PageResult {
    let text = regions
        .iter()
        .map(|r| r.text.trim_end())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let confidence = page_confidence(regions);
    let (status, error) = if confidence < low_confidence_threshold {
        (
            PageStatus::LowConfidence,
            Some(PageError::LowConfidence {
                confidence,
                threshold: low_confidence_threshold,
            }),
        )
    } else {
        (PageStatus::Ok, None)
    };
    PageResult {
        page_index,
        text,
        confidence,
        status,
        error,
        transforms: vec![],
        used_original_raster: false,
        elapsed_ms: 0,
    }
}

/// Mean region confidence, weighted by character count. Falls back to a
/// simple mean when every region is empty, and to 0 with no regions at all.
pub fn page_confidence(regions: &[TextRegion]) -> f32 {
    if regions.is_empty() {
        return 0.0;
    }
    let clamp = |c: f32| if c.is_nan() { 0.0 } else { c.clamp(0.0, 1.0) };
    let (weighted, total_chars) = regions.iter().fold((0.0f64, 0usize), |(sum, n), r| {
        let chars = r.text.trim().chars().count();
        (sum + f64::from(clamp(r.confidence)) * chars as f64, n + chars)
    });
    if total_chars > 0 {
        (weighted / total_chars as f64) as f32
    } else {
        let sum: f32 = regions.iter().map(|r| clamp(r.confidence)).sum();
        sum / regions.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        document::{Page, TransformOutcome, TransformRecord, Transform},
        testing::{MockEngine, MockPage, text_like_image},
    };

    use super::*;

    fn invoker(engine: MockEngine, config: RecognizeConfig) -> RecognitionInvoker {
        let pool = EnginePool::reentrant(Arc::new(engine), 4).unwrap();
        RecognitionInvoker::new(pool, config)
    }

    fn preprocessed(index: usize, transformed: bool) -> PreprocessedPage {
        let page = Page::new(index, text_like_image(32, 32), None);
        let outcome = if transformed {
            TransformOutcome::Applied { detail: None }
        } else {
            TransformOutcome::Skipped {
                reason: "disabled".to_owned(),
            }
        };
        let mut pre = PreprocessedPage::passthrough(
            page,
            vec![TransformRecord {
                transform: Transform::Binarize,
                outcome,
            }],
        );
        if transformed {
            pre.image = Arc::new(text_like_image(32, 32));
        }
        pre
    }

    #[test]
    fn confidence_is_length_weighted() {
        let regions = [TextRegion::new("abcd", 1.0), TextRegion::new("ef", 0.4)];
        assert!((page_confidence(&regions) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn confidence_of_empty_regions_is_simple_mean() {
        let regions = [TextRegion::new("", 0.2), TextRegion::new("  ", 0.6)];
        assert!((page_confidence(&regions) - 0.4).abs() < 1e-6);
        assert_eq!(page_confidence(&[]), 0.0);
    }

    #[test]
    fn out_of_range_confidences_are_clamped() {
        let regions = [TextRegion::new("a", 7.0), TextRegion::new("b", f32::NAN)];
        assert!((page_confidence(&regions) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn low_confidence_keeps_text() {
        let result =
            page_result_from_regions(0, &[TextRegion::new("blurry", 0.3)], 0.6);
        assert_eq!(result.status, PageStatus::LowConfidence);
        assert_eq!(result.text, "blurry");
        assert!(matches!(result.error, Some(PageError::LowConfidence { .. })));
    }

    #[test]
    fn blank_page_is_low_confidence() {
        let result = page_result_from_regions(0, &[], 0.6);
        assert_eq!(result.status, PageStatus::LowConfidence);
        assert_eq!(result.text, "");
    }

    #[tokio::test]
    async fn slow_page_times_out() {
        let engine = MockEngine::new().with_page(0, MockPage::Delay(Duration::from_secs(30)));
        let invoker = invoker(engine, RecognizeConfig::default());
        let started = StdInstant::now();
        let result = invoker
            .recognize(&preprocessed(0, false), Duration::from_millis(50))
            .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.status, PageStatus::Failed);
        assert_eq!(result.error, Some(PageError::Timeout { timeout_ms: 50 }));
    }

    #[tokio::test]
    async fn engine_failure_retries_with_original_raster() {
        let engine = MockEngine::new().with_page(0, MockPage::FailOnce);
        let invoker = invoker(engine.clone(), RecognizeConfig::default());
        let result = invoker
            .recognize(&preprocessed(0, true), Duration::from_secs(5))
            .await;
        assert_eq!(result.status, PageStatus::Ok);
        assert!(result.used_original_raster);
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test]
    async fn no_retry_when_nothing_was_applied() {
        let engine = MockEngine::new().with_page(0, MockPage::Fail);
        let invoker = invoker(engine.clone(), RecognizeConfig::default());
        let result = invoker
            .recognize(&preprocessed(0, false), Duration::from_secs(5))
            .await;
        assert_eq!(result.status, PageStatus::Failed);
        assert!(matches!(result.error, Some(PageError::EngineFailure { .. })));
        assert!(!result.used_original_raster);
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn unavailable_engine_is_not_retried() {
        let engine = MockEngine::new().with_page(0, MockPage::Unavailable);
        let invoker = invoker(engine.clone(), RecognizeConfig::default());
        let result = invoker
            .recognize(&preprocessed(0, true), Duration::from_secs(5))
            .await;
        assert_eq!(result.status, PageStatus::Failed);
        assert!(matches!(result.error, Some(PageError::EngineFailure { .. })));
        assert!(!result.used_original_raster);
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn retry_can_be_disabled() {
        let engine = MockEngine::new().with_page(0, MockPage::FailOnce);
        let config = RecognizeConfig {
            retry_with_original: false,
            ..RecognizeConfig::default()
        };
        let invoker = invoker(engine.clone(), config);
        let result = invoker
            .recognize(&preprocessed(0, true), Duration::from_secs(5))
            .await;
        assert_eq!(result.status, PageStatus::Failed);
        assert_eq!(engine.calls(), 1);
    }
}
