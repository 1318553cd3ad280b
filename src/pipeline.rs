//! The end-to-end job: document in, document result out.

use std::{collections::BTreeSet, sync::Arc};

use futures::{StreamExt as _, stream};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, timeout_at},
};

use crate::{
    aggregate::aggregate,
    async_utils::{panic_message, run_blocking},
    config::PipelineConfig,
    document::{Document, DocumentResult, DocumentStatus, Page, PageResult, PreprocessedPage},
    error::{ErrorCategory, IngestError, PageError, PipelineError},
    insights::Insights,
    normalize::{DocumentRenderer, Normalizer},
    preprocess::Preprocessor,
    prelude::*,
    recognize::{EnginePool, RecognitionInvoker},
};

/// Where a job is in its life.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Received,
    Normalizing,
    Processing { total: usize, done: usize },
    Aggregating,
    Completed { status: DocumentStatus },
    Failed { category: ErrorCategory },
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Runs documents through normalization, preprocessing, recognition and
/// aggregation. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    config: PipelineConfig,
    normalizer: Normalizer,
    preprocessor: Preprocessor,
    invoker: RecognitionInvoker,
}

impl Pipeline {
    /// Create a new pipeline. Fails if `config` is invalid.
    pub fn new(
        config: PipelineConfig,
        engines: EnginePool,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PipelineInner {
                normalizer: Normalizer::new(config.normalize.clone(), renderer),
                preprocessor: Preprocessor::new(config.preprocess.clone()),
                invoker: RecognitionInvoker::new(engines, config.recognize.clone()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Process `document` to completion.
    ///
    /// Dropping the returned future cancels the job, along with any engine
    /// or renderer processes it started.
    pub async fn run(&self, document: Document) -> Result<DocumentResult, PipelineError> {
        let (state, _) = watch::channel(JobState::Received);
        self.run_reporting(document, &state).await
    }

    /// Process `document` on a background task, with observable state.
    pub fn spawn(&self, document: Document) -> RunningJob {
        let job_id = document.job_id().to_owned();
        let (state_tx, state_rx) = watch::channel(JobState::Received);
        let state_tx = Arc::new(state_tx);
        let pipeline = self.clone();
        let task_state = state_tx.clone();
        let handle =
            tokio::spawn(async move { pipeline.run_reporting(document, &task_state).await });
        RunningJob {
            job_id,
            state_tx,
            state_rx,
            handle,
        }
    }

    #[instrument(level = "info", skip_all, fields(job_id = %document.job_id()))]
    async fn run_reporting(
        &self,
        document: Document,
        state: &watch::Sender<JobState>,
    ) -> Result<DocumentResult, PipelineError> {
        let result = self.run_inner(&document, state).await;
        match &result {
            Ok(result) => {
                info!(
                    pages = result.page_count,
                    status = ?result.status,
                    "job completed"
                );
                state.send_replace(JobState::Completed {
                    status: result.status,
                });
            }
            Err(err) => {
                warn!("job failed: {err}");
                state.send_replace(JobState::Failed {
                    category: err.category(),
                });
            }
        }
        result
    }

    async fn run_inner(
        &self,
        document: &Document,
        state: &watch::Sender<JobState>,
    ) -> Result<DocumentResult, PipelineError> {
        let inner = &self.inner;
        let job_timeout = inner.config.job_timeout();
        let deadline = Instant::now() + job_timeout;

        state.send_replace(JobState::Normalizing);
        let normalized = timeout_at(deadline, inner.normalizer.normalize(document))
            .await
            .map_err(|_| {
                IngestError::too_large(format!(
                    "normalization did not finish within the job timeout of {}ms",
                    inner.config.job_timeout_ms
                ))
            })??;

        let total = normalized.page_count();
        let format = normalized.format;
        debug!(total, format = format.mime_type(), "document normalized");
        state.send_replace(JobState::Processing { total, done: 0 });

        let mut page_stream = stream::iter(normalized.pages)
            .map(|page| async move {
                match page {
                    Ok(page) => self.process_page(page).await,
                    Err(fault) => {
                        warn!(page = fault.index, "page could not be rendered: {}", fault.message);
                        PageResult::failed(fault.index, PageError::RenderFailure {
                            message: fault.message,
                        })
                    }
                }
            })
            .buffer_unordered(inner.config.page_concurrency);

        let mut results = Vec::with_capacity(total);
        loop {
            match timeout_at(deadline, page_stream.next()).await {
                Ok(Some(result)) => {
                    results.push(result);
                    state.send_replace(JobState::Processing {
                        total,
                        done: results.len(),
                    });
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        finished = results.len(),
                        total, "job timeout reached, abandoning unfinished pages"
                    );
                    break;
                }
            }
        }
        // Drops any page work still in flight.
        drop(page_stream);
        fill_unfinished_pages(&mut results, total, inner.config.job_timeout_ms);

        state.send_replace(JobState::Aggregating);
        let mut result = aggregate(
            document.job_id(),
            results,
            &inner.config.page_boundary_marker,
            normalized.warnings,
        );
        result.kind = Some(format.kind());
        result.source_mime_type = Some(format.mime_type().to_owned());
        if inner.config.extract_insights {
            result.insights = Some(Insights::extract(&result.text));
        }
        Ok(result)
    }

    /// Preprocess and recognize one page. Never fails; problems end up in
    /// the [`PageResult`].
    #[instrument(level = "debug", skip_all, fields(page = page.index))]
    async fn process_page(&self, page: Page) -> PageResult {
        let preprocessor = self.inner.preprocessor.clone();
        let input = page.clone();
        let preprocessed =
            match run_blocking("preprocessing", move || Ok(preprocessor.preprocess(input)))
                .await
            {
                Ok(preprocessed) => preprocessed,
                Err(err) => {
                    warn!(page = page.index, "preprocessing failed, using original: {err:#}");
                    PreprocessedPage::passthrough(page, vec![])
                }
            };
        let timeout = self.inner.invoker.config().page_timeout();
        self.inner.invoker.recognize(&preprocessed, timeout).await
    }
}

/// Add a Timeout result for every page that didn't finish.
fn fill_unfinished_pages(results: &mut Vec<PageResult>, total: usize, job_timeout_ms: u64) {
    let finished = results.iter().map(|r| r.page_index).collect::<BTreeSet<_>>();
    for index in (0..total).filter(|i| !finished.contains(i)) {
        results.push(PageResult::failed(index, PageError::Timeout {
            timeout_ms: job_timeout_ms,
        }));
    }
}

/// A job running on a background task.
pub struct RunningJob {
    job_id: String,
    state_tx: Arc<watch::Sender<JobState>>,
    state_rx: watch::Receiver<JobState>,
    handle: JoinHandle<Result<DocumentResult, PipelineError>>,
}

impl RunningJob {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The current state.
    pub fn state(&self) -> JobState {
        self.state_rx.borrow().clone()
    }

    /// A receiver which sees every state change.
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state_rx.clone()
    }

    /// Stop the job. In-flight pages are dropped, which kills any external
    /// processes they started.
    pub fn cancel(&self) {
        self.handle.abort();
        self.state_tx.send_if_modified(|state| {
            if state.is_finished() {
                false
            } else {
                *state = JobState::Failed {
                    category: ErrorCategory::Cancelled,
                };
                true
            }
        });
    }

    /// Wait for the job to finish.
    pub async fn wait(self) -> Result<DocumentResult, PipelineError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => {
                self.state_tx.send_replace(JobState::Failed {
                    category: ErrorCategory::Cancelled,
                });
                Err(PipelineError::Cancelled)
            }
            Err(err) => {
                self.state_tx.send_replace(JobState::Failed {
                    category: ErrorCategory::Internal,
                });
                let msg = if err.is_panic() {
                    panic_message(err.into_panic().as_ref())
                } else {
                    err.to_string()
                };
                Err(PipelineError::Internal(msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant as StdInstant;

    use image::DynamicImage;
    use tokio::time::Duration;

    use crate::{
        config::RecognizeConfig,
        document::{DocumentKind, PageStatus},
        insights::DocumentType,
        testing::{MockEngine, MockPage, MockRenderer, png_bytes, text_like_image},
    };

    use super::*;

    const MINIMAL_PDF: &[u8] = b"%PDF-1.4\n1 0 obj\n<<>>\nendobj\ntrailer\n<<>>\n%%EOF\n";

    fn config() -> PipelineConfig {
        PipelineConfig {
            page_concurrency: 4,
            recognize: RecognizeConfig {
                page_timeout_ms: 5_000,
                ..RecognizeConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    fn pipeline(config: PipelineConfig, engine: MockEngine, renderer: MockRenderer) -> Pipeline {
        let pool = EnginePool::reentrant(Arc::new(engine), 8).unwrap();
        Pipeline::new(config, pool, Arc::new(renderer)).unwrap()
    }

    fn pages(count: usize) -> Vec<Option<DynamicImage>> {
        (0..count).map(|_| Some(text_like_image(64, 64))).collect()
    }

    fn pdf() -> Document {
        Document::new("job", MINIMAL_PDF, Some("application/pdf".to_owned()))
    }

    fn indices(result: &DocumentResult) -> Vec<usize> {
        result.pages.iter().map(|p| p.page_index).collect()
    }

    #[tokio::test]
    async fn single_image_has_one_page() {
        let png = png_bytes(&text_like_image(100, 60));
        let doc = Document::new("img", png, Some("image/png".to_owned()));
        let result = pipeline(config(), MockEngine::new(), MockRenderer::new(vec![]))
            .run(doc)
            .await
            .unwrap();
        assert_eq!(result.job_id, "img");
        assert_eq!(result.page_count, 1);
        assert_eq!(indices(&result), vec![0]);
        assert_eq!(result.status, DocumentStatus::Success);
        assert_eq!(result.text, "page 0");
        assert_eq!(result.kind, Some(DocumentKind::Image));
        assert_eq!(result.source_mime_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn pages_come_back_in_order() {
        // Early pages finish last.
        let engine = MockEngine::new()
            .with_page(0, MockPage::Delay(Duration::from_millis(60)))
            .with_page(1, MockPage::Delay(Duration::from_millis(30)));
        let result = pipeline(config(), engine, MockRenderer::new(pages(4)))
            .run(pdf())
            .await
            .unwrap();
        assert_eq!(indices(&result), vec![0, 1, 2, 3]);
        assert_eq!(result.kind, Some(DocumentKind::Paginated));
        assert_eq!(
            result.text,
            "page 0\n\x0C\npage 1\n\x0C\npage 2\n\x0C\npage 3"
        );
    }

    #[tokio::test]
    async fn every_page_is_accounted_for_despite_failures() {
        let engine = MockEngine::new()
            .with_page(1, MockPage::Fail)
            .with_page(3, MockPage::Fail);
        let mut rendered = pages(5);
        rendered[2] = None;
        let result = pipeline(config(), engine, MockRenderer::new(rendered))
            .run(pdf())
            .await
            .unwrap();
        assert_eq!(result.page_count, 5);
        assert_eq!(indices(&result), vec![0, 1, 2, 3, 4]);
        assert_eq!(result.status, DocumentStatus::Partial);
        assert!(matches!(
            result.pages[2].error,
            Some(PageError::RenderFailure { .. })
        ));
        assert!(matches!(
            result.pages[3].error,
            Some(PageError::EngineFailure { .. })
        ));
    }

    #[tokio::test]
    async fn all_pages_failing_still_completes() {
        let engine = MockEngine::new()
            .with_page(0, MockPage::Fail)
            .with_page(1, MockPage::Fail);
        let result = pipeline(config(), engine, MockRenderer::new(pages(2)))
            .run(pdf())
            .await
            .unwrap();
        assert_eq!(result.status, DocumentStatus::Failed);
        assert_eq!(result.text, "\n\x0C\n");
    }

    #[tokio::test]
    async fn slow_page_times_out_without_holding_up_the_rest() {
        let engine =
            MockEngine::new().with_page(1, MockPage::Delay(Duration::from_secs(60)));
        let config = PipelineConfig {
            recognize: RecognizeConfig {
                page_timeout_ms: 100,
                ..RecognizeConfig::default()
            },
            job_timeout_ms: 5_000,
            ..config()
        };
        let started = StdInstant::now();
        let result = pipeline(config, engine, MockRenderer::new(pages(3)))
            .run(pdf())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.status, DocumentStatus::Partial);
        assert_eq!(result.pages[0].status, PageStatus::Ok);
        assert_eq!(
            result.pages[1].error,
            Some(PageError::Timeout { timeout_ms: 100 })
        );
        assert_eq!(result.pages[2].status, PageStatus::Ok);
    }

    #[tokio::test]
    async fn job_ceiling_bounds_total_time() {
        let engine =
            MockEngine::new().with_page(2, MockPage::Delay(Duration::from_secs(60)));
        let config = PipelineConfig {
            recognize: RecognizeConfig {
                page_timeout_ms: 60_000,
                ..RecognizeConfig::default()
            },
            job_timeout_ms: 500,
            ..config()
        };
        let started = StdInstant::now();
        let result = pipeline(config, engine, MockRenderer::new(pages(3)))
            .run(pdf())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.page_count, 3);
        assert_eq!(result.status, DocumentStatus::Partial);
        assert_eq!(
            result.pages[2].error,
            Some(PageError::Timeout { timeout_ms: 500 })
        );
    }

    #[tokio::test]
    async fn slow_normalization_hits_the_job_ceiling() {
        let renderer = MockRenderer::new(pages(2)).with_render_delay(Duration::from_secs(60));
        let config = PipelineConfig {
            job_timeout_ms: 500,
            ..config()
        };
        let engine = MockEngine::new();
        let started = StdInstant::now();
        let job = pipeline(config, engine.clone(), renderer).spawn(pdf());
        let states = job.subscribe();
        let err = job.wait().await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            err,
            PipelineError::Ingest(IngestError::ResourceLimitExceeded { .. })
        ));
        assert_eq!(
            *states.borrow(),
            JobState::Failed {
                category: ErrorCategory::PayloadTooLarge
            }
        );
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn truncated_pdf_is_fatal() {
        let truncated = &MINIMAL_PDF[..MINIMAL_PDF.len() - 8];
        let doc = Document::new("bad", truncated, Some("application/pdf".to_owned()));
        let err = pipeline(config(), MockEngine::new(), MockRenderer::new(pages(2)))
            .run(doc)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Ingest(IngestError::CorruptInput { .. })
        ));
        assert_eq!(err.category().http_status(), 422);
    }

    #[tokio::test]
    async fn missing_renderer_is_a_service_problem() {
        let err = pipeline(config(), MockEngine::new(), MockRenderer::unavailable())
            .run(pdf())
            .await
            .unwrap_err();
        assert_eq!(err.category().http_status(), 503);
    }

    #[tokio::test]
    async fn page_concurrency_is_capped() {
        let engine = (0..8).fold(MockEngine::new(), |engine, i| {
            engine.with_page(i, MockPage::Delay(Duration::from_millis(20)))
        });
        let config = PipelineConfig {
            page_concurrency: 2,
            ..config()
        };
        let result = pipeline(config, engine.clone(), MockRenderer::new(pages(8)))
            .run(pdf())
            .await
            .unwrap();
        assert_eq!(result.status, DocumentStatus::Success);
        assert!(engine.peak_in_flight() <= 2);
    }

    #[tokio::test]
    async fn insights_are_attached_when_enabled() {
        let engine = MockEngine::new().with_page(
            0,
            MockPage::Text("Invoice\nTotal: $42.00".to_owned(), 0.9),
        );
        let config = PipelineConfig {
            extract_insights: true,
            ..config()
        };
        let png = png_bytes(&text_like_image(100, 60));
        let doc = Document::new("inv", png, None);
        let result = pipeline(config, engine, MockRenderer::new(vec![]))
            .run(doc)
            .await
            .unwrap();
        let insights = result.insights.unwrap();
        assert_eq!(insights.document_type, DocumentType::Invoice);
        assert_eq!(insights.total_amount, Some(42.0));
    }

    #[tokio::test]
    async fn spawned_job_reports_completion() {
        let job = pipeline(config(), MockEngine::new(), MockRenderer::new(pages(2)))
            .spawn(pdf());
        assert_eq!(job.job_id(), "job");
        let mut states = job.subscribe();
        let result = job.wait().await.unwrap();
        assert_eq!(result.page_count, 2);
        assert_eq!(
            *states.borrow_and_update(),
            JobState::Completed {
                status: DocumentStatus::Success
            }
        );
    }

    #[tokio::test]
    async fn cancelled_job_fails_as_cancelled() {
        let engine =
            MockEngine::new().with_page(0, MockPage::Delay(Duration::from_secs(60)));
        let job = pipeline(config(), engine.clone(), MockRenderer::new(pages(1))).spawn(pdf());
        // Wait until the engine is actually working on the page.
        while engine.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        job.cancel();
        assert_eq!(
            job.state(),
            JobState::Failed {
                category: ErrorCategory::Cancelled
            }
        );
        let err = job.wait().await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(err.category().http_status(), 499);
        // Aborting the task dropped the engine call.
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.calls(), 1);
    }
}
