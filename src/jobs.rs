//! Batch job records: what the `ocr` command reads and writes.
//!
//! One corrupt file must never abort a whole batch, so every input record
//! produces exactly one output record, even when the job fails.

use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt as _;
use schemars::JsonSchema;

use crate::{
    async_utils::BoxedStream,
    document::{Document, DocumentResult, DocumentStatus},
    error::{ErrorCategory, PipelineError},
    pipeline::Pipeline,
    prelude::*,
    ui::Ui,
};

/// An input record describing one document to process.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct JobRecord {
    /// The unique ID of the job.
    pub id: Value,

    /// Path to the image or PDF.
    pub path: PathBuf,

    /// The MIME type the submitter claims the file has. We check it against
    /// the file's contents.
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl JobRecord {
    /// Convert from a JSON value.
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value::<Self>(value).context("failed to deserialize job record")
    }

    /// The declared MIME type, or a guess based on the file extension.
    pub fn declared_mime(&self) -> Option<String> {
        self.mime_type
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_owned)
            .or_else(|| {
                mime_guess::from_path(&self.path)
                    .first()
                    .map(|mime| mime.essence_str().to_owned())
            })
    }

    /// Our ID as a plain string, for use as a pipeline job ID.
    pub fn id_string(&self) -> String {
        match &self.id {
            Value::String(id) => id.clone(),
            other => other.to_string(),
        }
    }
}

/// Output status of a job.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Every page was recognized.
    Ok,

    /// Some pages failed.
    Incomplete,

    /// The document could not be processed at all, or every page failed.
    Failed,
}

/// Why a job failed outright.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct JobError {
    pub category: ErrorCategory,
    pub http_status: u16,
    pub message: String,
}

impl JobError {
    fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            http_status: category.http_status(),
            message: message.into(),
        }
    }
}

impl From<&PipelineError> for JobError {
    fn from(err: &PipelineError) -> Self {
        Self::new(err.category(), err.to_string())
    }
}

/// An output record describing one processed document.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct JobOutput {
    /// The ID of the input record.
    pub id: Value,

    /// The input path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    pub status: JobStatus,

    /// Human-readable problems, including non-fatal ones.
    pub errors: Vec<String>,

    /// The pipeline's result, if the document could be read at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<DocumentResult>,

    /// Why the job failed, if it failed outright.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl JobOutput {
    /// A job that never got as far as producing a result.
    pub fn new_failed(id: Value, path: Option<PathBuf>, error: JobError) -> Self {
        Self {
            id,
            path,
            status: JobStatus::Failed,
            errors: vec![error.message.clone()],
            result: None,
            error: Some(error),
        }
    }

    /// Summarize a finished pipeline run.
    pub fn from_result(id: Value, path: PathBuf, result: DocumentResult) -> Self {
        let status = match result.status {
            DocumentStatus::Success => JobStatus::Ok,
            DocumentStatus::Partial => JobStatus::Incomplete,
            DocumentStatus::Failed => JobStatus::Failed,
        };
        let mut errors = result.warnings.clone();
        errors.extend(result.pages.iter().filter_map(|page| {
            let err = page.error.as_ref()?;
            Some(format!("page {}: {err}", page.page_index + 1))
        }));
        Self {
            id,
            path: Some(path),
            status,
            errors,
            result: Some(result),
            error: None,
        }
    }
}

/// Run one input record through `pipeline`. Never fails: problems are
/// reported in the output record.
#[instrument(level = "debug", skip_all)]
pub async fn process_record(pipeline: &Pipeline, value: Value) -> JobOutput {
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let record = match JobRecord::from_json(value) {
        Ok(record) => record,
        Err(err) => {
            warn!("bad job record: {err:#}");
            let error = JobError::new(ErrorCategory::UnprocessableInput, format!("{err:#}"));
            return JobOutput::new_failed(id, None, error);
        }
    };

    let document =
        match Document::from_path(record.id_string(), &record.path, record.declared_mime())
            .await
        {
            Ok(document) => document,
            Err(err) => {
                warn!(path = %record.path.display(), "could not read document: {err:#}");
                let error =
                    JobError::new(ErrorCategory::UnprocessableInput, format!("{err:#}"));
                return JobOutput::new_failed(record.id, Some(record.path), error);
            }
        };

    match pipeline.run(document).await {
        Ok(result) => JobOutput::from_result(record.id, record.path, result),
        Err(err) => JobOutput::new_failed(record.id, Some(record.path), JobError::from(&err)),
    }
}

/// Tallies of what happened to a batch.
#[derive(Clone, Debug, Default)]
pub struct OutputCounters {
    /// How many records did we process?
    pub total_record_count: usize,

    /// How many records did not come back `ok`?
    pub failure_count: usize,

    /// How many non-fatal errors did we see in `ok` records?
    pub non_fatal_error_count: usize,

    /// How many pages did we see across all documents?
    pub page_count: usize,
}

impl OutputCounters {
    /// Count the outputs of `stream` as they go past.
    pub fn wrap_stream(
        stream: BoxedStream<Result<JobOutput>>,
    ) -> (BoxedStream<Result<JobOutput>>, Arc<Mutex<OutputCounters>>) {
        let counters = Arc::new(Mutex::new(Self::default()));
        let counters_clone = counters.clone();
        let stream = stream
            .map(move |output| -> Result<JobOutput> {
                let output = output?;
                counters_clone.update(&output);
                Ok(output)
            })
            .boxed();
        (stream, counters)
    }
}

/// Methods on the shared counters.
pub trait OutputCounterExt {
    /// Count one output record.
    fn update(&self, output: &JobOutput);

    /// Report totals to the user, and fail if too many records failed.
    fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<OutputCounters>;
}

impl OutputCounterExt for Mutex<OutputCounters> {
    fn update(&self, output: &JobOutput) {
        let mut counters = self.lock().unwrap_or_else(PoisonError::into_inner);
        counters.total_record_count += 1;
        if output.status != JobStatus::Ok {
            counters.failure_count += 1;
        } else {
            counters.non_fatal_error_count += output.errors.len();
        }
        if let Some(result) = &output.result {
            counters.page_count += result.page_count;
        }
    }

    fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<OutputCounters> {
        let counters = self.lock().unwrap_or_else(PoisonError::into_inner).clone();
        ui.display_message(
            "📄",
            &format!(
                "{} pages in {} documents",
                counters.page_count, counters.total_record_count
            ),
        );
        let failure_rate = if counters.total_record_count == 0 {
            0.0
        } else {
            counters.failure_count as f32 / counters.total_record_count as f32
        };
        if failure_rate > allowed_failure_rate {
            return Err(anyhow!(
                "{}/{} ({:.2}%) of documents were not fully processed, but only {:.2}% were allowed",
                counters.failure_count,
                counters.total_record_count,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ));
        }
        if counters.non_fatal_error_count > 0 {
            ui.display_message(
                "⚠️",
                &format!(
                    "{} non-fatal errors encountered",
                    counters.non_fatal_error_count
                ),
            );
        }
        if counters.failure_count > 0 {
            ui.display_message(
                "❌",
                &format!(
                    "{} documents could not be fully processed",
                    counters.failure_count
                ),
            );
        }
        Ok(counters)
    }
}
