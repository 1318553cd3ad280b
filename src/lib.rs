//! Turn scanned images and PDFs into text, one page at a time.
//!
//! A [`Document`] is normalized into raster pages, each page is cleaned up
//! and handed to an [`OcrEngine`], and the page results are merged into a
//! [`DocumentResult`]. Pages are processed concurrently, each under its own
//! timeout, and a page that fails still shows up in the result.
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! use std::sync::Arc;
//!
//! use pagescribe::{
//!     Document, EnginePool, Pipeline, PipelineConfig, PopplerRenderer, TesseractEngine,
//! };
//!
//! let config = PipelineConfig::default();
//! let engines = EnginePool::reentrant(
//!     Arc::new(TesseractEngine::new()),
//!     config.recognize.engine_instances,
//! )?;
//! let pipeline = Pipeline::new(config, engines, Arc::new(PopplerRenderer))?;
//! let document = Document::from_path("job-1", "scan.pdf".as_ref(), None).await?;
//! let result = pipeline.run(document).await?;
//! println!("{}", result.text);
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod async_utils;
pub mod cmd;
pub mod config;
mod cpu_limit;
pub mod document;
pub mod error;
pub mod insights;
pub mod jobs;
pub mod normalize;
pub mod pipeline;
mod prelude;
pub mod preprocess;
pub mod recognize;
#[cfg(test)]
mod testing;
pub mod ui;

pub use self::{
    config::PipelineConfig,
    document::{Document, DocumentKind, DocumentResult, DocumentStatus, PageResult, PageStatus},
    error::{ErrorCategory, IngestError, PageError, PipelineError},
    normalize::{DocumentRenderer, PopplerRenderer},
    pipeline::{JobState, Pipeline, RunningJob},
    recognize::{
        BlockingEngine, EnginePool, EngineUnavailable, OcrEngine, RecognizeRaster, TesseractEngine,
    },
};
