//! The `ocr` subcommand.

use std::sync::Arc;

use clap::Args;
use futures::StreamExt as _;

use crate::{
    async_utils::io::{count_records, read_records, write_jsonl},
    config::PipelineConfig,
    jobs::{OutputCounterExt as _, OutputCounters, process_record},
    normalize::PopplerRenderer,
    pipeline::Pipeline,
    prelude::*,
    recognize::{EnginePool, TesseractEngine},
    ui::{ProgressConfig, Ui},
};

use super::StreamOpts;

/// Command-line overrides for [`PipelineConfig`]. Anything not given here
/// comes from `--config`, or from the defaults.
#[derive(Debug, Clone, Default, Args)]
pub struct PipelineOpts {
    /// Resolution for rendering PDF pages.
    #[clap(long)]
    pub dpi: Option<u32>,

    /// Reject documents with more pages than this.
    #[clap(long)]
    pub max_pages: Option<usize>,

    /// OCR language, in the engine's own notation (for tesseract, `eng`,
    /// `deu`, `eng+fra`, ...).
    #[clap(short = 'l', long)]
    pub language: Option<String>,

    /// Give up on a single page after this many milliseconds.
    #[clap(long)]
    pub page_timeout_ms: Option<u64>,

    /// Give up on a whole document after this many milliseconds.
    #[clap(long)]
    pub job_timeout_ms: Option<u64>,

    /// Pages of one document to process at once.
    #[clap(long)]
    pub page_concurrency: Option<usize>,

    /// How many OCR processes may run at once.
    #[clap(long)]
    pub engine_instances: Option<usize>,

    /// Pages below this confidence are reported as low confidence.
    #[clap(long)]
    pub low_confidence_threshold: Option<f32>,

    /// Skip all preprocessing.
    #[clap(long)]
    pub no_preprocess: bool,

    /// Extract invoice-style insights from each document.
    #[clap(long)]
    pub insights: bool,
}

impl PipelineOpts {
    /// Override fields in `config`.
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(dpi) = self.dpi {
            config.normalize.target_dpi = dpi;
        }
        if let Some(max_pages) = self.max_pages {
            config.normalize.max_pages = max_pages;
        }
        if let Some(language) = &self.language {
            config.recognize.language = language.clone();
        }
        if let Some(ms) = self.page_timeout_ms {
            config.recognize.page_timeout_ms = ms;
        }
        if let Some(ms) = self.job_timeout_ms {
            config.job_timeout_ms = ms;
        }
        if let Some(n) = self.page_concurrency {
            config.page_concurrency = n;
        }
        if let Some(n) = self.engine_instances {
            config.recognize.engine_instances = n;
        }
        if let Some(threshold) = self.low_confidence_threshold {
            config.recognize.low_confidence_threshold = threshold;
        }
        if self.no_preprocess {
            config.preprocess = crate::config::PreprocessConfig::disabled();
        }
        if self.insights {
            config.extract_insights = true;
        }
    }
}

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Input JSONL or CSV file, with `id` and `path` fields and an optional
    /// `mime_type`. Defaults to standard input.
    pub input_path: Option<PathBuf>,

    /// Output JSONL file. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// TOML pipeline configuration.
    #[clap(short = 'c', long = "config")]
    pub config_path: Option<PathBuf>,

    /// The tesseract binary to run.
    #[clap(long, default_value = "tesseract")]
    pub tesseract: String,

    #[clap(flatten)]
    pub stream_opts: StreamOpts,

    #[clap(flatten)]
    pub pipeline_opts: PipelineOpts,
}

/// Build our configuration from the defaults, the config file and the
/// command line.
pub async fn load_config(opts: &OcrOpts) -> Result<PipelineConfig> {
    let mut config = match &opts.config_path {
        Some(path) => PipelineConfig::from_toml_file(path).await?,
        None => PipelineConfig::default(),
    };
    opts.pipeline_opts.apply(&mut config);
    config.validate().context("invalid configuration")?;
    debug!(?config, "loaded configuration");
    Ok(config)
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<OutputCounters> {
    let config = load_config(opts).await?;
    let engines = EnginePool::reentrant(
        Arc::new(TesseractEngine::with_program(&opts.tesseract)),
        config.recognize.engine_instances,
    )?;
    let pipeline = Pipeline::new(config, engines, Arc::new(PopplerRenderer))?;

    let stream_opts = &opts.stream_opts;
    let count = match &opts.input_path {
        Some(path) => count_records(path).await?,
        None => None,
    };
    let pb = ui.new_from_count(
        &ProgressConfig {
            emoji: "📄",
            msg: "Processing documents",
            done_msg: "Processed documents",
        },
        stream_opts.apply_to_count(count),
    );

    let input = stream_opts
        .apply_stream_input_opts(read_records(opts.input_path.as_deref()).await?);
    let outputs = input
        .map(move |value| {
            let pipeline = pipeline.clone();
            async move {
                let value = value?;
                Ok::<_, anyhow::Error>(process_record(&pipeline, value).await)
            }
        })
        .buffered(stream_opts.job_count.max(1))
        .boxed();
    let (outputs, counters) = OutputCounters::wrap_stream(pb.wrap_stream(outputs).boxed());

    write_jsonl(opts.output_path.as_deref(), outputs).await?;
    counters.finish(&ui, stream_opts.allowed_failure_rate)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[clap(flatten)]
        opts: OcrOpts,
    }

    #[tokio::test]
    async fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("pagescribe.toml");
        tokio::fs::write(
            &config_path,
            "page_concurrency = 3\n[recognize]\nlanguage = \"deu\"\npage_timeout_ms = 1000\n",
        )
        .await
        .unwrap();

        let cli = TestCli::parse_from([
            "test",
            "--config",
            config_path.to_str().unwrap(),
            "--page-timeout-ms",
            "2500",
            "--no-preprocess",
        ]);
        let config = load_config(&cli.opts).await.unwrap();
        assert_eq!(config.page_concurrency, 3);
        assert_eq!(config.recognize.language, "deu");
        assert_eq!(config.recognize.page_timeout_ms, 2500);
        assert!(!config.preprocess.binarize);
    }

    #[tokio::test]
    async fn invalid_overrides_are_rejected() {
        let cli = TestCli::parse_from(["test", "--dpi", "10"]);
        assert!(load_config(&cli.opts).await.is_err());
    }
}
