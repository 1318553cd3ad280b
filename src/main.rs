use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{debug, instrument};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use pagescribe::{cmd, ui::Ui};

/// Turn scanned images and PDFs into text.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
External tools:
  - tesseract: used to recognize text.
  - pdfinfo and pdftocairo (poppler-utils): used to render PDF pages.

Logging can be configured with RUST_LOG, which may be set in a `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR images and PDFs. The input file should have `id` and `path` fields.
    Ocr(cmd::ocr::OcrOpts),
    /// Print schemas for input, output and configuration formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Ocr(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    let directive = Directive::from_str("info")?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Ocr(opts) => {
            cmd::ocr::cmd_ocr(ui, opts).await?;
        }
        Cmd::Schema(opts) => {
            cmd::schema::cmd_schema(opts).await?;
        }
    }
    Ok(())
}
