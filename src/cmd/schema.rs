//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer,
    config::PipelineConfig,
    document::DocumentResult,
    jobs::{JobOutput, JobRecord},
    prelude::*,
};

/// The types we can print schemas for.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// An input record for `ocr`.
    JobRecord,
    /// An output record from `ocr`.
    JobOutput,
    /// The result for one document.
    DocumentResult,
    /// The `--config` file.
    PipelineConfig,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE")]
    pub schema_type: SchemaType,

    /// Where to write the schema. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(opts: &SchemaOpts) -> Result<()> {
    let schema = match opts.schema_type {
        SchemaType::JobRecord => schema_for!(JobRecord),
        SchemaType::JobOutput => schema_for!(JobOutput),
        SchemaType::DocumentResult => schema_for!(DocumentResult),
        SchemaType::PipelineConfig => schema_for!(PipelineConfig),
    };

    let mut wtr = create_writer(opts.output_path.as_deref()).await?;
    let schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    wtr.write_all(schema_str.as_bytes())
        .await
        .context("failed to write schema")?;
    wtr.write_all(b"\n").await.context("failed to write schema")?;
    wtr.flush().await.context("failed to flush schema")?;
    Ok(())
}
