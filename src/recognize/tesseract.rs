//! The `tesseract` command-line engine.

use std::{collections::BTreeMap, io::Cursor, process::Stdio, sync::Arc};

use image::{DynamicImage, ImageFormat};
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, is_command_not_found, run_blocking},
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

use super::{EngineUnavailable, OcrEngine, RecognitionRequest, TextRegion};

/// TSV rows at this level are single words.
const WORD_LEVEL: u32 = 5;

/// Runs one `tesseract` process per page.
///
/// Each call gets its own process and temporary file, so a single instance
/// can be shared by any number of page workers.
#[derive(Clone, Debug)]
pub struct TesseractEngine {
    program: String,
}

impl TesseractEngine {
    pub fn new() -> Self {
        Self {
            program: "tesseract".to_owned(),
        }
    }

    /// Use a different `tesseract` binary.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    #[instrument(level = "debug", skip_all, fields(page = request.page_index))]
    async fn recognize_raster(&self, request: &RecognitionRequest) -> Result<Vec<TextRegion>> {
        let image = request.image.clone();
        let png = run_blocking("PNG encoding", move || encode_png(&image)).await?;

        let tmpdir = tempfile::TempDir::with_prefix("pagescribe-ocr")?;
        let input_path = tmpdir.path().join("page.png");
        tokio::fs::write(&input_path, &png)
            .await
            .context("failed to write page image for tesseract")?;

        let mut command = Command::new(&self.program);
        command
            .arg(&input_path)
            .arg("stdout")
            .arg("-l")
            .arg(&request.language);
        if let Some(dpi) = request.dpi {
            command.arg("--dpi").arg(dpi.to_string());
        }
        command
            .arg("tsv")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = with_cpu_semaphore("tesseract", || async {
            command.output().await.map_err(|err| {
                if is_command_not_found(&err) {
                    anyhow::Error::new(EngineUnavailable(format!(
                        "{} is not installed (install tesseract-ocr)",
                        self.program
                    )))
                } else {
                    anyhow::Error::new(err).context("failed to run tesseract")
                }
            })
        })
        .await?;
        check_for_command_failure("tesseract", &output, None)?;

        let tsv = String::from_utf8_lossy(&output.stdout);
        let regions = parse_tsv(&tsv)?;
        debug!(regions = regions.len(), "tesseract finished");
        Ok(regions)
    }
}

fn encode_png(image: &Arc<DynamicImage>) -> Result<Vec<u8>> {
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("failed to encode page image as PNG")?;
    Ok(png)
}

/// Words belonging to one line, in reading order.
#[derive(Default)]
struct LineAccumulator {
    words: Vec<String>,
    confidence_sum: f32,
}

/// Group tesseract's word-level TSV output into lines.
///
/// Rows with a negative confidence are layout rows (blocks, paragraphs,
/// lines) or empty words, and are skipped. Word confidences are 0 to 100.
pub(crate) fn parse_tsv(tsv: &str) -> Result<Vec<TextRegion>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .has_headers(true)
        .from_reader(tsv.as_bytes());

    let mut lines = BTreeMap::<(u32, u32, u32, u32), LineAccumulator>::new();
    for row in reader.records() {
        let row = row.context("could not read tesseract TSV output")?;
        let field = |idx: usize| row.get(idx).unwrap_or("").trim();
        let number = |idx: usize| -> Result<u32> {
            field(idx)
                .parse::<u32>()
                .with_context(|| format!("bad number in tesseract TSV: {:?}", field(idx)))
        };

        if number(0)? != WORD_LEVEL {
            continue;
        }
        let confidence = field(10)
            .parse::<f32>()
            .with_context(|| format!("bad confidence in tesseract TSV: {:?}", field(10)))?;
        let text = row.get(11).unwrap_or("").trim();
        if confidence < 0.0 || text.is_empty() {
            continue;
        }

        let key = (number(1)?, number(2)?, number(3)?, number(4)?);
        let line = lines.entry(key).or_default();
        line.words.push(text.to_owned());
        line.confidence_sum += confidence;
    }

    Ok(lines
        .into_values()
        .map(|line| {
            let confidence = line.confidence_sum / line.words.len() as f32 / 100.0;
            TextRegion::new(line.words.join(" "), confidence)
        })
        .collect())
}
