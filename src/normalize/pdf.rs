//! PDF documents, rendered one page at a time by an external renderer.

use std::{collections::BTreeMap, process::Stdio, sync::Arc, sync::LazyLock};

use futures::{StreamExt as _, stream};
use image::{DynamicImage, ImageFormat};
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, is_command_not_found},
    config::NormalizeConfig,
    cpu_limit::with_cpu_semaphore,
    document::Page,
    error::IngestError,
    prelude::*,
};

use super::{
    NormalizedDocument, PageFault, SourceFormat, check_page_count, check_pixel_budget,
};

/// How far from each end of the file we look for the PDF header and trailer.
const PDF_MARKER_WINDOW: usize = 1024;

/// Page geometry and count, read without rendering anything.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentInfo {
    pub page_count: usize,

    /// Size of the first page in PostScript points (1/72 inch), if known.
    pub page_size_points: Option<(f64, f64)>,
}

impl DocumentInfo {
    /// Estimate how many pixels rendering the whole document at `dpi` will
    /// produce, assuming every page is the size of the first one.
    pub fn estimated_pixels(&self, dpi: u32) -> Option<u64> {
        let (width_pt, height_pt) = self.page_size_points?;
        let scale = f64::from(dpi) / 72.0;
        let per_page = (width_pt * scale).ceil() * (height_pt * scale).ceil();
        Some((per_page * self.page_count as f64).min(u64::MAX as f64) as u64)
    }
}

/// Something that can render paginated documents.
#[async_trait]
pub trait DocumentRenderer: Send + Sync + 'static {
    /// Open a document. Errors are reported in terms the caller of the
    /// pipeline understands: a file we can't parse is
    /// [`IngestError::CorruptInput`], while a missing renderer is
    /// [`IngestError::RendererUnavailable`].
    async fn open(&self, bytes: Arc<[u8]>) -> Result<Box<dyn RenderSession>, IngestError>;
}

/// An open document.
#[async_trait]
pub trait RenderSession: Send + Sync {
    fn info(&self) -> &DocumentInfo;

    /// Render the 0-based page `index` at `dpi`.
    ///
    /// If the renderer itself has gone missing, the error should wrap an
    /// [`IngestError::RendererUnavailable`], so that the job fails instead of
    /// reporting every page as broken.
    async fn render_page(&self, index: usize, dpi: u32) -> Result<DynamicImage>;
}

/// Render a PDF into pages.
#[instrument(level = "debug", skip_all, fields(bytes = bytes.len()))]
pub(super) async fn normalize_pdf(
    renderer: &dyn DocumentRenderer,
    bytes: Arc<[u8]>,
    config: &NormalizeConfig,
) -> Result<NormalizedDocument, IngestError> {
    check_pdf_framing(&bytes)?;

    let session = renderer.open(bytes).await?;
    let info = session.info().clone();
    debug!(?info, "opened PDF");
    if info.page_count == 0 {
        return Err(IngestError::corrupt("PDF has no pages"));
    }
    check_page_count(info.page_count, config)?;
    if let Some(pixels) = info.estimated_pixels(config.target_dpi) {
        check_pixel_budget("PDF", pixels, config)?;
    }

    let dpi = config.target_dpi;
    let session = session.as_ref();
    let mut rendered = stream::iter(0..info.page_count)
        .map(|index| async move { (index, session.render_page(index, dpi).await) })
        .buffered(config.render_concurrency);

    let mut pages = Vec::with_capacity(info.page_count);
    let mut warnings = vec![];
    let mut total_pixels = 0u64;
    while let Some((index, result)) = rendered.next().await {
        match result {
            Ok(image) => {
                total_pixels = total_pixels.saturating_add(
                    u64::from(image.width()) * u64::from(image.height()),
                );
                check_pixel_budget("PDF", total_pixels, config)?;
                pages.push(Ok(Page::new(index, image, Some(dpi))));
            }
            Err(err) => {
                if let Some(ingest_err @ IngestError::RendererUnavailable { .. }) =
                    err.downcast_ref::<IngestError>()
                {
                    return Err(ingest_err.clone());
                }
                warn!(page = index, "could not render PDF page: {err:#}");
                warnings.push(format!("page {index} could not be rendered"));
                pages.push(Err(PageFault {
                    index,
                    message: format!("{err:#}"),
                }));
            }
        }
    }

    Ok(NormalizedDocument {
        format: SourceFormat::Pdf,
        pages,
        warnings,
    })
}

/// Reject obviously truncated PDFs before we start any external process.
fn check_pdf_framing(bytes: &[u8]) -> Result<(), IngestError> {
    let head = &bytes[..bytes.len().min(PDF_MARKER_WINDOW)];
    // Some scanners and mail gateways pad files after the trailer.
    let end = bytes
        .iter()
        .rposition(|&b| b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |pos| pos + 1);
    let tail = &bytes[end.saturating_sub(PDF_MARKER_WINDOW)..end];
    if !contains(head, b"%PDF-") {
        return Err(IngestError::corrupt("PDF header not found"));
    }
    if !contains(tail, b"%%EOF") {
        return Err(IngestError::corrupt(
            "PDF trailer not found; the file may be truncated",
        ));
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Poppler prints these on stderr for files it can't open, sometimes with a
/// zero exit status.
static POPPLER_FATAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^(?:I/O )?error: (?:couldn't open file|may not be a pdf file)")
        .expect("failed to compile regex")
});

/// Renders PDFs using Poppler's `pdfinfo` and `pdftocairo` command-line
/// tools.
#[derive(Clone, Debug, Default)]
pub struct PopplerRenderer;

#[async_trait]
impl DocumentRenderer for PopplerRenderer {
    #[instrument(level = "debug", skip_all)]
    async fn open(&self, bytes: Arc<[u8]>) -> Result<Box<dyn RenderSession>, IngestError> {
        let tmpdir = tempfile::TempDir::with_prefix("pagescribe-pdf").map_err(|err| {
            IngestError::RendererUnavailable {
                detail: format!("could not create temporary directory: {err}"),
            }
        })?;
        let input_path = tmpdir.path().join("input.pdf");
        tokio::fs::write(&input_path, &bytes).await.map_err(|err| {
            IngestError::RendererUnavailable {
                detail: format!("could not write temporary PDF: {err}"),
            }
        })?;

        let info = pdfinfo(&input_path).await?;
        Ok(Box::new(PopplerSession {
            tmpdir,
            input_path,
            info,
        }))
    }
}

/// Run `pdfinfo` and parse the page count and first page size.
async fn pdfinfo(path: &Path) -> Result<DocumentInfo, IngestError> {
    let output = with_cpu_semaphore("pdfinfo", || async {
        Command::new("pdfinfo")
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(anyhow::Error::from)
    })
    .await
    .map_err(|err| match err.downcast_ref::<std::io::Error>() {
        Some(io_err) if is_command_not_found(io_err) => IngestError::RendererUnavailable {
            detail: "pdfinfo is not installed (install poppler-utils)".to_owned(),
        },
        _ => IngestError::RendererUnavailable {
            detail: format!("could not run pdfinfo: {err:#}"),
        },
    })?;
    check_for_command_failure("pdfinfo", &output, Some(&POPPLER_FATAL_REGEX))
        .map_err(|err| IngestError::corrupt(format!("could not parse PDF: {err:#}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_pdfinfo(&stdout).map_err(|err| IngestError::corrupt(format!("{err:#}")))
}

/// Parse the output of `pdfinfo`.
fn parse_pdfinfo(output: &str) -> Result<DocumentInfo> {
    let properties = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect::<BTreeMap<_, _>>();

    let page_count = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?
        .parse::<usize>()
        .context("failed to parse page count from pdfinfo output")?;

    // "612 x 792 pts (letter)", or "595.276 x 841.89 pts (A4)".
    let page_size_points = properties.get("Page size").and_then(|size| {
        let mut parts = size.split_whitespace();
        let width = parts.next()?.parse::<f64>().ok()?;
        let _x = parts.next().filter(|x| *x == "x")?;
        let height = parts.next()?.parse::<f64>().ok()?;
        Some((width, height))
    });

    Ok(DocumentInfo {
        page_count,
        page_size_points,
    })
}

/// A PDF copied into a temporary directory.
struct PopplerSession {
    /// Deleted on drop.
    tmpdir: tempfile::TempDir,
    input_path: PathBuf,
    info: DocumentInfo,
}

#[async_trait]
impl RenderSession for PopplerSession {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    #[instrument(level = "debug", skip(self))]
    async fn render_page(&self, index: usize, dpi: u32) -> Result<DynamicImage> {
        // Poppler counts pages from 1, and adds `.png` to the output prefix.
        let page_number = (index + 1).to_string();
        let out_prefix = self.tmpdir.path().join(format!("page-{index}"));
        let out_path = out_prefix.with_extension("png");

        let output = with_cpu_semaphore("pdftocairo", || async {
            Command::new("pdftocairo")
                .arg("-png")
                .arg("-singlefile")
                .arg("-r")
                .arg(dpi.to_string())
                .arg("-f")
                .arg(&page_number)
                .arg("-l")
                .arg(&page_number)
                .arg(&self.input_path)
                .arg(&out_prefix)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|err| {
                    if is_command_not_found(&err) {
                        anyhow::Error::new(IngestError::RendererUnavailable {
                            detail: "pdftocairo is not installed (install poppler-utils)"
                                .to_owned(),
                        })
                    } else {
                        anyhow::Error::new(err).context("failed to run pdftocairo")
                    }
                })
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, Some(&POPPLER_FATAL_REGEX))?;

        let png = tokio::fs::read(&out_path)
            .await
            .with_context(|| format!("pdftocairo did not write page {}", index + 1))?;
        // Free the disk space early; the directory goes away with the session.
        if let Err(err) = tokio::fs::remove_file(&out_path).await {
            debug!("could not remove {:?}: {err}", out_path.display());
        }
        image::load_from_memory_with_format(&png, ImageFormat::Png)
            .with_context(|| format!("could not decode rendered page {}", index + 1))
    }
}
