//! Turn a submitted [`Document`] into an ordered list of raster [`Page`]s.
//!
//! We trust the bytes more than the submitter: the format is sniffed from the
//! content first, and the declared MIME type is only used when sniffing tells
//! us nothing. Size limits are checked using header information before any
//! large decode happens.

use std::sync::Arc;

use image::ImageFormat;

use crate::{
    async_utils::run_blocking,
    config::NormalizeConfig,
    document::{Document, DocumentKind, Page},
    error::IngestError,
    prelude::*,
};

mod pdf;
mod raster;
mod tiff_pages;

pub use self::pdf::{DocumentInfo, DocumentRenderer, PopplerRenderer, RenderSession};

/// Formats we know how to read.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
    Tiff,
    Pdf,
}

impl SourceFormat {
    /// Map a MIME type to a format. Ignores parameters and case, and accepts
    /// a few common non-standard aliases.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::Webp),
            "image/bmp" | "image/x-bmp" | "image/x-ms-bmp" => Some(Self::Bmp),
            "image/tiff" | "image/tif" | "image/x-tiff" => Some(Self::Tiff),
            "application/pdf" | "application/x-pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    /// The canonical MIME type for this format.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
            Self::Bmp => "image/bmp",
            Self::Tiff => "image/tiff",
            Self::Pdf => "application/pdf",
        }
    }

    /// Can this format hold more than one page?
    pub fn kind(self) -> DocumentKind {
        match self {
            Self::Tiff | Self::Pdf => DocumentKind::Paginated,
            _ => DocumentKind::Image,
        }
    }

    /// The matching [`image`] crate format, for single-image formats.
    fn image_format(self) -> Option<ImageFormat> {
        match self {
            Self::Png => Some(ImageFormat::Png),
            Self::Jpeg => Some(ImageFormat::Jpeg),
            Self::Gif => Some(ImageFormat::Gif),
            Self::Webp => Some(ImageFormat::WebP),
            Self::Bmp => Some(ImageFormat::Bmp),
            Self::Tiff | Self::Pdf => None,
        }
    }
}

/// A page we expected to get, but couldn't render.
#[derive(Clone, Debug, PartialEq)]
pub struct PageFault {
    pub index: usize,
    pub message: String,
}

/// The output of the normalizer.
#[derive(Debug)]
pub struct NormalizedDocument {
    /// The format we decided the document was.
    pub format: SourceFormat,

    /// One entry per page, in page order. Never empty, and at least one entry
    /// is `Ok`.
    pub pages: Vec<Result<Page, PageFault>>,

    /// Things worth telling the caller about.
    pub warnings: Vec<String>,
}

impl NormalizedDocument {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Decodes documents into pages.
#[derive(Clone)]
pub struct Normalizer {
    config: NormalizeConfig,
    renderer: Arc<dyn DocumentRenderer>,
}

impl Normalizer {
    pub fn new(config: NormalizeConfig, renderer: Arc<dyn DocumentRenderer>) -> Self {
        Self { config, renderer }
    }

    /// Turn `document` into pages.
    #[instrument(level = "debug", skip_all, fields(job_id = %document.job_id()))]
    pub async fn normalize(
        &self,
        document: &Document,
    ) -> Result<NormalizedDocument, IngestError> {
        if document.bytes().is_empty() {
            return Err(IngestError::corrupt("document is empty"));
        }

        let mut warnings = vec![];
        let format =
            detect_format(document.bytes(), document.declared_mime(), &mut warnings)?;
        debug!(format = format.mime_type(), "detected document format");

        let mut normalized = match format {
            SourceFormat::Pdf => {
                pdf::normalize_pdf(
                    self.renderer.as_ref(),
                    document.shared_bytes(),
                    &self.config,
                )
                .await?
            }
            SourceFormat::Tiff => {
                let bytes = document.shared_bytes();
                let config = self.config.clone();
                decode_blocking("TIFF decoder", move || {
                    tiff_pages::decode_tiff(&bytes, &config)
                })
                .await?
            }
            _ => {
                let bytes = document.shared_bytes();
                let config = self.config.clone();
                decode_blocking("image decoder", move || {
                    raster::decode_raster(&bytes, format, &config)
                })
                .await?
            }
        };

        // Our own warnings come first, since they describe the whole file.
        warnings.append(&mut normalized.warnings);
        normalized.warnings = warnings;

        if !normalized.pages.iter().any(|p| p.is_ok()) {
            return Err(IngestError::corrupt("document contains no readable pages"));
        }
        Ok(normalized)
    }
}

/// Run a decoder on the blocking pool. A decoder that panics was almost
/// certainly fed a malformed file, so we report that as corrupt input.
async fn decode_blocking<F>(
    what: &'static str,
    f: F,
) -> Result<NormalizedDocument, IngestError>
where
    F: FnOnce() -> Result<NormalizedDocument, IngestError> + Send + 'static,
{
    run_blocking(what, move || Ok(f()))
        .await
        .map_err(|err| IngestError::corrupt(format!("{err:#}")))?
}

/// Decide what format a document is in.
fn detect_format(
    bytes: &[u8],
    declared_mime: Option<&str>,
    warnings: &mut Vec<String>,
) -> Result<SourceFormat, IngestError> {
    let declared = declared_mime.map(|mime| (mime, SourceFormat::from_mime(mime)));

    match infer::get(bytes) {
        Some(sniffed) => {
            let sniffed_mime = sniffed.mime_type();
            let format = SourceFormat::from_mime(sniffed_mime).ok_or_else(|| {
                IngestError::unsupported(format!(
                    "content looks like {sniffed_mime}, which is not an image or PDF"
                ))
            })?;
            if let Some((declared_mime, declared_format)) = declared
                && declared_format != Some(format)
            {
                warn!(
                    declared = declared_mime,
                    sniffed = sniffed_mime,
                    "declared MIME type does not match content"
                );
                warnings.push(format!(
                    "declared type {declared_mime} does not match content; treating as {}",
                    format.mime_type()
                ));
            }
            Ok(format)
        }
        None => match declared {
            Some((_, Some(format))) => Ok(format),
            Some((mime, None)) => Err(IngestError::unsupported(format!(
                "unsupported declared type {mime}"
            ))),
            None => Err(IngestError::unsupported(
                "could not recognize the content, and no type was declared",
            )),
        },
    }
}

/// Reject documents that would decode to too many pixels.
fn check_pixel_budget(
    what: &str,
    pixels: u64,
    config: &NormalizeConfig,
) -> Result<(), IngestError> {
    if pixels > config.max_total_pixels {
        Err(IngestError::too_large(format!(
            "{what} would decode to {pixels} pixels, more than the limit of {}",
            config.max_total_pixels
        )))
    } else {
        Ok(())
    }
}

/// Reject documents with too many pages.
fn check_page_count(pages: usize, config: &NormalizeConfig) -> Result<(), IngestError> {
    if pages > config.max_pages {
        Err(IngestError::too_large(format!(
            "document has {pages} pages, more than the limit of {}",
            config.max_pages
        )))
    } else {
        Ok(())
    }
}
