//! Single-image formats: PNG, JPEG, GIF, WebP and BMP.

use std::io::Cursor;

use image::{DynamicImage, ImageError, ImageReader, Limits, imageops::FilterType};

use crate::{
    config::NormalizeConfig, document::Page, error::IngestError, prelude::*,
};

use super::{NormalizedDocument, SourceFormat, check_pixel_budget};

/// Decode a single image into one page. GIFs yield their first frame.
pub(super) fn decode_raster(
    bytes: &[u8],
    format: SourceFormat,
    config: &NormalizeConfig,
) -> Result<NormalizedDocument, IngestError> {
    let image_format = format.image_format().ok_or_else(|| {
        IngestError::unsupported(format!("{} is not a single image", format.mime_type()))
    })?;

    // Read only the header first, so a tiny file claiming to be enormous is
    // rejected before we allocate anything.
    let (width, height) = ImageReader::with_format(Cursor::new(bytes), image_format)
        .into_dimensions()
        .map_err(|err| {
            IngestError::corrupt(format!(
                "could not read {} header: {err}",
                format.mime_type()
            ))
        })?;
    check_pixel_budget("image", u64::from(width) * u64::from(height), config)?;

    let mut reader = ImageReader::with_format(Cursor::new(bytes), image_format);
    reader.limits(decode_limits(config));
    let image = reader.decode().map_err(|err| match err {
        ImageError::Limits(err) => IngestError::too_large(err.to_string()),
        err => IngestError::corrupt(format!(
            "could not decode {}: {err}",
            format.mime_type()
        )),
    })?;

    let mut warnings = vec![];
    let image = cap_dimensions(image, config.max_image_dimension, &mut warnings);
    Ok(NormalizedDocument {
        format,
        pages: vec![Ok(Page::new(0, image, None))],
        warnings,
    })
}

/// Allocation limits for the image decoder, derived from our pixel budget.
pub(super) fn decode_limits(config: &NormalizeConfig) -> Limits {
    let mut limits = Limits::default();
    // Up to 4 bytes per pixel for RGBA.
    limits.max_alloc = Some(config.max_total_pixels.saturating_mul(4));
    limits
}

/// Downscale `image` so that its longest side is at most `max_dimension`,
/// preserving the aspect ratio.
pub(super) fn cap_dimensions(
    image: DynamicImage,
    max_dimension: u32,
    warnings: &mut Vec<String>,
) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    if width.max(height) <= max_dimension {
        return image;
    }
    let resized = image.resize(max_dimension, max_dimension, FilterType::Triangle);
    debug!(
        width,
        height,
        new_width = resized.width(),
        new_height = resized.height(),
        "downscaled oversized image"
    );
    warnings.push(format!(
        "image was downscaled from {width}x{height} to {}x{}",
        resized.width(),
        resized.height()
    ));
    resized
}
