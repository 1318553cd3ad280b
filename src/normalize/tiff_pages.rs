//! Multi-page TIFF files.
//!
//! We do this the hard way, because scanners represent multiple pages in
//! several different ways. The common case is one top-level IFD per page,
//! which [`tiff`] handles out of the box. Pages hidden in SubIFDs are rare,
//! and we refuse those files rather than silently dropping pages. Thumbnails,
//! masks and DNG metadata are not pages, and are ignored.

use std::io::Cursor;

use image::{DynamicImage, GrayImage, Luma, RgbImage, RgbaImage};
use tiff::{
    ColorType,
    decoder::{Decoder, DecodingResult, ifd::Value},
    tags::{IfdPointer, Tag},
};

use crate::{
    config::NormalizeConfig, document::Page, error::IngestError, prelude::*,
};

use super::{
    NormalizedDocument, PageFault, SourceFormat, check_page_count, check_pixel_budget,
    raster::cap_dimensions,
};

/// NewSubfileType bits from the TIFF 6.0 specification.
mod subfile_type {
    /// Reduced resolution image (thumbnail or preview).
    pub const REDUCED_RESOLUTION: u32 = 0x1;
    /// Single page of a multi-page document.
    pub const SINGLE_PAGE: u32 = 0x2;
    /// Transparency mask for another image.
    pub const TRANSPARENCY_MASK: u32 = 0x4;
    /// DNG extensions: depth map, enhanced image, semantic mask.
    pub const DNG_BITS: u32 = 0x8 | 0x10 | 0x10000;
}

/// Decode every top-level IFD of a TIFF into a page.
pub(super) fn decode_tiff(
    bytes: &[u8],
    config: &NormalizeConfig,
) -> Result<NormalizedDocument, IngestError> {
    let mut warnings = vec![];

    // First pass: headers only. Count pages, add up pixels and look for
    // pages hiding in SubIFDs.
    let mut decoder = open_decoder(bytes)?;
    let mut page_count = 0usize;
    let mut total_pixels = 0u64;
    loop {
        validate_subifds(&mut decoder, page_count, &mut warnings)?;
        let (width, height) = decoder.dimensions().map_err(|err| {
            IngestError::corrupt(format!("could not read size of TIFF page {page_count}: {err}"))
        })?;
        page_count += 1;
        total_pixels = total_pixels.saturating_add(u64::from(width) * u64::from(height));
        check_page_count(page_count, config)?;
        check_pixel_budget("TIFF", total_pixels, config)?;

        if !decoder.more_images() {
            break;
        }
        decoder.next_image().map_err(|err| {
            IngestError::corrupt(format!("could not find TIFF page {page_count}: {err}"))
        })?;
    }
    debug!(page_count, total_pixels, "scanned TIFF directories");

    // Second pass: decode. A page that fails to decode is a page fault, not a
    // job failure.
    let mut decoder = open_decoder(bytes)?;
    let mut pages = Vec::with_capacity(page_count);
    for index in 0..page_count {
        if index > 0 {
            decoder.next_image().map_err(|err| {
                IngestError::corrupt(format!("could not find TIFF page {index}: {err}"))
            })?;
        }
        match decode_current_page(&mut decoder, index) {
            Ok(image) => {
                let image = cap_dimensions(image, config.max_image_dimension, &mut warnings);
                pages.push(Ok(Page::new(index, image, None)));
            }
            Err(err) => {
                warn!(page = index, "could not decode TIFF page: {err:#}");
                pages.push(Err(PageFault {
                    index,
                    message: format!("{err:#}"),
                }));
            }
        }
    }

    Ok(NormalizedDocument {
        format: SourceFormat::Tiff,
        pages,
        warnings,
    })
}

fn open_decoder(bytes: &[u8]) -> Result<Decoder<Cursor<&[u8]>>, IngestError> {
    Decoder::new(Cursor::new(bytes))
        .map_err(|err| IngestError::corrupt(format!("could not open TIFF: {err}")))
}

/// Make sure that no SubIFD of the current IFD holds a document page.
fn validate_subifds<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    ifd_index: usize,
    warnings: &mut Vec<String>,
) -> Result<(), IngestError> {
    let subifd_value = match decoder.find_tag(Tag::SubIfd) {
        Ok(Some(value)) => value,
        Ok(None) | Err(_) => return Ok(()),
    };

    let offsets: Vec<u64> = match subifd_value {
        Value::Ifd(offset) => vec![u64::from(offset)],
        Value::List(list) => list
            .iter()
            .filter_map(|v| match v {
                Value::Ifd(offset) => Some(u64::from(*offset)),
                _ => None,
            })
            .collect(),
        _ => return Ok(()),
    };

    for (sub_idx, &offset) in offsets.iter().enumerate() {
        let subdir = match decoder.read_directory(IfdPointer(offset)) {
            Ok(dir) => dir,
            Err(err) => {
                warnings.push(format!(
                    "could not read SubIFD {sub_idx} of TIFF page {ifd_index}: {err}"
                ));
                continue;
            }
        };

        let kind = {
            let mut tags = decoder.read_directory_tags(&subdir);
            match tags.find_tag(Tag::NewSubfileType) {
                Ok(Some(value)) => value.into_u32().unwrap_or(0),
                _ => 0,
            }
        };

        if kind
            & (subfile_type::REDUCED_RESOLUTION
                | subfile_type::TRANSPARENCY_MASK
                | subfile_type::DNG_BITS)
            != 0
        {
            debug!(ifd_index, sub_idx, kind, "skipping non-page SubIFD");
            continue;
        }

        if kind == 0 || kind & subfile_type::SINGLE_PAGE != 0 {
            return Err(IngestError::corrupt(format!(
                "TIFF page {ifd_index} has a SubIFD ({sub_idx}, NewSubfileType={kind}) \
                 which may hold another page; convert the file to PDF or separate \
                 images before submitting it"
            )));
        }
    }
    Ok(())
}

/// Decode the decoder's current IFD.
fn decode_current_page<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    index: usize,
) -> Result<DynamicImage> {
    let (width, height) = decoder
        .dimensions()
        .with_context(|| format!("could not read size of page {index}"))?;
    let color_type = decoder
        .colortype()
        .with_context(|| format!("could not read color type of page {index}"))?;
    let result = decoder
        .read_image()
        .with_context(|| format!("could not decode page {index}"))?;

    let data = match result {
        DecodingResult::U8(data) => data,
        // We only need 8 bits per channel for OCR.
        DecodingResult::U16(data) => data.iter().map(|&v| (v >> 8) as u8).collect(),
        _ => {
            return Err(anyhow!(
                "page {index} uses an unsupported TIFF sample format"
            ));
        }
    };

    // WhiteIsZero pages have already been inverted by the decoder.
    let image = match color_type {
        ColorType::Gray(bits @ (1 | 2 | 4)) => {
            unpack_gray(width, height, bits, &data).map(DynamicImage::ImageLuma8)
        }
        ColorType::Gray(_) => GrayImage::from_raw(width, height, data)
            .map(DynamicImage::ImageLuma8),
        ColorType::RGB(_) => {
            RgbImage::from_raw(width, height, data).map(DynamicImage::ImageRgb8)
        }
        ColorType::RGBA(_) => {
            RgbaImage::from_raw(width, height, data).map(DynamicImage::ImageRgba8)
        }
        other => {
            return Err(anyhow!(
                "page {index} uses unsupported TIFF color type {other:?}"
            ));
        }
    };
    image.ok_or_else(|| anyhow!("page {index} has the wrong amount of pixel data"))
}

/// Expand packed 1, 2 or 4 bit gray samples to 8 bits. Samples are packed
/// high bit first, and every row starts on a byte boundary.
fn unpack_gray(width: u32, height: u32, bits: u8, data: &[u8]) -> Option<GrayImage> {
    let bits = usize::from(bits);
    let row_bytes = (width as usize * bits).div_ceil(8);
    if data.len() < row_bytes * height as usize {
        return None;
    }
    let max = (1u16 << bits) - 1;
    Some(GrayImage::from_fn(width, height, |x, y| {
        let bit = x as usize * bits;
        let byte = data[y as usize * row_bytes + bit / 8];
        let sample = u16::from(byte >> (8 - bits - bit % 8)) & max;
        Luma([(sample * 255 / max) as u8])
    }))
}
