//! Clean up page images before recognition.
//!
//! The transforms always run in the same order: grayscale, binarize, deskew,
//! denoise. Each one is independent. If a transform fails (or panics), we
//! keep the image from before that transform and carry on with the next one.
//! A slightly worse raster is still far better than no raster.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use image::{DynamicImage, GrayImage, Luma};
use imageproc::{
    contrast::otsu_level,
    filter::median_filter,
    geometric_transformations::{Interpolation, rotate_about_center},
};

use crate::{
    async_utils::panic_message,
    config::PreprocessConfig,
    document::{Page, PreprocessedPage, Transform, TransformOutcome, TransformRecord},
    prelude::*,
};

/// Pages whose darkest and lightest pixels are closer than this have nothing
/// to binarize.
const MIN_CONTRAST: u8 = 16;

/// Below this, a page is too empty to estimate skew from.
const MIN_INK_FRACTION: f64 = 0.01;

/// Skew estimation works on every `SKEW_SAMPLE_STRIDE`th pixel in each
/// direction.
const SKEW_SAMPLE_STRIDE: u32 = 2;

/// Angle resolution of the skew search, in degrees.
const SKEW_STEP_DEGREES: f32 = 0.1;

/// What a single transform did.
enum StepOutcome {
    Applied(DynamicImage, Option<String>),
    Skipped(String),
}

/// Runs the transform chain.
#[derive(Clone, Debug)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Run every enabled transform on `page`. Never fails.
    #[instrument(level = "debug", skip_all, fields(page = page.index))]
    pub fn preprocess(&self, page: Page) -> PreprocessedPage {
        let config = &self.config;
        let steps: [(Transform, bool, &dyn Fn(&DynamicImage) -> Result<StepOutcome>); 4] = [
            (Transform::Grayscale, config.grayscale, &grayscale),
            (Transform::Binarize, config.binarize, &binarize),
            (Transform::Deskew, config.deskew, &|image: &DynamicImage| {
                deskew(image, config.max_skew_degrees, config.min_skew_degrees)
            }),
            (Transform::Denoise, config.denoise, &|image: &DynamicImage| {
                denoise(image, config.denoise_radius)
            }),
        ];

        let mut current = page.image.clone();
        let mut records = Vec::with_capacity(steps.len());
        for (transform, enabled, step) in steps {
            if !enabled {
                records.push(TransformRecord {
                    transform,
                    outcome: TransformOutcome::Skipped {
                        reason: "disabled".to_owned(),
                    },
                });
                continue;
            }
            let (next, record) = apply_step(transform, current, step);
            current = next;
            records.push(record);
        }

        PreprocessedPage {
            image: current,
            original: page,
            transforms: records,
        }
    }
}

/// Run one transform, catching errors and panics.
fn apply_step(
    transform: Transform,
    current: Arc<DynamicImage>,
    step: &dyn Fn(&DynamicImage) -> Result<StepOutcome>,
) -> (Arc<DynamicImage>, TransformRecord) {
    let result = catch_unwind(AssertUnwindSafe(|| step(&current)));
    let (image, outcome) = match result {
        Ok(Ok(StepOutcome::Applied(image, detail))) => {
            (Arc::new(image), TransformOutcome::Applied { detail })
        }
        Ok(Ok(StepOutcome::Skipped(reason))) => {
            trace!(?transform, %reason, "transform skipped");
            (current, TransformOutcome::Skipped { reason })
        }
        Ok(Err(err)) => {
            warn!(?transform, "transform failed: {err:#}");
            (current, TransformOutcome::Failed {
                reason: format!("{err:#}"),
            })
        }
        Err(payload) => {
            let reason = format!("panicked: {}", panic_message(payload.as_ref()));
            warn!(?transform, "transform {reason}");
            (current, TransformOutcome::Failed { reason })
        }
    };
    (image, TransformRecord { transform, outcome })
}

/// Get a grayscale view of `image`, flattening any transparency onto white.
fn to_gray(image: &DynamicImage) -> GrayImage {
    if let DynamicImage::ImageLuma8(gray) = image {
        return gray.clone();
    }
    if !image.color().has_alpha() {
        return image.to_luma8();
    }
    let luma_alpha = image.to_luma_alpha8();
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [l, a] = luma_alpha.get_pixel(x, y).0;
        let (l, a) = (u32::from(l), u32::from(a));
        Luma([((l * a + 255 * (255 - a)) / 255) as u8])
    })
}

fn grayscale(image: &DynamicImage) -> Result<StepOutcome> {
    if matches!(image, DynamicImage::ImageLuma8(_)) {
        return Ok(StepOutcome::Skipped("already grayscale".to_owned()));
    }
    Ok(StepOutcome::Applied(
        DynamicImage::ImageLuma8(to_gray(image)),
        None,
    ))
}

/// Stretch the contrast to the full range, then apply an Otsu threshold.
fn binarize(image: &DynamicImage) -> Result<StepOutcome> {
    let gray = to_gray(image);
    let (min, max) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if max < min || max - min < MIN_CONTRAST {
        return Ok(StepOutcome::Skipped(
            "page has almost uniform intensity".to_owned(),
        ));
    }

    let range = u32::from(max - min);
    let mut stretched = gray;
    for p in stretched.pixels_mut() {
        p[0] = (u32::from(p[0] - min) * 255 / range) as u8;
    }
    let level = otsu_level(&stretched);
    for p in stretched.pixels_mut() {
        p[0] = if p[0] > level { 255 } else { 0 };
    }
    Ok(StepOutcome::Applied(
        DynamicImage::ImageLuma8(stretched),
        Some(format!("threshold {level} after stretching {min}..={max}")),
    ))
}

/// Estimate skew with a projection profile, and rotate to correct it.
fn deskew(image: &DynamicImage, max_degrees: f32, min_degrees: f32) -> Result<StepOutcome> {
    let gray = to_gray(image);
    let Some(angle) = estimate_skew(&gray, max_degrees) else {
        return Ok(StepOutcome::Skipped(
            "not enough ink to estimate skew".to_owned(),
        ));
    };
    if angle.abs() < min_degrees {
        return Ok(StepOutcome::Skipped(format!(
            "skew of {angle:.1}° is below the {min_degrees}° minimum"
        )));
    }
    // `rotate_about_center` rotates clockwise, and a positive angle means
    // the lines run downhill, so we rotate back the other way.
    let rotated =
        rotate_about_center(&gray, -angle.to_radians(), Interpolation::Nearest, Luma([255]));
    Ok(StepOutcome::Applied(
        DynamicImage::ImageLuma8(rotated),
        Some(format!("rotated by {:.1}°", -angle)),
    ))
}

/// Estimate the angle of the text lines in `gray`, in degrees, with positive
/// angles meaning lines that slope down to the right.
///
/// For each candidate angle, we project dark pixels onto the axis
/// perpendicular to that angle. When the angle matches the text lines, the
/// ink piles up in a few bins, so the sum of squared bin counts peaks.
/// Returns `None` if there isn't enough ink to say.
fn estimate_skew(gray: &GrayImage, max_degrees: f32) -> Option<f32> {
    let (width, height) = gray.dimensions();
    if width < 32 || height < 32 {
        return None;
    }

    let mut ink = vec![];
    let mut sampled = 0usize;
    for y in (0..height).step_by(SKEW_SAMPLE_STRIDE as usize) {
        for x in (0..width).step_by(SKEW_SAMPLE_STRIDE as usize) {
            sampled += 1;
            if gray.get_pixel(x, y)[0] < 128 {
                ink.push((x as f32, y as f32));
            }
        }
    }
    if (ink.len() as f64) < sampled as f64 * MIN_INK_FRACTION {
        return None;
    }

    // Try small angles first, and only move away from them for a strictly
    // better score, so that ties resolve towards "no skew".
    let steps = (max_degrees / SKEW_STEP_DEGREES).round() as i32;
    let offset = width as f32 * max_degrees.to_radians().tan().abs() + 1.0;
    let bin_count = (height as f32 + 2.0 * offset).ceil() as usize + 1;
    let mut bins = vec![0u32; bin_count];
    let mut best = (0.0f32, 0u64);
    for step in 0..=steps {
        for sign in [1.0, -1.0] {
            if step == 0 && sign < 0.0 {
                continue;
            }
            let angle = sign * step as f32 * SKEW_STEP_DEGREES;
            let slope = angle.to_radians().tan();
            bins.iter_mut().for_each(|b| *b = 0);
            for &(x, y) in &ink {
                let r = (y - x * slope + offset).round();
                if r >= 0.0 && (r as usize) < bin_count {
                    bins[r as usize] += 1;
                }
            }
            let score: u64 = bins.iter().map(|&b| u64::from(b) * u64::from(b)).sum();
            if score > best.1 {
                best = (angle, score);
            }
        }
    }
    Some(best.0)
}

fn denoise(image: &DynamicImage, radius: u32) -> Result<StepOutcome> {
    if radius == 0 {
        return Ok(StepOutcome::Skipped("radius is 0".to_owned()));
    }
    let gray = to_gray(image);
    Ok(StepOutcome::Applied(
        DynamicImage::ImageLuma8(median_filter(&gray, radius, radius)),
        None,
    ))
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use crate::testing::text_like_image;

    use super::*;

    fn outcome_of(page: &PreprocessedPage, transform: Transform) -> &TransformOutcome {
        &page
            .transforms
            .iter()
            .find(|r| r.transform == transform)
            .unwrap()
            .outcome
    }

    fn fraction_different(a: &GrayImage, b: &GrayImage) -> f64 {
        assert_eq!(a.dimensions(), b.dimensions());
        let differing = a
            .pixels()
            .zip(b.pixels())
            .filter(|(p, q)| p[0].abs_diff(q[0]) > 32)
            .count();
        differing as f64 / (a.width() * a.height()) as f64
    }

    #[test]
    fn color_page_goes_through_full_chain() {
        let rgb = RgbImage::from_fn(200, 120, |x, y| {
            if (y / 10) % 2 == 0 && x > 10 && x < 190 {
                Rgb([40, 40, 90])
            } else {
                Rgb([230, 220, 200])
            }
        });
        let page = Page::new(2, DynamicImage::ImageRgb8(rgb), Some(300));
        let out = Preprocessor::new(PreprocessConfig::default()).preprocess(page);

        assert_eq!(out.index(), 2);
        assert_eq!(out.dpi(), Some(300));
        let order = out.transforms.iter().map(|r| r.transform).collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![
                Transform::Grayscale,
                Transform::Binarize,
                Transform::Deskew,
                Transform::Denoise
            ]
        );
        assert_eq!(
            outcome_of(&out, Transform::Grayscale),
            &TransformOutcome::Applied { detail: None }
        );
        assert!(matches!(
            outcome_of(&out, Transform::Binarize),
            TransformOutcome::Applied { .. }
        ));
        assert!(matches!(
            outcome_of(&out, Transform::Deskew),
            TransformOutcome::Skipped { .. }
        ));
        let gray = out.image.as_luma8().unwrap();
        assert!(gray.pixels().all(|p| p[0] == 0 || p[0] == 255));
        // The original is untouched.
        assert!(matches!(*out.original.image, DynamicImage::ImageRgb8(_)));
    }

    #[test]
    fn disabled_transforms_are_recorded_as_skipped() {
        let page = Page::new(0, text_like_image(64, 64), None);
        let out = Preprocessor::new(PreprocessConfig::disabled()).preprocess(page.clone());
        assert!(!out.any_applied());
        assert!(Arc::ptr_eq(&out.image, &page.image));
        assert_eq!(out.transforms.len(), 4);
    }

    #[test]
    fn uniform_page_is_not_binarized() {
        let blank = DynamicImage::ImageLuma8(GrayImage::from_pixel(50, 50, Luma([250])));
        assert!(matches!(binarize(&blank).unwrap(), StepOutcome::Skipped(_)));
    }

    #[test]
    fn skew_is_estimated_and_corrected() {
        let straight = text_like_image(400, 300).to_luma8();
        let skewed =
            rotate_about_center(&straight, 3.0f32.to_radians(), Interpolation::Nearest, Luma([255]));
        let angle = estimate_skew(&skewed, 5.0).unwrap();
        assert!((angle - 3.0).abs() <= 0.3, "estimated {angle}");

        let out = deskew(&DynamicImage::ImageLuma8(skewed), 5.0, 0.5).unwrap();
        let StepOutcome::Applied(fixed, _) = out else {
            panic!("deskew did not apply");
        };
        let residual = estimate_skew(&fixed.to_luma8(), 5.0).unwrap();
        assert!(residual.abs() <= 0.3, "residual {residual}");
    }

    #[test]
    fn straight_page_is_not_rotated() {
        let straight = text_like_image(400, 300).to_luma8();
        assert_eq!(estimate_skew(&straight, 5.0), Some(0.0));
    }

    #[test]
    fn panicking_transform_keeps_previous_image() {
        let image = Arc::new(text_like_image(32, 32));
        let (out, record) = apply_step(
            Transform::Denoise,
            image.clone(),
            &|_: &DynamicImage| -> Result<StepOutcome> { panic!("filter exploded") },
        );
        assert!(Arc::ptr_eq(&out, &image));
        let TransformOutcome::Failed { reason } = record.outcome else {
            panic!("expected failure");
        };
        assert!(reason.contains("filter exploded"));
    }

    #[test]
    fn failing_transform_keeps_previous_image() {
        let image = Arc::new(text_like_image(32, 32));
        let (out, record) = apply_step(
            Transform::Binarize,
            image.clone(),
            &|_: &DynamicImage| -> Result<StepOutcome> { Err(anyhow!("nope")) },
        );
        assert!(Arc::ptr_eq(&out, &image));
        assert!(matches!(record.outcome, TransformOutcome::Failed { .. }));
    }

    #[test]
    fn preprocessing_is_idempotent_on_clean_pages() {
        let preprocessor = Preprocessor::new(PreprocessConfig::default());
        let clean = Page::new(0, text_like_image(300, 200), None);
        let once = preprocessor.preprocess(clean);
        let twice = preprocessor.preprocess(Page {
            index: 0,
            image: once.image.clone(),
            dpi: None,
        });
        let diff = fraction_different(&once.image.to_luma8(), &twice.image.to_luma8());
        assert!(diff < 0.005, "{:.4} of pixels changed", diff);
    }
}
