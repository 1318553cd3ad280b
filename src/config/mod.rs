//! Pipeline configuration.
//!
//! Configuration comes from three places, in increasing order of precedence:
//! built-in defaults, an optional TOML file, and command-line flags (see
//! [`crate::cmd::ocr::PipelineOpts`]).

use std::time::Duration;

use schemars::JsonSchema;

use crate::prelude::*;

mod toml;

/// Default page-boundary marker: a form feed on a line of its own.
pub const DEFAULT_PAGE_BOUNDARY_MARKER: &str = "\n\x0C\n";

/// Top-level pipeline configuration.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// How to turn documents into pages.
    pub normalize: NormalizeConfig,

    /// How to clean up pages before recognition.
    pub preprocess: PreprocessConfig,

    /// How to run the OCR engine.
    pub recognize: RecognizeConfig,

    /// Maximum number of pages of a single document in flight at once.
    pub page_concurrency: usize,

    /// Ceiling on the total time spent on one job, in milliseconds.
    pub job_timeout_ms: u64,

    /// Separator inserted between pages in the concatenated text.
    pub page_boundary_marker: String,

    /// Should we extract invoice-style insights from the text?
    pub extract_insights: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            normalize: NormalizeConfig::default(),
            preprocess: PreprocessConfig::default(),
            recognize: RecognizeConfig::default(),
            page_concurrency: num_cpus::get(),
            job_timeout_ms: 600_000,
            page_boundary_marker: DEFAULT_PAGE_BOUNDARY_MARKER.to_owned(),
            extract_insights: false,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file. Missing fields use defaults.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn from_toml_file(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {:?}", path.display()))?;
        Self::from_toml_str(&data)
            .with_context(|| format!("failed to parse config file {:?}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(data: &str) -> Result<Self> {
        let json = toml::toml_to_json(data)?;
        let config: Self =
            serde_json::from_value(json).context("invalid pipeline configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// The job-level deadline.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    /// Check that our configuration makes sense.
    pub fn validate(&self) -> Result<()> {
        if self.page_concurrency == 0 {
            return Err(anyhow!("page_concurrency must be at least 1"));
        }
        if self.job_timeout_ms == 0 {
            return Err(anyhow!("job_timeout_ms must be at least 1"));
        }
        if self.page_boundary_marker.is_empty() {
            return Err(anyhow!("page_boundary_marker must not be empty"));
        }
        self.normalize.validate()?;
        self.preprocess.validate()?;
        self.recognize.validate()
    }
}

/// Limits and rendering settings for the format normalizer.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizeConfig {
    /// Resolution used to rasterize paginated documents.
    pub target_dpi: u32,

    /// Reject documents with more pages than this.
    pub max_pages: usize,

    /// Reject documents which would decode to more pixels than this, summed
    /// over all pages.
    pub max_total_pixels: u64,

    /// Downscale single images whose longest side exceeds this.
    pub max_image_dimension: u32,

    /// How many PDF pages to render at once.
    pub render_concurrency: usize,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            target_dpi: 300,
            max_pages: 500,
            max_total_pixels: 2_000_000_000,
            max_image_dimension: 10_000,
            render_concurrency: num_cpus::get(),
        }
    }
}

impl NormalizeConfig {
    fn validate(&self) -> Result<()> {
        if !(50..=1200).contains(&self.target_dpi) {
            return Err(anyhow!(
                "target_dpi must be between 50 and 1200, got {}",
                self.target_dpi
            ));
        }
        if self.max_pages == 0 || self.max_total_pixels == 0 {
            return Err(anyhow!("max_pages and max_total_pixels must be non-zero"));
        }
        if self.max_image_dimension < 16 {
            return Err(anyhow!("max_image_dimension must be at least 16"));
        }
        if self.render_concurrency == 0 {
            return Err(anyhow!("render_concurrency must be at least 1"));
        }
        Ok(())
    }
}

/// Which preprocessing transforms to run, and how.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreprocessConfig {
    /// Convert to grayscale.
    pub grayscale: bool,

    /// Stretch contrast and apply an Otsu threshold.
    pub binarize: bool,

    /// Estimate and correct page skew.
    pub deskew: bool,

    /// Apply a median filter.
    pub denoise: bool,

    /// Largest skew angle we search for, in degrees.
    pub max_skew_degrees: f32,

    /// Skew angles smaller than this are left alone, in degrees.
    pub min_skew_degrees: f32,

    /// Radius of the median filter, in pixels.
    pub denoise_radius: u32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            grayscale: true,
            binarize: true,
            deskew: true,
            denoise: true,
            max_skew_degrees: 5.0,
            min_skew_degrees: 0.5,
            denoise_radius: 1,
        }
    }
}

impl PreprocessConfig {
    /// A configuration which leaves pages untouched.
    pub fn disabled() -> Self {
        Self {
            grayscale: false,
            binarize: false,
            deskew: false,
            denoise: false,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.min_skew_degrees >= 0.0
            && self.max_skew_degrees <= 45.0
            && self.min_skew_degrees <= self.max_skew_degrees)
        {
            return Err(anyhow!(
                "skew bounds must satisfy 0 <= min_skew_degrees ({}) <= max_skew_degrees ({}) <= 45",
                self.min_skew_degrees,
                self.max_skew_degrees
            ));
        }
        if self.denoise_radius > 5 {
            return Err(anyhow!("denoise_radius must be at most 5"));
        }
        Ok(())
    }
}

/// How to drive the OCR engine.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecognizeConfig {
    /// Language hint passed to the engine (Tesseract language codes, such as
    /// `eng` or `eng+deu`).
    pub language: String,

    /// Per-page recognition timeout, in milliseconds.
    pub page_timeout_ms: u64,

    /// Pages with a confidence below this are marked `low_confidence`.
    pub low_confidence_threshold: f32,

    /// If recognition of a preprocessed page fails, retry once using the
    /// original raster.
    pub retry_with_original: bool,

    /// How many engine calls may run at once, independent of page
    /// concurrency.
    pub engine_instances: usize,
}

impl Default for RecognizeConfig {
    fn default() -> Self {
        Self {
            language: "eng".to_owned(),
            page_timeout_ms: 60_000,
            low_confidence_threshold: 0.6,
            retry_with_original: true,
            engine_instances: num_cpus::get(),
        }
    }
}

impl RecognizeConfig {
    /// The per-page recognition timeout.
    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.low_confidence_threshold) {
            return Err(anyhow!(
                "low_confidence_threshold must be between 0 and 1, got {}",
                self.low_confidence_threshold
            ));
        }
        if self.page_timeout_ms == 0 {
            return Err(anyhow!("page_timeout_ms must be at least 1"));
        }
        if self.engine_instances == 0 {
            return Err(anyhow!("engine_instances must be at least 1"));
        }
        if self.language.trim().is_empty() {
            return Err(anyhow!("language must not be empty"));
        }
        Ok(())
    }
}
