//! Fakes and fixtures for unit tests.

use std::{
    collections::{HashMap, HashSet},
    io::Cursor,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use tokio::time::Duration;

use crate::{
    error::IngestError,
    normalize::{DocumentInfo, DocumentRenderer, RenderSession},
    prelude::*,
    recognize::{EngineUnavailable, OcrEngine, RecognitionRequest, TextRegion},
};

/// How [`MockEngine`] should treat one page.
#[derive(Clone, Debug)]
pub enum MockPage {
    /// Return this text with this confidence.
    Text(String, f32),
    /// Sleep, then return the default text.
    Delay(Duration),
    /// Always fail.
    Fail,
    /// Fail the first time, then return the default text.
    FailOnce,
    /// Fail as if the engine were not installed.
    Unavailable,
}

/// A scripted OCR engine. Clones share their call counters.
#[derive(Clone, Default)]
pub struct MockEngine {
    pages: HashMap<usize, MockPage>,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    failed_once: Arc<Mutex<HashSet<usize>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, page_index: usize, behavior: MockPage) -> Self {
        self.pages.insert(page_index, behavior);
        self
    }

    /// Total calls so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls running right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// The most calls that were ever running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn respond(&self, page_index: usize) -> Result<Vec<TextRegion>> {
        let default_text = || vec![TextRegion::new(format!("page {page_index}"), 0.95)];
        match self.pages.get(&page_index) {
            None => Ok(default_text()),
            Some(MockPage::Text(text, confidence)) => {
                Ok(vec![TextRegion::new(text.clone(), *confidence)])
            }
            Some(MockPage::Delay(delay)) => {
                tokio::time::sleep(*delay).await;
                Ok(default_text())
            }
            Some(MockPage::Fail) => Err(anyhow!("mock engine failed on page {page_index}")),
            Some(MockPage::Unavailable) => Err(EngineUnavailable(
                "mock engine is not installed".to_owned(),
            )
            .into()),
            Some(MockPage::FailOnce) => {
                let first = self
                    .failed_once
                    .lock()
                    .expect("lock poisoned")
                    .insert(page_index);
                if first {
                    Err(anyhow!("mock engine failed once on page {page_index}"))
                } else {
                    Ok(default_text())
                }
            }
        }
    }
}

/// Decrements the in-flight count even when the call is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl OcrEngine for MockEngine {
    async fn recognize_raster(&self, request: &RecognitionRequest) -> Result<Vec<TextRegion>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        // Let other page workers get started, so concurrency is observable.
        tokio::task::yield_now().await;
        self.respond(request.page_index).await
    }
}

/// A renderer which serves canned page images. `None` pages fail to render.
#[derive(Clone)]
pub struct MockRenderer {
    pages: Arc<Vec<Option<DynamicImage>>>,
    render_calls: Arc<AtomicUsize>,
    unavailable: bool,
    render_delay: Option<Duration>,
}

impl MockRenderer {
    pub fn new(pages: Vec<Option<DynamicImage>>) -> Self {
        Self {
            pages: Arc::new(pages),
            render_calls: Arc::new(AtomicUsize::new(0)),
            unavailable: false,
            render_delay: None,
        }
    }

    /// Sleep this long before rendering each page.
    pub fn with_render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = Some(delay);
        self
    }

    /// A renderer that behaves as if its backing tool is not installed.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new(vec![])
        }
    }

    pub fn render_calls(&self) -> usize {
        self.render_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentRenderer for MockRenderer {
    async fn open(&self, _bytes: Arc<[u8]>) -> Result<Box<dyn RenderSession>, IngestError> {
        if self.unavailable {
            return Err(IngestError::RendererUnavailable {
                detail: "mock renderer is switched off".to_owned(),
            });
        }
        Ok(Box::new(MockSession {
            info: DocumentInfo {
                page_count: self.pages.len(),
                page_size_points: None,
            },
            renderer: self.clone(),
        }))
    }
}

struct MockSession {
    info: DocumentInfo,
    renderer: MockRenderer,
}

#[async_trait]
impl RenderSession for MockSession {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    async fn render_page(&self, index: usize, _dpi: u32) -> Result<DynamicImage> {
        self.renderer.render_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.renderer.render_delay {
            tokio::time::sleep(delay).await;
        }
        match self.renderer.pages.get(index) {
            Some(Some(image)) => Ok(image.clone()),
            Some(None) => Err(anyhow!("mock render failure on page {index}")),
            None => Err(anyhow!("page {index} out of range")),
        }
    }
}

/// Encode an image as PNG.
pub fn png_bytes(image: &DynamicImage) -> Vec<u8> {
    let mut out = vec![];
    image
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .expect("PNG encoding failed");
    out
}

/// A black-on-white page with straight, horizontal lines of "words".
///
/// Lines are 6 pixels tall on a 14 pixel pitch, inside a white margin.
pub fn text_like_image(width: u32, height: u32) -> DynamicImage {
    const LINE_HEIGHT: u32 = 6;
    const LINE_PITCH: u32 = 14;
    const WORD_GAP: u32 = 8;
    const WORD_WIDTHS: [u32; 7] = [30, 18, 42, 24, 12, 36, 20];

    let margin = (width.min(height) / 16).max(1);
    let mut image = GrayImage::from_pixel(width, height, Luma([255]));
    let mut top = margin;
    let mut line_no = 0usize;
    while top + LINE_HEIGHT + margin <= height {
        let mut left = margin;
        let mut word_no = line_no;
        while left + margin < width {
            let word_width = WORD_WIDTHS[word_no % WORD_WIDTHS.len()];
            let right = (left + word_width).min(width - margin);
            for y in top..top + LINE_HEIGHT {
                for x in left..right {
                    image.put_pixel(x, y, Luma([0]));
                }
            }
            left = right + WORD_GAP;
            word_no += 1;
        }
        top += LINE_PITCH;
        line_no += 1;
    }
    DynamicImage::ImageLuma8(image)
}
