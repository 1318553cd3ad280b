//! Adapter for engines with a synchronous API, such as in-process bindings.

use std::sync::Arc;

use crate::{async_utils::run_blocking, prelude::*};

use super::{OcrEngine, RecognitionRequest, TextRegion};

/// A synchronous OCR engine.
pub trait RecognizeRaster: Send + Sync + 'static {
    fn recognize_raster(&self, request: &RecognitionRequest) -> Result<Vec<TextRegion>>;
}

/// Runs a [`RecognizeRaster`] on the blocking pool, so that it can't stall
/// the async runtime. A panic inside the engine becomes an engine failure.
///
/// Note that a blocking call can't be interrupted. When a deadline passes we
/// stop waiting for it, but the thread runs until the engine returns.
pub struct BlockingEngine<E: RecognizeRaster> {
    engine: Arc<E>,
}

impl<E: RecognizeRaster> BlockingEngine<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

#[async_trait]
impl<E: RecognizeRaster> OcrEngine for BlockingEngine<E> {
    async fn recognize_raster(&self, request: &RecognitionRequest) -> Result<Vec<TextRegion>> {
        let engine = self.engine.clone();
        let request = request.clone();
        run_blocking("OCR engine", move || engine.recognize_raster(&request)).await
    }
}
