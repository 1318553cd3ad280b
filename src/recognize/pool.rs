//! A pool of OCR engine instances, sized independently of page concurrency.

use std::{
    ops::Deref,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::prelude::*;

use super::OcrEngine;

/// Hands out engines to page workers.
///
/// A reentrant engine (one which can safely serve several callers at once) is
/// shared, with a limit on concurrent calls. Other engines are pooled as
/// separate instances, and each instance serves one caller at a time.
#[derive(Clone)]
pub struct EnginePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    permits: Arc<Semaphore>,
    capacity: usize,
    mode: PoolMode,
}

enum PoolMode {
    Shared(Arc<dyn OcrEngine>),
    Exclusive(Mutex<Vec<Arc<dyn OcrEngine>>>),
}

impl EnginePool {
    /// Share one reentrant engine between up to `max_concurrent` callers.
    pub fn reentrant(engine: Arc<dyn OcrEngine>, max_concurrent: usize) -> Result<Self> {
        if max_concurrent == 0 {
            return Err(anyhow!("engine pool needs at least one permit"));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(max_concurrent)),
                capacity: max_concurrent,
                mode: PoolMode::Shared(engine),
            }),
        })
    }

    /// Pool separate instances of an engine that is not reentrant.
    pub fn exclusive(instances: Vec<Arc<dyn OcrEngine>>) -> Result<Self> {
        if instances.is_empty() {
            return Err(anyhow!("engine pool needs at least one engine instance"));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(instances.len())),
                capacity: instances.len(),
                mode: PoolMode::Exclusive(Mutex::new(instances)),
            }),
        })
    }

    /// How many callers may use the pool at once.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Engines not currently leased. Always equal to [`Self::capacity`] for
    /// a reentrant pool.
    pub fn idle(&self) -> usize {
        match &self.inner.mode {
            PoolMode::Shared(_) => self.inner.capacity,
            PoolMode::Exclusive(engines) => engines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    /// Wait for an engine. The engine goes back to the pool when the lease is
    /// dropped.
    pub async fn acquire(&self) -> Result<EngineLease> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("engine pool was closed")?;
        let engine = match &self.inner.mode {
            PoolMode::Shared(engine) => engine.clone(),
            PoolMode::Exclusive(engines) => engines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop()
                // Each permit corresponds to one idle engine.
                .ok_or_else(|| anyhow!("engine pool is empty despite a free permit"))?,
        };
        Ok(EngineLease {
            engine: Some(engine),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }
}

/// A borrowed engine.
pub struct EngineLease {
    engine: Option<Arc<dyn OcrEngine>>,
    pool: Arc<PoolInner>,
    /// Released after the engine is back in the pool, because fields are
    /// dropped after [`Drop::drop`] runs.
    _permit: OwnedSemaphorePermit,
}

impl Deref for EngineLease {
    type Target = dyn OcrEngine;

    fn deref(&self) -> &Self::Target {
        match &self.engine {
            Some(engine) => engine.as_ref(),
            None => unreachable!("engine is only taken in drop"),
        }
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        if let (Some(engine), PoolMode::Exclusive(engines)) =
            (self.engine.take(), &self.pool.mode)
        {
            engines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(engine);
        }
    }
}
