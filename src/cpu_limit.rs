//! Limits on how many CPU-hungry external processes we run at once.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// Shared by every `pdftocairo`, `pdfinfo` and `tesseract` process we start,
/// across all jobs.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Run `f` while holding one CPU permit.
///
/// Each external renderer or OCR process will happily eat a whole core. When
/// several documents are processed at once, their page workers all compete
/// for this one pool, so the machine never runs more of these processes than
/// it has cores.
///
/// In-process image work doesn't need this. It runs on Tokio's blocking pool
/// via [`crate::async_utils::run_blocking`].
#[instrument(level = "trace", skip_all, fields(process = process))]
pub async fn with_cpu_semaphore<Func, Fut, R>(process: &str, f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let permit = CPU_SEMAPHORE
        .acquire()
        .await
        .with_context(|| format!("could not acquire CPU permit for {process}"))?;
    trace!(available = CPU_SEMAPHORE.available_permits(), "acquired CPU permit");
    let result = f().await;
    drop(permit);
    result
}
