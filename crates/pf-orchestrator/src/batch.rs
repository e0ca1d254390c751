//! Fixed-size concurrent batching for fleet-wide operations
//!
//! Items are split into chunks of `batch_size`. Every item in a chunk runs as
//! its own task; the whole chunk settles (success, failure or panic) before
//! the next one is submitted. This bounds simultaneous SSH sessions and HTTP
//! polls regardless of fleet size.

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Outcome of a batched run
#[derive(Debug)]
pub struct BatchReport<R> {
    /// Results of items that ran to completion, in completion order
    pub completed: Vec<R>,
    /// Items whose task panicked or was aborted
    pub failed: usize,
    /// Items never submitted because the run was cancelled
    pub skipped: usize,
}

impl<R> BatchReport<R> {
    fn new() -> Self {
        Self {
            completed: Vec::new(),
            failed: 0,
            skipped: 0,
        }
    }
}

/// Run `f` over `items` in concurrent chunks of `batch_size`.
///
/// Cancellation is checked between chunks: work already submitted finishes,
/// remaining items are counted as skipped. A batch size of zero is treated
/// as one.
pub async fn run_batched<T, R, F, Fut>(
    items: Vec<T>,
    batch_size: usize,
    cancel: &CancellationToken,
    f: F,
) -> BatchReport<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
{
    let batch_size = batch_size.max(1);
    let total = items.len();
    let mut report = BatchReport::new();
    let mut items = items.into_iter();
    let mut submitted = 0;

    loop {
        let chunk: Vec<T> = items.by_ref().take(batch_size).collect();
        if chunk.is_empty() {
            break;
        }
        if cancel.is_cancelled() {
            tracing::info!(
                "Batch run cancelled; skipping {} of {} items",
                total - submitted,
                total
            );
            report.skipped = total - submitted;
            break;
        }
        submitted += chunk.len();

        let mut set = JoinSet::new();
        for item in chunk {
            set.spawn(f(item));
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => report.completed.push(result),
                Err(e) => {
                    tracing::error!("Batch task failed: {}", e);
                    report.failed += 1;
                }
            }
        }
    }

    report
}
