use std::fmt::{Debug, Display};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::metrics_consts::{
    FILES_FAILED_COUNTER, FILES_PROCESSED_COUNTER, FILE_PROCESSING_DURATION_HISTOGRAM,
};

/// Per-item work run by the map stage. Every worker gets its own instance, so
/// implementations are free to keep per-worker state.
#[async_trait]
pub trait Processor: Send + 'static {
    type Item: Clone + Debug + Display + Send + Sync + 'static;
    type Output: Send + 'static;

    async fn process(&mut self, item: &Self::Item) -> anyhow::Result<Self::Output>;
}

/// What came back from the map stage. Order is not meaningful.
#[derive(Debug)]
pub struct Collated<I, O> {
    pub succeeded: Vec<(I, O)>,
    pub failed: Vec<I>,
}

enum Outcome<I, O> {
    Done(I, O),
    Failed(I),
}

/// Runs `items` through `worker_count` workers, each owning a processor built by
/// `new_processor(worker_index)`. An item that errors or panics is logged and
/// reported as failed; it never stops the other items.
pub async fn multiprocess_collate<P, F>(
    items: Vec<P::Item>,
    worker_count: usize,
    mut new_processor: F,
) -> Collated<P::Item, P::Output>
where
    P: Processor,
    F: FnMut(usize) -> P,
{
    let worker_count = worker_count.max(1);
    let total = items.len();
    info!("Starting {} workers for {} items", worker_count, total);

    let (work_tx, work_rx) = mpsc::unbounded_channel();
    for item in items {
        // receiver is alive until the workers are spawned below
        work_tx.send(item).ok();
    }
    drop(work_tx);
    let work_rx = Arc::new(Mutex::new(work_rx));
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();

    let mut workers = JoinSet::new();
    for worker in 0..worker_count {
        let mut processor = new_processor(worker);
        let work_rx = work_rx.clone();
        let result_tx = result_tx.clone();
        workers.spawn(async move {
            debug!("Worker {} started", worker);
            loop {
                let next = work_rx.lock().await.recv().await;
                let Some(item) = next else {
                    break;
                };
                let started = Instant::now();
                let outcome = AssertUnwindSafe(processor.process(&item))
                    .catch_unwind()
                    .await;
                histogram!(FILE_PROCESSING_DURATION_HISTOGRAM)
                    .record(started.elapsed().as_secs_f64());
                let outcome = match outcome {
                    Ok(Ok(output)) => {
                        counter!(FILES_PROCESSED_COUNTER).increment(1);
                        Outcome::Done(item, output)
                    }
                    Ok(Err(e)) => {
                        counter!(FILES_FAILED_COUNTER).increment(1);
                        error!("Worker {} failed to process {}: {:#}", worker, item, e);
                        Outcome::Failed(item)
                    }
                    Err(_) => {
                        counter!(FILES_FAILED_COUNTER).increment(1);
                        error!("Worker {} panicked while processing {}", worker, item);
                        Outcome::Failed(item)
                    }
                };
                if result_tx.send(outcome).is_err() {
                    break;
                }
            }
            debug!("Worker {} shutting down", worker);
        });
    }
    drop(result_tx);

    let mut collated = Collated {
        succeeded: Vec::with_capacity(total),
        failed: Vec::new(),
    };
    while let Some(outcome) = result_rx.recv().await {
        match outcome {
            Outcome::Done(item, output) => collated.succeeded.push((item, output)),
            Outcome::Failed(item) => collated.failed.push(item),
        }
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("Worker task ended abnormally: {}", e);
        }
    }
    collated
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;

    use super::*;

    struct Doubler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Processor for Doubler {
        type Item = u32;
        type Output = u32;

        async fn process(&mut self, item: &u32) -> anyhow::Result<u32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            match item {
                7 => bail!("seven is unlucky"),
                13 => panic!("thirteen is worse"),
                n => Ok(n * 2),
            }
        }
    }

    async fn run(worker_count: usize) -> (Collated<u32, u32>, usize, usize) {
        let calls = Arc::new(AtomicUsize::new(0));
        let built = Arc::new(AtomicUsize::new(0));
        let collated = multiprocess_collate((0..20).collect(), worker_count, |_| {
            built.fetch_add(1, Ordering::SeqCst);
            Doubler {
                calls: calls.clone(),
            }
        })
        .await;
        (
            collated,
            calls.load(Ordering::SeqCst),
            built.load(Ordering::SeqCst),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failures_are_isolated() {
        let (collated, calls, built) = run(4).await;

        assert_eq!(calls, 20);
        assert_eq!(built, 4);
        let failed: BTreeSet<u32> = collated.failed.into_iter().collect();
        assert_eq!(failed, BTreeSet::from([7, 13]));
        let succeeded: BTreeSet<(u32, u32)> = collated.succeeded.into_iter().collect();
        assert_eq!(succeeded.len(), 18);
        assert!(succeeded.iter().all(|(i, o)| *o == i * 2));
    }

    #[tokio::test]
    async fn test_worker_count_does_not_change_results() {
        let (one, _, _) = run(1).await;
        let (many, _, _) = run(8).await;

        let one: BTreeSet<(u32, u32)> = one.succeeded.into_iter().collect();
        let many: BTreeSet<(u32, u32)> = many.succeeded.into_iter().collect();
        assert_eq!(one, many);
    }

    #[tokio::test]
    async fn test_zero_workers_still_runs() {
        let (collated, calls, built) = run(0).await;
        assert_eq!(built, 1);
        assert_eq!(calls, 20);
        assert_eq!(collated.succeeded.len() + collated.failed.len(), 20);
    }
}
