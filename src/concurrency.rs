//! Bounded fan-out / fan-in over a list of work items.
//!
//! At most `worker_size` workers run at once; each holds a token from a
//! semaphore and gives it back when it exits, whether it succeeded, failed or
//! panicked. Results are collected by a single consumer loop that counts
//! completions and fires a quit token once every expected result has arrived.

use std::{future::Future, sync::Arc};

use log::warn;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

/// Runs `work` on every item with at most `worker_size` items in flight.
///
/// The returned vector is in input order. An entry is `None` when its worker
/// panicked before producing a result.
pub async fn run_bounded<I, T, F, Fut>(items: Vec<I>, worker_size: usize, work: F) -> Vec<Option<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let should_done = items.len();
    let mut results: Vec<Option<T>> = (0..should_done).map(|_| None).collect();
    if should_done == 0 {
        return results;
    }

    let worker_size = worker_size.max(1);
    let tokens = Arc::new(Semaphore::new(worker_size));
    let (producer_tx, mut producer_rx) = mpsc::channel::<(usize, T)>(worker_size);
    let quit = CancellationToken::new();
    let work = Arc::new(work);

    let spawner = {
        let quit = quit.clone();
        tokio::spawn(async move {
            for (idx, item) in items.into_iter().enumerate() {
                let token = tokio::select! {
                    _ = quit.cancelled() => return,
                    token = tokens.clone().acquire_owned() => match token {
                        Ok(token) => token,
                        Err(_) => return,
                    },
                };
                let work = work.clone();
                let producer_tx = producer_tx.clone();
                tokio::spawn(async move {
                    let _token = token;
                    let out = work(item).await;
                    let _ = producer_tx.send((idx, out)).await;
                });
            }
        })
    };

    let mut done = 0;
    loop {
        tokio::select! {
            _ = quit.cancelled() => break,
            received = producer_rx.recv() => match received {
                Some((idx, out)) => {
                    results[idx] = Some(out);
                    done += 1;
                    if done == should_done {
                        quit.cancel();
                    }
                },
                // Every sender is gone, so a worker died without reporting.
                None => break,
            },
        }
    }

    if let Err(e) = spawner.await {
        warn!(error:% = e; "Worker spawner failed");
    }
    if done < should_done {
        warn!(done = done, expected = should_done; "Bounded run finished with missing results");
    }
    results
}
