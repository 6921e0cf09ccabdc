//! Semaphore-bounded task fan-out for DDL phases.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{MigrateError, Result};

/// Run `f` over every item on spawned tasks, at most `limit` at a time.
///
/// Results come back in item order. A panicking task yields a `State` error
/// in its slot instead of tearing down the phase.
pub async fn run_bounded<I, F, Fut, T>(limit: usize, items: I, f: F) -> Vec<Result<T>>
where
    I: IntoIterator,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut handles = Vec::new();

    for item in items {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let fut = f(item);
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            fut.await
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(
            handle
                .await
                .unwrap_or_else(|e| Err(MigrateError::State(format!("DDL task panicked: {}", e)))),
        );
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_bounded_respects_limit_and_order() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = run_bounded(2, 0..6usize, |i| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(i * 10)
            }
        })
        .await;

        let values: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40, 50]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
