//! Per-document concurrency token.
//!
//! A [`ConcurrencyToken`] owns the value it protects (for a running session,
//! the live engine handle), so the only way to touch that value is through
//! [`ConcurrencyToken::with_token`]. The token is an async mutex: waiting
//! requests park without blocking a runtime thread, and the guard is
//! dropped on every exit path of the operation, including errors and panics.
//! `tokio::sync::Mutex` does not poison, so a failed operation never leaves
//! the document locked.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use tokio::sync::Mutex;

/// Serializes mutating operations against one document.
#[derive(Debug)]
pub struct ConcurrencyToken<H> {
    inner: Mutex<H>,
    acquisitions: AtomicU64,
}

impl<H: Send> ConcurrencyToken<H> {
    /// Wraps `value` so that it can only be reached while holding the token.
    pub fn new(value: H) -> Self {
        Self {
            inner: Mutex::new(value),
            acquisitions: AtomicU64::new(0),
        }
    }

    /// Runs `op` with exclusive access to the protected value.
    ///
    /// Callers queue in FIFO order. The token is released before this
    /// function returns, whatever `op` produced.
    pub async fn with_token<T, F>(&self, op: F) -> T
    where
        F: for<'a> FnOnce(&'a mut H) -> BoxFuture<'a, T>,
    {
        let mut guard = self.inner.lock().await;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        op(&mut *guard).await
    }

    /// Whether an operation currently holds the token.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    /// Total number of times the token has been acquired.
    #[must_use]
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_token_released_after_success_and_failure() {
        let token = ConcurrencyToken::new(0u32);

        let ok: Result<u32, String> = token
            .with_token(|n| {
                Box::pin(async move {
                    *n += 1;
                    Ok(*n)
                })
            })
            .await;
        assert_eq!(ok, Ok(1));
        assert!(!token.is_held());

        let err: Result<u32, String> = token
            .with_token(|_| Box::pin(async { Err("engine failed".to_string()) }))
            .await;
        assert!(err.is_err());
        assert!(!token.is_held());
        assert_eq!(token.acquisitions(), 2);
    }

    #[tokio::test]
    async fn test_token_released_after_panic() {
        let token = Arc::new(ConcurrencyToken::new(Vec::<u32>::new()));

        let panicking = Arc::clone(&token);
        let joined = tokio::spawn(async move {
            panicking
                .with_token(|_| {
                    Box::pin(async {
                        if true {
                            panic!("cell evaluation blew up");
                        }
                    })
                })
                .await;
        })
        .await;
        assert!(joined.is_err());

        let len = token
            .with_token(|v| {
                Box::pin(async move {
                    v.push(1);
                    v.len()
                })
            })
            .await;
        assert_eq!(len, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_operations_never_interleave() {
        let token = Arc::new(ConcurrencyToken::new(Vec::<(usize, &'static str)>::new()));

        let mut tasks = Vec::new();
        for id in 0..16 {
            let token = Arc::clone(&token);
            tasks.push(tokio::spawn(async move {
                token
                    .with_token(move |log| {
                        Box::pin(async move {
                            log.push((id, "start"));
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            log.push((id, "end"));
                        })
                    })
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let log = token.with_token(|log| Box::pin(async move { log.clone() })).await;
        assert_eq!(log.len(), 32);
        for pair in log.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, "start");
            assert_eq!(pair[1].1, "end");
        }
    }

    #[tokio::test]
    async fn test_distinct_tokens_do_not_block_each_other() {
        let a = Arc::new(ConcurrencyToken::new(()));
        let b = ConcurrencyToken::new(());

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let held = Arc::clone(&a);
        let holder = tokio::spawn(async move {
            held.with_token(|_| {
                Box::pin(async move {
                    let _ = release_rx.await;
                })
            })
            .await;
        });

        while !a.is_held() {
            tokio::task::yield_now().await;
        }
        let done = tokio::time::timeout(
            Duration::from_secs(1),
            b.with_token(|_| Box::pin(async { "b done" })),
        )
        .await;
        assert_eq!(done, Ok("b done"));

        release_tx.send(()).unwrap();
        holder.await.unwrap();
        assert!(!a.is_held());
    }
}
