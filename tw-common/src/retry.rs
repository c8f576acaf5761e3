//! Retry helper for idempotent reads
//!
//! Reads at a component boundary get exactly one retry when the first
//! failure looks transient. Writes are never routed through here: a
//! repeated write could credit the same time twice.

use std::fmt::Display;

/// Errors that can tell whether an immediate retry may succeed
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for crate::Error {
    fn is_transient(&self) -> bool {
        crate::Error::is_transient(self)
    }
}

/// Run `operation`, retrying once if the first error is transient.
///
/// Non-transient errors and the second failure are returned unchanged.
pub async fn retry_once<F, Fut, T, E>(operation_name: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    match operation().await {
        Ok(value) => Ok(value),
        Err(err) if err.is_transient() => {
            tracing::warn!(
                operation = operation_name,
                error = %err,
                "Read failed, retrying once"
            );
            match operation().await {
                Ok(value) => {
                    tracing::debug!(operation = operation_name, "Read succeeded after retry");
                    Ok(value)
                }
                Err(second) => {
                    tracing::error!(
                        operation = operation_name,
                        error = %second,
                        "Read failed after retry"
                    );
                    Err(second)
                }
            }
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, Result};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> Error {
        Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_once() {
        let calls = AtomicU32::new(0);
        let result = retry_once("test read", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_second_failure() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_once("test read", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_once("test read", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::NotFound("subsection 9".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
