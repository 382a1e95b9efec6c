//! Cooperative cancellation for store I/O and retry back-off.
//!
//! A [`Cancellation`] is a cheap, cloneable token observed at every suspension
//! point of the command cycle. It fires when its [`CancelHandle`] is
//! triggered or when its deadline passes, whichever comes first.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::DomainError;

/// Triggers the [`Cancellation`] tokens created alongside it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Cancels every token derived from this handle.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancellation token.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// Creates a linked handle/token pair.
    #[must_use]
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx },
            Self {
                rx: Some(rx),
                deadline: None,
            },
        )
    }

    /// A token that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self::default()
    }

    /// Returns a copy of this token that also fires at `deadline`.
    ///
    /// An earlier deadline already on the token is kept.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            rx: self.rx.clone(),
            deadline: Some(deadline),
        }
    }

    /// Returns a copy of this token that also fires after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns `true` once the token has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        let signalled = self.rx.as_ref().is_some_and(|rx| *rx.borrow());
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        signalled || expired
    }

    /// Completes when the token fires. Pending forever for [`never`](Self::never).
    pub async fn cancelled(&self) {
        let signal = async {
            if let Some(rx) = &self.rx {
                let mut rx = rx.clone();
                let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
                if !closed {
                    return;
                }
            }
            // Handle dropped without cancelling: nothing can fire any more.
            std::future::pending::<()>().await;
        };
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = signal => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => signal.await,
        }
    }

    /// Drives `fut` to completion unless the token fires first.
    ///
    /// When both are ready at the same poll, cancellation wins.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Cancelled` if the token fired.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, DomainError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            () = self.cancelled() => Err(DomainError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Sleeps until `at`, returning early with an error on cancellation.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Cancelled` if the token fired before `at`.
    pub async fn sleep_until(&self, at: Instant) -> Result<(), DomainError> {
        self.run(tokio::time::sleep_until(at)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_never_runs_future_to_completion() {
        // Arrange
        let cancel = Cancellation::never();

        // Act
        let result = cancel.run(async { 7 }).await;

        // Assert
        assert_eq!(result.unwrap(), 7);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_handle_wins_over_ready_future() {
        // Arrange
        let (handle, cancel) = Cancellation::new();
        handle.cancel();

        // Act
        let result = cancel.run(async { 7 }).await;

        // Assert
        assert!(matches!(result, Err(DomainError::Cancelled)));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        // Arrange
        let (handle, cancel) = Cancellation::new();
        let sleeper = cancel.clone();
        let task = tokio::spawn(async move {
            sleeper
                .sleep_until(Instant::now() + Duration::from_secs(60))
                .await
        });

        // Act
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        let result = task.await.unwrap();

        // Assert
        assert!(matches!(result, Err(DomainError::Cancelled)));
    }

    #[tokio::test]
    async fn test_timeout_fires() {
        // Arrange
        let cancel = Cancellation::never().with_timeout(Duration::from_millis(10));

        // Act
        let result = cancel.run(std::future::pending::<()>()).await;

        // Assert
        assert!(matches!(result, Err(DomainError::Cancelled)));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_cancel() {
        // Arrange
        let (handle, cancel) = Cancellation::new();
        drop(handle);

        // Act
        let result = cancel
            .sleep_until(Instant::now() + Duration::from_millis(5))
            .await;

        // Assert
        assert!(result.is_ok());
    }
}
