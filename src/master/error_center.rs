use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::MasterError;

/// Collects the first fatal error of a master lifetime.
///
/// `on_error` never blocks; later errors are dropped after the first one is
/// recorded, and cancellation errors are logged and ignored because they are
/// a normal consequence of shutdown. Recording an error cancels the
/// associated token so in-flight waits unwind promptly.
#[derive(Clone, Default)]
pub struct ErrorCenter {
    inner: Arc<ErrorCenterInner>,
}

#[derive(Default)]
struct ErrorCenterInner {
    first: Mutex<Option<MasterError>>,
    token: CancellationToken,
}

impl ErrorCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_error(&self, err: MasterError) {
        if err.is_canceled() {
            tracing::warn!(error = %err, "master operation canceled");
            return;
        }
        let mut first = self.inner.first.lock();
        if first.is_none() {
            tracing::error!(error = %err, "master encountered a fatal error");
            *first = Some(err);
            self.inner.token.cancel();
        } else {
            tracing::debug!(error = %err, "error dropped, master already failing");
        }
    }

    pub fn first_error(&self) -> Option<MasterError> {
        self.inner.first.lock().clone()
    }

    /// Resolves once the first error has been recorded.
    pub fn on_first_error(&self) -> WaitForCancellationFutureOwned {
        self.inner.token.clone().cancelled_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keeps_only_first_error() {
        let center = ErrorCenter::new();
        assert_eq!(center.first_error(), None);

        center.on_error(MasterError::TooManyPendingEvents);
        center.on_error(MasterError::MasterClosed);
        assert_eq!(
            center.first_error(),
            Some(MasterError::TooManyPendingEvents)
        );
    }

    #[tokio::test]
    async fn test_cancellation_is_not_recorded() {
        let center = ErrorCenter::new();
        center.on_error(MasterError::Canceled);
        assert_eq!(center.first_error(), None);
    }

    #[tokio::test]
    async fn test_first_error_unblocks_waiters() {
        let center = ErrorCenter::new();
        let wait = center.on_first_error();
        center.on_error(MasterError::MasterClosed);
        wait.await;
    }
}
