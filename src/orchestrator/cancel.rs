//! Cooperative cancellation.
//!
//! A [`CancelHandle`] requests cancellation once; every [`CancelSignal`]
//! cloned from it observes the request. Dispatch loops check the signal
//! before starting each task; work already handed to a collaborator is left
//! to finish.

use std::sync::Arc;

use tokio::sync::watch;

/// Requests cancellation of one run.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<Option<String>>>,
}

/// Observes cancellation of one run.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<Option<String>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Requests cancellation with `reason`. Returns false if already requested.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.sender.borrow().is_some()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        CancelHandle::new().signal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// The cancellation reason, once requested.
    pub fn reason(&self) -> Option<String> {
        self.receiver.borrow().clone()
    }

    /// Resolves with the reason once cancellation is requested.
    ///
    /// Pends forever if every handle is dropped without cancelling.
    pub async fn cancelled(&mut self) -> String {
        let reason = match self.receiver.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_observed_by_signals() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        assert!(!signal.is_cancelled());

        assert!(handle.cancel("user request"));
        assert!(signal.is_cancelled());
        assert_eq!(signal.reason().as_deref(), Some("user request"));
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_second_cancel_keeps_first_reason() {
        let handle = CancelHandle::new();
        assert!(handle.cancel("first"));
        assert!(!handle.cancel("second"));
        assert_eq!(handle.signal().reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let handle = CancelHandle::new();
        let mut signal = handle.signal();

        let waiter = tokio::spawn(async move { signal.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel("stop");

        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, "stop");
    }

    #[tokio::test]
    async fn test_never_signal_does_not_fire() {
        let mut signal = CancelSignal::never();
        let result = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(result.is_err());
    }
}
