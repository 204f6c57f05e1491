use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::DeviceExchangeError;

type GateSender = oneshot::Sender<Result<(), DeviceExchangeError>>;

/// One-shot rendezvous between an APDU that is expected to drop the link and
/// the reconnect flow that brings it back.
///
/// At most one wait is pending. Settling clears the slot so the gate can be
/// reused by the next disconnect-triggering exchange.
#[derive(Debug, Default)]
pub struct ReconnectionGate {
    pending: Mutex<Option<GateSender>>,
}

impl ReconnectionGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a wait and returns the future settled by [`resolve`](Self::resolve)
    /// or [`reject`](Self::reject).
    ///
    /// Registration happens when this method is called, not when the future is
    /// first polled. A previous unsettled wait is replaced and observes
    /// [`DeviceExchangeError::ReconnectionFailed`].
    pub fn wait(&self) -> impl Future<Output = Result<(), DeviceExchangeError>> + Send + 'static {
        let (sender, receiver) = oneshot::channel();
        if self.pending.lock().replace(sender).is_some() {
            debug!("replaced an unsettled reconnection wait");
        }

        async move {
            receiver
                .await
                .unwrap_or(Err(DeviceExchangeError::ReconnectionFailed))
        }
    }

    /// Settles the pending wait successfully. No-op when nothing is pending.
    pub fn resolve(&self) {
        self.settle(Ok(()));
    }

    /// Settles the pending wait with `error`. No-op when nothing is pending.
    pub fn reject(&self, error: DeviceExchangeError) {
        self.settle(Err(error));
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    fn settle(&self, outcome: Result<(), DeviceExchangeError>) {
        let Some(sender) = self.pending.lock().take() else {
            trace!("no reconnection wait to settle");
            return;
        };
        if sender.send(outcome).is_err() {
            trace!("reconnection waiter went away before the gate settled");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn resolve_settles_pending_wait() {
        let gate = ReconnectionGate::new();
        let wait = gate.wait();

        gate.resolve();

        assert_matches!(wait.await, Ok(()));
        assert!(!gate.is_pending());
    }

    #[tokio::test]
    async fn reject_settles_pending_wait_with_error() {
        let gate = ReconnectionGate::new();
        let wait = gate.wait();

        gate.reject(DeviceExchangeError::ReconnectionFailed);

        assert_matches!(wait.await, Err(DeviceExchangeError::ReconnectionFailed));
    }

    #[test]
    fn settling_an_empty_gate_is_a_no_op() {
        let gate = ReconnectionGate::new();

        gate.resolve();
        gate.reject(DeviceExchangeError::ReconnectionFailed);

        assert!(!gate.is_pending());
    }

    #[tokio::test]
    async fn gate_is_reusable_after_settling() {
        let gate = ReconnectionGate::new();
        let first = gate.wait();
        gate.resolve();
        assert_matches!(first.await, Ok(()));

        let second = gate.wait();
        assert!(gate.is_pending());
        gate.reject(DeviceExchangeError::ReconnectionFailed);

        assert_matches!(second.await, Err(DeviceExchangeError::ReconnectionFailed));
    }

    #[tokio::test]
    async fn second_wait_replaces_first() {
        let gate = ReconnectionGate::new();
        let first = gate.wait();
        let second = gate.wait();

        gate.resolve();

        assert_matches!(first.await, Err(DeviceExchangeError::ReconnectionFailed));
        assert_matches!(second.await, Ok(()));
    }
}
