//! In-process [`SignalBridge`] for tests.

use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Notify};

use super::{SignalBridge, SignalKind, Subscription};

/// In-process signal bridge.
///
/// Signals are raised with [`ManualSignals::raise`] instead of the OS, and
/// outbound deliveries are recorded rather than sent.
#[derive(Debug, Default)]
pub struct ManualSignals {
    state: Mutex<ManualState>,
    subscribed: Notify,
}

#[derive(Debug, Default)]
struct ManualState {
    senders: Vec<(SignalKind, mpsc::Sender<()>)>,
    subscribe_count: Vec<SignalKind>,
    delivered: Vec<(u32, SignalKind)>,
    fail_delivery: bool,
}

impl ManualSignals {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raise `kind` for every live subscriber. Returns how many were reached.
    pub fn raise(&self, kind: SignalKind) -> usize {
        let mut state = self.state();
        state.senders.retain(|(_, tx)| !tx.is_closed());
        let mut reached = 0;
        for (_, tx) in state.senders.iter().filter(|(k, _)| *k == kind) {
            // A full slot already holds a pending delivery.
            let _ = tx.try_send(());
            reached += 1;
        }
        reached
    }

    /// Wait until at least one live subscription for `kind` exists.
    pub async fn subscribed(&self, kind: SignalKind) {
        loop {
            let notified = self.subscribed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.live_subscriptions(kind) > 0 {
                return;
            }
            notified.await;
        }
    }

    /// Subscriptions for `kind` that have not been dropped yet.
    pub fn live_subscriptions(&self, kind: SignalKind) -> usize {
        self.state()
            .senders
            .iter()
            .filter(|(k, tx)| *k == kind && !tx.is_closed())
            .count()
    }

    /// Subscriptions ever made for `kind`.
    pub fn total_subscriptions(&self, kind: SignalKind) -> usize {
        self.state()
            .subscribe_count
            .iter()
            .filter(|k| **k == kind)
            .count()
    }

    /// Outbound deliveries recorded so far, as `(pid, kind)`.
    pub fn delivered(&self) -> Vec<(u32, SignalKind)> {
        self.state().delivered.clone()
    }

    /// Make every later `deliver` fail with `ESRCH`.
    pub fn fail_delivery(&self, fail: bool) {
        self.state().fail_delivery = fail;
    }
}

impl SignalBridge for ManualSignals {
    fn subscribe(&self, kind: SignalKind) -> io::Result<Box<dyn Subscription>> {
        let (tx, rx) = mpsc::channel(1);
        {
            let mut state = self.state();
            state.senders.push((kind, tx));
            state.subscribe_count.push(kind);
        }
        self.subscribed.notify_waiters();
        Ok(Box::new(ManualSubscription { rx }))
    }

    fn deliver(&self, pid: u32, kind: SignalKind) -> io::Result<()> {
        let mut state = self.state();
        if state.fail_delivery {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        }
        state.delivered.push((pid, kind));
        Ok(())
    }
}

struct ManualSubscription {
    rx: mpsc::Receiver<()>,
}

impl Subscription for ManualSubscription {
    fn recv(&mut self) -> BoxFuture<'_, Option<()>> {
        Box::pin(self.rx.recv())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_raise_reaches_subscriber() {
        let signals = ManualSignals::new();
        let mut sub = signals.subscribe(SignalKind::Terminate).unwrap();

        assert_eq!(signals.raise(SignalKind::Trigger), 0);
        assert_eq!(signals.raise(SignalKind::Terminate), 1);
        assert_eq!(sub.recv().await, Some(()));
    }

    #[tokio::test]
    async fn test_deliveries_coalesce() {
        let signals = ManualSignals::new();
        let mut sub = signals.subscribe(SignalKind::Trigger).unwrap();

        signals.raise(SignalKind::Trigger);
        signals.raise(SignalKind::Trigger);
        assert_eq!(sub.recv().await, Some(()));

        let second = tokio::time::timeout(Duration::from_millis(20), sub.recv()).await;
        assert!(second.is_err(), "second raise should have coalesced");
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let signals = ManualSignals::new();
        let sub = signals.subscribe(SignalKind::Terminate).unwrap();
        assert_eq!(signals.live_subscriptions(SignalKind::Terminate), 1);

        drop(sub);
        assert_eq!(signals.live_subscriptions(SignalKind::Terminate), 0);
        assert_eq!(signals.total_subscriptions(SignalKind::Terminate), 1);
        assert_eq!(signals.raise(SignalKind::Terminate), 0);
    }

    #[tokio::test]
    async fn test_subscribed_wakes_waiter() {
        let signals = std::sync::Arc::new(ManualSignals::new());
        let waiter = {
            let signals = signals.clone();
            tokio::spawn(async move { signals.subscribed(SignalKind::Trigger).await })
        };

        tokio::task::yield_now().await;
        let _sub = signals.subscribe(SignalKind::Trigger).unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_delivery_recorded_or_failed() {
        let signals = ManualSignals::new();
        signals.deliver(42, SignalKind::Terminate).unwrap();
        assert_eq!(signals.delivered(), vec![(42, SignalKind::Terminate)]);

        signals.fail_delivery(true);
        let err = signals.deliver(42, SignalKind::Terminate).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
    }
}
