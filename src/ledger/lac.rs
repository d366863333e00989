//! Last-add-confirmed subscriptions.
//!
//! A reader registers `(ledger, previous)` and receives the ledger's LAC
//! once it exceeds `previous`. The write path only sends on a oneshot
//! channel, so no subscriber code ever runs under a ledger lock.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use super::error::{Result, StorageError};
use super::types::{EntryId, LedgerId};

struct Waiter {
    id: u64,
    previous: EntryId,
    tx: oneshot::Sender<EntryId>,
}

#[derive(Default)]
struct Registry {
    waiters: Mutex<HashMap<LedgerId, Vec<Waiter>>>,
    next_id: AtomicU64,
}

/// Per-ledger set of pending LAC conditions.
#[derive(Clone, Default)]
pub struct LacNotifier {
    registry: Arc<Registry>,
}

impl LacNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `ledger_id`'s LAC moving past `previous`.
    ///
    /// `current` must be read under the ledger's lock and that lock held
    /// across this call, so no advance can slip between the check and the
    /// registration.
    pub fn subscribe(&self, ledger_id: LedgerId, previous: EntryId, current: EntryId) -> LacWatch {
        let (tx, rx) = oneshot::channel();
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);

        if current > previous {
            let _ = tx.send(current);
        } else {
            self.registry
                .waiters
                .lock()
                .entry(ledger_id)
                .or_default()
                .push(Waiter { id, previous, tx });
            debug!(ledger_id, previous, "LAC watch registered");
        }

        LacWatch {
            ledger_id,
            id,
            rx: Some(rx),
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Wake every waiter of `ledger_id` whose condition `lac` satisfies.
    pub fn notify(&self, ledger_id: LedgerId, lac: EntryId) -> usize {
        let ready = {
            let mut waiters = self.registry.waiters.lock();
            let Some(pending) = waiters.get_mut(&ledger_id) else {
                return 0;
            };
            let (ready, rest): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|waiter| lac > waiter.previous);
            *pending = rest;
            if pending.is_empty() {
                waiters.remove(&ledger_id);
            }
            ready
        };

        let notified = ready.len();
        for waiter in ready {
            let _ = waiter.tx.send(lac);
        }
        if notified > 0 {
            debug!(ledger_id, lac, notified, "LAC waiters notified");
        }
        notified
    }

    /// Drop all waiters of a ledger. Their watches resolve with an error.
    pub fn close_ledger(&self, ledger_id: LedgerId) {
        self.registry.waiters.lock().remove(&ledger_id);
    }

    /// Drop every waiter.
    pub fn close_all(&self) {
        self.registry.waiters.lock().clear();
    }

    pub fn pending(&self, ledger_id: LedgerId) -> usize {
        self.registry
            .waiters
            .lock()
            .get(&ledger_id)
            .map_or(0, Vec::len)
    }
}

/// A pending LAC subscription.
///
/// Resolves to the LAC that satisfied it. Dropping or cancelling the watch
/// unregisters it without a notification.
pub struct LacWatch {
    ledger_id: LedgerId,
    id: u64,
    rx: Option<oneshot::Receiver<EntryId>>,
    registry: Weak<Registry>,
}

impl LacWatch {
    pub fn ledger_id(&self) -> LedgerId {
        self.ledger_id
    }

    /// Unsubscribe. A notification already delivered is discarded.
    pub fn cancel(mut self) {
        self.unregister();
    }

    /// Non-blocking check: `Ok(None)` while still waiting.
    pub fn try_recv(&mut self) -> Result<Option<EntryId>> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(closed(self.ledger_id));
        };
        match rx.try_recv() {
            Ok(lac) => {
                self.rx = None;
                Ok(Some(lac))
            }
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => {
                self.rx = None;
                Err(closed(self.ledger_id))
            }
        }
    }

    /// Block the current thread until notified. Not for use inside a runtime.
    pub fn blocking_recv(mut self) -> Result<EntryId> {
        let ledger_id = self.ledger_id;
        let rx = self.rx.take().ok_or_else(|| closed(ledger_id))?;
        rx.blocking_recv().map_err(|_| closed(ledger_id))
    }

    fn unregister(&mut self) {
        if self.rx.take().is_none() {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut waiters = registry.waiters.lock();
        if let Some(pending) = waiters.get_mut(&self.ledger_id) {
            pending.retain(|waiter| waiter.id != self.id);
            if pending.is_empty() {
                waiters.remove(&self.ledger_id);
            }
        }
    }
}

impl Future for LacWatch {
    type Output = Result<EntryId>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let ledger_id = self.ledger_id;
        let polled = match self.rx.as_mut() {
            Some(rx) => Pin::new(rx).poll(cx),
            None => return Poll::Ready(Err(closed(ledger_id))),
        };
        match polled {
            Poll::Ready(result) => {
                self.rx = None;
                Poll::Ready(result.map_err(|_| closed(ledger_id)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for LacWatch {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn closed(ledger_id: LedgerId) -> StorageError {
    StorageError::Interrupted(format!("LAC watch on ledger {} was closed", ledger_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satisfied_condition_notifies_immediately() {
        let notifier = LacNotifier::new();
        let mut watch = notifier.subscribe(1, 3, 5);
        assert_eq!(watch.try_recv().unwrap(), Some(5));
        assert_eq!(notifier.pending(1), 0);
    }

    #[test]
    fn test_notify_fires_only_satisfied_waiters() {
        let notifier = LacNotifier::new();
        let mut low = notifier.subscribe(1, 1, 1);
        let mut high = notifier.subscribe(1, 4, 1);
        let mut other = notifier.subscribe(2, 1, 1);

        assert_eq!(notifier.notify(1, 2), 1);
        assert_eq!(low.try_recv().unwrap(), Some(2));
        assert_eq!(high.try_recv().unwrap(), None);
        assert_eq!(other.try_recv().unwrap(), None);

        assert_eq!(notifier.notify(1, 5), 1);
        assert_eq!(high.try_recv().unwrap(), Some(5));
        assert_eq!(notifier.notify(1, 6), 0);
    }

    #[test]
    fn test_equal_lac_does_not_notify() {
        let notifier = LacNotifier::new();
        let mut watch = notifier.subscribe(1, 3, 3);
        assert_eq!(notifier.notify(1, 3), 0);
        assert_eq!(watch.try_recv().unwrap(), None);
    }

    #[test]
    fn test_cancel_and_drop_unregister() {
        let notifier = LacNotifier::new();
        let watch = notifier.subscribe(1, 0, 0);
        let dropped = notifier.subscribe(1, 0, 0);
        assert_eq!(notifier.pending(1), 2);

        watch.cancel();
        drop(dropped);
        assert_eq!(notifier.pending(1), 0);
        assert_eq!(notifier.notify(1, 1), 0);
    }

    #[test]
    fn test_closed_ledger_errors_watch() {
        let notifier = LacNotifier::new();
        let mut watch = notifier.subscribe(1, 0, 0);
        notifier.close_ledger(1);
        assert!(matches!(
            watch.try_recv(),
            Err(StorageError::Interrupted(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_can_be_awaited() {
        let notifier = LacNotifier::new();
        let watch = notifier.subscribe(9, 0, 0);
        let task = tokio::spawn(watch);
        notifier.notify(9, 1);
        assert_eq!(task.await.unwrap().unwrap(), 1);
    }
}
