use crate::models::{Identity, RecordKind, Snapshot};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub identity: Identity,
    pub kind: RecordKind,
}

/// Cancellation side of a live subscription. Shared between the adapter's
/// registry and the consumer.
#[derive(Debug)]
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    cancelled: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(key: SubscriptionKey, cancelled: Arc<AtomicBool>, task: JoinHandle<()>) -> Self {
        Self {
            key,
            cancelled,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Stops delivery immediately. Calling it again is a no-op.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = match self.task.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
        tracing::debug!(
            identity = %self.key.identity,
            kind = self.key.kind.as_str(),
            "subscription cancelled"
        );
    }
}

/// Consumer side: the latest snapshot plus a way to await the next one.
///
/// Dropping the subscription cancels it.
#[derive(Debug)]
pub struct Subscription<R> {
    handle: Arc<SubscriptionHandle>,
    receiver: watch::Receiver<Snapshot<R>>,
}

impl<R: Clone> Subscription<R> {
    pub(crate) fn new(handle: Arc<SubscriptionHandle>, receiver: watch::Receiver<Snapshot<R>>) -> Self {
        Self { handle, receiver }
    }

    pub fn key(&self) -> &SubscriptionKey {
        self.handle.key()
    }

    pub fn handle(&self) -> Arc<SubscriptionHandle> {
        self.handle.clone()
    }

    pub fn latest(&self) -> Snapshot<R> {
        self.receiver.borrow().clone()
    }

    /// Waits for the next snapshot. Intermediate snapshots that were replaced
    /// before this call observed them are skipped. Returns `None` once the
    /// subscription is cancelled or its producer has stopped.
    pub async fn changed(&mut self) -> Option<Snapshot<R>> {
        if self.handle.is_cancelled() {
            return None;
        }
        match self.receiver.changed().await {
            Ok(()) if !self.handle.is_cancelled() => Some(self.receiver.borrow_and_update().clone()),
            _ => None,
        }
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }
}

impl<R> Drop for Subscription<R> {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}
