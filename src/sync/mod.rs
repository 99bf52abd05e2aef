pub mod decode;
pub mod subscription;

pub use decode::Record;
pub use subscription::{Subscription, SubscriptionHandle, SubscriptionKey};

use crate::db::{ChangeNotice, DocumentStore};
use crate::errors::{AppError, AppResult};
use crate::models::{CollectionPath, Identity, Snapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

/// Turns store change notices into typed snapshots, one live subscription per
/// (identity, kind).
#[derive(Clone)]
pub struct SyncAdapter {
    store: Arc<dyn DocumentStore>,
    app_id: String,
    active: Arc<Mutex<HashMap<SubscriptionKey, Arc<SubscriptionHandle>>>>,
    next_subscription: Arc<AtomicU64>,
}

impl SyncAdapter {
    pub fn new(store: Arc<dyn DocumentStore>, app_id: impl Into<String>) -> Self {
        Self {
            store,
            app_id: app_id.into(),
            active: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Opens a live subscription. Must be called from within a tokio runtime.
    ///
    /// Any existing subscription for the same identity and kind is cancelled
    /// first. When the initial query fails no snapshot is produced and the
    /// error is returned.
    pub fn subscribe<R: Record>(&self, identity: &Identity) -> AppResult<Subscription<R>> {
        let key = SubscriptionKey {
            identity: identity.clone(),
            kind: R::KIND,
        };
        let mut active = self
            .active
            .lock()
            .map_err(|_| AppError::Internal("subscription registry poisoned".to_string()))?;
        active.retain(|_, handle| !handle.is_cancelled());
        if let Some(previous) = active.remove(&key) {
            previous.cancel();
        }

        let path = CollectionPath::new(&self.app_id, identity, R::KIND);
        // Listen before the initial read so no write can fall between the two.
        let changes = self.store.changes();
        let records = materialize::<R>(self.store.as_ref(), &path, identity).map_err(|error| {
            tracing::warn!(
                identity = %identity,
                kind = R::KIND.as_str(),
                error = %error,
                "subscription setup failed"
            );
            AppError::Subscription(format!("{} subscription for {}: {}", R::KIND.as_str(), identity, error))
        })?;

        let subscription = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let initial = Snapshot::new(identity.clone(), 1, records).from_subscription(subscription);
        let (sender, receiver) = watch::channel(initial);
        let cancelled = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(pump::<R>(
            self.store.clone(),
            path,
            identity.clone(),
            subscription,
            sender,
            changes,
            cancelled.clone(),
        ));

        let handle = Arc::new(SubscriptionHandle::new(key.clone(), cancelled, task));
        active.insert(key, handle.clone());
        tracing::debug!(identity = %identity, kind = R::KIND.as_str(), "subscription established");

        Ok(Subscription::new(handle, receiver))
    }

    /// One-off read of the current records without opening a subscription.
    /// The snapshot carries revision 0.
    pub fn fetch<R: Record>(&self, identity: &Identity) -> AppResult<Snapshot<R>> {
        let path = CollectionPath::new(&self.app_id, identity, R::KIND);
        let records = materialize::<R>(self.store.as_ref(), &path, identity)?;
        Ok(Snapshot::new(identity.clone(), 0, records))
    }

    pub fn cancel(&self, key: &SubscriptionKey) {
        let handle = match self.active.lock() {
            Ok(mut active) => active.remove(key),
            Err(poisoned) => poisoned.into_inner().remove(key),
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// Tears down every live subscription, whatever its identity.
    pub fn cancel_all(&self) {
        let handles = match self.active.lock() {
            Ok(mut active) => active.drain().map(|(_, handle)| handle).collect::<Vec<_>>(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, handle)| handle).collect(),
        };
        for handle in handles {
            handle.cancel();
        }
    }

    pub fn active_count(&self) -> usize {
        match self.active.lock() {
            Ok(active) => active.values().filter(|handle| !handle.is_cancelled()).count(),
            Err(_) => 0,
        }
    }
}

async fn pump<R: Record>(
    store: Arc<dyn DocumentStore>,
    path: CollectionPath,
    owner: Identity,
    subscription: u64,
    sender: watch::Sender<Snapshot<R>>,
    mut changes: broadcast::Receiver<ChangeNotice>,
    cancelled: Arc<AtomicBool>,
) {
    let mut revision = 1u64;
    loop {
        match changes.recv().await {
            Ok(notice) if notice.path != path => continue,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(path = %path, skipped, "change notices lagged, resyncing");
            }
            Err(RecvError::Closed) => break,
        }
        if cancelled.load(Ordering::SeqCst) {
            break;
        }

        let refreshed = {
            let store = store.clone();
            let path = path.clone();
            let owner = owner.clone();
            tokio::task::spawn_blocking(move || materialize::<R>(store.as_ref(), &path, &owner))
                .await
                .map_err(|error| AppError::Internal(format!("snapshot refresh task failed: {error}")))
                .and_then(|records| records)
        };
        match refreshed {
            Ok(records) => {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                revision += 1;
                let snapshot = Snapshot::new(owner.clone(), revision, records).from_subscription(subscription);
                if sender.send(snapshot).is_err() {
                    break;
                }
            }
            Err(error) => {
                tracing::warn!(
                    identity = %owner,
                    kind = R::KIND.as_str(),
                    error = %error,
                    "snapshot refresh failed, keeping previous snapshot"
                );
            }
        }
    }
}

/// Queries the collection and decodes every document. Malformed documents are
/// skipped so one bad record never blanks the whole snapshot.
fn materialize<R: Record>(store: &dyn DocumentStore, path: &CollectionPath, owner: &Identity) -> AppResult<Vec<R>> {
    let documents = store.query(path, owner)?;
    let mut records = Vec::with_capacity(documents.len());
    for document in &documents {
        match R::decode(document) {
            Ok(record) => records.push(record),
            Err(error) => {
                tracing::warn!(
                    kind = R::KIND.as_str(),
                    document_id = %document.id,
                    error = %error,
                    "skipping malformed document"
                );
            }
        }
    }
    Ok(records)
}
