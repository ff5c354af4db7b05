//! Document store: concurrent keyed documents with per-document locking and change observers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::document::Document;
use crate::merge::{merge_into, MergeOutcome};
use crate::protocol::Message;
use crate::value::{validate_fields, Fields, ValueError};
use crate::wire::{encode_frame, FrameEncodeError};

type DocKey = (String, String);

/// Identifies one observer registration.
pub type SubscriptionId = u64;

/// Where a change came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote(String),
}

/// Emitted after a document was inserted, updated locally, or changed by a remote merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub collection: String,
    pub doc_id: String,
    pub origin: ChangeOrigin,
}

/// Observer registration handle. Events arrive on `events` (async `recv` or `try_recv`);
/// dropping it unsubscribes lazily.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: UnboundedReceiver<ChangeEvent>,
}

struct Observer {
    id: SubscriptionId,
    collection: Option<String>,
    tx: UnboundedSender<ChangeEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("collection name must be non-empty")]
    EmptyCollection,
    #[error("document id must be non-empty")]
    EmptyDocId,
    #[error("document {collection}/{doc_id} not found")]
    NotFound { collection: String, doc_id: String },
    #[error("invalid fields: {0}")]
    InvalidFields(#[from] ValueError),
    #[error("document {collection}/{doc_id} would exceed the 16 MiB frame limit")]
    TooLarge { collection: String, doc_id: String },
}

/// Owns every document. Sessions and local writers only propose merges.
pub struct DocumentStore {
    local_peer: String,
    docs: RwLock<HashMap<DocKey, Arc<Mutex<Document>>>>,
    observers: Mutex<Vec<Observer>>,
    next_subscription: AtomicU64,
}

impl DocumentStore {
    pub fn new(local_peer: impl Into<String>) -> Self {
        Self {
            local_peer: local_peer.into(),
            docs: RwLock::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn local_peer(&self) -> &str {
        &self.local_peer
    }

    /// Insert a new document authored by the local peer. Returns the assigned id.
    pub fn insert(&self, collection: &str, fields: Fields) -> Result<String, StoreError> {
        check_collection(collection)?;
        validate_fields(&fields)?;
        let doc_id = uuid::Uuid::new_v4().to_string();
        let mut doc = Document::empty(collection, doc_id.clone());
        doc.fields = fields;
        doc.version.increment(&self.local_peer);
        check_frame_size(&doc)?;
        self.write_docs()
            .insert(key(collection, &doc_id), Arc::new(Mutex::new(doc)));
        self.notify(ChangeEvent {
            collection: collection.to_string(),
            doc_id: doc_id.clone(),
            origin: ChangeOrigin::Local,
        });
        Ok(doc_id)
    }

    /// Replace a document's fields locally. Bumps the local peer's counter and goes through merge.
    pub fn update(&self, collection: &str, doc_id: &str, fields: Fields) -> Result<(), StoreError> {
        validate_fields(&fields)?;
        let slot = self
            .slot(collection, doc_id)
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                doc_id: doc_id.to_string(),
            })?;
        {
            let mut doc = lock(&slot);
            let mut version = doc.version.clone();
            version.increment(&self.local_peer);
            let mut next = doc.clone();
            merge_into(&mut next, &fields, &version);
            check_frame_size(&next)?;
            *doc = next;
        }
        self.notify(ChangeEvent {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            origin: ChangeOrigin::Local,
        });
        Ok(())
    }

    /// Merge a snapshot received from `from_peer`. Get-or-create and merge are atomic per document.
    pub fn apply_remote(&self, remote: &Document, from_peer: &str) -> Result<MergeOutcome, StoreError> {
        check_collection(&remote.collection)?;
        if remote.doc_id.is_empty() {
            return Err(StoreError::EmptyDocId);
        }
        validate_fields(&remote.fields)?;
        if remote.version.is_empty() {
            return Ok(MergeOutcome::Unchanged);
        }

        let k = key(&remote.collection, &remote.doc_id);
        let existing = self.read_docs().get(&k).cloned();
        let (slot, fresh) = match existing {
            Some(slot) => (slot, false),
            None => {
                let mut docs = self.write_docs();
                let mut fresh = false;
                let slot = docs
                    .entry(k)
                    .or_insert_with(|| {
                        fresh = true;
                        Arc::new(Mutex::new(Document::empty(
                            remote.collection.clone(),
                            remote.doc_id.clone(),
                        )))
                    })
                    .clone();
                (slot, fresh)
            }
        };

        let outcome = {
            let mut doc = lock(&slot);
            match merge_into(&mut doc, &remote.fields, &remote.version) {
                MergeOutcome::Updated if fresh => MergeOutcome::Created,
                other => other,
            }
        };

        if outcome.changed() {
            debug!(
                collection = %remote.collection,
                doc_id = %remote.doc_id,
                peer_id = %from_peer,
                ?outcome,
                "merged remote document"
            );
            self.notify(ChangeEvent {
                collection: remote.collection.clone(),
                doc_id: remote.doc_id.clone(),
                origin: ChangeOrigin::Remote(from_peer.to_string()),
            });
        }
        Ok(outcome)
    }

    pub fn get(&self, collection: &str, doc_id: &str) -> Option<Document> {
        self.slot(collection, doc_id).map(|slot| lock(&slot).clone())
    }

    /// All documents in `collection`, ordered by id.
    pub fn query(&self, collection: &str) -> Vec<Document> {
        let slots: Vec<_> = self
            .read_docs()
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|(_, slot)| slot.clone())
            .collect();
        let mut out: Vec<Document> = slots.iter().map(|s| lock(s).clone()).collect();
        out.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        out
    }

    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_docs().keys().map(|(c, _)| c.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Copy of every document, used by a session's push.
    pub fn snapshot(&self) -> Vec<Document> {
        let slots: Vec<_> = self.read_docs().values().cloned().collect();
        let mut out: Vec<Document> = slots.iter().map(|s| lock(s).clone()).collect();
        out.sort_by(|a, b| (&a.collection, &a.doc_id).cmp(&(&b.collection, &b.doc_id)));
        out
    }

    pub fn len(&self) -> usize {
        self.read_docs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to changes in one collection, or all when `collection` is `None`.
    pub fn observe(&self, collection: Option<&str>) -> Subscription {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, events) = unbounded_channel();
        lock(&self.observers).push(Observer {
            id,
            collection: collection.map(str::to_string),
            tx,
        });
        Subscription { id, events }
    }

    /// Returns false if no such subscription existed.
    pub fn remove_observer(&self, id: SubscriptionId) -> bool {
        let mut observers = lock(&self.observers);
        let before = observers.len();
        observers.retain(|o| o.id != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.observers).len()
    }

    // Called with no document lock held. Observers whose receiver is gone are dropped.
    fn notify(&self, event: ChangeEvent) {
        let mut observers = lock(&self.observers);
        observers.retain(|o| {
            let wanted = o
                .collection
                .as_deref()
                .map_or(true, |c| c == event.collection);
            !wanted || o.tx.send(event.clone()).is_ok()
        });
    }

    fn slot(&self, collection: &str, doc_id: &str) -> Option<Arc<Mutex<Document>>> {
        self.read_docs().get(&key(collection, doc_id)).cloned()
    }

    fn read_docs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<DocKey, Arc<Mutex<Document>>>> {
        self.docs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_docs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<DocKey, Arc<Mutex<Document>>>> {
        self.docs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn key(collection: &str, doc_id: &str) -> DocKey {
    (collection.to_string(), doc_id.to_string())
}

fn check_collection(collection: &str) -> Result<(), StoreError> {
    if collection.is_empty() {
        Err(StoreError::EmptyCollection)
    } else {
        Ok(())
    }
}

// Every stored document must fit in one sync frame or no peer could ever receive it.
fn check_frame_size(doc: &Document) -> Result<(), StoreError> {
    match encode_frame(&Message::sync_diff(doc)) {
        Err(FrameEncodeError::TooLarge) => Err(StoreError::TooLarge {
            collection: doc.collection.clone(),
            doc_id: doc.doc_id.clone(),
        }),
        _ => Ok(()),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
