//! Document handles, origin tags, and the project registry
//!
//! A [`DocHandle`] is the shared entry point to one project's replicated
//! document: it serializes access through a mutex and fans out two streams,
//! raw encoded updates (for transports) and per-map change batches (for
//! projections). Both carry the origin tag of whoever caused them, which is
//! how providers suppress their own echoes.
//!
//! [`DocumentRegistry`] hands out reference-counted handles keyed by project
//! id; the document and its channels are released when the last handle drops.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::document::{ChangedKeys, DocumentError, SharedDocument};
use crate::models::{Entity, EntityKind};
use serde_json::Value as JsonValue;

/// Capacity of the per-document fan-out channels.
const CHANNEL_CAPACITY: usize = 256;

/// Identifies the component that caused a change, for echo suppression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin(String);

impl Origin {
    /// Random origin tag, e.g. `net-3fa85f64`.
    pub fn generate(prefix: &str) -> Self {
        let id = Uuid::new_v4().to_string();
        Self(format!("{}-{}", prefix, &id[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Origin {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Origin {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One encoded update leaving the document, tagged with its cause.
///
/// `origin` is `None` for direct local mutations.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub bytes: Vec<u8>,
    pub origin: Option<Origin>,
}

/// The keys one batch of changes touched, grouped by map.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub origin: Option<Origin>,
    pub changed: ChangedKeys,
}

/// Shared handle to one project's document.
pub struct DocHandle {
    project_id: String,
    doc: Mutex<SharedDocument>,
    updates_tx: broadcast::Sender<UpdateEvent>,
    changes_tx: broadcast::Sender<ChangeBatch>,
}

impl DocHandle {
    /// Create a fresh replica for the given project.
    pub fn new(project_id: impl Into<String>) -> Arc<Self> {
        let (updates_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (changes_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            project_id: project_id.into(),
            doc: Mutex::new(SharedDocument::new()),
            updates_tx,
            changes_tx,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn doc(&self) -> MutexGuard<'_, SharedDocument> {
        self.doc.lock().expect("document lock poisoned")
    }

    /// Mutate the document in one batch, emitting at most one update and one
    /// change batch.
    pub fn mutate<T>(
        &self,
        f: impl FnOnce(&mut SharedDocument) -> Result<T, DocumentError>,
    ) -> Result<T, DocumentError> {
        self.mutate_inner(None, f)
    }

    /// Like [`DocHandle::mutate`], tagging the batch with an origin so the
    /// caller can recognize its own changes coming back.
    pub fn mutate_as<T>(
        &self,
        origin: Origin,
        f: impl FnOnce(&mut SharedDocument) -> Result<T, DocumentError>,
    ) -> Result<T, DocumentError> {
        self.mutate_inner(Some(origin), f)
    }

    fn mutate_inner<T>(
        &self,
        origin: Option<Origin>,
        f: impl FnOnce(&mut SharedDocument) -> Result<T, DocumentError>,
    ) -> Result<T, DocumentError> {
        let (result, bytes, changed) = {
            let mut doc = self.doc();
            let result = f(&mut doc);
            // Operations performed before an error stay applied; they are
            // part of this batch either way.
            let bytes = doc.take_delta();
            let changed = doc.take_changes();
            (result, bytes, changed)
        };
        if !bytes.is_empty() {
            let _ = self.updates_tx.send(UpdateEvent {
                bytes,
                origin: origin.clone(),
            });
        }
        if !changed.is_empty() {
            let _ = self.changes_tx.send(ChangeBatch { origin, changed });
        }
        result
    }

    /// Merge an encoded update from a transport or storage.
    ///
    /// Idempotent and commutative. The bytes are re-emitted on the update
    /// stream (tagged with `origin`) so other transports can forward them; a
    /// change batch goes out only if the update actually changed something.
    pub fn apply_update(&self, bytes: &[u8], origin: Option<Origin>) -> Result<(), DocumentError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let changed = {
            let mut doc = self.doc();
            doc.apply_bytes(bytes)?;
            doc.take_changes()
        };
        let _ = self.updates_tx.send(UpdateEvent {
            bytes: bytes.to_vec(),
            origin: origin.clone(),
        });
        if !changed.is_empty() {
            let _ = self.changes_tx.send(ChangeBatch { origin, changed });
        }
        Ok(())
    }

    /// This replica's current state vector.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc().encode_state_vector()
    }

    /// Everything a peer at the given state vector is missing.
    pub fn encode_update_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        self.doc().update_since(state_vector)
    }

    /// Compact snapshot of the whole document.
    pub fn snapshot(&self) -> Vec<u8> {
        self.doc().snapshot()
    }

    /// Full contents of one map as raw JSON.
    pub fn collection(&self, kind: EntityKind) -> BTreeMap<String, JsonValue> {
        self.doc().collection(kind)
    }

    /// Full contents of one map as typed entities.
    pub fn typed_collection(&self, kind: EntityKind) -> BTreeMap<String, Entity> {
        self.doc().typed_collection(kind)
    }

    /// Whether a map has no entries.
    pub fn is_empty(&self, kind: EntityKind) -> bool {
        self.doc().keys(kind).is_empty()
    }

    /// Stream of encoded updates leaving this document.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<UpdateEvent> {
        self.updates_tx.subscribe()
    }

    /// Stream of per-map change batches.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeBatch> {
        self.changes_tx.subscribe()
    }

    /// Changed-key notifications for a single map.
    ///
    /// Dropping the receiver unsubscribes. Requires a tokio runtime.
    pub fn observe(self: &Arc<Self>, kind: EntityKind) -> mpsc::UnboundedReceiver<Vec<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut changes = self.subscribe_changes();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(batch) => {
                        if let Some(keys) = batch.changed.get(&kind) {
                            let keys: Vec<String> = keys.iter().cloned().collect();
                            if tx.send(keys).is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%kind, skipped, "observer lagged behind change stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }
}

/// Hands out one shared [`DocHandle`] per project id.
///
/// Handles are reference counted; when every clone for a project has been
/// dropped the entry is released and the next acquire starts a fresh replica.
#[derive(Default)]
pub struct DocumentRegistry {
    docs: Mutex<HashMap<String, Weak<DocHandle>>>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the live handle for a project, creating it if needed.
    pub fn acquire(&self, project_id: &str) -> Arc<DocHandle> {
        let mut docs = self.docs.lock().expect("registry lock poisoned");
        if let Some(existing) = docs.get(project_id).and_then(Weak::upgrade) {
            return existing;
        }
        let handle = DocHandle::new(project_id);
        docs.insert(project_id.to_string(), Arc::downgrade(&handle));
        // Opportunistically drop entries whose documents are gone
        docs.retain(|_, weak| weak.strong_count() > 0);
        handle
    }

    /// Number of projects with at least one live handle.
    pub fn live_count(&self) -> usize {
        let docs = self.docs.lock().expect("registry lock poisoned");
        docs.values().filter(|w| w.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Scene, Surface};

    fn put_surface(handle: &DocHandle, name: &str) -> String {
        let entity: Entity = Surface::new(name).into();
        let id = entity.id().to_string();
        handle.mutate(|doc| doc.put(&entity)).unwrap();
        id
    }

    #[test]
    fn test_origin_format() {
        let origin = Origin::generate("bus");
        assert!(origin.as_str().starts_with("bus-"));
        assert_eq!(origin.as_str().len(), "bus-".len() + 8);
        assert_ne!(Origin::generate("bus"), Origin::generate("bus"));
    }

    #[test]
    fn test_mutate_emits_one_update_and_one_batch() {
        let handle = DocHandle::new("project-1");
        let mut updates = handle.subscribe_updates();
        let mut changes = handle.subscribe_changes();

        handle
            .mutate(|doc| {
                doc.put(&Surface::new("A").into())?;
                doc.put(&Scene::new("Sc").into())?;
                Ok(())
            })
            .unwrap();

        let event = updates.try_recv().unwrap();
        assert!(!event.bytes.is_empty());
        assert!(event.origin.is_none());
        assert!(updates.try_recv().is_err());

        let batch = changes.try_recv().unwrap();
        assert_eq!(batch.changed.len(), 2);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_mutate_as_tags_origin() {
        let handle = DocHandle::new("project-1");
        let mut changes = handle.subscribe_changes();
        let origin = Origin::generate("bridge");

        handle
            .mutate_as(origin.clone(), |doc| doc.put(&Surface::new("A").into()))
            .unwrap();

        let batch = changes.try_recv().unwrap();
        assert_eq!(batch.origin, Some(origin));
    }

    #[test]
    fn test_noop_mutate_emits_nothing() {
        let handle = DocHandle::new("project-1");
        let mut updates = handle.subscribe_updates();
        handle.mutate(|_| Ok(())).unwrap();
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn test_apply_update_reemits_and_notifies() {
        let source = DocHandle::new("project-1");
        let sink = DocHandle::new("project-1");
        let mut source_updates = source.subscribe_updates();
        let mut sink_updates = sink.subscribe_updates();
        let mut sink_changes = sink.subscribe_changes();

        let id = put_surface(&source, "Wall");
        let event = source_updates.try_recv().unwrap();

        let origin = Origin::generate("net");
        sink.apply_update(&event.bytes, Some(origin.clone())).unwrap();

        let forwarded = sink_updates.try_recv().unwrap();
        assert_eq!(forwarded.origin, Some(origin.clone()));
        assert_eq!(forwarded.bytes, event.bytes);

        let batch = sink_changes.try_recv().unwrap();
        assert_eq!(batch.origin, Some(origin));
        assert!(batch.changed[&EntityKind::Surfaces].contains(&id));

        // Applying the same update again changes nothing, so no batch
        sink.apply_update(&event.bytes, None).unwrap();
        let _ = sink_updates.try_recv().unwrap();
        assert!(sink_changes.try_recv().is_err());
    }

    #[test]
    fn test_handshake_over_handles() {
        let a = DocHandle::new("p");
        let b = DocHandle::new("p");
        put_surface(&a, "One");
        put_surface(&a, "Two");
        put_surface(&b, "Three");

        // b announces; a replies with what b is missing
        let reply = a.encode_update_since(&b.encode_state_vector()).unwrap();
        b.apply_update(&reply, None).unwrap();
        assert_eq!(b.collection(EntityKind::Surfaces).len(), 3);

        // and the other direction
        let reply = b.encode_update_since(&a.encode_state_vector()).unwrap();
        a.apply_update(&reply, None).unwrap();
        assert_eq!(a.collection(EntityKind::Surfaces).len(), 3);
    }

    #[tokio::test]
    async fn test_observe_single_map() {
        let handle = DocHandle::new("p");
        let mut surfaces = handle.observe(EntityKind::Surfaces);

        let id = put_surface(&handle, "Watched");
        let keys = surfaces.recv().await.unwrap();
        assert_eq!(keys, vec![id]);

        // Changes to other maps are not delivered
        handle
            .mutate(|doc| doc.put(&Scene::new("Quiet").into()))
            .unwrap();
        put_surface(&handle, "Another");
        let keys = surfaces.recv().await.unwrap();
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_registry_shares_and_releases() {
        let registry = DocumentRegistry::new();
        let first = registry.acquire("project-1");
        let second = registry.acquire("project-1");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.live_count(), 1);

        put_surface(&first, "Persist while held");
        drop(first);
        // Still alive through the second handle
        let held = registry.acquire("project-1");
        assert_eq!(held.collection(EntityKind::Surfaces).len(), 1);

        drop(second);
        drop(held);
        assert_eq!(registry.live_count(), 0);
        let fresh = registry.acquire("project-1");
        assert!(fresh.collection(EntityKind::Surfaces).is_empty());
    }
}
