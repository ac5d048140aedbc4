//! Store bridge
//!
//! Keeps the reactive store and the replicated document reconciled in both
//! directions:
//!
//! - document change batches are projected into the store as full-collection
//!   replacements, under a per-kind reentrancy flag so the bridge's own
//!   store subscription ignores them;
//! - store changes are written back into the document in one tagged batch
//!   (upsert entries whose value differs, delete absent entries), and the
//!   bridge skips document change batches carrying its own origin tag.
//!
//! On startup the bridge waits for persistence replay, then settles each
//! collection: a non-empty document seeds an empty store, a non-empty store
//! fills an empty document, and existing store content is never overwritten.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::models::EntityKind;
use crate::registry::{DocHandle, Origin};
use crate::storage::PersistenceProvider;
use crate::store::{ReactiveStore, StoreState, SubscriptionId};

/// One reentrancy flag per entity kind. A set flag means "the bridge is
/// currently projecting this kind into the store".
#[derive(Default)]
struct KindFlags([AtomicBool; 4]);

impl KindFlags {
    fn set(&self, kind: EntityKind) {
        self.0[kind.index()].store(true, Ordering::SeqCst);
    }

    fn clear(&self, kind: EntityKind) {
        self.0[kind.index()].store(false, Ordering::SeqCst);
    }

    fn is_set(&self, kind: EntityKind) -> bool {
        self.0[kind.index()].load(Ordering::SeqCst)
    }
}

/// Two-way binding between one document handle and one reactive store.
pub struct StoreBridge {
    origin: Origin,
    store: Arc<ReactiveStore>,
    subscription: Option<SubscriptionId>,
    task: Option<JoinHandle<()>>,
}

impl StoreBridge {
    /// Wire up the bridge. Waits for persistence replay first when a
    /// provider is given, so cold-start precedence sees the stored state.
    pub async fn start(
        handle: Arc<DocHandle>,
        store: Arc<ReactiveStore>,
        persistence: Option<&PersistenceProvider>,
    ) -> Self {
        if let Some(persistence) = persistence {
            persistence.ready().await;
        }

        let origin = Origin::generate("bridge");
        let flags = Arc::new(KindFlags::default());

        // Subscribe before seeding; anything arriving in between is
        // projected later, and projection is idempotent.
        let changes = handle.subscribe_changes();

        for kind in EntityKind::ALL {
            let doc_entities = handle.typed_collection(kind);
            let store_empty = store.state().is_empty(kind);
            if !doc_entities.is_empty() && store_empty {
                // Loaded state wins over an empty store
                flags.set(kind);
                store.set_collection(kind, doc_entities);
                flags.clear(kind);
            } else if doc_entities.is_empty() && !store_empty {
                // A store populated before the bridge fills an empty document
                reconcile_into_doc(&handle, &origin, &store.state(), kind);
            }
        }

        let subscription = {
            let handle = handle.clone();
            let flags = flags.clone();
            let origin = origin.clone();
            store.subscribe(move |old, new| {
                for kind in EntityKind::ALL {
                    if !kind_changed(old, new, kind) {
                        continue;
                    }
                    if flags.is_set(kind) {
                        // Our own projection coming back around
                        continue;
                    }
                    reconcile_into_doc(&handle, &origin, new, kind);
                }
            })
        };

        let task = tokio::spawn(project_task(
            handle,
            store.clone(),
            flags,
            origin.clone(),
            changes,
        ));

        Self {
            origin,
            store,
            subscription: Some(subscription),
            task: Some(task),
        }
    }

    /// This bridge's origin tag.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Unhook both directions. Safe to call more than once.
    pub fn destroy(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.store.unsubscribe(subscription);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for StoreBridge {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn kind_changed(old: &StoreState, new: &StoreState, kind: EntityKind) -> bool {
    match kind {
        EntityKind::Surfaces => old.surfaces != new.surfaces,
        EntityKind::Scenes => old.scenes != new.scenes,
        EntityKind::Layers => old.layers != new.layers,
        EntityKind::Assets => old.assets != new.assets,
    }
}

/// Write one store collection into the document: upsert what is present and
/// differs, delete what is absent, all in one tagged batch. Entities that
/// fail to serialize are skipped individually.
fn reconcile_into_doc(handle: &DocHandle, origin: &Origin, state: &StoreState, kind: EntityKind) {
    let want = state.collection(kind);
    let result = handle.mutate_as(origin.clone(), |doc| {
        for (id, entity) in &want {
            match serde_json::to_value(entity) {
                Ok(value) => {
                    if doc.get_value(kind, id)?.as_ref() != Some(&value) {
                        doc.put_value(kind, id, &value)?;
                    }
                }
                Err(error) => {
                    tracing::warn!(%kind, %id, %error, "skipping unserializable entity");
                }
            }
        }
        for id in doc.keys(kind) {
            if !want.contains_key(&id) {
                doc.remove(kind, &id)?;
            }
        }
        Ok(())
    });
    if let Err(error) = result {
        tracing::warn!(%kind, %error, "failed to write store change into document");
    }
}

async fn project_task(
    handle: Arc<DocHandle>,
    store: Arc<ReactiveStore>,
    flags: Arc<KindFlags>,
    origin: Origin,
    mut changes: broadcast::Receiver<crate::registry::ChangeBatch>,
) {
    loop {
        match changes.recv().await {
            Ok(batch) => {
                if batch.origin.as_ref() == Some(&origin) {
                    continue;
                }
                for kind in batch.changed.keys().copied() {
                    project(&handle, &store, &flags, kind);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "change stream lagged; reprojecting everything");
                for kind in EntityKind::ALL {
                    project(&handle, &store, &flags, kind);
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Replace one store collection with the document's current contents.
fn project(handle: &DocHandle, store: &ReactiveStore, flags: &KindFlags, kind: EntityKind) {
    let entities = handle.typed_collection(kind);
    flags.set(kind);
    store.set_collection(kind, entities);
    flags.clear(kind);
}
