//! Reactive store boundary
//!
//! The editor-facing side of the engine: plain typed collections with
//! synchronous subscriber callbacks, the shape a UI state store expects.
//! [`crate::bridge::StoreBridge`] keeps this store and the replicated
//! document reconciled in both directions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::models::{Asset, Entity, EntityKind, Layer, Scene, Surface};

/// Identifies one subscription for later removal.
pub type SubscriptionId = u64;

type Subscriber = Arc<dyn Fn(&StoreState, &StoreState) + Send + Sync>;

/// The store's full contents: one typed map per entity kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
    pub surfaces: BTreeMap<String, Surface>,
    pub scenes: BTreeMap<String, Scene>,
    pub layers: BTreeMap<String, Layer>,
    pub assets: BTreeMap<String, Asset>,
}

impl StoreState {
    /// One collection as tagged entities.
    pub fn collection(&self, kind: EntityKind) -> BTreeMap<String, Entity> {
        match kind {
            EntityKind::Surfaces => wrap(&self.surfaces),
            EntityKind::Scenes => wrap(&self.scenes),
            EntityKind::Layers => wrap(&self.layers),
            EntityKind::Assets => wrap(&self.assets),
        }
    }

    pub fn is_empty(&self, kind: EntityKind) -> bool {
        match kind {
            EntityKind::Surfaces => self.surfaces.is_empty(),
            EntityKind::Scenes => self.scenes.is_empty(),
            EntityKind::Layers => self.layers.is_empty(),
            EntityKind::Assets => self.assets.is_empty(),
        }
    }
}

fn wrap<T: Clone + Into<Entity>>(map: &BTreeMap<String, T>) -> BTreeMap<String, Entity> {
    map.iter()
        .map(|(id, value)| (id.clone(), value.clone().into()))
        .collect()
}

/// Typed collections with synchronous change notifications.
///
/// Subscribers run on the mutating thread, after the state lock is released,
/// and receive the state before and after the mutation. Mutations that leave
/// the state unchanged notify nobody.
#[derive(Default)]
pub struct ReactiveStore {
    state: Mutex<StoreState>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_id: AtomicU64,
}

impl ReactiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the full state.
    pub fn state(&self) -> StoreState {
        self.state.lock().expect("store lock poisoned").clone()
    }

    pub fn surfaces(&self) -> BTreeMap<String, Surface> {
        self.state().surfaces
    }

    pub fn scenes(&self) -> BTreeMap<String, Scene> {
        self.state().scenes
    }

    pub fn layers(&self) -> BTreeMap<String, Layer> {
        self.state().layers
    }

    pub fn assets(&self) -> BTreeMap<String, Asset> {
        self.state().assets
    }

    /// Apply one mutation and notify subscribers if anything changed.
    pub fn update(&self, f: impl FnOnce(&mut StoreState)) {
        let (old, new) = {
            let mut state = self.state.lock().expect("store lock poisoned");
            let old = state.clone();
            f(&mut state);
            (old, state.clone())
        };
        if old != new {
            self.notify(&old, &new);
        }
    }

    /// Replace the surfaces collection.
    pub fn set_surfaces(&self, surfaces: BTreeMap<String, Surface>) {
        self.update(|state| state.surfaces = surfaces);
    }

    /// Replace the scenes collection.
    pub fn set_scenes(&self, scenes: BTreeMap<String, Scene>) {
        self.update(|state| state.scenes = scenes);
    }

    /// Replace the layers collection.
    pub fn set_layers(&self, layers: BTreeMap<String, Layer>) {
        self.update(|state| state.layers = layers);
    }

    /// Replace the assets collection.
    pub fn set_assets(&self, assets: BTreeMap<String, Asset>) {
        self.update(|state| state.assets = assets);
    }

    /// Replace one collection from tagged entities.
    ///
    /// Entities tagged with a different kind than the collection they were
    /// addressed to are skipped with a warning.
    pub fn set_collection(&self, kind: EntityKind, entities: BTreeMap<String, Entity>) {
        self.update(|state| {
            match kind {
                EntityKind::Surfaces => state.surfaces.clear(),
                EntityKind::Scenes => state.scenes.clear(),
                EntityKind::Layers => state.layers.clear(),
                EntityKind::Assets => state.assets.clear(),
            }
            for (id, entity) in entities {
                match (kind, entity) {
                    (EntityKind::Surfaces, Entity::Surface(s)) => {
                        state.surfaces.insert(id, s);
                    }
                    (EntityKind::Scenes, Entity::Scene(s)) => {
                        state.scenes.insert(id, s);
                    }
                    (EntityKind::Layers, Entity::Layer(l)) => {
                        state.layers.insert(id, l);
                    }
                    (EntityKind::Assets, Entity::Asset(a)) => {
                        state.assets.insert(id, a);
                    }
                    (kind, entity) => {
                        tracing::warn!(
                            %kind,
                            actual = %entity.kind(),
                            %id,
                            "skipping entity with mismatched kind"
                        );
                    }
                }
            }
        });
    }

    /// Insert or replace one entity in its kind's collection.
    pub fn insert(&self, entity: Entity) {
        self.update(|state| match entity {
            Entity::Surface(s) => {
                state.surfaces.insert(s.id.clone(), s);
            }
            Entity::Scene(s) => {
                state.scenes.insert(s.id.clone(), s);
            }
            Entity::Layer(l) => {
                state.layers.insert(l.id.clone(), l);
            }
            Entity::Asset(a) => {
                state.assets.insert(a.id.clone(), a);
            }
        });
    }

    /// Remove one entity. Removing an absent id is a no-op.
    pub fn remove(&self, kind: EntityKind, id: &str) {
        self.update(|state| match kind {
            EntityKind::Surfaces => {
                state.surfaces.remove(id);
            }
            EntityKind::Scenes => {
                state.scenes.remove(id);
            }
            EntityKind::Layers => {
                state.layers.remove(id);
            }
            EntityKind::Assets => {
                state.assets.remove(id);
            }
        });
    }

    /// Register a callback invoked after every effective mutation.
    pub fn subscribe(
        &self,
        callback: impl Fn(&StoreState, &StoreState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .retain(|(sub_id, _)| *sub_id != id);
    }

    fn notify(&self, old: &StoreState, new: &StoreState) {
        // Snapshot outside the callbacks so a subscriber can mutate the
        // store (a layered update) without deadlocking
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for subscriber in subscribers {
            subscriber(old, new);
        }
    }
}
