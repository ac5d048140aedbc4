//! Replicated project document built on Automerge
//!
//! A project document holds four top-level maps (surfaces, scenes, layers,
//! assets). Each map entry is one entity, serialized to JSON and stored as a
//! single scalar value, so concurrent writes to the same entity resolve
//! whole-entity by causal order (ties broken deterministically by actor id)
//! while writes to different entities merge independently.
//!
//! Every replica starts from the same genesis change: a fixed actor id at
//! time zero creating the four maps. This way the map object ids agree across
//! replicas that have never exchanged a byte, and map creation itself can
//! never conflict.

use automerge::transaction::{CommitOptions, Transactable};
use automerge::{ActorId, AutoCommit, Automerge, ChangeHash, ObjId, ObjType, ReadDoc, ROOT};
use automerge::{Patch, PatchAction};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Entity, EntityKind};

/// Actor id of the shared genesis change. Never used for real edits.
const GENESIS_ACTOR: &[u8] = b"lumen-genesis";

/// Length of one encoded change hash inside a state vector.
const HASH_LEN: usize = 32;

/// Errors from document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    /// Automerge operation failed
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    /// Entity JSON could not be produced or parsed
    #[error("Entity serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value was not the expected scalar string
    #[error("Invalid value under {kind}/{id}: expected a JSON string")]
    InvalidValue { kind: EntityKind, id: String },

    /// An entity's tag does not match the map it was addressed to
    #[error("Entity kind mismatch: value tagged {actual} stored under {expected}")]
    KindMismatch {
        expected: EntityKind,
        actual: EntityKind,
    },

    /// A state vector's bytes were malformed
    #[error("Malformed state vector: {0}")]
    BadStateVector(String),
}

/// Per-map set of keys touched by a batch of changes.
pub type ChangedKeys = BTreeMap<EntityKind, BTreeSet<String>>;

/// The CRDT document for one project.
///
/// Not thread-safe by itself; [`crate::registry::DocHandle`] wraps it in a
/// mutex and adds change fan-out.
pub struct SharedDocument {
    doc: AutoCommit,
    maps: [ObjId; 4],
}

impl SharedDocument {
    /// Create a fresh replica: genesis change plus a random actor for edits.
    pub fn new() -> Self {
        let mut doc = AutoCommit::new().with_actor(ActorId::from(GENESIS_ACTOR.to_vec()));

        let mut maps = Vec::with_capacity(4);
        for kind in EntityKind::ALL {
            let id = doc
                .put_object(ROOT, kind.map_name(), ObjType::Map)
                .expect("Failed to create entity map");
            maps.push(id);
        }
        let maps: [ObjId; 4] = maps.try_into().expect("exactly four entity maps");

        // Deterministic genesis: same actor, same ops, time zero.
        doc.commit_with(CommitOptions::default().with_time(0));
        // Real edits happen under a per-replica actor.
        doc.set_actor(ActorId::from(Uuid::new_v4().as_bytes().to_vec()));
        // The genesis change is not part of any delta or notification.
        let _ = doc.save();
        doc.update_diff_cursor();

        Self { doc, maps }
    }

    fn map(&self, kind: EntityKind) -> &ObjId {
        &self.maps[kind.index()]
    }

    fn kind_of(&self, obj: &ObjId) -> Option<EntityKind> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|kind| self.map(*kind) == obj)
    }

    /// Store an entity under its id in the map matching its kind.
    pub fn put(&mut self, entity: &Entity) -> Result<(), DocumentError> {
        let value = serde_json::to_value(entity)?;
        self.put_value(entity.kind(), entity.id(), &value)
    }

    /// Store a raw JSON value under `id` in the given map.
    ///
    /// The value is written as-is; shape validation happens when typed
    /// readers parse it back out.
    pub fn put_value(
        &mut self,
        kind: EntityKind,
        id: &str,
        value: &JsonValue,
    ) -> Result<(), DocumentError> {
        let text = serde_json::to_string(value)?;
        let obj = self.map(kind).clone();
        self.doc.put(&obj, id, text)?;
        Ok(())
    }

    /// Remove an entity. Removing an absent id is a no-op.
    pub fn remove(&mut self, kind: EntityKind, id: &str) -> Result<bool, DocumentError> {
        let obj = self.map(kind).clone();
        if self.doc.get(&obj, id)?.is_none() {
            return Ok(false);
        }
        self.doc.delete(&obj, id)?;
        Ok(true)
    }

    /// Read one entry as raw JSON.
    pub fn get_value(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<JsonValue>, DocumentError> {
        let obj = self.map(kind);
        match self.doc.get(obj, id)? {
            None => Ok(None),
            Some((value, _)) => {
                let text = value.to_str().ok_or_else(|| DocumentError::InvalidValue {
                    kind,
                    id: id.to_string(),
                })?;
                Ok(Some(serde_json::from_str(text)?))
            }
        }
    }

    /// Read one entry as a typed entity, checking the kind tag.
    pub fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>, DocumentError> {
        match self.get_value(kind, id)? {
            None => Ok(None),
            Some(value) => {
                let entity: Entity = serde_json::from_value(value)?;
                if entity.kind() != kind {
                    return Err(DocumentError::KindMismatch {
                        expected: kind,
                        actual: entity.kind(),
                    });
                }
                Ok(Some(entity))
            }
        }
    }

    /// All keys currently present in a map.
    pub fn keys(&self, kind: EntityKind) -> Vec<String> {
        self.doc.keys(self.map(kind)).collect()
    }

    /// Full contents of a map as raw JSON, keyed by id.
    ///
    /// Entries that fail to parse are skipped with a warning; one bad entry
    /// never hides the rest of the collection.
    pub fn collection(&self, kind: EntityKind) -> BTreeMap<String, JsonValue> {
        let mut out = BTreeMap::new();
        for id in self.keys(kind) {
            match self.get_value(kind, &id) {
                Ok(Some(value)) => {
                    out.insert(id, value);
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(%kind, %id, %error, "skipping unreadable entry");
                }
            }
        }
        out
    }

    /// Full contents of a map as typed entities, keyed by id.
    ///
    /// Entries that fail to parse or carry the wrong kind tag are skipped
    /// with a warning.
    pub fn typed_collection(&self, kind: EntityKind) -> BTreeMap<String, Entity> {
        let mut out = BTreeMap::new();
        for id in self.keys(kind) {
            match self.get(kind, &id) {
                Ok(Some(entity)) => {
                    out.insert(id, entity);
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(%kind, %id, %error, "skipping invalid entity");
                }
            }
        }
        out
    }

    /// Commit pending operations and return them as one update.
    ///
    /// Empty when nothing changed since the last delta was taken.
    pub fn take_delta(&mut self) -> Vec<u8> {
        self.doc.commit();
        self.doc.save_incremental()
    }

    /// Fold everything since the last call into per-map changed-key sets.
    pub fn take_changes(&mut self) -> ChangedKeys {
        let patches: Vec<Patch> = self.doc.diff_incremental();
        let mut changed: ChangedKeys = BTreeMap::new();
        for patch in &patches {
            let Some(kind) = self.kind_of(&patch.obj) else {
                continue;
            };
            let key = match &patch.action {
                PatchAction::PutMap { key, .. } => Some(key.clone()),
                PatchAction::DeleteMap { key, .. } => Some(key.clone()),
                _ => None,
            };
            if let Some(key) = key {
                changed.entry(kind).or_default().insert(key);
            }
        }
        changed
    }

    /// Merge an encoded update into this replica.
    ///
    /// Idempotent and commutative. Malformed bytes fail the call without
    /// touching already-merged state.
    pub fn apply_bytes(&mut self, bytes: &[u8]) -> Result<(), DocumentError> {
        // load_incremental skips chunks it cannot parse; validate strictly
        // first so malformed bytes fail the call instead of vanishing.
        Automerge::load(bytes)?;
        self.doc.load_incremental(bytes)?;
        // Remote changes are not part of this replica's next outgoing delta;
        // transports forward the received bytes themselves.
        let _ = self.doc.save_incremental();
        Ok(())
    }

    /// Compact snapshot of the whole document.
    pub fn snapshot(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Encode this replica's heads as an opaque state vector.
    pub fn encode_state_vector(&mut self) -> Vec<u8> {
        let heads = self.doc.get_heads();
        let mut out = Vec::with_capacity(heads.len() * HASH_LEN);
        for head in heads {
            out.extend_from_slice(head.0.as_ref());
        }
        out
    }

    /// Everything this replica has that a peer with the given state vector
    /// is missing, as one update.
    pub fn update_since(&mut self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let heads = decode_state_vector(state_vector)?;
        // Heads this replica has never seen cannot anchor the delta; drop
        // them so the peer still receives everything it is missing.
        let known: Vec<ChangeHash> = heads
            .into_iter()
            .filter(|h| self.doc.get_change_by_hash(h).is_some())
            .collect();
        let mut out = Vec::new();
        for change in self.doc.get_changes(&known) {
            out.extend_from_slice(change.raw_bytes().as_ref());
        }
        Ok(out)
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a state vector back into change hashes.
pub fn decode_state_vector(bytes: &[u8]) -> Result<Vec<ChangeHash>, DocumentError> {
    if bytes.len() % HASH_LEN != 0 {
        return Err(DocumentError::BadStateVector(format!(
            "length {} is not a multiple of {}",
            bytes.len(),
            HASH_LEN
        )));
    }
    bytes
        .chunks_exact(HASH_LEN)
        .map(|chunk| {
            ChangeHash::try_from(chunk)
                .map_err(|e| DocumentError::BadStateVector(e.to_string()))
        })
        .collect()
}
