//! LumenCanvas Sync Library
//!
//! This crate keeps the state of a LumenCanvas project (surfaces, scenes,
//! layers, assets) converged across editor contexts, a relay server, and
//! durable local storage.
//!
//! # Architecture
//!
//! - **Automerge**: the replicated document is the source of truth; every
//!   transport and the storage layer exchange its updates, which merge
//!   idempotently and commutatively in any order.
//!
//! # Quick Start
//!
//! ```text
//! let registry = DocumentRegistry::new();
//! let handle = registry.acquire("project-1");
//!
//! // Persist locally and bind the editor store
//! let persistence = PersistenceProvider::spawn(&config, "project-1", handle.clone());
//! let store = Arc::new(ReactiveStore::new());
//! let bridge = StoreBridge::start(handle.clone(), store.clone(), Some(&persistence)).await;
//!
//! // Sync with other contexts and the relay
//! let local = BroadcastProvider::start(bus, handle.clone());
//! let remote = NetworkProvider::connect(NetworkConfig::new(relay_url, "project-1"), handle);
//! ```
//!
//! # Modules
//!
//! - `registry`: document handles and the per-project registry (main entry point)
//! - `models`: data structures for surfaces, scenes, layers, and assets
//! - `document`: Automerge document handling
//! - `store`: the reactive store boundary the editor reads and writes
//! - `bridge`: two-way binding between store and document
//! - `sync`: broadcast and network providers
//! - `storage`: SQLite persistence
//! - `config`: engine configuration

pub mod bridge;
pub mod config;
pub mod document;
pub mod models;
pub mod registry;
pub mod storage;
pub mod store;
pub mod sync;

pub use bridge::StoreBridge;
pub use config::{NetworkConfig, SyncConfig};
pub use document::{DocumentError, SharedDocument};
pub use models::{Asset, Entity, EntityKind, Layer, Scene, Surface};
pub use registry::{ChangeBatch, DocHandle, DocumentRegistry, Origin, UpdateEvent};
pub use storage::{PersistenceProvider, StorageError};
pub use store::{ReactiveStore, StoreState};
pub use sync::{BroadcastProvider, LocalBus, NetworkProvider, ProviderStatus, SyncMessage};
