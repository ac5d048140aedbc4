//! In-process broadcast provider
//!
//! Keeps document replicas in different parts of the same process converged,
//! the way same-origin browser contexts share edits over an ambient channel.
//! Frames are encoded [`SyncMessage`]s on a named topic bus; every provider
//! tags its frames with a random origin id and ignores its own.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::message::SyncMessage;
use super::ProviderStatus;
use crate::registry::{DocHandle, Origin};

/// Capacity of a bus topic.
const BUS_CAPACITY: usize = 256;

/// A named in-process topic carrying encoded sync frames.
///
/// Cloning shares the topic; every provider started on a clone sees every
/// frame sent through any clone.
#[derive(Clone)]
pub struct LocalBus {
    topic: String,
    frames_tx: broadcast::Sender<Vec<u8>>,
}

impl LocalBus {
    /// Create a new topic. Providers for the same project should share one
    /// bus (by cloning), typically named after the project id.
    pub fn new(topic: impl Into<String>) -> Self {
        let (frames_tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            topic: topic.into(),
            frames_tx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn send(&self, frame: Vec<u8>) {
        // No receivers just means nobody is listening yet
        let _ = self.frames_tx.send(frame);
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.frames_tx.subscribe()
    }
}

/// Syncs one document handle over a [`LocalBus`].
pub struct BroadcastProvider {
    origin: Origin,
    status_rx: watch::Receiver<ProviderStatus>,
    synced_rx: watch::Receiver<bool>,
    task: Option<JoinHandle<()>>,
}

impl BroadcastProvider {
    /// Start syncing. Announces this replica's state vector immediately so
    /// peers already on the bus reply with whatever it is missing.
    pub fn start(bus: LocalBus, handle: Arc<DocHandle>) -> Self {
        let origin = Origin::generate("bus");
        let (status_tx, status_rx) = watch::channel(ProviderStatus::Connecting);
        let (synced_tx, synced_rx) = watch::channel(false);

        let task = tokio::spawn(provider_task(
            bus,
            handle,
            origin.clone(),
            status_tx,
            synced_tx,
        ));

        Self {
            origin,
            status_rx,
            synced_rx,
            task: Some(task),
        }
    }

    /// This provider's origin tag.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn status(&self) -> ProviderStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ProviderStatus> {
        self.status_rx.clone()
    }

    /// Whether this provider has completed at least one exchange with a peer
    /// since starting.
    pub fn is_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    pub fn watch_synced(&self) -> watch::Receiver<bool> {
        self.synced_rx.clone()
    }

    /// Stop syncing and detach from the bus. Safe to call more than once.
    pub fn destroy(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for BroadcastProvider {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn provider_task(
    bus: LocalBus,
    handle: Arc<DocHandle>,
    origin: Origin,
    status_tx: watch::Sender<ProviderStatus>,
    synced_tx: watch::Sender<bool>,
) {
    let mut frames = bus.subscribe();
    let mut doc_updates = handle.subscribe_updates();
    let _ = status_tx.send(ProviderStatus::Connected);

    // Peers whose announcements we have already answered with our own;
    // answering only the first keeps announcement exchanges finite.
    let mut seen_peers: HashSet<String> = HashSet::new();

    let hello = SyncMessage::state_vector(origin.as_str(), handle.encode_state_vector());
    bus.send(hello.encode());

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(bytes) => {
                    handle_frame(&bus, &handle, &origin, &synced_tx, &mut seen_peers, &bytes);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(topic = bus.topic(), skipped, "bus receiver lagged; re-announcing");
                    let hello = SyncMessage::state_vector(origin.as_str(), handle.encode_state_vector());
                    bus.send(hello.encode());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = doc_updates.recv() => match event {
                Ok(event) => {
                    // Everything except our own applications goes out
                    if event.origin.as_ref() != Some(&origin) {
                        bus.send(SyncMessage::update(origin.as_str(), event.bytes).encode());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(topic = bus.topic(), skipped, "update stream lagged; sending full update");
                    match handle.encode_update_since(&[]) {
                        Ok(full) => bus.send(SyncMessage::update(origin.as_str(), full).encode()),
                        Err(error) => tracing::warn!(%error, "could not encode full update"),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let _ = status_tx.send(ProviderStatus::Disconnected);
}

fn handle_frame(
    bus: &LocalBus,
    handle: &DocHandle,
    origin: &Origin,
    synced_tx: &watch::Sender<bool>,
    seen_peers: &mut HashSet<String>,
    bytes: &[u8],
) {
    let message = match SyncMessage::decode(bytes) {
        Ok(message) => message,
        Err(error) => {
            tracing::warn!(topic = bus.topic(), %error, "discarding malformed frame");
            return;
        }
    };

    if message.origin_id() == origin.as_str() {
        return;
    }
    let first_contact = seen_peers.insert(message.origin_id().to_string());

    match message {
        SyncMessage::StateVector { data, .. } => {
            match handle.encode_update_since(&data) {
                Ok(update) => {
                    // Empty is fine: it tells the peer it is missing nothing
                    bus.send(SyncMessage::update(origin.as_str(), update).encode());
                }
                Err(error) => {
                    tracing::warn!(topic = bus.topic(), %error, "ignoring bad peer state vector");
                }
            }
            if first_contact {
                // A rejoining peer may hold edits we have never seen; give
                // it our state vector so it sends them over.
                let hello =
                    SyncMessage::state_vector(origin.as_str(), handle.encode_state_vector());
                bus.send(hello.encode());
            }
        }
        SyncMessage::Update { data, .. } => match handle.apply_update(&data, Some(origin.clone()))
        {
            Ok(()) => {
                let _ = synced_tx.send(true);
            }
            Err(error) => {
                tracing::warn!(topic = bus.topic(), %error, "failed to apply peer update");
            }
        },
        SyncMessage::Presence { .. } => {
            // Reserved; nothing interprets presence payloads yet
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, EntityKind, Surface};
    use std::time::Duration;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            if tokio::time::Instant::now() > deadline {
                panic!("condition not reached within deadline");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn put_surface(handle: &DocHandle, name: &str) -> String {
        let entity: Entity = Surface::new(name).into();
        let id = entity.id().to_string();
        handle.mutate(|doc| doc.put(&entity)).unwrap();
        id
    }

    #[tokio::test]
    async fn test_two_contexts_converge() {
        let bus = LocalBus::new("project-1");
        let a = DocHandle::new("project-1");
        let b = DocHandle::new("project-1");
        let _pa = BroadcastProvider::start(bus.clone(), a.clone());
        let _pb = BroadcastProvider::start(bus.clone(), b.clone());

        let id = put_surface(&a, "From A");
        wait_until(|| b.collection(EntityKind::Surfaces).contains_key(&id)).await;

        let id_b = put_surface(&b, "From B");
        wait_until(|| a.collection(EntityKind::Surfaces).contains_key(&id_b)).await;
        assert_eq!(a.collection(EntityKind::Surfaces).len(), 2);
        assert_eq!(b.collection(EntityKind::Surfaces).len(), 2);
    }

    #[tokio::test]
    async fn test_late_joiner_catches_up() {
        let bus = LocalBus::new("project-1");
        let a = DocHandle::new("project-1");
        let _pa = BroadcastProvider::start(bus.clone(), a.clone());
        let s1 = put_surface(&a, "Before join");

        let b = DocHandle::new("project-1");
        let pb = BroadcastProvider::start(bus.clone(), b.clone());
        wait_until(|| b.collection(EntityKind::Surfaces).contains_key(&s1)).await;
        wait_until(|| pb.is_synced()).await;
    }

    #[tokio::test]
    async fn test_rejoin_exchanges_both_directions() {
        let bus = LocalBus::new("project-1");
        let a = DocHandle::new("project-1");
        let b = DocHandle::new("project-1");
        let mut pa = BroadcastProvider::start(bus.clone(), a.clone());
        let _pb = BroadcastProvider::start(bus.clone(), b.clone());

        let s1 = put_surface(&a, "s1");
        wait_until(|| b.collection(EntityKind::Surfaces).contains_key(&s1)).await;

        // A leaves the bus, both sides keep editing
        pa.destroy();
        let s2 = put_surface(&a, "s2 while away");
        let s3 = put_surface(&b, "s3 while a away");

        // A rejoins: the announcement handshake must fill both gaps
        let _pa2 = BroadcastProvider::start(bus.clone(), a.clone());
        wait_until(|| b.collection(EntityKind::Surfaces).contains_key(&s2)).await;
        wait_until(|| a.collection(EntityKind::Surfaces).contains_key(&s3)).await;
    }

    #[tokio::test]
    async fn test_no_echo_loop() {
        let bus = LocalBus::new("project-1");
        let a = DocHandle::new("project-1");
        let b = DocHandle::new("project-1");
        let mut a_changes = a.subscribe_changes();
        let _pa = BroadcastProvider::start(bus.clone(), a.clone());
        let _pb = BroadcastProvider::start(bus.clone(), b.clone());

        let id = put_surface(&a, "Once");
        wait_until(|| b.collection(EntityKind::Surfaces).contains_key(&id)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // a's only change batch is the local mutate; its own update never
        // came back around as an application
        let mut local_batches = 0;
        while let Ok(batch) = a_changes.try_recv() {
            assert_eq!(batch.origin, None);
            local_batches += 1;
        }
        assert_eq!(local_batches, 1);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_survivable() {
        let bus = LocalBus::new("project-1");
        let a = DocHandle::new("project-1");
        let b = DocHandle::new("project-1");
        let _pa = BroadcastProvider::start(bus.clone(), a.clone());
        let _pb = BroadcastProvider::start(bus.clone(), b.clone());

        bus.send(b"not a sync message".to_vec());

        let id = put_surface(&a, "Still works");
        wait_until(|| b.collection(EntityKind::Surfaces).contains_key(&id)).await;
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let bus = LocalBus::new("project-1");
        let a = DocHandle::new("project-1");
        let mut pa = BroadcastProvider::start(bus.clone(), a.clone());
        pa.destroy();
        pa.destroy();
        // And a destroyed provider no longer forwards
        let b = DocHandle::new("project-1");
        let _pb = BroadcastProvider::start(bus.clone(), b.clone());
        put_surface(&a, "after destroy");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(b.collection(EntityKind::Surfaces).is_empty());
    }
}
