//! Persistent relay connection
//!
//! Maintains a long-lived WebSocket connection to one relay room (one room
//! per project). Handles reconnection automatically with exponential backoff;
//! the document itself is the offline queue, so the handshake after a
//! reconnect ships everything missed in either direction.

use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::message::SyncMessage;
use super::ProviderStatus;
use crate::config::NetworkConfig;
use crate::registry::{DocHandle, Origin};

/// Commands sent to the provider task
#[derive(Debug, Clone)]
enum NetworkCommand {
    Shutdown,
}

/// Events emitted by the provider task
///
/// Delivery is best effort: if nobody drains the event channel, new events
/// are dropped rather than blocking sync. The status and synced watches
/// always carry the current state.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Connection status changed
    StatusChanged(ProviderStatus),
    /// Document was updated from the relay
    DocumentUpdated,
    /// Error occurred
    Error(String),
}

/// Syncs one document handle with a relay room over websocket.
pub struct NetworkProvider {
    origin: Origin,
    command_tx: mpsc::Sender<NetworkCommand>,
    /// Receive events from the provider task
    pub event_rx: mpsc::Receiver<ProviderEvent>,
    status_rx: watch::Receiver<ProviderStatus>,
    synced_rx: watch::Receiver<bool>,
    task: Option<JoinHandle<()>>,
}

impl NetworkProvider {
    /// Spawn the connection task. It reconnects until shut down.
    pub fn connect(config: NetworkConfig, handle: Arc<DocHandle>) -> Self {
        let origin = Origin::generate("net");
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(ProviderStatus::Disconnected);
        let (synced_tx, synced_rx) = watch::channel(false);

        let task = tokio::spawn(provider_task_loop(
            config,
            handle,
            origin.clone(),
            command_rx,
            event_tx,
            status_tx,
            synced_tx,
        ));

        Self {
            origin,
            command_tx,
            event_rx,
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

    /// Whether the handshake after the latest (re)connect has completed.
    pub fn is_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    pub fn watch_synced(&self) -> watch::Receiver<bool> {
        self.synced_rx.clone()
    }

    /// Ask the task to close the connection and exit, then detach.
    /// Safe to call more than once.
    pub fn destroy(&mut self) {
        let _ = self.command_tx.try_send(NetworkCommand::Shutdown);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for NetworkProvider {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Main provider loop with reconnection
async fn provider_task_loop(
    config: NetworkConfig,
    handle: Arc<DocHandle>,
    origin: Origin,
    mut command_rx: mpsc::Receiver<NetworkCommand>,
    event_tx: mpsc::Sender<ProviderEvent>,
    status_tx: watch::Sender<ProviderStatus>,
    synced_tx: watch::Sender<bool>,
) {
    let mut reconnect_delay = config.initial_reconnect_delay;

    loop {
        let _ = synced_tx.send(false);
        let _ = status_tx.send(ProviderStatus::Connecting);
        let _ = event_tx.try_send(ProviderEvent::StatusChanged(ProviderStatus::Connecting));

        match connect_and_run(
            &config,
            &handle,
            &origin,
            &mut command_rx,
            &event_tx,
            &status_tx,
            &synced_tx,
        )
        .await
        {
            Ok(should_shutdown) => {
                if should_shutdown {
                    let _ = status_tx.send(ProviderStatus::Disconnected);
                    let _ =
                        event_tx.try_send(ProviderEvent::StatusChanged(ProviderStatus::Disconnected));
                    break;
                }
                // Connection closed normally, reset backoff
                reconnect_delay = config.initial_reconnect_delay;
            }
            Err(e) => {
                let _ = status_tx.send(ProviderStatus::Error);
                let _ = event_tx.try_send(ProviderEvent::Error(format!("Connection error: {}", e)));
            }
        }

        let _ = synced_tx.send(false);
        let _ = status_tx.send(ProviderStatus::Disconnected);
        let _ = event_tx.try_send(ProviderEvent::StatusChanged(ProviderStatus::Disconnected));

        // Wait before reconnecting, but check for shutdown command
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {
                // Exponential backoff
                reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay);
            }
            cmd = command_rx.recv() => {
                match cmd {
                    Some(NetworkCommand::Shutdown) | None => break,
                }
            }
        }
    }
}

/// Connect and run until disconnection or shutdown.
///
/// Returns `Ok(true)` when the provider should stop for good.
async fn connect_and_run(
    config: &NetworkConfig,
    handle: &Arc<DocHandle>,
    origin: &Origin,
    command_rx: &mut mpsc::Receiver<NetworkCommand>,
    event_tx: &mpsc::Sender<ProviderEvent>,
    status_tx: &watch::Sender<ProviderStatus>,
    synced_tx: &watch::Sender<bool>,
) -> Result<bool> {
    let url = config.room_url();
    let (ws_stream, _) = connect_async(&url).await?;
    let (mut write, mut read) = ws_stream.split();

    // Fresh subscription per connection: anything missed while offline is
    // already merged into the document and covered by the handshake.
    let mut doc_updates = handle.subscribe_updates();

    let _ = status_tx.send(ProviderStatus::Connected);
    let _ = event_tx.try_send(ProviderEvent::StatusChanged(ProviderStatus::Connected));

    let hello = SyncMessage::state_vector(origin.as_str(), handle.encode_state_vector());
    write.send(Message::Binary(hello.encode())).await?;

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(NetworkCommand::Shutdown) | None => {
                        write.close().await.ok();
                        return Ok(true);
                    }
                }
            }

            event = doc_updates.recv() => {
                match event {
                    Ok(event) => {
                        // Everything except our own applications goes out
                        if event.origin.as_ref() != Some(origin) {
                            let msg = SyncMessage::update(origin.as_str(), event.bytes);
                            write.send(Message::Binary(msg.encode())).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(room = %config.room, skipped, "update stream lagged; sending full update");
                        if let Ok(full) = handle.encode_update_since(&[]) {
                            let msg = SyncMessage::update(origin.as_str(), full);
                            write.send(Message::Binary(msg.encode())).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        write.close().await.ok();
                        return Ok(true);
                    }
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        handle_relay_frame(handle, origin, &mut write, event_tx, synced_tx, &data).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        // Connection closed
                        return Ok(false);
                    }
                    Some(Err(e)) => {
                        return Err(e.into());
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn handle_relay_frame<W>(
    handle: &Arc<DocHandle>,
    origin: &Origin,
    write: &mut W,
    event_tx: &mpsc::Sender<ProviderEvent>,
    synced_tx: &watch::Sender<bool>,
    data: &[u8],
) -> Result<()>
where
    W: futures_util::Sink<Message> + Unpin,
    <W as futures_util::Sink<Message>>::Error: std::error::Error + Send + Sync + 'static,
{
    let message = match SyncMessage::decode(data) {
        Ok(message) => message,
        Err(error) => {
            tracing::warn!(%error, "discarding malformed relay frame");
            return Ok(());
        }
    };

    if message.origin_id() == origin.as_str() {
        return Ok(());
    }

    match message {
        SyncMessage::StateVector { data, .. } => match handle.encode_update_since(&data) {
            Ok(update) => {
                let msg = SyncMessage::update(origin.as_str(), update);
                write.send(Message::Binary(msg.encode())).await?;
            }
            Err(error) => {
                tracing::warn!(%error, "ignoring bad relay state vector");
            }
        },
        SyncMessage::Update { data, .. } => {
            match handle.apply_update(&data, Some(origin.clone())) {
                Ok(()) => {
                    let _ = synced_tx.send(true);
                    let _ = event_tx.try_send(ProviderEvent::DocumentUpdated);
                }
                Err(error) => {
                    tracing::warn!(%error, "failed to apply relay update");
                }
            }
        }
        SyncMessage::Presence { .. } => {
            // Reserved; nothing interprets presence payloads yet
        }
    }
    Ok(())
}
