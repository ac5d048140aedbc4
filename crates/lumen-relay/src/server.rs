//! Room-based websocket relay
//!
//! Each room (one per project, named by the request path) holds its own
//! document replica plus a fan-out channel for the frames its clients send.
//! Keeping a replica means the relay can answer a joining client's state
//! vector by itself, so clients catch up even when the peers they missed
//! have long since disconnected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{info, warn};

use lumen_sync::registry::{DocHandle, Origin};
use lumen_sync::sync::SyncMessage;

/// Capacity of each room's fan-out channel.
const ROOM_CAPACITY: usize = 256;

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;

/// One client frame fanned out within a room, tagged with the connection
/// it arrived on so that connection can skip its own echo.
#[derive(Clone)]
struct RoomFrame {
    from: u64,
    bytes: Vec<u8>,
}

/// A room: the relay's replica for one project and its fan-out channel.
struct Room {
    handle: Arc<DocHandle>,
    origin: Origin,
    frames_tx: broadcast::Sender<RoomFrame>,
}

impl Room {
    fn new(room_id: &str) -> Arc<Self> {
        let (frames_tx, _) = broadcast::channel(ROOM_CAPACITY);
        Arc::new(Self {
            handle: DocHandle::new(room_id),
            origin: Origin::generate("relay"),
            frames_tx,
        })
    }
}

/// Accepts websocket connections and relays sync frames within rooms.
///
/// Rooms are created on first join and kept for the lifetime of the server,
/// so a project's state survives everyone leaving.
#[derive(Default)]
pub struct RelayServer {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    next_conn_id: AtomicU64,
}

impl RelayServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Accept connections until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "relay listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(error) = server.handle_connection(stream).await {
                    warn!(%peer, %error, "connection ended with error");
                }
            });
        }
    }

    fn room(&self, room_id: &str) -> Arc<Room> {
        let mut rooms = self.rooms.lock().expect("room table lock poisoned");
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id))
            .clone()
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        // The request path names the room, e.g. `/project-1`
        let mut path = String::from("/");
        let ws = accept_hdr_async(stream, |request: &Request, response: Response| {
            path = request.uri().path().to_string();
            Ok(response)
        })
        .await?;

        let room_id = match path.trim_matches('/') {
            "" => "default".to_string(),
            trimmed => trimmed.to_string(),
        };
        let room = self.room(&room_id);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        info!(room = %room_id, conn_id, "client joined");

        let mut room_frames = room.frames_tx.subscribe();
        let (mut write, mut read) = ws.split();

        // Offer the room's state first; the client answers with whatever
        // the room is missing.
        let hello = SyncMessage::state_vector(room.origin.as_str(), room.handle.encode_state_vector());
        write.send(Message::Binary(hello.encode())).await?;

        loop {
            tokio::select! {
                frame = room_frames.recv() => {
                    match frame {
                        Ok(frame) => {
                            if frame.from != conn_id {
                                write.send(Message::Binary(frame.bytes)).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // The client missed frames; ship the room's full
                            // state instead of chasing them.
                            warn!(room = %room_id, conn_id, skipped, "fan-out lagged; sending full update");
                            if let Ok(full) = room.handle.encode_update_since(&[]) {
                                let msg = SyncMessage::update(room.origin.as_str(), full);
                                write.send(Message::Binary(msg.encode())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            self.handle_frame(&room, conn_id, &mut write, &data).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(error)) => {
                            info!(room = %room_id, conn_id, %error, "client left");
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }

        info!(room = %room_id, conn_id, "client left");
        Ok(())
    }

    async fn handle_frame(
        &self,
        room: &Room,
        conn_id: u64,
        write: &mut WsWriter,
        raw: &[u8],
    ) -> Result<()> {
        let message = match SyncMessage::decode(raw) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "discarding malformed client frame");
                return Ok(());
            }
        };

        if message.origin_id() == room.origin.as_str() {
            return Ok(());
        }

        match message {
            SyncMessage::StateVector { data, .. } => {
                // Answer from the room replica; no need to involve peers
                match room.handle.encode_update_since(&data) {
                    Ok(update) => {
                        let msg = SyncMessage::update(room.origin.as_str(), update);
                        write.send(Message::Binary(msg.encode())).await?;
                    }
                    Err(error) => {
                        warn!(%error, "ignoring bad client state vector");
                    }
                }
            }
            SyncMessage::Update { origin_id, data } => {
                // Merge into the room replica, then forward the original
                // frame so peers see the sender's own origin id
                match room.handle.apply_update(&data, Some(Origin::from(origin_id))) {
                    Ok(()) => {
                        let _ = room.frames_tx.send(RoomFrame {
                            from: conn_id,
                            bytes: raw.to_vec(),
                        });
                    }
                    Err(error) => {
                        warn!(%error, "dropping client update that failed to apply");
                    }
                }
            }
            SyncMessage::Presence { .. } => {
                // Relayed verbatim, never applied
                let _ = room.frames_tx.send(RoomFrame {
                    from: conn_id,
                    bytes: raw.to_vec(),
                });
            }
        }
        Ok(())
    }
}
