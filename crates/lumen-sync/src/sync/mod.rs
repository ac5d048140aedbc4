//! Sync providers
//!
//! Two transports keep replicas of a project document converged:
//!
//! - [`BroadcastProvider`] bridges documents over an in-process topic bus,
//!   standing in for same-origin contexts of the editor.
//! - [`NetworkProvider`] maintains a persistent websocket connection to a
//!   relay room, reconnecting automatically with exponential backoff.
//!
//! Both speak the same protocol: announce a state vector, answer peer state
//! vectors with exactly the missing update, forward local updates as they
//! happen, and discard frames carrying their own origin id.

mod broadcast;
mod message;
mod network;

pub use broadcast::{BroadcastProvider, LocalBus};
pub use message::SyncMessage;
pub use network::{NetworkProvider, ProviderEvent};

/// Connection state of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    /// Not connected, not trying
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected to peers
    Connected,
    /// Last attempt failed; a reconnect is pending
    Error,
}
