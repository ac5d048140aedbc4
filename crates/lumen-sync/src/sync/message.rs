//! Sync protocol message types
//!
//! One message shape for every transport (in-process bus, websocket relay),
//! CBOR encoded. Each message carries the sender's origin id so receivers can
//! discard their own frames.

use serde::{Deserialize, Serialize};

/// Messages exchanged between replicas
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncMessage {
    /// Announce this replica's state vector so peers can compute what it is
    /// missing
    #[serde(rename = "stateVector")]
    StateVector {
        #[serde(rename = "originId")]
        origin_id: String,
        /// Encoded state vector
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },

    /// A document update (one or more encoded changes)
    #[serde(rename = "update")]
    Update {
        #[serde(rename = "originId")]
        origin_id: String,
        /// Encoded update bytes
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },

    /// Reserved for ephemeral presence payloads. Relayed but never applied
    /// to the document; no current receiver interprets it.
    #[serde(rename = "presence")]
    Presence {
        #[serde(rename = "originId")]
        origin_id: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

impl SyncMessage {
    pub fn state_vector(origin_id: &str, data: Vec<u8>) -> Self {
        SyncMessage::StateVector {
            origin_id: origin_id.to_string(),
            data,
        }
    }

    pub fn update(origin_id: &str, data: Vec<u8>) -> Self {
        SyncMessage::Update {
            origin_id: origin_id.to_string(),
            data,
        }
    }

    /// The sender's origin id, whatever the message kind.
    pub fn origin_id(&self) -> &str {
        match self {
            SyncMessage::StateVector { origin_id, .. }
            | SyncMessage::Update { origin_id, .. }
            | SyncMessage::Presence { origin_id, .. } => origin_id,
        }
    }

    /// Encode message to CBOR bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).expect("CBOR encoding failed");
        bytes
    }

    /// Decode message from CBOR bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(bytes)
    }
}
