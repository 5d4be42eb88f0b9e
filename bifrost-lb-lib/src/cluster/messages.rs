//! Gossip datagram envelope.
//!
//! One JSON-encoded message per UDP datagram. Payloads are bounded by
//! [`MAX_DATAGRAM`]; push batches are split by the sender to stay under
//! it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::state::SyncableState;
use crate::error::{LbError, Result};

/// Conservative bound under the common 64 KiB UDP limit.
pub const MAX_DATAGRAM: usize = 60 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    Ping {
        sender_id: String,
        incarnation: u64,
        seq: u64,
    },
    Ack {
        sender_id: String,
        incarnation: u64,
        seq: u64,
    },
    /// Ask the receiver to probe `target` on the sender's behalf.
    PingReq {
        sender_id: String,
        target: String,
        seq: u64,
    },
    Push {
        sender_id: String,
        states: Vec<SyncableState>,
    },
    Pull {
        sender_id: String,
        digest: HashMap<String, u64>,
    },
    PushPull {
        sender_id: String,
        states: Vec<SyncableState>,
        digest: HashMap<String, u64>,
    },
}

impl GossipMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::Ping { .. } => "ping",
            GossipMessage::Ack { .. } => "ack",
            GossipMessage::PingReq { .. } => "ping_req",
            GossipMessage::Push { .. } => "push",
            GossipMessage::Pull { .. } => "pull",
            GossipMessage::PushPull { .. } => "push_pull",
        }
    }

    pub fn sender_id(&self) -> &str {
        match self {
            GossipMessage::Ping { sender_id, .. }
            | GossipMessage::Ack { sender_id, .. }
            | GossipMessage::PingReq { sender_id, .. }
            | GossipMessage::Push { sender_id, .. }
            | GossipMessage::Pull { sender_id, .. }
            | GossipMessage::PushPull { sender_id, .. } => sender_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| LbError::Internal(format!("gossip encode failed: {e}")))?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(LbError::OperationFailed(format!(
                "gossip message of {} bytes exceeds datagram limit",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| LbError::invalid_param("gossip message", e.to_string()))
    }
}
