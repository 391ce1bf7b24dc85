use crate::error::Result;
use crate::types::{ParameterState, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Inbound state packet (MessagePack over UDP)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePacket {
    pub session_id: String,
    pub ts: Timestamp,
    #[serde(default)]
    pub state: ParameterState,
}

impl StatePacket {
    /// Decode a single datagram
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let packet = rmp_serde::from_slice(datagram)?;
        Ok(packet)
    }
}

/// State transition produced by the mirror and consumed by the hub
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A new session started; all prior state is void
    Session { session_id: String, ts: Timestamp },

    /// Complete state image
    FullState {
        session_id: String,
        ts: Timestamp,
        state: ParameterState,
    },

    /// Changed parameters; a value of 0 also stands for a parameter that went away
    Delta { ts: Timestamp, changes: ParameterState },
}

/// JSON message pushed to UI clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Session {
        session_id: String,
        ts: Timestamp,
    },
    State {
        session_id: String,
        ts: Timestamp,
        state: ParameterState,
    },
    Diff {
        ts: Timestamp,
        changes: ParameterState,
    },
    Status {
        m4l_connected: bool,
        m4l_last_seen: Timestamp,
        universes: BTreeMap<String, Value>,
    },
}

impl ServerMessage {
    /// Serialize to the text frame sent over the WebSocket
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<Event> for ServerMessage {
    fn from(event: Event) -> Self {
        match event {
            Event::Session { session_id, ts } => ServerMessage::Session { session_id, ts },
            Event::FullState {
                session_id,
                ts,
                state,
            } => ServerMessage::State {
                session_id,
                ts,
                state,
            },
            Event::Delta { ts, changes } => ServerMessage::Diff { ts, changes },
        }
    }
}
