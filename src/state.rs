use crate::error::{PenumbraError, Result};
use crate::protocol::{Event, StatePacket};
use crate::types::ParameterState;
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;
use tokio::sync::mpsc;

/// Read-only copy of the mirror's canonical state
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorSnapshot {
    pub session_id: String,
    pub state: ParameterState,
    /// Wall-clock time of the last applied packet, if any
    pub last_update: Option<SystemTime>,
}

#[derive(Default)]
struct MirrorState {
    session_id: String,
    state: ParameterState,
    last_update: Option<SystemTime>,
}

/// Last known parameter state for the current session
///
/// Every packet is diffed against the mirror; resulting events are published
/// on the channel given at construction, in the order they were produced.
pub struct StateMirror {
    state: RwLock<MirrorState>,
    events: mpsc::Sender<Event>,
}

impl StateMirror {
    /// Create an empty mirror publishing to `events`
    pub fn new(events: mpsc::Sender<Event>) -> Self {
        Self {
            state: RwLock::new(MirrorState::default()),
            events,
        }
    }

    /// Apply a packet and publish the events it produces
    ///
    /// Returns `true` if any parameter changed. A session switch clears the
    /// mirror and publishes `Event::Session` ahead of the diff, so the diff
    /// that follows carries every parameter of the new packet. Keys from the
    /// previous session are never reported as removed.
    ///
    /// Publishing waits for channel capacity, which throttles ingestion when
    /// the consumer falls behind.
    pub async fn update(&self, packet: &StatePacket) -> Result<bool> {
        let events = self.apply(packet);
        let changed = events.iter().any(|e| matches!(e, Event::Delta { .. }));

        for event in events {
            self.events
                .send(event)
                .await
                .map_err(|_| PenumbraError::HubClosed)?;
        }
        Ok(changed)
    }

    /// Diff under the write lock; the lock is released before publishing
    fn apply(&self, packet: &StatePacket) -> Vec<Event> {
        let mut mirror = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut events = Vec::with_capacity(2);

        if packet.session_id != mirror.session_id {
            tracing::info!(
                "New session {} (was {:?})",
                packet.session_id,
                mirror.session_id
            );
            mirror.session_id = packet.session_id.clone();
            mirror.state.clear();
            events.push(Event::Session {
                session_id: packet.session_id.clone(),
                ts: packet.ts,
            });
        }

        let changes = diff(&mirror.state, &packet.state);
        mirror.last_update = Some(SystemTime::now());

        if changes.is_empty() {
            return events;
        }

        tracing::debug!("{} parameter(s) changed at ts={}", changes.len(), packet.ts);
        mirror
            .state
            .extend(changes.iter().map(|(k, v)| (k.clone(), *v)));
        events.push(Event::Delta {
            ts: packet.ts,
            changes,
        });
        events
    }

    /// Copy of the current session, state and last update time
    pub fn snapshot(&self) -> MirrorSnapshot {
        let mirror = self.state.read().unwrap_or_else(PoisonError::into_inner);
        MirrorSnapshot {
            session_id: mirror.session_id.clone(),
            state: mirror.state.clone(),
            last_update: mirror.last_update,
        }
    }
}

/// Parameters that are new or different in `next`, plus those that vanished (as 0)
///
/// A vanished parameter stays in the mirror at 0, so it is reported once.
fn diff(current: &ParameterState, next: &ParameterState) -> ParameterState {
    let mut changes: ParameterState = next
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), *v))
        .collect();

    for (key, value) in current {
        if !next.contains_key(key) && *value != 0.0 {
            changes.insert(key.clone(), 0.0);
        }
    }
    changes
}
