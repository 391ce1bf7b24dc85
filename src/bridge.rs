//! Ingestion pipeline
//!
//! One datagram is taken all the way through before the next is read:
//! decode, mirror update, sACN dispatch, event publication and the liveness
//! notice. When the hub or the network falls behind, ingestion slows down
//! with it instead of queueing packets without bound. Do not put an
//! unbounded queue in front of this loop; if ingestion ever has to be
//! decoupled, the queue needs a fixed size and an explicit overflow policy.

use crate::config::ConfigStore;
use crate::e131::{Dispatcher, Transport, UdpTransport};
use crate::error::Result;
use crate::hub::Hub;
use crate::protocol::StatePacket;
use crate::receiver::Receiver;
use crate::state::StateMirror;
use std::sync::Arc;

/// Wires the state mirror to the sACN dispatcher and the broadcast hub
pub struct Bridge<T = UdpTransport> {
    mirror: StateMirror,
    dispatcher: Dispatcher<T>,
    hub: Hub,
    config: Arc<ConfigStore>,
}

impl<T: Transport> Bridge<T> {
    /// The mirror publishes straight into the hub's event channel
    pub fn new(hub: Hub, dispatcher: Dispatcher<T>, config: Arc<ConfigStore>) -> Self {
        Self {
            mirror: StateMirror::new(hub.event_sender()),
            dispatcher,
            hub,
            config,
        }
    }

    pub fn mirror(&self) -> &StateMirror {
        &self.mirror
    }

    pub fn dispatcher(&self) -> &Dispatcher<T> {
        &self.dispatcher
    }

    /// Run one packet through the pipeline
    ///
    /// Returns whether any parameter changed. Frames are only sent on change.
    /// The liveness notice goes out for every packet, subject to its own rate limit.
    pub async fn handle_packet(&mut self, packet: &StatePacket) -> Result<bool> {
        let changed = self.mirror.update(packet).await?;
        if changed {
            let config = self.config.read();
            self.dispatcher.dispatch(&packet.state, &config);
        }
        self.hub.maybe_notify_liveness(&packet.session_id);
        Ok(changed)
    }

    /// Process packets until the hub goes away
    pub async fn run(mut self, mut receiver: Receiver) -> Result<()> {
        loop {
            let packet = receiver.recv().await;
            self.handle_packet(&packet).await?;
        }
    }
}
