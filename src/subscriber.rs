use crate::error::{PenumbraError, Result};
use tokio::sync::{mpsc, oneshot};

/// Identifier the hub assigns to each registered client
pub type ClientId = u64;

/// Receiving end of one client's outbound queue
///
/// Messages arrive already serialized, in broadcast order. The queue closes
/// when the client is unregistered or shed for falling behind.
pub struct Subscriber {
    id: ClientId,
    rx: mpsc::Receiver<String>,
    dropped: oneshot::Receiver<()>,
}

impl Subscriber {
    pub(crate) fn new(
        id: ClientId,
        rx: mpsc::Receiver<String>,
        dropped: oneshot::Receiver<()>,
    ) -> Self {
        Self { id, rx, dropped }
    }

    /// Queue plus a signal that resolves as soon as the hub drops this
    /// client, even while messages are still queued
    pub(crate) fn into_parts(self) -> (mpsc::Receiver<String>, oneshot::Receiver<()>) {
        (self.rx, self.dropped)
    }

    /// Hub-assigned client id
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Receive the next message
    ///
    /// Returns `None` once the hub has dropped this client and the queue is drained.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Try to receive a message without blocking
    ///
    /// Returns `Ok(None)` if the queue is currently empty.
    pub fn try_recv(&mut self) -> Result<Option<String>> {
        match self.rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(PenumbraError::HubClosed),
        }
    }
}
