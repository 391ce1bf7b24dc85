//! Broadcast hub for UI clients
//!
//! The hub is an actor: one task owns the client registry and the hub's own
//! state mirror, and processes registrations and events one at a time. Every
//! client therefore sees the same sequence of state transitions, starting
//! with a full snapshot taken at the moment it registered.
//!
//! Each client has a bounded outbound queue. A client whose queue is full
//! when an event is fanned out is dropped on the spot; the fan-out never
//! waits on a slow consumer.
//!
//! A dropped WebSocket client is disconnected at once: its writer stops even
//! if it is blocked on a peer that no longer reads, and the socket is closed.
//!
//! There is no idle timeout and no heartbeat beyond the rate-limited status
//! message. A dead peer is noticed only when its connection reports closed.

use crate::error::{PenumbraError, Result};
use crate::protocol::{Event, ServerMessage};
use crate::subscriber::{ClientId, Subscriber};
use crate::types::{ParameterState, Timestamp};
use futures_util::{Sink, SinkExt, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

/// Default per-client outbound queue length
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default length of the inbound event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Path on which WebSocket upgrades are accepted
pub const WS_PATH: &str = "/ws";

const STATUS_INTERVAL: Duration = Duration::from_secs(1);
const LIVENESS_WINDOW: Duration = Duration::from_secs(5);
const COMMAND_CAPACITY: usize = 64;

/// Hub sizing
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Messages a client may have queued before it is dropped
    pub queue_capacity: usize,

    /// Events that may wait for the hub loop before producers are held back
    pub event_capacity: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// The hub's own reconstruction of session and state
///
/// Built only from events the hub has processed, never read from the
/// ingestion side's mirror.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HubMirror {
    pub session_id: String,
    pub state: ParameterState,
    pub ts: Timestamp,
}

impl HubMirror {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::Session { session_id, ts } => {
                self.session_id = session_id.clone();
                self.state.clear();
                self.ts = *ts;
            }
            Event::FullState {
                session_id,
                ts,
                state,
            } => {
                self.session_id = session_id.clone();
                self.state = state.clone();
                self.ts = *ts;
            }
            Event::Delta { ts, changes } => {
                self.ts = *ts;
                // Removals arrive as 0 and are kept as 0
                self.state
                    .extend(changes.iter().map(|(k, v)| (k.clone(), *v)));
            }
        }
    }

    fn to_message(&self) -> ServerMessage {
        ServerMessage::State {
            session_id: self.session_id.clone(),
            ts: self.ts,
            state: self.state.clone(),
        }
    }
}

/// Registry entry; dropping it closes the queue and fires the drop signal
struct Client {
    queue: mpsc::Sender<String>,
    _dropped: oneshot::Sender<()>,
}

enum Command {
    Register { id: ClientId, client: Client },
    Unregister(ClientId),
}

#[derive(Default)]
struct Liveness {
    last_status: Option<Instant>,
    last_seen: Option<(Instant, SystemTime)>,
}

/// State shared between the hub loop and its handles
///
/// The registry and the mirror have separate locks so status broadcasts
/// never wait on mirror updates.
struct Shared {
    clients: Mutex<HashMap<ClientId, Client>>,
    mirror: Mutex<HubMirror>,
    liveness: Mutex<Liveness>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

/// Handle to a running broadcast hub
///
/// Cheap to clone; the hub loop stops once every handle is dropped.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    events: mpsc::Sender<Event>,
}

impl Hub {
    /// Start the hub loop on the current tokio runtime
    pub fn spawn(options: HubOptions) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, event_rx) = mpsc::channel(options.event_capacity.max(1));

        let shared = Arc::new(Shared {
            clients: Mutex::new(HashMap::new()),
            mirror: Mutex::new(HubMirror::default()),
            liveness: Mutex::new(Liveness::default()),
            next_id: AtomicU64::new(1),
            queue_capacity: options.queue_capacity.max(1),
        });

        tokio::spawn(run(shared.clone(), command_rx, event_rx));

        Self {
            shared,
            commands,
            events,
        }
    }

    /// Channel that producers publish events into
    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.events.clone()
    }

    /// Apply an event to the hub mirror and fan it out to every client
    pub async fn broadcast(&self, event: Event) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| PenumbraError::HubClosed)
    }

    /// Add a client
    ///
    /// The first message in the returned queue is always a full state
    /// snapshot of the hub mirror at the moment of registration.
    pub async fn register(&self) -> Result<Subscriber> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, rx) = mpsc::channel(self.shared.queue_capacity);
        let (dropped_tx, dropped) = oneshot::channel();
        let client = Client {
            queue,
            _dropped: dropped_tx,
        };
        self.commands
            .send(Command::Register { id, client })
            .await
            .map_err(|_| PenumbraError::HubClosed)?;
        Ok(Subscriber::new(id, rx, dropped))
    }

    /// Remove a client and close its queue; unknown ids are ignored
    pub async fn unregister(&self, id: ClientId) -> Result<()> {
        self.commands
            .send(Command::Unregister(id))
            .await
            .map_err(|_| PenumbraError::HubClosed)
    }

    /// Send a status message to every client, at most once per second
    ///
    /// Each accepted call records the upstream source as seen now. Returns
    /// `true` if a status message went out. Status is not mirrored, and a
    /// client with a full queue simply misses it.
    pub fn maybe_notify_liveness(&self, session_id: &str) -> bool {
        let now = Instant::now();
        {
            let mut liveness = lock(&self.shared.liveness);
            if let Some(last) = liveness.last_status {
                if now.duration_since(last) < STATUS_INTERVAL {
                    return false;
                }
            }
            liveness.last_status = Some(now);
            liveness.last_seen = Some((now, SystemTime::now()));
        }

        tracing::trace!("Upstream session {} seen", session_id);

        let json = match self.status_message().to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize status: {}", e);
                return false;
            }
        };

        let clients = lock(&self.shared.clients);
        for client in clients.values() {
            let _ = client.queue.try_send(json.clone());
        }
        true
    }

    /// Current upstream connectivity as a status message
    pub fn status_message(&self) -> ServerMessage {
        let last_seen = lock(&self.shared.liveness).last_seen;
        let (connected, last_seen_ms) = match last_seen {
            Some((instant, wall)) => (instant.elapsed() < LIVENESS_WINDOW, unix_millis(wall)),
            None => (false, 0),
        };
        ServerMessage::Status {
            m4l_connected: connected,
            m4l_last_seen: last_seen_ms,
            universes: BTreeMap::new(),
        }
    }

    /// Copy of the hub's reconstructed state
    pub fn mirror_snapshot(&self) -> HubMirror {
        lock(&self.shared.mirror).clone()
    }

    /// Number of registered clients
    pub fn client_count(&self) -> usize {
        lock(&self.shared.clients).len()
    }

    /// Accept WebSocket connections forever
    pub async fn serve(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("WebSocket hub listening on ws://{}{}", addr, WS_PATH);
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let hub = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = hub.serve_connection(stream).await {
                            tracing::debug!("Connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Accept failed: {}", e),
            }
        }
    }

    /// Upgrade one TCP connection and attach it as a client
    ///
    /// Spawns a writer task that drains the client's queue into the socket
    /// and a reader task whose only job is to notice the peer going away.
    /// When the writer stops it aborts the reader, so both halves of the
    /// stream are dropped and the connection closes.
    pub async fn serve_connection(&self, stream: TcpStream) -> Result<()> {
        let peer = stream.peer_addr()?;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
        let (write, mut read) = ws_stream.split();

        let subscriber = self.register().await?;
        let id = subscriber.id();
        tracing::info!("Client {} connected from {}", id, peer);

        let hub = self.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("Read from client {} failed: {}", id, e);
                        break;
                    }
                }
            }
            tracing::info!("Client {} disconnected", id);
            let _ = hub.unregister(id).await;
        });

        let hub = self.clone();
        let (queue, dropped) = subscriber.into_parts();
        tokio::spawn(async move {
            write_loop(id, queue, dropped, write).await;
            reader.abort();
            let _ = hub.unregister(id).await;
        });

        Ok(())
    }
}

/// Forward queued messages to `sink` until the queue ends, a write fails,
/// or the hub drops the client
///
/// A pending write is abandoned as soon as the client is dropped.
async fn write_loop<S>(
    id: ClientId,
    mut queue: mpsc::Receiver<String>,
    mut dropped: oneshot::Receiver<()>,
    mut sink: S,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let text = tokio::select! {
            biased;
            _ = &mut dropped => break,
            next = queue.recv() => match next {
                Some(text) => text,
                None => break,
            },
        };
        tokio::select! {
            biased;
            _ = &mut dropped => break,
            result = sink.send(Message::Text(text)) => {
                if let Err(e) = result {
                    tracing::debug!("Write to client {} failed: {}", id, e);
                    break;
                }
            }
        }
    }
    tracing::debug!("Writer for client {} stopped", id);
}

async fn run(
    shared: Arc<Shared>,
    mut commands: mpsc::Receiver<Command>,
    mut events: mpsc::Receiver<Event>,
) {
    loop {
        // Pending events go first, so a registration never overtakes an
        // event that was published before it.
        tokio::select! {
            biased;
            Some(event) = events.recv() => shared.handle_event(event),
            Some(command) = commands.recv() => shared.handle_command(command),
            else => break,
        }
    }
    tracing::debug!("Hub loop stopped");
}

impl Shared {
    fn handle_command(&self, command: Command) {
        match command {
            Command::Register { id, client } => {
                let snapshot = lock(&self.mirror).to_message();
                match snapshot.to_json() {
                    Ok(json) => {
                        let _ = client.queue.try_send(json);
                    }
                    Err(e) => tracing::error!("Failed to serialize snapshot: {}", e),
                }
                lock(&self.clients).insert(id, client);
            }
            Command::Unregister(id) => {
                if lock(&self.clients).remove(&id).is_some() {
                    tracing::debug!("Client {} unregistered", id);
                }
            }
        }
    }

    fn handle_event(&self, event: Event) {
        lock(&self.mirror).apply(&event);

        let json = match ServerMessage::from(event).to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize event: {}", e);
                return;
            }
        };

        lock(&self.clients).retain(|id, client| match client.queue.try_send(json.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Client {} fell behind, dropping it", id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

fn check_path(request: &Request, response: Response) -> std::result::Result<Response, ErrorResponse> {
    if request.uri().path() == WS_PATH {
        return Ok(response);
    }
    let mut error = ErrorResponse::new(Some("not found".to_string()));
    *error.status_mut() = StatusCode::NOT_FOUND;
    Err(error)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unix_millis(time: SystemTime) -> Timestamp {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}
