//! Tokio driver for [`Session`].
//!
//! # Lifecycle
//!
//! ```text
//! 1. SignalingClient::spawn(observer, settings)
//!       └─ one task owns the Session; socket, resolver and retry tasks feed it
//! 2. client.connect(endpoint, name).await
//! 3. client.send_to_peer(id, payload).await      ← any number of times
//! 4. client.sign_out().await
//! 5. client.shutdown().await
//! ```
//!
//! Every socket runs in its own task and reports back over one event
//! channel, so the session sees connects, reads, closes and timer expiries
//! one at a time.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use peerlink_core::{Channel, ConnectionState, Endpoint, PeerId, SignalingError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::observer::SignalingObserver;
use crate::resolver;
use crate::session::{
    CloseReason, ConnId, ResolveTicket, RetryToken, Session, SessionEvent, SessionSettings,
    Transport,
};

const READ_CHUNK: usize = 4096;

// ── Socket tasks ──────────────────────────────────────────────────────────────

struct SocketHandle {
    conn: ConnId,
    writes: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

/// Connect, then shuttle reads to the session and queued writes to the
/// socket until either side ends.
async fn run_socket(
    channel: Channel,
    conn: ConnId,
    addr: SocketAddr,
    mut writes: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("{} connect to {} failed: {}", channel, addr, e);
            let reason = CloseReason::from_io(&e);
            let _ = events.send(SessionEvent::Closed { channel, conn, reason });
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        trace!("set_nodelay on {} channel: {}", channel, e);
    }
    debug!("{} channel connected to {}", channel, addr);
    if events.send(SessionEvent::Connected { channel, conn }).is_err() {
        return;
    }

    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let reason = loop {
        buf.reserve(READ_CHUNK);
        tokio::select! {
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) => break CloseReason::Eof,
                Ok(n) => {
                    trace!("{} channel read {} bytes", channel, n);
                    let data = buf.split().freeze();
                    if events.send(SessionEvent::Received { channel, conn, data }).is_err() {
                        return;
                    }
                }
                Err(e) => break CloseReason::from_io(&e),
            },
            Some(data) = writes.recv() => {
                if let Err(e) = stream.write_all(&data).await {
                    break CloseReason::from_io(&e);
                }
            }
        }
    };
    debug!("{} channel closed ({:?})", channel, reason);
    let _ = events.send(SessionEvent::Closed { channel, conn, reason });
}

// ── TokioTransport ────────────────────────────────────────────────────────────

/// [`Transport`] backed by tokio TCP sockets, `lookup_host` and `sleep`.
///
/// Must be used from within a tokio runtime.
pub struct TokioTransport {
    events: mpsc::UnboundedSender<SessionEvent>,
    command: Option<SocketHandle>,
    notify: Option<SocketHandle>,
    resolver: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl TokioTransport {
    pub fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { events, command: None, notify: None, resolver: None, retry: None }
    }

    fn slot(&mut self, channel: Channel) -> &mut Option<SocketHandle> {
        match channel {
            Channel::Command => &mut self.command,
            Channel::Notify => &mut self.notify,
        }
    }
}

impl Transport for TokioTransport {
    fn resolve(&mut self, ticket: ResolveTicket, endpoint: &Endpoint) {
        self.cancel_resolve();
        let endpoint = endpoint.clone();
        let events = self.events.clone();
        self.resolver = Some(tokio::spawn(async move {
            let result = resolver::resolve(&endpoint).await;
            let _ = events.send(SessionEvent::Resolved { ticket, result });
        }));
    }

    fn cancel_resolve(&mut self) {
        if let Some(task) = self.resolver.take() {
            task.abort();
        }
    }

    fn connect(&mut self, channel: Channel, conn: ConnId, addr: SocketAddr) -> io::Result<()> {
        self.close(channel);
        let (writes, write_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_socket(channel, conn, addr, write_rx, self.events.clone()));
        *self.slot(channel) = Some(SocketHandle { conn, writes, task });
        Ok(())
    }

    fn send(&mut self, channel: Channel, conn: ConnId, data: Bytes) -> io::Result<()> {
        match self.slot(channel) {
            Some(handle) if handle.conn == conn => handle
                .writes
                .send(data)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "socket task has exited")),
            _ => Err(io::Error::new(io::ErrorKind::NotConnected, format!("{} channel not open", channel))),
        }
    }

    fn close(&mut self, channel: Channel) {
        if let Some(handle) = self.slot(channel).take() {
            trace!("Closing {} channel", channel);
            handle.task.abort();
        }
    }

    fn schedule_retry(&mut self, token: RetryToken, delay: Duration) {
        self.cancel_retry();
        let events = self.events.clone();
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::RetryElapsed { token });
        }));
    }

    fn cancel_retry(&mut self) {
        if let Some(task) = self.retry.take() {
            task.abort();
        }
    }
}

impl Drop for TokioTransport {
    fn drop(&mut self) {
        self.close(Channel::Command);
        self.close(Channel::Notify);
        self.cancel_resolve();
        self.cancel_retry();
    }
}

// ── SignalingClient ───────────────────────────────────────────────────────────

/// Point-in-time view of a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub self_id: Option<PeerId>,
    pub peers: HashMap<PeerId, String>,
    pub sending: bool,
    pub endpoint: Option<Endpoint>,
}

type Reply<T> = oneshot::Sender<Result<T, SignalingError>>;

enum ClientCommand {
    Connect { endpoint: Endpoint, client_name: String, reply: Reply<()> },
    SendToPeer { to: PeerId, payload: Bytes, reply: Reply<()> },
    SendHangUp { to: PeerId, reply: Reply<()> },
    SignOut { reply: Reply<()> },
    Close,
    Snapshot { reply: oneshot::Sender<SessionSnapshot> },
}

/// Handle to a signaling session running on its own task.
///
/// Cheap calls; each one is forwarded to the session task and answered once
/// the session has accepted or rejected it. Outcomes that arrive later
/// (signed in, messages, disconnects) go to the observer.
pub struct SignalingClient {
    commands: mpsc::UnboundedSender<ClientCommand>,
    task: JoinHandle<()>,
}

impl SignalingClient {
    pub fn spawn<O>(observer: O, settings: SessionSettings) -> Self
    where
        O: SignalingObserver + Send + 'static,
    {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let session = Session::new(TokioTransport::new(event_tx), observer, settings);
        let task = tokio::spawn(run_session(session, command_rx, event_rx));
        Self { commands, task }
    }

    pub async fn connect(&self, endpoint: Endpoint, client_name: &str) -> Result<(), SignalingError> {
        let client_name = client_name.to_owned();
        self.request(|reply| ClientCommand::Connect { endpoint, client_name, reply }).await
    }

    pub async fn send_to_peer(&self, to: PeerId, payload: impl Into<Bytes>) -> Result<(), SignalingError> {
        let payload = payload.into();
        self.request(|reply| ClientCommand::SendToPeer { to, payload, reply }).await
    }

    pub async fn send_hang_up(&self, to: PeerId) -> Result<(), SignalingError> {
        self.request(|reply| ClientCommand::SendHangUp { to, reply }).await
    }

    pub async fn sign_out(&self) -> Result<(), SignalingError> {
        self.request(|reply| ClientCommand::SignOut { reply }).await
    }

    /// Drop both sockets without signing out. No observer event fires.
    pub fn close(&self) {
        let _ = self.commands.send(ClientCommand::Close);
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SignalingError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ClientCommand::Snapshot { reply })
            .map_err(|_| SignalingError::SessionClosed)?;
        rx.await.map_err(|_| SignalingError::SessionClosed)
    }

    /// Stop the session task, closing any open sockets.
    pub async fn shutdown(self) {
        let Self { commands, task } = self;
        drop(commands);
        if let Err(e) = task.await {
            debug!("Session task ended abnormally: {}", e);
        }
    }

    async fn request<F>(&self, build: F) -> Result<(), SignalingError>
    where
        F: FnOnce(Reply<()>) -> ClientCommand,
    {
        let (reply, rx) = oneshot::channel();
        self.commands.send(build(reply)).map_err(|_| SignalingError::SessionClosed)?;
        rx.await.map_err(|_| SignalingError::SessionClosed)?
    }
}

async fn run_session<O: SignalingObserver>(
    mut session: Session<TokioTransport, O>,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => apply(&mut session, command),
                None => break,
            },
            Some(event) = events.recv() => session.handle(event),
        }
    }
    info!("Signaling session stopped");
    session.close();
}

fn apply<O: SignalingObserver>(session: &mut Session<TokioTransport, O>, command: ClientCommand) {
    match command {
        ClientCommand::Connect { endpoint, client_name, reply } => {
            let _ = reply.send(session.connect(endpoint, &client_name));
        }
        ClientCommand::SendToPeer { to, payload, reply } => {
            let _ = reply.send(session.send_to_peer(to, payload));
        }
        ClientCommand::SendHangUp { to, reply } => {
            let _ = reply.send(session.send_hang_up(to));
        }
        ClientCommand::SignOut { reply } => {
            let _ = reply.send(session.sign_out());
        }
        ClientCommand::Close => session.close(),
        ClientCommand::Snapshot { reply } => {
            let _ = reply.send(SessionSnapshot {
                state: session.state(),
                self_id: session.self_id(),
                peers: session.peers().snapshot(),
                sending: session.is_sending_message(),
                endpoint: session.endpoint().cloned(),
            });
        }
    }
}
