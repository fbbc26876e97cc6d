//! Signaling session state machine.
//!
//! The session never touches a socket itself. It asks a [`Transport`] to
//! resolve, connect, send, close and arm timers, and is fed the outcome as
//! [`SessionEvent`]s, one at a time, from a single event context.
//!
//! # Lifecycle
//!
//! ```text
//! connect()  ─► Resolving ─► SigningIn ──200──► Connected ──sign_out()──► SigningOut ─► Disconnected
//!                               │  ▲                 │  (command busy)
//!                      refused  │  │ retry (2 s)     └────────────► SigningOutPending ─┘
//!                               └──┘
//! ```
//!
//! Two sockets are kept per session:
//! - **command**: one request per connection (sign-in, relay, sign-out);
//! - **notify**: a hanging `GET /wait` re-issued after every delivery.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use peerlink_core::{
    Channel, ClientConfig, ConnectionState, Endpoint, FrameError, PeerId, SignalingError,
};
use tracing::{debug, info, trace, warn};

use crate::directory::{DirectoryChange, PeerDirectory, PeerEntry};
use crate::http::{self, Response, ResponseBuffer};
use crate::observer::SignalingObserver;

// ── Handles ───────────────────────────────────────────────────────────────────

/// Identifies one socket connection; events carrying an old id are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

/// Identifies one armed retry timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetryToken(pub u64);

/// Identifies one outstanding address resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolveTicket(pub u64);

// ── Transport seam ────────────────────────────────────────────────────────────

/// Socket, resolver and timer operations the session drives.
///
/// Every asynchronous outcome comes back as a [`SessionEvent`].
pub trait Transport {
    /// Start resolving `endpoint`; completes with [`SessionEvent::Resolved`].
    fn resolve(&mut self, ticket: ResolveTicket, endpoint: &Endpoint);

    fn cancel_resolve(&mut self);

    /// Open `channel` towards `addr`, replacing any previous connection on
    /// it. An `Err` is an immediate failure; later failures arrive as
    /// [`SessionEvent::Closed`].
    fn connect(&mut self, channel: Channel, conn: ConnId, addr: SocketAddr) -> io::Result<()>;

    fn send(&mut self, channel: Channel, conn: ConnId, data: Bytes) -> io::Result<()>;

    /// Close `channel`. No further events are expected for its connection.
    fn close(&mut self, channel: Channel);

    /// Fire [`SessionEvent::RetryElapsed`] with `token` after `delay`.
    fn schedule_retry(&mut self, token: RetryToken, delay: Duration);

    fn cancel_retry(&mut self);
}

/// Why a socket went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close by the server.
    Eof,
    /// The connection attempt was refused.
    Refused,
    Error(io::ErrorKind),
}

impl CloseReason {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused,
            kind => Self::Error(kind),
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    Resolved { ticket: ResolveTicket, result: Result<SocketAddr, SignalingError> },
    Connected { channel: Channel, conn: ConnId },
    Received { channel: Channel, conn: ConnId, data: Bytes },
    Closed { channel: Channel, conn: ConnId, reason: CloseReason },
    RetryElapsed { token: RetryToken },
}

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Delay before a refused sign-in is retried.
    pub reconnect_delay: Duration,
    pub max_response_bytes: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { reconnect_delay: Duration::from_secs(2), max_response_bytes: 1_048_576 }
    }
}

impl From<&ClientConfig> for SessionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            reconnect_delay: config.reconnect_delay(),
            max_response_bytes: config.max_response_bytes,
        }
    }
}

// ── Channel sub-states ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    SignIn,
    Relay { to: PeerId },
    SignOut,
}

#[derive(Debug, Default)]
enum CommandPhase {
    #[default]
    Idle,
    /// Connect issued; `request` is written once it completes.
    Connecting { request: Bytes },
    AwaitingResponse,
}

#[derive(Debug)]
struct CommandChannel {
    phase: CommandPhase,
    conn: Option<ConnId>,
    exchange: Exchange,
    buffer: ResponseBuffer,
}

impl CommandChannel {
    fn new(limit: usize) -> Self {
        Self { phase: CommandPhase::Idle, conn: None, exchange: Exchange::SignIn, buffer: ResponseBuffer::new(limit) }
    }

    fn is_idle(&self) -> bool {
        matches!(self.phase, CommandPhase::Idle)
    }

    fn reset(&mut self) {
        self.phase = CommandPhase::Idle;
        self.conn = None;
        self.buffer.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotifyPhase {
    Closed,
    Connecting,
    Waiting,
}

#[derive(Debug)]
struct NotifyChannel {
    phase: NotifyPhase,
    conn: Option<ConnId>,
    buffer: ResponseBuffer,
}

impl NotifyChannel {
    fn new(limit: usize) -> Self {
        Self { phase: NotifyPhase::Closed, conn: None, buffer: ResponseBuffer::new(limit) }
    }

    fn reset(&mut self) {
        self.phase = NotifyPhase::Closed;
        self.conn = None;
        self.buffer.clear();
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// One login attempt against a signaling server.
pub struct Session<T: Transport, O: SignalingObserver> {
    transport: T,
    observer: O,
    settings: SessionSettings,
    state: ConnectionState,
    endpoint: Option<Endpoint>,
    server_addr: Option<SocketAddr>,
    client_name: String,
    self_id: Option<PeerId>,
    peers: PeerDirectory,
    command: CommandChannel,
    notify: NotifyChannel,
    resolving: Option<ResolveTicket>,
    retry: Option<RetryToken>,
    next_handle: u64,
}

impl<T: Transport, O: SignalingObserver> Session<T, O> {
    pub fn new(transport: T, observer: O, settings: SessionSettings) -> Self {
        let limit = settings.max_response_bytes;
        Self {
            transport,
            observer,
            settings,
            state: ConnectionState::Disconnected,
            endpoint: None,
            server_addr: None,
            client_name: String::new(),
            self_id: None,
            peers: PeerDirectory::new(),
            command: CommandChannel::new(limit),
            notify: NotifyChannel::new(limit),
            resolving: None,
            retry: None,
            next_handle: 0,
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn self_id(&self) -> Option<PeerId> {
        self.self_id
    }

    /// The server has assigned this client an id.
    pub fn is_connected(&self) -> bool {
        self.self_id.is_some()
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// A relayed message has not been answered yet.
    pub fn is_sending_message(&self) -> bool {
        self.state == ConnectionState::Connected && !self.command.is_idle()
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // ── Caller operations ─────────────────────────────────────────────────────

    /// Begin signing in as `client_name`.
    ///
    /// Rejections are reported to the observer and returned.
    pub fn connect(&mut self, endpoint: Endpoint, client_name: &str) -> Result<(), SignalingError> {
        let rejection = if self.state != ConnectionState::Disconnected {
            warn!("connect() called while {}", self.state);
            Some(SignalingError::AlreadyActive { state: self.state })
        } else if endpoint.host.is_empty() {
            Some(SignalingError::EmptyServer)
        } else if client_name.is_empty() {
            Some(SignalingError::EmptyClientName)
        } else {
            None
        };
        if let Some(err) = rejection {
            self.observer.on_connection_failure(&err);
            return Err(err);
        }

        info!("Connecting to {} as {:?}", endpoint, client_name);
        self.client_name = client_name.to_owned();
        let literal = endpoint.socket_addr();
        self.endpoint = Some(endpoint);

        match literal {
            Some(addr) => {
                self.server_addr = Some(addr);
                self.start_sign_in()
            }
            None => {
                let ticket = ResolveTicket(self.next_handle());
                self.resolving = Some(ticket);
                self.state = ConnectionState::Resolving;
                if let Some(endpoint) = &self.endpoint {
                    debug!("Resolving {}", endpoint);
                    self.transport.resolve(ticket, endpoint);
                }
                Ok(())
            }
        }
    }

    /// Relay `payload` to peer `to` through the server.
    pub fn send_to_peer(&mut self, to: PeerId, payload: impl Into<Bytes>) -> Result<(), SignalingError> {
        let from = match (self.state, self.self_id) {
            (ConnectionState::Connected, Some(id)) => id,
            _ => return Err(SignalingError::NotConnected { state: self.state }),
        };
        if !self.command.is_idle() {
            debug!("Rejecting message to {}: command channel busy", to);
            return Err(SignalingError::SendInFlight);
        }

        let payload = payload.into();
        debug!("Relaying {} bytes to peer {}", payload.len(), to);
        self.command.exchange = Exchange::Relay { to };
        if let Err(e) = self.open_command(http::message_request(from, to, &payload)) {
            warn!("Command connect failed while relaying: {}", e);
            self.fail_session();
            return Err(SignalingError::Connect(e));
        }
        Ok(())
    }

    pub fn send_hang_up(&mut self, to: PeerId) -> Result<(), SignalingError> {
        self.send_to_peer(to, Bytes::from_static(http::HANG_UP))
    }

    /// Sign out. Idempotent while disconnected or already signing out.
    pub fn sign_out(&mut self) -> Result<(), SignalingError> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::SigningOut => return Ok(()),
            ConnectionState::Resolving | ConnectionState::SigningIn => {
                info!("Sign-out before sign-in completed; closing");
                self.close();
                self.observer.on_disconnected();
                return Ok(());
            }
            ConnectionState::Connected | ConnectionState::SigningOutPending => {}
        }

        self.close_notify();
        let Some(me) = self.self_id else {
            self.close();
            self.observer.on_disconnected();
            return Ok(());
        };

        if !self.command.is_idle() {
            debug!("Command channel busy; sign-out deferred");
            self.state = ConnectionState::SigningOutPending;
            return Ok(());
        }

        info!("Signing out (peer {})", me);
        self.state = ConnectionState::SigningOut;
        self.command.exchange = Exchange::SignOut;
        if let Err(e) = self.open_command(http::sign_out_request(me)) {
            warn!("Command connect failed while signing out: {}", e);
            self.close();
            self.observer.on_disconnected();
            return Err(SignalingError::Connect(e));
        }
        Ok(())
    }

    /// Drop both sockets and all session state. Fires no observer event.
    pub fn close(&mut self) {
        self.transport.close(Channel::Command);
        self.transport.close(Channel::Notify);
        if self.resolving.take().is_some() {
            self.transport.cancel_resolve();
        }
        if self.retry.take().is_some() {
            self.transport.cancel_retry();
        }
        self.command.reset();
        self.notify.reset();
        self.peers.clear();
        self.self_id = None;
        if self.state != ConnectionState::Disconnected {
            debug!("Session closed ({} → {})", self.state, ConnectionState::Disconnected);
        }
        self.state = ConnectionState::Disconnected;
    }

    // ── Event dispatch ────────────────────────────────────────────────────────

    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Resolved { ticket, result } => self.on_resolved(ticket, result),
            SessionEvent::RetryElapsed { token } => self.on_retry_elapsed(token),
            SessionEvent::Connected { channel, conn } if self.is_current(channel, conn) => match channel {
                Channel::Command => self.on_command_connected(conn),
                Channel::Notify => self.on_notify_connected(conn),
            },
            SessionEvent::Received { channel, conn, data } if self.is_current(channel, conn) => match channel {
                Channel::Command => self.on_command_data(&data),
                Channel::Notify => self.on_notify_data(&data),
            },
            SessionEvent::Closed { channel, conn, reason } if self.is_current(channel, conn) => match channel {
                Channel::Command => self.on_command_closed(reason),
                Channel::Notify => self.on_notify_closed(reason),
            },
            stale => trace!("Ignoring stale event {:?}", stale),
        }
    }

    fn is_current(&self, channel: Channel, conn: ConnId) -> bool {
        let current = match channel {
            Channel::Command => self.command.conn,
            Channel::Notify => self.notify.conn,
        };
        current == Some(conn)
    }

    // ── Resolution and sign-in ────────────────────────────────────────────────

    fn on_resolved(&mut self, ticket: ResolveTicket, result: Result<SocketAddr, SignalingError>) {
        if self.resolving != Some(ticket) || self.state != ConnectionState::Resolving {
            trace!("Ignoring stale resolution {:?}", ticket);
            return;
        }
        self.resolving = None;

        match result {
            Ok(addr) => {
                debug!("Server resolved to {}", addr);
                self.server_addr = Some(addr);
                // Failures are reported to the observer inside.
                let _ = self.start_sign_in();
            }
            Err(e) => {
                warn!("{}", e);
                self.close();
                self.observer.on_connection_failure(&e);
            }
        }
    }

    fn start_sign_in(&mut self) -> Result<(), SignalingError> {
        self.command.exchange = Exchange::SignIn;
        match self.open_command(http::sign_in_request(&self.client_name)) {
            Ok(()) => {
                self.state = ConnectionState::SigningIn;
                Ok(())
            }
            Err(e) => {
                warn!("Command connect failed: {}", e);
                self.close();
                let err = SignalingError::Connect(e);
                self.observer.on_connection_failure(&err);
                Err(err)
            }
        }
    }

    fn on_retry_elapsed(&mut self, token: RetryToken) {
        if self.retry != Some(token) || self.state != ConnectionState::SigningIn {
            trace!("Ignoring stale retry {:?}", token);
            return;
        }
        self.retry = None;
        info!("Retrying sign-in");
        let _ = self.start_sign_in();
    }

    fn schedule_retry(&mut self) {
        if self.retry.is_some() {
            return;
        }
        let token = RetryToken(self.next_handle());
        self.retry = Some(token);
        warn!("Connection refused; retrying in {:?}", self.settings.reconnect_delay);
        self.transport.schedule_retry(token, self.settings.reconnect_delay);
    }

    fn complete_sign_in(&mut self, response: Response) {
        let me = match response.peer_id() {
            Ok(id) => id,
            Err(e) => return self.protocol_error(Channel::Command, e),
        };
        self.self_id = Some(me);

        let listing = String::from_utf8_lossy(&response.body);
        for (id, name) in self.peers.rebuild(me, &listing) {
            self.observer.on_peer_connected(id, &name);
        }
        info!("Signed in as peer {} ({} other peer(s) online)", me, self.peers.len());
        self.state = ConnectionState::Connected;
        self.observer.on_signed_in(me);
        self.open_notify();
    }

    // ── Command channel ───────────────────────────────────────────────────────

    fn open_command(&mut self, request: Bytes) -> io::Result<()> {
        let addr = self.server_addr.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "server address not resolved")
        })?;
        let conn = ConnId(self.next_handle());
        self.command.reset();
        self.transport.connect(Channel::Command, conn, addr)?;
        self.command.conn = Some(conn);
        self.command.phase = CommandPhase::Connecting { request };
        Ok(())
    }

    fn close_command(&mut self) {
        self.transport.close(Channel::Command);
        self.command.reset();
    }

    fn on_command_connected(&mut self, conn: ConnId) {
        let request = match mem::take(&mut self.command.phase) {
            CommandPhase::Connecting { request } => request,
            other => {
                debug!("Unexpected connect on command channel ({:?})", other);
                self.command.phase = other;
                return;
            }
        };
        self.command.phase = CommandPhase::AwaitingResponse;
        trace!("Command channel connected; writing {} bytes", request.len());
        if let Err(e) = self.transport.send(Channel::Command, conn, request) {
            self.on_command_closed(CloseReason::from_io(&e));
        }
    }

    fn on_command_data(&mut self, data: &[u8]) {
        self.command.buffer.extend(data);
        let response = match self.command.buffer.try_take() {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(e) => return self.protocol_error(Channel::Command, e),
        };
        // One request per command connection.
        self.close_command();
        self.on_command_response(response);
    }

    fn on_command_response(&mut self, response: Response) {
        if !response.is_ok() {
            return self.protocol_error(
                Channel::Command,
                FrameError::UnexpectedStatus { status: response.status },
            );
        }

        match self.state {
            ConnectionState::SigningIn => self.complete_sign_in(response),
            ConnectionState::Connected => self.observer.on_message_sent(response.status),
            ConnectionState::SigningOut => {
                info!("Signed out");
                self.close();
                self.observer.on_disconnected();
            }
            ConnectionState::SigningOutPending => {
                if matches!(self.command.exchange, Exchange::Relay { .. }) {
                    self.observer.on_message_sent(response.status);
                }
                let _ = self.sign_out();
            }
            ConnectionState::Disconnected | ConnectionState::Resolving => {
                debug!("Dropping command response received while {}", self.state);
            }
        }
    }

    fn on_command_closed(&mut self, reason: CloseReason) {
        if !self.command.buffer.is_empty() {
            debug!("Discarding {} bytes of partial response", self.command.buffer.len());
        }
        self.close_command();

        match (self.state, reason) {
            (ConnectionState::SigningIn, CloseReason::Refused) => self.schedule_retry(),
            (ConnectionState::SigningOut, _) => {
                debug!("Command channel closed during sign-out ({:?})", reason);
                self.close();
                self.observer.on_disconnected();
            }
            (ConnectionState::SigningOutPending, _) => {
                if let Exchange::Relay { to } = self.command.exchange {
                    warn!("Message to peer {} dropped before delivery ({:?}); signing out", to, reason);
                }
                let _ = self.sign_out();
            }
            (state, reason) => {
                warn!("Command channel closed while {} ({:?})", state, reason);
                self.fail_session();
            }
        }
    }

    // ── Notify channel ────────────────────────────────────────────────────────

    fn open_notify(&mut self) {
        let Some(addr) = self.server_addr else {
            return self.fail_session();
        };
        let conn = ConnId(self.next_handle());
        self.notify.reset();
        match self.transport.connect(Channel::Notify, conn, addr) {
            Ok(()) => {
                self.notify.conn = Some(conn);
                self.notify.phase = NotifyPhase::Connecting;
            }
            Err(e) => {
                warn!("Notify connect failed: {}", e);
                self.fail_session();
            }
        }
    }

    fn close_notify(&mut self) {
        self.transport.close(Channel::Notify);
        self.notify.reset();
    }

    fn on_notify_connected(&mut self, conn: ConnId) {
        self.notify.phase = NotifyPhase::Waiting;
        self.issue_wait(conn);
    }

    fn issue_wait(&mut self, conn: ConnId) {
        let Some(me) = self.self_id else { return };
        trace!("Waiting for notifications");
        if let Err(e) = self.transport.send(Channel::Notify, conn, http::wait_request(me)) {
            self.on_notify_closed(CloseReason::from_io(&e));
        }
    }

    fn on_notify_data(&mut self, data: &[u8]) {
        self.notify.buffer.extend(data);
        let response = match self.notify.buffer.try_take() {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(e) => return self.protocol_error(Channel::Notify, e),
        };
        if response.connection_close {
            self.close_notify();
        }

        self.on_notification(response);

        if self.state != ConnectionState::Connected {
            return;
        }
        match (self.notify.phase, self.notify.conn) {
            (NotifyPhase::Waiting, Some(conn)) => self.issue_wait(conn),
            _ => self.open_notify(),
        }
    }

    fn on_notification(&mut self, response: Response) {
        if !response.is_ok() {
            return self.protocol_error(
                Channel::Notify,
                FrameError::UnexpectedStatus { status: response.status },
            );
        }
        let from = match response.peer_id() {
            Ok(id) => id,
            Err(e) => {
                warn!("Dropping notification: {}", e);
                return;
            }
        };

        if Some(from) != self.self_id {
            return self.on_message_from_peer(from, response);
        }

        let text = String::from_utf8_lossy(&response.body);
        let Some(entry) = text.lines().next().and_then(PeerEntry::parse) else {
            debug!("Ignoring malformed directory update {:?}", text);
            return;
        };
        match self.peers.apply(entry) {
            DirectoryChange::Joined { id, name } => {
                info!("Peer {} ({}) connected", id, name);
                self.observer.on_peer_connected(id, &name);
            }
            DirectoryChange::Left { id } => {
                info!("Peer {} disconnected", id);
                self.observer.on_peer_disconnected(id);
            }
            DirectoryChange::Ignored => {}
        }
    }

    fn on_message_from_peer(&mut self, from: PeerId, response: Response) {
        if response.is_hang_up() {
            info!("Peer {} hung up", from);
            self.peers.remove(from);
            self.observer.on_peer_disconnected(from);
        } else {
            debug!("Message from peer {} ({} bytes)", from, response.body.len());
            self.observer.on_message_from_peer(from, response.body);
        }
    }

    fn on_notify_closed(&mut self, reason: CloseReason) {
        self.close_notify();
        if self.state != ConnectionState::Connected {
            return;
        }
        if reason == CloseReason::Refused {
            warn!("Notify connection refused");
            return self.fail_session();
        }
        debug!("Notify channel closed ({:?}); reconnecting", reason);
        self.open_notify();
    }

    // ── Failure ───────────────────────────────────────────────────────────────

    fn protocol_error(&mut self, channel: Channel, error: FrameError) {
        warn!("Protocol error on {} channel: {}", channel, error);
        self.fail_session();
    }

    /// Tear down and report the session lost.
    fn fail_session(&mut self) {
        self.close();
        self.observer.on_disconnected();
    }

    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}
