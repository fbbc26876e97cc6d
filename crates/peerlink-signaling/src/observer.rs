use bytes::Bytes;
use peerlink_core::{PeerId, SignalingError};
use tokio::sync::mpsc;
use tracing::trace;

// MARK: - SignalingObserver

/// Receives everything a session reports.
///
/// Called from the session's event context; implementations must return
/// promptly and must not block.
pub trait SignalingObserver {
    /// `connect` was rejected or the server could not be reached.
    fn on_connection_failure(&mut self, error: &SignalingError);

    fn on_signed_in(&mut self, self_id: PeerId);

    /// The session ended: sign-out completed or the server was lost.
    fn on_disconnected(&mut self);

    fn on_peer_connected(&mut self, id: PeerId, name: &str);

    fn on_peer_disconnected(&mut self, id: PeerId);

    /// Opaque signaling payload relayed from another peer.
    fn on_message_from_peer(&mut self, id: PeerId, payload: Bytes);

    /// The server acknowledged a relayed message.
    fn on_message_sent(&mut self, status: u16);
}

// MARK: - SignalingEvent

/// Observer callbacks as values, for consumers that prefer a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    ConnectionFailed { reason: String },
    SignedIn { self_id: PeerId },
    Disconnected,
    PeerConnected { id: PeerId, name: String },
    PeerDisconnected { id: PeerId },
    MessageFromPeer { id: PeerId, payload: Bytes },
    MessageSent { status: u16 },
}

// MARK: - ChannelObserver

/// Forwards every callback as a [`SignalingEvent`] on an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SignalingEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: SignalingEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!("Event receiver dropped; discarding {:?}", e.0);
        }
    }
}

impl SignalingObserver for ChannelObserver {
    fn on_connection_failure(&mut self, error: &SignalingError) {
        self.emit(SignalingEvent::ConnectionFailed { reason: error.to_string() });
    }

    fn on_signed_in(&mut self, self_id: PeerId) {
        self.emit(SignalingEvent::SignedIn { self_id });
    }

    fn on_disconnected(&mut self) {
        self.emit(SignalingEvent::Disconnected);
    }

    fn on_peer_connected(&mut self, id: PeerId, name: &str) {
        self.emit(SignalingEvent::PeerConnected { id, name: name.to_owned() });
    }

    fn on_peer_disconnected(&mut self, id: PeerId) {
        self.emit(SignalingEvent::PeerDisconnected { id });
    }

    fn on_message_from_peer(&mut self, id: PeerId, payload: Bytes) {
        self.emit(SignalingEvent::MessageFromPeer { id, payload });
    }

    fn on_message_sent(&mut self, status: u16) {
        self.emit(SignalingEvent::MessageSent { status });
    }
}
