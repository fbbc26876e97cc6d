//! peerlink-signaling
//!
//! Client side of a small HTTP/1.0 rendezvous server. A peer signs in under
//! a display name, learns who else is online, and relays opaque payloads
//! (session descriptions, candidates) to other peers through the server.
//!
//! # Architecture
//!
//! ```text
//! SignalingClient ──commands──►  session task ── Session (state machine)
//!                                     ▲              │
//!                                     │ events       ▼ Transport
//!                      socket / resolver / retry tasks
//!                                     │
//!        command socket ── GET /sign_in, POST /message, GET /sign_out ──► server
//!        notify socket  ── GET /wait (hanging) ─────────────────────────► server
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use peerlink_core::Endpoint;
//! use peerlink_signaling::{ChannelObserver, SessionSettings, SignalingClient, SignalingEvent};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let (observer, mut events) = ChannelObserver::new();
//! let client = SignalingClient::spawn(observer, SessionSettings::default());
//! client.connect(Endpoint::new("192.168.1.100", 8888), "alice@laptop").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let SignalingEvent::PeerConnected { id, .. } = event {
//!         client.send_to_peer(id, "hello").await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod directory;
pub mod http;
pub mod observer;
pub mod resolver;
pub mod session;

pub use client::{SessionSnapshot, SignalingClient, TokioTransport};
pub use directory::{DirectoryChange, PeerDirectory, PeerEntry};
pub use http::{Response, ResponseBuffer, HANG_UP};
pub use observer::{ChannelObserver, SignalingEvent, SignalingObserver};
pub use session::{
    CloseReason, ConnId, ResolveTicket, RetryToken, Session, SessionEvent, SessionSettings,
    Transport,
};
