//! Relay Session Library
//!
//! Control plane for a relay-tunneling client. A device logs in to a cloud
//! relay, asks it to pair the tunnels it is configured with, and answers
//! tunnel handshakes from peers that want to reach its allowed ports.
//!
//! ```text
//!   event loop ──tick / bytes / errors──> Session ──frames──> Transport
//!                                           │
//!                          ┌────────────────┼─────────────────┐
//!                          v                v                 v
//!                       codec          TunnelTable        Scheduler
//!                  (frames, lists)  (pairing states)  (retry / poll timers)
//!                                           │
//!                                           v
//!                                       Forwarder (data plane)
//! ```
//!
//! The session itself does no I/O: the caller owns the socket and the clock
//! and reports what happened. [`transport::TlsTransport`] is the mio/rustls
//! transport used by the client binary.

pub mod codec;
pub mod config;
pub mod error;
pub mod records;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod tunnels;

pub use codec::{FrameBuffer, Message, MessageType, PairKind};
pub use config::{Config, Mode};
pub use error::{ConfigError, DecodeError, EncodeError, ProtocolError, SessionError, TransportError};
pub use records::{PairingRecord, TrafficRecord};
pub use scheduler::TimerKind;
pub use session::{
    Action, Credentials, Session, SessionHandler, SessionSettings, SessionState, StopReason,
    Transport,
};
pub use transport::{TlsTransport, TransportEvent, UPSTREAM_TOKEN};
pub use tunnels::{Deactivate, Forwarder, PairState, PairingOutcome, Peer, Tunnel, TunnelTable};
