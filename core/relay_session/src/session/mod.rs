//! Upstream session lifecycle
//!
//! One `Session` owns the relay connection, the tunnel table and both
//! timers. The event loop feeds it three kinds of input (timer ticks,
//! transport events, shutdown requests) and never touches its state
//! directly.
//!
//! ```text
//! Disconnected --retry tick--> Connecting --TLS up, login sent--> Authenticating
//!      ^                           |                                   |
//!      |                           | error                  "ok" / "ok_registered"
//!      +------- error path --------+                                   v
//!      +------------------------------------------------------------ Ready
//!
//! any state --shutdown / login rejected / admin reply--> Stopped
//! ```

mod router;

use std::time::{Duration, Instant};

use crate::codec::{self, FrameBuffer, Message};
use crate::error::{SessionError, TransportError};
use crate::records::{PairingRecord, TrafficRecord};
use crate::scheduler::{Scheduler, TimerKind, CONNECT_RETRY_INTERVAL, PAIRING_POLL_INTERVAL};
use crate::tunnels::{Deactivate, Forwarder, PairingOutcome, TunnelTable};

pub use router::{parse_token, LOGIN_OK, LOGIN_OK_REGISTERED};

// ============================================================================
// Collaborators
// ============================================================================

/// The byte pipe to the relay
///
/// `connect` only has to start the attempt; the owner reports completion
/// with [`Session::on_connected`] and failures with [`Session::on_error`].
pub trait Transport {
    fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError>;

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Release the connection; a no-op when there is none
    fn shutdown(&mut self);
}

/// User-facing notifications
///
/// Every callback runs on the event loop thread, at most once per protocol
/// event. All have empty defaults.
pub trait SessionHandler {
    fn on_state_change(&mut self, _from: SessionState, _to: SessionState) {}

    fn on_login(&mut self, _result: &str) {}

    fn on_pairing(&mut self, _record: &PairingRecord<'_>, _outcome: PairingOutcome) {}

    fn on_traffic(&mut self, _result: &str, _records: &[TrafficRecord<'_>]) {}

    fn on_account_set(&mut self, _result: &str) {}

    fn on_account_exists(&mut self, _result: &str) {}
}

// ============================================================================
// Settings
// ============================================================================

/// What the session is for
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep tunnels paired until shut down
    #[default]
    Tunnels,
    /// Query traffic counters, then stop
    TrafficGet,
    /// Create or update an account, then stop
    AccountSet { email: String, password: String },
    /// Ask whether an account exists, then stop
    AccountExists { email: String },
}

impl Action {
    /// Single request/reply administrative actions end the session on reply
    pub fn is_single_shot(&self) -> bool {
        !matches!(self, Action::Tunnels)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub device: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("device", &self.device)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub action: Action,
    pub connect_retry: Duration,
    pub pairing_poll: Duration,
}

impl SessionSettings {
    pub fn new(host: &str, port: u16, credentials: Credentials) -> Self {
        SessionSettings {
            host: host.to_string(),
            port,
            credentials,
            action: Action::Tunnels,
            connect_retry: CONNECT_RETRY_INTERVAL,
            pairing_poll: PAIRING_POLL_INTERVAL,
        }
    }
}

// ============================================================================
// Session State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    /// Terminal; nothing reconnects from here
    Stopped,
}

/// Why a session reached `Stopped`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    LoginRejected(String),
    /// Administrative reply delivered; holds the relay's status
    ActionComplete(String),
    ActionFailed(String),
}

// ============================================================================
// Session
// ============================================================================

pub struct Session<T, F, H> {
    settings: SessionSettings,
    state: SessionState,
    stop_reason: Option<StopReason>,
    transport: T,
    forwarder: F,
    handler: H,
    tunnels: TunnelTable,
    scheduler: Scheduler,
    inbound: FrameBuffer,
}

impl<T: Transport, F: Forwarder, H: SessionHandler> Session<T, F, H> {
    pub fn new(
        settings: SessionSettings,
        tunnels: TunnelTable,
        transport: T,
        forwarder: F,
        handler: H,
        now: Instant,
    ) -> Self {
        let scheduler = Scheduler::new(settings.connect_retry, settings.pairing_poll, now);
        Session {
            settings,
            state: SessionState::Disconnected,
            stop_reason: None,
            transport,
            forwarder,
            handler,
            tunnels,
            scheduler,
            inbound: FrameBuffer::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop_reason.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        self.state == SessionState::Stopped
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn tunnels(&self) -> &TunnelTable {
        &self.tunnels
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Lets the event loop pump socket readiness into the transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn forwarder(&self) -> &F {
        &self.forwarder
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn timer_active(&self, kind: TimerKind) -> bool {
        self.scheduler.is_active(kind)
    }

    /// When the event loop must call [`Session::on_tick`] next
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.state,
            SessionState::Connecting | SessionState::Authenticating | SessionState::Ready
        )
    }

    // ------------------------------------------------------------------------
    // Event Entry Points
    // ------------------------------------------------------------------------

    /// Arm the connect-retry timer; the first attempt happens on its first fire
    pub fn start(&mut self) {
        if self.state != SessionState::Disconnected {
            return;
        }
        log::info!(
            "Relay session for {}@{} targeting {}:{}",
            self.settings.credentials.username,
            self.settings.credentials.device,
            self.settings.host,
            self.settings.port
        );
        self.scheduler.start(TimerKind::ConnectRetry);
    }

    /// Fire every timer due at `now`
    pub fn on_tick(&mut self, now: Instant) {
        for kind in self.scheduler.expired(now) {
            match kind {
                TimerKind::ConnectRetry => self.connect(),
                TimerKind::PairingPoll => self.poll_pairing(),
            }
        }
    }

    /// Transport finished its handshake: log in
    pub fn on_connected(&mut self) {
        if self.state != SessionState::Connecting {
            log::debug!("Ignoring connect completion while {:?}", self.state);
            return;
        }

        let creds = &self.settings.credentials;
        let login = Message::AccountLogin {
            username: &creds.username,
            password: &creds.password,
            device: &creds.device,
        };
        match transmit(&mut self.transport, &login) {
            Ok(()) => self.set_state(SessionState::Authenticating),
            Err(e) => {
                // A login that cannot be encoded will never succeed
                let reason = e.to_string();
                self.handle_error(e);
                if self.state == SessionState::Connecting {
                    self.finish(StopReason::LoginRejected(reason));
                }
            }
        }
    }

    /// Bytes from the relay, in arrival order
    pub fn on_data(&mut self, data: &[u8]) {
        if !self.is_connected() {
            log::debug!("Dropping {} bytes received while {:?}", data.len(), self.state);
            return;
        }

        self.inbound.extend(data);

        // Frames borrow the buffer while handlers mutate the session
        let mut inbound = std::mem::take(&mut self.inbound);
        if let Err(e) = self.drain_frames(&mut inbound) {
            self.handle_error(e);
        }

        // A teardown during dispatch discards whatever was queued behind it
        if self.is_connected() {
            self.inbound = inbound;
        }
    }

    /// I/O failure reported by the transport
    pub fn on_error(&mut self, reason: &str) {
        self.teardown(reason);
    }

    /// Stop timers, drop every pairing and close the connection for good
    pub fn shutdown(&mut self) {
        self.finish(StopReason::Requested);
    }

    /// Report metered tunnel traffic (TRAFFIC_MI)
    ///
    /// Hook for embedders whose forwarder moves tunnel bytes and counts
    /// them. The session never calls it on its own, and the bundled
    /// `tunnel-client` registry carries no payload, so it has nothing to
    /// report. Fails with `NotConnected` unless the session is `Ready`.
    pub fn report_traffic(&mut self, upload: u64, download: u64) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(TransportError::NotConnected.into());
        }

        let creds = &self.settings.credentials;
        let msg = Message::TrafficMi {
            cloud: &creds.username,
            device: &creds.device,
            upload,
            download,
        };
        let result = transmit(&mut self.transport, &msg);
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                self.teardown(&e.to_string());
            }
        }
        result
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn drain_frames(&mut self, inbound: &mut FrameBuffer) -> Result<(), SessionError> {
        while self.is_connected() {
            let Some(frame) = inbound.next_frame()? else {
                break;
            };
            let msg = codec::decode(frame)?;
            log::trace!(
                "Received packet from upstream type: {} size: {}",
                msg.tag(),
                frame.len()
            );

            if let Err(e) = self.dispatch(msg) {
                if e.is_connection_fatal() {
                    return Err(e);
                }
                log::warn!("Dropped message: {}", e);
            }
        }
        Ok(())
    }

    /// One connection attempt from the retry timer
    fn connect(&mut self) {
        // The socket about to be created owns the retry from here on
        self.scheduler.stop(TimerKind::ConnectRetry);
        if self.state != SessionState::Disconnected {
            return;
        }

        self.set_state(SessionState::Connecting);
        log::info!(
            "Connecting to relay at {}:{}",
            self.settings.host,
            self.settings.port
        );
        if let Err(e) = self
            .transport
            .connect(&self.settings.host, self.settings.port)
        {
            self.teardown(&e.to_string());
        }
    }

    fn poll_pairing(&mut self) {
        if self.state != SessionState::Ready {
            self.scheduler.stop(TimerKind::PairingPoll);
            return;
        }

        for request in self.tunnels.request_pairing() {
            log::debug!(
                "Requesting pairing for {}/{} {} -> {}",
                request.cloud,
                request.device,
                request.local_port,
                request.remote_port
            );
            if let Err(e) = transmit(&mut self.transport, &request.as_message()) {
                self.handle_error(e);
                if self.state != SessionState::Ready {
                    return;
                }
            }
        }

        if !self.tunnels.has_unpaired() {
            self.scheduler.stop(TimerKind::PairingPoll);
        }
    }

    /// Keep the pairing poll running while something is left to pair
    fn ensure_pairing_poll(&mut self) {
        if self.state == SessionState::Ready
            && !self.settings.action.is_single_shot()
            && self.tunnels.has_unpaired()
            && !self.scheduler.is_active(TimerKind::PairingPoll)
        {
            self.scheduler.start(TimerKind::PairingPoll);
        }
    }

    fn handle_error(&mut self, e: SessionError) {
        if e.is_connection_fatal() {
            log::error!("Upstream error: {}", e);
            self.teardown(&e.to_string());
        } else {
            log::warn!("{}", e);
        }
    }

    /// Error path: unpair everything, release the transport, schedule a retry
    ///
    /// Runs at most once per connection; later calls find the session
    /// already disconnected and return.
    fn teardown(&mut self, reason: &str) {
        if !self.is_connected() {
            log::debug!("Ignoring error while {:?}: {}", self.state, reason);
            return;
        }

        log::warn!("Upstream connection lost: {}", reason);
        self.tunnels.on_offline("", &mut self.forwarder);
        self.scheduler.stop(TimerKind::PairingPoll);
        self.forwarder.deactivate(Deactivate::All);
        self.transport.shutdown();
        self.inbound.clear();
        self.set_state(SessionState::Disconnected);
        self.scheduler.start(TimerKind::ConnectRetry);
    }

    /// Terminal shutdown with a recorded reason
    fn finish(&mut self, reason: StopReason) {
        if self.state == SessionState::Stopped {
            return;
        }

        log::info!("Stopping relay session: {:?}", reason);
        self.scheduler.stop_all();
        self.tunnels.on_offline("", &mut self.forwarder);
        self.forwarder.deactivate(Deactivate::All);
        if self.is_connected() {
            self.transport.shutdown();
        }
        self.inbound.clear();
        self.stop_reason = Some(reason);
        self.set_state(SessionState::Stopped);
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        let prev = std::mem::replace(&mut self.state, next);
        log::info!("Session {:?} -> {:?}", prev, next);
        self.handler.on_state_change(prev, next);
    }
}

/// Encode and hand one message to the transport
fn transmit<T: Transport + ?Sized>(transport: &mut T, msg: &Message<'_>) -> Result<(), SessionError> {
    let frame = codec::encode(msg)?;
    log::trace!("Sending packet type: {} size: {}", msg.tag(), frame.len());
    transport.send(&frame)?;
    Ok(())
}
