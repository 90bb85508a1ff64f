//! Event loop around the relay session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Poll};

use relay_session::session::{LOGIN_OK, LOGIN_OK_REGISTERED};
use relay_session::tunnels::STATUS_OK;
use relay_session::{
    Action, Config, PairingOutcome, PairingRecord, Session, SessionHandler, SessionState,
    StopReason, TlsTransport, TrafficRecord, TransportEvent, UPSTREAM_TOKEN,
};

use crate::forward::TunnelRegistry;

/// Upper bound on one poll so the shutdown flag is seen promptly
const MAX_POLL_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// User-facing Events
// ============================================================================

/// Logs session progress and prints administrative results
#[derive(Debug, Default)]
pub struct Reporter {
    logged_in: bool,
}

impl SessionHandler for Reporter {
    fn on_state_change(&mut self, from: SessionState, to: SessionState) {
        log::debug!("Connection state {:?} -> {:?}", from, to);
        if to == SessionState::Disconnected && self.logged_in {
            log::warn!("Relay session lost, reconnecting");
            self.logged_in = false;
        }
    }

    fn on_login(&mut self, result: &str) {
        self.logged_in = result == LOGIN_OK || result == LOGIN_OK_REGISTERED;
        if result == LOGIN_OK_REGISTERED {
            log::info!("Account registered on first login");
        }
    }

    fn on_pairing(&mut self, record: &PairingRecord<'_>, outcome: PairingOutcome) {
        log::debug!(
            "Pairing {} ({}/{} {} -> {}): {:?}",
            record.pairing_id,
            record.cloud_id,
            record.device_id,
            record.local_port,
            record.remote_port,
            outcome
        );
    }

    fn on_traffic(&mut self, result: &str, records: &[TrafficRecord<'_>]) {
        if result != STATUS_OK {
            println!("traffic query failed: {}", result);
            return;
        }
        println!("{:<32} {:>16} {:>16}", "DEVICE", "UPLOAD", "DOWNLOAD");
        for r in records {
            println!("{:<32} {:>16} {:>16}", r.device_id, r.upload, r.download);
        }
    }

    fn on_account_set(&mut self, result: &str) {
        println!("account set: {}", result);
    }

    fn on_account_exists(&mut self, result: &str) {
        println!("account exists: {}", result);
    }
}

// ============================================================================
// Client
// ============================================================================

pub struct Client {
    poll: Poll,
    session: Session<TlsTransport, TunnelRegistry, Reporter>,
    shutdown: Arc<AtomicBool>,
}

impl Client {
    pub fn new(
        config: &Config,
        action: Action,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let poll = Poll::new()?;
        let mut transport = TlsTransport::new(
            poll.registry(),
            Some(config.server_name()),
            config.upstream.insecure,
        )?;
        let addr = transport.resolve(&config.upstream.host, config.upstream.port)?;
        log::debug!("Relay {} resolved to {}", config.upstream.host, addr);

        let mut settings = config.session_settings();
        settings.action = action;
        let session = Session::new(
            settings,
            config.tunnel_table(),
            transport,
            TunnelRegistry::new(),
            Reporter::default(),
            Instant::now(),
        );

        Ok(Client {
            poll,
            session,
            shutdown,
        })
    }

    /// Run until the session stops; returns why it stopped
    pub fn run(&mut self) -> Result<StopReason, Box<dyn std::error::Error>> {
        self.session.start();
        let mut events = Events::with_capacity(64);

        while !self.session.is_stopped() {
            if self.shutdown.load(Ordering::Relaxed) {
                log::info!("Shutdown requested");
                self.session.shutdown();
                break;
            }

            let timeout = self
                .session
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()))
                .map_or(MAX_POLL_TIMEOUT, |t| t.min(MAX_POLL_TIMEOUT));

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                if event.token() != UPSTREAM_TOKEN {
                    continue;
                }
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let produced = self
                    .session
                    .transport_mut()
                    .process_io(readable, event.is_writable());
                for transport_event in produced {
                    self.deliver(transport_event);
                }
            }

            self.session.on_tick(Instant::now());
        }

        Ok(self
            .session
            .stop_reason()
            .cloned()
            .unwrap_or(StopReason::Requested))
    }

    fn deliver(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.session.on_connected(),
            TransportEvent::Data(bytes) => self.session.on_data(&bytes),
            TransportEvent::Closed(reason) => self.session.on_error(&reason),
        }
    }
}
