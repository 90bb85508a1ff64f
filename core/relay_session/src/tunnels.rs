//! Tunnel table and pairing state machine
//!
//! Each configured tunnel moves through:
//!
//! ```text
//! Unpaired --request_pairing--> PairRequested --pairing record--> Paired
//!     ^                              |                              |
//!     +------ offline / connection loss -----------------------------+
//! ```
//!
//! `pairing_id` is non-empty exactly when the tunnel is `Paired`, and the
//! data-plane forwarder is activated once per assignment.
//!
//! Lookups are linear scans. Tunnel counts come from a device config file
//! and stay small, so an index on `(cloud, device, remote, local)` is not
//! worth its upkeep.

use crate::codec::{self, Message, PairKind};
use crate::error::ProtocolError;
use crate::records::PairingRecord;

// ============================================================================
// Routing Commands
// ============================================================================

/// Peer asks to open a tunnel to one of our allowed ports
pub const TUNNEL_REQUEST: &str = "tunnel_request";

/// Peer answers our side of the handshake
pub const TUNNEL_RESPONSE: &str = "tunnel_response";

/// Peer reports a state change on an open tunnel
pub const TUNNEL_UPDATE: &str = "tunnel_update";

/// Status sent back when a tunnel request is accepted
pub const STATUS_OK: &str = "ok";

/// Status sent back when a tunnel request is refused
pub const STATUS_DENIED: &str = "denied";

// ============================================================================
// Tunnel Descriptor
// ============================================================================

/// Pairing state of one tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Unpaired,
    PairRequested,
    Paired,
}

/// One configured forwarding rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub cloud_id: String,
    pub device_id: String,
    pub local_port: u16,
    pub remote_port: u16,
    /// Empty while unpaired
    pub pairing_id: String,
    pub pair_kind: PairKind,
    state: PairState,
}

impl Tunnel {
    pub fn new(cloud_id: &str, device_id: &str, local_port: u16, remote_port: u16) -> Self {
        Tunnel {
            cloud_id: cloud_id.to_string(),
            device_id: device_id.to_string(),
            local_port,
            remote_port,
            pairing_id: String::new(),
            pair_kind: PairKind::Normal,
            state: PairState::Unpaired,
        }
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    pub fn is_paired(&self) -> bool {
        self.state == PairState::Paired
    }

    fn matches(&self, record: &PairingRecord<'_>) -> bool {
        self.cloud_id == record.cloud_id
            && self.device_id == record.device_id
            && self.remote_port == record.remote_port
            && self.local_port == record.local_port
    }

    /// Drop the pairing and go back to `Unpaired`; returns the old pairing id
    fn unpair(&mut self) -> Option<String> {
        self.state = PairState::Unpaired;
        if self.pairing_id.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pairing_id))
        }
    }
}

// ============================================================================
// Data-Plane Collaborator
// ============================================================================

/// Which forwarders to tear down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deactivate<'a> {
    Pairing(&'a str),
    All,
}

/// Sender of a routed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer<'a> {
    pub cloud: &'a str,
    pub device: &'a str,
    pub address: &'a str,
}

/// Moves bytes for paired tunnels; this crate only tells it when
pub trait Forwarder {
    /// Start forwarding for a tunnel that just got its pairing id
    fn activate(&mut self, tunnel: &Tunnel);

    fn deactivate(&mut self, target: Deactivate<'_>);

    /// A peer wants to reach local `port`; return false to refuse
    fn open_endpoint(&mut self, _peer: &Peer<'_>, _pairing_id: &str, _port: u16) -> bool {
        true
    }

    fn tunnel_response(&mut self, _tunnel: &Tunnel, _status: &str) {}

    fn tunnel_update(&mut self, _pairing_id: &str, _status: &str) {}
}

// ============================================================================
// Outbound Requests
// ============================================================================

/// A DEVICE_PAIR request produced by a poll tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairRequest {
    pub cloud: String,
    pub device: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub pair_kind: PairKind,
}

impl PairRequest {
    pub fn as_message(&self) -> Message<'_> {
        Message::DevicePair {
            cloud: &self.cloud,
            device: &self.device,
            local_port: self.local_port,
            remote_port: self.remote_port,
            pair_kind: self.pair_kind,
        }
    }
}

/// A routed reply to a peer's handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelReply {
    pub to_cloud: String,
    pub to_device: String,
    pub to_address: String,
    pub tp: String,
}

impl TunnelReply {
    pub fn as_message(&self) -> Message<'_> {
        Message::MessageToSet {
            to_cloud: &self.to_cloud,
            to_device: &self.to_device,
            to_address: &self.to_address,
            tp: &self.tp,
            body: &[],
        }
    }
}

/// What a pairing record did to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingOutcome {
    /// Assigned to the tunnel at this index
    Paired(usize),
    /// Same id already held by the tunnel at this index
    AlreadyPaired(usize),
    /// Relay-initiated pairing, accepted without a table entry
    Forced,
    /// No configured tunnel matches
    Orphaned,
}

// ============================================================================
// Tunnel Table
// ============================================================================

/// Configured tunnels plus the local ports peers may open
#[derive(Debug, Clone, Default)]
pub struct TunnelTable {
    tunnels: Vec<Tunnel>,
    allowed: Vec<u16>,
}

impl TunnelTable {
    pub fn new(tunnels: Vec<Tunnel>, allowed: Vec<u16>) -> Self {
        TunnelTable { tunnels, allowed }
    }

    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    pub fn allowed(&self) -> &[u16] {
        &self.allowed
    }

    /// Whether any tunnel is still without a pairing id
    pub fn has_unpaired(&self) -> bool {
        self.tunnels.iter().any(|t| !t.is_paired())
    }

    pub fn find_by_pairing(&self, pairing_id: &str) -> Option<&Tunnel> {
        if pairing_id.is_empty() {
            return None;
        }
        self.tunnels.iter().find(|t| t.pairing_id == pairing_id)
    }

    /// Build one DEVICE_PAIR request per tunnel that has no pairing id
    ///
    /// A request still outstanding from the previous tick is sent again;
    /// paired tunnels are never re-requested.
    pub fn request_pairing(&mut self) -> Vec<PairRequest> {
        let mut requests = Vec::new();
        for tunnel in self.tunnels.iter_mut().filter(|t| !t.is_paired()) {
            tunnel.state = PairState::PairRequested;
            requests.push(PairRequest {
                cloud: tunnel.cloud_id.clone(),
                device: tunnel.device_id.clone(),
                local_port: tunnel.local_port,
                remote_port: tunnel.remote_port,
                pair_kind: tunnel.pair_kind,
            });
        }
        requests
    }

    /// Apply one record from a DEVICE_PAIR_REPLY
    pub fn on_pairing_record<F: Forwarder + ?Sized>(
        &mut self,
        record: &PairingRecord<'_>,
        forwarder: &mut F,
    ) -> PairingOutcome {
        if record.pair_kind == PairKind::Forced {
            log::info!(
                "Forced pairing {} for {}/{} ({} -> {})",
                record.pairing_id,
                record.cloud_id,
                record.device_id,
                record.local_port,
                record.remote_port
            );
            return PairingOutcome::Forced;
        }

        let Some(index) = self.tunnels.iter().position(|t| t.matches(record)) else {
            log::warn!(
                "Orphaned pairing {} for {}/{} ({} -> {}), no such tunnel",
                record.pairing_id,
                record.cloud_id,
                record.device_id,
                record.local_port,
                record.remote_port
            );
            return PairingOutcome::Orphaned;
        };

        let tunnel = &mut self.tunnels[index];
        if tunnel.is_paired() {
            if tunnel.pairing_id == record.pairing_id {
                log::debug!("Tunnel {} already paired as {}", index, tunnel.pairing_id);
                return PairingOutcome::AlreadyPaired(index);
            }
            if let Some(old) = tunnel.unpair() {
                log::info!("Tunnel {} re-paired, dropping {}", index, old);
                forwarder.deactivate(Deactivate::Pairing(&old));
            }
        }

        tunnel.pairing_id = record.pairing_id.to_string();
        tunnel.state = PairState::Paired;
        log::info!(
            "Tunnel {}/{} {} -> {} paired as {}",
            tunnel.cloud_id,
            tunnel.device_id,
            tunnel.local_port,
            tunnel.remote_port,
            tunnel.pairing_id
        );
        forwarder.activate(tunnel);

        PairingOutcome::Paired(index)
    }

    /// Reset tunnels after the relay reports a peer offline
    ///
    /// An empty address means the whole connection is gone: every tunnel
    /// loses its pairing. Otherwise only the first tunnel holding that
    /// pairing id is reset. Returns the number of tunnels reset.
    pub fn on_offline<F: Forwarder + ?Sized>(&mut self, address: &str, forwarder: &mut F) -> usize {
        if address.is_empty() {
            let mut reset = 0;
            for tunnel in self.tunnels.iter_mut() {
                if tunnel.state == PairState::Unpaired {
                    continue;
                }
                if let Some(old) = tunnel.unpair() {
                    forwarder.deactivate(Deactivate::Pairing(&old));
                }
                reset += 1;
            }
            if reset > 0 {
                log::info!("Reset {} tunnels to unpaired", reset);
            }
            return reset;
        }

        match self.tunnels.iter_mut().find(|t| t.pairing_id == address) {
            Some(tunnel) => {
                tunnel.unpair();
                log::info!(
                    "Tunnel {}/{} {} -> {} offline ({})",
                    tunnel.cloud_id,
                    tunnel.device_id,
                    tunnel.local_port,
                    tunnel.remote_port,
                    address
                );
                forwarder.deactivate(Deactivate::Pairing(address));
                1
            }
            None => {
                // Endpoint opened for a peer's request rather than one of ours
                log::debug!("Offline {} matches no configured tunnel", address);
                forwarder.deactivate(Deactivate::Pairing(address));
                0
            }
        }
    }

    /// `tunnel_request/<pairing_id>/<port>`
    pub fn on_tunnel_request<F: Forwarder + ?Sized>(
        &mut self,
        peer: &Peer<'_>,
        args: &[&str],
        forwarder: &mut F,
    ) -> Result<TunnelReply, ProtocolError> {
        let [pairing_id, port] = expect_args::<2>(TUNNEL_REQUEST, args)?;
        let port = parse_port(TUNNEL_REQUEST, port)?;

        // Denied is the longer status; if it encodes, so does ok
        let reply = |status: &str| TunnelReply {
            to_cloud: peer.cloud.to_string(),
            to_device: peer.device.to_string(),
            to_address: peer.address.to_string(),
            tp: format!("{}/{}/{}/{}", TUNNEL_RESPONSE, pairing_id, port, status),
        };
        if let Err(source) = codec::encode(&reply(STATUS_DENIED).as_message()) {
            return Err(ProtocolError::Unanswerable {
                command: TUNNEL_REQUEST,
                source,
            });
        }

        let accepted =
            self.allowed.contains(&port) && forwarder.open_endpoint(peer, pairing_id, port);
        let status = if accepted { STATUS_OK } else { STATUS_DENIED };
        log::info!(
            "Tunnel request {} from {}/{} for port {}: {}",
            pairing_id,
            peer.cloud,
            peer.device,
            port,
            status
        );

        Ok(reply(status))
    }

    /// `tunnel_response/<pairing_id>/<port>/<status>`
    pub fn on_tunnel_response<F: Forwarder + ?Sized>(
        &mut self,
        args: &[&str],
        forwarder: &mut F,
    ) -> Result<(), ProtocolError> {
        let [pairing_id, port, status] = expect_args::<3>(TUNNEL_RESPONSE, args)?;
        let port = parse_port(TUNNEL_RESPONSE, port)?;

        let tunnel = self
            .find_by_pairing(pairing_id)
            .ok_or_else(|| ProtocolError::UnknownPairing(pairing_id.to_string()))?;
        if tunnel.remote_port != port {
            return Err(ProtocolError::InvalidArgument {
                command: TUNNEL_RESPONSE,
                value: port.to_string(),
            });
        }

        log::info!("Tunnel response {} port {}: {}", pairing_id, port, status);
        forwarder.tunnel_response(tunnel, status);
        Ok(())
    }

    /// `tunnel_update/<pairing_id>/<status>`
    pub fn on_tunnel_update<F: Forwarder + ?Sized>(
        &mut self,
        args: &[&str],
        forwarder: &mut F,
    ) -> Result<(), ProtocolError> {
        let [pairing_id, status] = expect_args::<2>(TUNNEL_UPDATE, args)?;
        log::debug!("Tunnel update {}: {}", pairing_id, status);
        forwarder.tunnel_update(pairing_id, status);
        Ok(())
    }
}

fn expect_args<'a, const N: usize>(
    command: &'static str,
    args: &[&'a str],
) -> Result<[&'a str; N], ProtocolError> {
    <[&str; N]>::try_from(args).map_err(|_| ProtocolError::ArgumentCount {
        command,
        expected: N,
        got: args.len(),
    })
}

fn parse_port(command: &'static str, value: &str) -> Result<u16, ProtocolError> {
    match value.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ProtocolError::InvalidArgument {
            command,
            value: value.to_string(),
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================
