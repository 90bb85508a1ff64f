//! Active tunnel registry
//!
//! The data-plane side of the client. It tracks which tunnels are live,
//! keyed by pairing id: tunnels paired from the config, and endpoints
//! opened for peers that asked to reach one of our allowed ports.

use std::collections::HashMap;

use relay_session::{Deactivate, Forwarder, Peer, Tunnel};

/// How a live tunnel came about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Paired from one of our configured tunnels
    Configured { local_port: u16, remote_port: u16 },
    /// Opened for a peer's tunnel request
    Peer { address: String, port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTunnel {
    pub cloud: String,
    pub device: String,
    pub origin: Origin,
    /// Last status from a tunnel_response/tunnel_update
    pub status: Option<String>,
}

#[derive(Debug, Default)]
pub struct TunnelRegistry {
    active: HashMap<String, ActiveTunnel>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    fn set_status(&mut self, pairing_id: &str, status: &str) {
        match self.active.get_mut(pairing_id) {
            Some(tunnel) => tunnel.status = Some(status.to_string()),
            None => log::debug!("Status {} for inactive tunnel {}", status, pairing_id),
        }
    }
}

impl Forwarder for TunnelRegistry {
    fn activate(&mut self, tunnel: &Tunnel) {
        log::info!(
            "Tunnel up: {} localhost:{} -> {}/{}:{}",
            tunnel.pairing_id,
            tunnel.local_port,
            tunnel.cloud_id,
            tunnel.device_id,
            tunnel.remote_port
        );
        self.active.insert(
            tunnel.pairing_id.clone(),
            ActiveTunnel {
                cloud: tunnel.cloud_id.clone(),
                device: tunnel.device_id.clone(),
                origin: Origin::Configured {
                    local_port: tunnel.local_port,
                    remote_port: tunnel.remote_port,
                },
                status: None,
            },
        );
    }

    fn deactivate(&mut self, target: Deactivate<'_>) {
        match target {
            Deactivate::Pairing(id) => {
                if self.active.remove(id).is_some() {
                    log::info!("Tunnel down: {} ({} active)", id, self.len());
                }
            }
            Deactivate::All => {
                if !self.active.is_empty() {
                    log::info!("All tunnels down ({} active)", self.active.len());
                }
                self.active.clear();
            }
        }
    }

    fn open_endpoint(&mut self, peer: &Peer<'_>, pairing_id: &str, port: u16) -> bool {
        if self.active.contains_key(pairing_id) {
            log::warn!("Pairing {} already in use, refusing {}", pairing_id, peer.address);
            return false;
        }

        log::info!(
            "Endpoint open: {} {}/{} -> localhost:{}",
            pairing_id,
            peer.cloud,
            peer.device,
            port
        );
        self.active.insert(
            pairing_id.to_string(),
            ActiveTunnel {
                cloud: peer.cloud.to_string(),
                device: peer.device.to_string(),
                origin: Origin::Peer {
                    address: peer.address.to_string(),
                    port,
                },
                status: None,
            },
        );
        true
    }

    fn tunnel_response(&mut self, tunnel: &Tunnel, status: &str) {
        self.set_status(&tunnel.pairing_id, status);
    }

    fn tunnel_update(&mut self, pairing_id: &str, status: &str) {
        self.set_status(pairing_id, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer<'static> {
        Peer {
            cloud: "bob",
            device: "laptop",
            address: "addr-7",
        }
    }

    #[test]
    fn test_endpoint_lifecycle() {
        let mut registry = TunnelRegistry::new();
        assert!(registry.open_endpoint(&peer(), "x1", 22));
        assert_eq!(registry.len(), 1);

        // Same pairing id twice is refused
        assert!(!registry.open_endpoint(&peer(), "x1", 22));

        registry.tunnel_update("x1", "connected");
        assert_eq!(
            registry.active["x1"].status.as_deref(),
            Some("connected")
        );

        registry.deactivate(Deactivate::Pairing("x1"));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_deactivate_all() {
        let mut registry = TunnelRegistry::new();
        registry.open_endpoint(&peer(), "x1", 22);
        registry.open_endpoint(&peer(), "x2", 80);

        registry.deactivate(Deactivate::All);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_status_for_unknown_pairing_ignored() {
        let mut registry = TunnelRegistry::new();
        registry.tunnel_update("zz", "closed");
        assert!(registry.active.is_empty());
    }
}
