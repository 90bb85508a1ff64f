//! TLS over TCP to the relay, driven by mio readiness
//!
//! The socket is registered on the caller's poll under [`UPSTREAM_TOKEN`].
//! On every readiness event for that token the event loop calls
//! [`TlsTransport::process_io`] and feeds the returned events to the
//! session.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::TransportError;
use crate::session::Transport;

/// mio token for the relay socket
pub const UPSTREAM_TOKEN: Token = Token(0);

/// What one readiness event produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// TLS handshake finished; the session may log in
    Connected,
    /// Decrypted bytes from the relay
    Data(Vec<u8>),
    /// Connection is gone; the transport already released it
    Closed(String),
}

struct Connection {
    socket: TcpStream,
    tls: ClientConnection,
    established: bool,
}

pub struct TlsTransport {
    registry: Registry,
    tls_config: Arc<ClientConfig>,
    /// SNI override; the connect host is used when unset
    server_name: Option<String>,
    /// Address looked up ahead of time by [`TlsTransport::resolve`]
    resolved: Option<(String, u16, SocketAddr)>,
    conn: Option<Connection>,
}

impl TlsTransport {
    /// Transport verifying the relay against the webpki roots, or accepting
    /// any certificate when `insecure` is set
    pub fn new(
        registry: &Registry,
        server_name: Option<&str>,
        insecure: bool,
    ) -> Result<Self, TransportError> {
        Self::with_config(registry, client_config(insecure)?, server_name)
    }

    pub fn with_config(
        registry: &Registry,
        tls_config: Arc<ClientConfig>,
        server_name: Option<&str>,
    ) -> Result<Self, TransportError> {
        Ok(TlsTransport {
            registry: registry.try_clone()?,
            tls_config,
            server_name: server_name.map(str::to_string),
            resolved: None,
            conn: None,
        })
    }

    /// Look the relay up now, before the event loop runs
    ///
    /// Later connects to the same host and port reuse the address, so
    /// reconnecting never waits on DNS.
    pub fn resolve(&mut self, host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        let addr = lookup(host, port)?;
        self.resolved = Some((host.to_string(), port, addr));
        Ok(addr)
    }

    fn address(&self, host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        if let Some((h, p, addr)) = &self.resolved {
            if h == host && *p == port {
                return Ok(*addr);
            }
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        log::debug!("{}:{} not resolved ahead of time", host, port);
        lookup(host, port)
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Pump the socket after a readiness event
    pub fn process_io(&mut self, readable: bool, writable: bool) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        let Some(conn) = self.conn.as_mut() else {
            return events;
        };

        if let Err(e) = conn.pump(readable, writable, &mut events) {
            log::debug!("Relay connection failed: {}", e);
            events.push(TransportEvent::Closed(e.to_string()));
            self.release();
        }
        events
    }

    fn release(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.tls.send_close_notify();
            if let Err(e) = conn.flush() {
                log::debug!("close_notify not delivered: {}", e);
            }
            if let Err(e) = self.registry.deregister(&mut conn.socket) {
                log::debug!("Failed to deregister relay socket: {}", e);
            }
        }
    }
}

impl Transport for TlsTransport {
    fn connect(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        self.release();

        let addr = self.address(host, port)?;

        let name = self.server_name.as_deref().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| TransportError::InvalidServerName(name))?;
        let tls = ClientConnection::new(self.tls_config.clone(), server_name)?;

        let mut socket = TcpStream::connect(addr)?;
        self.registry.register(
            &mut socket,
            UPSTREAM_TOKEN,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        log::debug!("TCP connect to {} started", addr);

        self.conn = Some(Connection {
            socket,
            tls,
            established: false,
        });
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let conn = self.conn.as_mut().ok_or(TransportError::NotConnected)?;
        conn.tls.writer().write_all(frame)?;
        conn.flush()
    }

    fn shutdown(&mut self) {
        self.release();
    }
}

fn lookup(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Resolve(format!("{}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| TransportError::Resolve(format!("{}:{}", host, port)))
}

impl Connection {
    fn pump(
        &mut self,
        readable: bool,
        writable: bool,
        events: &mut Vec<TransportEvent>,
    ) -> Result<(), TransportError> {
        if writable && !self.established {
            if let Some(e) = self.socket.take_error()? {
                return Err(e.into());
            }
        }

        if readable {
            self.read(events)?;
        }
        self.flush()
    }

    fn read(&mut self, events: &mut Vec<TransportEvent>) -> Result<(), TransportError> {
        loop {
            match self.tls.read_tls(&mut self.socket) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let state = match self.tls.process_new_packets() {
                Ok(state) => state,
                Err(e) => {
                    // Let the alert go out before the socket drops
                    let _ = self.flush();
                    return Err(e.into());
                }
            };

            if !self.established && !self.tls.is_handshaking() {
                self.established = true;
                log::debug!(
                    "TLS established ({:?})",
                    self.tls.negotiated_cipher_suite().map(|s| s.suite())
                );
                events.push(TransportEvent::Connected);
            }

            let pending = state.plaintext_bytes_to_read();
            if pending > 0 {
                let mut data = vec![0u8; pending];
                self.tls.reader().read_exact(&mut data)?;
                events.push(TransportEvent::Data(data));
            }

            if state.peer_has_closed() {
                return Err(TransportError::Closed);
            }
        }
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.socket) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn client_config(insecure: bool) -> Result<Arc<ClientConfig>, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?;

    let config = if insecure {
        log::warn!("Relay certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Accepts any server certificate
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;

    #[test]
    fn test_idle_transport() {
        let poll = Poll::new().unwrap();
        let mut transport = TlsTransport::new(poll.registry(), None, true).unwrap();

        assert!(!transport.is_connected());
        assert!(transport.process_io(true, true).is_empty());
        assert!(matches!(
            transport.send(b"frame"),
            Err(TransportError::NotConnected)
        ));
        // No connection: no-op
        transport.shutdown();
    }

    #[test]
    fn test_invalid_server_name() {
        let poll = Poll::new().unwrap();
        let mut transport =
            TlsTransport::new(poll.registry(), Some("not a name!"), false).unwrap();

        assert!(matches!(
            transport.connect("127.0.0.1", 9),
            Err(TransportError::InvalidServerName(_))
        ));
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_address_without_dns() {
        let poll = Poll::new().unwrap();
        let mut transport = TlsTransport::new(poll.registry(), None, true).unwrap();

        // Literal addresses never hit the resolver
        assert_eq!(
            transport.address("127.0.0.1", 17040).unwrap(),
            "127.0.0.1:17040".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            transport.address("::1", 17040).unwrap(),
            "[::1]:17040".parse::<SocketAddr>().unwrap()
        );

        // A resolved name is reused on later connects
        let addr = transport.resolve("localhost", 17040).unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(transport.address("localhost", 17040).unwrap(), addr);
        assert_eq!(transport.resolved, Some(("localhost".to_string(), 17040, addr)));
    }
}
