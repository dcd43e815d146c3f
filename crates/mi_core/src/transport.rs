//! The transport session: one logical request/response stream to the server.
//!
//! Three interchangeable stream kinds, chosen from configuration:
//!   - **Tcp** — plain framed TCP with 30 s send/recv timeouts
//!   - **Tls** — rustls over TCP; after the handshake the certificate's
//!     SHA-256 fingerprint is compared against the trust-store pin in
//!     constant time (modes: `ca`, `pin`, `cap`)
//!   - **Kcp** — reliable UDP: a three-message cookie handshake
//!     (HELLO → CHALLENGE → RESPONSE), then ARQ frames driven by
//!     `peeksize`/`check`/`update`
//!
//! A SOCKS5 proxy (optional username/password) may be chained in front of
//! TCP/TLS; KCP is mutually exclusive with both TLS and the proxy.
//!
//! The owner caches one connected stream. `matches` compares every
//! connection-relevant parameter; any change drops the cache. Any I/O error
//! tears the stream down — the next call reconnects.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use mi_proto::wire::{self, FRAME_HEADER_BYTES};

use crate::config::{KcpConfig, ProxyConfig, TlsVerifyMode};

const TCP_TIMEOUT: Duration = Duration::from_secs(30);

const KCP_COOKIE_CMD: u8 = 0xFF;
const KCP_COOKIE_HELLO: u8 = 1;
const KCP_COOKIE_CHALLENGE: u8 = 2;
const KCP_COOKIE_RESPONSE: u8 = 3;
const KCP_COOKIE_BYTES: usize = 16;
const KCP_COOKIE_PACKET_BYTES: usize = 24;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Transport-level failure. Trust failures carry the observed fingerprint so
/// the owner can surface the SAS confirmation flow.
#[derive(Debug)]
pub enum StreamError {
    /// No pin exists and the policy requires one.
    NotTrusted { fingerprint: String },
    /// A pin exists and the presented certificate differs. Never auto-adopt.
    FingerprintChanged { fingerprint: String },
    Io(String),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotTrusted { .. } => write!(f, "server not trusted, confirm sas"),
            Self::FingerprintChanged { .. } => write!(f, "server fingerprint changed, confirm sas"),
            Self::Io(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

type StreamResult<T> = std::result::Result<T, StreamError>;

// ── Connection parameters ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub verify_mode: TlsVerifyMode,
    pub verify_hostname: bool,
    pub ca_bundle_path: Option<std::path::PathBuf>,
    pub use_kcp: bool,
    pub kcp: KcpConfig,
    pub proxy: ProxyConfig,
    pub pinned_fingerprint: Option<String>,
}

// ── The stream ───────────────────────────────────────────────────────────────

pub struct RemoteStream {
    cfg: TransportConfig,
    kind: StreamKind,
}

enum StreamKind {
    Tcp(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
    Kcp(KcpTunnel),
}

impl RemoteStream {
    /// True when a cached stream can serve a request under `cfg` unchanged.
    pub fn matches(&self, cfg: &TransportConfig) -> bool {
        self.cfg == *cfg
    }

    pub fn connect(cfg: TransportConfig) -> StreamResult<Self> {
        let kind = if cfg.use_kcp {
            StreamKind::Kcp(KcpTunnel::connect(&cfg)?)
        } else if cfg.use_tls {
            StreamKind::Tls(Box::new(connect_tls(&cfg)?))
        } else {
            StreamKind::Tcp(connect_tcp(&cfg)?)
        };
        Ok(Self { cfg, kind })
    }

    /// One framed round trip. Returns the full response frame.
    pub fn send_and_recv(&mut self, frame: &[u8]) -> StreamResult<Vec<u8>> {
        if frame.is_empty() {
            return Err(StreamError::Io("empty request".into()));
        }
        match &mut self.kind {
            StreamKind::Tcp(sock) => {
                sock.write_all(frame)?;
                read_frame(sock)
            }
            StreamKind::Tls(stream) => {
                stream.write_all(frame)?;
                read_frame(stream.as_mut())
            }
            StreamKind::Kcp(tunnel) => tunnel.send_and_recv(frame),
        }
    }
}

/// Read exactly one `type || len || payload` frame from a byte stream.
fn read_frame<S: Read>(stream: &mut S) -> StreamResult<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_BYTES];
    stream.read_exact(&mut header)?;
    let (_, payload_len) =
        wire::decode_frame_header(&header).map_err(|_| StreamError::Io("bad frame header".into()))?;
    let mut out = vec![0u8; FRAME_HEADER_BYTES + payload_len as usize];
    out[..FRAME_HEADER_BYTES].copy_from_slice(&header);
    stream.read_exact(&mut out[FRAME_HEADER_BYTES..])?;
    Ok(out)
}

// ── TCP + SOCKS5 ─────────────────────────────────────────────────────────────

fn connect_tcp(cfg: &TransportConfig) -> StreamResult<TcpStream> {
    if cfg.host.is_empty() || cfg.port == 0 {
        return Err(StreamError::Io("invalid endpoint".into()));
    }
    let (connect_host, connect_port) = if cfg.proxy.enabled() {
        (cfg.proxy.host.as_str(), cfg.proxy.port)
    } else {
        (cfg.host.as_str(), cfg.port)
    };

    let addrs: Vec<_> = (connect_host, connect_port)
        .to_socket_addrs()
        .map_err(|e| StreamError::Io(format!("resolve {connect_host}: {e}")))?
        .collect();
    let addr = addrs
        .first()
        .ok_or_else(|| StreamError::Io(format!("resolve {connect_host}: no address")))?;
    let sock = TcpStream::connect_timeout(addr, TCP_TIMEOUT)
        .map_err(|e| StreamError::Io(format!("connect {addr}: {e}")))?;
    sock.set_read_timeout(Some(TCP_TIMEOUT))?;
    sock.set_write_timeout(Some(TCP_TIMEOUT))?;
    sock.set_nodelay(true).ok();

    if cfg.proxy.enabled() {
        socks5_connect(&sock, &cfg.proxy, &cfg.host, cfg.port)?;
    }
    Ok(sock)
}

/// Minimal SOCKS5 CONNECT (RFC 1928) with optional username/password auth
/// (RFC 1929). The target address always goes through as a domain name so
/// DNS resolves on the proxy side.
fn socks5_connect(
    mut sock: &TcpStream,
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
) -> StreamResult<()> {
    let with_auth = !proxy.username.is_empty() || !proxy.password.is_empty();

    let mut greeting = vec![0x05u8];
    if with_auth {
        greeting.extend_from_slice(&[0x02, 0x00, 0x02]);
    } else {
        greeting.extend_from_slice(&[0x01, 0x00]);
    }
    sock.write_all(&greeting)?;

    let mut reply = [0u8; 2];
    sock.read_exact(&mut reply)?;
    if reply[0] != 0x05 {
        return Err(StreamError::Io("proxy connect failed".into()));
    }
    match reply[1] {
        0x00 => {}
        0x02 => {
            if proxy.username.len() > 255 || proxy.password.len() > 255 {
                return Err(StreamError::Io("proxy auth failed".into()));
            }
            let mut auth = Vec::with_capacity(3 + proxy.username.len() + proxy.password.len());
            auth.push(0x01);
            auth.push(proxy.username.len() as u8);
            auth.extend_from_slice(proxy.username.as_bytes());
            auth.push(proxy.password.len() as u8);
            auth.extend_from_slice(proxy.password.as_bytes());
            sock.write_all(&auth)?;

            let mut auth_reply = [0u8; 2];
            sock.read_exact(&mut auth_reply)?;
            if auth_reply[1] != 0x00 {
                return Err(StreamError::Io("proxy auth failed".into()));
            }
        }
        _ => return Err(StreamError::Io("proxy connect failed".into())),
    }

    if host.len() > 255 {
        return Err(StreamError::Io("proxy connect failed".into()));
    }
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03]);
    request.push(host.len() as u8);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    sock.write_all(&request)?;

    let mut head = [0u8; 4];
    sock.read_exact(&mut head)?;
    if head[0] != 0x05 || head[1] != 0x00 {
        return Err(StreamError::Io("proxy connect failed".into()));
    }
    // Skip the bound address, whose size depends on the address type.
    let skip = match head[3] {
        0x01 => 4 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            sock.read_exact(&mut len)?;
            len[0] as usize + 2
        }
        0x04 => 16 + 2,
        _ => return Err(StreamError::Io("proxy connect failed".into())),
    };
    let mut discard = vec![0u8; skip];
    sock.read_exact(&mut discard)?;
    Ok(())
}

// ── TLS ──────────────────────────────────────────────────────────────────────

fn install_crypto_provider() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Verifier that accepts any certificate chain but still validates the
/// handshake signatures. Used in `pin` mode (and with hostname verification
/// off), where trust comes exclusively from the pinned fingerprint compared
/// after the handshake.
#[derive(Debug)]
struct PinnedCertVerifier {
    algorithms: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl rustls::client::danger::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn tls_client_config(cfg: &TransportConfig) -> StreamResult<rustls::ClientConfig> {
    install_crypto_provider();
    let provider = rustls::crypto::ring::default_provider();

    let pin_only = cfg.verify_mode == TlsVerifyMode::Pin || !cfg.verify_hostname;
    if pin_only {
        let verifier = PinnedCertVerifier {
            algorithms: provider.signature_verification_algorithms,
        };
        return Ok(rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth());
    }

    // ca / cap: validate against the configured CA bundle.
    let path = cfg
        .ca_bundle_path
        .as_ref()
        .ok_or_else(|| StreamError::Io("tls ca bundle missing".into()))?;
    let pem = std::fs::read(path)
        .map_err(|e| StreamError::Io(format!("tls ca bundle {}: {e}", path.display())))?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.map_err(|e| StreamError::Io(format!("tls ca bundle: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| StreamError::Io(format!("tls ca bundle: {e}")))?;
    }
    if roots.is_empty() {
        return Err(StreamError::Io("tls ca bundle empty".into()));
    }
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn connect_tls(
    cfg: &TransportConfig,
) -> StreamResult<rustls::StreamOwned<rustls::ClientConnection, TcpStream>> {
    let mut sock = connect_tcp(cfg)?;
    let tls_config = Arc::new(tls_client_config(cfg)?);

    let server_name = rustls::pki_types::ServerName::try_from(cfg.host.clone())
        .map_err(|_| StreamError::Io("invalid tls server name".into()))?;
    let mut conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| StreamError::Io(format!("tls setup: {e}")))?;

    // Drive the handshake to completion so the peer certificate is known
    // before any application byte leaves this host.
    while conn.is_handshaking() {
        conn.complete_io(&mut sock)
            .map_err(|e| StreamError::Io(format!("tls handshake: {e}")))?;
    }

    let cert_der = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| StreamError::Io("tls peer certificate missing".into()))?;
    let fingerprint = hex::encode(Sha256::digest(cert_der.as_ref()));

    match &cfg.pinned_fingerprint {
        Some(pinned) => {
            let equal: bool = pinned
                .as_bytes()
                .ct_eq(fingerprint.as_bytes())
                .into();
            if !equal {
                return Err(StreamError::FingerprintChanged { fingerprint });
            }
        }
        None => {
            if cfg.verify_mode == TlsVerifyMode::Pin {
                return Err(StreamError::NotTrusted { fingerprint });
            }
            // ca / cap without a stored pin: the CA chain carried the trust.
        }
    }

    Ok(rustls::StreamOwned::new(conn, sock))
}

// ── KCP ──────────────────────────────────────────────────────────────────────

struct UdpOutput {
    sock: Arc<UdpSocket>,
}

impl Write for UdpOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.sock.send(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct KcpTunnel {
    sock: Arc<UdpSocket>,
    kcp: kcp::Kcp<UdpOutput>,
    cfg: KcpConfig,
    epoch: Instant,
    last_active: Instant,
    datagram: Vec<u8>,
}

impl KcpTunnel {
    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    fn connect(cfg: &TransportConfig) -> StreamResult<Self> {
        if cfg.host.is_empty() || cfg.port == 0 {
            return Err(StreamError::Io("invalid endpoint".into()));
        }
        if cfg.proxy.enabled() {
            return Err(StreamError::Io("kcp does not support a proxy".into()));
        }

        let sock = UdpSocket::bind(("0.0.0.0", 0))?;
        sock.connect((cfg.host.as_str(), cfg.port))
            .map_err(|e| StreamError::Io(format!("kcp connect: {e}")))?;
        sock.set_nonblocking(true)?;
        let sock = Arc::new(sock);

        let mut conv = 0u32;
        while conv == 0 {
            conv = OsRng.next_u32();
        }

        // Cookie handshake: HELLO → CHALLENGE(cookie) → RESPONSE(cookie).
        let timeout = Duration::from_millis(u64::from(cfg.kcp.request_timeout_ms.max(1)));
        send_cookie_packet(&sock, conv, KCP_COOKIE_HELLO, &[0u8; KCP_COOKIE_BYTES])?;

        let start = Instant::now();
        let mut cookie = [0u8; KCP_COOKIE_BYTES];
        loop {
            let mut buf = [0u8; 64];
            match sock.recv(&mut buf) {
                Ok(n)
                    if n >= KCP_COOKIE_PACKET_BYTES
                        && buf[4] == KCP_COOKIE_CMD
                        && u32::from_le_bytes(buf[..4].try_into().unwrap()) == conv
                        && buf[5] == KCP_COOKIE_CHALLENGE =>
                {
                    cookie.copy_from_slice(&buf[8..8 + KCP_COOKIE_BYTES]);
                    break;
                }
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() > timeout {
                        return Err(StreamError::Io("kcp cookie timeout".into()));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(StreamError::Io(format!("kcp cookie recv: {e}"))),
            }
        }
        send_cookie_packet(&sock, conv, KCP_COOKIE_RESPONSE, &cookie)?;

        let output = UdpOutput { sock: Arc::clone(&sock) };
        let mut kcp = kcp::Kcp::new(conv, output);
        kcp.set_mtu(cfg.kcp.mtu as usize)
            .map_err(|e| StreamError::Io(format!("kcp mtu: {e}")))?;
        kcp.set_wndsize(cfg.kcp.snd_wnd, cfg.kcp.rcv_wnd);
        kcp.set_nodelay(
            cfg.kcp.nodelay != 0,
            cfg.kcp.interval as i32,
            cfg.kcp.resend as i32,
            cfg.kcp.nc != 0,
        );
        if cfg.kcp.min_rto > 0 {
            kcp.set_rx_minrto(cfg.kcp.min_rto as _);
        }

        let datagram = vec![0u8; cfg.kcp.mtu.max(1200) as usize + 256];
        Ok(Self {
            sock,
            kcp,
            cfg: cfg.kcp.clone(),
            epoch: Instant::now(),
            last_active: Instant::now(),
            datagram,
        })
    }

    fn send_and_recv(&mut self, frame: &[u8]) -> StreamResult<Vec<u8>> {
        if self.cfg.session_idle_sec > 0
            && self.last_active.elapsed() > Duration::from_secs(u64::from(self.cfg.session_idle_sec))
        {
            return Err(StreamError::Io("kcp idle timeout".into()));
        }

        self.kcp
            .send(frame)
            .map_err(|e| StreamError::Io(format!("kcp send: {e}")))?;
        self.kcp
            .flush()
            .map_err(|e| StreamError::Io(format!("kcp flush: {e}")))?;
        self.last_active = Instant::now();

        let timeout_ms = if self.cfg.request_timeout_ms == 0 {
            5000
        } else {
            self.cfg.request_timeout_ms
        };
        let start = Instant::now();

        loop {
            if start.elapsed() > Duration::from_millis(u64::from(timeout_ms)) {
                return Err(StreamError::Io("kcp timeout".into()));
            }

            // Drain every datagram the socket has for us into the ARQ.
            loop {
                match self.sock.recv(&mut self.datagram) {
                    Ok(0) => break,
                    Ok(n) => {
                        let _ = self.kcp.input(&self.datagram[..n]);
                        self.last_active = Instant::now();
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(StreamError::Io(format!("kcp recv: {e}"))),
                }
            }

            if let Ok(size) = self.kcp.peeksize() {
                if size > 0 {
                    let mut out = vec![0u8; size];
                    let n = self
                        .kcp
                        .recv(&mut out)
                        .map_err(|e| StreamError::Io(format!("kcp recv: {e}")))?;
                    out.truncate(n);
                    return Ok(out);
                }
            }

            let now = self.now_ms();
            let next = self.kcp.check(now);
            let wait = next.saturating_sub(now).clamp(1, 50);
            std::thread::sleep(Duration::from_millis(u64::from(wait)));
            let now = self.now_ms();
            self.kcp
                .update(now)
                .map_err(|e| StreamError::Io(format!("kcp update: {e}")))?;
        }
    }
}

fn send_cookie_packet(
    sock: &UdpSocket,
    conv: u32,
    packet_type: u8,
    cookie: &[u8; KCP_COOKIE_BYTES],
) -> StreamResult<()> {
    let mut packet = [0u8; KCP_COOKIE_PACKET_BYTES];
    packet[..4].copy_from_slice(&conv.to_le_bytes());
    packet[4] = KCP_COOKIE_CMD;
    packet[5] = packet_type;
    packet[8..].copy_from_slice(cookie);
    let sent = sock.send(&packet)?;
    if sent != packet.len() {
        return Err(StreamError::Io("kcp cookie send failed".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn base_cfg(port: u16) -> TransportConfig {
        TransportConfig {
            host: "127.0.0.1".into(),
            port,
            use_tls: false,
            verify_mode: TlsVerifyMode::Pin,
            verify_hostname: true,
            ca_bundle_path: None,
            use_kcp: false,
            kcp: KcpConfig::default(),
            proxy: ProxyConfig::default(),
            pinned_fingerprint: None,
        }
    }

    #[test]
    fn tcp_round_trip_against_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut header = [0u8; FRAME_HEADER_BYTES];
            sock.read_exact(&mut header).unwrap();
            let (_, len) = wire::decode_frame_header(&header).unwrap();
            let mut payload = vec![0u8; len as usize];
            sock.read_exact(&mut payload).unwrap();

            // Echo the payload back under a Heartbeat frame.
            let reply = wire::encode_frame(wire::FrameType::Heartbeat, &payload).unwrap();
            sock.write_all(&reply).unwrap();
        });

        let mut stream = RemoteStream::connect(base_cfg(port)).unwrap();
        let request = wire::encode_frame(wire::FrameType::Heartbeat, b"ping").unwrap();
        let response = stream.send_and_recv(&request).unwrap();
        let (frame_type, payload) = wire::decode_frame(&response).unwrap();
        assert_eq!(frame_type, wire::FrameType::Heartbeat);
        assert_eq!(payload, b"ping");
        server.join().unwrap();
    }

    #[test]
    fn cache_matching_tracks_parameters() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let cfg = base_cfg(port);
        let handle = std::thread::spawn(move || {
            let _ = listener.accept();
        });
        let stream = RemoteStream::connect(cfg.clone()).unwrap();
        assert!(stream.matches(&cfg));

        let mut other = cfg.clone();
        other.pinned_fingerprint = Some("aa".repeat(32));
        assert!(!stream.matches(&other));

        let mut other = cfg.clone();
        other.kcp.mtu += 1;
        assert!(!stream.matches(&other));

        let mut other = cfg;
        other.proxy.proxy_type = ProxyType::Socks5;
        other.proxy.host = "p".into();
        other.proxy.port = 1;
        assert!(!stream.matches(&other));
        handle.join().unwrap();
    }

    use crate::config::ProxyType;

    #[test]
    fn kcp_rejects_proxy() {
        let mut cfg = base_cfg(1);
        cfg.use_kcp = true;
        cfg.proxy.proxy_type = ProxyType::Socks5;
        cfg.proxy.host = "p".into();
        cfg.proxy.port = 1;
        assert!(matches!(
            RemoteStream::connect(cfg),
            Err(StreamError::Io(_))
        ));
    }

    #[test]
    fn empty_request_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let _ = listener.accept();
        });
        let mut stream = RemoteStream::connect(base_cfg(port)).unwrap();
        assert!(stream.send_and_recv(&[]).is_err());
        handle.join().unwrap();
    }
}
