//! Trust store: pinned server certificates and peer identity pins.
//!
//! Two small persisted maps:
//!   - `trust/servers.json` — `host:port` → SHA-256 hex of the DER cert
//!   - `trust/peers.json`   — username → identity-key fingerprint
//!
//! Pin policy:
//!   - `pin` mode: a connection to an unpinned server fails with "server not
//!     trusted, confirm sas"; the observed fingerprint and its SAS are held
//!     in `pending_*` for the UI to confirm out of band. Only an explicit
//!     [`TrustStore::confirm_pending_server`] persists the pin.
//!   - A pinned server presenting a different certificate is fatal for the
//!     session; the store NEVER auto-adopts a changed fingerprint.
//!   - Peer pins are trust-on-first-use; a changed peer identity blocks
//!     traffic until the user re-verifies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use mi_crypto::sas;

use crate::error::{CoreError, Result};
use crate::fsutil;

const SERVERS_FILE: &str = "servers.json";
const PEERS_FILE: &str = "peers.json";
const MAX_TRUST_FILE_BYTES: u64 = 1024 * 1024;

pub struct TrustStore {
    dir: PathBuf,
    servers: HashMap<String, String>,
    peers: HashMap<String, String>,
    pending_server_key: Option<String>,
    pub pending_server_fingerprint: Option<String>,
    pub pending_server_pin: Option<String>,
}

fn server_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

impl TrustStore {
    /// Load both maps from `dir` (missing files mean empty stores).
    pub fn load(dir: &Path) -> Result<Self> {
        let servers = load_map(&dir.join(SERVERS_FILE))?;
        let peers = load_map(&dir.join(PEERS_FILE))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            servers,
            peers,
            pending_server_key: None,
            pending_server_fingerprint: None,
            pending_server_pin: None,
        })
    }

    // ── Server pins ──────────────────────────────────────────────────────

    pub fn server_pin(&self, host: &str, port: u16) -> Option<&str> {
        self.servers.get(&server_key(host, port)).map(String::as_str)
    }

    /// Record an unconfirmed fingerprint observed during connect, together
    /// with its SAS for the confirmation dialog.
    pub fn set_pending_server(&mut self, host: &str, port: u16, fingerprint_hex: &str) {
        self.pending_server_key = Some(server_key(host, port));
        self.pending_server_fingerprint = Some(fingerprint_hex.to_string());
        self.pending_server_pin = sas::sas80_from_fingerprint_hex(fingerprint_hex);
    }

    pub fn clear_pending_server(&mut self) {
        self.pending_server_key = None;
        self.pending_server_fingerprint = None;
        self.pending_server_pin = None;
    }

    /// The user compared the SAS out of band; persist the pending pin.
    pub fn confirm_pending_server(&mut self) -> Result<()> {
        let (key, fingerprint) = match (&self.pending_server_key, &self.pending_server_fingerprint)
        {
            (Some(k), Some(f)) => (k.clone(), f.clone()),
            _ => return Err(CoreError::Trust("no pending server fingerprint".into())),
        };
        self.servers.insert(key, fingerprint);
        self.save_servers()?;
        self.clear_pending_server();
        Ok(())
    }

    // ── Peer pins ────────────────────────────────────────────────────────

    pub fn peer_pin(&self, username: &str) -> Option<&str> {
        self.peers.get(username).map(String::as_str)
    }

    /// Trust-on-first-use for peers: pin on first sight, reject change.
    pub fn check_or_pin_peer(&mut self, username: &str, fingerprint_hex: &str) -> Result<()> {
        match self.peers.get(username) {
            Some(pinned) if pinned == fingerprint_hex => Ok(()),
            Some(_) => Err(CoreError::Trust(format!(
                "peer identity changed for {username}"
            ))),
            None => {
                self.peers
                    .insert(username.to_string(), fingerprint_hex.to_string());
                self.save_peers()
            }
        }
    }

    // ── Persistence ──────────────────────────────────────────────────────

    fn save_servers(&self) -> Result<()> {
        save_map(&self.dir.join(SERVERS_FILE), &self.servers)
    }

    fn save_peers(&self) -> Result<()> {
        save_map(&self.dir.join(PEERS_FILE), &self.peers)
    }
}

fn load_map(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = fsutil::read_limited(path, MAX_TRUST_FILE_BYTES)
        .map_err(|e| CoreError::Trust(format!("read {}: {e}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| CoreError::Trust(format!("parse {}: {e}", path.display())))
}

fn save_map(path: &Path, map: &HashMap<String, String>) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(map)
        .map_err(|e| CoreError::Trust(format!("encode trust store: {e}")))?;
    fsutil::write_atomic(path, &bytes)
        .map_err(|e| CoreError::Trust(format!("write {}: {e}", path.display())))
}
