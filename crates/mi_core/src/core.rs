//! `ClientCore` — the single owner of every security-bearing component.
//!
//! The UI holds a shared reference and drives the core through methods;
//! all state lives behind component-level locks. A request flows:
//!
//!   engine/group seal → pad → channel wrap (token + seq AEAD) → frame →
//!   transport round trip → channel unwrap → parse
//!
//! The generic `Encrypted` frame carries a one-byte relay kind so the
//! server can fan out without reading anything else:
//!   `1` direct (`string peer || bytes ratchet-wire`),
//!   `2` group (`string group || bytes group-cipher`),
//!   `3` device-sync (`bytes sealed-event`).
//!
//! Failures never print: every public method returns a typed error and
//! mirrors it into `last_error()` for the UI.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use rand::{rngs::OsRng, RngCore};

use mi_crypto::identity;
use mi_crypto::x3dh::PrekeyBundle;
use mi_proto::envelope::{ChatEnvelope, MsgId};
use mi_proto::session::RatchetMessage;
use mi_proto::sync::DeviceSyncEvent;
use mi_proto::wire::{self, FrameType};
use mi_proto::{blob, padding};

use crate::channel::SecureChannel;
use crate::config::{AuthMode, ClientConfig, TlsVerifyMode};
use crate::device_sync::DeviceSync;
use crate::engine::PeerEngine;
use crate::error::{CoreError, Result};
use crate::group_engine::GroupEngine;
use crate::kt::{KtProof, KtVerifier};
use crate::transport::{RemoteStream, StreamError, TransportConfig};
use crate::trust::TrustStore;
use crate::{fsutil, hardware, state};

pub const RELAY_KIND_DIRECT: u8 = 1;
pub const RELAY_KIND_GROUP: u8 = 2;
pub const RELAY_KIND_DEVICE_SYNC: u8 = 3;

struct Session {
    token: String,
    channel: SecureChannel,
}

pub struct DeviceEntry {
    pub device_id: String,
    pub last_seen_sec: u32,
}

pub struct ClientCore {
    cfg: ClientConfig,
    state_dir: PathBuf,
    device_id: String,

    trust: Mutex<TrustStore>,
    stream: Mutex<Option<RemoteStream>>,
    session: Mutex<Option<Session>>,
    username: RwLock<Option<String>>,

    engine: RwLock<Option<PeerEngine>>,
    groups: RwLock<Option<GroupEngine>>,
    /// Peer username → identity signing public key, learned from verified
    /// bundles and inbound init headers. Backs group signature checks.
    peer_keys: RwLock<std::collections::HashMap<String, [u8; 32]>>,

    kt: Mutex<KtVerifier>,
    device_sync: Mutex<DeviceSync>,

    prekey_published: AtomicBool,
    cover_last_ms: Mutex<u64>,
    last_error: Mutex<String>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn new_msg_id() -> MsgId {
    *uuid::Uuid::new_v4().as_bytes()
}

impl ClientCore {
    // ── Construction ─────────────────────────────────────────────────────

    pub fn init(config_path: &Path, data_dir: &Path) -> Result<Self> {
        let cfg = ClientConfig::load(config_path)?;
        Self::init_with_config(cfg, data_dir)
    }

    pub fn init_with_config(cfg: ClientConfig, data_dir: &Path) -> Result<Self> {
        if cfg.identity.tpm_require && !hardware::is_supported() {
            return Err(CoreError::Config("tpm required but unsupported".into()));
        }

        let state_dir = data_dir.join("e2ee_state");
        std::fs::create_dir_all(&state_dir)
            .map_err(|e| CoreError::Config(format!("create state dir: {e}")))?;

        let device_id = load_or_create_device_id(&state_dir.join("device_id.bin"))?;
        let trust = TrustStore::load(&state_dir.join("trust"))?;

        let root_pubkey = load_kt_root_pubkey(&cfg)?;
        let kt = KtVerifier::load(state_dir.join("kt_state.bin"), &cfg.kt, root_pubkey)?;

        let sync_key_path = cfg
            .device_sync
            .key_path
            .clone()
            .map(|p| if p.is_absolute() { p } else { data_dir.join(p) })
            .unwrap_or_else(|| state_dir.join("device_sync_key.bin"));
        let mut device_sync = DeviceSync::new(cfg.device_sync.clone(), sync_key_path);
        if cfg.device_sync.enabled {
            if device_sync.is_primary() {
                device_sync.ensure_key()?;
            } else {
                // A linked device may still be waiting for approval.
                device_sync.load_key()?;
            }
        }

        Ok(Self {
            cfg,
            state_dir,
            device_id,
            trust: Mutex::new(trust),
            stream: Mutex::new(None),
            session: Mutex::new(None),
            username: RwLock::new(None),
            engine: RwLock::new(None),
            groups: RwLock::new(None),
            peer_keys: RwLock::new(std::collections::HashMap::new()),
            kt: Mutex::new(kt),
            device_sync: Mutex::new(device_sync),
            prekey_published: AtomicBool::new(false),
            cover_last_ms: Mutex::new(0),
            last_error: Mutex::new(String::new()),
        })
    }

    pub fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    pub fn gossip_alerted(&self) -> bool {
        self.kt.lock().gossip_alerted()
    }

    pub fn pending_server_pin(&self) -> Option<String> {
        self.trust.lock().pending_server_pin.clone()
    }

    pub fn pending_server_fingerprint(&self) -> Option<String> {
        self.trust.lock().pending_server_fingerprint.clone()
    }

    /// The user confirmed the SAS out of band: persist the pending pin.
    pub fn confirm_server_sas(&self) -> Result<()> {
        self.track(|| self.trust.lock().confirm_pending_server())
    }

    fn track<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        match f() {
            Ok(v) => {
                self.last_error.lock().clear();
                Ok(v)
            }
            Err(e) => {
                *self.last_error.lock() = e.to_string();
                Err(e)
            }
        }
    }

    // ── Transport plumbing ───────────────────────────────────────────────

    fn transport_config(&self) -> TransportConfig {
        let use_kcp = self.cfg.kcp.enable;
        let pinned = if use_kcp || self.cfg.tls_verify_mode == TlsVerifyMode::Ca {
            None
        } else {
            self.trust
                .lock()
                .server_pin(&self.cfg.server_ip, self.cfg.effective_port())
                .map(str::to_string)
        };
        TransportConfig {
            host: self.cfg.server_ip.clone(),
            port: self.cfg.effective_port(),
            use_tls: self.cfg.effective_tls(),
            verify_mode: self.cfg.tls_verify_mode,
            verify_hostname: self.cfg.tls_verify_hostname,
            ca_bundle_path: self.cfg.tls_ca_bundle_path.clone(),
            use_kcp,
            kcp: self.cfg.kcp.clone(),
            proxy: self.cfg.proxy.clone(),
            pinned_fingerprint: pinned,
        }
    }

    fn map_stream_error(&self, err: StreamError) -> CoreError {
        match err {
            StreamError::NotTrusted { fingerprint } => {
                self.trust.lock().set_pending_server(
                    &self.cfg.server_ip,
                    self.cfg.effective_port(),
                    &fingerprint,
                );
                CoreError::Trust("server not trusted, confirm sas".into())
            }
            StreamError::FingerprintChanged { fingerprint } => {
                self.trust.lock().set_pending_server(
                    &self.cfg.server_ip,
                    self.cfg.effective_port(),
                    &fingerprint,
                );
                CoreError::Trust("server fingerprint changed, confirm sas".into())
            }
            StreamError::Io(msg) => CoreError::Transport(msg),
        }
    }

    /// One raw framed round trip, holding the transport lock throughout.
    /// Any error drops the cached stream so the next call reconnects.
    fn process_raw(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let wanted = self.transport_config();
        let mut guard = self.stream.lock();

        let usable = guard.as_ref().map_or(false, |s| s.matches(&wanted));
        if !usable {
            *guard = None;
            match RemoteStream::connect(wanted) {
                Ok(stream) => {
                    self.trust.lock().clear_pending_server();
                    *guard = Some(stream);
                }
                Err(e) => return Err(self.map_stream_error(e)),
            }
        }

        let stream = guard.as_mut().expect("stream just ensured");
        match stream.send_and_recv(frame) {
            Ok(resp) => Ok(resp),
            Err(e) => {
                *guard = None;
                tracing::debug!("transport round trip failed, dropping stream");
                Err(self.map_stream_error(e))
            }
        }
    }

    fn ensure_channel(&self) -> Result<()> {
        if self.session.lock().is_none() {
            return Err(CoreError::Auth("not logged in".into()));
        }
        Ok(())
    }

    /// One authenticated request/response over the channel.
    fn process_encrypted(&self, frame_type: FrameType, plain: &[u8]) -> Result<Vec<u8>> {
        let mut session_guard = self.session.lock();

        let (token, frame) = {
            let session = session_guard
                .as_mut()
                .ok_or_else(|| CoreError::Auth("not logged in".into()))?;
            let cipher = session.channel.encrypt(frame_type, plain)?;
            let mut payload = Vec::with_capacity(2 + session.token.len() + cipher.len());
            wire::put_string(&session.token, &mut payload)?;
            payload.extend_from_slice(&cipher);
            (session.token.clone(), wire::encode_frame(frame_type, &payload)?)
        };

        let response = self.process_raw(&frame)?;
        let (resp_type, resp_payload) = wire::decode_frame(&response)?;

        let mut off = 0usize;
        let resp_token = match wire::get_string(resp_payload, &mut off) {
            Ok(t) => t,
            Err(_) => {
                if resp_type == FrameType::Logout {
                    self.invalidate_session(&mut session_guard);
                    return Err(CoreError::Auth("session invalid".into()));
                }
                return Err(CoreError::Protocol("invalid server response".into()));
            }
        };
        if !SecureChannel::token_matches(&token, &resp_token) {
            self.invalidate_session(&mut session_guard);
            return Err(CoreError::Auth("session invalid".into()));
        }

        match session_guard.as_mut() {
            Some(session) => session.channel.decrypt(resp_type, &resp_payload[off..]),
            None => Err(CoreError::Auth("session invalid".into())),
        }
    }

    /// Server declared the session dead: wipe the token/channel and drop the
    /// in-memory ratchet handles (persisting them first so a re-login can
    /// carry the conversations on).
    fn invalidate_session(&self, session_guard: &mut Option<Session>) {
        *session_guard = None;
        self.prekey_published.store(false, Ordering::SeqCst);
        if let Err(e) = self.save_state() {
            tracing::warn!("state save on session invalidation failed: {e}");
        }
        if let Some(engine) = self.engine.write().take() {
            engine.clear_sessions();
        }
        *self.groups.write() = None;
    }

    /// Parse the common `u8 ok [|| string err]` response prefix.
    fn check_ok(payload: &[u8], what: &str) -> Result<usize> {
        if payload.is_empty() {
            return Err(CoreError::Protocol(format!("{what} response empty")));
        }
        if payload[0] == 0 {
            let mut off = 1usize;
            let server_err = wire::get_string(payload, &mut off).unwrap_or_default();
            let msg = if server_err.is_empty() {
                format!("{what} failed")
            } else {
                server_err
            };
            return Err(CoreError::Auth(msg));
        }
        Ok(1)
    }

    // ── Login / logout ───────────────────────────────────────────────────

    pub fn login(&self, username: &str, password: &str) -> Result<()> {
        self.track(|| self.login_inner(username, password))
    }

    fn login_inner(&self, username: &str, password: &str) -> Result<()> {
        if self.cfg.auth_mode == AuthMode::Opaque {
            return Err(CoreError::Config("opaque auth unsupported".into()));
        }

        let mut payload = Vec::new();
        wire::put_string(username, &mut payload)?;
        wire::put_string(password, &mut payload)?;
        let frame = wire::encode_frame(FrameType::Login, &payload)?;
        let response = self.process_raw(&frame)?;
        let (_, resp_payload) = wire::decode_frame(&response)?;

        let mut off = Self::check_ok(resp_payload, "login")?;
        let token = wire::get_string(resp_payload, &mut off)?;
        let material = wire::get_bytes(resp_payload, &mut off)?;
        if token.is_empty() {
            return Err(CoreError::Auth("login returned empty token".into()));
        }

        let channel = SecureChannel::from_material(&material)?;
        *self.session.lock() = Some(Session {
            token,
            channel,
        });
        *self.username.write() = Some(username.to_string());
        self.prekey_published.store(false, Ordering::SeqCst);

        // Bring up (or restore) the ratchet engines for this user.
        let persisted = state::load(&self.state_dir.join("ratchet_state.bin"))?;
        let (engine, groups) = match persisted {
            Some(stored) => (
                PeerEngine::restore(self.cfg.identity, &stored.engine)?,
                GroupEngine::restore(username.to_string(), &stored.groups),
            ),
            None => (
                PeerEngine::new(self.cfg.identity, self.cfg.pqc_precompute_pool, now_ms())?,
                GroupEngine::new(username.to_string()),
            ),
        };
        *self.engine.write() = Some(engine);
        *self.groups.write() = Some(groups);

        if self.cfg.device_sync.enabled {
            let mut sync = self.device_sync.lock();
            if !sync.key_loaded() {
                sync.load_key()?;
            }
        }
        Ok(())
    }

    pub fn logout(&self) -> Result<()> {
        self.track(|| {
            if self.session.lock().is_some() {
                // Best effort: the session dies locally regardless.
                let _ = self.process_encrypted(FrameType::Logout, &[]);
            }
            self.save_state()?;
            *self.session.lock() = None;
            self.prekey_published.store(false, Ordering::SeqCst);
            if let Some(engine) = self.engine.write().take() {
                engine.clear_sessions();
            }
            if let Some(groups) = self.groups.write().take() {
                groups.clear();
            }
            Ok(())
        })
    }

    /// Persist identity, sessions and group chains (`MIRS` file).
    pub fn save_state(&self) -> Result<()> {
        let engine = self.engine.read();
        let groups = self.groups.read();
        let (Some(engine), Some(groups)) = (engine.as_ref(), groups.as_ref()) else {
            return Ok(());
        };
        state::save(
            &self.state_dir.join("ratchet_state.bin"),
            &state::PersistedState {
                engine: engine.snapshot(),
                groups: groups.snapshot(),
            },
        )
    }

    pub fn heartbeat(&self) -> Result<()> {
        self.track(|| {
            self.ensure_channel()?;
            self.process_encrypted(FrameType::Heartbeat, &[]).map(drop)
        })
    }

    /// Padded dummy heartbeat on the configured cadence.
    pub fn maybe_send_cover_traffic(&self) -> Result<()> {
        if !self.cfg.traffic.cover_traffic_enable || self.cfg.traffic.cover_traffic_interval_sec == 0
        {
            return Ok(());
        }
        self.ensure_channel()?;
        let now = now_ms();
        {
            let last = self.cover_last_ms.lock();
            if *last != 0 && now.saturating_sub(*last)
                < self.cfg.traffic.cover_traffic_interval_sec * 1000
            {
                return Ok(());
            }
        }
        let payload = padding::pad_payload(&[])?;
        self.process_encrypted(FrameType::Heartbeat, &payload)?;
        *self.cover_last_ms.lock() = now;
        Ok(())
    }

    // ── Prekeys and Key Transparency ─────────────────────────────────────

    fn with_engine<T>(&self, f: impl FnOnce(&PeerEngine) -> Result<T>) -> Result<T> {
        let engine = self.engine.read();
        match engine.as_ref() {
            Some(engine) => f(engine),
            None => Err(CoreError::Auth("not logged in".into())),
        }
    }

    fn with_groups<T>(&self, f: impl FnOnce(&GroupEngine, &PeerEngine) -> Result<T>) -> Result<T> {
        let engine = self.engine.read();
        let groups = self.groups.read();
        match (groups.as_ref(), engine.as_ref()) {
            (Some(groups), Some(engine)) => f(groups, engine),
            _ => Err(CoreError::Auth("not logged in".into())),
        }
    }

    pub fn publish_prekey_bundle(&self) -> Result<()> {
        self.track(|| {
            self.ensure_channel()?;
            let bundle = self.with_engine(|e| e.build_publish_bundle())?;
            let mut payload = Vec::with_capacity(4 + bundle.len());
            wire::put_bytes(&bundle, &mut payload)?;
            let response = self.process_encrypted(FrameType::PreKeyPublish, &payload)?;
            Self::check_ok(&response, "prekey publish")?;
            self.prekey_published.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    /// Rotate if due, then make sure the current bundle is on the server.
    pub fn ensure_prekey_published(&self) -> Result<()> {
        let rotated = self.with_engine(|e| e.maybe_rotate_identity(now_ms()))?;
        if rotated {
            self.prekey_published.store(false, Ordering::SeqCst);
        }
        let republish = self.with_engine(|e| Ok(e.needs_republish()))?;
        if self.prekey_published.load(Ordering::SeqCst) && !republish {
            return Ok(());
        }
        self.publish_prekey_bundle()
    }

    /// Fetch and KT-verify a peer's bundle; pins the peer identity.
    pub fn fetch_prekey_bundle(&self, peer: &str) -> Result<PrekeyBundle> {
        self.track(|| self.fetch_prekey_bundle_inner(peer))
    }

    fn fetch_prekey_bundle_inner(&self, peer: &str) -> Result<PrekeyBundle> {
        self.ensure_channel()?;
        let local_tree_size = self.kt.lock().tree_size();

        let mut payload = Vec::new();
        wire::put_string(peer, &mut payload)?;
        wire::put_u64(local_tree_size, &mut payload);
        let response = self.process_encrypted(FrameType::PreKeyFetch, &payload)?;

        let mut off = Self::check_ok(&response, "prekey fetch")?;
        let bundle_bytes = wire::get_bytes(&response, &mut off)?;

        if off < response.len() {
            let kt_version = wire::get_u32(&response, &mut off)?;
            if kt_version != 1 {
                return Err(CoreError::Kt("kt version unsupported".into()));
            }
            let proof = decode_kt_proof(&response, &mut off)?;
            if off != response.len() {
                return Err(CoreError::Kt("kt response invalid".into()));
            }
            self.kt.lock().verify_and_commit(peer, &bundle_bytes, &proof)?;
        }

        let bundle = PrekeyBundle::decode(&bundle_bytes)?;
        self.trust
            .lock()
            .check_or_pin_peer(peer, &identity::fingerprint_hex(&bundle.id_sig_pk))?;
        self.peer_keys
            .write()
            .insert(peer.to_string(), bundle.id_sig_pk);
        Ok(bundle)
    }

    // ── 1:1 messaging ────────────────────────────────────────────────────

    pub fn send_text(&self, peer: &str, text: &str) -> Result<MsgId> {
        let msg_id = new_msg_id();
        self.send_envelope(peer, ChatEnvelope::Text { msg_id, text: text.into() })?;
        Ok(msg_id)
    }

    pub fn send_sticker(&self, peer: &str, sticker_id: &str) -> Result<MsgId> {
        let msg_id = new_msg_id();
        self.send_envelope(
            peer,
            ChatEnvelope::Sticker { msg_id, sticker_id: sticker_id.into() },
        )?;
        Ok(msg_id)
    }

    pub fn send_typing(&self, peer: &str, typing: bool) -> Result<()> {
        self.send_envelope(peer, ChatEnvelope::Typing { msg_id: new_msg_id(), typing })
    }

    pub fn send_presence(&self, peer: &str, online: bool) -> Result<()> {
        self.send_envelope(peer, ChatEnvelope::Presence { msg_id: new_msg_id(), online })
    }

    pub fn send_ack(&self, peer: &str, msg_id: MsgId) -> Result<()> {
        self.send_envelope(peer, ChatEnvelope::Ack { msg_id })
    }

    pub fn send_read_receipt(&self, peer: &str, msg_id: MsgId) -> Result<()> {
        self.send_envelope(peer, ChatEnvelope::ReadReceipt { msg_id })
    }

    /// Encrypt a file blob for out-of-band upload and announce it to the
    /// peer. Returns the message id and the sealed blob.
    pub fn send_file(
        &self,
        peer: &str,
        file_name: &str,
        plaintext: &[u8],
        cancel: Option<&blob::CancelToken>,
    ) -> Result<(MsgId, Vec<u8>)> {
        self.track(|| {
            let mut file_key = [0u8; 32];
            OsRng.fill_bytes(&mut file_key);
            let sealed = blob::encrypt_blob_adaptive(plaintext, &file_key, file_name, cancel)?;
            let file_id = blake3::hash(plaintext).to_hex().to_string();

            let msg_id = new_msg_id();
            self.send_envelope_inner(
                peer,
                ChatEnvelope::File {
                    msg_id,
                    file: mi_proto::envelope::FileMeta {
                        file_size: plaintext.len() as u64,
                        file_name: file_name.into(),
                        file_id,
                        file_key,
                    },
                },
            )?;
            Ok((msg_id, sealed))
        })
    }

    /// Open a downloaded file blob with the key from its announcement.
    pub fn open_file_blob(
        &self,
        sealed: &[u8],
        file_key: &[u8; 32],
        cancel: Option<&blob::CancelToken>,
    ) -> Result<Vec<u8>> {
        self.track(|| Ok(blob::decrypt_blob(sealed, file_key, cancel)?.to_vec()))
    }

    /// Seal and relay one envelope to `peer`, fetching the bundle (with its
    /// KT proof) on first contact. A device-sync mirror event follows.
    pub fn send_envelope(&self, peer: &str, envelope: ChatEnvelope) -> Result<()> {
        self.track(|| self.send_envelope_inner(peer, envelope))
    }

    fn send_envelope_inner(&self, peer: &str, envelope: ChatEnvelope) -> Result<()> {
        self.ensure_channel()?;
        self.ensure_prekey_published()?;

        let bundle = if self.with_engine(|e| Ok(e.has_session(peer)))? {
            None
        } else {
            Some(self.fetch_prekey_bundle_inner(peer)?)
        };

        let padded = padding::pad_payload(&envelope.encode()?)?;
        let sealed =
            self.with_engine(|e| e.encrypt_to_peer(peer, bundle.as_ref(), &padded))?;

        let mut relay = Vec::with_capacity(1 + 2 + peer.len() + 4 + sealed.len());
        relay.push(RELAY_KIND_DIRECT);
        wire::put_string(peer, &mut relay)?;
        wire::put_bytes(&sealed, &mut relay)?;
        let response = self.process_encrypted(FrameType::Encrypted, &relay)?;
        Self::check_ok(&response, "send")?;

        self.emit_sync_event(DeviceSyncEvent::SendPrivate {
            peer: peer.to_string(),
            envelope: sealed,
        });
        Ok(())
    }

    /// Decrypt one inbound 1:1 wire message and hand back the envelope.
    /// Init messages pin the sender's identity first; sender-key and
    /// call-key envelopes also update the group engine on the way through.
    pub fn handle_peer_message(&self, peer: &str, sealed: &[u8]) -> Result<ChatEnvelope> {
        self.track(|| {
            // Peek at the init header for identity pinning before any
            // ratchet state is touched.
            let message = RatchetMessage::decode(sealed)?;
            if let Some(x3dh) = &message.x3dh {
                self.trust
                    .lock()
                    .check_or_pin_peer(peer, &identity::fingerprint_hex(&x3dh.ik_sig_pub))?;
                self.peer_keys
                    .write()
                    .insert(peer.to_string(), x3dh.ik_sig_pub);
            }

            let padded = self.with_engine(|e| e.decrypt_from_peer(peer, sealed))?;
            let envelope = ChatEnvelope::decode(&padding::unpad_payload(&padded)?)?;

            match &envelope {
                ChatEnvelope::GroupSenderKeyDist { dist, .. } => {
                    let sender_pk = self.peer_key(peer)?;
                    self.with_groups(|g, _| g.handle_sender_key_dist(peer, &sender_pk, dist))?;
                }
                ChatEnvelope::GroupCallKeyDist { dist, .. } => {
                    let sender_pk = self.peer_key(peer)?;
                    self.with_groups(|g, _| g.handle_call_key_dist(&sender_pk, dist))?;
                }
                _ => {}
            }
            Ok(envelope)
        })
    }

    fn peer_key(&self, peer: &str) -> Result<[u8; 32]> {
        self.peer_keys
            .read()
            .get(peer)
            .copied()
            .ok_or_else(|| CoreError::Trust(format!("no identity key known for {peer}")))
    }

    // ── Group messaging ──────────────────────────────────────────────────

    /// Send a group text. When a rotation trigger fired on this send, the
    /// fresh dist envelope comes back too and must be fanned out to every
    /// member over the 1:1 sessions.
    pub fn send_group_text(
        &self,
        group_id: &str,
        text: &str,
    ) -> Result<(MsgId, Option<ChatEnvelope>)> {
        let msg_id = new_msg_id();
        let envelope = ChatEnvelope::GroupText {
            msg_id,
            group_id: group_id.into(),
            text: text.into(),
        };
        let dist = self.track(|| self.send_group_envelope_inner(group_id, envelope))?;
        Ok((msg_id, dist))
    }

    /// Seal one envelope under our sender key and relay it to the group.
    /// When a rotation trigger fired, the fresh dist envelope is returned so
    /// the caller can fan it out to each member over the 1:1 sessions.
    pub fn send_group_envelope(
        &self,
        group_id: &str,
        envelope: ChatEnvelope,
    ) -> Result<Option<ChatEnvelope>> {
        self.track(|| self.send_group_envelope_inner(group_id, envelope))
    }

    fn send_group_envelope_inner(
        &self,
        group_id: &str,
        envelope: ChatEnvelope,
    ) -> Result<Option<ChatEnvelope>> {
        self.ensure_channel()?;
        let padded = padding::pad_payload(&envelope.encode()?)?;

        let (sealed, rotated) = self.with_groups(|groups, engine| {
            groups.encrypt_group_message(
                group_id,
                &|m: &[u8]| engine.sign(m),
                &padded,
                now_ms(),
            )
        })?;

        let mut relay = Vec::with_capacity(1 + 2 + group_id.len() + 4 + sealed.len());
        relay.push(RELAY_KIND_GROUP);
        wire::put_string(group_id, &mut relay)?;
        wire::put_bytes(&sealed, &mut relay)?;
        let response = self.process_encrypted(FrameType::Encrypted, &relay)?;
        Self::check_ok(&response, "group send")?;

        self.emit_sync_event(DeviceSyncEvent::SendGroup {
            group_id: group_id.to_string(),
            envelope: sealed,
        });

        Ok(rotated.map(|dist| ChatEnvelope::GroupSenderKeyDist {
            msg_id: new_msg_id(),
            dist,
        }))
    }

    /// Decrypt one inbound group wire message.
    pub fn handle_group_message(&self, payload: &[u8]) -> Result<(String, String, ChatEnvelope)> {
        self.track(|| {
            let (message, _) = mi_proto::group::GroupCipherMessage::decode(payload)?;
            let sender_pk = self.peer_key(&message.sender)?;
            let (group, sender, padded) =
                self.with_groups(|g, _| g.decrypt_group_message(payload, &sender_pk))?;
            let envelope = ChatEnvelope::decode(&padding::unpad_payload(&padded)?)?;
            Ok((group, sender, envelope))
        })
    }

    /// Our current sender-key dist for `group_id`, as an envelope to send to
    /// each member (used on joins and `GroupSenderKeyReq`).
    pub fn make_sender_key_dist_envelope(&self, group_id: &str) -> Result<ChatEnvelope> {
        self.track(|| {
            let dist = self.with_groups(|g, e| {
                g.make_sender_key_dist(group_id, &|m: &[u8]| e.sign(m), now_ms())
            })?;
            Ok(ChatEnvelope::GroupSenderKeyDist { msg_id: new_msg_id(), dist })
        })
    }

    /// Membership changed (join/leave/kick/role): rotate and return the
    /// fresh dist envelope for fan-out.
    pub fn rotate_group_sender_key(&self, group_id: &str) -> Result<ChatEnvelope> {
        self.track(|| {
            let dist = self.with_groups(|g, e| {
                g.rotate_group(group_id, &|m: &[u8]| e.sign(m), now_ms())
            })?;
            Ok(ChatEnvelope::GroupSenderKeyDist { msg_id: new_msg_id(), dist })
        })
    }

    /// Start (or rotate) the key for a group call and build its dist.
    pub fn create_group_call_key(
        &self,
        group_id: &str,
        call_id: &[u8; 16],
    ) -> Result<ChatEnvelope> {
        self.track(|| {
            let dist = self.with_groups(|g, e| {
                g.new_call_key(group_id, call_id);
                g.make_call_key_dist(group_id, call_id, &|m: &[u8]| e.sign(m))
            })?;
            Ok(ChatEnvelope::GroupCallKeyDist { msg_id: new_msg_id(), dist })
        })
    }

    /// Answer a `GroupCallKeyReq` with the key we already hold for the call.
    pub fn answer_call_key_req(
        &self,
        group_id: &str,
        call_id: &[u8; 16],
    ) -> Result<ChatEnvelope> {
        self.track(|| {
            let dist = self.with_groups(|g, e| {
                g.make_call_key_dist(group_id, call_id, &|m: &[u8]| e.sign(m))
            })?;
            Ok(ChatEnvelope::GroupCallKeyDist { msg_id: new_msg_id(), dist })
        })
    }

    /// Per-call media root for a 1:1 call with `peer`.
    pub fn derive_media_root(&self, peer: &str, call_id: &[u8; 16]) -> Result<[u8; 32]> {
        self.track(|| self.with_engine(|e| e.media_root(peer, call_id)))
    }

    // ── Devices ──────────────────────────────────────────────────────────

    pub fn list_devices(&self) -> Result<Vec<DeviceEntry>> {
        self.track(|| {
            self.ensure_channel()?;
            let mut payload = Vec::new();
            wire::put_string(&self.device_id, &mut payload)?;
            let response = self.process_encrypted(FrameType::DeviceList, &payload)?;

            let mut off = Self::check_ok(&response, "device list")?;
            let count = wire::get_u32(&response, &mut off)?;
            let mut devices = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                devices.push(DeviceEntry {
                    device_id: wire::get_string(&response, &mut off)?,
                    last_seen_sec: wire::get_u32(&response, &mut off)?,
                });
            }
            if off != response.len() {
                return Err(CoreError::Protocol("device list response invalid".into()));
            }
            Ok(devices)
        })
    }

    /// Kick a sibling device. On success the device-sync key rotates (the
    /// kicked device must not follow future sync traffic) and every owned
    /// group chain rotates; the fresh dist envelopes come back for fan-out.
    pub fn kick_device(&self, target_device_id: &str) -> Result<Vec<ChatEnvelope>> {
        self.track(|| {
            self.ensure_channel()?;
            if target_device_id.is_empty() {
                return Err(CoreError::DeviceSync("device id empty".into()));
            }
            let mut payload = Vec::new();
            wire::put_string(&self.device_id, &mut payload)?;
            wire::put_string(target_device_id, &mut payload)?;
            let response = self.process_encrypted(FrameType::DeviceKick, &payload)?;
            Self::check_ok(&response, "device kick")?;

            // Rotate the sync key under the old key, then install the new one.
            {
                let mut sync = self.device_sync.lock();
                if sync.enabled() && sync.key_loaded() {
                    let (next, announce) = sync.begin_rotation()?;
                    self.push_sync_ciphertext(&announce)?;
                    sync.install_key(next, now_ms())?;
                }
            }

            let dists = self.with_groups(|g, e| {
                g.rotate_all_owned(&|m: &[u8]| e.sign(m), now_ms())
            })?;
            Ok(dists
                .into_iter()
                .map(|dist| ChatEnvelope::GroupSenderKeyDist { msg_id: new_msg_id(), dist })
                .collect())
        })
    }

    // ── Device sync ──────────────────────────────────────────────────────

    fn push_sync_ciphertext(&self, ciphertext: &[u8]) -> Result<()> {
        let mut relay = Vec::with_capacity(1 + 4 + ciphertext.len());
        relay.push(RELAY_KIND_DEVICE_SYNC);
        wire::put_bytes(ciphertext, &mut relay)?;
        let response = self.process_encrypted(FrameType::Encrypted, &relay)?;
        Self::check_ok(&response, "device sync push").map(drop)
    }

    /// Best-effort mirror to sibling devices; sync failures never fail the
    /// send they piggyback on.
    fn emit_sync_event(&self, event: DeviceSyncEvent) {
        let ciphertext = {
            let mut sync = self.device_sync.lock();
            if !sync.enabled() || !sync.key_loaded() {
                return;
            }
            if sync.rotation_due(now_ms()) {
                match sync.begin_rotation() {
                    Ok((next, announce)) => {
                        if self.push_sync_ciphertext(&announce).is_ok() {
                            let _ = sync.install_key(next, now_ms());
                        }
                    }
                    Err(e) => tracing::debug!("device sync rotation failed: {e}"),
                }
            }
            match sync.seal_event(&event) {
                Ok(ct) => ct,
                Err(e) => {
                    tracing::debug!("device sync seal failed: {e}");
                    return;
                }
            }
        };
        if let Err(e) = self.push_sync_ciphertext(&ciphertext) {
            tracing::debug!("device sync push failed: {e}");
        }
    }

    /// Apply one sync ciphertext fanned out by the server.
    pub fn handle_sync_ciphertext(&self, data: &[u8]) -> Result<DeviceSyncEvent> {
        self.track(|| self.device_sync.lock().open_event(data, now_ms()))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn load_or_create_device_id(path: &Path) -> Result<String> {
    if path.exists() {
        let bytes = fsutil::read_limited(path, 4096)
            .map_err(|e| CoreError::Config(format!("read device id: {e}")))?;
        if bytes.len() != 16 {
            return Err(CoreError::Config("device id corrupt".into()));
        }
        return Ok(hex::encode(bytes));
    }
    let mut id = [0u8; 16];
    OsRng.fill_bytes(&mut id);
    fsutil::write_atomic(path, &id)
        .map_err(|e| CoreError::Config(format!("write device id: {e}")))?;
    Ok(hex::encode(id))
}

fn load_kt_root_pubkey(cfg: &ClientConfig) -> Result<Option<Vec<u8>>> {
    if !cfg.kt.require_signature {
        return Ok(None);
    }
    let bytes = if let Some(path) = &cfg.kt.root_pubkey_path {
        let raw = std::fs::read(path)
            .map_err(|e| CoreError::Config(format!("kt root pubkey {}: {e}", path.display())))?;
        // Accept raw key bytes or a hex rendering of them.
        match raw.len() {
            32 => raw,
            64 => hex::decode(std::str::from_utf8(&raw).map_err(|_| {
                CoreError::Config("kt root pubkey invalid".into())
            })?.trim())
            .map_err(|_| CoreError::Config("kt root pubkey hex invalid".into()))?,
            _ => {
                let text = String::from_utf8(raw)
                    .map_err(|_| CoreError::Config("kt root pubkey invalid".into()))?;
                hex::decode(text.trim())
                    .map_err(|_| CoreError::Config("kt root pubkey hex invalid".into()))?
            }
        }
    } else if let Some(hex_str) = &cfg.kt.root_pubkey_hex {
        hex::decode(hex_str.trim())
            .map_err(|_| CoreError::Config("kt root pubkey hex invalid".into()))?
    } else {
        return Err(CoreError::Config("kt root pubkey missing".into()));
    };
    if bytes.len() != 32 {
        return Err(CoreError::Config("kt root pubkey size invalid".into()));
    }
    Ok(Some(bytes))
}

fn decode_kt_proof(payload: &[u8], off: &mut usize) -> Result<KtProof> {
    let invalid = || CoreError::Kt("kt response invalid".into());

    let tree_size = wire::get_u64(payload, off).map_err(|_| invalid())?;
    let root_bytes = wire::get_bytes(payload, off).map_err(|_| invalid())?;
    let root: [u8; 32] = root_bytes.as_slice().try_into().map_err(|_| invalid())?;
    let leaf_index = wire::get_u64(payload, off).map_err(|_| invalid())?;

    let audit_count = wire::get_u32(payload, off).map_err(|_| invalid())?;
    if audit_count > 64 {
        return Err(invalid());
    }
    let mut audit_path = Vec::with_capacity(audit_count as usize);
    for _ in 0..audit_count {
        let node = wire::get_bytes(payload, off).map_err(|_| invalid())?;
        audit_path.push(node.as_slice().try_into().map_err(|_| invalid())?);
    }

    let cons_count = wire::get_u32(payload, off).map_err(|_| invalid())?;
    if cons_count > 64 {
        return Err(invalid());
    }
    let mut consistency_path = Vec::with_capacity(cons_count as usize);
    for _ in 0..cons_count {
        let node = wire::get_bytes(payload, off).map_err(|_| invalid())?;
        consistency_path.push(node.as_slice().try_into().map_err(|_| invalid())?);
    }

    let sth_signature = wire::get_bytes(payload, off).map_err(|_| invalid())?;
    Ok(KtProof {
        tree_size,
        root,
        leaf_index,
        audit_path,
        consistency_path,
        sth_signature,
    })
}
