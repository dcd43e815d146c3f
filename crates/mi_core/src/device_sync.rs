//! Device-sync engine: ratcheted fan-out to the user's own devices.
//!
//! All of a user's devices share one 32-byte sync key (obtained out of band
//! through the approval flow). Events are sealed as
//!
//!   `u64_le(counter) || AEAD(key_for_counter, nonce-prefixed, event)`
//!
//! with the counter in the AD. When `ratchet_enable` is on, each counter
//! step derives the next key through HKDF (`mi_e2ee_device_sync_ratchet_v1`)
//! so a leaked key exposes at most one window; `ratchet_max_skip` bounds
//! how far a receiver will fast-forward.
//!
//! Rotation installs a brand-new random key: every `rotate_message_limit`
//! sends, every `rotate_interval_sec` seconds, and after every successful
//! device kick. The announcement travels encrypted under the OLD key, and
//! the old key stays usable for a short grace window so in-flight
//! ciphertexts still decrypt.

use std::path::PathBuf;

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroize;

use mi_crypto::{aead, kdf};
use mi_proto::sync::DeviceSyncEvent;

use crate::config::DeviceSyncSettings;
use crate::error::{CoreError, Result};
use crate::fsutil;

const SYNC_AD_CONTEXT: &[u8] = b"mi_e2ee_device_sync_v1";
const PREV_KEY_GRACE_MS: u64 = 120_000;

pub struct DeviceSync {
    settings: DeviceSyncSettings,
    key_path: PathBuf,
    key: Option<[u8; 32]>,
    prev_key: Option<PrevKey>,
    send_count: u64,
    send_ctr: u64,
    recv_ctr: u64,
    last_rotate_ms: u64,
}

struct PrevKey {
    key: [u8; 32],
    until_ms: u64,
}

impl Drop for DeviceSync {
    fn drop(&mut self) {
        if let Some(mut k) = self.key.take() {
            k.zeroize();
        }
        if let Some(mut prev) = self.prev_key.take() {
            prev.key.zeroize();
        }
    }
}

fn sync_ad(counter: u64) -> Vec<u8> {
    let mut ad = Vec::with_capacity(SYNC_AD_CONTEXT.len() + 8);
    ad.extend_from_slice(SYNC_AD_CONTEXT);
    ad.extend_from_slice(&counter.to_le_bytes());
    ad
}

impl DeviceSync {
    pub fn new(settings: DeviceSyncSettings, key_path: PathBuf) -> Self {
        Self {
            settings,
            key_path,
            key: None,
            prev_key: None,
            send_count: 0,
            send_ctr: 0,
            recv_ctr: 0,
            last_rotate_ms: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.settings.role, crate::config::DeviceSyncRole::Primary)
    }

    pub fn key_loaded(&self) -> bool {
        self.key.is_some()
    }

    // ── Key persistence ──────────────────────────────────────────────────

    /// Load the shared key from disk; missing file is not an error for a
    /// linked device still waiting for approval.
    pub fn load_key(&mut self) -> Result<bool> {
        if !self.key_path.exists() {
            return Ok(false);
        }
        let bytes = fsutil::read_limited(&self.key_path, 64 * 1024)
            .map_err(|e| CoreError::DeviceSync(format!("read sync key: {e}")))?;
        if bytes.len() != 32 {
            return Err(CoreError::DeviceSync("sync key corrupt".into()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        self.key = Some(key);
        Ok(true)
    }

    /// Generate and persist a key on the primary device's first run.
    pub fn ensure_key(&mut self) -> Result<()> {
        if self.key.is_some() || self.load_key()? {
            return Ok(());
        }
        if !self.is_primary() {
            return Err(CoreError::DeviceSync("sync key missing".into()));
        }
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        self.store_key(&key)
    }

    fn store_key(&mut self, key: &[u8; 32]) -> Result<()> {
        fsutil::write_atomic(&self.key_path, key)
            .map_err(|e| CoreError::DeviceSync(format!("write sync key: {e}")))?;
        self.key = Some(*key);
        Ok(())
    }

    // ── Sealing / opening ────────────────────────────────────────────────

    fn key_at(&self, base: &[u8; 32], from_ctr: u64, to_ctr: u64) -> Result<[u8; 32]> {
        let mut key = *base;
        if self.settings.ratchet_enable {
            for ctr in from_ctr..to_ctr {
                let next = kdf::device_sync_ratchet(&key, ctr)?;
                key.zeroize();
                key = next;
            }
        }
        Ok(key)
    }

    /// Seal one event under the current key, consuming a send counter.
    pub fn seal_event(&mut self, event: &DeviceSyncEvent) -> Result<Vec<u8>> {
        let base = self.key.ok_or_else(|| CoreError::DeviceSync("sync key missing".into()))?;
        let ctr = self.send_ctr;

        let mut key = self.key_at(&base, 0, ctr)?;
        let plain = event.encode()?;
        let sealed = aead::encrypt(&key, &plain, &sync_ad(ctr));
        key.zeroize();
        let sealed = sealed?;

        let mut out = Vec::with_capacity(8 + sealed.len());
        out.extend_from_slice(&ctr.to_le_bytes());
        out.extend_from_slice(&sealed);

        self.send_ctr += 1;
        self.send_count += 1;
        Ok(out)
    }

    /// Open a sibling's event. Tries the current key (with bounded ratchet
    /// fast-forward), then the previous key inside its grace window.
    pub fn open_event(&mut self, data: &[u8], now_ms: u64) -> Result<DeviceSyncEvent> {
        if data.len() < 8 {
            return Err(CoreError::DeviceSync("sync event truncated".into()));
        }
        let ctr = u64::from_le_bytes(data[..8].try_into().unwrap());
        let sealed = &data[8..];
        let ad = sync_ad(ctr);

        if let Some(base) = self.key {
            if !self.settings.ratchet_enable || ctr >= self.recv_ctr {
                if self.settings.ratchet_enable
                    && ctr.saturating_sub(self.recv_ctr) > self.settings.ratchet_max_skip
                {
                    return Err(CoreError::DeviceSync("ratchet skip exceeded".into()));
                }
                let mut key = self.key_at(&base, 0, ctr)?;
                let opened = aead::decrypt(&key, sealed, &ad);
                key.zeroize();
                if let Ok(plain) = opened {
                    if self.settings.ratchet_enable {
                        self.recv_ctr = self.recv_ctr.max(ctr + 1);
                    }
                    let event = DeviceSyncEvent::decode(&plain)?;
                    self.apply_rotate(&event, now_ms)?;
                    return Ok(event);
                }
            }
        }

        // Grace path: a ciphertext from before the last rotation.
        if let Some(prev) = &self.prev_key {
            if now_ms <= prev.until_ms {
                let base = prev.key;
                let mut key = self.key_at(&base, 0, ctr)?;
                let opened = aead::decrypt(&key, sealed, &ad);
                key.zeroize();
                if let Ok(plain) = opened {
                    let event = DeviceSyncEvent::decode(&plain)?;
                    self.apply_rotate(&event, now_ms)?;
                    return Ok(event);
                }
            }
        }

        Err(CoreError::DeviceSync("sync event unreadable".into()))
    }

    fn apply_rotate(&mut self, event: &DeviceSyncEvent, now_ms: u64) -> Result<()> {
        if let DeviceSyncEvent::RotateKey { key } = event {
            self.install_key(*key, now_ms)?;
        }
        Ok(())
    }

    // ── Rotation ─────────────────────────────────────────────────────────

    /// Whether a rotation is due under the count/time policy.
    pub fn rotation_due(&self, now_ms: u64) -> bool {
        if self.key.is_none() {
            return false;
        }
        if self.settings.rotate_message_limit > 0
            && self.send_count >= self.settings.rotate_message_limit
        {
            return true;
        }
        if self.settings.rotate_interval_sec > 0 && self.last_rotate_ms > 0 {
            let elapsed_sec = now_ms.saturating_sub(self.last_rotate_ms) / 1000;
            if elapsed_sec >= self.settings.rotate_interval_sec {
                return true;
            }
        }
        false
    }

    /// Produce the rotation announcement: a fresh key plus its RotateKey
    /// event sealed under the OLD key. The caller pushes the ciphertext to
    /// the server and then calls [`DeviceSync::install_key`].
    pub fn begin_rotation(&mut self) -> Result<([u8; 32], Vec<u8>)> {
        let mut next = [0u8; 32];
        OsRng.fill_bytes(&mut next);
        let ciphertext = self.seal_event(&DeviceSyncEvent::RotateKey { key: next })?;
        Ok((next, ciphertext))
    }

    /// Install a new key (from our own rotation or a sibling's RotateKey
    /// event). The old key stays valid for a short grace window.
    pub fn install_key(&mut self, key: [u8; 32], now_ms: u64) -> Result<()> {
        if let Some(old) = self.key {
            if let Some(mut stale) = self.prev_key.take() {
                stale.key.zeroize();
            }
            self.prev_key = Some(PrevKey {
                key: old,
                until_ms: now_ms + PREV_KEY_GRACE_MS,
            });
        }
        self.store_key(&key)?;
        self.send_count = 0;
        self.send_ctr = 0;
        self.recv_ctr = 0;
        self.last_rotate_ms = now_ms;
        Ok(())
    }

    pub fn mark_rotated(&mut self, now_ms: u64) {
        self.last_rotate_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSyncRole;

    fn settings(ratchet: bool) -> DeviceSyncSettings {
        DeviceSyncSettings {
            enabled: true,
            role: DeviceSyncRole::Primary,
            key_path: None,
            rotate_interval_sec: 3600,
            rotate_message_limit: 4,
            ratchet_enable: ratchet,
            ratchet_max_skip: 8,
        }
    }

    fn pair(ratchet: bool) -> (DeviceSync, DeviceSync, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut a = DeviceSync::new(settings(ratchet), dir.path().join("a.bin"));
        a.ensure_key().unwrap();
        let mut b = DeviceSync::new(settings(ratchet), dir.path().join("b.bin"));
        // The sibling gets the same key through the (out-of-band) approval.
        let key = a.key.unwrap();
        b.store_key(&key).unwrap();
        (a, b, dir)
    }

    fn text_event(i: u8) -> DeviceSyncEvent {
        DeviceSyncEvent::SendPrivate {
            peer: "bob".into(),
            envelope: vec![i; 4],
        }
    }

    #[test]
    fn seal_open_roundtrip_plain() {
        let (mut a, mut b, _dir) = pair(false);
        for i in 0..3 {
            let ct = a.seal_event(&text_event(i)).unwrap();
            let ev = b.open_event(&ct, 0).unwrap();
            assert_eq!(ev, text_event(i));
        }
    }

    #[test]
    fn seal_open_roundtrip_with_ratchet() {
        let (mut a, mut b, _dir) = pair(true);
        for i in 0..5 {
            let ct = a.seal_event(&text_event(i)).unwrap();
            assert_eq!(b.open_event(&ct, 0).unwrap(), text_event(i));
        }
    }

    #[test]
    fn ratchet_skip_bound() {
        let (mut a, mut b, _dir) = pair(true);
        // Burn counters past the recovery window on the sender.
        for _ in 0..10 {
            let _ = a.seal_event(&text_event(0)).unwrap();
        }
        let ct = a.seal_event(&text_event(1)).unwrap(); // ctr = 10 > max_skip 8
        assert!(matches!(
            b.open_event(&ct, 0),
            Err(CoreError::DeviceSync(_))
        ));
    }

    #[test]
    fn rotation_policy_and_grace() {
        let (mut a, mut b, _dir) = pair(false);
        assert!(!a.rotation_due(0));
        for i in 0..4 {
            let ct = a.seal_event(&text_event(i)).unwrap();
            b.open_event(&ct, 0).unwrap();
        }
        assert!(a.rotation_due(0));

        // A ciphertext sealed pre-rotation, delivered post-rotation.
        let straggler = a.seal_event(&text_event(9)).unwrap();

        let (next, announce) = a.begin_rotation().unwrap();
        a.install_key(next, 1_000).unwrap();
        assert!(!a.rotation_due(1_000));

        // Sibling sees the announcement under the old key and installs.
        let ev = b.open_event(&announce, 1_000).unwrap();
        assert!(matches!(ev, DeviceSyncEvent::RotateKey { .. }));

        // The straggler still opens inside the grace window …
        assert_eq!(b.open_event(&straggler, 2_000).unwrap(), text_event(9));

        // … and traffic under the new key flows both ways.
        let ct = a.seal_event(&text_event(7)).unwrap();
        assert_eq!(b.open_event(&ct, 3_000).unwrap(), text_event(7));
    }

    #[test]
    fn linked_device_without_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut linked = DeviceSync::new(
            DeviceSyncSettings {
                role: DeviceSyncRole::Linked,
                ..settings(false)
            },
            dir.path().join("k.bin"),
        );
        assert!(matches!(
            linked.ensure_key(),
            Err(CoreError::DeviceSync(_))
        ));
    }

    #[test]
    fn time_based_rotation() {
        let (mut a, _b, _dir) = pair(false);
        a.mark_rotated(1_000);
        assert!(!a.rotation_due(1_000 + 3_599_000));
        assert!(a.rotation_due(1_000 + 3_600_000));
    }
}
