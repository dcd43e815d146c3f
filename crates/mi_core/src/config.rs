//! Ini-style configuration surface.
//!
//! The client reads one ini file. Unknown keys are ignored so older and
//! newer builds can share a config; missing keys fall back to the defaults
//! below. Booleans accept `0/1/true/false/yes/no`.
//!
//! `[client] server_ip` and `server_port` are the only required options.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use mi_crypto::identity::IdentityPolicy;

use crate::error::{CoreError, Result};

// ── Section types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVerifyMode {
    /// CA validation only.
    Ca,
    /// Pinned fingerprint required; unknown servers need SAS confirmation.
    Pin,
    /// CA validation plus the pin check when a pin exists.
    Cap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    None,
    Socks5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub proxy_type: ProxyType,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ProxyConfig {
    pub fn enabled(&self) -> bool {
        self.proxy_type != ProxyType::None
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxy_type: ProxyType::None,
            host: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KcpConfig {
    pub enable: bool,
    pub server_port: u16,
    pub mtu: u32,
    pub snd_wnd: u16,
    pub rcv_wnd: u16,
    pub nodelay: u32,
    pub interval: u32,
    pub resend: u32,
    pub nc: u32,
    pub min_rto: u32,
    pub request_timeout_ms: u32,
    pub session_idle_sec: u32,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            enable: false,
            server_port: 0,
            mtu: 1400,
            snd_wnd: 256,
            rcv_wnd: 256,
            nodelay: 1,
            interval: 10,
            resend: 2,
            nc: 1,
            min_rto: 30,
            request_timeout_ms: 5000,
            session_idle_sec: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Legacy,
    Opaque,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSyncRole {
    Primary,
    Linked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSyncSettings {
    pub enabled: bool,
    pub role: DeviceSyncRole,
    pub key_path: Option<PathBuf>,
    pub rotate_interval_sec: u64,
    pub rotate_message_limit: u64,
    pub ratchet_enable: bool,
    pub ratchet_max_skip: u64,
}

impl Default for DeviceSyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            role: DeviceSyncRole::Primary,
            key_path: None,
            rotate_interval_sec: 6 * 60 * 60,
            rotate_message_limit: 1000,
            ratchet_enable: false,
            ratchet_max_skip: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KtSettings {
    pub require_signature: bool,
    pub root_pubkey_path: Option<PathBuf>,
    pub root_pubkey_hex: Option<String>,
    pub gossip_alert_threshold: u32,
}

impl Default for KtSettings {
    fn default() -> Self {
        Self {
            require_signature: false,
            root_pubkey_path: None,
            root_pubkey_hex: None,
            gossip_alert_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSettings {
    pub cover_traffic_enable: bool,
    pub cover_traffic_interval_sec: u64,
}

impl Default for TrafficSettings {
    fn default() -> Self {
        Self {
            cover_traffic_enable: false,
            cover_traffic_interval_sec: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_ip: String,
    pub server_port: u16,
    pub use_tls: bool,
    pub require_tls: bool,
    pub tls_verify_mode: TlsVerifyMode,
    pub tls_verify_hostname: bool,
    pub tls_ca_bundle_path: Option<PathBuf>,
    pub kcp: KcpConfig,
    pub proxy: ProxyConfig,
    pub auth_mode: AuthMode,
    pub identity: IdentityPolicy,
    pub kt: KtSettings,
    pub device_sync: DeviceSyncSettings,
    pub pqc_precompute_pool: u32,
    pub traffic: TrafficSettings,
}

// ── Ini reader ───────────────────────────────────────────────────────────────

struct Ini {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Ini {
    fn parse(text: &str) -> Self {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current = String::new();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = name.trim().to_ascii_lowercase();
                sections.entry(current.clone()).or_default();
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                sections
                    .entry(current.clone())
                    .or_default()
                    .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }
        Self { sections }
    }

    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> Result<bool> {
        match self.get(section, key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(CoreError::Config(format!("[{section}] {key}: bad boolean '{v}'"))),
            },
        }
    }

    fn get_num<T: std::str::FromStr>(&self, section: &str, key: &str, default: T) -> Result<T> {
        match self.get(section, key) {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|_| CoreError::Config(format!("[{section}] {key}: bad number '{v}'"))),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────────────────

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let ini = Ini::parse(text);

        let server_ip = ini
            .get("client", "server_ip")
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CoreError::Config("[client] server_ip missing".into()))?;
        let server_port: u16 = ini.get_num("client", "server_port", 0)?;
        if server_port == 0 {
            return Err(CoreError::Config("[client] server_port missing".into()));
        }

        let tls_verify_mode = match ini.get("client", "tls_verify_mode").unwrap_or("pin") {
            "ca" => TlsVerifyMode::Ca,
            "pin" => TlsVerifyMode::Pin,
            "cap" => TlsVerifyMode::Cap,
            other => {
                return Err(CoreError::Config(format!(
                    "[client] tls_verify_mode: unknown mode '{other}'"
                )))
            }
        };

        let kcp = KcpConfig {
            enable: ini.get_bool("kcp", "enable", false)?,
            server_port: ini.get_num("kcp", "server_port", 0)?,
            mtu: ini.get_num("kcp", "mtu", KcpConfig::default().mtu)?,
            snd_wnd: ini.get_num("kcp", "snd_wnd", KcpConfig::default().snd_wnd)?,
            rcv_wnd: ini.get_num("kcp", "rcv_wnd", KcpConfig::default().rcv_wnd)?,
            nodelay: ini.get_num("kcp", "nodelay", KcpConfig::default().nodelay)?,
            interval: ini.get_num("kcp", "interval", KcpConfig::default().interval)?,
            resend: ini.get_num("kcp", "resend", KcpConfig::default().resend)?,
            nc: ini.get_num("kcp", "nc", KcpConfig::default().nc)?,
            min_rto: ini.get_num("kcp", "min_rto", KcpConfig::default().min_rto)?,
            request_timeout_ms: ini.get_num(
                "kcp",
                "request_timeout_ms",
                KcpConfig::default().request_timeout_ms,
            )?,
            session_idle_sec: ini.get_num(
                "kcp",
                "session_idle_sec",
                KcpConfig::default().session_idle_sec,
            )?,
        };

        let proxy_type = match ini.get("proxy", "type").unwrap_or("none") {
            "none" | "" => ProxyType::None,
            "socks5" => ProxyType::Socks5,
            other => {
                return Err(CoreError::Config(format!("[proxy] type: unknown '{other}'")))
            }
        };
        let proxy = ProxyConfig {
            proxy_type,
            host: ini.get("proxy", "host").unwrap_or_default().to_string(),
            port: ini.get_num("proxy", "port", 0)?,
            username: ini.get("proxy", "username").unwrap_or_default().to_string(),
            password: ini.get("proxy", "password").unwrap_or_default().to_string(),
        };
        if proxy.enabled() && (proxy.host.is_empty() || proxy.port == 0) {
            return Err(CoreError::Config("[proxy] host/port missing".into()));
        }

        let auth_mode = match ini.get("auth", "mode").unwrap_or("legacy") {
            "legacy" => AuthMode::Legacy,
            "opaque" => AuthMode::Opaque,
            other => return Err(CoreError::Config(format!("[auth] mode: unknown '{other}'"))),
        };

        let defaults = IdentityPolicy::default();
        let identity = IdentityPolicy {
            rotation_days: ini.get_num("identity", "rotation_days", defaults.rotation_days)?,
            legacy_retention_days: ini.get_num(
                "identity",
                "legacy_retention_days",
                defaults.legacy_retention_days,
            )?,
            tpm_enable: ini.get_bool("identity", "tpm_enable", defaults.tpm_enable)?,
            tpm_require: ini.get_bool("identity", "tpm_require", defaults.tpm_require)?,
        };

        let kt = KtSettings {
            require_signature: ini.get_bool("kt", "require_signature", false)?,
            root_pubkey_path: ini.get("kt", "root_pubkey_path").map(PathBuf::from),
            root_pubkey_hex: ini.get("kt", "root_pubkey_hex").map(str::to_string),
            gossip_alert_threshold: ini.get_num(
                "kt",
                "gossip_alert_threshold",
                KtSettings::default().gossip_alert_threshold,
            )?,
        };

        let ds_defaults = DeviceSyncSettings::default();
        let device_sync = DeviceSyncSettings {
            enabled: ini.get_bool("device_sync", "enabled", false)?,
            role: match ini.get("device_sync", "role").unwrap_or("primary") {
                "primary" => DeviceSyncRole::Primary,
                "linked" => DeviceSyncRole::Linked,
                other => {
                    return Err(CoreError::Config(format!(
                        "[device_sync] role: unknown '{other}'"
                    )))
                }
            },
            key_path: ini.get("device_sync", "key_path").map(PathBuf::from),
            rotate_interval_sec: ini.get_num(
                "device_sync",
                "rotate_interval_sec",
                ds_defaults.rotate_interval_sec,
            )?,
            rotate_message_limit: ini.get_num(
                "device_sync",
                "rotate_message_limit",
                ds_defaults.rotate_message_limit,
            )?,
            ratchet_enable: ini.get_bool("device_sync", "ratchet_enable", ds_defaults.ratchet_enable)?,
            ratchet_max_skip: ini.get_num(
                "device_sync",
                "ratchet_max_skip",
                ds_defaults.ratchet_max_skip,
            )?,
        };

        let traffic = TrafficSettings {
            cover_traffic_enable: ini.get_bool("traffic", "cover_traffic_enable", false)?,
            cover_traffic_interval_sec: ini.get_num(
                "traffic",
                "cover_traffic_interval_sec",
                TrafficSettings::default().cover_traffic_interval_sec,
            )?,
        };

        let cfg = Self {
            server_ip,
            server_port,
            use_tls: ini.get_bool("client", "use_tls", false)?,
            require_tls: ini.get_bool("client", "require_tls", false)?,
            tls_verify_mode,
            tls_verify_hostname: ini.get_bool("client", "tls_verify_hostname", true)?,
            tls_ca_bundle_path: ini.get("client", "tls_ca_bundle_path").map(PathBuf::from),
            kcp,
            proxy,
            auth_mode,
            identity,
            kt,
            device_sync,
            pqc_precompute_pool: ini.get_num("perf", "pqc_precompute_pool", 2)?,
            traffic,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.require_tls && !self.use_tls && !self.kcp.enable {
            return Err(CoreError::Config("require_tls=1 but use_tls=0".into()));
        }
        if self.kcp.enable && self.proxy.enabled() {
            return Err(CoreError::Config("kcp does not support a proxy".into()));
        }
        if self.kt.require_signature
            && self.kt.root_pubkey_path.is_none()
            && self.kt.root_pubkey_hex.is_none()
        {
            return Err(CoreError::Config("kt root pubkey missing".into()));
        }
        Ok(())
    }

    /// Effective remote port: the KCP port when tunneling over UDP.
    pub fn effective_port(&self) -> u16 {
        if self.kcp.enable && self.kcp.server_port != 0 {
            self.kcp.server_port
        } else {
            self.server_port
        }
    }

    /// KCP is mutually exclusive with TLS; UDP wins when both are set.
    pub fn effective_tls(&self) -> bool {
        self.use_tls && !self.kcp.enable
    }
}
