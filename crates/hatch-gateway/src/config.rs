//! Gateway configuration: TOML file + CLI overrides.

use crate::auth::StaticCredentialProvider;
use crate::broker::BrokerSettings;
use crate::relay::RelaySettings;
use crate::tunnel::TunnelSettings;
use hatch_core::keys::load_authorized_keys;
use hatch_core::mux::{DEFAULT_MAX_BUFFER, DEFAULT_WINDOW};
use hatch_core::{HatchError, HatchResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    /// Generated at startup when unset.
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default = "default_agent_listen")]
    pub agent_listen: String,
    #[serde(default = "default_client_listen")]
    pub client_listen: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            instance_id: None,
            agent_listen: default_agent_listen(),
            client_listen: default_client_listen(),
            max_sessions: default_max_sessions(),
            namespace: default_namespace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_key_path")]
    pub key: String,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            cert: default_cert_path(),
            key: default_key_path(),
        }
    }
}

/// Where shared state lives. `memory` only works for a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySection {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_registry_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            url: default_redis_url(),
            ttl_secs: default_registry_ttl(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    #[serde(default = "default_max_missed")]
    pub max_missed_keepalives: u32,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            url: default_redis_url(),
            open_timeout_secs: default_open_timeout(),
            keepalive_secs: default_keepalive(),
            max_missed_keepalives: default_max_missed(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_max_missed")]
    pub max_missed_heartbeats: u32,
    #[serde(default = "default_window")]
    pub window: u32,
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// How long a device may take to answer a channel open.
    #[serde(default = "default_channel_open_timeout")]
    pub channel_open_timeout_secs: u64,
    #[serde(default = "default_register_attempts")]
    pub register_attempts: u32,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat(),
            max_missed_heartbeats: default_max_missed(),
            window: default_window(),
            max_buffer: default_max_buffer(),
            handshake_timeout_secs: default_handshake_timeout(),
            channel_open_timeout_secs: default_channel_open_timeout(),
            register_attempts: default_register_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// 0 disables.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// 0 disables.
    #[serde(default)]
    pub absolute_timeout_secs: u64,
    /// Empty keeps recordings in memory.
    #[serde(default = "default_recording_dir")]
    pub recording_dir: String,
    /// How long ended sessions stay queryable.
    #[serde(default = "default_retain_ended")]
    pub retain_ended_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            absolute_timeout_secs: 0,
            recording_dir: default_recording_dir(),
            retain_ended_secs: default_retain_ended(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Hex HMAC secret for device tokens. Token auth is off when unset.
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default)]
    pub require_enrollment: bool,
    #[serde(default = "default_authorized_keys")]
    pub authorized_keys: String,
    #[serde(default = "default_auth_per_minute")]
    pub auth_per_minute: u32,
    #[serde(default = "default_agent_per_minute")]
    pub agent_per_minute: u32,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub users: Vec<PasswordEntry>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token_secret: None,
            require_enrollment: false,
            authorized_keys: default_authorized_keys(),
            auth_per_minute: default_auth_per_minute(),
            agent_per_minute: default_agent_per_minute(),
            devices: Vec::new(),
            users: Vec::new(),
        }
    }
}

/// `[[auth.devices]]`
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Hex Ed25519 public key.
    #[serde(default)]
    pub public_key: Option<String>,
}

/// `[[auth.users]]`
#[derive(Debug, Clone, Deserialize)]
pub struct PasswordEntry {
    pub name: String,
    pub password_sha256: String,
    /// authorized_keys option syntax.
    #[serde(default)]
    pub options: Option<String>,
}

fn default_agent_listen() -> String {
    "0.0.0.0:4430".to_string()
}
fn default_client_listen() -> String {
    "0.0.0.0:4422".to_string()
}
fn default_max_sessions() -> usize {
    100
}
fn default_namespace() -> String {
    "default".to_string()
}
fn default_cert_path() -> String {
    "~/.hatch/cert.pem".to_string()
}
fn default_key_path() -> String {
    "~/.hatch/key.pem".to_string()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}
fn default_registry_ttl() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    100
}
fn default_open_timeout() -> u64 {
    10
}
fn default_keepalive() -> u64 {
    5
}
fn default_max_missed() -> u32 {
    3
}
fn default_heartbeat() -> u64 {
    10
}
fn default_window() -> u32 {
    DEFAULT_WINDOW
}
fn default_max_buffer() -> usize {
    DEFAULT_MAX_BUFFER
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_channel_open_timeout() -> u64 {
    10
}
fn default_register_attempts() -> u32 {
    3
}
fn default_idle_timeout() -> u64 {
    1800
}
fn default_recording_dir() -> String {
    "~/.hatch/recordings".to_string()
}
fn default_retain_ended() -> u64 {
    3600
}
fn default_authorized_keys() -> String {
    "~/.hatch/authorized_keys".to_string()
}
fn default_auth_per_minute() -> u32 {
    5
}
fn default_agent_per_minute() -> u32 {
    30
}

/// Values given on the command line win over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub instance_id: Option<String>,
    pub agent_listen: Option<String>,
    pub client_listen: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub tls: bool,
    pub redis_url: Option<String>,
    pub recording_dir: Option<String>,
    pub max_sessions: Option<usize>,
}

/// Resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub instance_id: Option<String>,
    pub agent_listen: SocketAddr,
    pub client_listen: SocketAddr,
    pub max_sessions: usize,
    pub tls: Option<(PathBuf, PathBuf)>,
    pub recording_dir: Option<PathBuf>,
    pub file: ConfigFile,
}

impl GatewayConfig {
    /// Load the TOML file (defaults if missing), then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> HatchResult<Self> {
        let file = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(&path)?;
                parse(&content)?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file, cli)
    }

    pub fn resolve(mut file: ConfigFile, cli: CliOverrides) -> HatchResult<Self> {
        if let Some(url) = cli.redis_url {
            file.registry.backend = Backend::Redis;
            file.registry.url = url.clone();
            file.relay.backend = Backend::Redis;
            file.relay.url = url;
        }
        if let Some(dir) = cli.recording_dir {
            file.session.recording_dir = dir;
        }
        if let Some(max) = cli.max_sessions {
            file.gateway.max_sessions = max;
        }

        let agent_listen = parse_addr(cli.agent_listen.as_deref().unwrap_or(&file.gateway.agent_listen))?;
        let client_listen =
            parse_addr(cli.client_listen.as_deref().unwrap_or(&file.gateway.client_listen))?;

        let tls = if cli.tls || file.tls.enabled || cli.cert.is_some() {
            let cert = cli.cert.unwrap_or_else(|| file.tls.cert.clone());
            let key = cli.key.unwrap_or_else(|| file.tls.key.clone());
            Some((expand_tilde_str(&cert), expand_tilde_str(&key)))
        } else {
            None
        };

        let recording_dir = match file.session.recording_dir.trim() {
            "" => None,
            dir => Some(expand_tilde_str(dir)),
        };

        Ok(Self {
            instance_id: cli.instance_id.or_else(|| file.gateway.instance_id.clone()),
            agent_listen,
            client_listen,
            max_sessions: file.gateway.max_sessions,
            tls,
            recording_dir,
            file,
        })
    }

    pub fn tunnel_settings(&self) -> TunnelSettings {
        let t = &self.file.tunnel;
        TunnelSettings {
            heartbeat_interval: Duration::from_secs(t.heartbeat_secs.max(1)),
            max_missed_heartbeats: t.max_missed_heartbeats.max(1),
            registry_ttl: Duration::from_secs(self.file.registry.ttl_secs.max(1)),
            register_attempts: t.register_attempts.max(1),
            window: t.window,
            max_buffer: t.max_buffer,
            handshake_timeout: Duration::from_secs(t.handshake_timeout_secs.max(1)),
            open_timeout: Duration::from_secs(t.channel_open_timeout_secs.max(1)),
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        let r = &self.file.relay;
        RelaySettings {
            open_timeout: Duration::from_secs(r.open_timeout_secs.max(1)),
            keepalive_interval: Duration::from_secs(r.keepalive_secs.max(1)),
            max_missed_keepalives: r.max_missed_keepalives.max(1),
            window: self.file.tunnel.window,
            max_buffer: self.file.tunnel.max_buffer,
        }
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        let s = &self.file.session;
        let optional = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        BrokerSettings {
            idle_timeout: optional(s.idle_timeout_secs),
            absolute_timeout: optional(s.absolute_timeout_secs),
            handshake_timeout: Duration::from_secs(self.file.tunnel.handshake_timeout_secs.max(1)),
            ..BrokerSettings::default()
        }
    }

    pub fn registry_retry(&self) -> (u32, Duration) {
        (
            self.file.registry.retry_attempts.max(1),
            Duration::from_millis(self.file.registry.retry_backoff_ms),
        )
    }

    /// Build the credential provider from `[auth]` and the authorized_keys file.
    pub fn credential_provider(&self) -> HatchResult<StaticCredentialProvider> {
        let auth = &self.file.auth;
        let mut provider = StaticCredentialProvider::new(self.file.gateway.namespace.clone())
            .require_enrollment(auth.require_enrollment);
        if let Some(secret) = &auth.token_secret {
            let secret = hex::decode(secret.trim())
                .map_err(|e| HatchError::Other(format!("auth.token_secret is not hex: {e}")))?;
            provider = provider.with_token_secret(secret);
        }
        for device in &auth.devices {
            let public_key = device
                .public_key
                .as_deref()
                .map(|k| {
                    hex::decode(k.trim()).map_err(|e| {
                        HatchError::Other(format!("public key of device {} is not hex: {e}", device.id))
                    })
                })
                .transpose()?;
            provider.add_device(device.id.clone(), device.namespace.clone(), public_key);
        }
        for user in &auth.users {
            provider.add_password_user(user.name.clone(), user.password_sha256.clone(), user.options.as_deref());
        }

        let keys_path = expand_tilde_str(&auth.authorized_keys);
        if keys_path.exists() {
            let keys = load_authorized_keys(&keys_path)?;
            info!(path = %keys_path.display(), count = keys.len(), "loaded authorized keys");
            provider.add_user_keys(keys);
        } else {
            warn!(path = %keys_path.display(), "authorized_keys file not found");
        }
        Ok(provider)
    }
}

fn parse(content: &str) -> HatchResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| HatchError::Other(format!("config parse error: {e}")))
}

fn parse_addr(s: &str) -> HatchResult<SocketAddr> {
    s.parse()
        .map_err(|e| HatchError::Other(format!("invalid listen address {s:?}: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

pub fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
