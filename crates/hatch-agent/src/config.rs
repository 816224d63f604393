//! Agent configuration: TOML file + CLI overrides.

use crate::channel::{default_shell, ChannelServices};
use crate::credential::DeviceCredential;
use crate::forward::ForwardPolicy;
use hatch_core::{HatchError, HatchResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub forward: ForwardSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub device_id: Option<String>,
    /// Gateway agent listener, `host:port`.
    #[serde(default = "default_gateway")]
    pub gateway: String,
    #[serde(default)]
    pub tls: bool,
    /// PEM bundle used to verify the gateway certificate.
    #[serde(default)]
    pub ca_cert: Option<String>,
    /// Skip certificate verification (development only).
    #[serde(default)]
    pub insecure: bool,
    /// TLS server name; defaults to the host part of `gateway`.
    #[serde(default)]
    pub server_name: Option<String>,
    /// Hex enrollment token. Takes precedence over `key_file`.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_key_file")]
    pub key_file: String,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub sftp_server: Option<String>,
    #[serde(default = "default_reconnect_min")]
    pub reconnect_min_secs: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            device_id: None,
            gateway: default_gateway(),
            tls: false,
            ca_cert: None,
            insecure: false,
            server_name: None,
            token: None,
            key_file: default_key_file(),
            shell: None,
            sftp_server: None,
            reconnect_min_secs: default_reconnect_min(),
            reconnect_max_secs: default_reconnect_max(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

fn default_gateway() -> String {
    "127.0.0.1:4430".to_string()
}
fn default_key_file() -> String {
    "~/.hatch/device.key".to_string()
}
fn default_reconnect_min() -> u64 {
    1
}
fn default_reconnect_max() -> u64 {
    60
}
fn default_handshake_timeout() -> u64 {
    15
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardSection {
    /// `*`, `host` or `host:port` patterns. Empty allows nothing.
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default = "default_max_forwards")]
    pub max_connections: usize,
}

impl Default for ForwardSection {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            max_connections: default_max_forwards(),
        }
    }
}

fn default_max_forwards() -> usize {
    64
}

/// Values given on the command line win over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub device_id: Option<String>,
    pub gateway: Option<String>,
    pub token: Option<String>,
    pub key_file: Option<String>,
    pub tls: bool,
    pub ca_cert: Option<String>,
    pub insecure: bool,
}

/// How the agent secures its dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    pub server_name: String,
    pub ca_cert: Option<PathBuf>,
    pub insecure: bool,
}

/// Where the device credential comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    Token(String),
    KeyFile(PathBuf),
}

impl CredentialSource {
    pub fn load(&self) -> HatchResult<DeviceCredential> {
        match self {
            Self::Token(token) => DeviceCredential::from_token_hex(token),
            Self::KeyFile(path) => DeviceCredential::from_key_file(path),
        }
    }
}

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub device_id: String,
    pub gateway: String,
    pub tls: Option<TlsOptions>,
    pub credential: CredentialSource,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub handshake_timeout: Duration,
    pub file: ConfigFile,
}

impl AgentConfig {
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

    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> HatchResult<Self> {
        let a = &file.agent;
        let device_id = cli
            .device_id
            .or_else(|| a.device_id.clone())
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| HatchError::Other("agent.device_id is required".into()))?;
        let gateway = cli.gateway.unwrap_or_else(|| a.gateway.clone());
        let host = gateway_host(&gateway)?;

        let tls = if cli.tls || a.tls {
            let ca_cert = cli
                .ca_cert
                .or_else(|| a.ca_cert.clone())
                .filter(|p| !p.trim().is_empty())
                .map(|p| expand_tilde_str(&p));
            let insecure = cli.insecure || a.insecure;
            if ca_cert.is_none() && !insecure {
                return Err(HatchError::Other(
                    "TLS needs agent.ca_cert, or agent.insecure for development certs".into(),
                ));
            }
            Some(TlsOptions {
                server_name: a.server_name.clone().unwrap_or(host),
                ca_cert,
                insecure,
            })
        } else {
            None
        };

        let credential = match cli.token.or_else(|| a.token.clone()) {
            Some(token) if !token.trim().is_empty() => CredentialSource::Token(token),
            _ => CredentialSource::KeyFile(expand_tilde_str(
                cli.key_file.as_deref().unwrap_or(&a.key_file),
            )),
        };

        let reconnect_min = Duration::from_secs(a.reconnect_min_secs.max(1));
        let reconnect_max = Duration::from_secs(a.reconnect_max_secs).max(reconnect_min);
        let handshake_timeout = Duration::from_secs(a.handshake_timeout_secs.max(1));

        Ok(Self {
            device_id,
            gateway,
            tls,
            credential,
            reconnect_min,
            reconnect_max,
            handshake_timeout,
            file,
        })
    }

    pub fn channel_services(&self) -> ChannelServices {
        let a = &self.file.agent;
        let shell = a
            .shell
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(default_shell);
        ChannelServices {
            shell,
            sftp_server: a
                .sftp_server
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(expand_tilde_str),
            forward: ForwardPolicy::new(&self.file.forward.allow, self.file.forward.max_connections),
        }
    }
}

/// Host part of `host:port` (brackets stripped for IPv6 literals).
fn gateway_host(gateway: &str) -> HatchResult<String> {
    let (host, port) = gateway
        .rsplit_once(':')
        .ok_or_else(|| HatchError::Other(format!("gateway address {gateway:?} needs a port")))?;
    port.parse::<u16>()
        .map_err(|e| HatchError::Other(format!("invalid gateway port in {gateway:?}: {e}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(HatchError::Other(format!("gateway address {gateway:?} has no host")));
    }
    Ok(host.to_string())
}

fn parse(content: &str) -> HatchResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| HatchError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_str(&path.to_string_lossy())
}

pub fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
