//! Credential and identity provider.
//!
//! The gateway only talks to [`CredentialProvider`]. The shipped
//! [`StaticCredentialProvider`] is backed by the gateway config and an
//! authorized_keys file.

use super::permissions::{KeyPermissions, Permission};
use crate::handshake::{check_freshness, unix_now, verify_ed25519};
use async_trait::async_trait;
use hatch_core::identity::agent_transcript;
use hatch_core::keys::AuthorizedKey;
use hatch_core::messages::{DeviceProof, Handshake};
use hatch_core::{fingerprint, verify_device_token, HatchError, HatchResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    /// Absent for devices that authenticate with a token only.
    pub public_key_fingerprint: Option<String>,
    pub namespace_id: String,
    pub status: DeviceStatus,
    /// UNIX epoch milliseconds.
    pub last_heartbeat: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    /// Key used to authenticate; `None` for password logins.
    pub key_fingerprint: Option<String>,
}

pub enum UserCredentials {
    PublicKey {
        username: String,
        public_key: Vec<u8>,
        signature: Vec<u8>,
        /// What the signature must cover (the client challenge transcript).
        transcript: Vec<u8>,
    },
    Password {
        username: String,
        password: String,
    },
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Check an agent's handshake proof and return the device it binds.
    async fn verify_device(&self, handshake: &Handshake) -> HatchResult<DeviceIdentity>;

    async fn authenticate_user(&self, credentials: &UserCredentials) -> HatchResult<UserIdentity>;

    /// `PolicyDenied` if the user may not reach the device at all.
    async fn authorize_session(
        &self,
        user: &UserIdentity,
        device_id: &str,
    ) -> HatchResult<Permission>;
}

#[derive(Debug, Clone)]
struct EnrolledDevice {
    namespace_id: String,
    public_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct PasswordUser {
    sha256_hex: String,
    permissions: KeyPermissions,
}

/// Provider backed by static tables loaded at startup.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    default_namespace: String,
    token_secret: Option<Vec<u8>>,
    /// Token-authenticated devices must be listed here.
    require_enrollment: bool,
    devices: HashMap<String, EnrolledDevice>,
    user_keys: Vec<(AuthorizedKey, KeyPermissions)>,
    passwords: HashMap<String, PasswordUser>,
}

impl StaticCredentialProvider {
    pub fn new(default_namespace: impl Into<String>) -> Self {
        Self {
            default_namespace: default_namespace.into(),
            token_secret: None,
            require_enrollment: false,
            devices: HashMap::new(),
            user_keys: Vec::new(),
            passwords: HashMap::new(),
        }
    }

    pub fn with_token_secret(mut self, secret: Vec<u8>) -> Self {
        self.token_secret = Some(secret);
        self
    }

    pub fn require_enrollment(mut self, required: bool) -> Self {
        self.require_enrollment = required;
        self
    }

    pub fn add_device(
        &mut self,
        device_id: impl Into<String>,
        namespace_id: Option<String>,
        public_key: Option<Vec<u8>>,
    ) {
        let namespace_id = namespace_id.unwrap_or_else(|| self.default_namespace.clone());
        self.devices.insert(
            device_id.into(),
            EnrolledDevice {
                namespace_id,
                public_key,
            },
        );
    }

    pub fn add_user_keys(&mut self, keys: Vec<AuthorizedKey>) {
        for key in keys {
            let perms = KeyPermissions::from_options(key.fingerprint.clone(), key.options.as_deref());
            self.user_keys.push((key, perms));
        }
    }

    /// `options` uses authorized_keys option syntax.
    pub fn add_password_user(
        &mut self,
        username: impl Into<String>,
        sha256_hex: impl Into<String>,
        options: Option<&str>,
    ) {
        self.passwords.insert(
            username.into(),
            PasswordUser {
                sha256_hex: sha256_hex.into().to_ascii_lowercase(),
                permissions: KeyPermissions::from_options(String::new(), options),
            },
        );
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn user_key_count(&self) -> usize {
        self.user_keys.len()
    }

    fn identity(&self, device_id: &str, public_key: Option<&[u8]>) -> DeviceIdentity {
        let namespace_id = self
            .devices
            .get(device_id)
            .map(|d| d.namespace_id.clone())
            .unwrap_or_else(|| self.default_namespace.clone());
        DeviceIdentity {
            device_id: device_id.to_string(),
            public_key_fingerprint: public_key.map(fingerprint),
            namespace_id,
            status: DeviceStatus::Pending,
            last_heartbeat: None,
        }
    }
}

/// Hex SHA-256 of a password, as stored in config.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn digests_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn verify_device(&self, handshake: &Handshake) -> HatchResult<DeviceIdentity> {
        let device_id = handshake.device_id.as_str();
        if device_id.is_empty() {
            return Err(HatchError::AuthFailure("empty device id".into()));
        }
        match &handshake.proof {
            DeviceProof::Token { token } => {
                let secret = self
                    .token_secret
                    .as_ref()
                    .ok_or_else(|| HatchError::AuthFailure("token auth disabled".into()))?;
                if self.require_enrollment && !self.devices.contains_key(device_id) {
                    return Err(HatchError::AuthFailure(format!(
                        "device {device_id} is not enrolled"
                    )));
                }
                verify_device_token(secret, device_id, token)
                    .map_err(|e| HatchError::AuthFailure(e.to_string()))?;
                debug!(device_id, "device token accepted");
                Ok(self.identity(device_id, None))
            }
            DeviceProof::Signature {
                public_key,
                signature,
            } => {
                let enrolled = self
                    .devices
                    .get(device_id)
                    .and_then(|d| d.public_key.as_ref())
                    .ok_or_else(|| {
                        HatchError::AuthFailure(format!("no key enrolled for device {device_id}"))
                    })?;
                if enrolled != public_key {
                    warn!(device_id, fingerprint = %fingerprint(public_key), "device key mismatch");
                    return Err(HatchError::AuthFailure("device key mismatch".into()));
                }
                check_freshness(handshake.timestamp, unix_now())?;
                let transcript = agent_transcript(device_id, handshake.timestamp);
                verify_ed25519(public_key, &transcript, signature)?;
                debug!(device_id, "device signature accepted");
                Ok(self.identity(device_id, Some(public_key.as_slice())))
            }
        }
    }

    async fn authenticate_user(&self, credentials: &UserCredentials) -> HatchResult<UserIdentity> {
        match credentials {
            UserCredentials::PublicKey {
                username,
                public_key,
                signature,
                transcript,
            } => {
                let fp = fingerprint(public_key);
                let (key, _) = self
                    .user_keys
                    .iter()
                    .find(|(k, _)| k.fingerprint == fp)
                    .ok_or_else(|| {
                        warn!(username = %username, fingerprint = %fp, "unauthorized key");
                        HatchError::AuthFailure("key not authorized".into())
                    })?;
                verify_ed25519(public_key, transcript, signature)?;
                info!(username = %username, fingerprint = %&key.fingerprint[..12], "pubkey auth OK");
                Ok(UserIdentity {
                    user_id: username.clone(),
                    key_fingerprint: Some(key.fingerprint.clone()),
                })
            }
            UserCredentials::Password { username, password } => {
                let user = self
                    .passwords
                    .get(username)
                    .ok_or_else(|| HatchError::AuthFailure("invalid credentials".into()))?;
                if !digests_match(&hash_password(password), &user.sha256_hex) {
                    warn!(username = %username, "password mismatch");
                    return Err(HatchError::AuthFailure("invalid credentials".into()));
                }
                info!(username = %username, "password auth OK");
                Ok(UserIdentity {
                    user_id: username.clone(),
                    key_fingerprint: None,
                })
            }
        }
    }

    async fn authorize_session(
        &self,
        user: &UserIdentity,
        device_id: &str,
    ) -> HatchResult<Permission> {
        let perms = match &user.key_fingerprint {
            Some(fp) => self
                .user_keys
                .iter()
                .find(|(k, _)| &k.fingerprint == fp)
                .map(|(_, p)| p),
            None => self.passwords.get(&user.user_id).map(|u| &u.permissions),
        }
        .ok_or_else(|| HatchError::PolicyDenied(format!("no grants for {}", user.user_id)))?;

        if !perms.allows_device(device_id) {
            return Err(HatchError::PolicyDenied(format!(
                "{} may not access device {device_id}",
                user.user_id
            )));
        }
        let namespace_id = self
            .devices
            .get(device_id)
            .map(|d| d.namespace_id.as_str())
            .unwrap_or(&self.default_namespace);
        Ok(perms.grant(namespace_id))
    }
}
