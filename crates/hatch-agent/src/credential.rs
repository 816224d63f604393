//! Device credentials and the handshake proof built from them.
//!
//! A device proves itself either with an HMAC enrollment token issued by
//! the gateway operator, or with an Ed25519 key whose public half is listed
//! in the gateway's `[[auth.devices]]`. Key files hold the 32-byte secret
//! seed, hex encoded.

use ed25519_dalek::{Signer, SigningKey};
use hatch_core::identity::{agent_transcript, fingerprint};
use hatch_core::messages::{DeviceProof, Handshake};
use hatch_core::{HatchError, HatchResult, TUNNEL_PROTOCOL_VERSION};
use std::fmt;
use std::fs;
use std::path::Path;

pub enum DeviceCredential {
    Token(Vec<u8>),
    Key(SigningKey),
}

impl DeviceCredential {
    /// Parse a hex token as printed by `hatch-gateway --issue-token`.
    pub fn from_token_hex(token: &str) -> HatchResult<Self> {
        let bytes = hex::decode(token.trim())
            .map_err(|e| HatchError::Token(format!("device token is not hex: {e}")))?;
        Ok(Self::Token(bytes))
    }

    pub fn from_key_file(path: &Path) -> HatchResult<Self> {
        load_key(path).map(Self::Key)
    }

    /// Build the opening frame for `device_id` at `timestamp` (UNIX seconds).
    pub fn handshake(&self, device_id: &str, timestamp: u64) -> Handshake {
        let proof = match self {
            Self::Token(token) => DeviceProof::Token {
                token: token.clone(),
            },
            Self::Key(key) => {
                let signature = key.sign(&agent_transcript(device_id, timestamp));
                DeviceProof::Signature {
                    public_key: key.verifying_key().to_bytes().to_vec(),
                    signature: signature.to_bytes().to_vec(),
                }
            }
        };
        Handshake {
            version: TUNNEL_PROTOCOL_VERSION.to_string(),
            device_id: device_id.to_string(),
            timestamp,
            proof,
        }
    }
}

impl fmt::Debug for DeviceCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(_) => f.write_str("DeviceCredential::Token(..)"),
            Self::Key(key) => write!(
                f,
                "DeviceCredential::Key({})",
                fingerprint(key.verifying_key().as_bytes())
            ),
        }
    }
}

pub fn load_key(path: &Path) -> HatchResult<SigningKey> {
    let content = fs::read_to_string(path).map_err(|e| {
        HatchError::Other(format!("cannot read device key {}: {e}", path.display()))
    })?;
    let bytes = hex::decode(content.trim())
        .map_err(|e| HatchError::Other(format!("device key {} is not hex: {e}", path.display())))?;
    let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        HatchError::Other(format!(
            "device key {} must hold 32 bytes, found {}",
            path.display(),
            bytes.len()
        ))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Generate a key, write it to `path` (refusing to overwrite) and return
/// the hex public key to enroll on the gateway.
pub fn generate_key(path: &Path) -> HatchResult<String> {
    if path.exists() {
        return Err(HatchError::Other(format!(
            "device key {} already exists",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    fs::write(path, hex::encode(key.to_bytes()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(hex::encode(key.verifying_key().to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};
    use hatch_core::{create_device_token, verify_device_token};

    #[test]
    fn key_proof_verifies_against_transcript() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let cred = DeviceCredential::Key(key.clone());
        let hs = cred.handshake("pi-kitchen", 1_700_000_000);
        assert_eq!(hs.version, TUNNEL_PROTOCOL_VERSION);

        let DeviceProof::Signature {
            public_key,
            signature,
        } = hs.proof
        else {
            panic!("expected signature proof");
        };
        let vk = VerifyingKey::from_bytes(&public_key.try_into().unwrap()).unwrap();
        let sig = Signature::from_slice(&signature).unwrap();
        vk.verify(&agent_transcript("pi-kitchen", 1_700_000_000), &sig)
            .unwrap();
        // A different timestamp is a different transcript.
        assert!(vk
            .verify(&agent_transcript("pi-kitchen", 1_700_000_001), &sig)
            .is_err());
    }

    #[test]
    fn token_proof_carries_token() {
        let secret = [3u8; 32];
        let token = create_device_token(&secret, "d1", 60);
        let cred = DeviceCredential::from_token_hex(&hex::encode(&token)).unwrap();
        match cred.handshake("d1", 0).proof {
            DeviceProof::Token { token } => verify_device_token(&secret, "d1", &token).unwrap(),
            other => panic!("unexpected proof {other:?}"),
        }
    }

    #[test]
    fn bad_token_hex_is_rejected() {
        let err = DeviceCredential::from_token_hex("zz").unwrap_err();
        assert!(matches!(err, HatchError::Token(_)));
    }

    #[test]
    fn generated_key_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("device.key");
        let public_hex = generate_key(&path).unwrap();

        let key = load_key(&path).unwrap();
        assert_eq!(hex::encode(key.verifying_key().to_bytes()), public_hex);
        assert!(generate_key(&path).is_err());
    }

    #[test]
    fn short_key_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.key");
        fs::write(&path, "abcd").unwrap();
        let err = load_key(&path).unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }
}
