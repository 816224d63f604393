//! Parse `authorized_keys` style lines (SSH format).
//!
//! Used for user keys (with per-key options restricting devices and
//! purposes) and for device public keys in the gateway config.

use crate::error::HatchResult;
use crate::identity;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::Path;

/// A parsed authorized key entry.
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    /// Key type (e.g., "ssh-ed25519").
    pub key_type: String,
    /// Raw 32-byte Ed25519 public key.
    pub raw_key: Vec<u8>,
    /// Optional comment (usually user@host).
    pub comment: String,
    /// SHA-256 fingerprint (hex) of `raw_key`.
    pub fingerprint: String,
    /// Options from the start of the line, e.g. `no-pty,devices="a,b"`.
    pub options: Option<String>,
}

/// One `name` or `name="value"` entry of an options string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOption {
    pub name: String,
    pub value: Option<String>,
}

/// Parse an authorized_keys file, returning all valid Ed25519 entries.
pub fn parse_authorized_keys(content: &str) -> Vec<AuthorizedKey> {
    content
        .lines()
        .filter_map(|line| parse_authorized_key_line(line.trim()))
        .collect()
}

/// Parse a single authorized_keys line.
pub fn parse_authorized_key_line(line: &str) -> Option<AuthorizedKey> {
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (options, rest) = if line.starts_with("ssh-") {
        (None, line)
    } else {
        let end = unquoted_space(line)?;
        (Some(line[..end].to_string()), line[end..].trim_start())
    };

    let mut parts = rest.splitn(3, ' ');
    let key_type = parts.next()?.to_string();
    let key_data = parts.next()?;
    let comment = parts.next().unwrap_or("").trim().to_string();

    // Only ed25519 is supported
    if key_type != "ssh-ed25519" {
        return None;
    }

    let wire = STANDARD.decode(key_data).ok()?;
    let raw_key = extract_raw_ed25519(&wire)?;
    let fingerprint = identity::fingerprint(&raw_key);

    Some(AuthorizedKey {
        key_type,
        raw_key,
        comment,
        fingerprint,
        options,
    })
}

/// Split an options string on commas that are not inside quotes.
pub fn parse_options(options: &str) -> Vec<KeyOption> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in options.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                if let Some(opt) = to_option(&current) {
                    out.push(opt);
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if let Some(opt) = to_option(&current) {
        out.push(opt);
    }
    out
}

fn to_option(raw: &str) -> Option<KeyOption> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.split_once('=') {
        Some((name, value)) => Some(KeyOption {
            name: name.trim().to_ascii_lowercase(),
            value: Some(value.trim().trim_matches('"').to_string()),
        }),
        None => Some(KeyOption {
            name: raw.to_ascii_lowercase(),
            value: None,
        }),
    }
}

/// Byte offset of the first space that is not inside double quotes.
fn unquoted_space(line: &str) -> Option<usize> {
    let mut in_quotes = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ' ' | '\t' if !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

/// Extract the raw 32-byte Ed25519 public key from SSH wire format.
///
/// SSH wire format: `[4-byte len]["ssh-ed25519"][4-byte len][32-byte key]`
fn extract_raw_ed25519(wire: &[u8]) -> Option<Vec<u8>> {
    let type_len = u32::from_be_bytes(wire.get(0..4)?.try_into().ok()?) as usize;
    let key_offset = 4 + type_len;
    let key_len =
        u32::from_be_bytes(wire.get(key_offset..key_offset + 4)?.try_into().ok()?) as usize;
    let data_offset = key_offset + 4;
    let key = wire.get(data_offset..data_offset + key_len)?;
    if key.len() != 32 {
        return None;
    }
    Some(key.to_vec())
}

/// Load an authorized_keys file. A missing file yields no keys.
pub fn load_authorized_keys(path: &Path) -> HatchResult<Vec<AuthorizedKey>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(parse_authorized_keys(&content))
}

/// Look up the entry whose key matches a raw public key.
pub fn find_key<'a>(public_key_raw: &[u8], authorized: &'a [AuthorizedKey]) -> Option<&'a AuthorizedKey> {
    let fp = identity::fingerprint(public_key_raw);
    authorized.iter().find(|k| k.fingerprint == fp)
}
