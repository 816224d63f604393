//! Per-key permission scopes.
//!
//! authorized_keys options restrict what a user key may do:
//! `devices="a,b"`, `scopes="shell,exec"`, `no-pty`, `command="..."`.
//! A key without options gets full access.

use hatch_core::keys::{parse_options, KeyOption};
use hatch_core::Purpose;
use serde::{Deserialize, Serialize};
use tracing::warn;

const ALL_PURPOSES: [Purpose; 4] = [
    Purpose::Shell,
    Purpose::Exec,
    Purpose::PortForward,
    Purpose::Sftp,
];

/// What an authorized session may do on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub namespace_id: String,
    pub scopes: Vec<Purpose>,
    pub allow_pty: bool,
    /// Overrides whatever command the client asked for.
    pub forced_command: Option<String>,
}

impl Permission {
    pub fn has_scope(&self, purpose: Purpose) -> bool {
        self.scopes.contains(&purpose)
    }
}

/// Restrictions attached to one user key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPermissions {
    pub fingerprint: String,
    /// `None` = any device.
    pub devices: Option<Vec<String>>,
    pub scopes: Vec<Purpose>,
    pub allow_pty: bool,
    pub forced_command: Option<String>,
}

impl KeyPermissions {
    pub fn full_access(fingerprint: String) -> Self {
        Self {
            fingerprint,
            devices: None,
            scopes: ALL_PURPOSES.to_vec(),
            allow_pty: true,
            forced_command: None,
        }
    }

    /// Parse permissions from an authorized_keys options string.
    pub fn from_options(fingerprint: String, options: Option<&str>) -> Self {
        let mut perms = Self::full_access(fingerprint);
        let Some(options) = options else {
            return perms;
        };
        for KeyOption { name, value } in parse_options(options) {
            match (name.as_str(), value) {
                ("no-pty", _) => perms.allow_pty = false,
                ("command", Some(cmd)) => perms.forced_command = Some(cmd),
                ("devices", Some(list)) => perms.devices = Some(split_list(&list)),
                ("scopes", Some(list)) => {
                    perms.scopes = split_list(&list)
                        .iter()
                        .filter_map(|s| {
                            let purpose = Purpose::parse(s);
                            if purpose.is_none() {
                                warn!(fingerprint = %perms.fingerprint, scope = %s, "unknown scope in key options");
                            }
                            purpose
                        })
                        .collect();
                }
                (other, _) => {
                    warn!(fingerprint = %perms.fingerprint, option = %other, "ignoring key option")
                }
            }
        }
        perms
    }

    pub fn allows_device(&self, device_id: &str) -> bool {
        match &self.devices {
            Some(devices) => devices.iter().any(|d| d == device_id || d == "*"),
            None => true,
        }
    }

    /// The permission this key yields on a device in `namespace_id`.
    pub fn grant(&self, namespace_id: &str) -> Permission {
        Permission {
            namespace_id: namespace_id.to_string(),
            scopes: self.scopes.clone(),
            allow_pty: self.allow_pty,
            forced_command: self.forced_command.clone(),
        }
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
