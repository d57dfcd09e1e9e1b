//! Inbound requests handed to the supervisor by the API layer.
//!
//! Each request that comes in several shapes is an explicit sum type, so
//! every consumer matches all variants at compile time.  Validation lives
//! here so that nothing malformed ever reaches a driver or the store.

use serde::{Deserialize, Serialize};

use crate::error::Error;

// ───────────────────────────────────────────────────────────────
// Wi-Fi connection
// ───────────────────────────────────────────────────────────────

/// A Wi-Fi network to join.  Also the persisted "saved network" record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connection {
    #[serde(rename = "none")]
    Open { ssid: String },
    Personal { ssid: String, psk: String },
    Enterprise {
        ssid: String,
        identity: String,
        password: String,
    },
}

impl Connection {
    pub fn ssid(&self) -> &str {
        match self {
            Self::Open { ssid } | Self::Personal { ssid, .. } | Self::Enterprise { ssid, .. } => ssid,
        }
    }

    pub fn encryption(&self) -> Encryption {
        match self {
            Self::Open { .. } => Encryption::None,
            Self::Personal { .. } => Encryption::Personal,
            Self::Enterprise { .. } => Encryption::Enterprise,
        }
    }

    /// Reject credentials the supplicant could never accept.
    pub fn validate(&self) -> Result<(), Error> {
        validate_ssid(self.ssid())?;
        match self {
            Self::Open { .. } => Ok(()),
            Self::Personal { psk, .. } => validate_psk(psk),
            Self::Enterprise {
                identity, password, ..
            } => {
                if identity.is_empty() || identity.len() > 64 {
                    return Err(Error::Invalid("identity must be 1-64 bytes".into()));
                }
                if password.is_empty() || password.len() > 64 {
                    return Err(Error::Invalid("password must be 1-64 bytes".into()));
                }
                Ok(())
            }
        }
    }
}

/// Security class of a network, as reported by a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encryption {
    None,
    Personal,
    Enterprise,
}

fn validate_ssid(ssid: &str) -> Result<(), Error> {
    if ssid.is_empty() || heapless::String::<32>::try_from(ssid).is_err() {
        return Err(Error::Invalid("SSID must be 1-32 bytes".into()));
    }
    if ssid.chars().any(char::is_control) {
        return Err(Error::Invalid("SSID contains control characters".into()));
    }
    Ok(())
}

fn is_printable_ascii(s: &str) -> bool {
    s.bytes().all(|b| (0x20..=0x7E).contains(&b))
}

/// WPA2-PSK: 8-63 printable ASCII characters, or exactly 64 hex digits.
fn validate_psk(psk: &str) -> Result<(), Error> {
    if psk.len() == 64 && psk.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Ok(());
    }
    if psk.len() < 8 || heapless::String::<63>::try_from(psk).is_err() || !is_printable_ascii(psk) {
        return Err(Error::Invalid(
            "passphrase must be 8-63 printable characters or 64 hex digits".into(),
        ));
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────
// Payment node configuration
// ───────────────────────────────────────────────────────────────

/// Requested shape of a new payment node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeConfig {
    RemoteLnd {
        name: String,
        uri: String,
        /// PEM-encoded TLS certificate.
        cert: String,
        /// Hex-encoded macaroon.
        macaroon: String,
    },
    Local { name: String },
}

impl NodeConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::RemoteLnd { name, .. } | Self::Local { name } => name,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_node_name(self.name())?;
        if let Self::RemoteLnd { uri, .. } = self {
            if uri.is_empty() {
                return Err(Error::Invalid("remote node uri must be set".into()));
            }
        }
        Ok(())
    }

    /// Build the persisted record for this config under a fresh id.
    pub fn into_record(self, id: String) -> NodeRecord {
        let (name, backend) = match self {
            Self::RemoteLnd {
                name,
                uri,
                cert,
                macaroon,
            } => (name, NodeBackend::Remote { uri, cert, macaroon }),
            Self::Local { name } => (name, NodeBackend::Local),
        };
        NodeRecord {
            id,
            name,
            enabled: false,
            backend,
        }
    }
}

pub(crate) fn validate_node_name(name: &str) -> Result<(), Error> {
    if name.trim().is_empty() || name.len() > 64 {
        return Err(Error::Invalid("node name must be 1-64 bytes".into()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeBackend {
    Remote {
        uri: String,
        cert: String,
        macaroon: String,
    },
    Local,
}

/// A persisted payment node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub backend: NodeBackend,
}
