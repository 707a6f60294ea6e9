//! Core types shared across the custody engine

use std::path::PathBuf;
use std::str::FromStr;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

/// Stable identifier of a node on the board.
pub type NodeId = String;

/// Identifier of a DKG ceremony.
pub type RoundId = String;

/// Identifier of a signing request (`tx_` + 8 hex by convention).
pub type RequestId = String;

/// Secret-module operation mode, fixed at node creation.
///
/// `Production` stores every generic secret as sensitive and non-extractable
/// and refuses any API that would return a secret's plaintext. `Demo` permits
/// value readback for debugging and the test suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationMode {
    #[default]
    Production,
    Demo,
}

impl OperationMode {
    /// Whether generic-secret objects are created extractable.
    pub fn extractable(self) -> bool {
        matches!(self, OperationMode::Demo)
    }
}

impl FromStr for OperationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "production" => Ok(OperationMode::Production),
            "demo" => Ok(OperationMode::Demo),
            other => Err(Error::Config(format!(
                "unknown operation mode {other:?} (expected \"production\" or \"demo\")"
            ))),
        }
    }
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationMode::Production => write!(f, "production"),
            OperationMode::Demo => write!(f, "demo"),
        }
    }
}

/// Secret-module PIN.
///
/// Never printed: the `Debug` impl is redacted and the buffer is wiped on
/// drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ModulePin(String);

impl ModulePin {
    /// Minimum accepted PIN length.
    pub const MIN_LEN: usize = 8;

    pub fn new(pin: impl Into<String>) -> Result<Self> {
        let pin = pin.into();
        if pin.len() < Self::MIN_LEN {
            return Err(Error::Config(format!(
                "module PIN must be at least {} characters",
                Self::MIN_LEN
            )));
        }
        Ok(Self(pin))
    }

    pub(crate) fn reveal(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ModulePin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ModulePin(<redacted>)")
    }
}

/// Per-node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identity of this node on the board.
    pub node_id: NodeId,
    /// Location of the durable state file.
    pub data_dir: PathBuf,
    /// Extractability policy for the secret module.
    pub mode: OperationMode,
    /// Secret-module authentication.
    pub pin: ModulePin,
}

impl NodeConfig {
    pub fn new(
        node_id: impl Into<NodeId>,
        data_dir: impl Into<PathBuf>,
        mode: OperationMode,
        pin: ModulePin,
    ) -> Result<Self> {
        let node_id = node_id.into();
        if node_id.is_empty() || !node_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(Error::Config(format!(
                "node id must be non-empty alphanumeric, got {node_id:?}"
            )));
        }
        Ok(Self {
            node_id,
            data_dir: data_dir.into(),
            mode,
            pin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_and_displays() {
        assert_eq!("production".parse::<OperationMode>().unwrap(), OperationMode::Production);
        assert_eq!("demo".parse::<OperationMode>().unwrap(), OperationMode::Demo);
        assert!("prod".parse::<OperationMode>().is_err());
        assert_eq!(OperationMode::Demo.to_string(), "demo");
    }

    #[test]
    fn short_pin_rejected() {
        assert!(ModulePin::new("1234").is_err());
        assert!(ModulePin::new("12345678").is_ok());
    }

    #[test]
    fn pin_debug_is_redacted() {
        let pin = ModulePin::new("super-secret-pin").unwrap();
        assert_eq!(format!("{pin:?}"), "ModulePin(<redacted>)");
    }

    #[test]
    fn node_id_validation() {
        let pin = ModulePin::new("12345678").unwrap();
        assert!(NodeConfig::new("node1", "/tmp", OperationMode::Demo, pin.clone()).is_ok());
        assert!(NodeConfig::new("bad id", "/tmp", OperationMode::Demo, pin.clone()).is_err());
        assert!(NodeConfig::new("", "/tmp", OperationMode::Demo, pin).is_err());
    }
}
