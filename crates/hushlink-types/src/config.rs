//! Node configuration types with validation.
//!
//! The identity file is the only configuration the core cannot invent
//! defaults for: a node without a login and port is not addressable.

use serde::{Deserialize, Serialize};

use crate::{HushlinkError, Result};

/// Default multicast group the discovery beacon speaks on.
pub const DEFAULT_MULTICAST_GROUP: &str = "239.255.71.43:42424";

/// Seconds between two beacon announcements.
pub const BEACON_INTERVAL_SECS: u64 = 5;

/// Hours a DH parameter set stays valid before regeneration.
pub const DH_ROTATION_HOURS: i64 = 1860;

// ---------------------------------------------------------------------------
// IdentityConfig
// ---------------------------------------------------------------------------

/// Operator identity loaded from `identity.json`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Display name announced to peers.
    pub login: String,
    /// Local interface address to announce, e.g. `192.168.1.17`.
    pub interface: String,
    /// TCP port the node listens on.
    pub port: u16,
}

impl IdentityConfig {
    /// Validates all fields.
    pub fn validate(&self) -> Result<()> {
        if self.login.is_empty() {
            return Err(HushlinkError::Config {
                reason: "login must not be empty".into(),
            });
        }

        if self.login.contains(':') {
            return Err(HushlinkError::Config {
                reason: "login must not contain ':'".into(),
            });
        }

        if self.interface.is_empty() {
            return Err(HushlinkError::Config {
                reason: "interface address must not be empty".into(),
            });
        }

        if self.port == 0 {
            return Err(HushlinkError::Config {
                reason: "port must be non-zero".into(),
            });
        }

        Ok(())
    }

    /// The `ip:port` endpoint this identity announces.
    pub fn announce_address(&self) -> String {
        format!("{}:{}", self.interface, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> IdentityConfig {
        IdentityConfig {
            login: "alice".into(),
            interface: "192.168.1.17".into(),
            port: 4242,
        }
    }

    #[test]
    fn valid_identity_passes() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn empty_login_rejected() {
        let cfg = IdentityConfig {
            login: String::new(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn colon_in_login_rejected() {
        let cfg = IdentityConfig {
            login: "a:b".into(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_port_rejected() {
        let cfg = IdentityConfig { port: 0, ..valid() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn announce_address_joins_interface_and_port() {
        assert_eq!(valid().announce_address(), "192.168.1.17:4242");
    }
}
