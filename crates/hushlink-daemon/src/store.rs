//! On-disk node state: identity, DH parameters, peer table.
//!
//! Three JSON files in the data directory:
//!
//! - `identity.json` — who we are; required, never written implicitly.
//! - `dh_state.json` — the group plus its creation time; regenerated
//!   when missing, unreadable or older than the rotation window.
//! - `peers.json` — IP → login/address; best-effort, an unreadable
//!   file just means an empty table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use hushlink_crypto::dh::DhParams;
use hushlink_node::peers::PeerStore;
use hushlink_types::config::{IdentityConfig, DH_ROTATION_HOURS};
use hushlink_types::{HushlinkError, PeerInfo, Result};

/// Identity file name inside the data directory.
pub const IDENTITY_FILE: &str = "identity.json";

/// DH state file name inside the data directory.
pub const DH_STATE_FILE: &str = "dh_state.json";

/// Peer table file name inside the data directory.
pub const PEERS_FILE: &str = "peers.json";

/// Attempts at group generation before the daemon gives up. Each
/// search phase is capped per the protocol, so a single run can
/// legitimately exhaust its candidate budget.
const GENERATE_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// DhStateFile
// ---------------------------------------------------------------------------

/// Persisted form of the node's DH parameters.
#[derive(Serialize, Deserialize)]
pub struct DhStateFile {
    /// The group itself (big integers as decimal strings).
    pub params: DhParams,
    /// When the group was generated; drives rotation.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// JSON-file persistence rooted in one data directory.
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `data_dir`. The directory must
    /// already exist.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    /// Loads the identity file. `Ok(None)` when the file does not
    /// exist; a present-but-unreadable file is a hard error so a typo
    /// cannot silently rename the operator.
    pub fn load_identity(&self) -> Result<Option<IdentityConfig>> {
        let path = self.path(IDENTITY_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read(&path)?;
        let identity = serde_json::from_slice(&raw).map_err(|e| HushlinkError::Config {
            reason: format!("{} is unreadable: {e}", path.display()),
        })?;
        Ok(Some(identity))
    }

    /// Writes the identity file.
    pub fn save_identity(&self, identity: &IdentityConfig) -> Result<()> {
        let raw = serde_json::to_vec_pretty(identity).map_err(|e| HushlinkError::Config {
            reason: format!("identity serialization failed: {e}"),
        })?;
        std::fs::write(self.path(IDENTITY_FILE), raw)?;
        Ok(())
    }

    /// Loads the DH parameters, regenerating and rewriting the file
    /// when it is missing, unreadable, or older than
    /// [`DH_ROTATION_HOURS`].
    pub fn load_or_rotate_dh(&self) -> Result<DhParams> {
        self.load_or_rotate_dh_with(generate_with_retries)
    }

    /// Same as [`Self::load_or_rotate_dh`], with the generator
    /// injected. Full-size generation takes tens of seconds, so tests
    /// substitute a fixture.
    pub fn load_or_rotate_dh_with(
        &self,
        generate: impl FnOnce() -> Result<DhParams>,
    ) -> Result<DhParams> {
        let path = self.path(DH_STATE_FILE);

        if let Some(state) = self.read_dh_state(&path) {
            let age = Utc::now() - state.created_at;
            if age < Duration::hours(DH_ROTATION_HOURS) {
                tracing::info!(
                    created_at = %state.created_at,
                    "loaded diffie-hellman parameters"
                );
                return Ok(state.params);
            }
            tracing::info!(
                created_at = %state.created_at,
                "diffie-hellman parameters expired; regenerating"
            );
        } else {
            tracing::info!("no usable diffie-hellman state; generating");
        }

        let params = generate()?;
        let state = DhStateFile {
            params,
            created_at: Utc::now(),
        };
        let raw = serde_json::to_vec_pretty(&state).map_err(|e| HushlinkError::Config {
            reason: format!("dh state serialization failed: {e}"),
        })?;
        std::fs::write(&path, raw)?;
        Ok(state.params)
    }

    fn read_dh_state(&self, path: &Path) -> Option<DhStateFile> {
        let raw = std::fs::read(path).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "dh state unreadable");
                None
            }
        }
    }

    /// Loads the peer table; an absent or unreadable file is an empty
    /// table.
    pub fn load_peers(&self) -> HashMap<String, PeerInfo> {
        let path = self.path(PEERS_FILE);
        let Ok(raw) = std::fs::read(&path) else {
            return HashMap::new();
        };
        match serde_json::from_slice(&raw) {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "peers file unreadable; starting empty");
                HashMap::new()
            }
        }
    }

    /// Writes the peer table. Failures are logged; a broken disk must
    /// not take the node down.
    pub fn save_peers(&self, peers: &HashMap<String, PeerInfo>) {
        let raw = match serde_json::to_vec_pretty(peers) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "peer table serialization failed");
                return;
            }
        };
        if let Err(e) = std::fs::write(self.path(PEERS_FILE), raw) {
            tracing::warn!(error = %e, "peer table write failed");
        }
    }
}

impl PeerStore for FileStore {
    fn persist(&self, peers: &HashMap<String, PeerInfo>) {
        self.save_peers(peers);
    }
}

/// Runs the group search, retrying on candidate-budget exhaustion.
fn generate_with_retries() -> Result<DhParams> {
    for attempt in 1..GENERATE_ATTEMPTS {
        match DhParams::generate() {
            Ok(params) => return Ok(params),
            Err(e @ HushlinkError::ParamGenFailed { .. }) => {
                tracing::warn!(attempt, error = %e, "group search exhausted; retrying");
            }
            Err(e) => return Err(e),
        }
    }
    DhParams::generate()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
