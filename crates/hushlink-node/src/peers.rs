//! The process-wide peer table.
//!
//! Keyed by peer IP. A record outlives any particular session: the
//! login and address learned from gossip or a beacon stay put while
//! connections come and go, and the session crypto — when present —
//! survives a dropped connection so a reconnecting peer can skip the
//! handshake (its record counters simply continue).
//!
//! # Locking discipline
//!
//! A single `std::sync::Mutex` guards the map. Every public method
//! locks, works, and returns — the guard never crosses an await
//! point. Callers that need live write handles take clones out of the
//! table and lock those on their own time.
//!
//! # Ownership
//!
//! Records hold no handles to session *tasks*; they hold the shared
//! crypto cell and the shared writer, both cheap `Arc` clones. A
//! session finds its record through the table by IP, never the other
//! way around.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::net::TcpStream;

use hushlink_proto::channel::{CryptoCell, SecureWriterHandle};
use hushlink_types::{HushlinkError, PeerInfo, Result};

/// Write handle of a live peer session over TCP.
pub type PeerWriterHandle = SecureWriterHandle<TcpStream>;

// ---------------------------------------------------------------------------
// PeerStore
// ---------------------------------------------------------------------------

/// Persistence hook for the peer table.
///
/// The node calls this on shutdown and whenever discovery or gossip
/// grows the table. Implementations log their own failures; a broken
/// disk must not take sessions down.
pub trait PeerStore: Send + Sync {
    /// Persists a snapshot of the table.
    fn persist(&self, peers: &HashMap<String, PeerInfo>);
}

/// A [`PeerStore`] that keeps nothing. Used by tests and by nodes
/// running without a data directory.
pub struct EphemeralStore;

impl PeerStore for EphemeralStore {
    fn persist(&self, _peers: &HashMap<String, PeerInfo>) {}
}

// ---------------------------------------------------------------------------
// PeerRecord
// ---------------------------------------------------------------------------

/// One entry in the peer table.
pub struct PeerRecord {
    /// Wire-visible identity: login and announced address.
    pub info: PeerInfo,
    /// Session crypto, present while keys for this peer are live.
    pub crypto: Option<CryptoCell>,
    /// Write handle of the current connection, if one exists.
    pub link: Option<PeerWriterHandle>,
}

impl PeerRecord {
    fn known(info: PeerInfo) -> Self {
        Self {
            info,
            crypto: None,
            link: None,
        }
    }
}

// ---------------------------------------------------------------------------
// PeerTable
// ---------------------------------------------------------------------------

/// Shared map of everything this node knows about other peers.
pub struct PeerTable {
    inner: Mutex<HashMap<String, PeerRecord>>,
}

impl PeerTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds a table from a persisted snapshot.
    pub fn from_snapshot(snapshot: HashMap<String, PeerInfo>) -> Self {
        let records = snapshot
            .into_iter()
            .map(|(ip, info)| (ip, PeerRecord::known(info)))
            .collect();
        Self {
            inner: Mutex::new(records),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, PeerRecord>>> {
        self.inner.lock().map_err(|_| HushlinkError::Peer {
            reason: "peer table mutex poisoned".into(),
        })
    }

    /// Copies out the wire-visible view: IP → login/address. The form
    /// gossiped in `RELI` bodies and written to disk.
    pub fn snapshot(&self) -> Result<HashMap<String, PeerInfo>> {
        let guard = self.lock()?;
        Ok(guard
            .iter()
            .map(|(ip, record)| (ip.clone(), record.info.clone()))
            .collect())
    }

    /// Merges gossiped peers into the table. Only unknown IPs are
    /// inserted; existing entries keep their values. Returns how many
    /// new records were created.
    pub fn merge(&self, incoming: HashMap<String, PeerInfo>) -> Result<usize> {
        let mut guard = self.lock()?;
        let mut added = 0;
        for (ip, info) in incoming {
            guard.entry(ip).or_insert_with(|| {
                added += 1;
                PeerRecord::known(info)
            });
        }
        Ok(added)
    }

    /// Inserts a single discovered peer if its IP is unknown. Returns
    /// `true` when the table grew.
    pub fn insert_if_unknown(&self, ip: &str, info: PeerInfo) -> Result<bool> {
        let mut guard = self.lock()?;
        if guard.contains_key(ip) {
            return Ok(false);
        }
        guard.insert(ip.to_string(), PeerRecord::known(info));
        Ok(true)
    }

    /// Live crypto for `ip`, if a previous session left keys behind.
    pub fn crypto_of(&self, ip: &str) -> Result<Option<CryptoCell>> {
        let guard = self.lock()?;
        Ok(guard.get(ip).and_then(|record| record.crypto.clone()))
    }

    /// The login `ip` last announced, if any.
    pub fn login_of(&self, ip: &str) -> Result<Option<String>> {
        let guard = self.lock()?;
        Ok(guard
            .get(ip)
            .map(|record| record.info.login.clone())
            .filter(|login| !login.is_empty()))
    }

    /// Attaches a fresh session to `ip`, creating the record if
    /// needed. A new record starts with the connection's address; an
    /// existing record keeps whatever identity it already learned.
    pub fn attach_session(
        &self,
        ip: &str,
        connection_address: &str,
        crypto: CryptoCell,
        link: PeerWriterHandle,
    ) -> Result<()> {
        let mut guard = self.lock()?;
        let record = guard
            .entry(ip.to_string())
            .or_insert_with(|| {
                PeerRecord::known(PeerInfo {
                    login: String::new(),
                    address: connection_address.to_string(),
                })
            });
        record.crypto = Some(crypto);
        record.link = Some(link);
        Ok(())
    }

    /// Overwrites the identity fields of `ip` with a self-announced
    /// profile (`REFO`).
    pub fn update_identity(&self, ip: &str, login: String, address: String) -> Result<()> {
        let mut guard = self.lock()?;
        let record = guard
            .entry(ip.to_string())
            .or_insert_with(|| PeerRecord::known(PeerInfo::default()));
        record.info.login = login;
        record.info.address = address;
        Ok(())
    }

    /// Drops the connection handle of `ip`. The crypto stays.
    pub fn clear_link(&self, ip: &str) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(record) = guard.get_mut(ip) {
            record.link = None;
        }
        Ok(())
    }

    /// Drops the session crypto of `ip`. The record itself survives
    /// for a future re-handshake.
    pub fn clear_crypto(&self, ip: &str) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(record) = guard.get_mut(ip) {
            record.crypto = None;
        }
        Ok(())
    }

    /// Clones out every live write handle, for shutdown teardown.
    pub fn live_links(&self) -> Result<Vec<(String, PeerWriterHandle)>> {
        let guard = self.lock()?;
        Ok(guard
            .iter()
            .filter_map(|(ip, record)| {
                record
                    .link
                    .as_ref()
                    .map(|link| (ip.clone(), link.clone()))
            })
            .collect())
    }

    /// Number of known peers.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn info(login: &str, address: &str) -> PeerInfo {
        PeerInfo {
            login: login.into(),
            address: address.into(),
        }
    }

    #[test]
    fn merge_keeps_existing_entries() -> Result<()> {
        let table = PeerTable::from_snapshot(HashMap::from([
            ("1.1.1.1".to_string(), info("ann", "1.1.1.1:4242")),
            ("2.2.2.2".to_string(), info("ben", "2.2.2.2:4242")),
        ]));

        let added = table.merge(HashMap::from([
            ("2.2.2.2".to_string(), info("impostor", "6.6.6.6:4242")),
            ("3.3.3.3".to_string(), info("cal", "3.3.3.3:4242")),
        ]))?;

        assert_eq!(added, 1);
        let snapshot = table.snapshot()?;
        assert_eq!(snapshot.len(), 3);
        // 2.2.2.2 is unchanged: merge never overwrites.
        assert_eq!(snapshot["2.2.2.2"], info("ben", "2.2.2.2:4242"));
        assert_eq!(snapshot["3.3.3.3"], info("cal", "3.3.3.3:4242"));
        Ok(())
    }

    #[test]
    fn insert_if_unknown_reports_growth() -> Result<()> {
        let table = PeerTable::new();
        assert!(table.insert_if_unknown("5.5.5.5", info("dee", "5.5.5.5:1"))?);
        assert!(!table.insert_if_unknown("5.5.5.5", info("dee", "5.5.5.5:1"))?);
        assert_eq!(table.len()?, 1);
        Ok(())
    }

    #[test]
    fn refo_overwrites_identity() -> Result<()> {
        let table = PeerTable::from_snapshot(HashMap::from([(
            "4.4.4.4".to_string(),
            info("old-name", "4.4.4.4:1111"),
        )]));

        table.update_identity("4.4.4.4", "new-name".into(), "4.4.4.4:2222".into())?;
        assert_eq!(
            table.snapshot()?["4.4.4.4"],
            info("new-name", "4.4.4.4:2222")
        );
        Ok(())
    }

    #[test]
    fn login_of_ignores_empty_logins() -> Result<()> {
        let table = PeerTable::new();
        table.update_identity("7.7.7.7", String::new(), "7.7.7.7:1".into())?;
        assert_eq!(table.login_of("7.7.7.7")?, None);

        table.update_identity("7.7.7.7", "gil".into(), "7.7.7.7:1".into())?;
        assert_eq!(table.login_of("7.7.7.7")?.as_deref(), Some("gil"));
        Ok(())
    }

    #[test]
    fn snapshot_of_empty_table_is_empty() -> Result<()> {
        let table = PeerTable::new();
        assert!(table.is_empty()?);
        assert!(table.snapshot()?.is_empty());
        Ok(())
    }
}
