//! Node lifecycle: listener, session distribution, teardown.
//!
//! The [`Node`] owns the TCP listener and the [`NodeShared`] state
//! every session task reaches through an `Arc`. Each accepted
//! connection is classified by remote address — loopback connections
//! are manager sessions, everything else is a peer — and served on
//! its own task, so one misbehaving counterparty never stalls or
//! corrupts another session.
//!
//! # Session lifecycle
//!
//! ```text
//! accept ──▶ reuse crypto? ──no──▶ offer handshake ──▶ derive keys
//!                │ yes                                      │
//!                ▼                                          ▼
//!            attach session ◀───────────────────────────────┘
//!                │
//!                ▼
//!        greet (INFO, LIST) ──▶ command loop ──▶ cleanup by error class
//! ```
//!
//! Dialing (driven by the manager's `CONN`) is the mirror image with
//! the answer role and initiator keys.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use hushlink_crypto::dh::DhParams;
use hushlink_crypto::session::{SessionCrypto, SessionRole};
use hushlink_proto::channel::{crypto_cell, PeerChannel, PlainChannel, RecordChannel};
use hushlink_proto::command::{self, command_loop, CommandTable, LoopEnd, Opcode};
use hushlink_proto::framing::FramedStream;
use hushlink_proto::handshake;
use hushlink_types::config::IdentityConfig;
use hushlink_types::{ErrorClass, HushlinkError, PeerInfo, Profile, Result};

use crate::manager::{self, ManagerCtx};
use crate::peer_handlers;
use crate::peers::{PeerStore, PeerTable, PeerWriterHandle};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Bounded UI message channel capacity.
///
/// Messages from peer handlers to the manager. A blocked manager
/// back-pressures the peer sessions that are posting, which is
/// acceptable: the operator asked for the messages.
pub const UI_CHANNEL_SIZE: usize = 256;

// ---------------------------------------------------------------------------
// Table and context types
// ---------------------------------------------------------------------------

/// Command table driving peer sessions.
pub type PeerCommandTable = CommandTable<PeerCtx, PeerChannel<TcpStream>>;

/// Command table driving manager sessions.
pub type ManagerCommandTable = CommandTable<ManagerCtx, PlainChannel<TcpStream>>;

/// Per-session context handed to peer command handlers.
pub struct PeerCtx {
    /// Shared node state.
    pub shared: Arc<NodeShared>,
    /// IP of the peer this session belongs to; the key into the peer
    /// table.
    pub peer_ip: String,
}

// ---------------------------------------------------------------------------
// NodeShared
// ---------------------------------------------------------------------------

/// State shared by every task of a running node.
pub struct NodeShared {
    /// Our own wire-visible identity.
    pub profile: Profile,
    /// DH parameters offered to every peer we accept. Immutable for
    /// the process lifetime; rotation happens across restarts.
    pub params: DhParams,
    /// The peer table.
    pub peers: PeerTable,
    /// Persistence hook for the peer table.
    pub store: Arc<dyn PeerStore>,
    /// Directory incoming files are written under.
    pub download_dir: PathBuf,
    /// Producer side of the UI message channel.
    pub ui_tx: mpsc::Sender<String>,
    /// Consumer side of the UI message channel, drained by whichever
    /// manager session is currently attached.
    pub ui_rx: AsyncMutex<mpsc::Receiver<String>>,
    /// Shutdown signal; any sender shuts the node down.
    pub shutdown: watch::Sender<bool>,
    /// The peer command table, built once at startup.
    pub peer_commands: PeerCommandTable,
}

impl NodeShared {
    /// Builds the shared state for a node.
    pub fn new(
        profile: Profile,
        params: DhParams,
        initial_peers: HashMap<String, PeerInfo>,
        store: Arc<dyn PeerStore>,
        download_dir: PathBuf,
    ) -> Arc<Self> {
        let (ui_tx, ui_rx) = mpsc::channel(UI_CHANNEL_SIZE);
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            profile,
            params,
            peers: PeerTable::from_snapshot(initial_peers),
            store,
            download_dir,
            ui_tx,
            ui_rx: AsyncMutex::new(ui_rx),
            shutdown,
            peer_commands: peer_handlers::table(),
        })
    }

    /// A fresh receiver on the shutdown signal.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A bound, not-yet-running node.
pub struct Node {
    shared: Arc<NodeShared>,
    listener: TcpListener,
    manager_commands: Arc<ManagerCommandTable>,
}

impl Node {
    /// Binds the listener and assembles the shared state.
    ///
    /// `initial_peers` is the persisted table (empty on first run);
    /// `store` receives snapshots on discovery growth and shutdown.
    pub async fn bind(
        identity: &IdentityConfig,
        params: DhParams,
        initial_peers: HashMap<String, PeerInfo>,
        store: Arc<dyn PeerStore>,
        download_dir: PathBuf,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", identity.port))
            .await
            .map_err(|e| HushlinkError::Config {
                reason: format!("failed to bind tcp port {}: {e}", identity.port),
            })?;

        let profile = Profile {
            login: identity.login.clone(),
            address: identity.announce_address(),
        };
        let shared = NodeShared::new(profile, params, initial_peers, store, download_dir);

        Ok(Self {
            shared,
            listener,
            manager_commands: Arc::new(manager::table()),
        })
    }

    /// Shared state handle, for discovery tasks and tests.
    pub fn shared(&self) -> Arc<NodeShared> {
        Arc::clone(&self.shared)
    }

    /// The address the listener actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts and distributes connections until shutdown is
    /// signalled, then tears every session down and persists the peer
    /// table.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shared.subscribe_shutdown();
        tracing::info!(
            address = %self.local_addr()?,
            login = %self.shared.profile.login,
            "node listening"
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let shared = Arc::clone(&self.shared);
                            let manager_commands = Arc::clone(&self.manager_commands);
                            tokio::spawn(async move {
                                distribute(shared, manager_commands, stream, remote).await;
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("shutdown signalled; tearing down sessions");
        self.teardown().await
    }

    /// Sends `DISC` to every live session, closes it, clears its
    /// crypto and persists the table.
    async fn teardown(&self) -> Result<()> {
        for (ip, link) in self.shared.peers.live_links()? {
            let mut writer = link.lock().await;
            if let Err(e) = writer
                .write_package(&command::encode(Opcode::DISC, b""))
                .await
            {
                tracing::debug!(peer = %ip, error = %e, "disconnect notice failed");
            }
            let _ = writer.shutdown().await;
            drop(writer);

            self.shared.peers.clear_link(&ip)?;
            self.shared.peers.clear_crypto(&ip)?;
        }

        let snapshot = self.shared.peers.snapshot()?;
        self.shared.store.persist(&snapshot);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session distribution
// ---------------------------------------------------------------------------

/// Routes an accepted connection to the manager or peer path.
pub async fn distribute(
    shared: Arc<NodeShared>,
    manager_commands: Arc<ManagerCommandTable>,
    stream: TcpStream,
    remote: SocketAddr,
) {
    if remote.ip().is_loopback() {
        tracing::info!(%remote, "manager connected");
        manager::run_manager_session(shared, manager_commands, stream).await;
    } else {
        let ip = remote.ip().to_string();
        tracing::info!(%remote, "peer connected");
        if let Err(e) = accept_peer(shared, stream, ip.clone(), remote.to_string()).await {
            tracing::warn!(peer = %ip, error = %e, "peer session failed");
        }
    }
}

/// Serves an inbound peer connection to completion.
///
/// Reuses the record's live crypto when present; otherwise runs the
/// offer handshake with our own parameters and derives responder
/// keys. A handshake failure drops the connection without creating a
/// peer record.
pub async fn accept_peer(
    shared: Arc<NodeShared>,
    stream: TcpStream,
    ip: String,
    connection_address: String,
) -> Result<()> {
    let (stream, crypto) = match shared.peers.crypto_of(&ip)? {
        Some(cell) => {
            tracing::debug!(peer = %ip, "reusing session crypto");
            (stream, cell)
        }
        None => {
            let mut framed = FramedStream::new(stream);
            let secret = handshake::offer(&mut framed, &shared.params).await?;
            let crypto = crypto_cell(SessionCrypto::derive(
                secret.as_bytes(),
                SessionRole::Responder,
            ));
            (framed.into_inner(), crypto)
        }
    };

    let mut channel = PeerChannel::new(stream, Arc::clone(&crypto));
    shared
        .peers
        .attach_session(&ip, &connection_address, crypto, channel.writer())?;

    if let Err(e) = greet(&mut channel).await {
        let _ = shared.peers.clear_link(&ip);
        return Err(e);
    }
    run_peer_loop(shared, channel, ip).await;
    Ok(())
}

/// Dials a peer, establishes a session and spawns its command loop.
///
/// The mirror of [`accept_peer`]: the answer handshake role and
/// initiator keys. Returns the peer's IP and the session write
/// handle, which the manager keeps as its "current peer".
pub async fn dial_peer(
    shared: Arc<NodeShared>,
    target: &str,
) -> Result<(String, PeerWriterHandle)> {
    let stream = TcpStream::connect(target)
        .await
        .map_err(|e| HushlinkError::Peer {
            reason: format!("dialing {target} failed: {e}"),
        })?;
    let remote = stream.peer_addr()?;
    let ip = remote.ip().to_string();

    let (stream, crypto) = match shared.peers.crypto_of(&ip)? {
        Some(cell) => {
            tracing::debug!(peer = %ip, "reusing session crypto");
            (stream, cell)
        }
        None => {
            let mut framed = FramedStream::new(stream);
            let (_group, secret) = handshake::answer(&mut framed).await?;
            let crypto = crypto_cell(SessionCrypto::derive(
                secret.as_bytes(),
                SessionRole::Initiator,
            ));
            (framed.into_inner(), crypto)
        }
    };

    let mut channel = PeerChannel::new(stream, Arc::clone(&crypto));
    let writer = channel.writer();
    shared
        .peers
        .attach_session(&ip, &remote.to_string(), crypto, writer.clone())?;

    if let Err(e) = greet(&mut channel).await {
        let _ = shared.peers.clear_link(&ip);
        return Err(e);
    }

    let loop_shared = Arc::clone(&shared);
    let loop_ip = ip.clone();
    tokio::spawn(async move {
        run_peer_loop(loop_shared, channel, loop_ip).await;
    });

    Ok((ip, writer))
}

/// Opens a fresh session by asking the counterparty who it is and who
/// it knows.
async fn greet(channel: &mut PeerChannel<TcpStream>) -> Result<()> {
    channel.send(&command::encode(Opcode::INFO, b"")).await?;
    channel.send(&command::encode(Opcode::LIST, b"")).await?;
    Ok(())
}

/// Runs the peer command loop and applies the cleanup policy for
/// whatever ended it.
async fn run_peer_loop(shared: Arc<NodeShared>, mut channel: PeerChannel<TcpStream>, ip: String) {
    let mut ctx = PeerCtx {
        shared: Arc::clone(&shared),
        peer_ip: ip.clone(),
    };

    let end = command_loop(&mut channel, &shared.peer_commands, &mut ctx).await;
    match end {
        LoopEnd::Stopped => {
            tracing::info!(peer = %ip, "peer session closed");
        }
        LoopEnd::Failed(e) if e.class() == ErrorClass::Crypto => {
            tracing::warn!(peer = %ip, error = %e, "session crypto failure; clearing keys");
            if let Err(table_err) = shared.peers.clear_crypto(&ip) {
                tracing::warn!(peer = %ip, error = %table_err, "crypto cleanup failed");
            }
        }
        LoopEnd::Failed(e) => {
            tracing::info!(peer = %ip, error = %e, "peer session ended");
        }
    }

    if let Err(e) = shared.peers.clear_link(&ip) {
        tracing::warn!(peer = %ip, error = %e, "link cleanup failed");
    }
}
