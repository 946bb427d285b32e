//! hushlink daemon -- headless peer-to-peer messaging node.
//!
//! Usage:
//!
//!   hushlink-daemon [OPTIONS]
//!
//! Options:
//!
//!   --data-dir <PATH>       State directory (default: current dir)
//!   --multicast <ADDR:PORT> Beacon multicast group override
//!   --no-beacon             Disable multicast discovery
//!   --login <NAME>          First-run identity bootstrap
//!   --interface <IP>        First-run identity bootstrap
//!   --port <PORT>           First-run identity bootstrap
//!
//! On first run, pass `--login`, `--interface` and `--port` to create
//! `identity.json`; afterwards the daemon reads everything from the
//! data directory. Runs until interrupted (Ctrl+C) or until a manager
//! sends `QUIT`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use hushlink_node::discovery;
use hushlink_node::node::Node;
use hushlink_types::config::{IdentityConfig, DEFAULT_MULTICAST_GROUP};
use hushlink_types::{HushlinkError, Result};

mod cli;
mod store;

use store::FileStore;

#[tokio::main]
async fn main() {
    // Tracing / logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = cli::CliArgs::parse_from_env();

    if let Err(e) = run(cli).await {
        tracing::error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: cli::CliArgs) -> Result<()> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&data_dir)?;
    let store = Arc::new(FileStore::new(&data_dir));

    // -----------------------------------------------------------------------
    // 1. Identity
    // -----------------------------------------------------------------------

    let identity = load_identity(&store, &cli)?;
    identity.validate()?;
    tracing::info!(login = %identity.login, address = %identity.announce_address(), "identity loaded");

    // -----------------------------------------------------------------------
    // 2. Diffie-Hellman parameters (rotated when stale)
    // -----------------------------------------------------------------------

    let params = store.load_or_rotate_dh()?;

    // -----------------------------------------------------------------------
    // 3. Peer table and node
    // -----------------------------------------------------------------------

    let peers = store.load_peers();
    tracing::info!(known_peers = peers.len(), "peer table loaded");

    let node = Node::bind(
        &identity,
        params,
        peers,
        Arc::clone(&store) as Arc<dyn hushlink_node::peers::PeerStore>,
        data_dir,
    )
    .await?;
    let shared = node.shared();

    // -----------------------------------------------------------------------
    // 4. Discovery beacon
    // -----------------------------------------------------------------------

    if cli.no_beacon {
        tracing::info!("multicast discovery disabled");
    } else {
        let group: SocketAddr = cli
            .multicast
            .as_deref()
            .unwrap_or(DEFAULT_MULTICAST_GROUP)
            .parse()
            .map_err(|e| HushlinkError::Config {
                reason: format!("invalid multicast group: {e}"),
            })?;

        let announce_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            if let Err(e) = discovery::announce(announce_shared, group).await {
                tracing::warn!(error = %e, "beacon announcer failed");
            }
        });

        let listen_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            if let Err(e) = discovery::listen(listen_shared, group).await {
                tracing::warn!(error = %e, "beacon listener failed");
            }
        });
    }

    // -----------------------------------------------------------------------
    // 5. Supervisor: Ctrl+C funnels into the shutdown signal
    // -----------------------------------------------------------------------

    let signal_shared = Arc::clone(&shared);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; shutting down");
            let _ = signal_shared.shutdown.send(true);
        }
    });

    node.run().await
}

/// Loads the identity file, bootstrapping it from CLI flags on first
/// run.
fn load_identity(store: &FileStore, cli: &cli::CliArgs) -> Result<IdentityConfig> {
    if let Some(identity) = store.load_identity()? {
        return Ok(identity);
    }

    let (Some(login), Some(interface), Some(port)) =
        (cli.login.clone(), cli.interface.clone(), cli.port)
    else {
        return Err(HushlinkError::Config {
            reason: format!(
                "{} not found; pass --login, --interface and --port to create it",
                store::IDENTITY_FILE
            ),
        });
    };

    let identity = IdentityConfig {
        login,
        interface,
        port,
    };
    identity.validate()?;
    store.save_identity(&identity)?;
    tracing::info!(login = %identity.login, "identity created");
    Ok(identity)
}
