//! Multicast beacon: announce ourselves, learn who else is out there.
//!
//! Every few seconds the node multicasts its profile as one framed
//! datagram; a listener task on the same group inserts unknown
//! senders into the peer table and persists the snapshot. Discovery
//! is best-effort by design — a dropped beacon just means a peer is
//! learned a few seconds later, so failures here are logged, never
//! escalated.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use hushlink_proto::framing;
use hushlink_proto::wire;
use hushlink_types::config::BEACON_INTERVAL_SECS;
use hushlink_types::{HushlinkError, PeerInfo, Profile, Result};

use crate::node::NodeShared;

/// Sends the local profile to the multicast group on a fixed cadence
/// until shutdown.
pub async fn announce(shared: Arc<NodeShared>, group: SocketAddr) -> Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    let payload = wire::to_cbor(&shared.profile)?;
    let datagram = framing::encode_datagram(&payload)?;

    let mut shutdown_rx = shared.subscribe_shutdown();
    let mut tick = tokio::time::interval(Duration::from_secs(BEACON_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = socket.send_to(&datagram, group).await {
                    tracing::debug!(error = %e, "beacon send failed");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("beacon announcer stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Joins the multicast group and inserts unknown beacon senders into
/// the peer table until shutdown.
pub async fn listen(shared: Arc<NodeShared>, group: SocketAddr) -> Result<()> {
    let IpAddr::V4(group_ip) = group.ip() else {
        return Err(HushlinkError::Config {
            reason: format!("multicast group {group} is not IPv4"),
        });
    };

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, group.port())).await?;
    socket.join_multicast_v4(group_ip, Ipv4Addr::UNSPECIFIED)?;
    tracing::info!(%group, "listening for beacons");

    let mut shutdown_rx = shared.subscribe_shutdown();
    let mut buf = vec![0u8; framing::LEN_PREFIX + framing::MAX_RECORD];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, from)) => {
                        if let Err(e) = handle_beacon(&shared, &buf[..n]) {
                            tracing::debug!(%from, error = %e, "ignoring malformed beacon");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "beacon receive failed"),
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("beacon listener stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Decodes one beacon datagram and inserts the sender if unknown.
fn handle_beacon(shared: &NodeShared, datagram: &[u8]) -> Result<()> {
    let payload = framing::decode_datagram(datagram)?;
    let profile: Profile = wire::from_cbor(payload)?;

    let Some((ip, info)) = beacon_peer(&profile, &shared.profile.address) else {
        return Ok(());
    };

    if shared.peers.insert_if_unknown(&ip, info)? {
        tracing::info!(peer = %ip, login = %profile.login, "discovered peer via beacon");
        shared.store.persist(&shared.peers.snapshot()?);
    }
    Ok(())
}

/// Extracts the table entry a beacon profile maps to, or `None` for
/// our own echoes and unparsable addresses.
fn beacon_peer(profile: &Profile, self_address: &str) -> Option<(String, PeerInfo)> {
    if profile.address == self_address {
        return None;
    }

    let ip = profile.address.split(':').next().unwrap_or("");
    if ip.is_empty() {
        return None;
    }

    Some((
        ip.to_string(),
        PeerInfo {
            login: profile.login.clone(),
            address: profile.address.clone(),
        },
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
