//! Command handlers for peer-to-peer sessions.
//!
//! Every handler runs inside the session's command loop with the
//! session's [`PeerCtx`]; a handler error becomes a `REER` to the
//! counterparty, never a dead session.

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use hushlink_proto::channel::{PeerChannel, RecordChannel};
use hushlink_proto::command::{self, CommandTable, Flow, Opcode};
use hushlink_proto::wire;
use hushlink_types::{FileChunk, HushlinkError, PeerInfo, Profile, Result};

use crate::node::{PeerCommandTable, PeerCtx};

type PeerCh = PeerChannel<TcpStream>;

/// Builds the peer command table.
///
/// `SEEK` is deliberately absent: it stays reserved and is answered
/// with `REER` through the unknown-opcode path.
pub fn table() -> PeerCommandTable {
    let mut table = CommandTable::new();
    table.register(Opcode::INFO, info_handler);
    table.register(Opcode::LIST, list_handler);
    table.register(Opcode::SEND, send_handler);
    table.register(Opcode::FILE, file_handler);
    table.register(Opcode::DISC, disc_handler);
    table.register(Opcode::REFO, refo_handler);
    table.register(Opcode::RELI, reli_handler);
    table
}

/// How the posting peer is named in UI messages: its announced login,
/// or its IP until a `REFO` has arrived.
fn display_name(ctx: &PeerCtx) -> Result<String> {
    Ok(ctx
        .shared
        .peers
        .login_of(&ctx.peer_ip)?
        .unwrap_or_else(|| ctx.peer_ip.clone()))
}

/// `INFO` — reply with our own profile as `REFO`.
fn info_handler<'a>(
    ctx: &'a mut PeerCtx,
    channel: &'a mut PeerCh,
    _body: Vec<u8>,
) -> BoxFuture<'a, Result<Flow>> {
    Box::pin(async move {
        let profile = wire::to_cbor(&ctx.shared.profile)?;
        channel
            .send(&command::encode(Opcode::REFO, &profile))
            .await?;
        Ok(Flow::Continue)
    })
}

/// `LIST` — reply with our known-peer map as `RELI`.
fn list_handler<'a>(
    ctx: &'a mut PeerCtx,
    channel: &'a mut PeerCh,
    _body: Vec<u8>,
) -> BoxFuture<'a, Result<Flow>> {
    Box::pin(async move {
        let peers = wire::to_cbor(&ctx.shared.peers.snapshot()?)?;
        channel.send(&command::encode(Opcode::RELI, &peers)).await?;
        Ok(Flow::Continue)
    })
}

/// `SEND` — post the text to the UI channel, prefixed by the sender.
fn send_handler<'a>(
    ctx: &'a mut PeerCtx,
    _channel: &'a mut PeerCh,
    body: Vec<u8>,
) -> BoxFuture<'a, Result<Flow>> {
    Box::pin(async move {
        let sender = display_name(ctx)?;
        let text = String::from_utf8_lossy(&body);
        ctx.shared
            .ui_tx
            .send(format!("{sender}: {text}"))
            .await
            .map_err(|_| HushlinkError::Peer {
                reason: "ui channel closed".into(),
            })?;
        Ok(Flow::Continue)
    })
}

/// `FILE` — append the chunk under `<download_dir>/<sender>/<name>`.
///
/// The chunk name is untrusted input; only its final path component
/// is used, so a peer cannot climb out of its directory.
fn file_handler<'a>(
    ctx: &'a mut PeerCtx,
    _channel: &'a mut PeerCh,
    body: Vec<u8>,
) -> BoxFuture<'a, Result<Flow>> {
    Box::pin(async move {
        let chunk: FileChunk = wire::from_cbor(&body)?;
        let name = std::path::Path::new(&chunk.name)
            .file_name()
            .ok_or_else(|| HushlinkError::Peer {
                reason: format!("file name {:?} has no final component", chunk.name),
            })?
            .to_owned();

        let sender = display_name(ctx)?;
        let dir = ctx.shared.download_dir.join(&sender);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(&name);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&chunk.data).await?;

        ctx.shared
            .ui_tx
            .send(format!(
                "{sender}: received {} bytes of {}",
                chunk.data.len(),
                name.to_string_lossy()
            ))
            .await
            .map_err(|_| HushlinkError::Peer {
                reason: "ui channel closed".into(),
            })?;
        Ok(Flow::Continue)
    })
}

/// `DISC` — drop the session: keys gone, link gone, loop over.
fn disc_handler<'a>(
    ctx: &'a mut PeerCtx,
    _channel: &'a mut PeerCh,
    _body: Vec<u8>,
) -> BoxFuture<'a, Result<Flow>> {
    Box::pin(async move {
        ctx.shared.peers.clear_crypto(&ctx.peer_ip)?;
        ctx.shared.peers.clear_link(&ctx.peer_ip)?;
        tracing::info!(peer = %ctx.peer_ip, "peer requested disconnect");
        Ok(Flow::Stop)
    })
}

/// `REFO` — the peer announced its identity; update the record.
fn refo_handler<'a>(
    ctx: &'a mut PeerCtx,
    _channel: &'a mut PeerCh,
    body: Vec<u8>,
) -> BoxFuture<'a, Result<Flow>> {
    Box::pin(async move {
        let profile: Profile = wire::from_cbor(&body)?;
        ctx.shared
            .peers
            .update_identity(&ctx.peer_ip, profile.login, profile.address)?;
        Ok(Flow::Continue)
    })
}

/// `RELI` — gossip: merge unknown peers, persist when the table grew.
fn reli_handler<'a>(
    ctx: &'a mut PeerCtx,
    _channel: &'a mut PeerCh,
    body: Vec<u8>,
) -> BoxFuture<'a, Result<Flow>> {
    Box::pin(async move {
        let incoming: std::collections::HashMap<String, PeerInfo> = wire::from_cbor(&body)?;
        let added = ctx.shared.peers.merge(incoming)?;
        if added > 0 {
            tracing::info!(peer = %ctx.peer_ip, added, "learned peers via gossip");
            ctx.shared.store.persist(&ctx.shared.peers.snapshot()?);
        }
        Ok(Flow::Continue)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_the_peer_opcode_set() {
        let table = table();
        for opcode in [
            Opcode::INFO,
            Opcode::LIST,
            Opcode::SEND,
            Opcode::FILE,
            Opcode::DISC,
            Opcode::REFO,
            Opcode::RELI,
        ] {
            assert!(table.get(opcode).is_some(), "{opcode} missing");
        }
        assert_eq!(table.len(), 7);
    }

    #[test]
    fn reserved_opcodes_stay_unregistered() {
        let table = table();
        assert!(table.get(Opcode::SEEK).is_none());
        assert!(table.get(Opcode::RESE).is_none());
        assert!(table.get(Opcode::REER).is_none());
    }
}
