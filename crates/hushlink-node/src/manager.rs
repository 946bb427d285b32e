//! The manager session: the local control client's command table and
//! the UI message pump.
//!
//! A manager connects over loopback and speaks the same framed
//! command format as peers, just unencrypted. Its handlers drive the
//! node: dial a peer, forward a message, stream a file, shut down.
//! While a manager is attached, a pump task drains the UI channel and
//! pushes each message to it as a `SEND` record.

use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use hushlink_proto::channel::{PlainChannel, PlainWriterHandle, RecordChannel};
use hushlink_proto::command::{self, command_loop, CommandTable, Flow, LoopEnd, Opcode, OPCODE_LEN};
use hushlink_proto::framing::MAX_RECORD;
use hushlink_proto::wire;
use hushlink_types::{FileChunk, HushlinkError, Result};

use std::sync::Arc;

use crate::node::{self, ManagerCommandTable, NodeShared};
use crate::peers::PeerWriterHandle;

type ManagerCh = PlainChannel<TcpStream>;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Bytes held back from each file chunk for the opcode, the body
/// encoding and the seal expansion, so a sealed `FILE` record always
/// fits one frame.
const FILE_RESERVED: usize = 1024;

/// File payload bytes per `FILE` chunk.
pub const FILE_CHUNK_BYTES: usize = MAX_RECORD - OPCODE_LEN - FILE_RESERVED;

// ---------------------------------------------------------------------------
// ManagerCtx
// ---------------------------------------------------------------------------

/// The peer the manager is currently pointed at.
pub struct CurrentPeer {
    /// Peer-table key.
    pub ip: String,
    /// Session write handle.
    pub writer: PeerWriterHandle,
}

/// Per-session context handed to manager command handlers.
pub struct ManagerCtx {
    /// Shared node state.
    pub shared: Arc<NodeShared>,
    /// Target of `SEND` and `FILE` commands; set by `CONN`.
    pub current: Option<CurrentPeer>,
}

impl ManagerCtx {
    fn current(&self) -> Result<&CurrentPeer> {
        self.current.as_ref().ok_or_else(|| HushlinkError::Peer {
            reason: "no connected peer".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Builds the manager command table.
pub fn table() -> ManagerCommandTable {
    let mut table = CommandTable::new();
    table.register(Opcode::CONN, conn_handler);
    table.register(Opcode::DISC, disc_handler);
    table.register(Opcode::LIST, list_handler);
    table.register(Opcode::SEND, send_handler);
    table.register(Opcode::FILE, file_handler);
    table.register(Opcode::QUIT, quit_handler);
    table
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `CONN host:port` — dial, handshake, spawn the peer loop, then
/// introduce ourselves.
fn conn_handler<'a>(
    ctx: &'a mut ManagerCtx,
    _channel: &'a mut ManagerCh,
    body: Vec<u8>,
) -> BoxFuture<'a, Result<Flow>> {
    Box::pin(async move {
        let target = String::from_utf8(body).map_err(|_| HushlinkError::Peer {
            reason: "target address is not utf-8".into(),
        })?;
        let target = target.trim().to_string();

        let (ip, writer) = node::dial_peer(Arc::clone(&ctx.shared), &target).await?;
        writer
            .lock()
            .await
            .write_package(&command::encode(Opcode::INFO, b""))
            .await?;

        tracing::info!(peer = %ip, %target, "dialed peer");
        ctx.current = Some(CurrentPeer { ip, writer });
        Ok(Flow::Continue)
    })
}

/// `DISC` — say goodbye to the current peer and drop its link.
fn disc_handler<'a>(
    ctx: &'a mut ManagerCtx,
    _channel: &'a mut ManagerCh,
    _body: Vec<u8>,
) -> BoxFuture<'a, Result<Flow>> {
    Box::pin(async move {
        if let Some(current) = ctx.current.take() {
            let mut writer = current.writer.lock().await;
            if let Err(e) = writer
                .write_package(&command::encode(Opcode::DISC, b""))
                .await
            {
                tracing::debug!(peer = %current.ip, error = %e, "disconnect notice failed");
            }
            let _ = writer.shutdown().await;
            drop(writer);

            ctx.shared.peers.clear_link(&current.ip)?;
            tracing::info!(peer = %current.ip, "disconnected");
        }
        Ok(Flow::Continue)
    })
}

/// `LIST` — reply with the peer table as `RELI`.
fn list_handler<'a>(
    ctx: &'a mut ManagerCtx,
    channel: &'a mut ManagerCh,
    _body: Vec<u8>,
) -> BoxFuture<'a, Result<Flow>> {
    Box::pin(async move {
        let peers = wire::to_cbor(&ctx.shared.peers.snapshot()?)?;
        channel.send(&command::encode(Opcode::RELI, &peers)).await?;
        Ok(Flow::Continue)
    })
}

/// `SEND text` — forward the text to the current peer.
fn send_handler<'a>(
    ctx: &'a mut ManagerCtx,
    _channel: &'a mut ManagerCh,
    body: Vec<u8>,
) -> BoxFuture<'a, Result<Flow>> {
    Box::pin(async move {
        let current = ctx.current()?;
        current
            .writer
            .lock()
            .await
            .write_package(&command::encode(Opcode::SEND, &body))
            .await?;
        Ok(Flow::Continue)
    })
}

/// `FILE path` — stream a local file to the current peer in chunks.
fn file_handler<'a>(
    ctx: &'a mut ManagerCtx,
    _channel: &'a mut ManagerCh,
    body: Vec<u8>,
) -> BoxFuture<'a, Result<Flow>> {
    Box::pin(async move {
        let path = String::from_utf8(body).map_err(|_| HushlinkError::Peer {
            reason: "file path is not utf-8".into(),
        })?;
        let path = path.trim().to_string();
        let current = ctx.current()?;

        let mut file = tokio::fs::File::open(&path).await?;
        let mut buf = vec![0u8; FILE_CHUNK_BYTES];
        let mut sent = 0usize;

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }

            let chunk = FileChunk {
                name: path.clone(),
                data: buf[..n].to_vec(),
            };
            current
                .writer
                .lock()
                .await
                .write_package(&command::encode(Opcode::FILE, &wire::to_cbor(&chunk)?))
                .await?;
            sent += n;
        }

        tracing::info!(peer = %current.ip, %path, bytes = sent, "file sent");
        Ok(Flow::Continue)
    })
}

/// `QUIT` — fire the shutdown signal. The supervisor does the rest.
fn quit_handler<'a>(
    ctx: &'a mut ManagerCtx,
    _channel: &'a mut ManagerCh,
    _body: Vec<u8>,
) -> BoxFuture<'a, Result<Flow>> {
    Box::pin(async move {
        tracing::info!("manager requested shutdown");
        let _ = ctx.shared.shutdown.send(true);
        Ok(Flow::Continue)
    })
}

// ---------------------------------------------------------------------------
// Session runner
// ---------------------------------------------------------------------------

/// Serves one manager connection to completion.
pub async fn run_manager_session(
    shared: Arc<NodeShared>,
    table: Arc<ManagerCommandTable>,
    stream: TcpStream,
) {
    let mut channel = PlainChannel::new(stream);
    let pump = tokio::spawn(pump_ui(Arc::clone(&shared), channel.writer()));

    let mut ctx = ManagerCtx {
        shared,
        current: None,
    };
    match command_loop(&mut channel, &table, &mut ctx).await {
        LoopEnd::Stopped => tracing::info!("manager session closed"),
        LoopEnd::Failed(e) => tracing::info!(error = %e, "manager session ended"),
    }

    pump.abort();
}

/// Drains the UI channel into the manager connection as `SEND`
/// records. Holds the receiver for the lifetime of the session; a
/// second manager waits until the first detaches.
async fn pump_ui(shared: Arc<NodeShared>, writer: PlainWriterHandle<TcpStream>) {
    let mut ui_rx = shared.ui_rx.lock().await;
    drain_ui(&mut ui_rx, &writer).await;
}

async fn drain_ui(
    ui_rx: &mut mpsc::Receiver<String>,
    writer: &PlainWriterHandle<TcpStream>,
) {
    while let Some(message) = ui_rx.recv().await {
        let record = command::encode(Opcode::SEND, message.as_bytes());
        if let Err(e) = writer.lock().await.write_record(&record).await {
            tracing::debug!(error = %e, "ui pump ended");
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_the_manager_opcode_set() {
        let table = table();
        for opcode in [
            Opcode::CONN,
            Opcode::DISC,
            Opcode::LIST,
            Opcode::SEND,
            Opcode::FILE,
            Opcode::QUIT,
        ] {
            assert!(table.get(opcode).is_some(), "{opcode} missing");
        }
        assert_eq!(table.len(), 6);
    }

    #[test]
    fn peer_only_opcodes_stay_unregistered() {
        let table = table();
        assert!(table.get(Opcode::INFO).is_none());
        assert!(table.get(Opcode::REFO).is_none());
        assert!(table.get(Opcode::RELI).is_none());
        assert!(table.get(Opcode::SEEK).is_none());
    }

    #[test]
    fn file_chunks_leave_room_for_the_seal() {
        // Chunk + opcode + CBOR envelope + seal expansion must fit a
        // single record.
        assert!(FILE_CHUNK_BYTES + OPCODE_LEN + FILE_RESERVED <= MAX_RECORD);
        assert_eq!(FILE_CHUNK_BYTES, 64_508);
    }
}
