//! Command opcodes, handler tables and the dispatch loop.
//!
//! Every application-level message is a 4-byte ASCII opcode followed
//! by an opaque body. The dispatcher reads records off any
//! [`RecordChannel`], looks the opcode up in a [`CommandTable`] and
//! invokes the handler; failures are reported back to the counterparty
//! as `REER` records and the loop keeps going. Only a channel failure
//! (or a handler explicitly requesting disconnect) ends the loop.
//!
//! Tables are built at startup by explicit [`CommandTable::register`]
//! calls and passed to the loop as plain values — there is no global
//! registry, which keeps the dispatcher trivially testable with
//! synthetic tables.

use std::collections::HashMap;
use std::fmt;

use futures::future::BoxFuture;

use hushlink_types::{HushlinkError, Result};

use crate::channel::RecordChannel;

// ---------------------------------------------------------------------------
// Opcode
// ---------------------------------------------------------------------------

/// Bytes in every opcode.
pub const OPCODE_LEN: usize = 4;

/// A 4-byte ASCII command identifier.
///
/// The opcode set is closed; `SEEK` and `RESE` are reserved for a
/// future peer-search exchange and are registered in no table, so
/// they surface as `UnknownOpcode` until specified.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Opcode([u8; OPCODE_LEN]);

impl Opcode {
    /// Request the counterparty's profile.
    pub const INFO: Self = Self(*b"INFO");
    /// Request the counterparty's known-peer map.
    pub const LIST: Self = Self(*b"LIST");
    /// Carry a text message.
    pub const SEND: Self = Self(*b"SEND");
    /// Carry a file chunk (peer side) or a file path (manager side).
    pub const FILE: Self = Self(*b"FILE");
    /// Dial a new peer (manager side).
    pub const CONN: Self = Self(*b"CONN");
    /// Disconnect the session.
    pub const DISC: Self = Self(*b"DISC");
    /// Shut the node down (manager side).
    pub const QUIT: Self = Self(*b"QUIT");
    /// Response to `INFO`: a serialized profile.
    pub const REFO: Self = Self(*b"REFO");
    /// Response to `LIST`: a serialized peer map.
    pub const RELI: Self = Self(*b"RELI");
    /// Error report carrying human-readable text.
    pub const REER: Self = Self(*b"REER");
    /// Reserved: peer search by group.
    pub const SEEK: Self = Self(*b"SEEK");
    /// Reserved: peer search response.
    pub const RESE: Self = Self(*b"RESE");

    /// Builds an opcode from raw bytes.
    pub const fn new(bytes: [u8; OPCODE_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw opcode bytes.
    pub const fn as_bytes(&self) -> &[u8; OPCODE_LEN] {
        &self.0
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.escape_ascii())
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opcode({})", self.0.escape_ascii())
    }
}

// ---------------------------------------------------------------------------
// Record encoding
// ---------------------------------------------------------------------------

/// Packs an opcode and body into one command record.
pub fn encode(opcode: Opcode, body: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(OPCODE_LEN + body.len());
    record.extend_from_slice(opcode.as_bytes());
    record.extend_from_slice(body);
    record
}

/// Splits a command record into opcode and body.
pub fn split(record: &[u8]) -> Result<(Opcode, &[u8])> {
    if record.len() < OPCODE_LEN {
        return Err(HushlinkError::ShortCommand { len: record.len() });
    }

    let mut opcode = [0u8; OPCODE_LEN];
    opcode.copy_from_slice(&record[..OPCODE_LEN]);
    Ok((Opcode(opcode), &record[OPCODE_LEN..]))
}

// ---------------------------------------------------------------------------
// Handlers and tables
// ---------------------------------------------------------------------------

/// What a handler tells the loop to do next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    /// Keep reading commands.
    Continue,
    /// The handler closed the channel; leave the loop cleanly.
    Stop,
}

/// One command handler.
///
/// Plain function pointers returning boxed futures: the finite set of
/// handler signatures is checked at compile time, where the ancestral
/// design used runtime type assertions on an untyped table.
pub type Handler<Ctx, Ch> =
    for<'a> fn(&'a mut Ctx, &'a mut Ch, Vec<u8>) -> BoxFuture<'a, Result<Flow>>;

/// Opcode → handler mapping for one kind of session.
///
/// Two tables exist in a running node — one for peer sessions, one
/// for manager sessions — built by the node at startup and passed to
/// each [`command_loop`] as a dependency.
pub struct CommandTable<Ctx, Ch> {
    handlers: HashMap<Opcode, Handler<Ctx, Ch>>,
}

impl<Ctx, Ch> CommandTable<Ctx, Ch> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for `opcode`, replacing any previous
    /// registration.
    pub fn register(&mut self, opcode: Opcode, handler: Handler<Ctx, Ch>) {
        self.handlers.insert(opcode, handler);
    }

    /// Looks up the handler for `opcode`.
    pub fn get(&self, opcode: Opcode) -> Option<&Handler<Ctx, Ch>> {
        self.handlers.get(&opcode)
    }

    /// Number of registered opcodes.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the table has no registrations.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<Ctx, Ch> Default for CommandTable<Ctx, Ch> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Command loop
// ---------------------------------------------------------------------------

/// Why a [`command_loop`] returned.
#[derive(Debug)]
pub enum LoopEnd {
    /// A handler closed the channel deliberately.
    Stopped,
    /// The channel failed; the error decides the caller's cleanup
    /// policy (see [`hushlink_types::ErrorClass`]).
    Failed(HushlinkError),
}

/// Drives one session: read a record, dispatch, report errors,
/// repeat.
///
/// Per-command failures (unknown opcode, handler error) go back to
/// the counterparty as `REER <text>` and the loop continues. The loop
/// ends when the channel fails — including a command record shorter
/// than one opcode, which means the record stream itself is broken —
/// or when a handler returns [`Flow::Stop`].
pub async fn command_loop<Ctx, Ch>(
    channel: &mut Ch,
    table: &CommandTable<Ctx, Ch>,
    ctx: &mut Ctx,
) -> LoopEnd
where
    Ctx: Send,
    Ch: RecordChannel,
{
    loop {
        let record = match channel.recv().await {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(error = %e, "session read failed; leaving command loop");
                return LoopEnd::Failed(e);
            }
        };

        let (opcode, body) = match split(&record) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::debug!(error = %e, "broken command record; leaving command loop");
                return LoopEnd::Failed(e);
            }
        };
        let body = body.to_vec();

        let Some(handler) = table.get(opcode) else {
            let err = HushlinkError::UnknownOpcode {
                opcode: opcode.to_string(),
            };
            tracing::warn!(%opcode, "no handler for opcode");
            // An unhandled error report is only logged: answering REER
            // with REER would ping-pong between two sessions forever.
            if opcode != Opcode::REER {
                if let Err(send_err) = report(channel, &err).await {
                    return LoopEnd::Failed(send_err);
                }
            }
            continue;
        };

        match handler(ctx, channel, body).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => return LoopEnd::Stopped,
            Err(e) => {
                tracing::warn!(%opcode, error = %e, "command handler failed");
                if let Err(send_err) = report(channel, &e).await {
                    return LoopEnd::Failed(send_err);
                }
            }
        }
    }
}

/// Sends a `REER` record describing `err` to the counterparty.
async fn report<Ch: RecordChannel>(channel: &mut Ch, err: &HushlinkError) -> Result<()> {
    channel
        .send(&encode(Opcode::REER, err.to_string().as_bytes()))
        .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::DuplexStream;

    use crate::channel::PlainChannel;
    use crate::framing::MAX_RECORD;

    type TestChannel = PlainChannel<DuplexStream>;

    #[derive(Default)]
    struct TestCtx {
        seen: Vec<String>,
    }

    fn note_handler<'a>(
        ctx: &'a mut TestCtx,
        _channel: &'a mut TestChannel,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<Flow>> {
        Box::pin(async move {
            ctx.seen.push(String::from_utf8_lossy(&body).into_owned());
            Ok(Flow::Continue)
        })
    }

    fn echo_handler<'a>(
        _ctx: &'a mut TestCtx,
        channel: &'a mut TestChannel,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<Flow>> {
        Box::pin(async move {
            channel.send(&encode(Opcode::RELI, &body)).await?;
            Ok(Flow::Continue)
        })
    }

    fn failing_handler<'a>(
        _ctx: &'a mut TestCtx,
        _channel: &'a mut TestChannel,
        _body: Vec<u8>,
    ) -> BoxFuture<'a, Result<Flow>> {
        Box::pin(async move {
            Err(HushlinkError::Peer {
                reason: "nothing to send to".into(),
            })
        })
    }

    fn stop_handler<'a>(
        _ctx: &'a mut TestCtx,
        _channel: &'a mut TestChannel,
        _body: Vec<u8>,
    ) -> BoxFuture<'a, Result<Flow>> {
        Box::pin(async move { Ok(Flow::Stop) })
    }

    fn test_table() -> CommandTable<TestCtx, TestChannel> {
        let mut table = CommandTable::new();
        table.register(Opcode::SEND, note_handler);
        table.register(Opcode::LIST, echo_handler);
        table.register(Opcode::CONN, failing_handler);
        table.register(Opcode::DISC, stop_handler);
        table
    }

    fn channel_pair() -> (TestChannel, TestChannel) {
        let (a, b) = tokio::io::duplex(MAX_RECORD);
        (PlainChannel::new(a), PlainChannel::new(b))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatches_to_registered_handler() {
        let (mut driver, mut side) = channel_pair();
        let loop_task = tokio::spawn(async move {
            let table = test_table();
            let mut ctx = TestCtx::default();
            let end = command_loop(&mut side, &table, &mut ctx).await;
            (ctx, end)
        });

        driver.send(&encode(Opcode::SEND, b"hello")).await.unwrap();
        driver.send(&encode(Opcode::SEND, b"again")).await.unwrap();
        driver.send(&encode(Opcode::DISC, b"")).await.unwrap();

        let (ctx, end) = loop_task.await.expect("loop task");
        assert_eq!(ctx.seen, vec!["hello".to_string(), "again".to_string()]);
        assert!(matches!(end, LoopEnd::Stopped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_can_reply_on_the_channel() {
        let (mut driver, mut side) = channel_pair();
        let loop_task = tokio::spawn(async move {
            let table = test_table();
            let mut ctx = TestCtx::default();
            command_loop(&mut side, &table, &mut ctx).await
        });

        driver.send(&encode(Opcode::LIST, b"payload")).await.unwrap();
        let reply = driver.recv().await.expect("reply");
        let (opcode, body) = split(&reply).expect("split");
        assert_eq!(opcode, Opcode::RELI);
        assert_eq!(body, b"payload");

        driver.send(&encode(Opcode::DISC, b"")).await.unwrap();
        assert!(matches!(
            loop_task.await.expect("loop task"),
            LoopEnd::Stopped
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_opcode_reports_and_continues() {
        let (mut driver, mut side) = channel_pair();
        let loop_task = tokio::spawn(async move {
            let table = test_table();
            let mut ctx = TestCtx::default();
            let end = command_loop(&mut side, &table, &mut ctx).await;
            (ctx, end)
        });

        // SEEK is reserved and unregistered.
        driver.send(&encode(Opcode::SEEK, b"")).await.unwrap();
        let reply = driver.recv().await.expect("REER");
        let (opcode, body) = split(&reply).expect("split");
        assert_eq!(opcode, Opcode::REER);
        assert_eq!(body, b"command SEEK is not supported");

        // The loop is still alive.
        driver.send(&encode(Opcode::SEND, b"still here")).await.unwrap();
        driver.send(&encode(Opcode::DISC, b"")).await.unwrap();

        let (ctx, _) = loop_task.await.expect("loop task");
        assert_eq!(ctx.seen, vec!["still here".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_error_reports_and_continues() {
        let (mut driver, mut side) = channel_pair();
        let loop_task = tokio::spawn(async move {
            let table = test_table();
            let mut ctx = TestCtx::default();
            command_loop(&mut side, &table, &mut ctx).await
        });

        driver.send(&encode(Opcode::CONN, b"somewhere")).await.unwrap();
        let reply = driver.recv().await.expect("REER");
        let (opcode, body) = split(&reply).expect("split");
        assert_eq!(opcode, Opcode::REER);
        assert_eq!(body, b"peer error: nothing to send to");

        driver.send(&encode(Opcode::DISC, b"")).await.unwrap();
        assert!(matches!(
            loop_task.await.expect("loop task"),
            LoopEnd::Stopped
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn short_record_ends_the_loop() {
        let (mut driver, mut side) = channel_pair();
        let loop_task = tokio::spawn(async move {
            let table = test_table();
            let mut ctx = TestCtx::default();
            command_loop(&mut side, &table, &mut ctx).await
        });

        driver.send(b"ab").await.unwrap();
        assert!(matches!(
            loop_task.await.expect("loop task"),
            LoopEnd::Failed(HushlinkError::ShortCommand { len: 2 })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_channel_ends_the_loop() {
        let (driver, mut side) = channel_pair();
        let loop_task = tokio::spawn(async move {
            let table = test_table();
            let mut ctx = TestCtx::default();
            command_loop(&mut side, &table, &mut ctx).await
        });

        drop(driver);
        assert!(matches!(
            loop_task.await.expect("loop task"),
            LoopEnd::Failed(HushlinkError::Truncated)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unhandled_error_report_is_not_answered() {
        let (mut driver, mut side) = channel_pair();
        let loop_task = tokio::spawn(async move {
            let table = test_table();
            let mut ctx = TestCtx::default();
            command_loop(&mut side, &table, &mut ctx).await
        });

        // REER is not in the table; the loop must swallow it instead
        // of reporting back (which would ping-pong forever between
        // two dispatchers).
        driver.send(&encode(Opcode::REER, b"some failure")).await.unwrap();
        driver.send(&encode(Opcode::LIST, b"probe")).await.unwrap();

        // The next record the driver sees is the LIST echo, not a REER.
        let reply = driver.recv().await.expect("reply");
        let (opcode, body) = split(&reply).expect("split");
        assert_eq!(opcode, Opcode::RELI);
        assert_eq!(body, b"probe");

        driver.send(&encode(Opcode::DISC, b"")).await.unwrap();
        assert!(matches!(
            loop_task.await.expect("loop task"),
            LoopEnd::Stopped
        ));
    }

    #[test]
    fn encode_split_round_trip() {
        let record = encode(Opcode::SEND, b"body bytes");
        let (opcode, body) = split(&record).expect("split");
        assert_eq!(opcode, Opcode::SEND);
        assert_eq!(body, b"body bytes");
    }

    #[test]
    fn empty_body_is_valid() {
        let record = encode(Opcode::INFO, b"");
        let (opcode, body) = split(&record).expect("split");
        assert_eq!(opcode, Opcode::INFO);
        assert!(body.is_empty());
    }

    #[test]
    fn opcode_displays_as_ascii() {
        assert_eq!(Opcode::INFO.to_string(), "INFO");
        assert_eq!(Opcode::new(*b"\x01ABC").to_string(), "\\x01ABC");
    }
}
