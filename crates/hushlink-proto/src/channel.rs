//! Record channels: the dispatcher-facing abstraction over encrypted
//! peer links and plaintext manager links.
//!
//! # Ownership model
//!
//! A live session splits its stream once the handshake is done:
//!
//! - the **read half** is exclusively owned by the session task
//!   (records arrive in order, nobody else may consume them);
//! - the **write half** sits behind an async mutex and is shared —
//!   the session's own response path, the manager's forwarding path
//!   and the shutdown teardown all hold clones of the handle.
//!
//! For encrypted channels the seal step runs inside the writer lock,
//! so record counters reach the wire in the order they were assigned.
//! The [`SessionCrypto`] itself lives in a [`CryptoCell`] shared with
//! the peer record: the keys and counters survive a dropped
//! connection, which is what lets a reconnecting peer skip the
//! handshake.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use hushlink_crypto::session::SessionCrypto;
use hushlink_types::{HushlinkError, Result};

use crate::framing::{FramedReader, FramedWriter};

// ---------------------------------------------------------------------------
// CryptoCell
// ---------------------------------------------------------------------------

/// Shared handle to one session's symmetric state.
///
/// Lock scope is always a single seal or open — never held across an
/// await point.
pub type CryptoCell = Arc<StdMutex<SessionCrypto>>;

/// Wraps freshly derived session state into a shareable cell.
pub fn crypto_cell(crypto: SessionCrypto) -> CryptoCell {
    Arc::new(StdMutex::new(crypto))
}

fn lock_crypto(cell: &CryptoCell) -> Result<MutexGuard<'_, SessionCrypto>> {
    cell.lock().map_err(|_| HushlinkError::Crypto {
        reason: "session crypto mutex poisoned".into(),
    })
}

// ---------------------------------------------------------------------------
// RecordChannel
// ---------------------------------------------------------------------------

/// Anything the command dispatcher can drive: a source and sink of
/// whole records.
///
/// The dispatcher is oblivious to encryption — a [`PeerChannel`]
/// decrypts on `recv` and seals on `send`, a [`PlainChannel`] passes
/// records through unchanged.
pub trait RecordChannel: Send {
    /// Receives the next record.
    fn recv(&mut self) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Sends one record.
    fn send(&mut self, body: &[u8]) -> impl Future<Output = Result<()>> + Send;
}

// ---------------------------------------------------------------------------
// PlainChannel
// ---------------------------------------------------------------------------

/// Shared handle to the write side of a plaintext channel.
pub type PlainWriterHandle<S> = Arc<AsyncMutex<FramedWriter<WriteHalf<S>>>>;

/// Unencrypted framed channel; the manager link and test harnesses.
pub struct PlainChannel<S> {
    reader: FramedReader<ReadHalf<S>>,
    writer: PlainWriterHandle<S>,
}

impl<S> PlainChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Splits `stream` into a framed reader and a shareable framed
    /// writer.
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FramedReader::new(read_half),
            writer: Arc::new(AsyncMutex::new(FramedWriter::new(write_half))),
        }
    }

    /// Clones the shared writer handle, e.g. for a pump task that
    /// pushes records while the channel sits in a command loop.
    pub fn writer(&self) -> PlainWriterHandle<S> {
        Arc::clone(&self.writer)
    }
}

impl<S> RecordChannel for PlainChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Vec<u8>> {
        self.reader.read_record().await
    }

    async fn send(&mut self, body: &[u8]) -> Result<()> {
        self.writer.lock().await.write_record(body).await
    }
}

// ---------------------------------------------------------------------------
// SecureWriter / SecureReader
// ---------------------------------------------------------------------------

/// Write side of an encrypted session: seals then frames.
pub struct SecureWriter<W> {
    framed: FramedWriter<W>,
    crypto: CryptoCell,
}

impl<W> SecureWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Pairs a framed write half with the session's crypto cell.
    pub fn new(framed: FramedWriter<W>, crypto: CryptoCell) -> Self {
        Self { framed, crypto }
    }

    /// Seals `body` and writes the resulting record.
    pub async fn write_package(&mut self, body: &[u8]) -> Result<()> {
        let sealed = lock_crypto(&self.crypto)?.seal(body)?;
        self.framed.write_record(&sealed).await
    }

    /// Shuts down the write direction of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.framed.shutdown().await
    }
}

/// Read side of an encrypted session: unframes then opens.
pub struct SecureReader<R> {
    framed: FramedReader<R>,
    crypto: CryptoCell,
}

impl<R> SecureReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Pairs a framed read half with the session's crypto cell.
    pub fn new(framed: FramedReader<R>, crypto: CryptoCell) -> Self {
        Self { framed, crypto }
    }

    /// Reads the next record and opens it.
    pub async fn read_package(&mut self) -> Result<Vec<u8>> {
        let record = self.framed.read_record().await?;
        lock_crypto(&self.crypto)?.open(&record)
    }
}

// ---------------------------------------------------------------------------
// PeerChannel
// ---------------------------------------------------------------------------

/// Shared handle to the write side of an encrypted channel.
pub type SecureWriterHandle<S> = Arc<AsyncMutex<SecureWriter<WriteHalf<S>>>>;

/// Encrypted record channel for one peer session.
pub struct PeerChannel<S> {
    reader: SecureReader<ReadHalf<S>>,
    writer: SecureWriterHandle<S>,
}

impl<S> PeerChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Splits `stream` and attaches the session crypto to both
    /// halves. Call once the handshake on the raw stream is done.
    pub fn new(stream: S, crypto: CryptoCell) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: SecureReader::new(FramedReader::new(read_half), Arc::clone(&crypto)),
            writer: Arc::new(AsyncMutex::new(SecureWriter::new(
                FramedWriter::new(write_half),
                crypto,
            ))),
        }
    }

    /// Clones the shared writer handle.
    pub fn writer(&self) -> SecureWriterHandle<S> {
        Arc::clone(&self.writer)
    }
}

impl<S> RecordChannel for PeerChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Vec<u8>> {
        self.reader.read_package().await
    }

    async fn send(&mut self, body: &[u8]) -> Result<()> {
        self.writer.lock().await.write_package(body).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use hushlink_crypto::session::{SessionRole, SEAL_OVERHEAD};

    use crate::framing::MAX_RECORD;

    fn session_pair() -> (CryptoCell, CryptoCell) {
        let secret = b"channel test secret";
        (
            crypto_cell(SessionCrypto::derive(secret, SessionRole::Initiator)),
            crypto_cell(SessionCrypto::derive(secret, SessionRole::Responder)),
        )
    }

    #[tokio::test]
    async fn encrypted_round_trip_both_directions() -> Result<()> {
        let (initiator_crypto, responder_crypto) = session_pair();
        let (a, b) = tokio::io::duplex(MAX_RECORD);
        let mut alice = PeerChannel::new(a, initiator_crypto);
        let mut bob = PeerChannel::new(b, responder_crypto);

        alice.send(b"from alice").await?;
        assert_eq!(bob.recv().await?, b"from alice");

        bob.send(b"from bob").await?;
        assert_eq!(alice.recv().await?, b"from bob");
        Ok(())
    }

    #[tokio::test]
    async fn wire_bytes_are_sealed() -> Result<()> {
        let (initiator_crypto, _) = session_pair();
        let (a, b) = tokio::io::duplex(MAX_RECORD);
        let mut alice = PeerChannel::new(a, initiator_crypto);
        let mut raw = crate::framing::FramedStream::new(b);

        alice.send(b"secret text").await?;
        let record = raw.read_record().await?;

        assert_eq!(record.len(), b"secret text".len() + SEAL_OVERHEAD);
        assert!(!record
            .windows(b"secret text".len())
            .any(|w| w == b"secret text"));
        Ok(())
    }

    #[tokio::test]
    async fn shared_writer_interleaves_without_corruption() -> Result<()> {
        let (initiator_crypto, responder_crypto) = session_pair();
        let (a, b) = tokio::io::duplex(MAX_RECORD);
        let alice = PeerChannel::new(a, initiator_crypto);
        let mut bob = PeerChannel::new(b, responder_crypto);

        let writer_one = alice.writer();
        let writer_two = alice.writer();
        let task_one = tokio::spawn(async move {
            for _ in 0..10 {
                writer_one.lock().await.write_package(b"one").await?;
            }
            Ok::<_, HushlinkError>(())
        });
        let task_two = tokio::spawn(async move {
            for _ in 0..10 {
                writer_two.lock().await.write_package(b"two").await?;
            }
            Ok::<_, HushlinkError>(())
        });

        // Every record must open in counter order regardless of which
        // task sealed it.
        let mut ones = 0;
        let mut twos = 0;
        for _ in 0..20 {
            match bob.recv().await?.as_slice() {
                b"one" => ones += 1,
                b"two" => twos += 1,
                other => panic!("unexpected record {other:?}"),
            }
        }
        assert_eq!((ones, twos), (10, 10));

        task_one.await.expect("task one")?;
        task_two.await.expect("task two")?;
        Ok(())
    }

    #[tokio::test]
    async fn reinjected_record_is_rejected_as_replay() -> Result<()> {
        let (initiator_crypto, responder_crypto) = session_pair();
        let (a, b) = tokio::io::duplex(MAX_RECORD);
        let mut alice = PeerChannel::new(a, initiator_crypto);

        // The eavesdropper sits on the raw stream, captures alice's
        // sealed record and feeds it to bob twice.
        let mut tap = crate::framing::FramedStream::new(b);
        alice.send(b"pay mallory 100").await?;
        let captured = tap.read_record().await?;

        let (c, d) = tokio::io::duplex(MAX_RECORD);
        let mut injector = crate::framing::FramedStream::new(c);
        let mut bob = PeerChannel::new(d, responder_crypto);

        injector.write_record(&captured).await?;
        assert_eq!(bob.recv().await?, b"pay mallory 100");

        injector.write_record(&captured).await?;
        assert!(matches!(
            bob.recv().await,
            Err(HushlinkError::ReplayedOrReordered {
                counter: 1,
                last_seen: 1
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_crypto_fails_to_open() {
        let (initiator_crypto, _) = session_pair();
        let stranger = crypto_cell(SessionCrypto::derive(
            b"some other secret",
            SessionRole::Responder,
        ));

        let (a, b) = tokio::io::duplex(MAX_RECORD);
        let mut alice = PeerChannel::new(a, initiator_crypto);
        let mut mallory = PeerChannel::new(b, stranger);

        alice.send(b"confidential").await.expect("send");
        assert!(matches!(
            mallory.recv().await,
            Err(HushlinkError::AuthFailed)
        ));
    }

    #[tokio::test]
    async fn plain_channel_round_trip() -> Result<()> {
        let (a, b) = tokio::io::duplex(MAX_RECORD);
        let mut left = PlainChannel::new(a);
        let mut right = PlainChannel::new(b);

        left.send(b"manager command").await?;
        assert_eq!(right.recv().await?, b"manager command");
        Ok(())
    }

    #[tokio::test]
    async fn plain_writer_handle_pushes_concurrently() -> Result<()> {
        let (a, b) = tokio::io::duplex(MAX_RECORD);
        let left = PlainChannel::new(a);
        let mut right = PlainChannel::new(b);

        let writer = left.writer();
        writer.lock().await.write_record(b"pumped").await?;
        assert_eq!(right.recv().await?, b"pumped");
        Ok(())
    }
}
