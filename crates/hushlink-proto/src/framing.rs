//! Length-prefixed record transport.
//!
//! Every record on a hushlink stream is a 4-byte little-endian length
//! followed by that many payload bytes, capped at [`MAX_RECORD`]. The
//! framing layer is oblivious to content — handshake messages, sealed
//! ciphertexts and plaintext manager commands all ride the same
//! format.
//!
//! Reads use read-exact semantics: a stream that ends mid-prefix or
//! mid-payload fails with `Truncated`, never with a silently short
//! record. An oversized length prefix is rejected **before** the body
//! is allocated, so a hostile peer cannot make the node reserve 4 GiB
//! with five bytes of input.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use hushlink_types::{HushlinkError, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum payload bytes in a single record.
pub const MAX_RECORD: usize = 65_536;

/// Bytes in the little-endian length prefix.
pub const LEN_PREFIX: usize = 4;

// ---------------------------------------------------------------------------
// Free functions over raw halves
// ---------------------------------------------------------------------------

/// Reads one record from `reader`.
pub async fn read_record<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LEN_PREFIX];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(map_eof)?;

    let len = u32::from_le_bytes(prefix);
    if len as usize > MAX_RECORD {
        return Err(HushlinkError::OversizedRecord { len });
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(map_eof)?;

    Ok(payload)
}

/// Writes one record to `writer`. All-or-error: a failed write leaves
/// no usable stream behind.
pub async fn write_record<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_RECORD {
        return Err(HushlinkError::OversizedRecord {
            len: payload.len() as u32,
        });
    }

    let prefix = (payload.len() as u32).to_le_bytes();
    writer.write_all(&prefix).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Maps an unexpected EOF to the protocol's `Truncated` error; other
/// I/O failures pass through.
fn map_eof(e: std::io::Error) -> HushlinkError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        HushlinkError::Truncated
    } else {
        HushlinkError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Datagram helpers
// ---------------------------------------------------------------------------

/// Encodes one record as a standalone datagram (length prefix plus
/// payload). Used by the multicast beacon, which speaks the same
/// format over UDP.
pub fn encode_datagram(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_RECORD {
        return Err(HushlinkError::OversizedRecord {
            len: payload.len() as u32,
        });
    }

    let mut datagram = Vec::with_capacity(LEN_PREFIX + payload.len());
    datagram.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    datagram.extend_from_slice(payload);
    Ok(datagram)
}

/// Decodes a datagram produced by [`encode_datagram`].
pub fn decode_datagram(datagram: &[u8]) -> Result<&[u8]> {
    if datagram.len() < LEN_PREFIX {
        return Err(HushlinkError::Truncated);
    }

    let mut prefix = [0u8; LEN_PREFIX];
    prefix.copy_from_slice(&datagram[..LEN_PREFIX]);
    let len = u32::from_le_bytes(prefix);

    if len as usize > MAX_RECORD {
        return Err(HushlinkError::OversizedRecord { len });
    }
    if datagram.len() - LEN_PREFIX < len as usize {
        return Err(HushlinkError::Truncated);
    }

    Ok(&datagram[LEN_PREFIX..LEN_PREFIX + len as usize])
}

// ---------------------------------------------------------------------------
// FramedStream
// ---------------------------------------------------------------------------

/// A whole bidirectional stream with record framing.
///
/// Used where one task owns both directions — the handshake and
/// simple tests. Long-lived sessions split into a [`FramedReader`]
/// and [`FramedWriter`] instead.
pub struct FramedStream<S> {
    inner: S,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a stream.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Reads one record.
    pub async fn read_record(&mut self) -> Result<Vec<u8>> {
        read_record(&mut self.inner).await
    }

    /// Writes one record.
    pub async fn write_record(&mut self, payload: &[u8]) -> Result<()> {
        write_record(&mut self.inner, payload).await
    }

    /// Unwraps the underlying stream, e.g. to split it after the
    /// handshake completes.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

// ---------------------------------------------------------------------------
// FramedReader / FramedWriter
// ---------------------------------------------------------------------------

/// Record framing over a read half.
pub struct FramedReader<R> {
    inner: R,
}

impl<R> FramedReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wraps a read half.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads one record.
    pub async fn read_record(&mut self) -> Result<Vec<u8>> {
        read_record(&mut self.inner).await
    }
}

/// Record framing over a write half.
pub struct FramedWriter<W> {
    inner: W,
}

impl<W> FramedWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Wraps a write half.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes one record.
    pub async fn write_record(&mut self, payload: &[u8]) -> Result<()> {
        write_record(&mut self.inner, payload).await
    }

    /// Shuts down the write direction of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
