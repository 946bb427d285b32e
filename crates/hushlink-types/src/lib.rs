//! Core shared types for the hushlink peer-to-peer messaging node.
//!
//! This crate defines the types every other crate in the workspace
//! agrees on: the wire-visible profile and peer descriptors, the file
//! chunk carried by `FILE` commands, and the central [`HushlinkError`]
//! enum. No crypto and no I/O happen here.

pub mod config;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Public self-description a node shares with its peers.
///
/// Sent as the body of `REFO` responses and as the multicast beacon
/// payload. The address is the node's own `ip:port` listen endpoint.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Display name chosen by the operator.
    pub login: String,
    /// Listen endpoint in `ip:port` form.
    pub address: String,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.login, self.address)
    }
}

// ---------------------------------------------------------------------------
// PeerInfo
// ---------------------------------------------------------------------------

/// What a node knows about another peer, independent of any live
/// session.
///
/// This is the value type of the gossiped peer map (`RELI` bodies) and
/// of the on-disk peer file. Session state never leaves the process,
/// so only these two fields exist on the wire.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Last login the peer announced for itself.
    pub login: String,
    /// Last `ip:port` the peer was reached at.
    pub address: String,
}

// ---------------------------------------------------------------------------
// FileChunk
// ---------------------------------------------------------------------------

/// One piece of a file in transit, the body of a peer-to-peer `FILE`
/// command.
///
/// The sender splits a file into chunks that fit inside a single
/// record after encryption; the receiver appends `data` to a local
/// file named after `name`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Original file name as given by the sender. Receivers must
    /// treat this as untrusted and strip any path components.
    pub name: String,
    /// Raw chunk bytes.
    #[serde(with = "serde_bytes_compat")]
    pub data: Vec<u8>,
}

/// Serializes `Vec<u8>` as a CBOR/JSON byte string instead of an
/// integer sequence.
mod serde_bytes_compat {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_bytes(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        struct BytesVisitor;

        impl<'de> serde::de::Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
                Ok(v)
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Vec<u8>, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element()? {
                    out.push(byte);
                }
                Ok(out)
            }
        }

        de.deserialize_byte_buf(BytesVisitor)
    }
}

// ---------------------------------------------------------------------------
// ErrorClass
// ---------------------------------------------------------------------------

/// Coarse failure category driving session policy.
///
/// The node reacts to a failure by class, not by variant:
///
/// - `Io` / `Framing` — terminate the affected session, log, leave
///   other sessions alone.
/// - `Handshake` — abort the handshake, drop the connection, create
///   no peer record.
/// - `Crypto` — terminate the session **and clear its crypto state**;
///   the peer record survives for a future re-handshake.
/// - `Dispatch` — report `REER` to the counterparty and keep looping.
/// - `Fatal` — exit the process with a diagnostic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    Io,
    Framing,
    Handshake,
    Crypto,
    Dispatch,
    Fatal,
}

// ---------------------------------------------------------------------------
// HushlinkError
// ---------------------------------------------------------------------------

/// Central error type for the hushlink workspace.
///
/// Every crate converts its failures into variants of this enum. The
/// protocol-level variants are deliberately fine-grained: the secure
/// channel must distinguish, e.g., a forged tag from a replayed
/// counter for diagnostics, even though both kill the session.
#[derive(Debug, Error)]
pub enum HushlinkError {
    /// Underlying stream or file I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A record length prefix exceeded the framing bound.
    #[error("record of {len} bytes exceeds the maximum record size")]
    OversizedRecord {
        /// The offending length prefix.
        len: u32,
    },

    /// The stream ended in the middle of a length prefix or payload.
    #[error("stream truncated mid-record")]
    Truncated,

    /// Group generation exhausted its attempt budget.
    #[error("diffie-hellman parameter generation failed: {stage}")]
    ParamGenFailed {
        /// Which search ran out of candidates.
        stage: &'static str,
    },

    /// Counterparty's subgroup order is too small.
    #[error("weak group from counterparty: q is {bits} bits, need at least 256")]
    WeakQ {
        /// Observed bit length of `q`.
        bits: u64,
    },

    /// Counterparty's modulus is too small.
    #[error("weak group from counterparty: p is {bits} bits, need at least 2048")]
    WeakP {
        /// Observed bit length of `p`.
        bits: u64,
    },

    /// Counterparty's generator does not have order `q`.
    #[error("weak group from counterparty: g^q mod p is not 1")]
    WrongG,

    /// Counterparty's halfkey lies outside the prime-order subgroup.
    #[error("weak halfkey from counterparty")]
    WeakHalfkey,

    /// A handshake message failed to parse.
    #[error("malformed handshake message: {reason}")]
    HandshakeParse {
        /// What failed to parse.
        reason: String,
    },

    /// The transport failed while the handshake was in flight.
    #[error("i/o error during key exchange: {reason}")]
    HandshakeIo {
        /// The underlying failure.
        reason: String,
    },

    /// A directional record counter reached its maximum.
    #[error("record counter overflow")]
    CounterOverflow,

    /// An encrypted record is too small to contain IV and tag.
    #[error("encrypted record of {len} bytes is too short")]
    RecordTooShort {
        /// Observed record length.
        len: usize,
    },

    /// The record's authentication tag did not verify.
    #[error("record authentication failed")]
    AuthFailed,

    /// A low-level cryptographic operation failed.
    #[error("crypto error: {reason}")]
    Crypto {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// The record's embedded counter did not advance.
    #[error("record counter {counter} not above {last_seen}: replayed or reordered")]
    ReplayedOrReordered {
        /// Counter embedded in the rejected record.
        counter: u32,
        /// Highest counter accepted so far.
        last_seen: u32,
    },

    /// A command record was shorter than one opcode.
    #[error("command record of {len} bytes is shorter than an opcode")]
    ShortCommand {
        /// Observed record length.
        len: usize,
    },

    /// No handler is registered for the received opcode.
    #[error("command {opcode} is not supported")]
    UnknownOpcode {
        /// Printable form of the 4-byte opcode.
        opcode: String,
    },

    /// A structured command body failed to encode or decode.
    #[error("wire format error: {reason}")]
    WireFormat {
        /// Human-readable description of the codec failure.
        reason: String,
    },

    /// A handler-level peer operation failed.
    #[error("peer error: {reason}")]
    Peer {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// A configuration value is missing or invalid.
    #[error("config error: {reason}")]
    Config {
        /// Human-readable description of the configuration problem.
        reason: String,
    },
}

impl HushlinkError {
    /// Maps this error to its policy class (see [`ErrorClass`]).
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) => ErrorClass::Io,
            Self::OversizedRecord { .. } | Self::Truncated => ErrorClass::Framing,
            Self::WeakQ { .. }
            | Self::WeakP { .. }
            | Self::WrongG
            | Self::WeakHalfkey
            | Self::HandshakeParse { .. }
            | Self::HandshakeIo { .. } => ErrorClass::Handshake,
            Self::Crypto { .. }
            | Self::CounterOverflow
            | Self::RecordTooShort { .. }
            | Self::AuthFailed
            | Self::ReplayedOrReordered { .. } => ErrorClass::Crypto,
            Self::ShortCommand { .. }
            | Self::UnknownOpcode { .. }
            | Self::WireFormat { .. }
            | Self::Peer { .. } => ErrorClass::Dispatch,
            Self::ParamGenFailed { .. } | Self::Config { .. } => ErrorClass::Fatal,
        }
    }
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`HushlinkError`].
pub type Result<T> = std::result::Result<T, HushlinkError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_failures_share_a_class() {
        let errors = [
            HushlinkError::CounterOverflow,
            HushlinkError::RecordTooShort { len: 10 },
            HushlinkError::AuthFailed,
            HushlinkError::ReplayedOrReordered {
                counter: 3,
                last_seen: 7,
            },
        ];
        for e in errors {
            assert_eq!(e.class(), ErrorClass::Crypto, "{e}");
        }
    }

    #[test]
    fn handshake_failures_share_a_class() {
        let errors = [
            HushlinkError::WeakQ { bits: 255 },
            HushlinkError::WeakP { bits: 2047 },
            HushlinkError::WrongG,
            HushlinkError::WeakHalfkey,
        ];
        for e in errors {
            assert_eq!(e.class(), ErrorClass::Handshake, "{e}");
        }
    }

    #[test]
    fn dispatch_failures_keep_the_loop_alive() {
        let e = HushlinkError::UnknownOpcode {
            opcode: "SEEK".into(),
        };
        assert_eq!(e.class(), ErrorClass::Dispatch);
        assert_eq!(e.to_string(), "command SEEK is not supported");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "boom");
        let e: HushlinkError = io.into();
        assert_eq!(e.class(), ErrorClass::Io);
    }

    #[test]
    fn profile_displays_login_and_address() {
        let p = Profile {
            login: "alice".into(),
            address: "10.0.0.5:4242".into(),
        };
        assert_eq!(p.to_string(), "alice@10.0.0.5:4242");
    }
}
