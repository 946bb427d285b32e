//! Wire protocol for the hushlink peer-to-peer messaging node.
//!
//! # Architecture
//!
//! - [`framing`] — length-prefixed records over any byte stream
//! - [`wire`] — CBOR encoding for structured command bodies
//! - [`handshake`] — Diffie–Hellman key agreement over a framed stream
//! - [`channel`] — encrypted and plaintext record channels
//! - [`command`] — opcode dispatch tables and the command loop
//!
//! The layering mirrors the wire itself: a TCP stream carries framed
//! records; during the handshake those records are key-agreement
//! messages in the clear; afterwards every record is a sealed
//! ciphertext whose plaintext is a 4-byte opcode plus body.

pub mod channel;
pub mod command;
pub mod framing;
pub mod handshake;
pub mod wire;
