//! Cryptographic primitives for the hushlink messaging node.
//!
//! This crate is the **sole** location for all cryptographic
//! operations:
//!
//! - **Schnorr-group generation and validation** for the
//!   Diffie–Hellman key agreement (`dh`)
//! - **Probabilistic primality testing** backing the group search
//!   (`prime`)
//! - **Per-session symmetric state** — AES-256-CTR encryption,
//!   HMAC-SHA-256 authentication, and replay-resistant counters
//!   (`session`)
//!
//! No other crate in the workspace performs raw crypto operations.

pub mod dh;
pub mod prime;
pub mod session;
