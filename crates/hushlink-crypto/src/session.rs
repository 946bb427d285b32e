//! Per-session symmetric state: directional keys, counters, seal/open.
//!
//! Both ends of a session derive the same four keys from the DH
//! shared secret — one AES-256 key and one HMAC-SHA-256 key per
//! direction — then disagree, deliberately, about which pair is for
//! sending. Each sealed record carries a 16-byte IV whose first four
//! bytes are the sender's record counter; the counter uniquifies the
//! CTR keystream **and** gives the receiver its replay check in one
//! field.
//!
//! # Record layout
//!
//! ```text
//! IV[16] ‖ AES-256-CTR( plaintext ‖ HMAC-SHA-256(LE32(1) ‖ plaintext) )
//! └ LE32(counter) ‖ random[12]
//! ```
//!
//! The MAC covers a protocol-version tag, so a record replayed into a
//! hypothetical future protocol version fails authentication instead
//! of parsing differently.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use hushlink_types::{HushlinkError, Result};

/// AES-256 in CTR mode with the full 16-byte block treated as a
/// big-endian counter.
type Aes256Ctr = Ctr128BE<Aes256>;

/// HMAC-SHA-256 type alias.
type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Version tag mixed into every record's MAC.
pub const PROTOCOL_VERSION: u32 = 1;

/// One AES block; the IV prefix of every record.
pub const IV_LEN: usize = 16;

/// HMAC-SHA-256 output length; the tail of every record's plaintext.
pub const TAG_LEN: usize = 32;

/// Sealing adds exactly this many bytes to a plaintext.
pub const SEAL_OVERHEAD: usize = IV_LEN + TAG_LEN;

const LABEL_ENC_AB: &[u8] = b"Enc from A to B";
const LABEL_ENC_BA: &[u8] = b"Enc from B to A";
const LABEL_MAC_AB: &[u8] = b"Auth from A to B";
const LABEL_MAC_BA: &[u8] = b"Auth from B to A";

// ---------------------------------------------------------------------------
// SessionRole
// ---------------------------------------------------------------------------

/// Which end of the key agreement this side played.
///
/// The initiator (the side that dialed and answered the handshake)
/// sends on the A→B keys; the responder's pairs are swapped. The two
/// roles are otherwise symmetric.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionRole {
    /// Dialing side of the connection.
    Initiator,
    /// Accepting side of the connection.
    Responder,
}

// ---------------------------------------------------------------------------
// SessionCrypto
// ---------------------------------------------------------------------------

/// Symmetric state for one live session.
///
/// Owns the four directional keys and the two record counters. Key
/// material is zeroized when the state is dropped or cleared.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionCrypto {
    send_enc: [u8; 32],
    recv_enc: [u8; 32],
    send_mac: [u8; 32],
    recv_mac: [u8; 32],
    send_ctr: u32,
    recv_ctr: u32,
}

// SessionCrypto does not implement Clone/Debug to prevent leakage.

impl SessionCrypto {
    /// Derives directional session state from a DH shared secret.
    ///
    /// Each key is `SHA-256(SHA-256(secret ‖ label))` for the four
    /// direction labels. Both sides call this with the same secret;
    /// the role decides which derived pair becomes the send side.
    /// Counters start at zero.
    pub fn derive(secret: &[u8], role: SessionRole) -> Self {
        let mut enc_ab = kdf(secret, LABEL_ENC_AB);
        let mut enc_ba = kdf(secret, LABEL_ENC_BA);
        let mut mac_ab = kdf(secret, LABEL_MAC_AB);
        let mut mac_ba = kdf(secret, LABEL_MAC_BA);

        if role == SessionRole::Responder {
            std::mem::swap(&mut enc_ab, &mut enc_ba);
            std::mem::swap(&mut mac_ab, &mut mac_ba);
        }

        Self {
            send_enc: enc_ab,
            recv_enc: enc_ba,
            send_mac: mac_ab,
            recv_mac: mac_ba,
            send_ctr: 0,
            recv_ctr: 0,
        }
    }

    /// Authenticates and encrypts one plaintext into a wire record.
    ///
    /// # Errors
    ///
    /// [`HushlinkError::CounterOverflow`] once this direction has
    /// sealed `2^32 − 1` records; no record is emitted in that case
    /// and the session must be torn down.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.send_ctr == u32::MAX {
            return Err(HushlinkError::CounterOverflow);
        }
        self.send_ctr += 1;

        let mut iv = [0u8; IV_LEN];
        iv[..4].copy_from_slice(&self.send_ctr.to_le_bytes());
        OsRng.fill_bytes(&mut iv[4..]);

        let tag = compute_tag(&self.send_mac, plaintext)?;

        let mut record = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
        record.extend_from_slice(&iv);
        record.extend_from_slice(plaintext);
        record.extend_from_slice(&tag);

        let mut cipher = Aes256Ctr::new(&self.send_enc.into(), &iv.into());
        cipher.apply_keystream(&mut record[IV_LEN..]);

        Ok(record)
    }

    /// Decrypts and authenticates one wire record.
    ///
    /// The tag is verified in constant time **before** the counter is
    /// inspected; the counter is committed only after both checks, so
    /// a rejected record leaves the receive state untouched.
    ///
    /// # Errors
    ///
    /// - [`HushlinkError::CounterOverflow`] — receive counter pegged.
    /// - [`HushlinkError::RecordTooShort`] — record cannot contain an
    ///   IV and a tag.
    /// - [`HushlinkError::AuthFailed`] — tag mismatch.
    /// - [`HushlinkError::ReplayedOrReordered`] — embedded counter
    ///   does not advance past the last accepted one.
    pub fn open(&mut self, record: &[u8]) -> Result<Vec<u8>> {
        if self.recv_ctr == u32::MAX {
            return Err(HushlinkError::CounterOverflow);
        }
        if record.len() <= SEAL_OVERHEAD {
            return Err(HushlinkError::RecordTooShort { len: record.len() });
        }

        let (iv, body) = record.split_at(IV_LEN);
        let mut iv_block = [0u8; IV_LEN];
        iv_block.copy_from_slice(iv);

        let mut counter_bytes = [0u8; 4];
        counter_bytes.copy_from_slice(&iv[..4]);
        let counter = u32::from_le_bytes(counter_bytes);

        let mut blob = body.to_vec();
        let mut cipher = Aes256Ctr::new(&self.recv_enc.into(), &iv_block.into());
        cipher.apply_keystream(&mut blob);

        let tag_at = blob.len() - TAG_LEN;
        let (plaintext, tag) = blob.split_at(tag_at);
        verify_tag(&self.recv_mac, plaintext, tag)?;

        if counter <= self.recv_ctr {
            return Err(HushlinkError::ReplayedOrReordered {
                counter,
                last_seen: self.recv_ctr,
            });
        }
        self.recv_ctr = counter;

        Ok(plaintext.to_vec())
    }

    /// Records sealed by this side so far.
    pub fn records_sent(&self) -> u32 {
        self.send_ctr
    }

    /// Highest counter accepted from the counterparty so far.
    pub fn records_received(&self) -> u32 {
        self.recv_ctr
    }
}

// ---------------------------------------------------------------------------
// KDF and MAC helpers
// ---------------------------------------------------------------------------

/// `SHA-256(SHA-256(secret ‖ label))`.
fn kdf(secret: &[u8], label: &[u8]) -> [u8; 32] {
    let mut inner = Sha256::new();
    inner.update(secret);
    inner.update(label);
    let once = inner.finalize();
    let twice = Sha256::digest(once);

    let mut key = [0u8; 32];
    key.copy_from_slice(&twice);
    key
}

/// The metadata every record's MAC covers.
fn metadata() -> [u8; 4] {
    PROTOCOL_VERSION.to_le_bytes()
}

/// `HMAC-SHA-256(key, metadata ‖ plaintext)`.
fn compute_tag(key: &[u8; 32], plaintext: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| HushlinkError::Crypto {
        reason: format!("HMAC-SHA-256 key init failed: {e}"),
    })?;
    mac.update(&metadata());
    mac.update(plaintext);

    let mut tag = [0u8; 32];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

/// Constant-time verification of a record tag.
fn verify_tag(key: &[u8; 32], plaintext: &[u8], tag: &[u8]) -> Result<()> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| HushlinkError::Crypto {
        reason: format!("HMAC-SHA-256 key init failed: {e}"),
    })?;
    mac.update(&metadata());
    mac.update(plaintext);
    mac.verify_slice(tag).map_err(|_| HushlinkError::AuthFailed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
