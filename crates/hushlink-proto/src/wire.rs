//! CBOR encoding for structured command bodies.
//!
//! Profiles (`REFO`), peer maps (`RELI`), file chunks (`FILE`) and
//! the handshake group message all serialize through these two
//! helpers. CBOR keeps file chunks binary-clean; the on-disk state
//! files use JSON instead, which is the daemon's concern.

use serde::de::DeserializeOwned;
use serde::Serialize;

use hushlink_types::{HushlinkError, Result};

/// Serializes `value` to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| HushlinkError::WireFormat {
        reason: format!("CBOR serialization failed: {e}"),
    })?;
    Ok(buf)
}

/// Deserializes a CBOR body produced by [`to_cbor`].
pub fn from_cbor<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    ciborium::de::from_reader(data).map_err(|e| HushlinkError::WireFormat {
        reason: format!("CBOR deserialization failed: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
