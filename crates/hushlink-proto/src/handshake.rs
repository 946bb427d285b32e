//! Diffie–Hellman handshake over a framed stream.
//!
//! Two complementary roles agree on a shared secret in three framed
//! records:
//!
//! ```text
//! offer side                         answer side
//! ──────────                        ───────────
//! group (g, q, p)  ───────────────▶  validate group
//! halfkey g^x      ───────────────▶  validate halfkey
//! validate halfkey ◀───────────────  halfkey g^y
//! secret = (g^y)^x                   secret = (g^x)^y
//! ```
//!
//! The **offer** side owns the group and speaks first; in hushlink
//! that is the node which *accepted* the TCP connection (it already
//! has generated parameters on hand). The **answer** side — the
//! dialer — validates everything it receives before doing any
//! arithmetic with it.
//!
//! There is no identity authentication here: the handshake is
//! anonymous DH, and first contact with a peer is trusted on first
//! use. What the validation buys is confinement — a counterparty
//! cannot push the secret into a small subgroup or hand over a toy
//! modulus.

use num_bigint::BigUint;
use tokio::io::{AsyncRead, AsyncWrite};

use hushlink_crypto::dh::{DhParams, SharedSecret};
use hushlink_types::{HushlinkError, Result};

use crate::framing::FramedStream;
use crate::wire;

/// Runs the offer role: send the group, send our halfkey, receive and
/// validate theirs.
///
/// Returns the shared secret bytes (big-endian, leading zeros
/// trimmed — see [`SharedSecret`]).
pub async fn offer<S>(framed: &mut FramedStream<S>, params: &DhParams) -> Result<SharedSecret>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let group_msg = wire::to_cbor(params)?;
    framed.write_record(&group_msg).await.map_err(as_handshake_io)?;

    let exponent = params.sample_exponent();
    let ours = params.halfkey(&exponent);
    framed
        .write_record(ours.to_str_radix(10).as_bytes())
        .await
        .map_err(as_handshake_io)?;

    let buf = framed.read_record().await.map_err(as_handshake_io)?;
    let theirs = parse_halfkey(&buf)?;
    params.validate_halfkey(&theirs)?;

    Ok(params.shared_secret(&theirs, &exponent))
}

/// Runs the answer role: receive and validate the group, receive and
/// validate their halfkey, send ours.
///
/// Returns the validated group alongside the secret; the caller keeps
/// it for the session's lifetime.
pub async fn answer<S>(framed: &mut FramedStream<S>) -> Result<(DhParams, SharedSecret)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let buf = framed.read_record().await.map_err(as_handshake_io)?;
    let params: DhParams = wire::from_cbor(&buf).map_err(|_| HushlinkError::HandshakeParse {
        reason: "group message failed to decode".into(),
    })?;
    params.validate()?;

    let buf = framed.read_record().await.map_err(as_handshake_io)?;
    let theirs = parse_halfkey(&buf)?;
    params.validate_halfkey(&theirs)?;

    let exponent = params.sample_exponent();
    let ours = params.halfkey(&exponent);
    framed
        .write_record(ours.to_str_radix(10).as_bytes())
        .await
        .map_err(as_handshake_io)?;

    let secret = params.shared_secret(&theirs, &exponent);
    Ok((params, secret))
}

/// Parses a halfkey record: decimal text, nothing else.
fn parse_halfkey(buf: &[u8]) -> Result<BigUint> {
    BigUint::parse_bytes(buf, 10).ok_or(HushlinkError::HandshakeParse {
        reason: "halfkey is not decimal text".into(),
    })
}

/// Wraps a framing-layer failure into the handshake error class.
fn as_handshake_io(e: HushlinkError) -> HushlinkError {
    HushlinkError::HandshakeIo {
        reason: e.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;

    use hushlink_crypto::dh::fixtures::test_group;

    use crate::framing::MAX_RECORD;

    fn duplex_pair() -> (
        FramedStream<tokio::io::DuplexStream>,
        FramedStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(MAX_RECORD);
        (FramedStream::new(a), FramedStream::new(b))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn both_roles_agree_on_the_secret() {
        let (mut offer_side, mut answer_side) = duplex_pair();
        let group = test_group();

        let offer_task =
            tokio::spawn(async move { offer(&mut offer_side, &group).await });
        let (received_group, answer_secret) =
            answer(&mut answer_side).await.expect("answer role");
        let offer_secret = offer_task
            .await
            .expect("offer task")
            .expect("offer role");

        assert_eq!(offer_secret.as_bytes(), answer_secret.as_bytes());
        assert!(!offer_secret.as_bytes().is_empty());
        assert_eq!(received_group, test_group());
    }

    #[tokio::test]
    async fn answer_rejects_short_q() {
        let (mut attacker, mut answer_side) = duplex_pair();
        let mut group = test_group();
        group.q = &group.q >> 1u32; // 255 bits

        let msg = wire::to_cbor(&group).expect("encode");
        attacker.write_record(&msg).await.expect("write");

        assert!(matches!(
            answer(&mut answer_side).await,
            Err(HushlinkError::WeakQ { bits: 255 })
        ));
    }

    #[tokio::test]
    async fn answer_rejects_short_p() {
        let (mut attacker, mut answer_side) = duplex_pair();
        let mut group = test_group();
        group.p = &group.p >> 1u32; // 2047 bits

        let msg = wire::to_cbor(&group).expect("encode");
        attacker.write_record(&msg).await.expect("write");

        assert!(matches!(
            answer(&mut answer_side).await,
            Err(HushlinkError::WeakP { bits: 2047 })
        ));
    }

    #[tokio::test]
    async fn answer_rejects_generator_of_wrong_order() {
        let (mut attacker, mut answer_side) = duplex_pair();
        let mut group = test_group();
        group.g = BigUint::from(2u8);

        let msg = wire::to_cbor(&group).expect("encode");
        attacker.write_record(&msg).await.expect("write");

        assert!(matches!(
            answer(&mut answer_side).await,
            Err(HushlinkError::WrongG)
        ));
    }

    #[tokio::test]
    async fn answer_rejects_garbage_group_message() {
        let (mut attacker, mut answer_side) = duplex_pair();
        attacker
            .write_record(b"not a group message")
            .await
            .expect("write");

        assert!(matches!(
            answer(&mut answer_side).await,
            Err(HushlinkError::HandshakeParse { .. })
        ));
    }

    #[tokio::test]
    async fn answer_rejects_halfkey_outside_subgroup() {
        let (mut attacker, mut answer_side) = duplex_pair();
        let group = test_group();

        let msg = wire::to_cbor(&group).expect("encode");
        attacker.write_record(&msg).await.expect("write");
        // 2 has order dividing N·q, not q.
        attacker.write_record(b"2").await.expect("write");

        assert!(matches!(
            answer(&mut answer_side).await,
            Err(HushlinkError::WeakHalfkey)
        ));
    }

    #[tokio::test]
    async fn answer_rejects_textually_invalid_halfkey() {
        let (mut attacker, mut answer_side) = duplex_pair();
        let group = test_group();

        let msg = wire::to_cbor(&group).expect("encode");
        attacker.write_record(&msg).await.expect("write");
        attacker.write_record(b"0x1234beef").await.expect("write");

        assert!(matches!(
            answer(&mut answer_side).await,
            Err(HushlinkError::HandshakeParse { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn offer_rejects_halfkey_outside_subgroup() {
        let (mut offer_side, mut attacker) = duplex_pair();
        let group = test_group();

        let offer_task =
            tokio::spawn(async move { offer(&mut offer_side, &group).await });

        // Drain the two legitimate records, answer with a bad halfkey.
        attacker.read_record().await.expect("group message");
        attacker.read_record().await.expect("their halfkey");
        attacker.write_record(b"2").await.expect("write");

        assert!(matches!(
            offer_task.await.expect("offer task"),
            Err(HushlinkError::WeakHalfkey)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broken_transport_reports_handshake_io() {
        let (mut offer_side, answer_side) = duplex_pair();
        let group = test_group();

        // The counterparty vanishes before answering.
        drop(answer_side);

        let result = offer(&mut offer_side, &group).await;
        assert!(matches!(result, Err(HushlinkError::HandshakeIo { .. })));
    }
}
