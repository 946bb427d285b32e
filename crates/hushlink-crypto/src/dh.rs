//! Schnorr-group Diffie–Hellman parameters and key agreement math.
//!
//! A node owns one [`DhParams`] instance — a prime modulus `p`, a
//! 256-bit prime subgroup order `q` with `p = N·q + 1`, and a
//! generator `g` of multiplicative order exactly `q` — shared by
//! every session it initiates and rotated on a fixed cadence by the
//! daemon. Counterparty-supplied groups and halfkeys are **validated
//! before any arithmetic touches them**: an attacker who can pick the
//! group or push a halfkey outside the prime-order subgroup could
//! otherwise confine the shared secret to a tiny keyspace.

use num_bigint::{BigUint, RandBigInt};
use num_traits::One;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use hushlink_types::{HushlinkError, Result};

use crate::prime;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Exact bit length of the subgroup order `q`.
pub const Q_BITS: u64 = 256;

/// Exact bit length of the cofactor `N` in `p = N·q + 1`.
pub const COFACTOR_BITS: u64 = 1792;

/// Minimum accepted bit length for a counterparty's modulus.
pub const P_MIN_BITS: u64 = 2048;

/// Candidates examined per search phase before `ParamGenFailed`.
const SEARCH_ATTEMPTS: usize = 10_000;

/// Miller–Rabin rounds for every primality decision in this module.
const PRIME_TEST_ROUNDS: usize = 64;

// ---------------------------------------------------------------------------
// DhParams
// ---------------------------------------------------------------------------

/// A Schnorr group `(g, q, p)`.
///
/// Serializes with the big integers as decimal strings, the canonical
/// text form used both on the wire (handshake group record) and in
/// the on-disk DH state file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DhParams {
    /// Generator of the order-`q` subgroup of `(Z/pZ)*`.
    #[serde(with = "decimal")]
    pub g: BigUint,
    /// Prime order of the subgroup generated by `g`.
    #[serde(with = "decimal")]
    pub q: BigUint,
    /// Prime modulus.
    #[serde(with = "decimal")]
    pub p: BigUint,
}

/// Decimal-string serde representation for [`BigUint`] fields.
mod decimal {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &BigUint, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&v.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(de)?;
        s.parse()
            .map_err(|_| de::Error::custom("invalid decimal big integer"))
    }
}

impl DhParams {
    /// Generates a fresh group.
    ///
    /// 1. Sample a prime `q` of exactly [`Q_BITS`] bits.
    /// 2. Search for a 1792-bit cofactor `N` with `p = N·q + 1` prime.
    /// 3. Search for `g = a^N mod p` with `g ≠ 1` and `g^q ≡ 1 (mod p)`
    ///    (any such `g` has order exactly `q`, since `q` is prime).
    ///
    /// # Errors
    ///
    /// [`HushlinkError::ParamGenFailed`] when a search phase exhausts
    /// its candidate budget. The caller may simply retry; with these
    /// sizes exhaustion is a small-percentage event, not a defect.
    pub fn generate() -> Result<Self> {
        let q = prime::sample_prime(Q_BITS, PRIME_TEST_ROUNDS).ok_or(
            HushlinkError::ParamGenFailed {
                stage: "subgroup order q",
            },
        )?;

        let (cofactor, p) = Self::search_modulus(&q)?;
        let g = Self::search_generator(&cofactor, &p, &q)?;

        Ok(Self { g, q, p })
    }

    /// Searches for `N` such that `p = N·q + 1` is prime.
    fn search_modulus(q: &BigUint) -> Result<(BigUint, BigUint)> {
        for _ in 0..SEARCH_ATTEMPTS {
            let cofactor = prime::sample_exact_bits(COFACTOR_BITS);
            let p = &cofactor * q + BigUint::one();
            if prime::is_probable_prime(&p, PRIME_TEST_ROUNDS) {
                return Ok((cofactor, p));
            }
        }
        Err(HushlinkError::ParamGenFailed { stage: "modulus p" })
    }

    /// Searches for a generator of the order-`q` subgroup.
    ///
    /// `a^N` lands in the subgroup for every `a`; the search only has
    /// to dodge the degenerate `g = 1` (when `a` happens to be an
    /// N-th root of unity) and re-checks the order explicitly.
    fn search_generator(cofactor: &BigUint, p: &BigUint, q: &BigUint) -> Result<BigUint> {
        let mut rng = OsRng;
        for _ in 0..SEARCH_ATTEMPTS {
            let a = rng.gen_biguint_below(p);
            let g = a.modpow(cofactor, p);
            if !g.is_one() && g.modpow(q, p).is_one() {
                return Ok(g);
            }
        }
        Err(HushlinkError::ParamGenFailed {
            stage: "generator g",
        })
    }

    /// Validates a counterparty-supplied group.
    ///
    /// Checks, in order: `q` at least 256 bits, `p` at least 2048
    /// bits, `g^q ≡ 1 (mod p)`. Must be called before any arithmetic
    /// derived from the counterparty's values.
    pub fn validate(&self) -> Result<()> {
        if self.q.bits() < Q_BITS {
            return Err(HushlinkError::WeakQ {
                bits: self.q.bits(),
            });
        }

        if self.p.bits() < P_MIN_BITS {
            return Err(HushlinkError::WeakP {
                bits: self.p.bits(),
            });
        }

        if !self.g.modpow(&self.q, &self.p).is_one() {
            return Err(HushlinkError::WrongG);
        }

        Ok(())
    }

    /// Validates that a counterparty's halfkey lies in the prime-order
    /// subgroup (`y^q ≡ 1 (mod p)`), defeating small-subgroup attacks.
    pub fn validate_halfkey(&self, halfkey: &BigUint) -> Result<()> {
        if halfkey.modpow(&self.q, &self.p).is_one() {
            Ok(())
        } else {
            Err(HushlinkError::WeakHalfkey)
        }
    }

    /// Samples a private exponent uniformly from `[0, q)`.
    pub fn sample_exponent(&self) -> BigUint {
        OsRng.gen_biguint_below(&self.q)
    }

    /// Computes this side's public contribution `g^exponent mod p`.
    pub fn halfkey(&self, exponent: &BigUint) -> BigUint {
        self.g.modpow(exponent, &self.p)
    }

    /// Combines the counterparty's halfkey with our exponent into the
    /// shared secret `halfkey^exponent mod p`.
    ///
    /// The halfkey must already have passed [`Self::validate_halfkey`].
    pub fn shared_secret(&self, their_halfkey: &BigUint, exponent: &BigUint) -> SharedSecret {
        SharedSecret::from_group_element(their_halfkey.modpow(exponent, &self.p))
    }
}

// ---------------------------------------------------------------------------
// SharedSecret
// ---------------------------------------------------------------------------

/// Raw key agreement output, zeroized on drop.
///
/// The bytes are the **big-endian encoding of `g^{xy} mod p` with
/// leading zero bytes trimmed** — so the length varies by a byte or
/// two between sessions. Deployed nodes feed exactly these bytes into
/// the session KDF, and the quirk is preserved for compatibility.
pub struct SharedSecret {
    bytes: Vec<u8>,
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

// SharedSecret does not implement Clone/Debug to prevent leakage.

impl SharedSecret {
    /// Encodes a group element as trimmed big-endian bytes.
    pub fn from_group_element(element: BigUint) -> Self {
        Self {
            bytes: element.to_bytes_be(),
        }
    }

    /// Returns the secret bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

/// A pre-generated full-size group for tests.
///
/// Generating a fresh 2048-bit group takes tens of seconds, far too
/// slow for the suites that merely need *a* valid group (handshake,
/// channel, node tests). This one was produced by the exact algorithm
/// in [`DhParams::generate`] and passes [`DhParams::validate`].
#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures {
    use super::DhParams;

    const G: &str = "16186073293707061906159703122609145063093723319110562494442864588271392342109524709192006378804221508928434123233886185717336948387463114785661791964649880339582412841571672477429519800134228207846555294911520702177461052390078981199693578581195170019753402935190344963940758592864364164250095406856483699410168064476325229329898166826594025165508479926811046459832081282255297532799565524044003248606166315555227140622211289032614068509938285500730226732977234574530651864373083596274314252231668861362578185884795885402590983347070024688736076254372996598999547338030966098489127890145877946667323960722351765720108";
    const Q: &str = "65868122256382964793784461899733631708330945481461513451316337092782073556079";
    const P: &str = "17577030412910930247547291019287963256093084891677687396475889585277204304547899532372980434446310930090493381310027077472376457424309214805552737132380122310369071539960873920266198600007357496725984716632531689363198984478103404665732846971225769276520168468421383855357427095540225345008222354399370272694997840570885103366327052197332129838612087551584697708073810633005428322910973351954357644205519035619429455416054162291300664128697602289932482407010943486390193915805780078156394300531149997893698228386979529398303742978396432422622427340604375293778065312555273299064518030371056325013945064301376682059081";

    /// Returns the fixture group.
    pub fn test_group() -> DhParams {
        DhParams {
            g: G.parse().expect("fixture g"),
            q: Q.parse().expect("fixture q"),
            p: P.parse().expect("fixture p"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn small_group() -> DhParams {
        // p = 2·11 + 1 = 23, g = 2 has order 11 mod 23.
        DhParams {
            g: BigUint::from(2u8),
            q: BigUint::from(11u8),
            p: BigUint::from(23u8),
        }
    }

    #[test]
    fn fixture_group_validates() {
        let group = fixtures::test_group();
        assert!(group.validate().is_ok());
        assert_eq!(group.q.bits(), 256);
        assert_eq!(group.p.bits(), 2048);
    }

    #[test]
    fn fixture_generator_is_not_one() {
        let group = fixtures::test_group();
        assert!(!group.g.is_one());
        assert!(group.g.modpow(&group.q, &group.p).is_one());
    }

    #[test]
    fn short_q_rejected() {
        let mut group = fixtures::test_group();
        group.q = BigUint::from(3u8) << 253u32; // 255 bits
        assert!(matches!(
            group.validate(),
            Err(HushlinkError::WeakQ { bits: 255 })
        ));
    }

    #[test]
    fn short_p_rejected() {
        let mut group = fixtures::test_group();
        group.p = &group.p >> 1u32; // 2047 bits
        assert!(matches!(
            group.validate(),
            Err(HushlinkError::WeakP { bits: 2047 })
        ));
    }

    #[test]
    fn generator_of_wrong_order_rejected() {
        let mut group = fixtures::test_group();
        // 2 almost surely lies outside the order-q subgroup for this
        // group (its order divides N·q, not q).
        group.g = BigUint::from(2u8);
        assert!(matches!(group.validate(), Err(HushlinkError::WrongG)));
    }

    #[test]
    fn halfkey_outside_subgroup_rejected() {
        let group = fixtures::test_group();
        assert!(matches!(
            group.validate_halfkey(&BigUint::from(2u8)),
            Err(HushlinkError::WeakHalfkey)
        ));
    }

    #[test]
    fn halfkey_in_subgroup_accepted() {
        let group = fixtures::test_group();
        let x = group.sample_exponent();
        let halfkey = group.halfkey(&x);
        assert!(group.validate_halfkey(&halfkey).is_ok());
    }

    #[test]
    fn zero_halfkey_rejected() {
        let group = fixtures::test_group();
        assert!(group
            .validate_halfkey(&BigUint::from(0u8))
            .is_err());
    }

    #[test]
    fn both_sides_agree_on_the_secret() {
        let group = fixtures::test_group();
        let x = group.sample_exponent();
        let y = group.sample_exponent();
        let key_x = group.halfkey(&x);
        let key_y = group.halfkey(&y);

        let secret_a = group.shared_secret(&key_y, &x);
        let secret_b = group.shared_secret(&key_x, &y);
        assert_eq!(secret_a.as_bytes(), secret_b.as_bytes());
        assert!(!secret_a.as_bytes().is_empty());
    }

    #[test]
    fn exponents_stay_below_q() {
        let group = small_group();
        for _ in 0..64 {
            assert!(group.sample_exponent() < group.q);
        }
    }

    #[test]
    fn shared_secret_trims_leading_zeros() {
        let secret = SharedSecret::from_group_element(BigUint::from(0x00_01_02u32));
        assert_eq!(secret.as_bytes(), &[0x01, 0x02]);
    }

    #[test]
    fn decimal_serde_round_trip() {
        let group = small_group();
        let json = serde_json::to_string(&group).expect("serialize");
        assert!(json.contains("\"23\""));
        let back: DhParams = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, group);
    }

    // Full-size generation exercises two prime searches over 2048-bit
    // candidates and runs for tens of seconds. Run explicitly with
    // `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn generated_group_validates() {
        // Candidate budgets are capped per the protocol, so a single
        // run may legitimately exhaust them; retry a couple of times.
        for _ in 0..3 {
            match DhParams::generate() {
                Ok(group) => {
                    group.validate().expect("generated group must validate");
                    assert_eq!(group.q.bits(), Q_BITS);
                    assert!(group.p.bits() >= P_MIN_BITS);
                    assert!(!group.g.is_one());
                    return;
                }
                Err(HushlinkError::ParamGenFailed { .. }) => continue,
                Err(e) => panic!("unexpected failure: {e}"),
            }
        }
        panic!("three consecutive search exhaustions");
    }
}
