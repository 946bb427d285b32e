//! Miller–Rabin probabilistic primality testing and prime sampling.
//!
//! `num-bigint` ships no primality test, so the group search in
//! [`crate::dh`] brings its own: a fixed set of small deterministic
//! witnesses followed by a configurable number of uniformly random
//! witnesses. With 64 random rounds the error probability is below
//! 4^-64 per composite, far past the point where the RNG itself is
//! the weaker link.

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::rngs::OsRng;

/// Small witnesses tried before any random rounds.
///
/// These alone are a deterministic test for every `n < 3.1 × 10^23`,
/// so random rounds only ever matter for the sizes the group search
/// actually works with.
const SMALL_WITNESSES: [u8; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

/// Candidates examined per [`sample_prime`] call before giving up.
const SAMPLE_ATTEMPTS: usize = 100_000;

/// Miller–Rabin probable-prime test.
///
/// Returns `true` if `n` passes all [`SMALL_WITNESSES`] plus `rounds`
/// random witnesses drawn from `[2, n − 2]`. Composite inputs slip
/// through with probability at most `4^-rounds`.
pub fn is_probable_prime(n: &BigUint, rounds: usize) -> bool {
    let two = BigUint::from(2u8);
    let three = BigUint::from(3u8);

    if n < &two {
        return false;
    }
    if n == &two || n == &three {
        return true;
    }
    if (n % &two).is_zero() {
        return false;
    }

    // Factor n − 1 as d · 2^s with d odd.
    let n_minus_one = n - BigUint::one();
    let mut d = n_minus_one.clone();
    let mut s = 0u32;
    while (&d % &two).is_zero() {
        d >>= 1;
        s += 1;
    }

    for &w in &SMALL_WITNESSES {
        let a = BigUint::from(w);
        if a >= n_minus_one {
            continue;
        }
        if is_witness(n, &d, s, &a) {
            return false;
        }
    }

    let n_minus_three = n - &three;
    let mut rng = OsRng;
    for _ in 0..rounds {
        // Uniform in [2, n − 2].
        let a = rng.gen_biguint_below(&n_minus_three) + &two;
        if is_witness(n, &d, s, &a) {
            return false;
        }
    }

    true
}

/// Returns `true` if `a` proves `n` composite, given `n − 1 = d · 2^s`.
fn is_witness(n: &BigUint, d: &BigUint, s: u32, a: &BigUint) -> bool {
    let one = BigUint::one();
    let n_minus_one = n - &one;

    let mut x = a.modpow(d, n);
    if x == one || x == n_minus_one {
        return false;
    }
    for _ in 1..s {
        x = (&x * &x) % n;
        if x == n_minus_one {
            return false;
        }
    }
    true
}

/// Samples a random integer with **exactly** `bits` significant bits.
pub fn sample_exact_bits(bits: u64) -> BigUint {
    let mut rng = OsRng;
    let mut candidate = rng.gen_biguint(bits);
    candidate.set_bit(bits - 1, true);
    candidate
}

/// Samples a probable prime with exactly `bits` significant bits, or
/// `None` once the attempt budget is exhausted.
///
/// Candidates are forced odd with the top bit set, so every returned
/// prime has the requested bit length.
pub fn sample_prime(bits: u64, rounds: usize) -> Option<BigUint> {
    for _ in 0..SAMPLE_ATTEMPTS {
        let mut candidate = sample_exact_bits(bits);
        candidate.set_bit(0, true);
        if is_probable_prime(&candidate, rounds) {
            return Some(candidate);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_primes_accepted() {
        for p in [2u32, 3, 5, 7, 11, 13, 97, 7919] {
            assert!(is_probable_prime(&BigUint::from(p), 8), "{p}");
        }
    }

    #[test]
    fn small_composites_rejected() {
        for c in [0u32, 1, 4, 9, 15, 91, 561, 7917] {
            assert!(!is_probable_prime(&BigUint::from(c), 8), "{c}");
        }
    }

    #[test]
    fn carmichael_numbers_rejected() {
        // Fermat pseudoprimes to many bases; Miller–Rabin must not be fooled.
        for c in [561u64, 1105, 1729, 2465, 2821, 6601, 8911] {
            assert!(!is_probable_prime(&BigUint::from(c), 8), "{c}");
        }
    }

    #[test]
    fn known_large_prime_accepted() {
        // 2^127 − 1, a Mersenne prime.
        let p = (BigUint::one() << 127u32) - BigUint::one();
        assert!(is_probable_prime(&p, 16));
    }

    #[test]
    fn known_large_composite_rejected() {
        // 2^128 + 1 = 59649589127497217 × 5704689200685129054721.
        let c = (BigUint::one() << 128u32) + BigUint::one();
        assert!(!is_probable_prime(&c, 16));
    }

    #[test]
    fn sampled_prime_has_exact_bit_length() {
        let p = sample_prime(64, 16).expect("64-bit prime search must succeed");
        assert_eq!(p.bits(), 64);
        assert!(is_probable_prime(&p, 16));
    }

    #[test]
    fn exact_bits_sets_top_bit() {
        for _ in 0..32 {
            assert_eq!(sample_exact_bits(96).bits(), 96);
        }
    }
}
