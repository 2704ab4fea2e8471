//! Client identity and request signatures.
//!
//! Keys are textbook RSA built from primitive modular arithmetic: two
//! probable primes, `n = p·q`, `e = 65537`, `d = e⁻¹ mod (p-1)(q-1)`.
//! A signature is `SHA-256(payload)^d mod n` with the digest read as an
//! unsigned big-endian integer; verification checks
//! `signature^e mod n == SHA-256(payload)`.
//!
//! **Not production-grade.** This is raw RSA without padding (no OAEP/PSS):
//! signatures are malleable and the scheme offers none of the guarantees of a
//! standard signature algorithm. It is kept unpadded because the wire
//! protocol's signer and verifier must agree on exactly this construction.
//!
//! A client's identifier is the hex encoding of the last 20 bytes of
//! `SHA-256(decimal(e) ‖ decimal(n))`. The server never stores keys; it
//! recomputes the identifier from the presented key on every request.

use std::fmt;

use num_bigint::{BigInt, BigUint, RandBigInt};
use num_traits::{One, Zero};
use rand::Rng;

use crate::error::{ChainError, Result};
use crate::types::Hash;

/// Fixed public exponent.
pub const PUBLIC_EXPONENT: u32 = 65_537;

/// Smallest accepted modulus size. Smaller moduli can be below the 256-bit
/// digest, which would make signatures unverifiable.
pub const MIN_KEY_BITS: u64 = 512;

/// Largest modulus accepted from the wire.
pub const MAX_KEY_BITS: u64 = 8192;

/// Decimal digits needed for any value below `2^MAX_KEY_BITS`.
pub const MAX_DECIMAL_DIGITS: usize = 2467;

/// Random Miller–Rabin bases tried per candidate.
pub const MILLER_RABIN_ROUNDS: usize = 40;

/// Trailing digest bytes that form a client identifier.
pub const CLIENT_ID_BYTES: usize = 20;

const SMALL_PRIMES: [u32; 50] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
    97, 101, 103, 107, 109, 113, 127, 131, 137, 139, 149, 151, 157, 163, 167, 173, 179, 181, 191,
    193, 197, 199, 211, 223, 227, 229,
];

// ---------------------------------------------------------------------------
// Number theory
// ---------------------------------------------------------------------------

/// Miller–Rabin probable-prime test with `rounds` random bases, preceded by
/// trial division by small primes.
pub fn is_probable_prime<R: Rng + ?Sized>(n: &BigUint, rounds: usize, rng: &mut R) -> bool {
    let two = BigUint::from(2u32);
    if n < &two {
        return false;
    }
    for &p in SMALL_PRIMES.iter() {
        if *n == BigUint::from(p) {
            return true;
        }
        if (n % p).is_zero() {
            return false;
        }
    }

    // n - 1 = d · 2^s with d odd
    let one = BigUint::one();
    let n_minus_one = n - &one;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    'witness: for _ in 0..rounds {
        let a = rng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Random probable prime with exactly `bits` bits.
pub fn generate_probable_prime<R: Rng + ?Sized>(bits: u64, rng: &mut R) -> Result<BigUint> {
    if bits < 2 {
        return Err(ChainError::KeyGeneration(format!(
            "cannot generate a {bits}-bit prime"
        )));
    }
    let top = BigUint::one() << (bits - 1);
    loop {
        let candidate = rng.gen_biguint(bits) | &top | BigUint::one();
        if is_probable_prime(&candidate, MILLER_RABIN_ROUNDS, rng) {
            return Ok(candidate);
        }
    }
}

/// Inverse of `a` modulo `modulus` by the extended Euclidean algorithm, or
/// `None` when `gcd(a, modulus) != 1`.
pub fn mod_inverse(a: &BigUint, modulus: &BigUint) -> Option<BigUint> {
    if modulus.is_zero() {
        return None;
    }
    let m = BigInt::from(modulus.clone());
    let (mut old_r, mut r) = (BigInt::from(a % modulus), m.clone());
    let (mut old_s, mut s) = (BigInt::one(), BigInt::zero());

    while !r.is_zero() {
        let q = &old_r / &r;
        let next_r = &old_r - &q * &r;
        old_r = std::mem::replace(&mut r, next_r);
        let next_s = &old_s - &q * &s;
        old_s = std::mem::replace(&mut s, next_s);
    }

    if !old_r.is_one() {
        return None;
    }
    (((old_s % &m) + &m) % &m).to_biguint()
}

/// SHA-256 of `payload` as an unsigned big-endian integer.
pub fn digest_integer(payload: impl AsRef<[u8]>) -> BigUint {
    BigUint::from_bytes_be(Hash::compute(payload.as_ref()).as_bytes())
}

fn parse_decimal(field: &'static str, value: &str) -> Result<BigUint> {
    if value.len() > MAX_DECIMAL_DIGITS {
        return Err(ChainError::OversizedNumber {
            field,
            max_bits: MAX_KEY_BITS,
        });
    }
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ChainError::InvalidNumber {
            field,
            value: value.to_string(),
        });
    }
    value.parse().map_err(|_| ChainError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// RSA public key `(e, n)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    pub e: BigUint,
    pub n: BigUint,
}

impl PublicKey {
    /// Parse the decimal wire form of a key.
    ///
    /// Moduli above [`MAX_KEY_BITS`] and exponents larger than the modulus
    /// are rejected before any arithmetic is done with them.
    pub fn from_decimal(e: &str, n: &str) -> Result<Self> {
        let e = parse_decimal("publicKeyE", e)?;
        let n = parse_decimal("publicKeyN", n)?;
        if n.bits() > MAX_KEY_BITS {
            return Err(ChainError::OversizedNumber {
                field: "publicKeyN",
                max_bits: MAX_KEY_BITS,
            });
        }
        if e.is_zero() || e > n {
            return Err(ChainError::InvalidPublicKey(
                "exponent must be non-zero and not exceed the modulus",
            ));
        }
        Ok(Self { e, n })
    }

    pub fn client_id(&self) -> String {
        client_id(&self.e, &self.n)
    }
}

/// RSA private key `(d, n)`.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    pub d: BigUint,
    pub n: BigUint,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("d", &"<redacted>")
            .field("n_bits", &self.n.bits())
            .finish()
    }
}

/// A generated keypair and its derived client identifier.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
    client_id: String,
}

impl KeyPair {
    /// Generate a keypair with a modulus of about `bits` bits.
    pub fn generate(bits: u64) -> Result<Self> {
        Self::generate_with(bits, &mut rand::thread_rng())
    }

    pub fn generate_with<R: Rng + ?Sized>(bits: u64, rng: &mut R) -> Result<Self> {
        if bits < MIN_KEY_BITS {
            return Err(ChainError::KeyGeneration(format!(
                "key size {bits} is below the minimum of {MIN_KEY_BITS} bits"
            )));
        }
        let half = bits / 2;
        let p = generate_probable_prime(half, rng)?;
        let q = loop {
            let q = generate_probable_prime(half, rng)?;
            if q != p {
                break q;
            }
        };
        Self::from_primes(&p, &q)
    }

    /// Derive a keypair from two distinct primes.
    ///
    /// Fails if the fixed public exponent is not invertible modulo the
    /// totient; no key is produced in that case.
    pub fn from_primes(p: &BigUint, q: &BigUint) -> Result<Self> {
        if p == q {
            return Err(ChainError::KeyGeneration("primes must be distinct".into()));
        }
        let n = p * q;
        let totient = (p - 1u32) * (q - 1u32);
        let e = BigUint::from(PUBLIC_EXPONENT);
        let d = mod_inverse(&e, &totient).ok_or_else(|| {
            ChainError::KeyGeneration(format!(
                "public exponent {PUBLIC_EXPONENT} is not invertible modulo the totient"
            ))
        })?;

        let public = PublicKey { e, n: n.clone() };
        let client_id = public.client_id();
        Ok(Self {
            public,
            private: PrivateKey { d, n },
            client_id,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn sign(&self, payload: impl AsRef<[u8]>) -> BigUint {
        sign(payload, &self.private)
    }

    pub fn verify(&self, payload: impl AsRef<[u8]>, signature: &BigUint) -> bool {
        verify(payload, signature, &self.public)
    }
}

// ---------------------------------------------------------------------------
// Identifiers and signatures
// ---------------------------------------------------------------------------

/// Client identifier for a public key.
pub fn client_id(e: &BigUint, n: &BigUint) -> String {
    client_id_from_strings(&e.to_string(), &n.to_string())
}

/// Client identifier computed from the decimal strings exactly as given.
pub fn client_id_from_strings(e: &str, n: &str) -> String {
    let digest = Hash::compute(format!("{e}{n}").as_bytes());
    hex::encode(&digest.as_bytes()[32 - CLIENT_ID_BYTES..])
}

/// `SHA-256(payload)^d mod n`.
pub fn sign(payload: impl AsRef<[u8]>, key: &PrivateKey) -> BigUint {
    digest_integer(payload).modpow(&key.d, &key.n)
}

/// Whether `signature^e mod n` equals `SHA-256(payload)`. Signatures not
/// reduced modulo `n` never verify.
pub fn verify(payload: impl AsRef<[u8]>, signature: &BigUint, key: &PublicKey) -> bool {
    if key.n.is_zero() || signature >= &key.n {
        return false;
    }
    signature.modpow(&key.e, &key.n) == digest_integer(payload)
}

/// Parse a decimal signature from the wire.
pub fn parse_signature(value: &str) -> Result<BigUint> {
    parse_decimal("signature", value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn test_keypair() -> &'static KeyPair {
        static KEYPAIR: OnceLock<KeyPair> = OnceLock::new();
        KEYPAIR.get_or_init(|| KeyPair::generate(MIN_KEY_BITS).expect("keygen"))
    }

    #[test]
    fn test_small_primes_and_composites() {
        let mut rng = rand::thread_rng();
        for p in [2u32, 3, 5, 97, 229, 233, 7919, 65_537] {
            assert!(is_probable_prime(&BigUint::from(p), 20, &mut rng), "{p}");
        }
        // 561, 1105 and 62745 are Carmichael numbers
        for c in [0u32, 1, 4, 561, 1105, 7917, 62_745, 65_535] {
            assert!(!is_probable_prime(&BigUint::from(c), 20, &mut rng), "{c}");
        }
    }

    #[test]
    fn test_large_known_values() {
        let mut rng = rand::thread_rng();
        let mersenne_127 = (BigUint::one() << 127u32) - 1u32;
        assert!(is_probable_prime(&mersenne_127, 20, &mut rng));

        // 2^128 + 1 = 59649589127497217 · 5704689200685129054721
        let fermat_7 = (BigUint::one() << 128u32) + 1u32;
        assert!(!is_probable_prime(&fermat_7, 20, &mut rng));
    }

    #[test]
    fn test_generated_prime_has_exact_bits() {
        let mut rng = rand::thread_rng();
        let p = generate_probable_prime(128, &mut rng).expect("prime");
        assert_eq!(p.bits(), 128);
        assert!(!(&p % 2u32).is_zero(), "prime must be odd");
        assert!(is_probable_prime(&p, 20, &mut rng));
    }

    #[test]
    fn test_mod_inverse() {
        let inv = |a: u32, m: u32| mod_inverse(&BigUint::from(a), &BigUint::from(m));

        assert_eq!(inv(3, 11), Some(BigUint::from(4u32)));
        assert_eq!(inv(10, 17), Some(BigUint::from(12u32)));
        assert_eq!(inv(25, 7), Some(BigUint::from(2u32)));
        assert_eq!(inv(6, 9), None);
        assert_eq!(inv(5, 0), None);
    }

    #[test]
    fn test_keypair_roundtrips_messages() {
        let kp = test_keypair();
        assert!(kp.public.n.bits() >= MIN_KEY_BITS - 1);
        assert_eq!(kp.public.e, BigUint::from(PUBLIC_EXPONENT));

        let m = BigUint::from(42u32);
        let encrypted = m.modpow(&kp.public.e, &kp.public.n);
        assert_eq!(encrypted.modpow(&kp.private.d, &kp.private.n), m);
    }

    #[test]
    fn test_key_size_too_small() {
        let err = KeyPair::generate(256).unwrap_err();
        assert!(matches!(err, ChainError::KeyGeneration(_)));
    }

    #[test]
    fn test_non_invertible_exponent_is_an_error() {
        let mut rng = rand::thread_rng();
        // A prime p ≡ 1 (mod 65537) puts 65537 in the totient.
        let e = BigUint::from(PUBLIC_EXPONENT);
        let p = (1u32..)
            .map(|k| &e * k + 1u32)
            .find(|p| is_probable_prime(p, 20, &mut rng))
            .expect("some prime exists");
        let q = BigUint::from(7u32);

        let err = KeyPair::from_primes(&p, &q).unwrap_err();
        assert!(matches!(err, ChainError::KeyGeneration(_)));
    }

    #[test]
    fn test_sign_verify() {
        let kp = test_keypair();
        for payload in ["", "hello", "addTransaction2X", "ünïcødé ✓"] {
            let sig = kp.sign(payload);
            assert!(kp.verify(payload, &sig), "payload {payload:?}");
        }
    }

    #[test]
    fn test_payload_bit_flips_fail() {
        let kp = test_keypair();
        let payload = b"clientId65537modulusaddTransaction2X".to_vec();
        let sig = kp.sign(&payload);

        for byte in 0..payload.len() {
            for bit in 0..8 {
                let mut tampered = payload.clone();
                tampered[byte] ^= 1 << bit;
                assert!(!kp.verify(&tampered, &sig), "byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn test_signature_bit_flips_fail() {
        let kp = test_keypair();
        let payload = "verifyChain";
        let sig = kp.sign(payload);

        for bit in (0..kp.public.n.bits()).step_by(7) {
            let tampered = &sig ^ (BigUint::one() << bit);
            assert!(!kp.verify(payload, &tampered), "bit {bit}");
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let kp = test_keypair();
        let other = KeyPair::generate(MIN_KEY_BITS).expect("keygen");
        let sig = kp.sign("payload");
        assert!(!other.verify("payload", &sig));
    }

    #[test]
    fn test_zero_modulus_never_verifies() {
        let key = PublicKey {
            e: BigUint::from(PUBLIC_EXPONENT),
            n: BigUint::zero(),
        };
        assert!(!verify("x", &BigUint::one(), &key));
    }

    #[test]
    fn test_client_id_deterministic() {
        let kp = test_keypair();
        let id = kp.client_id();

        assert_eq!(id.len(), CLIENT_ID_BYTES * 2);
        assert_eq!(id, client_id(&kp.public.e, &kp.public.n));
        assert_eq!(
            id,
            client_id_from_strings(&kp.public.e.to_string(), &kp.public.n.to_string())
        );
        assert_eq!(id, kp.public.client_id());
    }

    #[test]
    fn test_client_id_is_tail_of_digest() {
        let full = crate::types::sha256_hex("6553712345");
        assert_eq!(client_id_from_strings("65537", "12345"), &full[24..]);
    }

    #[test]
    fn test_from_decimal_rejects_garbage() {
        assert!(PublicKey::from_decimal("3", "123").is_ok());
        assert!(matches!(
            PublicKey::from_decimal("65537", "12a"),
            Err(ChainError::InvalidNumber { field: "publicKeyN", .. })
        ));
        assert!(PublicKey::from_decimal("", "1").is_err());
        assert!(parse_signature("-5").is_err());
        assert!(parse_signature("1_000").is_err());
    }

    #[test]
    fn test_from_decimal_bounds_key_size() {
        let huge = "9".repeat(MAX_DECIMAL_DIGITS + 1);
        assert!(matches!(
            PublicKey::from_decimal("3", &huge),
            Err(ChainError::OversizedNumber { field: "publicKeyN", .. })
        ));
        assert!(matches!(
            parse_signature(&huge),
            Err(ChainError::OversizedNumber { field: "signature", .. })
        ));

        // Fits in the digit budget but not in MAX_KEY_BITS
        let wide = "9".repeat(MAX_DECIMAL_DIGITS);
        assert!(matches!(
            PublicKey::from_decimal("3", &wide),
            Err(ChainError::OversizedNumber { field: "publicKeyN", .. })
        ));

        let largest = ((BigUint::one() << MAX_KEY_BITS) - 1u32).to_string();
        assert!(largest.len() <= MAX_DECIMAL_DIGITS);
        assert!(PublicKey::from_decimal("65537", &largest).is_ok());
    }

    #[test]
    fn test_from_decimal_rejects_exponent_above_modulus() {
        assert!(matches!(
            PublicKey::from_decimal("65537", "3233"),
            Err(ChainError::InvalidPublicKey(_))
        ));
        assert!(matches!(
            PublicKey::from_decimal("0", "3233"),
            Err(ChainError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_unreduced_signature_never_verifies() {
        let kp = test_keypair();
        let sig = kp.sign("payload");
        assert!(!kp.verify("payload", &(&sig + &kp.public.n)));
    }

    #[test]
    fn test_private_key_debug_redacts_exponent() {
        let kp = test_keypair();
        let rendered = format!("{:?}", kp.private);
        assert!(!rendered.contains(&kp.private.d.to_string()));
        assert!(rendered.contains("redacted"));
    }
}
