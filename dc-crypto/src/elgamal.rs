//! Additively homomorphic ElGamal over BN254 G1.
//!
//! A count `m` is embedded as `g^m` (written additively: `m·g`) and encrypted under a public key
//! `X` as `(K, C) = (r·g, m·g + r·X)`. Adding two ciphertexts componentwise adds the plaintexts.
//! Decryption strips the mask (`C − sk·K`) and recovers `m` with a bounded discrete log, so the
//! caller must keep sums inside [`crate::constants::DLOG_MAX_ABS`].

use crate::codec::{self, POINT_BYTES};
use crate::dlog;
use ark_bn254::{Fr, G1Projective};
use ark_ec::PrimeGroup;
use ark_ff::{UniformRand, Zero};
use rand::Rng;
use serde::{de::Error as _, ser::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A public group element.
pub type Point = G1Projective;

/// A private exponent.
pub type Scalar = Fr;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("vector length mismatch: {left} != {right}")]
    LengthMismatch { left: usize, right: usize },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("plaintext outside the decodable range")]
    DlogOutOfRange,

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// The fixed base point `g`.
pub fn generator() -> Point {
    G1Projective::generator()
}

pub fn random_scalar(rng: &mut impl Rng) -> Scalar {
    Fr::rand(rng)
}

/// Map a signed integer into the scalar field.
pub fn int_to_scalar(v: i64) -> Scalar {
    let s = Fr::from(v.unsigned_abs());
    if v < 0 { -s } else { s }
}

/// The message point `v·g` for an integer `v`.
pub fn int_to_point(v: i64) -> Point {
    generator() * int_to_scalar(v)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPair {
    pub secret: Scalar,
    pub public: Point,
}

impl KeyPair {
    pub fn generate(rng: &mut impl Rng) -> Self {
        Self::from_secret(random_scalar(rng))
    }

    pub fn from_secret(secret: Scalar) -> Self {
        Self { secret, public: generator() * secret }
    }
}

/// An ElGamal ciphertext `(K, C)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CipherText {
    /// Ephemeral mask generator `r·g`.
    pub k: Point,
    /// Masked message `m·g + r·X`.
    pub c: Point,
}

impl CipherText {
    /// Encryption of zero with zero randomness (identity on both components).
    pub fn zero() -> Self {
        Self { k: Point::zero(), c: Point::zero() }
    }

    /// Homomorphic addition: decrypts to the sum of both plaintexts.
    pub fn add(&self, other: &CipherText) -> CipherText {
        CipherText { k: self.k + other.k, c: self.c + other.c }
    }

    pub fn sub(&self, other: &CipherText) -> CipherText {
        CipherText { k: self.k - other.k, c: self.c - other.c }
    }

    pub fn neg(&self) -> CipherText {
        CipherText { k: -self.k, c: -self.c }
    }

    /// Multiplies the plaintext by `s`.
    pub fn mul_scalar(&self, s: &Scalar) -> CipherText {
        CipherText { k: self.k * s, c: self.c * s }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let mut out = codec::point_to_bytes(&self.k)?;
        out.extend(codec::point_to_bytes(&self.c)?);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 2 * POINT_BYTES {
            return Err(CryptoError::Decode(format!(
                "ciphertext must be {} bytes, got {}",
                2 * POINT_BYTES,
                bytes.len()
            )));
        }
        let (k, c) = bytes.split_at(POINT_BYTES);
        Ok(Self { k: codec::point_from_bytes(k)?, c: codec::point_from_bytes(c)? })
    }

    /// Base64 of `compressed(K) ‖ compressed(C)`.
    pub fn to_base64(&self) -> Result<String, CryptoError> {
        Ok(codec::encode_b64(&self.to_bytes()?))
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        Self::from_bytes(&codec::decode_b64(s)?)
    }
}

impl Serialize for CipherText {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let s = self.to_base64().map_err(S::Error::custom)?;
        serializer.serialize_str(&s)
    }
}

impl<'de> Deserialize<'de> for CipherText {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        CipherText::from_base64(&s).map_err(D::Error::custom)
    }
}

pub fn encrypt_int_with_r(public: &Point, m: i64, r: &Scalar) -> CipherText {
    CipherText { k: generator() * r, c: int_to_point(m) + *public * r }
}

pub fn encrypt_int(public: &Point, m: i64, rng: &mut impl Rng) -> CipherText {
    let r = random_scalar(rng);
    encrypt_int_with_r(public, m, &r)
}

/// Remove the mask and return the message point `m·g`.
pub fn decrypt_point(secret: &Scalar, ct: &CipherText) -> Point {
    ct.c - ct.k * secret
}

pub fn decrypt_int(secret: &Scalar, ct: &CipherText) -> Result<i64, CryptoError> {
    dlog::solve(&decrypt_point(secret, ct))
}

/// Shift the decryption key of `ct` by one server share: `C ± key·K`, `K` unchanged.
///
/// Adding moves a ciphertext under `X` to `X + key·g`; removing moves it to `X − key·g`.
pub fn change_encryption(ct: &CipherText, key: &Scalar, add: bool) -> CipherText {
    let shift = ct.k * key;
    let c = if add { ct.c + shift } else { ct.c - shift };
    CipherText { k: ct.k, c }
}

/// One node's key-switching term for `ct`: `(r·g, r·Q − share·K)`.
///
/// Summing the terms of every share holder and adding the sum's `C` to the original `C` yields
/// an encryption of the same message under `target`.
pub fn key_switch_contribution(ct: &CipherText, share: &Scalar, target: &Point, r: &Scalar) -> CipherText {
    CipherText { k: generator() * r, c: *target * r - ct.k * share }
}

/// An ordered sequence of ciphertexts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CipherVector(pub Vec<CipherText>);

impl CipherVector {
    pub fn new(v: Vec<CipherText>) -> Self {
        Self(v)
    }

    /// `n` identity ciphertexts.
    pub fn zeros(n: usize) -> Self {
        Self(vec![CipherText::zero(); n])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CipherText> {
        self.0.iter()
    }

    pub fn push(&mut self, ct: CipherText) {
        self.0.push(ct);
    }

    fn check_len(&self, other: &CipherVector) -> Result<(), CryptoError> {
        if self.len() != other.len() {
            return Err(CryptoError::LengthMismatch { left: self.len(), right: other.len() });
        }
        Ok(())
    }

    pub fn add(&self, other: &CipherVector) -> Result<CipherVector, CryptoError> {
        self.check_len(other)?;
        Ok(Self(self.iter().zip(other.iter()).map(|(a, b)| a.add(b)).collect()))
    }

    pub fn sub(&self, other: &CipherVector) -> Result<CipherVector, CryptoError> {
        self.check_len(other)?;
        Ok(Self(self.iter().zip(other.iter()).map(|(a, b)| a.sub(b)).collect()))
    }

    pub fn add_assign(&mut self, other: &CipherVector) -> Result<(), CryptoError> {
        self.check_len(other)?;
        for (a, b) in self.0.iter_mut().zip(other.iter()) {
            *a = a.add(b);
        }
        Ok(())
    }

    /// Ciphertext strings joined with `,`.
    pub fn to_text(&self) -> Result<String, CryptoError> {
        let parts = self.iter().map(CipherText::to_base64).collect::<Result<Vec<_>, _>>()?;
        Ok(parts.join(","))
    }

    pub fn from_text(s: &str) -> Result<Self, CryptoError> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        let v = s.split(',').map(CipherText::from_base64).collect::<Result<Vec<_>, _>>()?;
        Ok(Self(v))
    }
}

impl FromIterator<CipherText> for CipherVector {
    fn from_iter<I: IntoIterator<Item = CipherText>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub fn encrypt_int_vector(public: &Point, values: &[i64], rng: &mut impl Rng) -> CipherVector {
    values.iter().map(|v| encrypt_int(public, *v, rng)).collect()
}

pub fn decrypt_int_vector(secret: &Scalar, cv: &CipherVector) -> Result<Vec<i64>, CryptoError> {
    cv.iter().map(|ct| decrypt_int(secret, ct)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn rng() -> ChaCha20Rng {
        ChaCha20Rng::from_seed([42u8; 32])
    }

    #[test]
    fn encrypt_then_decrypt_recovers_small_values() {
        let mut rng = rng();
        let kp = KeyPair::generate(&mut rng);
        for v in [0i64, 1, 2, 10, -1, -7, 65_535, 1_000_000] {
            let ct = encrypt_int(&kp.public, v, &mut rng);
            assert_eq!(decrypt_int(&kp.secret, &ct).unwrap(), v);
        }
    }

    #[test]
    fn wrong_key_does_not_decrypt_to_the_message() {
        let mut rng = rng();
        let kp = KeyPair::generate(&mut rng);
        let other = KeyPair::generate(&mut rng);
        let ct = encrypt_int(&kp.public, 5, &mut rng);
        assert_ne!(decrypt_point(&other.secret, &ct), int_to_point(5));
    }

    #[test]
    fn vector_ops_reject_length_mismatch() {
        let mut rng = rng();
        let kp = KeyPair::generate(&mut rng);
        let a = encrypt_int_vector(&kp.public, &[1, 2, 3], &mut rng);
        let b = encrypt_int_vector(&kp.public, &[1, 2], &mut rng);

        assert_eq!(a.add(&b), Err(CryptoError::LengthMismatch { left: 3, right: 2 }));
        assert!(a.sub(&b).is_err());
        let mut c = a.clone();
        assert!(c.add_assign(&b).is_err());
        assert_eq!(c, a);
    }

    #[test]
    fn vector_sub_undoes_add() {
        let mut rng = rng();
        let kp = KeyPair::generate(&mut rng);
        let a = encrypt_int_vector(&kp.public, &[4, 5, 6], &mut rng);
        let b = encrypt_int_vector(&kp.public, &[1, 1, 10], &mut rng);

        let sum = a.add(&b).unwrap();
        assert_eq!(decrypt_int_vector(&kp.secret, &sum).unwrap(), vec![5, 6, 16]);
        assert_eq!(sum.sub(&b).unwrap(), a);
    }

    #[test]
    fn ciphertext_text_encoding_is_stable() {
        let mut rng = rng();
        let kp = KeyPair::generate(&mut rng);
        let cv = encrypt_int_vector(&kp.public, &[3, 0, 9], &mut rng);

        let text = cv.to_text().unwrap();
        assert_eq!(text.split(',').count(), 3);
        let back = CipherVector::from_text(&text).unwrap();
        assert_eq!(back, cv);
        assert_eq!(back.to_text().unwrap(), text);

        let json = serde_json::to_string(&cv).unwrap();
        let from_json: CipherVector = serde_json::from_str(&json).unwrap();
        assert_eq!(from_json, cv);

        assert!(CipherText::from_base64(&codec::encode_b64(&[0u8; 10])).is_err());
    }

    #[test]
    fn scalar_multiplication_scales_the_plaintext() {
        let mut rng = rng();
        let kp = KeyPair::generate(&mut rng);
        let ct = encrypt_int(&kp.public, 7, &mut rng);
        let tripled = ct.mul_scalar(&int_to_scalar(3));
        assert_eq!(decrypt_int(&kp.secret, &tripled).unwrap(), 21);
        assert_eq!(decrypt_int(&kp.secret, &ct.neg()).unwrap(), -7);
    }

    #[test]
    fn change_encryption_moves_between_keys() {
        let mut rng = rng();
        let a = KeyPair::generate(&mut rng);
        let b = KeyPair::generate(&mut rng);
        let collective = a.public + b.public;
        let ct = encrypt_int(&collective, 12, &mut rng);

        // Remove b's share: now decryptable with a alone.
        let only_a = change_encryption(&ct, &b.secret, false);
        assert_eq!(only_a.k, ct.k);
        assert_eq!(decrypt_int(&a.secret, &only_a).unwrap(), 12);

        // And back again.
        assert_eq!(change_encryption(&only_a, &b.secret, true), ct);
    }

    #[test]
    fn key_switch_terms_reencrypt_under_target() {
        let mut rng = rng();
        let shares: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate(&mut rng)).collect();
        let collective = shares.iter().fold(Point::zero(), |acc, kp| acc + kp.public);
        let querier = KeyPair::generate(&mut rng);

        let ct = encrypt_int(&collective, 42, &mut rng);
        let mut acc = CipherText::zero();
        for kp in &shares {
            let r = random_scalar(&mut rng);
            acc = acc.add(&key_switch_contribution(&ct, &kp.secret, &querier.public, &r));
        }
        let switched = CipherText { k: acc.k, c: ct.c + acc.c };

        assert_eq!(decrypt_int(&querier.secret, &switched).unwrap(), 42);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn homomorphic_sum(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000, seed in any::<[u8; 32]>()) {
            let mut rng = ChaCha20Rng::from_seed(seed);
            let kp = KeyPair::generate(&mut rng);
            let sum = encrypt_int(&kp.public, a, &mut rng).add(&encrypt_int(&kp.public, b, &mut rng));
            prop_assert_eq!(decrypt_int(&kp.secret, &sum).unwrap(), a + b);
        }
    }
}
