//! Textual encoding of group elements and scalars.
//!
//! Points and scalars travel as standard base64 of their compressed canonical bytes. This is the
//! format used on the wire, in key files, and in the stored `totalnum` column, so it must
//! round-trip exactly.

use crate::elgamal::{CryptoError, Point, Scalar};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use base64::Engine;

/// Compressed size of a BN254 G1 point.
pub const POINT_BYTES: usize = 32;

/// Compressed size of a BN254 scalar.
pub const SCALAR_BYTES: usize = 32;

pub fn point_to_bytes(p: &Point) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(POINT_BYTES);
    p.serialize_compressed(&mut out)
        .map_err(|e| CryptoError::Serialization(format!("{e}")))?;
    Ok(out)
}

pub fn point_from_bytes(bytes: &[u8]) -> Result<Point, CryptoError> {
    if bytes.len() != POINT_BYTES {
        return Err(CryptoError::Decode(format!(
            "point must be {POINT_BYTES} bytes, got {}",
            bytes.len()
        )));
    }
    Point::deserialize_compressed(bytes).map_err(|e| CryptoError::Decode(format!("invalid point: {e}")))
}

pub fn scalar_to_bytes(s: &Scalar) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(SCALAR_BYTES);
    s.serialize_compressed(&mut out)
        .map_err(|e| CryptoError::Serialization(format!("{e}")))?;
    Ok(out)
}

pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar, CryptoError> {
    if bytes.len() != SCALAR_BYTES {
        return Err(CryptoError::Decode(format!(
            "scalar must be {SCALAR_BYTES} bytes, got {}",
            bytes.len()
        )));
    }
    Scalar::deserialize_compressed(bytes).map_err(|e| CryptoError::Decode(format!("invalid scalar: {e}")))
}

pub fn encode_b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_b64(s: &str) -> Result<Vec<u8>, CryptoError> {
    base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| CryptoError::Decode(format!("invalid base64: {e}")))
}

pub fn serialize_point(p: &Point) -> Result<String, CryptoError> {
    Ok(encode_b64(&point_to_bytes(p)?))
}

pub fn deserialize_point(s: &str) -> Result<Point, CryptoError> {
    point_from_bytes(&decode_b64(s)?)
}

pub fn serialize_scalar(s: &Scalar) -> Result<String, CryptoError> {
    Ok(encode_b64(&scalar_to_bytes(s)?))
}

pub fn deserialize_scalar(s: &str) -> Result<Scalar, CryptoError> {
    scalar_from_bytes(&decode_b64(s)?)
}

/// serde adapter: `#[serde(with = "dc_crypto::codec::point_b64")]`.
pub mod point_b64 {
    use super::{deserialize_point, serialize_point};
    use crate::elgamal::Point;
    use serde::{de::Error as _, ser::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(p: &Point, serializer: S) -> Result<S::Ok, S::Error> {
        let s = serialize_point(p).map_err(S::Error::custom)?;
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Point, D::Error> {
        let s = String::deserialize(deserializer)?;
        deserialize_point(&s).map_err(D::Error::custom)
    }
}

/// serde adapter for scalars, mirroring [`point_b64`].
pub mod scalar_b64 {
    use super::{deserialize_scalar, serialize_scalar};
    use crate::elgamal::Scalar;
    use serde::{de::Error as _, ser::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(s: &Scalar, serializer: S) -> Result<S::Ok, S::Error> {
        let text = serialize_scalar(s).map_err(S::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Scalar, D::Error> {
        let text = String::deserialize(deserializer)?;
        deserialize_scalar(&text).map_err(D::Error::custom)
    }
}
