//! Grouping keys derived from (possibly encrypted) group-by attributes.
//!
//! Encrypted attributes are deterministically tagged: every node strips its decryption share and
//! raises the remainder to its own tagging salt. Once all nodes have applied their step, the `C`
//! component of each ciphertext is `(Π salt_i)·m·g`, independent of the encryption randomness,
//! so equal plaintexts collide and nothing else does. The clear path simply joins the strings.

use crate::codec;
use crate::elgamal::{CipherText, CipherVector, CryptoError, Point, Scalar};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of an aggregation bucket.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupingKey(pub String);

/// Key used when a query has no group-by attributes.
pub const TOTAL_GROUP: &str = "total";

impl GroupingKey {
    /// In-clear key: values joined with `,`, or [`TOTAL_GROUP`] for an empty tuple.
    ///
    /// `\` and `,` inside a value are backslash-escaped, so distinct tuples never share a key.
    pub fn from_clear<S: AsRef<str>>(values: &[S]) -> Self {
        if values.is_empty() {
            return Self(TOTAL_GROUP.to_string());
        }
        let parts: Vec<String> = values
            .iter()
            .map(|v| v.as_ref().replace('\\', "\\\\").replace(',', "\\,"))
            .collect();
        Self(parts.join(","))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeterministCipherText {
    pub point: Point,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeterministCipherVector(pub Vec<DeterministCipherText>);

impl DeterministCipherVector {
    /// Canonical key: base64 of each compressed point, joined with `,`.
    pub fn key(&self) -> Result<GroupingKey, CryptoError> {
        let parts = self
            .0
            .iter()
            .map(|d| codec::serialize_point(&d.point))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GroupingKey(parts.join(",")))
    }
}

/// A node's secrets for deterministic tagging.
#[derive(Clone, Debug)]
pub struct DeterministicTagger {
    /// The node's share of the collective decryption key.
    pub share: Scalar,
    /// Per-node tagging exponent; never leaves the node.
    pub salt: Scalar,
}

/// One node's step: `K' = s·K`, `C' = s·(C − x·K)`.
pub fn tag_step(cv: &CipherVector, tagger: &DeterministicTagger) -> CipherVector {
    cv.iter()
        .map(|ct| CipherText {
            k: ct.k * tagger.salt,
            c: (ct.c - ct.k * tagger.share) * tagger.salt,
        })
        .collect()
}

/// Apply every node's step and keep the deterministic `C` components.
///
/// Steps commute, so the order of `taggers` does not matter.
pub fn deterministic_tag(cv: &CipherVector, taggers: &[DeterministicTagger]) -> DeterministCipherVector {
    let tagged = taggers.iter().fold(cv.clone(), |acc, t| tag_step(&acc, t));
    DeterministCipherVector(tagged.iter().map(|ct| DeterministCipherText { point: ct.c }).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elgamal::{encrypt_int_vector, KeyPair, random_scalar};
    use ark_ff::Zero;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn collective(rng: &mut ChaCha20Rng, n: usize) -> (Vec<DeterministicTagger>, Point) {
        let taggers: Vec<DeterministicTagger> = (0..n)
            .map(|_| DeterministicTagger { share: random_scalar(rng), salt: random_scalar(rng) })
            .collect();
        let public = taggers
            .iter()
            .fold(Point::zero(), |acc, t| acc + KeyPair::from_secret(t.share).public);
        (taggers, public)
    }

    #[test]
    fn equal_plaintexts_share_a_key_despite_fresh_randomness() {
        let mut rng = ChaCha20Rng::from_seed([3u8; 32]);
        let (taggers, public) = collective(&mut rng, 3);

        let a = encrypt_int_vector(&public, &[1, 2], &mut rng);
        let b = encrypt_int_vector(&public, &[1, 2], &mut rng);
        assert_ne!(a, b);

        let ka = deterministic_tag(&a, &taggers).key().unwrap();
        let kb = deterministic_tag(&b, &taggers).key().unwrap();
        assert_eq!(ka, kb);
    }

    #[test]
    fn different_tuples_get_different_keys() {
        let mut rng = ChaCha20Rng::from_seed([4u8; 32]);
        let (taggers, public) = collective(&mut rng, 2);

        let a = encrypt_int_vector(&public, &[1, 2], &mut rng);
        let b = encrypt_int_vector(&public, &[2, 1], &mut rng);
        let c = encrypt_int_vector(&public, &[1, 3], &mut rng);

        let ka = deterministic_tag(&a, &taggers).key().unwrap();
        assert_ne!(ka, deterministic_tag(&b, &taggers).key().unwrap());
        assert_ne!(ka, deterministic_tag(&c, &taggers).key().unwrap());
    }

    #[test]
    fn tagging_order_does_not_matter() {
        let mut rng = ChaCha20Rng::from_seed([5u8; 32]);
        let (mut taggers, public) = collective(&mut rng, 3);
        let cv = encrypt_int_vector(&public, &[7], &mut rng);

        let forward = deterministic_tag(&cv, &taggers);
        taggers.reverse();
        assert_eq!(forward, deterministic_tag(&cv, &taggers));
    }

    #[test]
    fn clear_keys_join_values() {
        assert_eq!(GroupingKey::from_clear(&["A", "2015"]).as_str(), "A,2015");
        assert_eq!(GroupingKey::from_clear::<&str>(&[]).as_str(), TOTAL_GROUP);
        assert!(GroupingKey::from_clear(&["A"]) < GroupingKey::from_clear(&["B"]));
    }

    #[test]
    fn separators_inside_values_cannot_merge_tuples() {
        let left = GroupingKey::from_clear(&["A,B", "C"]);
        let right = GroupingKey::from_clear(&["A", "B,C"]);
        assert_ne!(left, right);
        assert_eq!(left.as_str(), "A\\,B,C");

        assert_ne!(GroupingKey::from_clear(&["A\\", "B"]), GroupingKey::from_clear(&["A\\,B"]));
    }
}
