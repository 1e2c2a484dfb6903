//! Publicly verifiable proofs for the add/remove-server transformation.
//!
//! For every element the prover shows that the shift applied to `C` is `key·K` for the same `key`
//! committed to in `ktopub = key·g`:
//!
//!   log_g(ktopub) == log_K(±(C' − C))
//!
//! This is a Chaum-Pedersen proof made non-interactive with a Poseidon sponge over BN254::Fr. The
//! published object carries the public commitment and the before/after vectors only.

use crate::codec::{self, point_b64, scalar_b64};
use crate::constants::{poseidon_config, ADDRM_PROOF_DOMAIN};
use crate::elgamal::{generator, random_scalar, CipherText, CipherVector, CryptoError, Point, Scalar};
use ark_bn254::Fr;
use ark_crypto_primitives::sponge::poseidon::PoseidonSponge;
use ark_crypto_primitives::sponge::CryptographicSponge;
use ark_ff::PrimeField;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bytes packed into one field element when absorbing; below the modulus, so packing is injective.
const ABSORB_CHUNK: usize = 16;

/// Proof for a single ciphertext.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRmProof {
    #[serde(with = "scalar_b64")]
    pub challenge: Scalar,
    #[serde(with = "scalar_b64")]
    pub response: Scalar,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorAddRmProof(pub Vec<AddRmProof>);

/// A self-contained, publicly checkable statement about one transformed vector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedAddRmProof {
    pub proof: VectorAddRmProof,
    pub vect_before: CipherVector,
    pub vect_after: CipherVector,
    /// `key·g`; the key itself is never published.
    #[serde(with = "point_b64")]
    pub ktopub: Point,
    pub to_add: bool,
}

impl PublishedAddRmProof {
    pub fn create(
        before: &CipherVector,
        after: &CipherVector,
        key: &Scalar,
        to_add: bool,
        rng: &mut impl Rng,
    ) -> Result<Self, CryptoError> {
        let proof = vector_add_rm_proof_creation(before, after, key, to_add, rng)?;
        Ok(Self {
            proof,
            vect_before: before.clone(),
            vect_after: after.clone(),
            ktopub: generator() * key,
            to_add,
        })
    }

    /// `true` only if every element verifies.
    pub fn verify(&self) -> bool {
        vector_add_rm_proof_verify(&self.proof, &self.vect_before, &self.vect_after, &self.ktopub, self.to_add)
    }
}

/// Verify a whole batch; a single failing element rejects everything.
pub fn verify_batch(proofs: &[PublishedAddRmProof]) -> bool {
    proofs.iter().all(PublishedAddRmProof::verify)
}

/// `±(C' − C)`, which equals `key·K` for an honest transformation.
fn shift(before: &CipherText, after: &CipherText, to_add: bool) -> Point {
    if to_add { after.c - before.c } else { before.c - after.c }
}

fn absorb_point(sponge: &mut PoseidonSponge<Fr>, p: &Point) -> Result<(), CryptoError> {
    absorb_bytes(sponge, &codec::point_to_bytes(p)?);
    Ok(())
}

fn absorb_bytes(sponge: &mut PoseidonSponge<Fr>, bytes: &[u8]) {
    for chunk in bytes.chunks(ABSORB_CHUNK) {
        sponge.absorb(&Fr::from_le_bytes_mod_order(chunk));
    }
}

fn challenge(
    ktopub: &Point,
    k: &Point,
    d: &Point,
    a1: &Point,
    a2: &Point,
    to_add: bool,
) -> Result<Scalar, CryptoError> {
    let mut sponge = PoseidonSponge::<Fr>::new(poseidon_config());
    absorb_bytes(&mut sponge, ADDRM_PROOF_DOMAIN);
    sponge.absorb(&Fr::from(to_add as u64));

    // Statement first, then commitments.
    for p in [&generator(), ktopub, k, d, a1, a2] {
        absorb_point(&mut sponge, p)?;
    }

    Ok(sponge.squeeze_field_elements::<Fr>(1)[0])
}

pub fn add_rm_proof_creation(
    before: &CipherText,
    after: &CipherText,
    key: &Scalar,
    to_add: bool,
    rng: &mut impl Rng,
) -> Result<AddRmProof, CryptoError> {
    let ktopub = generator() * key;
    let d = shift(before, after, to_add);

    let w = random_scalar(rng);
    let a1 = generator() * w;
    let a2 = before.k * w;

    let e = challenge(&ktopub, &before.k, &d, &a1, &a2, to_add)?;
    Ok(AddRmProof { challenge: e, response: w + e * key })
}

pub fn add_rm_proof_verify(
    proof: &AddRmProof,
    before: &CipherText,
    after: &CipherText,
    ktopub: &Point,
    to_add: bool,
) -> bool {
    // The transformation never touches K.
    if before.k != after.k {
        return false;
    }

    let d = shift(before, after, to_add);
    let a1 = generator() * proof.response - *ktopub * proof.challenge;
    let a2 = before.k * proof.response - d * proof.challenge;

    match challenge(ktopub, &before.k, &d, &a1, &a2, to_add) {
        Ok(e) => e == proof.challenge,
        Err(_) => false,
    }
}

pub fn vector_add_rm_proof_creation(
    before: &CipherVector,
    after: &CipherVector,
    key: &Scalar,
    to_add: bool,
    rng: &mut impl Rng,
) -> Result<VectorAddRmProof, CryptoError> {
    if before.len() != after.len() {
        return Err(CryptoError::LengthMismatch { left: before.len(), right: after.len() });
    }

    let proofs = before
        .iter()
        .zip(after.iter())
        .map(|(b, a)| add_rm_proof_creation(b, a, key, to_add, rng))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(VectorAddRmProof(proofs))
}

pub fn vector_add_rm_proof_verify(
    proof: &VectorAddRmProof,
    before: &CipherVector,
    after: &CipherVector,
    ktopub: &Point,
    to_add: bool,
) -> bool {
    if before.len() != after.len() || proof.0.len() != before.len() {
        return false;
    }

    proof
        .0
        .iter()
        .zip(before.iter().zip(after.iter()))
        .all(|(p, (b, a))| add_rm_proof_verify(p, b, a, ktopub, to_add))
}
