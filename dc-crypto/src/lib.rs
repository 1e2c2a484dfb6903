//! Cryptographic core of the distributed-query collective.
//!
//! This crate contains:
//! - Additively homomorphic ElGamal over BN254 G1 and a bounded discrete-log decoder.
//! - Deterministic tagging for grouping on encrypted attributes.
//! - Chaum-Pedersen proofs for the add/remove-server transformation.
//! - Base64 text encodings for points, scalars and ciphertext vectors.

pub mod codec;
pub mod constants;
pub mod dlog;
pub mod elgamal;
pub mod grouping;
pub mod proofs;
pub mod types;

pub use elgamal::{CipherText, CipherVector, CryptoError, KeyPair, Point, Scalar};
pub use grouping::{DeterministCipherVector, DeterministicTagger, GroupingKey};
pub use proofs::PublishedAddRmProof;
pub use types::{DpResponse, FilteredResponse};
