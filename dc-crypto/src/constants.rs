//! Crate-wide constants for the ciphertext algebra and proof transcripts.

use ark_bn254::Fr;
use ark_crypto_primitives::sponge::poseidon::{find_poseidon_ark_and_mds, PoseidonConfig};
use ark_ff::PrimeField;
use std::sync::OnceLock;

/// Number of entries in the baby-step table used to decode `g^m` back to `m`.
pub const DLOG_BABY_STEPS: u64 = 1 << 14;

/// Maximum number of giant steps tried per sign during decoding.
///
/// Together with [`DLOG_BABY_STEPS`] this bounds the decodable magnitude to `2^31`.
pub const DLOG_GIANT_STEPS: u64 = 1 << 17;

/// Largest absolute plaintext value that decryption can recover.
pub const DLOG_MAX_ABS: u64 = DLOG_BABY_STEPS * DLOG_GIANT_STEPS - 1;

/// Fan-out default for per-bucket and per-record work.
pub const PARALLELIZE: bool = true;

/// Domain separator absorbed first into every add/remove proof challenge.
pub const ADDRM_PROOF_DOMAIN: &[u8] = b"dc-addrm-proof-v1";

// Poseidon sponge used for Fiat-Shamir challenges over BN254::Fr.
//
// Width-3 sponge (rate=2, capacity=1).
pub const POSEIDON_RATE: usize = 2;
pub const POSEIDON_CAPACITY: usize = 1;

pub const POSEIDON_FULL_ROUNDS: usize = 8;
pub const POSEIDON_PARTIAL_ROUNDS: usize = 57;

/// Poseidon S-box exponent (alpha).
pub const POSEIDON_ALPHA: u64 = 5;

/// Poseidon parameters for BN254::Fr, derived once per process.
///
/// Round constants (ARK) and the MDS matrix come from arkworks' derivation helper, so every
/// prover and verifier agrees on the same constants without shipping them.
pub fn poseidon_config() -> &'static PoseidonConfig<Fr> {
    static CONFIG: OnceLock<PoseidonConfig<Fr>> = OnceLock::new();

    CONFIG.get_or_init(|| {
        let prime_bits = Fr::MODULUS_BIT_SIZE as u64;

        let (ark, mds) = find_poseidon_ark_and_mds::<Fr>(
            prime_bits,
            POSEIDON_RATE,
            POSEIDON_FULL_ROUNDS as u64,
            POSEIDON_PARTIAL_ROUNDS as u64,
            0,
        );

        PoseidonConfig::new(
            POSEIDON_FULL_ROUNDS,
            POSEIDON_PARTIAL_ROUNDS,
            POSEIDON_ALPHA,
            mds,
            ark,
            POSEIDON_RATE,
            POSEIDON_CAPACITY,
        )
    })
}
