use crate::errors::ApiError;
use crate::rows::TotalNumRow;
use crate::service::Service;
use dc_crypto::elgamal::encrypt_int;
use dc_crypto::Point;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::info;

/// Upper bound on rows generated per server by one seeding call.
pub const MAX_ROWS_PER_SERVER: u64 = 100_000;

const LOCATIONS: [&str; 4] = ["CHUV", "HUG", "INSEL", "USZ"];

const CONCEPTS: [&str; 5] = [
    "\\i2b2\\Diagnoses\\Neoplasms\\",
    "\\i2b2\\Diagnoses\\Neoplasms\\Malignant\\",
    "\\i2b2\\Diagnoses\\Circulatory\\",
    "\\i2b2\\Procedures\\Surgery\\",
    "\\i2b2\\Medications\\Antibiotics\\",
];

const FIRST_YEAR: u32 = 2010;
const YEARS: u32 = 10;

/// Counts are uniform in `[0, MAX_COUNT)`.
const MAX_COUNT: u32 = 500;

/// Clear part of one synthetic row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntheticRow {
    pub location_cd: String,
    pub time: String,
    pub concept_path: String,
    pub count: i64,
}

fn gen_row(rng: &mut ChaCha20Rng) -> SyntheticRow {
    let location = LOCATIONS[(rng.next_u32() as usize) % LOCATIONS.len()];
    let concept = CONCEPTS[(rng.next_u32() as usize) % CONCEPTS.len()];
    let year = FIRST_YEAR + rng.next_u32() % YEARS;
    let month = 1 + rng.next_u32() % 12;

    SyntheticRow {
        location_cd: location.to_string(),
        time: format!("{year}-{month:02}"),
        concept_path: concept.to_string(),
        count: (rng.next_u32() % MAX_COUNT) as i64,
    }
}

/// Per-server seed, so every server's rows are reproducible on their own.
fn server_seed(node: usize) -> [u8; 32] {
    let mut seed = [0u8; 32];
    seed[0..8].copy_from_slice(b"DC_ROWS_");
    seed[8..16].copy_from_slice(&(node as u64).to_le_bytes());
    seed[16..].copy_from_slice(&[11u8; 16]);
    seed
}

pub fn synthetic_rows(node: usize, n: u64) -> Vec<SyntheticRow> {
    let mut rng = ChaCha20Rng::from_seed(server_seed(node));
    (0..n).map(|_| gen_row(&mut rng)).collect()
}

fn encrypt_rows(public: &Point, rows: Vec<SyntheticRow>) -> Vec<TotalNumRow> {
    // Encryption randomness comes from the OS even though the plaintexts are seeded.
    let mut rng = rand::rngs::OsRng;
    rows.into_iter()
        .map(|r| TotalNumRow {
            location_cd: r.location_cd,
            time: r.time,
            concept_path: r.concept_path,
            totalnum: encrypt_int(public, r.count, &mut rng),
        })
        .collect()
}

/// Generate `rows_per_server` rows for every server and store them encrypted under the collective
/// key. Plaintext counts never leave this function.
pub async fn seed(service: &Service, rows_per_server: u64) -> Result<u64, ApiError> {
    if rows_per_server > MAX_ROWS_PER_SERVER {
        return Err(ApiError::BadRequest(format!(
            "rows_per_server must be at most {MAX_ROWS_PER_SERVER}"
        )));
    }

    // Held until the last insert, so no server can join or leave between encrypting and storing.
    let collective = service.collective().await;
    let public = collective.public_key();
    let servers = collective.len();
    info!(servers, rows_per_server, "seeding synthetic rows");

    let mut inserted = 0;
    for node in 0..servers {
        let rows = tokio::task::spawn_blocking(move || encrypt_rows(&public, synthetic_rows(node, rows_per_server)))
            .await
            .map_err(|_| ApiError::Internal)?;

        inserted += service.rows().insert(rows.into_iter().map(|r| (node, r)).collect()).await?;
        info!(node, inserted, "server rows stored");
    }
    drop(collective);

    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::Collective;
    use crate::rows::RowSource;
    use crate::service::{Membership, ServiceConfig};
    use dc_crypto::elgamal::decrypt_int;
    use dc_crypto::Scalar;
    use std::time::Duration;

    #[test]
    fn generation_is_reproducible_per_server() {
        assert_eq!(synthetic_rows(1, 20), synthetic_rows(1, 20));
        assert_ne!(synthetic_rows(0, 20), synthetic_rows(1, 20));

        for r in synthetic_rows(2, 50) {
            assert!(LOCATIONS.contains(&r.location_cd.as_str()));
            assert!((0..MAX_COUNT as i64).contains(&r.count));
            assert_eq!(r.time.len(), "2010-01".len());
        }
    }

    fn service(servers: usize) -> Service {
        let collective = Collective::generate(servers, &mut rand::rngs::OsRng);
        let config = ServiceConfig { tree_branching: 2, parallelize: false, proofs: false, query_ttl: Duration::from_secs(60) };
        Service::new(config, collective, RowSource::memory(Vec::new()), None)
    }

    #[tokio::test]
    async fn seeded_rows_decrypt_to_the_generated_counts() {
        let service = service(2);
        let secret: Scalar = service.collective().await.shares().iter().sum();

        assert_eq!(seed(&service, 5).await.unwrap(), 10);
        assert!(matches!(seed(&service, MAX_ROWS_PER_SERVER + 1).await, Err(ApiError::BadRequest(_))));

        let stored = service.rows().all().await.unwrap();
        let expected = synthetic_rows(1, 5);
        let node1: Vec<_> = stored.iter().filter(|r| r.node_index == 1).collect();
        assert_eq!(node1.len(), 5);
        for (s, e) in node1.iter().zip(&expected) {
            assert_eq!(s.row.location_cd, e.location_cd);
            assert_eq!(decrypt_int(&secret, &s.row.totalnum).unwrap(), e.count);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seeding_and_a_joining_server_do_not_interleave() {
        let service = service(2);
        let (seeded, joined) = tokio::join!(seed(&service, 4), service.change_membership(Membership::Add));
        let seeded = seeded.unwrap();
        joined.unwrap();

        // Either the rows were re-keyed for the newcomer, or they were seeded for all three servers.
        assert!(seeded == 8 || seeded == 12, "{seeded}");
        let collective = service.collective().await;
        let secret: Scalar = collective.shares().iter().sum();
        let stored = service.rows().all().await.unwrap();
        assert_eq!(stored.len() as u64, seeded);

        for node in 0..collective.len() {
            let mine: Vec<_> = stored.iter().filter(|r| r.node_index == node).collect();
            if mine.is_empty() {
                continue;
            }
            let expected = synthetic_rows(node, 4);
            assert_eq!(mine.len(), expected.len());
            for (s, e) in mine.iter().zip(&expected) {
                assert_eq!(decrypt_int(&secret, &s.row.totalnum).unwrap(), e.count);
            }
        }
    }
}
