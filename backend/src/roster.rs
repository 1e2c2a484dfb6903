//! The collective authority: an ordered list of servers, each holding one share of the
//! collective secret.
//!
//! Every server is simulated in-process, so its secrets live here; only [`Roster`] (names and
//! public keys) is ever shown to clients.

use crate::errors::ApiError;
use dc_crypto::codec::{point_b64, scalar_b64};
use dc_crypto::elgamal::random_scalar;
#[cfg(test)]
use dc_crypto::DeterministicTagger;
use dc_crypto::{KeyPair, Point, Scalar};
use ark_ff::Zero;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub index: usize,
    pub name: String,
    #[serde(with = "point_b64")]
    pub public: Point,
}

/// Public view of the collective. The first server is the tree root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub servers: Vec<ServerIdentity>,
    /// Collective public key: the sum of every server's public key.
    #[serde(with = "point_b64")]
    pub aggregate: Point,
}

#[derive(Clone, Debug)]
pub struct ServerNode {
    pub name: String,
    pub keys: KeyPair,
    pub tag_salt: Scalar,
}

impl ServerNode {
    pub fn generate(name: String, rng: &mut impl Rng) -> Self {
        Self { name, keys: KeyPair::generate(rng), tag_salt: random_scalar(rng) }
    }

    #[cfg(test)]
    pub fn tagger(&self) -> DeterministicTagger {
        DeterministicTagger { share: self.keys.secret, salt: self.tag_salt }
    }
}

#[derive(Clone, Debug)]
pub struct Collective {
    nodes: Vec<ServerNode>,
    next_id: usize,
}

#[derive(Serialize, Deserialize)]
struct StoredServer {
    name: String,
    #[serde(with = "scalar_b64")]
    secret: Scalar,
    #[serde(with = "scalar_b64")]
    tag_salt: Scalar,
}

#[derive(Serialize, Deserialize)]
struct RosterFile {
    next_id: usize,
    servers: Vec<StoredServer>,
}

impl Collective {
    pub fn generate(size: usize, rng: &mut impl Rng) -> Self {
        let mut c = Self { nodes: Vec::with_capacity(size), next_id: 0 };
        for _ in 0..size {
            c.add_server(rng);
        }
        c
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn public_key(&self) -> Point {
        self.nodes.iter().fold(Point::zero(), |acc, n| acc + n.keys.public)
    }

    pub fn shares(&self) -> Vec<Scalar> {
        self.nodes.iter().map(|n| n.keys.secret).collect()
    }

    /// One tagger per server, for encrypting group keys deterministically.
    #[cfg(test)]
    pub fn taggers(&self) -> Vec<DeterministicTagger> {
        self.nodes.iter().map(ServerNode::tagger).collect()
    }

    pub fn roster(&self) -> Roster {
        Roster {
            servers: self
                .nodes
                .iter()
                .enumerate()
                .map(|(index, n)| ServerIdentity { index, name: n.name.clone(), public: n.keys.public })
                .collect(),
            aggregate: self.public_key(),
        }
    }

    /// Append a freshly keyed server and return a copy of it.
    pub fn add_server(&mut self, rng: &mut impl Rng) -> ServerNode {
        let node = ServerNode::generate(format!("server-{}", self.next_id), rng);
        self.next_id += 1;
        self.nodes.push(node.clone());
        node
    }

    /// Drop the server at `index`. The root (index 0) anchors the tree and cannot leave.
    pub fn remove_server(&mut self, index: usize) -> Result<ServerNode, ApiError> {
        if index == 0 {
            return Err(ApiError::Conflict("the root server cannot be removed".to_string()));
        }
        if index >= self.nodes.len() {
            return Err(ApiError::NotFound(format!("no server at index {index}")));
        }
        Ok(self.nodes.remove(index))
    }

    pub fn load(path: &Path) -> Result<Option<Self>, ApiError> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path).map_err(|_| ApiError::Internal)?;
        let file: RosterFile = serde_json::from_slice(&bytes).map_err(|_| ApiError::Internal)?;

        let nodes = file
            .servers
            .into_iter()
            .map(|s| ServerNode { name: s.name, keys: KeyPair::from_secret(s.secret), tag_salt: s.tag_salt })
            .collect();
        Ok(Some(Self { nodes, next_id: file.next_id }))
    }

    pub fn save(&self, path: &Path) -> Result<(), ApiError> {
        let file = RosterFile {
            next_id: self.next_id,
            servers: self
                .nodes
                .iter()
                .map(|n| StoredServer { name: n.name.clone(), secret: n.keys.secret, tag_salt: n.tag_salt })
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|_| ApiError::Internal)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|_| ApiError::Internal)?;
        }

        // Readers see either the old file or the new one, never a torn write.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(|_| ApiError::Internal)?;
        std::fs::rename(&tmp, path).map_err(|_| {
            let _ = std::fs::remove_file(&tmp);
            ApiError::Internal
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dc_crypto::elgamal::{decrypt_int, encrypt_int};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn collective_key_decrypts_with_summed_shares() {
        let mut rng = ChaCha20Rng::from_seed([1u8; 32]);
        let c = Collective::generate(3, &mut rng);
        let ct = encrypt_int(&c.public_key(), 42, &mut rng);

        let full: Scalar = c.shares().iter().sum();
        assert_eq!(decrypt_int(&full, &ct).unwrap(), 42);
        assert_eq!(c.roster().aggregate, c.public_key());
    }

    #[test]
    fn root_cannot_be_removed_and_names_stay_unique() {
        let mut rng = ChaCha20Rng::from_seed([2u8; 32]);
        let mut c = Collective::generate(2, &mut rng);

        assert!(matches!(c.remove_server(0), Err(ApiError::Conflict(_))));
        assert!(matches!(c.remove_server(5), Err(ApiError::NotFound(_))));

        let removed = c.remove_server(1).unwrap();
        let added = c.add_server(&mut rng);
        assert_ne!(removed.name, added.name);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn roster_file_round_trips() {
        let mut rng = ChaCha20Rng::from_seed([3u8; 32]);
        let c = Collective::generate(3, &mut rng);

        let dir = std::env::temp_dir().join(format!("dc-roster-{}", uuid::Uuid::new_v4()));
        let path = dir.join("roster.json");
        c.save(&path).unwrap();

        let back = Collective::load(&path).unwrap().unwrap();
        assert_eq!(back.roster(), c.roster());
        assert_eq!(back.shares(), c.shares());

        let grown = {
            let mut g = c.clone();
            g.add_server(&mut rng);
            g
        };
        grown.save(&path).unwrap();
        assert_eq!(Collective::load(&path).unwrap().unwrap().len(), 4);
        assert!(!path.with_extension("json.tmp").exists());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn save_fails_when_the_directory_cannot_exist() {
        let mut rng = ChaCha20Rng::from_seed([4u8; 32]);
        let c = Collective::generate(2, &mut rng);

        let dir = std::env::temp_dir().join(format!("dc-roster-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let blocker = dir.join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        assert!(matches!(c.save(&blocker.join("roster.json")), Err(ApiError::Internal)));
        std::fs::remove_dir_all(dir).unwrap();
    }
}
