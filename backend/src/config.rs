use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process configuration, read once from the environment at start.
#[derive(Clone, Debug)]
pub struct DcConfig {
    pub addr: String,
    pub data_dir: PathBuf,

    /// Number of servers in a freshly generated roster.
    pub roster_size: usize,
    pub tree_branching: usize,

    /// Fan out per-bucket merges and per-record re-keying on the rayon pool.
    pub parallelize: bool,
    pub proofs: bool,

    pub query_ttl: Duration,

    /// Synthetic rows per server seeded at start; 0 disables seeding.
    pub seed_rows: u64,
}

impl Default for DcConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("data"),
            roster_size: 3,
            tree_branching: 2,
            parallelize: dc_crypto::constants::PARALLELIZE,
            proofs: true,
            query_ttl: Duration::from_secs(600),
            seed_rows: 0,
        }
    }
}

impl DcConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name → value source; unset or unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            addr: lookup("BACKEND_ADDR").unwrap_or(d.addr),
            data_dir: lookup("DC_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            roster_size: parse_or(&lookup, "DC_ROSTER_SIZE", d.roster_size).max(1),
            tree_branching: parse_or(&lookup, "DC_TREE_BRANCHING", d.tree_branching).max(1),
            parallelize: parse_or(&lookup, "DC_PARALLELIZE", d.parallelize),
            proofs: parse_or(&lookup, "DC_PROOFS", d.proofs),
            query_ttl: Duration::from_secs(parse_or(&lookup, "DC_QUERY_TTL_SECS", d.query_ttl.as_secs())),
            seed_rows: parse_or(&lookup, "DC_SEED_ROWS", d.seed_rows),
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match lookup(name) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable setting");
            default
        }),
        None => default,
    }
}
