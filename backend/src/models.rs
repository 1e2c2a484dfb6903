use crate::roster::Roster;
use dc_crypto::FilteredResponse;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one query's lifetime. Empty means "allocate one".
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(pub String);

impl QueryId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreationQuery {
    #[serde(default)]
    pub query_id: QueryId,

    /// The roster the client believes it is talking to; rejected when it disagrees with ours.
    #[serde(default)]
    pub roster: Option<Roster>,

    /// Base64 point. May also be supplied (or replaced) when results are requested.
    #[serde(default)]
    pub client_public_key: Option<String>,

    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub times: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
    /// Any of `location_cd`, `concept_path`, `time` (or its alias `year`).
    #[serde(default)]
    pub group_by: Vec<String>,

    #[serde(default)]
    pub from_time: String,
    #[serde(default)]
    pub to_time: String,

    /// Carried for compatibility; no noise is added.
    #[serde(default)]
    pub noisy: bool,

    /// Match concept paths exactly instead of by substring.
    #[serde(default)]
    pub exact_path: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceAck {
    pub query_id: QueryId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultsQuery {
    pub query_id: QueryId,
    pub client_public_key: String,
}

/// Body of `POST /api/v1/queries/:id/results`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultsRequest {
    pub client_public_key: String,
}

/// `results[0].aggregating_attributes[i]` is the count of `groups[i]`, encrypted under the
/// client key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceResult {
    pub results: Vec<FilteredResponse>,
    pub groups: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyAddRmResponse {
    pub ok: bool,
}

/// A data provider's count, to be encrypted under the collective key.
#[derive(Debug, Serialize, Deserialize)]
pub struct EncryptRequest {
    pub value: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EncryptResponse {
    /// Base64 ciphertext.
    pub ciphertext: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatasetSeedRequest {
    pub rows_per_server: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatasetSeedResponse {
    pub rows: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MembershipRequest {
    Add,
    Remove { index: usize },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MembershipResponse {
    pub roster: Roster,
    pub rekeyed_rows: usize,
    pub proofs: usize,
}

// Connector endpoints; field names follow the browser client.

#[derive(Debug, Serialize, Deserialize)]
pub struct TotalNumRequest {
    pub conceptpaths: Vec<String>,
    pub clientpublickey: String,
    #[serde(default)]
    pub noisy: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConceptTotal {
    pub conceptpath: String,
    pub totalnum: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TotalNumResponse {
    pub concepts: Vec<ConceptTotal>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TotalNumsRequest {
    pub conceptpath: String,
    pub clientpublickey: String,
    #[serde(default)]
    pub fromtime: String,
    #[serde(default)]
    pub totime: String,
    #[serde(default)]
    pub noisy: bool,
    /// `point` groups by location and time; anything else (`cumulative`) by location only.
    #[serde(default)]
    pub distribution: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupTotal {
    pub group: String,
    pub totalnum: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TotalNumsResponse {
    pub groups: Vec<GroupTotal>,
}
