//! Record types shared between the protocols and the service layer.

use crate::elgamal::{CipherText, CipherVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One aggregation bucket.
///
/// `group_by_enc` is identical across every copy of the same bucket, so merging only ever adds
/// `aggregating_attributes`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredResponse {
    pub group_by_clear: Vec<String>,
    pub group_by_enc: CipherVector,
    pub aggregating_attributes: CipherVector,
}

impl FilteredResponse {
    /// Bucket with identity ciphertexts of the given widths.
    pub fn new(grp_size: usize, attr_size: usize) -> Self {
        Self {
            group_by_clear: Vec::new(),
            group_by_enc: CipherVector::zeros(grp_size),
            aggregating_attributes: CipherVector::zeros(attr_size),
        }
    }
}

/// A data provider's record before grouping and filtering.
///
/// Ordered maps keep attribute iteration (and therefore proof transcripts) deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpResponse {
    pub group_by_clear: BTreeMap<String, i64>,
    pub group_by_enc: BTreeMap<String, CipherText>,
    pub where_clear: BTreeMap<String, i64>,
    pub where_enc: BTreeMap<String, CipherText>,
    pub aggregating_attributes_clear: BTreeMap<String, i64>,
    pub aggregating_attributes_enc: BTreeMap<String, CipherText>,
}

/// The encrypted attribute maps of a record as ordered vectors (attribute name order).
pub fn map_to_vector(m: &BTreeMap<String, CipherText>) -> CipherVector {
    m.values().copied().collect()
}
