//! Add/remove-server re-keying.
//!
//! Shifts every encrypted attribute of a batch of data-provider responses by one server's share
//! (`C ± key·K`), so stored ciphertexts follow the collective key across a membership change
//! without being decrypted. Each transformed vector can come with a publicly verifiable proof.
//! The protocol is root-local; only the delivery goes through a channel.

use super::ProtocolState;
use crate::errors::ProtocolError;
use dc_crypto::elgamal::change_encryption;
use dc_crypto::proofs::verify_batch;
use dc_crypto::types::map_to_vector;
use dc_crypto::{CipherText, CryptoError, DpResponse, PublishedAddRmProof, Scalar};
use rand::rngs::OsRng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

#[derive(Clone, Debug)]
pub struct AddRmOutput {
    pub responses: Vec<DpResponse>,
    pub proofs: Vec<PublishedAddRmProof>,
}

fn shift_map(m: &BTreeMap<String, CipherText>, key: &Scalar, add: bool) -> BTreeMap<String, CipherText> {
    m.iter().map(|(name, ct)| (name.clone(), change_encryption(ct, key, add))).collect()
}

/// Re-key every encrypted attribute of `r`; clear attributes are copied.
pub fn transform_response(r: &DpResponse, key: &Scalar, add: bool) -> DpResponse {
    DpResponse {
        group_by_clear: r.group_by_clear.clone(),
        group_by_enc: shift_map(&r.group_by_enc, key, add),
        where_clear: r.where_clear.clone(),
        where_enc: shift_map(&r.where_enc, key, add),
        aggregating_attributes_clear: r.aggregating_attributes_clear.clone(),
        aggregating_attributes_enc: shift_map(&r.aggregating_attributes_enc, key, add),
    }
}

/// One proof per encrypted vector: group-by, where, aggregating.
pub fn prove_response(
    before: &DpResponse,
    after: &DpResponse,
    key: &Scalar,
    add: bool,
) -> Result<Vec<PublishedAddRmProof>, CryptoError> {
    let mut rng = OsRng;
    [
        (&before.group_by_enc, &after.group_by_enc),
        (&before.where_enc, &after.where_enc),
        (&before.aggregating_attributes_enc, &after.aggregating_attributes_enc),
    ]
    .into_iter()
    .map(|(b, a)| PublishedAddRmProof::create(&map_to_vector(b), &map_to_vector(a), key, add, &mut rng))
    .collect()
}

fn process_one(r: &DpResponse, key: &Scalar, add: bool, proofs: bool) -> Result<(DpResponse, Vec<PublishedAddRmProof>), CryptoError> {
    let after = transform_response(r, key, add);
    let published = if proofs { prove_response(r, &after, key, add)? } else { Vec::new() };
    Ok((after, published))
}

/// Transform (and prove) the whole batch; output order follows input order.
pub fn compute(
    input: &[DpResponse],
    key: &Scalar,
    add: bool,
    proofs: bool,
    parallel: bool,
) -> Result<AddRmOutput, ProtocolError> {
    let per_record: Vec<(DpResponse, Vec<PublishedAddRmProof>)> = if parallel {
        input.par_iter().map(|r| process_one(r, key, add, proofs)).collect::<Result<_, _>>()?
    } else {
        input.iter().map(|r| process_one(r, key, add, proofs)).collect::<Result<_, _>>()?
    };

    let (responses, proofs): (Vec<_>, Vec<Vec<_>>) = per_record.into_iter().unzip();
    let proofs: Vec<PublishedAddRmProof> = proofs.into_iter().flatten().collect();

    let all_valid = if parallel {
        proofs.par_iter().all(PublishedAddRmProof::verify)
    } else {
        verify_batch(&proofs)
    };
    if !all_valid {
        return Err(ProtocolError::ProofRejected(format!("batch of {} proofs", proofs.len())));
    }

    Ok(AddRmOutput { responses, proofs })
}

pub struct AddRmServer {
    input: Vec<DpResponse>,
    key_to_rm: Scalar,
    add: bool,
    proofs: bool,
    parallel: bool,
    feedback: Option<oneshot::Sender<AddRmOutput>>,
}

impl AddRmServer {
    pub fn new(input: Vec<DpResponse>, key_to_rm: Scalar, add: bool, proofs: bool, parallel: bool) -> Self {
        Self { input, key_to_rm, add, proofs, parallel, feedback: None }
    }

    pub fn feedback(&mut self) -> oneshot::Receiver<AddRmOutput> {
        let (tx, rx) = oneshot::channel();
        self.feedback = Some(tx);
        rx
    }

    /// Run the transformation on a blocking thread and hand the result to the feedback consumer.
    pub async fn start(mut self) -> Result<ProtocolState, ProtocolError> {
        let tx = self
            .feedback
            .take()
            .ok_or_else(|| ProtocolError::Transport("add/rm started without a feedback consumer".to_string()))?;

        let records = self.input.len();
        let Self { input, key_to_rm, add, proofs, parallel, .. } = self;
        let output = tokio::task::spawn_blocking(move || compute(&input, &key_to_rm, add, proofs, parallel))
            .await
            .map_err(|e| ProtocolError::Transport(format!("add/rm worker: {e}")))??;

        tracing::info!(records, proofs = output.proofs.len(), add, "add/rm batch verified");
        tx.send(output)
            .map_err(|_| ProtocolError::Transport("add/rm feedback dropped".to_string()))?;
        Ok(ProtocolState::Delivered)
    }
}
