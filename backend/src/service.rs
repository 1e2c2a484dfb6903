//! Query orchestration.
//!
//! Each query lives in its own entry of a shared map and walks
//! `Created → Aggregating → KeySwitching → Completed` (or `Failed`) under its own lock, so one
//! slow or failing query never holds up another. Delivered states are dropped immediately; a
//! periodic sweep evicts the ones nobody came back for.

use crate::config::DcConfig;
use crate::errors::{ApiError, ProtocolError};
use crate::models::{CreationQuery, QueryId, ResultsQuery, ServiceAck, ServiceResult};
use crate::protocols::addrm_server::AddRmServer;
use crate::protocols::collective_aggregation::{CollectiveAggregation, GroupedData};
use crate::protocols::key_switching::KeySwitching;
use crate::protocols::tree::{LocalTree, Tree};
use crate::protocols::{run_nodes, ProtocolKind};
use crate::roster::{Collective, Roster};
use crate::rows::{GroupByAttr, RowSource, TotalNumRow};
use chrono::{DateTime, Utc};
use dc_crypto::codec::deserialize_point;
use dc_crypto::elgamal::encrypt_int;
use dc_crypto::grouping::GroupingKey;
use dc_crypto::{CipherText, CipherVector, CryptoError, DpResponse, FilteredResponse, Point, PublishedAddRmProof};
use rand::rngs::OsRng;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, error, info, warn};

/// Attribute name under which a stored count travels through re-keying.
const TOTALNUM_ATTR: &str = "totalnum";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryPhase {
    Created,
    Aggregating,
    KeySwitching,
    Completed,
    Failed,
}

#[derive(Clone, Debug)]
pub struct ServiceQueryState {
    pub query: CreationQuery,
    pub client_public_key: Option<Point>,
    pub phase: QueryPhase,
    pub aggregated_results: Vec<FilteredResponse>,
    pub key_switched_results: Vec<FilteredResponse>,
    pub groups: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ServiceQueryState {
    fn new(query: CreationQuery, client_public_key: Option<Point>) -> Self {
        Self {
            query,
            client_public_key,
            phase: QueryPhase::Created,
            aggregated_results: Vec::new(),
            key_switched_results: Vec::new(),
            groups: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub tree_branching: usize,
    pub parallelize: bool,
    pub proofs: bool,
    pub query_ttl: Duration,
}

impl From<&DcConfig> for ServiceConfig {
    fn from(c: &DcConfig) -> Self {
        Self {
            tree_branching: c.tree_branching,
            parallelize: c.parallelize,
            proofs: c.proofs,
            query_ttl: c.query_ttl,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    Add,
    Remove(usize),
}

#[derive(Debug)]
pub struct MembershipOutcome {
    pub roster: Roster,
    pub rekeyed_rows: usize,
    pub proofs: Vec<PublishedAddRmProof>,
}

/// Sum one server's rows into buckets keyed by their clear group-by values.
pub fn aggregate_rows(rows: &[TotalNumRow], attrs: &[GroupByAttr]) -> Result<GroupedData, CryptoError> {
    let mut buckets = GroupedData::new();
    for row in rows {
        let values: Vec<&str> = attrs.iter().map(|a| a.value(row)).collect();
        let key = GroupingKey::from_clear(&values);
        let count = CipherVector::new(vec![row.totalnum]);

        match buckets.get_mut(&key) {
            Some(bucket) => bucket.aggregating_attributes.add_assign(&count)?,
            None => {
                let bucket = FilteredResponse {
                    group_by_clear: values.iter().map(|v| v.to_string()).collect(),
                    group_by_enc: CipherVector::default(),
                    aggregating_attributes: count,
                };
                buckets.insert(key, bucket);
            }
        }
    }
    Ok(buckets)
}

pub struct Service {
    config: ServiceConfig,
    collective: RwLock<Collective>,
    rows: RowSource,
    roster_path: Option<PathBuf>,
    queries: RwLock<HashMap<QueryId, Arc<Mutex<ServiceQueryState>>>>,
}

impl Service {
    /// `roster_path`, when set, is rewritten after every membership change.
    pub fn new(config: ServiceConfig, collective: Collective, rows: RowSource, roster_path: Option<PathBuf>) -> Self {
        Self {
            config,
            collective: RwLock::new(collective),
            rows,
            roster_path,
            queries: RwLock::new(HashMap::new()),
        }
    }

    pub fn rows(&self) -> &RowSource {
        &self.rows
    }

    pub async fn roster(&self) -> Roster {
        self.collective.read().await.roster()
    }

    /// Shared view of the collective. Membership changes wait until every guard is dropped.
    pub async fn collective(&self) -> RwLockReadGuard<'_, Collective> {
        self.collective.read().await
    }

    /// Encrypt a count under the current collective key.
    pub async fn encrypt_count(&self, value: i64) -> CipherText {
        let public = self.collective.read().await.public_key();
        encrypt_int(&public, value, &mut OsRng)
    }

    #[cfg(test)]
    pub async fn pending_queries(&self) -> usize {
        self.queries.read().await.len()
    }

    #[cfg(test)]
    pub async fn query_phase(&self, id: &QueryId) -> Option<QueryPhase> {
        let entry = self.queries.read().await.get(id).cloned()?;
        let phase = entry.lock().await.phase;
        Some(phase)
    }

    pub async fn handle_creation_query(&self, mut query: CreationQuery) -> Result<ServiceAck, ApiError> {
        GroupByAttr::parse_all(&query.group_by)?;

        if let Some(roster) = &query.roster {
            if roster.aggregate != self.collective.read().await.public_key() {
                return Err(ApiError::Conflict("roster does not match the collective".to_string()));
            }
        }

        let client_public_key = query.client_public_key.as_deref().map(deserialize_point).transpose()?;

        if query.query_id.is_empty() {
            query.query_id = QueryId::generate();
        }
        let id = query.query_id.clone();

        let mut map = self.queries.write().await;
        if map.contains_key(&id) {
            debug!(query_id = %id, "creation retried; keeping existing state");
        } else {
            info!(query_id = %id, group_by = ?query.group_by, noisy = query.noisy, "query created");
            map.insert(id.clone(), Arc::new(Mutex::new(ServiceQueryState::new(query, client_public_key))));
        }

        Ok(ServiceAck { query_id: id })
    }

    /// Run the query to completion and hand back its results, encrypted for the client.
    pub async fn handle_results_query(&self, rq: ResultsQuery) -> Result<ServiceResult, ApiError> {
        let client_key = deserialize_point(&rq.client_public_key)?;

        let entry = self
            .queries
            .read()
            .await
            .get(&rq.query_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("query {} not found", rq.query_id)))?;

        let mut state = entry.lock().await;
        match state.phase {
            QueryPhase::Created => {}
            QueryPhase::Failed => return Err(ApiError::Conflict(format!("query {} failed", rq.query_id))),
            _ => return Err(ApiError::Conflict(format!("query {} already executed", rq.query_id))),
        }
        state.client_public_key = Some(client_key);

        let collective = self.collective.read().await;
        match self.run_query(&collective, &mut state).await {
            Ok(result) => {
                state.phase = QueryPhase::Completed;
                self.queries.write().await.remove(&rq.query_id);
                info!(query_id = %rq.query_id, groups = result.groups.len(), "results delivered");
                Ok(result)
            }
            Err(e) => {
                state.phase = QueryPhase::Failed;
                warn!(query_id = %rq.query_id, error = %e, "query failed");
                Err(e)
            }
        }
    }

    async fn run_query(&self, collective: &Collective, state: &mut ServiceQueryState) -> Result<ServiceResult, ApiError> {
        let id = state.query.query_id.clone();
        let attrs = GroupByAttr::parse_all(&state.query.group_by)?;
        let client_key = state
            .client_public_key
            .ok_or_else(|| ApiError::BadRequest("client public key missing".to_string()))?;

        state.phase = QueryPhase::Aggregating;
        info!(query_id = %id, servers = collective.len(), "aggregating");
        if state.query.noisy {
            debug!(query_id = %id, "noise requested; results are exact");
        }

        let mut locals = Vec::with_capacity(collective.len());
        for node in 0..collective.len() {
            let rows = self.rows.fetch(node, &state.query, state.query.exact_path).await?;
            debug!(query_id = %id, node, rows = rows.len(), "rows fetched");
            locals.push(aggregate_rows(&rows, &attrs)?);
        }

        let merged = self.collective_aggregation(collective, locals).await?;

        state.groups = merged.keys().map(|k| k.to_string()).collect();
        let mut counts = CipherVector::default();
        for bucket in merged.into_values() {
            counts.0.extend(bucket.aggregating_attributes.0);
        }
        state.aggregated_results = vec![FilteredResponse {
            aggregating_attributes: counts.clone(),
            ..FilteredResponse::default()
        }];

        state.phase = QueryPhase::KeySwitching;
        info!(query_id = %id, groups = state.groups.len(), "key switching");
        let switched = self.key_switching(collective, counts, client_key).await?;
        state.key_switched_results = vec![FilteredResponse {
            aggregating_attributes: switched,
            ..FilteredResponse::default()
        }];

        Ok(ServiceResult {
            results: std::mem::take(&mut state.key_switched_results),
            groups: std::mem::take(&mut state.groups),
        })
    }

    async fn collective_aggregation(&self, collective: &Collective, locals: Vec<GroupedData>) -> Result<GroupedData, ProtocolError> {
        let tree = Tree::n_ary(collective.len(), self.config.tree_branching);
        let mut feedback = None;
        let mut nodes = Vec::with_capacity(tree.len());

        for (inst, local) in LocalTree::instances(&tree).into_iter().zip(locals) {
            let root = inst.is_root();
            let mut proto = CollectiveAggregation::new(inst, local, self.config.parallelize);
            if root {
                feedback = Some(proto.feedback());
            }
            nodes.push(proto.dispatch());
        }

        let rx = feedback.ok_or_else(|| ProtocolError::Transport("empty roster".to_string()))?;
        run_nodes(ProtocolKind::CollectiveAggregation, nodes).await?;
        rx.await
            .map_err(|_| ProtocolError::Transport("aggregation finished without a result".to_string()))
    }

    async fn key_switching(&self, collective: &Collective, target: CipherVector, key: Point) -> Result<CipherVector, ProtocolError> {
        let tree = Tree::n_ary(collective.len(), self.config.tree_branching);
        let mut feedback = None;
        let mut nodes = Vec::with_capacity(tree.len());
        let mut target = Some(target);

        for (inst, share) in LocalTree::instances(&tree).into_iter().zip(collective.shares()) {
            let root = inst.is_root();
            let mut proto = KeySwitching::new(inst, share);
            if root {
                proto = proto.with_target(target.take().unwrap_or_default(), key);
                feedback = Some(proto.feedback());
            }
            nodes.push(proto.dispatch());
        }

        let rx = feedback.ok_or_else(|| ProtocolError::Transport("empty roster".to_string()))?;
        run_nodes(ProtocolKind::KeySwitching, nodes).await?;
        rx.await
            .map_err(|_| ProtocolError::Transport("key switching finished without a result".to_string()))
    }

    /// Drop states older than the TTL. Queries currently executing are left alone.
    pub async fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let ttl = self.config.query_ttl;

        let mut map = self.queries.write().await;
        let before = map.len();
        map.retain(|_, entry| match entry.try_lock() {
            Ok(state) => (now - state.created_at).to_std().unwrap_or_default() < ttl,
            Err(_) => true,
        });
        let evicted = before - map.len();
        if evicted > 0 {
            info!(evicted, remaining = map.len(), "expired query states evicted");
        }
        evicted
    }

    /// Add a server or remove one, re-keying every stored count so it stays decryptable under
    /// the new collective key. A removed server's own rows leave with it.
    pub async fn change_membership(&self, change: Membership) -> Result<MembershipOutcome, ApiError> {
        let mut collective = self.collective.write().await;
        let mut next = collective.clone();

        let (key, add, departed) = match change {
            Membership::Add => (next.add_server(&mut OsRng).keys.secret, true, None),
            Membership::Remove(index) => (next.remove_server(index)?.keys.secret, false, Some(index)),
        };

        let stored: Vec<_> = self
            .rows
            .all()
            .await?
            .into_iter()
            .filter(|r| Some(r.node_index) != departed)
            .collect();

        let input: Vec<DpResponse> = stored
            .iter()
            .map(|r| DpResponse {
                aggregating_attributes_enc: BTreeMap::from([(TOTALNUM_ATTR.to_string(), r.row.totalnum)]),
                ..DpResponse::default()
            })
            .collect();

        let mut proto = AddRmServer::new(input, key, add, self.config.proofs, self.config.parallelize);
        let rx = proto.feedback();
        proto.start().await?;
        let output = rx
            .await
            .map_err(|_| ProtocolError::Transport("add/rm finished without a result".to_string()))?;

        let updates = stored
            .iter()
            .zip(&output.responses)
            .map(|(r, resp)| {
                resp.aggregating_attributes_enc
                    .get(TOTALNUM_ATTR)
                    .map(|ct| (r.id, *ct))
                    .ok_or(ApiError::Internal)
            })
            .collect::<Result<Vec<_>, _>>()?;

        // New roster first: if the rows then fail, the old file is put back and nothing moved.
        if let Some(path) = &self.roster_path {
            next.save(path)?;
        }
        let dropped = match self.rows.apply_rekey(&updates, departed).await {
            Ok(dropped) => dropped,
            Err(e) => {
                if let Some(path) = &self.roster_path {
                    if collective.save(path).is_err() {
                        error!(path = %path.display(), "could not restore roster after failed re-keying");
                    }
                }
                return Err(e);
            }
        };
        if let Some(index) = departed {
            info!(index, dropped, "rows of departed server dropped");
        }

        *collective = next;
        info!(servers = collective.len(), rekeyed = updates.len(), proofs = output.proofs.len(), ?change, "membership changed");

        Ok(MembershipOutcome { roster: collective.roster(), rekeyed_rows: updates.len(), proofs: output.proofs })
    }
}

/// Periodically evict expired query states.
pub fn spawn_sweeper(service: Arc<Service>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            service.evict_expired().await;
        }
    })
}
