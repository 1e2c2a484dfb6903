use crate::dataset;
use crate::errors::ApiError;
use crate::models::*;
use crate::roster::Roster;
use crate::service::{Membership, Service};
use crate::state::AppState;
use axum::{
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use dc_crypto::codec::{deserialize_point, serialize_point};
use dc_crypto::elgamal::encrypt_int;
use dc_crypto::{CipherText, Point, PublishedAddRmProof};
use rand::rngs::OsRng;
use tokio::task::JoinSet;
use tower_http::cors::{Any, CorsLayer};

/// Rows per server seeded when the request does not say.
const DEFAULT_SEED_ROWS: u64 = 100;

pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/api/v1/datasets", post(seed_dataset))
        .route("/api/v1/roster/servers", post(change_membership))
        .layer(middleware::from_fn(auth_middleware));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/roster", get(get_roster))
        .route("/api/v1/queries", post(create_query))
        .route("/api/v1/queries/:id/results", post(query_results))
        .route("/api/v1/verify/addrm", post(verify_addrm))
        .route("/api/v1/encrypt", post(encrypt_value))
        .route("/totalnum", post(totalnum))
        .route("/totalnums", post(totalnums))
        .merge(protected_routes)
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn auth_middleware(
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // In production, this should be a strong secret from environment.
    let expected_key = std::env::var("API_KEY").unwrap_or_else(|_| "dev-secret-key".to_string());

    if let Some(provided_key) = headers.get("X-API-KEY") {
        if provided_key == expected_key.as_str() {
            return Ok(next.run(request).await);
        }
    }

    tracing::warn!("unauthorized access attempt");
    Err(StatusCode::UNAUTHORIZED)
}

async fn get_roster(State(state): State<AppState>) -> Json<Roster> {
    Json(state.service.roster().await)
}

async fn create_query(State(state): State<AppState>, Json(req): Json<CreationQuery>) -> Result<Json<ServiceAck>, ApiError> {
    Ok(Json(state.service.handle_creation_query(req).await?))
}

async fn query_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResultsRequest>,
) -> Result<Json<ServiceResult>, ApiError> {
    let rq = ResultsQuery { query_id: QueryId(id), client_public_key: req.client_public_key };
    Ok(Json(state.service.handle_results_query(rq).await?))
}

async fn verify_addrm(Json(proof): Json<PublishedAddRmProof>) -> Json<VerifyAddRmResponse> {
    Json(VerifyAddRmResponse { ok: proof.verify() })
}

async fn encrypt_value(State(state): State<AppState>, Json(req): Json<EncryptRequest>) -> Result<Json<EncryptResponse>, ApiError> {
    let ct = state.service.encrypt_count(req.value).await;
    Ok(Json(EncryptResponse { ciphertext: ct.to_base64()? }))
}

async fn seed_dataset(State(state): State<AppState>, Json(req): Json<DatasetSeedRequest>) -> Result<Json<DatasetSeedResponse>, ApiError> {
    let per_server = match req.rows_per_server {
        Some(n) => n,
        None if state.config.seed_rows > 0 => state.config.seed_rows,
        None => DEFAULT_SEED_ROWS,
    };
    let rows = dataset::seed(&state.service, per_server).await?;
    Ok(Json(DatasetSeedResponse { rows }))
}

async fn change_membership(State(state): State<AppState>, Json(req): Json<MembershipRequest>) -> Result<Json<MembershipResponse>, ApiError> {
    let change = match req {
        MembershipRequest::Add => Membership::Add,
        MembershipRequest::Remove { index } => Membership::Remove(index),
    };
    let outcome = state.service.change_membership(change).await?;
    Ok(Json(MembershipResponse {
        roster: outcome.roster,
        rekeyed_rows: outcome.rekeyed_rows,
        proofs: outcome.proofs.len(),
    }))
}

/// Create a query and immediately collect its results for `client_key`.
async fn run_for_client(service: &Service, query: CreationQuery, client_key: &str) -> Result<ServiceResult, ApiError> {
    let ack = service.handle_creation_query(query).await?;
    service
        .handle_results_query(ResultsQuery { query_id: ack.query_id, client_public_key: client_key.to_string() })
        .await
}

/// A count nobody contributed to, encrypted for the client so it looks like any other result.
fn zero_for(client_key: &Point) -> CipherText {
    encrypt_int(client_key, 0, &mut OsRng)
}

async fn totalnum(State(state): State<AppState>, Json(req): Json<TotalNumRequest>) -> Result<Json<TotalNumResponse>, ApiError> {
    let client_key = deserialize_point(&req.clientpublickey)?;

    let mut set = JoinSet::new();
    for (i, path) in req.conceptpaths.iter().cloned().enumerate() {
        let service = state.service.clone();
        let key = req.clientpublickey.clone();
        let noisy = req.noisy;
        set.spawn(async move {
            let query = CreationQuery { concepts: vec![path.clone()], noisy, ..Default::default() };
            (i, path, run_for_client(&service, query, &key).await)
        });
    }

    let mut slots: Vec<Option<ConceptTotal>> = (0..req.conceptpaths.len()).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        let (i, path, res) = joined.map_err(|_| ApiError::Internal)?;
        let res = res?;
        let count = res
            .results
            .first()
            .and_then(|r| r.aggregating_attributes.0.first().copied())
            .unwrap_or_else(|| zero_for(&client_key));
        slots[i] = Some(ConceptTotal { conceptpath: path, totalnum: count.to_base64()? });
    }

    Ok(Json(TotalNumResponse { concepts: slots.into_iter().flatten().collect() }))
}

async fn totalnums(State(state): State<AppState>, Json(req): Json<TotalNumsRequest>) -> Result<Json<TotalNumsResponse>, ApiError> {
    // Rejected before a query state exists; the re-encoded form is what the service sees.
    let client_key = serialize_point(&deserialize_point(&req.clientpublickey)?)?;

    let mut group_by = vec!["location_cd".to_string()];
    if req.distribution == "point" {
        group_by.push("year".to_string());
    }
    let query = CreationQuery {
        concepts: vec![req.conceptpath],
        group_by,
        from_time: req.fromtime,
        to_time: req.totime,
        noisy: req.noisy,
        ..Default::default()
    };
    let res = run_for_client(&state.service, query, &client_key).await?;

    let counts = res.results.first().map(|r| r.aggregating_attributes.0.as_slice()).unwrap_or_default();
    let groups = res
        .groups
        .into_iter()
        .zip(counts)
        .map(|(group, ct)| Ok(GroupTotal { group, totalnum: ct.to_base64()? }))
        .collect::<Result<Vec<_>, ApiError>>()?;

    Ok(Json(TotalNumsResponse { groups }))
}
