use crate::config::DcConfig;
use crate::db::Db;
use crate::errors::ApiError;
use crate::roster::Collective;
use crate::rows::RowSource;
use crate::service::{Service, ServiceConfig};
use rand::rngs::OsRng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<DcConfig>,
    pub service: Arc<Service>,
}

pub fn roster_path(data_dir: &Path) -> PathBuf {
    data_dir.join("keys").join("roster.json")
}

/// Load the collective's keys from disk, generating and persisting a fresh roster on first start.
pub async fn load_or_generate_collective(data_dir: PathBuf, size: usize) -> Result<Collective, ApiError> {
    tokio::task::spawn_blocking(move || {
        let path = roster_path(&data_dir);
        if let Some(collective) = Collective::load(&path)? {
            info!(servers = collective.len(), path = %path.display(), "roster loaded");
            return Ok(collective);
        }

        // Key material comes from the OS; it is never derived from a seed.
        let collective = Collective::generate(size, &mut OsRng);
        collective.save(&path)?;
        info!(servers = collective.len(), path = %path.display(), "roster generated");
        Ok::<Collective, ApiError>(collective)
    })
    .await
    .map_err(|_| ApiError::Internal)?
}

impl AppState {
    pub async fn new(db: Db, config: DcConfig) -> Result<Self, ApiError> {
        let data_dir = config.data_dir.clone();
        let collective = load_or_generate_collective(data_dir.clone(), config.roster_size).await?;

        let service = Service::new(
            ServiceConfig::from(&config),
            collective,
            RowSource::Sqlite(db.clone()),
            Some(roster_path(&data_dir)),
        );

        Ok(Self { db, config: Arc::new(config), service: Arc::new(service) })
    }
}
