//! Where per-server encrypted counts come from.

use crate::db::{self, Db};
use crate::errors::ApiError;
use crate::models::CreationQuery;
use dc_crypto::CipherText;
use std::str::FromStr;
#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use tokio::sync::RwLock;

/// One count row as the servers' databases hold it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TotalNumRow {
    pub location_cd: String,
    pub time: String,
    pub concept_path: String,
    pub totalnum: CipherText,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRow {
    pub id: i64,
    pub node_index: usize,
    pub row: TotalNumRow,
}

/// Columns a query may group by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupByAttr {
    LocationCd,
    ConceptPath,
    Time,
}

impl FromStr for GroupByAttr {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "location_cd" => Ok(GroupByAttr::LocationCd),
            "concept_path" => Ok(GroupByAttr::ConceptPath),
            "time" | "year" => Ok(GroupByAttr::Time),
            other => Err(ApiError::BadRequest(format!("cannot group by '{other}'"))),
        }
    }
}

impl GroupByAttr {
    pub fn parse_all(names: &[String]) -> Result<Vec<Self>, ApiError> {
        names.iter().map(|n| n.parse()).collect()
    }

    pub fn value<'a>(&self, row: &'a TotalNumRow) -> &'a str {
        match self {
            GroupByAttr::LocationCd => &row.location_cd,
            GroupByAttr::ConceptPath => &row.concept_path,
            GroupByAttr::Time => &row.time,
        }
    }
}

#[derive(Clone)]
pub enum RowSource {
    Sqlite(Db),
    /// Unit tests run the protocols against a plain vector.
    #[cfg(test)]
    Memory(Arc<RwLock<Vec<StoredRow>>>),
}

/// `LIKE` in sqlite ignores ASCII case; the in-memory filter does the same.
#[cfg(test)]
fn contains_ci(hay: &str, needle: &str) -> bool {
    hay.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
}

#[cfg(test)]
fn starts_with_ci(hay: &str, prefix: &str) -> bool {
    hay.to_ascii_lowercase().starts_with(&prefix.to_ascii_lowercase())
}

/// In-memory counterpart of [`db::fetch_statement`].
#[cfg(test)]
fn matches(row: &TotalNumRow, q: &CreationQuery, exact_path: bool) -> bool {
    let concept_ok = q.concepts.is_empty()
        || q.concepts.iter().any(|p| {
            if exact_path { row.concept_path == *p } else { contains_ci(&row.concept_path, p) }
        });
    let time_ok = q.times.is_empty() || q.times.iter().any(|t| starts_with_ci(&row.time, t));
    let location_ok = q.locations.is_empty() || q.locations.iter().any(|l| row.location_cd == *l);
    let from_ok = q.from_time.is_empty() || row.time.as_str() >= q.from_time.as_str();
    let to_ok = q.to_time.is_empty() || row.time.as_str() <= q.to_time.as_str();

    concept_ok && time_ok && location_ok && from_ok && to_ok
}

impl RowSource {
    #[cfg(test)]
    pub fn memory(rows: Vec<StoredRow>) -> Self {
        RowSource::Memory(Arc::new(RwLock::new(rows)))
    }

    /// Rows of server `node` selected by `q`, ordered by location.
    pub async fn fetch(&self, node: usize, q: &CreationQuery, exact_path: bool) -> Result<Vec<TotalNumRow>, ApiError> {
        match self {
            RowSource::Sqlite(db) => db::fetch_rows(db, node, q, exact_path).await,
            #[cfg(test)]
            RowSource::Memory(rows) => {
                let rows = rows.read().await;
                let mut out: Vec<&StoredRow> = rows
                    .iter()
                    .filter(|r| r.node_index == node && matches(&r.row, q, exact_path))
                    .collect();
                out.sort_by(|a, b| a.row.location_cd.cmp(&b.row.location_cd).then(a.id.cmp(&b.id)));
                Ok(out.into_iter().map(|r| r.row.clone()).collect())
            }
        }
    }

    pub async fn insert(&self, new_rows: Vec<(usize, TotalNumRow)>) -> Result<u64, ApiError> {
        match self {
            RowSource::Sqlite(db) => db::insert_rows(db, &new_rows).await,
            #[cfg(test)]
            RowSource::Memory(rows) => {
                let mut rows = rows.write().await;
                let mut next = rows.iter().map(|r| r.id).max().unwrap_or(0) + 1;
                let n = new_rows.len() as u64;
                for (node_index, row) in new_rows {
                    rows.push(StoredRow { id: next, node_index, row });
                    next += 1;
                }
                Ok(n)
            }
        }
    }

    pub async fn all(&self) -> Result<Vec<StoredRow>, ApiError> {
        match self {
            RowSource::Sqlite(db) => db::list_rows(db).await,
            #[cfg(test)]
            RowSource::Memory(rows) => Ok(rows.read().await.clone()),
        }
    }

    /// Store re-keyed counts and drop a departed server's rows as one unit.
    pub async fn apply_rekey(&self, updates: &[(i64, CipherText)], departed: Option<usize>) -> Result<u64, ApiError> {
        match self {
            RowSource::Sqlite(db) => db::apply_rekey(db, updates, departed).await,
            #[cfg(test)]
            RowSource::Memory(rows) => {
                let mut rows = rows.write().await;
                for (id, ct) in updates {
                    if let Some(r) = rows.iter_mut().find(|r| r.id == *id) {
                        r.row.totalnum = *ct;
                    }
                }
                let Some(node) = departed else { return Ok(0) };
                let before = rows.len();
                rows.retain(|r| r.node_index != node);
                let deleted = (before - rows.len()) as u64;
                for r in rows.iter_mut().filter(|r| r.node_index > node) {
                    r.node_index -= 1;
                }
                Ok(deleted)
            }
        }
    }
}
