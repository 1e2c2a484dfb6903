use crate::errors::ApiError;
use crate::models::CreationQuery;
use crate::rows::{StoredRow, TotalNumRow};
use dc_crypto::CipherText;
use sqlx::{sqlite::SqlitePoolOptions, Pool, QueryBuilder, Row, Sqlite};

pub type Db = Pool<Sqlite>;

pub async fn connect(db_url: &str) -> Result<Db, ApiError> {
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .map_err(|_| ApiError::Internal)
}

/// A private in-memory database. One connection, so every query sees the same schema.
#[cfg(test)]
pub async fn connect_in_memory() -> Db {
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    init_schema(&db).await.unwrap();
    db
}

pub async fn init_schema(db: &Db) -> Result<(), ApiError> {
    // One row per (server, location, time, concept); the count is a base64 ciphertext under the
    // collective key.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS totalnums (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  node_index INTEGER NOT NULL,
  location_cd TEXT NOT NULL,
  time TEXT NOT NULL,
  concept_path TEXT NOT NULL,
  totalnum_b64 TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS totalnums_node ON totalnums(node_index);
"#,
    )
    .execute(db)
    .await
    .map_err(|_| ApiError::Internal)?;

    Ok(())
}

fn stored_ciphertext(b64: &str) -> Result<CipherText, ApiError> {
    CipherText::from_base64(b64).map_err(|e| {
        tracing::error!(error = %e, "corrupt ciphertext in storage");
        ApiError::Internal
    })
}

fn to_text(ct: &CipherText) -> Result<String, ApiError> {
    ct.to_base64().map_err(|_| ApiError::Internal)
}

/// Escape `\`, `%` and `_` so user text matches literally inside `LIKE ... ESCAPE '\'`.
pub fn like_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Row selection for one server. Every user-supplied value is a bound parameter.
///
/// Concept paths (exact or substring), time prefixes and locations are each OR-ed; the groups
/// are AND-ed together with the optional time window.
pub fn fetch_statement(node: usize, q: &CreationQuery, exact_path: bool) -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::new(
        "SELECT location_cd, time, concept_path, totalnum_b64 FROM totalnums WHERE node_index = ",
    );
    qb.push_bind(node as i64);

    if !q.concepts.is_empty() {
        qb.push(" AND (");
        let mut sep = qb.separated(" OR ");
        for path in &q.concepts {
            if exact_path {
                sep.push("concept_path = ").push_bind_unseparated(path.clone());
            } else {
                sep.push("concept_path LIKE ")
                    .push_bind_unseparated(format!("%{}%", like_escape(path)))
                    .push_unseparated(" ESCAPE '\\'");
            }
        }
        qb.push(")");
    }

    if !q.times.is_empty() {
        qb.push(" AND (");
        let mut sep = qb.separated(" OR ");
        for t in &q.times {
            sep.push("time LIKE ")
                .push_bind_unseparated(format!("{}%", like_escape(t)))
                .push_unseparated(" ESCAPE '\\'");
        }
        qb.push(")");
    }

    if !q.locations.is_empty() {
        qb.push(" AND (");
        let mut sep = qb.separated(" OR ");
        for loc in &q.locations {
            sep.push("location_cd = ").push_bind_unseparated(loc.clone());
        }
        qb.push(")");
    }

    if !q.from_time.is_empty() {
        qb.push(" AND time >= ").push_bind(q.from_time.clone());
    }
    if !q.to_time.is_empty() {
        qb.push(" AND time <= ").push_bind(q.to_time.clone());
    }

    qb.push(" ORDER BY location_cd ASC, id ASC");
    qb
}

pub async fn fetch_rows(db: &Db, node: usize, q: &CreationQuery, exact_path: bool) -> Result<Vec<TotalNumRow>, ApiError> {
    let rows = fetch_statement(node, q, exact_path)
        .build()
        .fetch_all(db)
        .await
        .map_err(|_| ApiError::Internal)?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let b64: String = row.get(3);
        out.push(TotalNumRow {
            location_cd: row.get(0),
            time: row.get(1),
            concept_path: row.get(2),
            totalnum: stored_ciphertext(&b64)?,
        });
    }
    Ok(out)
}

pub async fn insert_rows(db: &Db, rows: &[(usize, TotalNumRow)]) -> Result<u64, ApiError> {
    let mut tx = db.begin().await.map_err(|_| ApiError::Internal)?;
    for (node, row) in rows {
        sqlx::query(
            r#"INSERT INTO totalnums (node_index, location_cd, time, concept_path, totalnum_b64)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(*node as i64)
        .bind(&row.location_cd)
        .bind(&row.time)
        .bind(&row.concept_path)
        .bind(to_text(&row.totalnum)?)
        .execute(&mut *tx)
        .await
        .map_err(|_| ApiError::Internal)?;
    }
    tx.commit().await.map_err(|_| ApiError::Internal)?;
    Ok(rows.len() as u64)
}

pub async fn list_rows(db: &Db) -> Result<Vec<StoredRow>, ApiError> {
    let rows = sqlx::query(
        r#"SELECT id, node_index, location_cd, time, concept_path, totalnum_b64
           FROM totalnums ORDER BY id"#,
    )
    .fetch_all(db)
    .await
    .map_err(|_| ApiError::Internal)?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let node_index: i64 = row.get(1);
        let b64: String = row.get(5);
        out.push(StoredRow {
            id: row.get(0),
            node_index: node_index as usize,
            row: TotalNumRow {
                location_cd: row.get(2),
                time: row.get(3),
                concept_path: row.get(4),
                totalnum: stored_ciphertext(&b64)?,
            },
        });
    }
    Ok(out)
}

/// Overwrite re-keyed ciphertexts and, when a server left, drop its rows and close the gap in
/// node indices behind it. All of it commits together or not at all.
pub async fn apply_rekey(db: &Db, updates: &[(i64, CipherText)], departed: Option<usize>) -> Result<u64, ApiError> {
    let mut tx = db.begin().await.map_err(|_| ApiError::Internal)?;
    for (id, ct) in updates {
        sqlx::query(r#"UPDATE totalnums SET totalnum_b64 = ? WHERE id = ?"#)
            .bind(to_text(ct)?)
            .bind(*id)
            .execute(&mut *tx)
            .await
            .map_err(|_| ApiError::Internal)?;
    }

    let mut deleted = 0;
    if let Some(node) = departed {
        deleted = sqlx::query(r#"DELETE FROM totalnums WHERE node_index = ?"#)
            .bind(node as i64)
            .execute(&mut *tx)
            .await
            .map_err(|_| ApiError::Internal)?
            .rows_affected();
        sqlx::query(r#"UPDATE totalnums SET node_index = node_index - 1 WHERE node_index > ?"#)
            .bind(node as i64)
            .execute(&mut *tx)
            .await
            .map_err(|_| ApiError::Internal)?;
    }

    tx.commit().await.map_err(|_| ApiError::Internal)?;
    Ok(deleted)
}

pub async fn count_rows(db: &Db) -> Result<u64, ApiError> {
    let row = sqlx::query(r#"SELECT COUNT(*) AS c FROM totalnums"#)
        .fetch_one(db)
        .await
        .map_err(|_| ApiError::Internal)?;
    let c: i64 = row.get("c");
    Ok(c as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dc_crypto::elgamal::{decrypt_int, encrypt_int};
    use dc_crypto::KeyPair;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn row(loc: &str, time: &str, concept: &str, ct: CipherText) -> TotalNumRow {
        TotalNumRow { location_cd: loc.into(), time: time.into(), concept_path: concept.into(), totalnum: ct }
    }

    #[test]
    fn statement_binds_every_filter() {
        let q = CreationQuery {
            concepts: vec!["\\diag\\".into(), "50%".into()],
            times: vec!["2015".into()],
            locations: vec!["A".into(), "B".into()],
            from_time: "2010".into(),
            to_time: "2020".into(),
            ..Default::default()
        };
        let sql = fetch_statement(1, &q, false).sql().to_string();
        assert_eq!(
            sql,
            "SELECT location_cd, time, concept_path, totalnum_b64 FROM totalnums WHERE node_index = ? \
             AND (concept_path LIKE ? ESCAPE '\\' OR concept_path LIKE ? ESCAPE '\\') \
             AND (time LIKE ? ESCAPE '\\') AND (location_cd = ? OR location_cd = ?) \
             AND time >= ? AND time <= ? ORDER BY location_cd ASC, id ASC"
        );

        let exact = fetch_statement(0, &q, true).sql().to_string();
        assert!(exact.contains("(concept_path = ? OR concept_path = ?)"));
        assert_eq!(like_escape("50%_a\\b"), "50\\%\\_a\\\\b");
    }

    #[tokio::test]
    async fn fetch_filters_and_orders_rows() {
        let db = connect_in_memory().await;
        let mut rng = ChaCha20Rng::from_seed([41u8; 32]);
        let kp = KeyPair::generate(&mut rng);
        let mut ct = |v| encrypt_int(&kp.public, v, &mut rng);

        let rows = vec![
            (0, row("B", "2015-01", "\\diag\\flu\\", ct(4))),
            (0, row("A", "2015-03", "\\diag\\flu\\", ct(3))),
            (0, row("A", "2016-01", "\\diag\\cold\\", ct(9))),
            (0, row("A", "2015-02", "\\proc\\x\\", ct(1))),
            (1, row("A", "2015-01", "\\diag\\flu\\", ct(5))),
        ];
        insert_rows(&db, &rows).await.unwrap();

        let q = CreationQuery { concepts: vec!["diag".into()], times: vec!["2015".into()], ..Default::default() };
        let got = fetch_rows(&db, 0, &q, false).await.unwrap();
        let locs: Vec<&str> = got.iter().map(|r| r.location_cd.as_str()).collect();
        assert_eq!(locs, ["A", "B"]);
        assert_eq!(decrypt_int(&kp.secret, &got[0].totalnum).unwrap(), 3);

        let exact = CreationQuery { concepts: vec!["\\diag\\flu\\".into()], ..Default::default() };
        assert_eq!(fetch_rows(&db, 0, &exact, true).await.unwrap().len(), 2);
        // A literal `%` in user text must not act as a wildcard.
        let literal = CreationQuery { concepts: vec!["%".into()], ..Default::default() };
        assert!(fetch_rows(&db, 0, &literal, false).await.unwrap().is_empty());

        let window = CreationQuery { from_time: "2015-02".into(), to_time: "2015-12".into(), ..Default::default() };
        assert_eq!(fetch_rows(&db, 0, &window, false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rekey_with_departure_shifts_later_indices() {
        let db = connect_in_memory().await;
        let mut rng = ChaCha20Rng::from_seed([42u8; 32]);
        let kp = KeyPair::generate(&mut rng);

        let rows: Vec<(usize, TotalNumRow)> = (0..3)
            .map(|n| (n, row("A", "2015", "\\c\\", encrypt_int(&kp.public, n as i64, &mut rng))))
            .collect();
        insert_rows(&db, &rows).await.unwrap();
        let before = list_rows(&db).await.unwrap();

        let bumped = encrypt_int(&kp.public, 7, &mut rng);
        assert_eq!(apply_rekey(&db, &[(before[0].id, bumped)], Some(1)).await.unwrap(), 1);

        let left = list_rows(&db).await.unwrap();
        assert_eq!(left.iter().map(|r| r.node_index).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(left[0].row.totalnum, bumped);
        assert_eq!(decrypt_int(&kp.secret, &left[1].row.totalnum).unwrap(), 2);
        assert_eq!(count_rows(&db).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_rekey_leaves_rows_untouched() {
        let db = connect_in_memory().await;
        let mut rng = ChaCha20Rng::from_seed([43u8; 32]);
        let kp = KeyPair::generate(&mut rng);

        let rows: Vec<(usize, TotalNumRow)> = (0..2)
            .map(|n| (n, row("A", "2015", "\\c\\", encrypt_int(&kp.public, 5, &mut rng))))
            .collect();
        insert_rows(&db, &rows).await.unwrap();
        let before = list_rows(&db).await.unwrap();

        // Reject writes to the second row so the transaction aborts after the first update.
        sqlx::query(&format!(
            "CREATE TRIGGER reject_row BEFORE UPDATE ON totalnums WHEN OLD.id = {} \
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
            before[1].id
        ))
        .execute(&db)
        .await
        .unwrap();

        let first = encrypt_int(&kp.public, 9, &mut rng);
        let second = encrypt_int(&kp.public, 9, &mut rng);
        let res = apply_rekey(&db, &[(before[0].id, first), (before[1].id, second)], Some(1)).await;
        assert!(res.is_err());

        assert_eq!(list_rows(&db).await.unwrap(), before);
    }
}
