use std::collections::HashMap;
use std::sync::Mutex;

use duckdb::types::Value;
use duckdb::{Connection, ToSql};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::store::{BulkLoadOutcome, Store};

/// Embedded-database backed Store. Wraps a single connection behind a mutex,
/// mirroring how the engine this crate grew from holds its connection: one
/// owned handle, lock for the duration of a statement, no caching here.
pub struct DuckDbStore {
    conn: Mutex<Connection>,
}

impl DuckDbStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| PipelineError::StoreFatal(format!("failed to open store at {path}: {e}")))?;

        let store = DuckDbStore {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| PipelineError::StoreFatal(format!("schema init failed: {e}")))?;
        Ok(())
    }
}

impl Store for DuckDbStore {
    fn lookup(&self, table: &str, key_column: &str, keys: &[String]) -> Result<HashMap<String, Uuid>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let conn = self.conn.lock().expect("store mutex poisoned");
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
            "SELECT {key_column}, id FROM {table} WHERE {key_column} IN ({placeholders})"
        );

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| PipelineError::StoreFatal(e.to_string()))?;
        let params: Vec<&dyn ToSql> = keys.iter().map(|k| k as &dyn ToSql).collect();

        let mut rows = stmt
            .query(params.as_slice())
            .map_err(|e| PipelineError::StoreFatal(e.to_string()))?;

        let mut out = HashMap::with_capacity(keys.len());
        while let Some(row) = rows.next().map_err(|e| PipelineError::StoreFatal(e.to_string()))? {
            let key: String = row.get(0).map_err(|e| PipelineError::StoreFatal(e.to_string()))?;
            let id: Uuid = row.get(1).map_err(|e| PipelineError::StoreFatal(e.to_string()))?;
            out.insert(key, id);
        }
        Ok(out)
    }

    fn bulk_load_fast(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Value>],
    ) -> Result<BulkLoadOutcome> {
        if rows.is_empty() {
            return Ok(BulkLoadOutcome::Loaded);
        }

        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut appender = conn
            .appender(table)
            .map_err(|e| PipelineError::StoreFatal(format!("could not open appender for {table}: {e}")))?;

        for (index, row) in rows.iter().enumerate() {
            debug_assert_eq!(row.len(), columns.len());
            let refs: Vec<&dyn ToSql> = row.iter().map(|v| v as &dyn ToSql).collect();
            if let Err(e) = appender.append_row(refs.as_slice()) {
                // Nothing in this appender session has been flushed yet, so
                // the slice is still uncommitted; the caller retries without
                // this row.
                return Ok(BulkLoadOutcome::RowRejected {
                    index,
                    message: e.to_string(),
                });
            }
        }

        appender
            .flush()
            .map_err(|e| PipelineError::StoreFatal(format!("appender flush failed for {table}: {e}")))?;

        Ok(BulkLoadOutcome::Loaded)
    }

    fn insert_row(&self, table: &str, columns: &[&str], values: &[Value]) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            columns.join(", ")
        );
        let params: Vec<&dyn ToSql> = values.iter().map(|v| v as &dyn ToSql).collect();
        conn.execute(&sql, params.as_slice())
            .map_err(|e| PipelineError::StoreRowRejected {
                entity: table.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn exec(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let affected = conn
            .execute(sql, params)
            .map_err(|e| PipelineError::StoreFatal(e.to_string()))?;
        Ok(affected as u64)
    }

    fn query_scalar_i64(&self, sql: &str, params: &[&dyn ToSql]) -> Result<i64> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(sql, params, |row| row.get(0))
            .map_err(|e| PipelineError::StoreFatal(e.to_string()))
    }

    fn query_scalar_uuid_opt(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Option<Uuid>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        match conn.query_row(sql, params, |row| row.get(0)) {
            Ok(id) => Ok(Some(id)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(PipelineError::StoreFatal(e.to_string())),
        }
    }

    fn duplicate_sku_articles(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let sql = "SELECT article FROM sku GROUP BY article HAVING count(*) > 1 LIMIT ?";
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| PipelineError::StoreFatal(e.to_string()))?;
        let mut rows = stmt
            .query([limit as i64])
            .map_err(|e| PipelineError::StoreFatal(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| PipelineError::StoreFatal(e.to_string()))? {
            out.push(row.get(0).map_err(|e| PipelineError::StoreFatal(e.to_string()))?);
        }
        Ok(out)
    }

    fn stale_dumps(&self, older_than_minutes: i64) -> Result<Vec<crate::store::DumpSummary>> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::minutes(older_than_minutes)).to_rfc3339();
        let conn = self.conn.lock().expect("store mutex poisoned");
        let sql = "SELECT crawler, job, state, state_code FROM dump \
                   WHERE updated_at < ? AND state_code NOT IN (-1, 30)";
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| PipelineError::StoreFatal(e.to_string()))?;
        let mut rows = stmt
            .query([cutoff])
            .map_err(|e| PipelineError::StoreFatal(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| PipelineError::StoreFatal(e.to_string()))? {
            out.push(crate::store::DumpSummary {
                crawler: row.get(0).map_err(|e| PipelineError::StoreFatal(e.to_string()))?,
                job: row.get(1).map_err(|e| PipelineError::StoreFatal(e.to_string()))?,
                state: row.get(2).map_err(|e| PipelineError::StoreFatal(e.to_string()))?,
                state_code: row.get(3).map_err(|e| PipelineError::StoreFatal(e.to_string()))?,
            });
        }
        Ok(out)
    }

    fn dumps_by_tags(&self, tags: &[String], state: Option<&str>) -> Result<Vec<crate::store::DumpSummary>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut sql = "SELECT crawler, job, state, state_code FROM dump WHERE 1 = 1".to_string();
        let mut owned_params: Vec<String> = Vec::new();

        if !tags.is_empty() {
            let placeholders = vec!["?"; tags.len()].join(", ");
            sql.push_str(&format!(" AND crawler IN ({placeholders})"));
            owned_params.extend(tags.iter().cloned());
        }
        if let Some(s) = state {
            sql.push_str(" AND state = ?");
            owned_params.push(s.to_string());
        }

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| PipelineError::StoreFatal(e.to_string()))?;
        let params: Vec<&dyn ToSql> = owned_params.iter().map(|p| p as &dyn ToSql).collect();
        let mut rows = stmt
            .query(params.as_slice())
            .map_err(|e| PipelineError::StoreFatal(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| PipelineError::StoreFatal(e.to_string()))? {
            out.push(crate::store::DumpSummary {
                crawler: row.get(0).map_err(|e| PipelineError::StoreFatal(e.to_string()))?,
                job: row.get(1).map_err(|e| PipelineError::StoreFatal(e.to_string()))?,
                state: row.get(2).map_err(|e| PipelineError::StoreFatal(e.to_string()))?,
                state_code: row.get(3).map_err(|e| PipelineError::StoreFatal(e.to_string()))?,
            });
        }
        Ok(out)
    }

    fn begin(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute_batch("BEGIN TRANSACTION")
            .map_err(|e| PipelineError::StoreFatal(e.to_string()))
    }

    fn commit(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute_batch("COMMIT")
            .map_err(|e| PipelineError::StoreFatal(e.to_string()))
    }

    fn rollback(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute_batch("ROLLBACK")
            .map_err(|e| PipelineError::StoreFatal(e.to_string()))
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS dict_marketplace (
    id UUID PRIMARY KEY,
    name VARCHAR NOT NULL,
    slug VARCHAR NOT NULL,
    url VARCHAR,
    UNIQUE (slug),
    UNIQUE (name, slug)
);

CREATE TABLE IF NOT EXISTS dict_brand (
    id UUID PRIMARY KEY,
    marketplace_id UUID NOT NULL,
    url VARCHAR NOT NULL,
    name VARCHAR
);
CREATE INDEX IF NOT EXISTS idx_dict_brand_url ON dict_brand (url);

CREATE TABLE IF NOT EXISTS dict_catalog (
    id UUID PRIMARY KEY,
    marketplace_id UUID NOT NULL,
    url VARCHAR NOT NULL,
    name VARCHAR,
    parent_id UUID
);
CREATE INDEX IF NOT EXISTS idx_dict_catalog_url ON dict_catalog (url);

CREATE TABLE IF NOT EXISTS dict_parameter (
    id UUID PRIMARY KEY,
    marketplace_id UUID NOT NULL,
    name VARCHAR NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dict_parameter_name ON dict_parameter (name);

CREATE TABLE IF NOT EXISTS sku (
    id UUID PRIMARY KEY,
    marketplace_id UUID NOT NULL,
    brand_id UUID,
    article VARCHAR NOT NULL,
    title VARCHAR,
    url VARCHAR NOT NULL,
    created_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sku_article ON sku (article);

CREATE TABLE IF NOT EXISTS dump (
    id UUID PRIMARY KEY,
    crawler VARCHAR NOT NULL,
    job VARCHAR NOT NULL,
    state VARCHAR NOT NULL,
    state_code INTEGER NOT NULL,
    items_crawled BIGINT NOT NULL DEFAULT 0,
    crawl_started_at TIMESTAMP,
    crawl_ended_at TIMESTAMP,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE (crawler, job)
);

CREATE TABLE IF NOT EXISTS version (
    id UUID PRIMARY KEY,
    dump_id UUID NOT NULL,
    sku_id UUID NOT NULL,
    crawled_at TIMESTAMP NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_version_dump ON version (dump_id);
CREATE INDEX IF NOT EXISTS idx_version_sku ON version (sku_id);

CREATE TABLE IF NOT EXISTS price (
    id UUID PRIMARY KEY,
    sku_id UUID NOT NULL,
    version_id UUID NOT NULL,
    price DOUBLE NOT NULL,
    UNIQUE (sku_id, version_id)
);

CREATE TABLE IF NOT EXISTS rating (
    id UUID PRIMARY KEY,
    sku_id UUID NOT NULL,
    version_id UUID NOT NULL,
    rating DOUBLE NOT NULL,
    UNIQUE (sku_id, version_id)
);

CREATE TABLE IF NOT EXISTS sales (
    id UUID PRIMARY KEY,
    sku_id UUID NOT NULL,
    version_id UUID NOT NULL,
    sales BIGINT NOT NULL,
    UNIQUE (sku_id, version_id)
);

CREATE TABLE IF NOT EXISTS reviews (
    id UUID PRIMARY KEY,
    sku_id UUID NOT NULL,
    version_id UUID NOT NULL,
    reviews BIGINT NOT NULL,
    UNIQUE (sku_id, version_id)
);

CREATE TABLE IF NOT EXISTS position (
    id UUID PRIMARY KEY,
    sku_id UUID NOT NULL,
    version_id UUID NOT NULL,
    catalog_id UUID NOT NULL,
    absolute BIGINT NOT NULL,
    UNIQUE (sku_id, version_id, catalog_id)
);

CREATE TABLE IF NOT EXISTS parameter (
    id UUID PRIMARY KEY,
    sku_id UUID NOT NULL,
    version_id UUID NOT NULL,
    parameter_id UUID NOT NULL,
    value VARCHAR NOT NULL,
    UNIQUE (sku_id, version_id, parameter_id)
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_sku_articles_finds_only_shared_ones() {
        let store = DuckDbStore::open(":memory:").unwrap();
        let marketplace_id = Uuid::new_v4();
        for (article, suffix) in [("X", "a"), ("X", "b"), ("Y", "a")] {
            store
                .insert_row(
                    "sku",
                    &["id", "marketplace_id", "article", "url", "created_at"],
                    &[
                        Value::Text(Uuid::new_v4().to_string()),
                        Value::Text(marketplace_id.to_string()),
                        Value::Text(article.to_string()),
                        Value::Text(format!("https://example/{article}/{suffix}")),
                        Value::Text(chrono::Utc::now().to_rfc3339()),
                    ],
                )
                .unwrap();
        }

        let dupes = store.duplicate_sku_articles(10).unwrap();
        assert_eq!(dupes, vec!["X".to_string()]);
    }

    #[test]
    fn dumps_by_tags_filters_by_crawler_and_state() {
        let store = DuckDbStore::open(":memory:").unwrap();
        store
            .insert_row(
                "dump",
                &["id", "crawler", "job", "state", "state_code"],
                &[
                    Value::Text(Uuid::new_v4().to_string()),
                    Value::Text("wb".into()),
                    Value::Text("job-1".into()),
                    Value::Text("prepared".into()),
                    Value::Int(10),
                ],
            )
            .unwrap();
        store
            .insert_row(
                "dump",
                &["id", "crawler", "job", "state", "state_code"],
                &[
                    Value::Text(Uuid::new_v4().to_string()),
                    Value::Text("ozon".into()),
                    Value::Text("job-2".into()),
                    Value::Text("created".into()),
                    Value::Int(0),
                ],
            )
            .unwrap();

        let wb_only = store.dumps_by_tags(&["wb".to_string()], None).unwrap();
        assert_eq!(wb_only.len(), 1);
        assert_eq!(wb_only[0].job, "job-1");

        let prepared_only = store.dumps_by_tags(&[], Some("prepared")).unwrap();
        assert_eq!(prepared_only.len(), 1);
        assert_eq!(prepared_only[0].job, "job-1");
    }

    #[test]
    fn stale_dumps_excludes_processed_and_error() {
        let store = DuckDbStore::open(":memory:").unwrap();
        for (job, state, code) in [("a", "processing", 25), ("b", "processed", 30), ("c", "error", -1)] {
            store
                .insert_row(
                    "dump",
                    &["id", "crawler", "job", "state", "state_code", "updated_at"],
                    &[
                        Value::Text(Uuid::new_v4().to_string()),
                        Value::Text("wb".into()),
                        Value::Text(job.into()),
                        Value::Text(state.into()),
                        Value::Int(code),
                        Value::Text("2000-01-01T00:00:00Z".into()),
                    ],
                )
                .unwrap();
        }

        let stale = store.stale_dumps(60).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].job, "a");
    }

    #[test]
    fn opens_in_memory_and_creates_schema() {
        let store = DuckDbStore::open(":memory:").unwrap();
        let count = store
            .query_scalar_i64("SELECT count(*) FROM dict_marketplace", &[])
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn opens_file_backed_store_and_creates_schema_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wdf.duckdb");
        let path = path.to_str().unwrap();

        let first = DuckDbStore::open(path).unwrap();
        first
            .insert_row(
                "dict_marketplace",
                &["id", "name", "slug", "url"],
                &[
                    Value::Text(Uuid::new_v4().to_string()),
                    Value::Text("Wildberries".into()),
                    Value::Text("wb".into()),
                    Value::Null,
                ],
            )
            .unwrap();
        drop(first);

        let second = DuckDbStore::open(path).unwrap();
        let count = second
            .query_scalar_i64("SELECT count(*) FROM dict_marketplace", &[])
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn lookup_on_empty_keys_skips_query() {
        let store = DuckDbStore::open(":memory:").unwrap();
        let result = store.lookup("dict_marketplace", "slug", &[]).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let store = DuckDbStore::open(":memory:").unwrap();
        let id = Uuid::new_v4();
        store
            .insert_row(
                "dict_marketplace",
                &["id", "name", "slug", "url"],
                &[
                    Value::Text(id.to_string()),
                    Value::Text("Wildberries".into()),
                    Value::Text("wb".into()),
                    Value::Null,
                ],
            )
            .unwrap();

        let found = store
            .lookup("dict_marketplace", "slug", &["wb".to_string()])
            .unwrap();
        assert_eq!(found.get("wb"), Some(&id));
    }

    #[test]
    fn bulk_load_fast_rejects_duplicate_unique_key() {
        let store = DuckDbStore::open(":memory:").unwrap();
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        let rows = vec![
            vec![
                Value::Text(id_a.to_string()),
                Value::Text("A".into()),
                Value::Text("dup".into()),
                Value::Null,
            ],
            vec![
                Value::Text(id_b.to_string()),
                Value::Text("B".into()),
                Value::Text("dup".into()),
                Value::Null,
            ],
        ];
        let outcome = store
            .bulk_load_fast("dict_marketplace", &["id", "name", "slug", "url"], &rows)
            .unwrap();
        match outcome {
            BulkLoadOutcome::RowRejected { index, .. } => assert_eq!(index, 1),
            BulkLoadOutcome::Loaded => panic!("expected the duplicate slug to be rejected"),
        }
    }
}
