use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::item_source::JobMetadata;
use crate::store::Store;

/// Lifecycle states for one ingestion job, monotonic under normal flow.
/// Declaration order matches numeric state code order, so the derived `Ord`
/// agrees with the codes below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DumpState {
    Error,
    Created,
    Preparing,
    Prepared,
    Scheduling,
    Scheduled,
    Processing,
    Processed,
}

impl DumpState {
    pub fn code(&self) -> i32 {
        match self {
            DumpState::Error => -1,
            DumpState::Created => 0,
            DumpState::Preparing => 5,
            DumpState::Prepared => 10,
            DumpState::Scheduling => 15,
            DumpState::Scheduled => 20,
            DumpState::Processing => 25,
            DumpState::Processed => 30,
        }
    }

    pub fn from_code(code: i32) -> Option<DumpState> {
        match code {
            -1 => Some(DumpState::Error),
            0 => Some(DumpState::Created),
            5 => Some(DumpState::Preparing),
            10 => Some(DumpState::Prepared),
            15 => Some(DumpState::Scheduling),
            20 => Some(DumpState::Scheduled),
            25 => Some(DumpState::Processing),
            30 => Some(DumpState::Processed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DumpState::Error => "error",
            DumpState::Created => "created",
            DumpState::Preparing => "preparing",
            DumpState::Prepared => "prepared",
            DumpState::Scheduling => "scheduling",
            DumpState::Scheduled => "scheduled",
            DumpState::Processing => "processing",
            DumpState::Processed => "processed",
        }
    }

    pub fn from_str(s: &str) -> Option<DumpState> {
        match s {
            "error" => Some(DumpState::Error),
            "created" => Some(DumpState::Created),
            "preparing" => Some(DumpState::Preparing),
            "prepared" => Some(DumpState::Prepared),
            "scheduling" => Some(DumpState::Scheduling),
            "scheduled" => Some(DumpState::Scheduled),
            "processing" => Some(DumpState::Processing),
            "processed" => Some(DumpState::Processed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dump {
    pub id: Uuid,
    pub crawler: String,
    pub job: String,
    pub state: DumpState,
    pub items_crawled: i64,
    pub crawl_started_at: Option<DateTime<Utc>>,
    pub crawl_ended_at: Option<DateTime<Utc>>,
}

/// Fetch the dump for `(crawler, job)`, creating it in the `CREATED` state
/// the first time it is touched.
pub fn get_or_create(store: &dyn Store, crawler: &str, job: &str) -> Result<Dump> {
    if let Some(dump) = find(store, crawler, job)? {
        return Ok(dump);
    }

    let id = Uuid::new_v4();
    store.exec(
        "INSERT INTO dump (id, crawler, job, state, state_code, items_crawled) VALUES (?, ?, ?, ?, ?, 0)",
        &[&id.to_string(), &crawler, &job, &DumpState::Created.as_str(), &DumpState::Created.code()],
    )?;

    Ok(Dump {
        id,
        crawler: crawler.to_string(),
        job: job.to_string(),
        state: DumpState::Created,
        items_crawled: 0,
        crawl_started_at: None,
        crawl_ended_at: None,
    })
}

pub fn find(store: &dyn Store, crawler: &str, job: &str) -> Result<Option<Dump>> {
    let Some(id) = store.query_scalar_uuid_opt(
        "SELECT id FROM dump WHERE crawler = ? AND job = ?",
        &[&crawler, &job],
    )?
    else {
        return Ok(None);
    };

    let state_code = store.query_scalar_i64(
        "SELECT state_code FROM dump WHERE id = ? AND crawler = ?",
        &[&id.to_string(), &crawler],
    )?;
    let items_crawled = store.query_scalar_i64("SELECT items_crawled FROM dump WHERE id = ?", &[&id.to_string()])?;

    Ok(Some(Dump {
        id,
        crawler: crawler.to_string(),
        job: job.to_string(),
        state: DumpState::from_code(state_code as i32).ok_or_else(|| {
            PipelineError::StoreFatal(format!("dump {job} has unknown state_code {state_code}"))
        })?,
        items_crawled,
        crawl_started_at: None,
        crawl_ended_at: None,
    }))
}

pub fn set_state(store: &dyn Store, dump: &mut Dump, new_state: DumpState) -> Result<()> {
    store.exec(
        "UPDATE dump SET state = ?, state_code = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        &[&new_state.as_str(), &new_state.code(), &dump.id.to_string()],
    )?;
    dump.state = new_state;
    Ok(())
}

/// Fill `items_crawled` and the crawl timestamps from the source's job
/// metadata. Only meaningful the first time a dump is touched.
pub fn apply_job_metadata(store: &dyn Store, dump: &mut Dump, metadata: &JobMetadata) -> Result<()> {
    let started = DateTime::from_timestamp_millis(metadata.finished_time_ms - metadata.running_time_ms)
        .unwrap_or_else(Utc::now);
    let ended = DateTime::from_timestamp_millis(metadata.finished_time_ms).unwrap_or_else(Utc::now);

    store.exec(
        "UPDATE dump SET items_crawled = ?, crawl_started_at = ?, crawl_ended_at = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        &[
            &metadata.scrapy_stats.item_scraped_count,
            &started.to_rfc3339(),
            &ended.to_rfc3339(),
            &dump.id.to_string(),
        ],
    )?;
    dump.items_crawled = metadata.scrapy_stats.item_scraped_count;
    dump.crawl_started_at = Some(started);
    dump.crawl_ended_at = Some(ended);
    Ok(())
}

/// Guard used by `prepare`: the dump must not have progressed past CREATED.
pub fn require_at_most(dump: &Dump, allowed: DumpState) -> Result<()> {
    if dump.state > allowed {
        return Err(PipelineError::DumpStateTooLate {
            job: dump.job.clone(),
            actual: dump.state,
            allowed,
        });
    }
    Ok(())
}

/// Guard used by `import`/`wrap`: the dump must have reached at least
/// `required` before this operation is meaningful.
pub fn require_at_least(dump: &Dump, required: DumpState) -> Result<()> {
    if dump.state < required {
        return Err(PipelineError::DumpStateTooEarly {
            job: dump.job.clone(),
            actual: dump.state,
            required,
        });
    }
    Ok(())
}

/// Verify that `count(version where dump=D) == D.items_crawled` and, if so,
/// advance to PROCESSED. Returns `DumpCorrupted` on mismatch.
pub fn wrap(store: &dyn Store, dump: &mut Dump) -> Result<()> {
    require_at_least(dump, DumpState::Processing)?;
    require_at_most(dump, DumpState::Processing)?;

    let found = store.query_scalar_i64(
        "SELECT count(*) FROM version WHERE dump_id = ?",
        &[&dump.id.to_string()],
    )?;

    if found != dump.items_crawled {
        return Err(PipelineError::DumpCorrupted {
            job: dump.job.clone(),
            expected: dump.items_crawled,
            found,
        });
    }

    set_state(store, dump, DumpState::Processed)
}

/// Delete every fact row, then Versions, then the Dump itself, in one
/// transaction. Dictionary rows and SKUs are never touched.
pub fn prune(store: &dyn Store, dump: &Dump) -> Result<()> {
    store.begin()?;
    let result = (|| -> Result<()> {
        let dump_id = dump.id.to_string();
        for table in [
            "parameter",
            "position",
            "price",
            "rating",
            "reviews",
            "sales",
        ] {
            store.exec(
                &format!("DELETE FROM {table} WHERE version_id IN (SELECT id FROM version WHERE dump_id = ?)"),
                &[&dump_id],
            )?;
        }
        store.exec("DELETE FROM version WHERE dump_id = ?", &[&dump_id])?;
        store.exec("DELETE FROM dump WHERE id = ?", &[&dump_id])?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            store.commit()?;
            Ok(())
        }
        Err(e) => {
            store.rollback()?;
            Err(e)
        }
    }
}

/// Consolidate every SKU sharing `article` into the oldest one: re-point
/// every fact table and Version from the losers, then delete the losers.
pub fn merge_duplicates(store: &dyn Store, article: &str) -> Result<()> {
    store.begin()?;
    let result = (|| -> Result<()> {
        let winner = store.query_scalar_i64(
            "SELECT count(*) FROM sku WHERE article = ?",
            &[&article],
        )?;
        if winner <= 1 {
            return Ok(());
        }

        store.exec(
            "UPDATE version SET sku_id = (SELECT id FROM sku WHERE article = ? ORDER BY created_at, id LIMIT 1)
             WHERE sku_id IN (SELECT id FROM sku WHERE article = ? ORDER BY created_at, id OFFSET 1)",
            &[&article, &article],
        )?;
        for table in ["parameter", "position", "price", "rating", "reviews", "sales"] {
            store.exec(
                &format!(
                    "UPDATE {table} SET sku_id = (SELECT id FROM sku WHERE article = ? ORDER BY created_at, id LIMIT 1)
                     WHERE sku_id IN (SELECT id FROM sku WHERE article = ? ORDER BY created_at, id OFFSET 1)"
                ),
                &[&article, &article],
            )?;
        }
        store.exec(
            "DELETE FROM sku WHERE article = ? AND id NOT IN (SELECT id FROM sku WHERE article = ? ORDER BY created_at, id LIMIT 1)",
            &[&article, &article],
        )?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            store.commit()?;
            Ok(())
        }
        Err(e) => {
            store.rollback()?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::duckdb_store::DuckDbStore;

    #[test]
    fn state_codes_match_documented_values() {
        assert_eq!(DumpState::Error.code(), -1);
        assert_eq!(DumpState::Created.code(), 0);
        assert_eq!(DumpState::Preparing.code(), 5);
        assert_eq!(DumpState::Prepared.code(), 10);
        assert_eq!(DumpState::Scheduling.code(), 15);
        assert_eq!(DumpState::Scheduled.code(), 20);
        assert_eq!(DumpState::Processing.code(), 25);
        assert_eq!(DumpState::Processed.code(), 30);
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let store = DuckDbStore::open(":memory:").unwrap();
        let first = get_or_create(&store, "wb", "job-1").unwrap();
        let second = get_or_create(&store, "wb", "job-1").unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn prepare_guard_rejects_late_state() {
        let dump = Dump {
            id: Uuid::new_v4(),
            crawler: "wb".into(),
            job: "job-1".into(),
            state: DumpState::Processing,
            items_crawled: 0,
            crawl_started_at: None,
            crawl_ended_at: None,
        };
        let err = require_at_most(&dump, DumpState::Created).unwrap_err();
        assert!(matches!(err, PipelineError::DumpStateTooLate { .. }));
    }

    #[test]
    fn wrap_detects_corruption() {
        let store = DuckDbStore::open(":memory:").unwrap();
        let mut dump = get_or_create(&store, "wb", "job-1").unwrap();
        set_state(&store, &mut dump, DumpState::Processing).unwrap();
        dump.items_crawled = 100;
        store
            .exec("UPDATE dump SET items_crawled = 100 WHERE id = ?", &[&dump.id.to_string()])
            .unwrap();

        let err = wrap(&store, &mut dump).unwrap_err();
        assert!(matches!(err, PipelineError::DumpCorrupted { expected: 100, found: 0, .. }));
    }
}
