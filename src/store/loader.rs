use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::metrics::PipelineMetrics;
use crate::store::{BulkLoadOutcome, Row, Store};

/// Collects heterogeneous rows keyed by destination table and flushes them
/// in slices, preferring the store's fast bulk path and falling back to
/// row-by-row inserts when a row is wide-text or the fast path rejects it.
///
/// Replaces the source's recursive `_commit`/`_commit_pg_copy` dance with a
/// bounded loop over `(fast_queue, row_queue)`: each iteration either
/// succeeds or evicts exactly one row, so it terminates in at most
/// `slice.len()` iterations.
pub struct BulkLoader<'s> {
    store: &'s dyn Store,
    max_chunk_size: usize,
    copy_safe: HashSet<&'static str>,
    queues: HashMap<&'static str, Vec<Row>>,
    metrics: Option<&'s PipelineMetrics>,
}

impl<'s> BulkLoader<'s> {
    pub fn new(store: &'s dyn Store, max_chunk_size: usize) -> Self {
        BulkLoader {
            store,
            max_chunk_size,
            copy_safe: HashSet::new(),
            queues: HashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: &'s PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Allow an otherwise wide-text entity onto the fast path. Used when an
    /// operator is confident the store's delimiter/escaping handles it.
    pub fn mark_copy_safe(&mut self, table: &'static str) {
        self.copy_safe.insert(table);
    }

    pub fn add(&mut self, row: Row) {
        self.queues.entry(row.table()).or_default().push(row);
    }

    /// Flush every non-empty queue. On return, every row added before this
    /// call is persisted.
    pub fn done(&mut self) -> Result<()> {
        let tables: Vec<&'static str> = self.queues.keys().copied().collect();
        for table in tables {
            let rows = self.queues.remove(table).unwrap_or_default();
            if rows.is_empty() {
                continue;
            }
            self.commit_table(table, rows)?;
        }
        Ok(())
    }

    fn commit_table(&self, table: &'static str, rows: Vec<Row>) -> Result<()> {
        let wide_text = rows.first().map(|r| r.wide_text()).unwrap_or(false);
        let fast_eligible = !wide_text || self.copy_safe.contains(table);

        for slice in rows.chunks(self.max_chunk_size) {
            if fast_eligible {
                self.commit_slice_fast(table, slice.to_vec())?;
            } else {
                self.commit_slice_row(table, slice)?;
            }
        }
        Ok(())
    }

    fn commit_slice_fast(&self, table: &'static str, slice: Vec<Row>) -> Result<()> {
        let mut fast_queue = slice;
        let mut row_queue: Vec<Row> = Vec::new();

        while !fast_queue.is_empty() {
            let columns = fast_queue[0].columns();
            let values: Vec<_> = fast_queue.iter().map(|r| r.values()).collect();

            match self.store.bulk_load_fast(table, columns, &values)? {
                BulkLoadOutcome::Loaded => {
                    if let Some(metrics) = self.metrics {
                        metrics.record_fast_path_rows(fast_queue.len() as u64);
                    }
                    fast_queue.clear();
                }
                BulkLoadOutcome::RowRejected { index, message } => {
                    log::warn!("{table}: row {index} rejected by fast path ({message}), evicting to row path");
                    let bad_row = fast_queue.remove(index);
                    row_queue.push(bad_row);
                }
            }
        }

        if !row_queue.is_empty() {
            self.commit_slice_row(table, &row_queue)?;
        }
        Ok(())
    }

    fn commit_slice_row(&self, table: &'static str, slice: &[Row]) -> Result<()> {
        for row in slice {
            self.store.insert_row(table, row.columns(), &row.values())?;
        }
        if let Some(metrics) = self.metrics {
            metrics.record_row_path_rows(slice.len() as u64);
        }
        Ok(())
    }
}
