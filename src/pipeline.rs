use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use duckdb::types::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::dump::{self, Dump, DumpState};
use crate::error::Result;
use crate::item_source::ItemSource;
use crate::metrics::PipelineMetrics;
use crate::resolver::Resolver;
use crate::store::loader::BulkLoader;
use crate::store::{
    DictionaryKind, ParameterFactRow, PositionRow, PriceRow, RatingRow, ReviewsRow, Row,
    SalesRow, Store, VersionRow,
};

/// A flag checked at chunk boundaries, wired to `SIGINT`/`SIGTERM` by the
/// CLI. Cloning shares the same underlying flag.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Find or create the marketplace dictionary row for `crawler`. Exactly one
/// marketplace exists per crawler tag; `slug` and `name` both default to the
/// tag itself since the item source never supplies a marketplace display name.
fn resolve_marketplace(store: &dyn Store, crawler: &str) -> Result<Uuid> {
    let found = store.lookup(
        DictionaryKind::Marketplace.table(),
        DictionaryKind::Marketplace.key_column(),
        &[crawler.to_string()],
    )?;
    if let Some(id) = found.get(crawler) {
        return Ok(*id);
    }

    let id = Uuid::new_v4();
    store.insert_row(
        DictionaryKind::Marketplace.table(),
        &["id", "name", "slug", "url"],
        &[
            Value::Text(id.to_string()),
            Value::Text(crawler.to_string()),
            Value::Text(crawler.to_string()),
            Value::Null,
        ],
    )?;
    Ok(id)
}

/// The single shared driver: stream fetch-chunks from the item source, fill
/// the resolver, and (when `save_versions`) emit version and fact rows.
/// Returns the number of items actually processed, which may be less than
/// `count` if cancelled or if the source ran dry.
pub async fn process_batch(
    store: &dyn Store,
    source: &dyn ItemSource,
    metrics: &PipelineMetrics,
    config: &Config,
    dump: &Dump,
    marketplace_id: Uuid,
    job_id: &str,
    start: usize,
    count: usize,
    save_versions: bool,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut processed = 0usize;
    let mut offset = start;
    let end = start + count;

    while offset < end {
        if cancel.is_cancelled() {
            log::warn!("process_batch({job_id}) cancelled at offset {offset}");
            break;
        }

        let take = (end - offset).min(config.get_chunk_size);
        let chunk = source.fetch(job_id, offset, take, config.get_chunk_size).await?;
        if chunk.items.is_empty() {
            break;
        }
        for item in &chunk.items {
            item.log_unrecognized_fields();
        }

        let chunk_started = Instant::now();
        let mut resolver = Resolver::new(store, marketplace_id);
        let mut loader = BulkLoader::new(store, config.save_chunk_size).with_metrics(metrics);

        resolver.collect(&chunk.items);
        resolver.resolve_all(&mut loader)?;

        if save_versions {
            for item in &chunk.items {
                let Ok(article) = item.guess_article() else {
                    log::warn!("job {job_id}: dropping item with unresolvable article");
                    continue;
                };
                let Some(sku_id) = resolver.sku_id(&article) else {
                    log::warn!("job {job_id}: sku {article} missing from resolver after resolve_all");
                    continue;
                };

                let version_id = Uuid::new_v4();
                let crawled_at = item.parse_date.unwrap_or_else(chrono::Utc::now);
                loader.add(Row::Version(VersionRow {
                    id: version_id,
                    dump_id: dump.id,
                    sku_id,
                    crawled_at,
                }));

                if let Some(price) = item.wb_price {
                    loader.add(Row::Price(PriceRow {
                        id: Uuid::new_v4(),
                        sku_id,
                        version_id,
                        price,
                    }));
                }
                if let Some(rating) = item.wb_rating {
                    loader.add(Row::Rating(RatingRow {
                        id: Uuid::new_v4(),
                        sku_id,
                        version_id,
                        rating,
                    }));
                }
                if let Some(sales) = item.wb_purchases_count {
                    loader.add(Row::Sales(SalesRow {
                        id: Uuid::new_v4(),
                        sku_id,
                        version_id,
                        sales,
                    }));
                }
                if let Some(reviews) = item.reviews_count() {
                    loader.add(Row::Reviews(ReviewsRow {
                        id: Uuid::new_v4(),
                        sku_id,
                        version_id,
                        reviews,
                    }));
                }
                if let (Some(absolute), Some(catalog_url)) =
                    (item.wb_category_position, item.wb_category_url.as_ref())
                {
                    if let Some(catalog_id) = resolver.catalog_id(catalog_url) {
                        loader.add(Row::Position(PositionRow {
                            id: Uuid::new_v4(),
                            sku_id,
                            version_id,
                            catalog_id,
                            absolute,
                        }));
                    }
                }
                for feature_map in &item.features {
                    for (name, value) in feature_map {
                        if let Some(parameter_id) = resolver.parameter_id(name) {
                            loader.add(Row::ParameterFact(ParameterFactRow {
                                id: Uuid::new_v4(),
                                sku_id,
                                version_id,
                                parameter_id,
                                value: value.clone(),
                            }));
                        }
                    }
                }
            }
            loader.done()?;
        }

        let n = chunk.items.len();
        processed += n;
        metrics.record_chunk(n, chunk_started.elapsed());
        metrics.sample_rss(config.rss_warn_threshold_kb);

        offset += n;
        if !chunk.has_more {
            break;
        }
    }

    Ok(processed)
}

async fn ensure_job_metadata(
    store: &dyn Store,
    source: &dyn ItemSource,
    dump: &mut Dump,
    job_id: &str,
) -> Result<()> {
    if dump.crawl_started_at.is_none() {
        let metadata = source.metadata(job_id).await?;
        dump::apply_job_metadata(store, dump, &metadata)?;
    }
    Ok(())
}

/// `prepare_dump(job)`: runs `process_batch` with `save_versions=false` over
/// the whole dump so every dictionary row and SKU exists before any parallel
/// `import_dump` task starts. Idempotent: a dump already at PREPARED returns
/// as-is; one past PREPARED (scheduled or beyond) still surfaces as
/// `DumpStateTooLate` via the same guard.
pub async fn prepare_dump(
    store: &dyn Store,
    source: &dyn ItemSource,
    metrics: &PipelineMetrics,
    config: &Config,
    job_id: &str,
    cancel: &CancellationToken,
) -> Result<Dump> {
    let mut d = dump::get_or_create(store, &config.crawler, job_id)?;

    if d.state >= DumpState::Prepared {
        dump::require_at_most(&d, DumpState::Prepared)?;
        return Ok(d);
    }

    ensure_job_metadata(store, source, &mut d, job_id).await?;
    dump::set_state(store, &mut d, DumpState::Preparing)?;

    let marketplace_id = resolve_marketplace(store, &config.crawler)?;
    process_batch(
        store,
        source,
        metrics,
        config,
        &d,
        marketplace_id,
        job_id,
        0,
        d.items_crawled as usize,
        false,
        cancel,
    )
    .await?;

    dump::set_state(store, &mut d, DumpState::Prepared)?;
    metrics.record_dump_prepared();
    Ok(d)
}

/// `import_dump(job, start, count)`: runs `process_batch` with
/// `save_versions=true` over `[start, start+count)`, inside a single
/// transaction so a failed chunk rolls the whole window back.
pub async fn import_dump(
    store: &dyn Store,
    source: &dyn ItemSource,
    metrics: &PipelineMetrics,
    config: &Config,
    job_id: &str,
    start: usize,
    count: usize,
    cancel: &CancellationToken,
) -> Result<Dump> {
    let mut d = dump::get_or_create(store, &config.crawler, job_id)?;
    dump::require_at_most(&d, DumpState::Processing)?;

    ensure_job_metadata(store, source, &mut d, job_id).await?;
    if d.state < DumpState::Processing {
        dump::set_state(store, &mut d, DumpState::Processing)?;
    }

    let marketplace_id = resolve_marketplace(store, &config.crawler)?;

    store.begin()?;
    let result = process_batch(
        store,
        source,
        metrics,
        config,
        &d,
        marketplace_id,
        job_id,
        start,
        count,
        true,
        cancel,
    )
    .await;

    match result {
        Ok(_) => store.commit()?,
        Err(e) => {
            store.rollback()?;
            return Err(e);
        }
    }

    metrics.record_dump_imported();
    Ok(d)
}

/// `wrap_dump(job)`: verify `count(Version where dump=D) == D.items_crawled`
/// and, on success, advance to PROCESSED.
pub fn wrap_dump(store: &dyn Store, config: &Config, job_id: &str) -> Result<Dump> {
    let mut d = dump::get_or_create(store, &config.crawler, job_id)?;
    dump::wrap(store, &mut d)?;
    Ok(d)
}

/// `prune(job)`: delete facts, versions, then the dump, in one transaction.
pub fn prune_dump(
    store: &dyn Store,
    metrics: &PipelineMetrics,
    config: &Config,
    job_id: &str,
) -> Result<()> {
    let d = dump::get_or_create(store, &config.crawler, job_id)?;
    dump::prune(store, &d)?;
    metrics.record_dump_pruned();
    Ok(())
}

/// `merge_duplicates(article)` for every article currently sharing more than
/// one SKU row. Each article is merged in its own transaction so one bad
/// merge never rolls back siblings. With `process_all`, re-scans in
/// `chunk_size` batches until the store reports none left; otherwise takes
/// a single batch.
pub fn run_merge_duplicates(store: &dyn Store, chunk_size: usize, process_all: bool) -> Result<usize> {
    let mut merged = 0usize;
    loop {
        let articles = store.duplicate_sku_articles(chunk_size)?;
        if articles.is_empty() {
            break;
        }
        for article in &articles {
            dump::merge_duplicates(store, article)?;
            merged += 1;
        }
        if !process_all {
            break;
        }
    }
    Ok(merged)
}

/// Drive one job's entire `prepare -> fan-out(import) -> wrap` chain
/// in-process and sequentially, for operators without a task broker.
/// `prepare_dump` is idempotent, so calling this on a partially-imported
/// dump resumes rather than restarting.
pub async fn run_full_dump(
    store: &dyn Store,
    source: &dyn ItemSource,
    metrics: &PipelineMetrics,
    config: &Config,
    job_id: &str,
    group_size: usize,
    cancel: &CancellationToken,
) -> Result<Dump> {
    let prepared = prepare_dump(store, source, metrics, config, job_id, cancel).await?;

    let graph = build_job_graph(job_id, prepared.items_crawled as usize, group_size);
    for task in &graph.imports {
        if cancel.is_cancelled() {
            log::warn!("run_full_dump({job_id}) cancelled before wrap; leaving dump in PROCESSING");
            return dump::get_or_create(store, &config.crawler, job_id);
        }
        if let TaskSpec::ImportDump { start, count, .. } = task {
            if *count == 0 {
                continue;
            }
            import_dump(store, source, metrics, config, job_id, *start, *count, cancel).await?;
        }
    }

    wrap_dump(store, config, job_id)
}

/// A plain, serializable description of the `prepare -> fan-out(import) ->
/// wrap` shape a scheduler composes the core operations into. This crate
/// never submits these to a broker; the CLI's `import_all` walks the same
/// shape sequentially in-process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum TaskSpec {
    PrepareDump { job: String },
    ImportDump { job: String, start: usize, count: usize },
    WrapDump { job: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobGraph {
    pub prepare: TaskSpec,
    pub imports: Vec<TaskSpec>,
    pub wrap: TaskSpec,
}

/// Build the task graph for one job: one `prepare`, `ceil(items/group_size)`
/// parallel `import` windows, and a terminal `wrap`.
pub fn build_job_graph(job: &str, items_crawled: usize, group_size: usize) -> JobGraph {
    let mut imports = Vec::new();
    let mut start = 0;
    while start < items_crawled {
        let count = group_size.min(items_crawled - start);
        imports.push(TaskSpec::ImportDump {
            job: job.to_string(),
            start,
            count,
        });
        start += count;
    }
    if imports.is_empty() {
        imports.push(TaskSpec::ImportDump {
            job: job.to_string(),
            start: 0,
            count: 0,
        });
    }

    JobGraph {
        prepare: TaskSpec::PrepareDump { job: job.to_string() },
        imports,
        wrap: TaskSpec::WrapDump { job: job.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_graph_windows_cover_items_crawled_without_overlap() {
        let graph = build_job_graph("job-1", 26, 10);
        assert_eq!(graph.imports.len(), 3);
        let mut covered = 0usize;
        for task in &graph.imports {
            if let TaskSpec::ImportDump { start, count, .. } = task {
                assert_eq!(*start, covered);
                covered += count;
            }
        }
        assert_eq!(covered, 26);
    }

    #[test]
    fn job_graph_with_zero_items_still_has_one_import_window() {
        let graph = build_job_graph("job-empty", 0, 10);
        assert_eq!(graph.imports.len(), 1);
    }

    #[test]
    fn cancellation_token_is_shared_across_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    use crate::item_source::{Item, ItemChunk, JobMetadata, ReviewsCount, ScrapyStats};
    use crate::store::duckdb_store::DuckDbStore;

    struct FixedItemSource {
        items: Vec<Item>,
        items_crawled: i64,
    }

    #[async_trait::async_trait]
    impl ItemSource for FixedItemSource {
        async fn metadata(&self, _job_id: &str) -> Result<JobMetadata> {
            Ok(JobMetadata {
                running_time_ms: 1_000,
                finished_time_ms: 2_000,
                scrapy_stats: ScrapyStats {
                    item_scraped_count: self.items_crawled,
                },
            })
        }

        async fn fetch(&self, _job_id: &str, start: usize, count: usize, chunk_size: usize) -> Result<ItemChunk> {
            let take = count.min(chunk_size);
            if start >= self.items.len() {
                return Ok(ItemChunk {
                    items: Vec::new(),
                    has_more: false,
                });
            }
            let end = (start + take).min(self.items.len());
            let has_more = end < self.items.len() && end < start + count;
            Ok(ItemChunk {
                items: self.items[start..end].to_vec(),
                has_more,
            })
        }
    }

    fn sample_items(n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| {
                let brand_idx = i % 4;
                Item {
                    wb_id: Some(i.to_string()),
                    product_url: Some(format!("https://example/catalog/{i}/detail.aspx")),
                    product_name: Some(format!("Product {i}")),
                    parse_date: None,
                    wb_category_url: Some("https://example/cat-a".into()),
                    wb_category_name: Some("Category A".into()),
                    wb_category_position: if i % 3 == 0 { None } else { Some(i as i64) },
                    wb_brand_url: Some(format!("https://example/brand-{brand_idx}")),
                    wb_brand_name: Some(format!("Brand {brand_idx}")),
                    wb_price: if i % 7 == 0 { None } else { Some(100.0 + i as f64) },
                    wb_rating: Some(4.5),
                    wb_purchases_count: Some(10),
                    wb_reviews_count: Some(ReviewsCount::Count(5)),
                    features: vec![],
                    ..Default::default()
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn full_dump_run_produces_one_version_per_item_and_matching_facts() {
        let store = DuckDbStore::open(":memory:").unwrap();
        let metrics = PipelineMetrics::new();
        let config = Config {
            get_chunk_size: 5,
            save_chunk_size: 5,
            group_size: 10,
            crawler: "wb".into(),
            ..Config::default()
        };
        let items = sample_items(26);
        let expected_price = items.iter().filter(|i| i.wb_price.is_some()).count() as i64;
        let source = FixedItemSource {
            items,
            items_crawled: 26,
        };
        let cancel = CancellationToken::new();

        let dump = run_full_dump(&store, &source, &metrics, &config, "job-1", config.group_size, &cancel)
            .await
            .unwrap();
        assert_eq!(dump.state, DumpState::Processed);

        let version_count = store.query_scalar_i64("SELECT count(*) FROM version", &[]).unwrap();
        assert_eq!(version_count, 26);

        let price_count = store.query_scalar_i64("SELECT count(*) FROM price", &[]).unwrap();
        assert_eq!(price_count, expected_price);

        let rating_count = store.query_scalar_i64("SELECT count(*) FROM rating", &[]).unwrap();
        assert_eq!(rating_count, 26);

        let brand_count = store.query_scalar_i64("SELECT count(*) FROM dict_brand", &[]).unwrap();
        assert_eq!(brand_count, 4);
    }

    #[tokio::test]
    async fn prepare_dump_twice_is_a_no_op() {
        let store = DuckDbStore::open(":memory:").unwrap();
        let metrics = PipelineMetrics::new();
        let config = Config {
            crawler: "wb".into(),
            ..Config::default()
        };
        let source = FixedItemSource {
            items: sample_items(1),
            items_crawled: 1,
        };
        let cancel = CancellationToken::new();

        let first = prepare_dump(&store, &source, &metrics, &config, "job-x", &cancel).await.unwrap();
        let second = prepare_dump(&store, &source, &metrics, &config, "job-x", &cancel).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.state, DumpState::Prepared);
    }

    #[tokio::test]
    async fn prune_then_reimport_matches_clean_import() {
        let store = DuckDbStore::open(":memory:").unwrap();
        let metrics = PipelineMetrics::new();
        let config = Config {
            crawler: "wb".into(),
            group_size: 26,
            ..Config::default()
        };
        let source = FixedItemSource {
            items: sample_items(26),
            items_crawled: 26,
        };
        let cancel = CancellationToken::new();

        run_full_dump(&store, &source, &metrics, &config, "job-y", config.group_size, &cancel)
            .await
            .unwrap();
        let first_count = store.query_scalar_i64("SELECT count(*) FROM version", &[]).unwrap();

        prune_dump(&store, &metrics, &config, "job-y").unwrap();
        let after_prune = store.query_scalar_i64("SELECT count(*) FROM version", &[]).unwrap();
        assert_eq!(after_prune, 0);

        run_full_dump(&store, &source, &metrics, &config, "job-y", config.group_size, &cancel)
            .await
            .unwrap();
        let second_count = store.query_scalar_i64("SELECT count(*) FROM version", &[]).unwrap();
        assert_eq!(first_count, second_count);
    }
}
