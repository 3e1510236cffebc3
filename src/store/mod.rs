pub mod duckdb_store;
pub mod loader;

use std::collections::HashMap;

use duckdb::types::Value;
use duckdb::ToSql;
use uuid::Uuid;

use crate::error::Result;

/// The four dictionary kinds plus the SKU table, resolved by natural key.
/// A closed enum in place of the source's string-keyed attribute routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DictionaryKind {
    Marketplace,
    Brand,
    Catalog,
    Parameter,
    Sku,
}

impl DictionaryKind {
    pub fn table(&self) -> &'static str {
        match self {
            DictionaryKind::Marketplace => "dict_marketplace",
            DictionaryKind::Brand => "dict_brand",
            DictionaryKind::Catalog => "dict_catalog",
            DictionaryKind::Parameter => "dict_parameter",
            DictionaryKind::Sku => "sku",
        }
    }

    /// The column that holds the natural key used for lookup/cache.
    pub fn key_column(&self) -> &'static str {
        match self {
            DictionaryKind::Marketplace => "slug",
            DictionaryKind::Brand => "url",
            DictionaryKind::Catalog => "url",
            DictionaryKind::Parameter => "name",
            DictionaryKind::Sku => "article",
        }
    }

    pub fn all() -> [DictionaryKind; 5] {
        [
            DictionaryKind::Marketplace,
            DictionaryKind::Brand,
            DictionaryKind::Catalog,
            DictionaryKind::Parameter,
            DictionaryKind::Sku,
        ]
    }
}

/// Load mode chosen per slice by the bulk loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Fast,
    Row,
}

/// A row destined for one table, carrying enough information for both the
/// fast appender path and the row-level fallback path. Replaces the source's
/// heterogeneous queue keyed by ORM model class.
pub trait BulkRow: Send + Sync {
    fn table(&self) -> &'static str;
    fn columns(&self) -> &'static [&'static str];
    fn values(&self) -> Vec<Value>;
    /// Entities with free-text columns default to the row path; see
    /// `BulkLoader::pick_mode`.
    fn wide_text(&self) -> bool {
        false
    }
}

macro_rules! bulk_row {
    ($name:ident, $table:literal, wide_text = $wide:literal, { $($field:ident : $ty:ty => $col:literal),+ $(,)? }) => {
        #[derive(Debug, Clone)]
        pub struct $name {
            $(pub $field: $ty),+
        }

        impl BulkRow for $name {
            fn table(&self) -> &'static str { $table }
            fn columns(&self) -> &'static [&'static str] { &[$($col),+] }
            fn wide_text(&self) -> bool { $wide }
            fn values(&self) -> Vec<Value> {
                vec![$(self.$field.clone().into()),+]
            }
        }
    };
}

bulk_row!(MarketplaceRow, "dict_marketplace", wide_text = false, {
    id: Uuid => "id",
    name: String => "name",
    slug: String => "slug",
    url: Option<String> => "url",
});

bulk_row!(BrandRow, "dict_brand", wide_text = false, {
    id: Uuid => "id",
    marketplace_id: Uuid => "marketplace_id",
    url: String => "url",
    name: Option<String> => "name",
});

bulk_row!(CatalogRow, "dict_catalog", wide_text = false, {
    id: Uuid => "id",
    marketplace_id: Uuid => "marketplace_id",
    url: String => "url",
    name: Option<String> => "name",
    parent_id: Option<Uuid> => "parent_id",
});

bulk_row!(ParameterDictRow, "dict_parameter", wide_text = false, {
    id: Uuid => "id",
    marketplace_id: Uuid => "marketplace_id",
    name: String => "name",
});

bulk_row!(SkuRow, "sku", wide_text = true, {
    id: Uuid => "id",
    marketplace_id: Uuid => "marketplace_id",
    brand_id: Option<Uuid> => "brand_id",
    article: String => "article",
    title: Option<String> => "title",
    url: String => "url",
    created_at: chrono::DateTime<chrono::Utc> => "created_at",
});

bulk_row!(VersionRow, "version", wide_text = false, {
    id: Uuid => "id",
    dump_id: Uuid => "dump_id",
    sku_id: Uuid => "sku_id",
    crawled_at: chrono::DateTime<chrono::Utc> => "crawled_at",
});

bulk_row!(PriceRow, "price", wide_text = false, {
    id: Uuid => "id",
    sku_id: Uuid => "sku_id",
    version_id: Uuid => "version_id",
    price: f64 => "price",
});

bulk_row!(RatingRow, "rating", wide_text = false, {
    id: Uuid => "id",
    sku_id: Uuid => "sku_id",
    version_id: Uuid => "version_id",
    rating: f64 => "rating",
});

bulk_row!(SalesRow, "sales", wide_text = false, {
    id: Uuid => "id",
    sku_id: Uuid => "sku_id",
    version_id: Uuid => "version_id",
    sales: i64 => "sales",
});

bulk_row!(ReviewsRow, "reviews", wide_text = false, {
    id: Uuid => "id",
    sku_id: Uuid => "sku_id",
    version_id: Uuid => "version_id",
    reviews: i64 => "reviews",
});

bulk_row!(PositionRow, "position", wide_text = false, {
    id: Uuid => "id",
    sku_id: Uuid => "sku_id",
    version_id: Uuid => "version_id",
    catalog_id: Uuid => "catalog_id",
    absolute: i64 => "absolute",
});

bulk_row!(ParameterFactRow, "parameter", wide_text = true, {
    id: Uuid => "id",
    sku_id: Uuid => "sku_id",
    version_id: Uuid => "version_id",
    parameter_id: Uuid => "parameter_id",
    value: String => "value",
});

/// Tagged variant wrapping every concrete row type the loader accepts.
#[derive(Debug, Clone)]
pub enum Row {
    Marketplace(MarketplaceRow),
    Brand(BrandRow),
    Catalog(CatalogRow),
    ParameterDict(ParameterDictRow),
    Sku(SkuRow),
    Version(VersionRow),
    Price(PriceRow),
    Rating(RatingRow),
    Sales(SalesRow),
    Reviews(ReviewsRow),
    Position(PositionRow),
    ParameterFact(ParameterFactRow),
}

impl Row {
    pub fn table(&self) -> &'static str {
        self.as_bulk_row().table()
    }

    pub fn columns(&self) -> &'static [&'static str] {
        self.as_bulk_row().columns()
    }

    pub fn values(&self) -> Vec<Value> {
        self.as_bulk_row().values()
    }

    pub fn wide_text(&self) -> bool {
        self.as_bulk_row().wide_text()
    }

    fn as_bulk_row(&self) -> &dyn BulkRow {
        match self {
            Row::Marketplace(r) => r,
            Row::Brand(r) => r,
            Row::Catalog(r) => r,
            Row::ParameterDict(r) => r,
            Row::Sku(r) => r,
            Row::Version(r) => r,
            Row::Price(r) => r,
            Row::Rating(r) => r,
            Row::Sales(r) => r,
            Row::Reviews(r) => r,
            Row::Position(r) => r,
            Row::ParameterFact(r) => r,
        }
    }
}

/// One row of `dump`, as listed by the admin queries the CLI's
/// `check_unfinished`/`clear_unfinished`/`import_all` commands need. Plain
/// summary data, not the full `Dump` the pipeline operations work with.
#[derive(Debug, Clone)]
pub struct DumpSummary {
    pub crawler: String,
    pub job: String,
    pub state: String,
    pub state_code: i32,
}

/// Outcome of a fast-path bulk load attempt.
#[derive(Debug)]
pub enum BulkLoadOutcome {
    Loaded,
    /// The store rejected a specific row; `index` is its position within the
    /// slice that was passed to `bulk_load_fast`.
    RowRejected { index: usize, message: String },
}

/// Thin contract over the relational store. Never caches; caching belongs to
/// the resolver (`crate::resolver`).
pub trait Store: Send + Sync {
    /// `WHERE key_column IN (keys)`, returned as natural-key -> id. Empty
    /// `keys` returns an empty map without issuing a query.
    fn lookup(&self, table: &str, key_column: &str, keys: &[String]) -> Result<HashMap<String, Uuid>>;

    /// Binary/streaming bulk load of a homogeneous slice. Loads all-or-nothing:
    /// either every row lands, or the first row the store rejects is reported
    /// back by index and nothing in the slice is committed.
    fn bulk_load_fast(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Value>],
    ) -> Result<BulkLoadOutcome>;

    /// Insert exactly one row via an ordinary parameterized statement. Used
    /// both for the bulk loader's row-path fallback and for ad hoc inserts.
    fn insert_row(&self, table: &str, columns: &[&str], values: &[Value]) -> Result<()>;

    /// Arbitrary parameterized execution for prune/merge cascades. Returns
    /// rows affected where the backend reports it.
    fn exec(&self, sql: &str, params: &[&dyn ToSql]) -> Result<u64>;

    fn query_scalar_i64(&self, sql: &str, params: &[&dyn ToSql]) -> Result<i64>;

    /// Like `query_scalar_i64` but tolerant of zero rows, used for lookups
    /// where "not found" is a normal outcome rather than a store error.
    fn query_scalar_uuid_opt(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Option<Uuid>>;

    /// Articles currently shared by more than one SKU row, up to `limit`.
    /// Drives `merge_duplicates`; returns an empty vec once none remain.
    fn duplicate_sku_articles(&self, limit: usize) -> Result<Vec<String>>;

    /// Dumps not yet PROCESSED or ERROR whose `updated_at` is older than
    /// `older_than_minutes`. Drives `check_unfinished`/`clear_unfinished`.
    fn stale_dumps(&self, older_than_minutes: i64) -> Result<Vec<DumpSummary>>;

    /// Dumps optionally filtered by crawler tag and/or state name. Drives
    /// `import_all`.
    fn dumps_by_tags(&self, tags: &[String], state: Option<&str>) -> Result<Vec<DumpSummary>>;

    fn begin(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
}
