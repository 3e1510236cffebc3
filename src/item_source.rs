use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;

use crate::error::{PipelineError, Result};

/// One product observation as delivered by the crawler export.
///
/// Represented as a sparse record of explicit `Option<T>` fields rather than
/// a duck-typed map: every key this pipeline understands has a named slot,
/// and anything else lands in `extra` for `log_unrecognized_fields` to report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Item {
    pub wb_id: Option<String>,
    pub product_url: Option<String>,
    pub product_name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_parse_date")]
    pub parse_date: Option<DateTime<Utc>>,
    pub wb_category_url: Option<String>,
    pub wb_category_name: Option<String>,
    pub wb_category_position: Option<i64>,
    pub wb_brand_url: Option<String>,
    pub wb_brand_name: Option<String>,
    pub wb_price: Option<f64>,
    pub wb_rating: Option<f64>,
    pub wb_purchases_count: Option<i64>,
    pub wb_reviews_count: Option<ReviewsCount>,
    #[serde(default)]
    pub features: Vec<HashMap<String, String>>,
    #[serde(flatten)]
    pub(crate) extra: HashMap<String, serde_json::Value>,
}

static LOGGED_UNKNOWN_KEYS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

/// The crawler export emits `parse_date` as either proper RFC-3339 or a bare
/// `YYYY-MM-DD HH:MM:SS[.ffffff]` timestamp with no timezone; the latter is
/// treated as already UTC, matching the export's own convention.
fn deserialize_parse_date<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else { return Ok(None) };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Some(naive.and_utc()));
    }

    Err(serde::de::Error::custom(format!(
        "parse_date {raw:?} is neither RFC-3339 nor the bare `YYYY-MM-DD HH:MM:SS[.ffffff]` form"
    )))
}

/// `wb_reviews_count` arrives as either an integer or an empty string.
#[derive(Debug, Clone)]
pub enum ReviewsCount {
    Count(i64),
    Empty,
}

impl ReviewsCount {
    pub fn as_count(&self) -> i64 {
        match self {
            ReviewsCount::Count(n) => *n,
            ReviewsCount::Empty => 0,
        }
    }
}

impl<'de> Deserialize<'de> for ReviewsCount {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Ok(ReviewsCount::Count(n)),
            Raw::Str(s) if s.is_empty() => Ok(ReviewsCount::Empty),
            Raw::Str(s) => s
                .parse()
                .map(ReviewsCount::Count)
                .map_err(serde::de::Error::custom),
        }
    }
}

const MAX_SKU_TITLE_LEN: usize = 512;
const ARTICLE_URL_PATTERN: &str = r"/catalog/(\d{1,20})/detail\.aspx";

impl Item {
    /// A product's SKU article. `wb_id` is used as-is unless it looks like a
    /// timestamp artifact (length > 20), in which case the article is
    /// recovered from `product_url`.
    pub fn guess_article(&self) -> Result<String> {
        if let Some(wb_id) = &self.wb_id {
            if wb_id.len() <= 20 {
                return Ok(wb_id.clone());
            }
        }

        let url = self.product_url.as_deref().ok_or_else(|| {
            PipelineError::StoreRowRejected {
                entity: "sku".into(),
                reason: "item has no wb_id and no product_url to recover an article from".into(),
            }
        })?;

        let re = Regex::new(ARTICLE_URL_PATTERN).expect("static regex is valid");
        re.captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| PipelineError::StoreRowRejected {
                entity: "sku".into(),
                reason: format!("product_url did not match catalog pattern: {url}"),
            })
    }

    pub fn truncated_title(&self) -> Option<String> {
        self.product_name.as_ref().map(|name| {
            if name.chars().count() > MAX_SKU_TITLE_LEN {
                name.chars().take(MAX_SKU_TITLE_LEN).collect()
            } else {
                name.clone()
            }
        })
    }

    pub fn reviews_count(&self) -> Option<i64> {
        self.wb_reviews_count.as_ref().map(|r| r.as_count())
    }

    /// Log every field this item carried that has no named slot above, once
    /// per key name for the lifetime of the process.
    pub fn log_unrecognized_fields(&self) {
        if self.extra.is_empty() {
            return;
        }
        let seen = LOGGED_UNKNOWN_KEYS.get_or_init(|| Mutex::new(HashSet::new()));
        let mut seen = seen.lock().expect("unknown-key log set poisoned");
        for key in self.extra.keys() {
            if seen.insert(key.clone()) {
                log::debug!("item source: ignoring unrecognized field `{key}`");
            }
        }
    }
}

/// Job-level metadata used to initialize a new Dump's timestamps and item count.
#[derive(Debug, Clone, Deserialize)]
pub struct JobMetadata {
    pub running_time_ms: i64,
    pub finished_time_ms: i64,
    #[serde(rename = "scrapystats")]
    pub scrapy_stats: ScrapyStats,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScrapyStats {
    pub item_scraped_count: i64,
}

/// One page of items fetched from the source, plus whether more remain.
pub struct ItemChunk {
    pub items: Vec<Item>,
    pub has_more: bool,
}

/// Abstraction over the upstream crawler export service.
#[async_trait]
pub trait ItemSource: Send + Sync {
    async fn metadata(&self, job_id: &str) -> Result<JobMetadata>;

    async fn fetch(
        &self,
        job_id: &str,
        start: usize,
        count: usize,
        chunk_size: usize,
    ) -> Result<ItemChunk>;
}

/// HTTP-backed item source hitting the crawler export API.
pub struct HttpItemSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpItemSource {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        HttpItemSource {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

#[async_trait]
impl ItemSource for HttpItemSource {
    async fn metadata(&self, job_id: &str) -> Result<JobMetadata> {
        let url = format!("{}/jobs/{}/metadata", self.base_url, job_id);
        let req = self.authed(self.client.get(&url));
        let resp = req
            .send()
            .await
            .map_err(|e| PipelineError::TransientNetwork(e.to_string()))?;
        resp.json::<JobMetadata>()
            .await
            .map_err(|e| PipelineError::TransientNetwork(e.to_string()))
    }

    async fn fetch(
        &self,
        job_id: &str,
        start: usize,
        count: usize,
        chunk_size: usize,
    ) -> Result<ItemChunk> {
        let url = format!("{}/jobs/{}/items", self.base_url, job_id);
        let take = chunk_size.min(count);
        let req = self.authed(self.client.get(&url).query(&[
            ("start", start.to_string()),
            ("count", take.to_string()),
        ]));
        let resp = req
            .send()
            .await
            .map_err(|e| PipelineError::TransientNetwork(e.to_string()))?;
        let items: Vec<Item> = resp
            .json()
            .await
            .map_err(|e| PipelineError::TransientNetwork(e.to_string()))?;
        let has_more = start + items.len() < start + count && !items.is_empty();
        Ok(ItemChunk { items, has_more })
    }
}
