use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Every tunable the pipeline needs, loaded once at process start and passed
/// by reference into every component. Nothing below `main` reads `std::env`
/// directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Items pulled per fetch-chunk from the item source.
    pub get_chunk_size: usize,
    /// Max rows per bulk-loader slice.
    pub save_chunk_size: usize,
    /// Items per `import_dump` task window, for callers composing the job graph.
    pub group_size: usize,
    /// Embedded store file path, or ":memory:".
    pub store_path: String,
    /// Credential for the upstream item source. Optional for local/offline use.
    pub item_source_api_key: Option<String>,
    /// Base URL of the item source HTTP API.
    pub item_source_base_url: String,
    /// Informational only; the task broker itself is out of scope.
    pub broker_url: Option<String>,
    /// Threshold used by `check_unfinished` to flag stuck dumps.
    pub stale_dump_minutes: i64,
    /// The crawler/marketplace tag this process indexes against.
    pub crawler: String,
    /// RSS, in KiB, past which `process_batch` logs a memory warning.
    pub rss_warn_threshold_kb: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            get_chunk_size: 5000,
            save_chunk_size: 5000,
            group_size: 1000,
            store_path: ":memory:".to_string(),
            item_source_api_key: None,
            item_source_base_url: "http://localhost:8000".to_string(),
            broker_url: None,
            stale_dump_minutes: 180,
            crawler: "wb".to_string(),
            rss_warn_threshold_kb: 2_000_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(v) = env::var("GET_CHUNK_SIZE") {
            config.get_chunk_size = parse_usize("GET_CHUNK_SIZE", &v)?;
        }
        if let Ok(v) = env::var("SAVE_CHUNK_SIZE") {
            config.save_chunk_size = parse_usize("SAVE_CHUNK_SIZE", &v)?;
        }
        if let Ok(v) = env::var("GROUP_SIZE") {
            config.group_size = parse_usize("GROUP_SIZE", &v)?;
        }
        if let Ok(v) = env::var("STORE_PATH") {
            config.store_path = v;
        }
        if let Ok(v) = env::var("ITEM_SOURCE_API_KEY") {
            config.item_source_api_key = Some(v);
        }
        if let Ok(v) = env::var("ITEM_SOURCE_BASE_URL") {
            config.item_source_base_url = v;
        }
        if let Ok(v) = env::var("BROKER_URL") {
            config.broker_url = Some(v);
        }
        if let Ok(v) = env::var("STALE_DUMP_MINUTES") {
            config.stale_dump_minutes = v
                .parse()
                .map_err(|_| PipelineError::Config(format!("STALE_DUMP_MINUTES: not an integer: {v}")))?;
        }
        if let Ok(v) = env::var("CRAWLER") {
            config.crawler = v;
        }
        if let Ok(v) = env::var("RSS_WARN_THRESHOLD_KB") {
            config.rss_warn_threshold_kb = v
                .parse()
                .map_err(|_| PipelineError::Config(format!("RSS_WARN_THRESHOLD_KB: not an integer: {v}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.get_chunk_size == 0 {
            return Err(PipelineError::Config("get_chunk_size must be > 0".into()));
        }
        if self.save_chunk_size == 0 {
            return Err(PipelineError::Config("save_chunk_size must be > 0".into()));
        }
        if self.group_size == 0 {
            return Err(PipelineError::Config("group_size must be > 0".into()));
        }
        if self.store_path.is_empty() {
            return Err(PipelineError::Config("store_path must not be empty".into()));
        }
        if self.item_source_base_url.is_empty() {
            return Err(PipelineError::Config(
                "item_source_base_url must not be empty".into(),
            ));
        }
        if self.stale_dump_minutes <= 0 {
            return Err(PipelineError::Config("stale_dump_minutes must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_usize(key: &str, v: &str) -> Result<usize> {
    v.parse()
        .map_err(|_| PipelineError::Config(format!("{key}: not a positive integer: {v}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let mut config = Config::default();
        config.get_chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_store_path() {
        let mut config = Config::default();
        config.store_path = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_nonpositive_stale_minutes() {
        let mut config = Config::default();
        config.stale_dump_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_usize_rejects_garbage() {
        assert!(parse_usize("GET_CHUNK_SIZE", "not-a-number").is_err());
    }
}
