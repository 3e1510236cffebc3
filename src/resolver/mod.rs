use std::collections::HashMap;

use uuid::Uuid;

use crate::error::Result;
use crate::item_source::Item;
use crate::store::loader::BulkLoader;
use crate::store::{BrandRow, CatalogRow, DictionaryKind, ParameterDictRow, Row, SkuRow, Store};

#[derive(Debug, Clone)]
struct CatalogSeen {
    url: String,
    name: Option<String>,
}

#[derive(Debug, Clone)]
struct BrandSeen {
    url: String,
    name: Option<String>,
}

#[derive(Debug, Clone)]
struct ParameterSeen {
    name: String,
}

#[derive(Debug, Clone)]
struct SkuSeen {
    article: String,
    title: Option<String>,
    url: String,
    brand_url: Option<String>,
}

/// Per-dictionary-kind cache plus the set of natural keys seen in the
/// current chunk, materialized against the store once per chunk.
///
/// Resolution order within a chunk is fixed: catalogs, then brands, then
/// parameters, then SKUs, because a SKU row references a brand id.
pub struct Resolver<'s> {
    store: &'s dyn Store,
    marketplace_id: Uuid,

    catalog_cache: HashMap<String, Uuid>,
    brand_cache: HashMap<String, Uuid>,
    parameter_cache: HashMap<String, Uuid>,
    sku_cache: HashMap<String, Uuid>,

    catalog_retrieved: HashMap<String, CatalogSeen>,
    brand_retrieved: HashMap<String, BrandSeen>,
    parameter_retrieved: HashMap<String, ParameterSeen>,
    sku_retrieved: HashMap<String, SkuSeen>,
}

impl<'s> Resolver<'s> {
    pub fn new(store: &'s dyn Store, marketplace_id: Uuid) -> Self {
        Resolver {
            store,
            marketplace_id,
            catalog_cache: HashMap::new(),
            brand_cache: HashMap::new(),
            parameter_cache: HashMap::new(),
            sku_cache: HashMap::new(),
            catalog_retrieved: HashMap::new(),
            brand_retrieved: HashMap::new(),
            parameter_retrieved: HashMap::new(),
            sku_retrieved: HashMap::new(),
        }
    }

    /// Drop both the cache and the retrieved set for every kind. Called
    /// between chunks by default; correctness does not depend on retention,
    /// so an implementation could keep a bounded cache across chunks instead.
    pub fn clear(&mut self) {
        self.catalog_cache.clear();
        self.brand_cache.clear();
        self.parameter_cache.clear();
        self.sku_cache.clear();
        self.catalog_retrieved.clear();
        self.brand_retrieved.clear();
        self.parameter_retrieved.clear();
        self.sku_retrieved.clear();
    }

    /// Step 1 of the resolve cycle: populate the retrieved maps from a chunk
    /// of items. Items that cannot yield an article are skipped; the caller
    /// decides whether that is fatal (see `pipeline::process_batch`).
    pub fn collect(&mut self, items: &[Item]) {
        for item in items {
            if let Some(url) = &item.wb_category_url {
                self.catalog_retrieved.entry(url.clone()).or_insert(CatalogSeen {
                    url: url.clone(),
                    name: Some(item.wb_category_name.clone().unwrap_or_else(|| url.clone())),
                });
            }

            if let Some(url) = &item.wb_brand_url {
                self.brand_retrieved.entry(url.clone()).or_insert(BrandSeen {
                    url: url.clone(),
                    name: item.wb_brand_name.clone(),
                });
            }

            for feature_map in &item.features {
                for name in feature_map.keys() {
                    self.parameter_retrieved
                        .entry(name.clone())
                        .or_insert_with(|| ParameterSeen { name: name.clone() });
                }
            }

            let (Ok(article), Some(url)) = (item.guess_article(), item.product_url.clone()) else {
                continue;
            };
            self.sku_retrieved.entry(article.clone()).or_insert(SkuSeen {
                article,
                title: item.truncated_title(),
                url,
                brand_url: item.wb_brand_url.clone(),
            });
        }
    }

    /// Steps 2-4 of the resolve cycle, run in the fixed kind order.
    pub fn resolve_all(&mut self, loader: &mut BulkLoader) -> Result<()> {
        self.resolve_catalogs(loader)?;
        self.resolve_brands(loader)?;
        self.resolve_parameters(loader)?;
        self.resolve_skus(loader)?;
        Ok(())
    }

    fn resolve_catalogs(&mut self, loader: &mut BulkLoader) -> Result<()> {
        let missing: Vec<String> = self
            .catalog_retrieved
            .keys()
            .filter(|k| !self.catalog_cache.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let found = self
                .store
                .lookup(DictionaryKind::Catalog.table(), DictionaryKind::Catalog.key_column(), &missing)?;
            self.catalog_cache.extend(found);
        }

        for (url, seen) in self.catalog_retrieved.iter() {
            if !self.catalog_cache.contains_key(url) {
                loader.add(Row::Catalog(CatalogRow {
                    id: Uuid::new_v4(),
                    marketplace_id: self.marketplace_id,
                    url: seen.url.clone(),
                    name: seen.name.clone(),
                    parent_id: None,
                }));
            }
        }
        loader.done()?;

        let missing: Vec<String> = self
            .catalog_retrieved
            .keys()
            .filter(|k| !self.catalog_cache.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let found = self
                .store
                .lookup(DictionaryKind::Catalog.table(), DictionaryKind::Catalog.key_column(), &missing)?;
            self.catalog_cache.extend(found);
        }
        Ok(())
    }

    fn resolve_brands(&mut self, loader: &mut BulkLoader) -> Result<()> {
        let missing: Vec<String> = self
            .brand_retrieved
            .keys()
            .filter(|k| !self.brand_cache.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let found = self.store.lookup(DictionaryKind::Brand.table(), DictionaryKind::Brand.key_column(), &missing)?;
            self.brand_cache.extend(found);
        }

        for (url, seen) in self.brand_retrieved.iter() {
            if !self.brand_cache.contains_key(url) {
                loader.add(Row::Brand(BrandRow {
                    id: Uuid::new_v4(),
                    marketplace_id: self.marketplace_id,
                    url: seen.url.clone(),
                    name: seen.name.clone(),
                }));
            }
        }
        loader.done()?;

        let missing: Vec<String> = self
            .brand_retrieved
            .keys()
            .filter(|k| !self.brand_cache.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let found = self.store.lookup(DictionaryKind::Brand.table(), DictionaryKind::Brand.key_column(), &missing)?;
            self.brand_cache.extend(found);
        }
        Ok(())
    }

    fn resolve_parameters(&mut self, loader: &mut BulkLoader) -> Result<()> {
        let missing: Vec<String> = self
            .parameter_retrieved
            .keys()
            .filter(|k| !self.parameter_cache.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let found = self
                .store
                .lookup(DictionaryKind::Parameter.table(), DictionaryKind::Parameter.key_column(), &missing)?;
            self.parameter_cache.extend(found);
        }

        for (name, seen) in self.parameter_retrieved.iter() {
            if !self.parameter_cache.contains_key(name) {
                loader.add(Row::ParameterDict(ParameterDictRow {
                    id: Uuid::new_v4(),
                    marketplace_id: self.marketplace_id,
                    name: seen.name.clone(),
                }));
            }
        }
        loader.done()?;

        let missing: Vec<String> = self
            .parameter_retrieved
            .keys()
            .filter(|k| !self.parameter_cache.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let found = self
                .store
                .lookup(DictionaryKind::Parameter.table(), DictionaryKind::Parameter.key_column(), &missing)?;
            self.parameter_cache.extend(found);
        }
        Ok(())
    }

    fn resolve_skus(&mut self, loader: &mut BulkLoader) -> Result<()> {
        let missing: Vec<String> = self
            .sku_retrieved
            .keys()
            .filter(|k| !self.sku_cache.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let found = self.store.lookup(DictionaryKind::Sku.table(), DictionaryKind::Sku.key_column(), &missing)?;
            self.sku_cache.extend(found);
        }

        for (article, seen) in self.sku_retrieved.iter() {
            if !self.sku_cache.contains_key(article) {
                let brand_id = seen
                    .brand_url
                    .as_ref()
                    .and_then(|url| self.brand_cache.get(url).copied());
                loader.add(Row::Sku(SkuRow {
                    id: Uuid::new_v4(),
                    marketplace_id: self.marketplace_id,
                    brand_id,
                    article: seen.article.clone(),
                    title: seen.title.clone(),
                    url: seen.url.clone(),
                    created_at: chrono::Utc::now(),
                }));
            }
        }
        loader.done()?;

        let missing: Vec<String> = self
            .sku_retrieved
            .keys()
            .filter(|k| !self.sku_cache.contains_key(*k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let found = self.store.lookup(DictionaryKind::Sku.table(), DictionaryKind::Sku.key_column(), &missing)?;
            self.sku_cache.extend(found);
        }
        Ok(())
    }

    pub fn catalog_id(&self, url: &str) -> Option<Uuid> {
        self.catalog_cache.get(url).copied()
    }

    pub fn brand_id(&self, url: &str) -> Option<Uuid> {
        self.brand_cache.get(url).copied()
    }

    pub fn parameter_id(&self, name: &str) -> Option<Uuid> {
        self.parameter_cache.get(name).copied()
    }

    pub fn sku_id(&self, article: &str) -> Option<Uuid> {
        self.sku_cache.get(article).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::duckdb_store::DuckDbStore;

    fn sample_item() -> Item {
        Item {
            wb_id: Some("11743005".into()),
            product_url: Some("https://site/catalog/11743005/detail.aspx".into()),
            product_name: Some("Коврик для лотка".into()),
            wb_category_url: Some("https://site/kovriki-dlya-lotkov".into()),
            wb_category_name: Some("Коврики для лотков".into()),
            wb_brand_url: Some("https://site/vita-famoso".into()),
            wb_brand_name: Some("Vita Famoso".into()),
            ..Default::default()
        }
    }

    #[test]
    fn resolve_all_leaves_every_seen_key_with_an_id() {
        let store = DuckDbStore::open(":memory:").unwrap();
        let marketplace_id = Uuid::new_v4();
        let mut resolver = Resolver::new(&store, marketplace_id);
        let mut loader = BulkLoader::new(&store, 1000);

        let items = vec![sample_item()];
        resolver.collect(&items);
        resolver.resolve_all(&mut loader).unwrap();

        assert!(resolver.catalog_id("https://site/kovriki-dlya-lotkov").is_some());
        assert!(resolver.brand_id("https://site/vita-famoso").is_some());
        assert!(resolver.sku_id("11743005").is_some());
    }

    #[test]
    fn empty_chunk_leaves_maps_empty() {
        let store = DuckDbStore::open(":memory:").unwrap();
        let marketplace_id = Uuid::new_v4();
        let mut resolver = Resolver::new(&store, marketplace_id);
        let mut loader = BulkLoader::new(&store, 1000);

        resolver.collect(&[]);
        resolver.resolve_all(&mut loader).unwrap();

        assert_eq!(resolver.sku_cache.len(), 0);
        assert_eq!(resolver.catalog_cache.len(), 0);
    }

    #[test]
    fn second_chunk_resolves_sku_created_by_first() {
        let store = DuckDbStore::open(":memory:").unwrap();
        let marketplace_id = Uuid::new_v4();
        let mut resolver = Resolver::new(&store, marketplace_id);
        let mut loader = BulkLoader::new(&store, 1000);

        let items = vec![sample_item()];
        resolver.collect(&items);
        resolver.resolve_all(&mut loader).unwrap();
        let first_id = resolver.sku_id("11743005").unwrap();

        resolver.clear();
        resolver.collect(&items);
        resolver.resolve_all(&mut loader).unwrap();
        let second_id = resolver.sku_id("11743005").unwrap();

        assert_eq!(first_id, second_id);
    }

    #[test]
    fn missing_category_name_defaults_to_url() {
        let store = DuckDbStore::open(":memory:").unwrap();
        let marketplace_id = Uuid::new_v4();
        let mut resolver = Resolver::new(&store, marketplace_id);
        let mut loader = BulkLoader::new(&store, 1000);

        let item = Item {
            wb_category_url: Some("https://site/kovriki-dlya-lotkov".into()),
            wb_category_name: None,
            ..Default::default()
        };
        resolver.collect(&[item]);
        resolver.resolve_all(&mut loader).unwrap();

        let id = resolver.catalog_id("https://site/kovriki-dlya-lotkov").unwrap();
        let found = store
            .query_scalar_i64(
                "SELECT count(*) FROM dict_catalog WHERE id = ? AND name = url",
                &[&id.to_string()],
            )
            .unwrap();
        assert_eq!(found, 1);
    }
}
