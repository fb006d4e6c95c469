pub mod client;
pub mod memory;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{AssetMeta, IdentityCache};
use crate::error::{HiveError, PrismResult};
use crate::model::{Alias, AliasType, Holding, Isin};

pub use client::HiveClient;
pub use memory::{DisabledHive, InMemoryHive};

/// Page size used for the bulk sync pulls.
pub const SYNC_PAGE_SIZE: usize = 1_000;

/// A positive answer from the community registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiveHit {
    pub isin: Isin,
    pub confidence: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub exchange: Option<String>,
    /// Originating source of the community fact, when the registry knows it.
    #[serde(default)]
    pub source: Option<crate::model::IdentitySource>,
}

/// Read side of the registry. Every method is a named RPC; a miss is `None`,
/// not an error.
#[async_trait]
pub trait HiveDirectory: Send + Sync {
    async fn lookup_alias(
        &self,
        alias: &str,
        alias_type: AliasType,
    ) -> Result<Option<HiveHit>, HiveError>;

    async fn resolve_ticker(&self, ticker: &str) -> Result<Option<HiveHit>, HiveError>;

    /// Chunked server-side; at most 100 tickers per call.
    async fn batch_resolve_tickers(
        &self,
        tickers: &[String],
    ) -> Result<HashMap<String, HiveHit>, HiveError>;

    async fn get_etf_holdings(&self, parent: &Isin) -> Result<Option<Vec<Holding>>, HiveError>;

    /// Bulk metadata lookup for the enricher; chunked at 500 per call.
    async fn get_asset_meta(
        &self,
        isins: &[Isin],
    ) -> Result<HashMap<Isin, AssetMeta>, HiveError>;

    async fn fetch_aliases_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Alias>, HiveError>;

    async fn fetch_assets_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(Isin, String, AssetMeta)>, HiveError>;
}

/// Write side of the registry. All writes go through `SECURITY DEFINER`
/// functions so an anonymous key suffices. Contributions are best-effort:
/// failures are logged by callers, never fatal.
#[async_trait]
pub trait HiveContributor: Send + Sync {
    fn contributions_enabled(&self) -> bool;

    async fn contribute_alias(&self, alias: &Alias) -> Result<(), HiveError>;

    async fn contribute_asset(
        &self,
        isin: &Isin,
        name: &str,
        meta: &AssetMeta,
    ) -> Result<(), HiveError>;

    async fn contribute_listing(
        &self,
        ticker: &str,
        exchange: Option<&str>,
        isin: &Isin,
        currency: Option<&str>,
    ) -> Result<(), HiveError>;

    /// Shares a full ETF composition.
    async fn contribute_mapping(
        &self,
        parent: &Isin,
        holdings: &[Holding],
        source_tag: &str,
    ) -> Result<(), HiveError>;
}

/// Anonymous but stable per-machine attestation attached to contributions.
pub fn contributor_hash() -> String {
    let seed = format!(
        "{}:{}",
        std::env::var("HOSTNAME").unwrap_or_default(),
        std::env::var("USER").or_else(|_| std::env::var("USERNAME")).unwrap_or_default(),
    );
    blake3::hash(seed.as_bytes()).to_hex()[..16].to_string()
}

/// Bulk pull of the identity domain into the local cache, page by page.
/// Updates the per-domain sync markers so staleness checks stay accurate.
pub async fn sync_cache_from_hive(
    cache: &Mutex<IdentityCache>,
    hive: &dyn HiveDirectory,
) -> PrismResult<()> {
    let mut offset = 0;
    let mut pulled_assets = 0usize;
    loop {
        let page = hive.fetch_assets_page(offset, SYNC_PAGE_SIZE).await?;
        if page.is_empty() {
            break;
        }
        let mut guard = cache.lock().expect("identity cache poisoned");
        for (isin, name, meta) in &page {
            guard.upsert_asset(isin, name, meta)?;
        }
        pulled_assets += page.len();
        offset += SYNC_PAGE_SIZE;
    }
    cache
        .lock()
        .expect("identity cache poisoned")
        .mark_synced("assets")?;

    let mut offset = 0;
    let mut pulled_aliases = 0usize;
    loop {
        let page = hive.fetch_aliases_page(offset, SYNC_PAGE_SIZE).await?;
        if page.is_empty() {
            break;
        }
        let mut guard = cache.lock().expect("identity cache poisoned");
        for alias in &page {
            guard.upsert_alias(alias)?;
        }
        pulled_aliases += page.len();
        offset += SYNC_PAGE_SIZE;
    }
    cache
        .lock()
        .expect("identity cache poisoned")
        .mark_synced("aliases")?;

    info!(pulled_assets, pulled_aliases, "hive sync complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn contributor_hash_is_stable_and_short() {
        let a = contributor_hash();
        let b = contributor_hash();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn batch_resolution_returns_only_known_tickers() {
        let hive = InMemoryHive::new()
            .with_ticker("AAPL", "US0378331005", 0.9)
            .with_ticker("MSFT", "US5949181045", 0.9);

        let resolved = hive
            .batch_resolve_tickers(&["AAPL".into(), "ZZZZ".into(), "MSFT".into()])
            .await
            .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["AAPL"].isin.as_str(), "US0378331005");
        assert!(!resolved.contains_key("ZZZZ"));
    }

    #[tokio::test]
    async fn sync_pull_fills_the_local_mirror() {
        let hive = InMemoryHive::new()
            .with_meta("US0378331005", "Technology", "US")
            .with_meta("US5949181045", "Technology", "US");
        let cache = Mutex::new(IdentityCache::open_in_memory().unwrap());

        assert!(cache
            .lock()
            .unwrap()
            .is_stale("assets", Duration::from_secs(60))
            .unwrap());

        sync_cache_from_hive(&cache, &hive).await.unwrap();

        let guard = cache.lock().unwrap();
        let meta = guard
            .get_asset_meta(&"US0378331005".parse().unwrap())
            .unwrap()
            .expect("asset mirrored");
        assert_eq!(meta.sector.as_deref(), Some("Technology"));
        assert!(!guard.is_stale("assets", Duration::from_secs(60)).unwrap());
    }
}
