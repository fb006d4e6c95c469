use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::cache::{AssetMeta, IdentityCache};
use crate::error::PrismResult;
use crate::hive::{HiveContributor, HiveDirectory};
use crate::model::{ErrorCategory, Isin, Phase, PipelineError, Severity};

/// Metadata enrichment outcome. The three ISIN sets are pairwise disjoint by
/// construction, so set cardinalities can be reported directly and the same
/// security can never inflate a statistic.
#[derive(Debug, Default)]
pub struct EnrichmentResult {
    pub metadata: HashMap<Isin, AssetMeta>,
    /// Served from the local cache or the Hive.
    pub hits: BTreeSet<Isin>,
    /// Found nowhere.
    pub misses: BTreeSet<Isin>,
    /// Known locally, absent in the Hive, and written back this phase.
    pub contributions: BTreeSet<Isin>,
    /// Hive failures during the phase; the phase itself continues on local
    /// data and the caller folds these into the run's error buffer.
    pub errors: Vec<PipelineError>,
}

/// Attaches sector, geography and currency metadata to child ISINs.
///
/// One bulk lookup against the Hive (the client chunks at 500) rather than
/// per-ISIN calls; local knowledge the Hive lacks is contributed back
/// best-effort.
pub struct Enricher {
    cache: Arc<Mutex<IdentityCache>>,
    hive: Arc<dyn HiveDirectory>,
    contributor: Arc<dyn HiveContributor>,
}

impl Enricher {
    pub fn new(
        cache: Arc<Mutex<IdentityCache>>,
        hive: Arc<dyn HiveDirectory>,
        contributor: Arc<dyn HiveContributor>,
    ) -> Self {
        Self {
            cache,
            hive,
            contributor,
        }
    }

    #[tracing::instrument(skip_all, fields(isins = isins.len()))]
    pub async fn enrich(&self, isins: &[Isin]) -> PrismResult<EnrichmentResult> {
        let unique: BTreeSet<Isin> = isins.iter().cloned().collect();
        let mut result = EnrichmentResult::default();

        // Local knowledge first.
        let mut local: HashMap<Isin, AssetMeta> = HashMap::new();
        {
            let cache = self.cache.lock().expect("identity cache poisoned");
            for isin in &unique {
                if let Some(meta) = cache.get_asset_meta(isin)?
                    && meta != AssetMeta::default()
                {
                    local.insert(isin.clone(), meta);
                }
            }
        }

        // One bulk lookup for everything, so the Hive can corroborate or
        // supplement local entries.
        let remote = match self.hive.get_asset_meta(&unique.iter().cloned().collect::<Vec<_>>()).await
        {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "hive metadata lookup failed; continuing with local data");
                result.errors.push(PipelineError::new(
                    Phase::Enriching,
                    Severity::Medium,
                    ErrorCategory::ApiError,
                    "HIVE_METADATA_LOOKUP_FAILED",
                    "enrichment",
                    e.to_string(),
                ));
                HashMap::new()
            }
        };

        // Refresh the local mirror with whatever the Hive returned.
        {
            let mut cache = self.cache.lock().expect("identity cache poisoned");
            for (isin, meta) in &remote {
                cache.upsert_asset(isin, isin.as_str(), meta)?;
            }
        }

        for isin in &unique {
            let remote_meta = remote.get(isin);
            let local_meta = local.get(isin);
            match (remote_meta, local_meta) {
                (Some(meta), _) => {
                    result.metadata.insert(isin.clone(), meta.clone());
                    result.hits.insert(isin.clone());
                }
                (None, Some(meta)) => {
                    result.metadata.insert(isin.clone(), meta.clone());
                    if self.contributor.contributions_enabled() {
                        match self
                            .contributor
                            .contribute_asset(isin, isin.as_str(), meta)
                            .await
                        {
                            Ok(()) => {
                                result.contributions.insert(isin.clone());
                            }
                            Err(e) => {
                                warn!(isin = %isin, error = %e, "metadata contribution failed");
                                result.hits.insert(isin.clone());
                            }
                        }
                    } else {
                        result.hits.insert(isin.clone());
                    }
                }
                (None, None) => {
                    result.misses.insert(isin.clone());
                }
            }
        }

        debug!(
            hits = result.hits.len(),
            misses = result.misses.len(),
            contributions = result.contributions.len(),
            "enrichment complete"
        );
        debug_assert!(result.hits.is_disjoint(&result.misses));
        debug_assert!(result.hits.is_disjoint(&result.contributions));
        debug_assert!(result.misses.is_disjoint(&result.contributions));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::InMemoryHive;

    const APPLE: &str = "US0378331005";
    const MSFT: &str = "US5949181045";
    const GHOST: &str = "XX0000000003";

    fn isin(raw: &str) -> Isin {
        raw.parse().unwrap()
    }

    #[tokio::test]
    async fn hive_hits_land_in_metadata_and_local_mirror() {
        let hive = Arc::new(
            InMemoryHive::new()
                .with_meta(APPLE, "Technology", "US")
                .with_meta(MSFT, "Technology", "US"),
        );
        let cache = Arc::new(Mutex::new(IdentityCache::open_in_memory().unwrap()));
        let enricher = Enricher::new(cache.clone(), hive.clone(), hive);

        let result = enricher
            .enrich(&[isin(APPLE), isin(MSFT), isin(APPLE)])
            .await
            .unwrap();

        assert_eq!(result.hits.len(), 2, "duplicates never double-count");
        assert_eq!(result.misses.len(), 0);
        assert_eq!(
            result.metadata[&isin(APPLE)].sector.as_deref(),
            Some("Technology")
        );

        let mirrored = cache
            .lock()
            .unwrap()
            .get_asset_meta(&isin(APPLE))
            .unwrap()
            .unwrap();
        assert_eq!(mirrored.sector.as_deref(), Some("Technology"));
    }

    #[tokio::test]
    async fn unknown_isins_are_misses() {
        let hive = Arc::new(InMemoryHive::new());
        let cache = Arc::new(Mutex::new(IdentityCache::open_in_memory().unwrap()));
        let enricher = Enricher::new(cache, hive.clone(), hive);

        let result = enricher.enrich(&[isin(GHOST)]).await.unwrap();
        assert!(result.hits.is_empty());
        assert_eq!(result.misses.len(), 1);
        assert!(result.metadata.is_empty());
    }

    #[tokio::test]
    async fn hive_outage_is_recorded_and_local_data_still_serves() {
        let hive = Arc::new(InMemoryHive::new().with_failing_reads());
        let cache = Arc::new(Mutex::new(IdentityCache::open_in_memory().unwrap()));
        cache
            .lock()
            .unwrap()
            .upsert_asset(
                &isin(APPLE),
                "Apple Inc",
                &AssetMeta {
                    sector: Some("Technology".into()),
                    geography: Some("US".into()),
                    currency: None,
                },
            )
            .unwrap();
        let enricher = Enricher::new(cache, hive.clone(), hive);

        let result = enricher.enrich(&[isin(APPLE)]).await.unwrap();
        assert_eq!(result.errors.len(), 1);
        let err = &result.errors[0];
        assert_eq!(err.code, "HIVE_METADATA_LOOKUP_FAILED");
        assert_eq!(err.category, ErrorCategory::ApiError);
        assert_eq!(err.severity, Severity::Medium);

        // Local knowledge still serves the phase.
        assert_eq!(
            result.metadata[&isin(APPLE)].sector.as_deref(),
            Some("Technology")
        );
    }

    #[tokio::test]
    async fn local_only_knowledge_is_contributed_back() {
        let hive = Arc::new(InMemoryHive::new());
        let cache = Arc::new(Mutex::new(IdentityCache::open_in_memory().unwrap()));
        cache
            .lock()
            .unwrap()
            .upsert_asset(
                &isin(APPLE),
                "Apple Inc",
                &AssetMeta {
                    sector: Some("Technology".into()),
                    geography: Some("US".into()),
                    currency: Some("USD".into()),
                },
            )
            .unwrap();
        let enricher = Enricher::new(cache, hive.clone(), hive.clone());

        let result = enricher.enrich(&[isin(APPLE)]).await.unwrap();
        assert_eq!(result.contributions.len(), 1);
        assert!(result.hits.is_empty(), "contributed entries are not also hits");

        // The Hive now knows the asset.
        let remote = hive.get_asset_meta(&[isin(APPLE)]).await.unwrap();
        assert_eq!(remote[&isin(APPLE)].sector.as_deref(), Some("Technology"));
    }
}
