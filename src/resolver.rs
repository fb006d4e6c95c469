pub mod external;
pub mod normalize;

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::cache::IdentityCache;
use crate::config::EngineConfig;
use crate::error::PrismResult;
use crate::hive::{HiveContributor, HiveDirectory, HiveHit};
use crate::model::resolution::RESOLVED_CONFIDENCE_FLOOR;
use crate::model::{
    Alias, AliasType, ErrorCategory, IdentitySource, Isin, Phase, PipelineError, ResolutionDetail,
    ResolutionResult, ResolutionSource, Severity,
};

pub use external::{
    API_TIMEOUT, ExternalHit, ExternalResolver, FinnhubResolver, OpenFigiResolver,
    ResolveContext, ScriptedResolver, WikidataResolver, YfinanceResolver,
};
pub use normalize::{normalize_name, ticker_variants, validate_name, validate_ticker};

/// Weight class of the holding being resolved. Micro-weight holdings never
/// reach the external API tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Tier1,
    Tier2,
}

/// One resolution request. Build with the constructors and chain the
/// modifiers.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    pub isin: Option<String>,
    pub ticker: Option<String>,
    pub name: Option<String>,
    pub context: ResolveContext,
    pub tier2: bool,
    pub force_refresh: bool,
}

impl ResolveRequest {
    pub fn of(ticker: Option<String>, name: Option<String>) -> Self {
        Self {
            ticker,
            name,
            ..Self::default()
        }
    }

    pub fn ticker(ticker: impl Into<String>) -> Self {
        Self {
            ticker: Some(ticker.into()),
            ..Self::default()
        }
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_isin(mut self, isin: impl Into<String>) -> Self {
        self.isin = Some(isin.into());
        self
    }

    pub fn with_context(mut self, context: ResolveContext) -> Self {
        self.context = context;
        self
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier2 = tier == Tier::Tier2;
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }
}

/// Cascaded ticker/name → ISIN resolution with provenance.
///
/// Order: pass-through → local cache → negative cache → Hive → external APIs
/// in priority order. The cascade stops at the first answer clearing the
/// confidence floor; every successful external answer is cached locally
/// first and contributed to the Hive best-effort afterwards.
pub struct IsinResolver {
    cache: Arc<Mutex<IdentityCache>>,
    hive: Arc<dyn HiveDirectory>,
    contributor: Arc<dyn HiveContributor>,
    apis: Vec<Arc<dyn ExternalResolver>>,
    contributor_hash: String,
}

impl IsinResolver {
    pub fn new(
        cache: Arc<Mutex<IdentityCache>>,
        hive: Arc<dyn HiveDirectory>,
        contributor: Arc<dyn HiveContributor>,
        apis: Vec<Arc<dyn ExternalResolver>>,
    ) -> Self {
        Self {
            cache,
            hive,
            contributor,
            apis,
            contributor_hash: crate::hive::contributor_hash(),
        }
    }

    /// Builds the API tier from the startup configuration: OpenFIGI →
    /// Wikidata → Finnhub (keyed) → Yahoo, each dropped with a warning when
    /// unavailable.
    pub fn api_tier_from_config(config: &EngineConfig) -> Vec<Arc<dyn ExternalResolver>> {
        let mut apis: Vec<Arc<dyn ExternalResolver>> = Vec::new();
        match OpenFigiResolver::new() {
            Ok(api) => apis.push(Arc::new(api)),
            Err(e) => warn!(error = %e, "openfigi resolver unavailable"),
        }
        match WikidataResolver::new() {
            Ok(api) => apis.push(Arc::new(api)),
            Err(e) => warn!(error = %e, "wikidata resolver unavailable"),
        }
        if let Some(key) = &config.finnhub_api_key {
            match FinnhubResolver::new(key.clone()) {
                Ok(api) => apis.push(Arc::new(api)),
                Err(e) => warn!(error = %e, "finnhub resolver unavailable"),
            }
        }
        match YfinanceResolver::new() {
            Ok(api) => apis.push(Arc::new(api)),
            Err(e) => warn!(error = %e, "yfinance resolver unavailable"),
        }
        apis
    }

    #[tracing::instrument(skip_all, fields(ticker = ?req.ticker, name = ?req.name))]
    pub async fn resolve(&self, req: &ResolveRequest) -> PrismResult<ResolutionResult> {
        // Pass-through: a valid ISIN on the input needs no cascade.
        if let Some(raw) = &req.isin
            && let Ok(isin) = raw.parse::<Isin>()
        {
            return Ok(ResolutionResult::resolved(
                isin,
                ResolutionSource::Direct,
                1.0,
            ));
        }

        let ticker = req.ticker.as_deref().and_then(validate_ticker);
        let name = req.name.as_deref().and_then(validate_name);
        if ticker.is_none() && name.is_none() {
            return Ok(ResolutionResult::unresolved(ResolutionDetail::InvalidInput));
        }

        let candidates = candidate_aliases(ticker.as_deref(), name.as_deref());

        // Local cache.
        if let Some(result) = self.from_local_cache(&candidates, &req.context)? {
            return Ok(result);
        }

        // Negative cache short-circuit, unless the caller forces a refresh.
        if !req.force_refresh && self.all_negative(&candidates)? {
            return Ok(ResolutionResult::unresolved(
                ResolutionDetail::NegativeCache,
            ));
        }

        // A failed rung never aborts the cascade; it is collected here and
        // travels on the result for the caller's error buffer.
        let mut transient = Vec::new();

        // Hive.
        if let Some(result) = self.from_hive(&candidates, &mut transient).await? {
            return Ok(result.with_transient_errors(transient));
        }

        // Micro-weight holdings stop here: no API budget for long-tail noise.
        if req.tier2 {
            return Ok(ResolutionResult::skipped_tier2().with_transient_errors(transient));
        }

        // External APIs, in priority order.
        if let Some(result) = self
            .from_apis(
                &candidates,
                ticker.as_deref(),
                name.as_deref(),
                &req.context,
                &mut transient,
            )
            .await?
        {
            return Ok(result.with_transient_errors(transient));
        }

        // Exhausted: remember the miss so the next run short-circuits.
        {
            let mut cache = self.cache.lock().expect("identity cache poisoned");
            for (alias, alias_type) in &candidates {
                cache.record_negative(alias, *alias_type)?;
            }
        }
        Ok(ResolutionResult::unresolved(ResolutionDetail::Exhausted)
            .with_transient_errors(transient))
    }

    fn from_local_cache(
        &self,
        candidates: &[(String, AliasType)],
        context: &ResolveContext,
    ) -> PrismResult<Option<ResolutionResult>> {
        let cache = self.cache.lock().expect("identity cache poisoned");

        let mut hits = Vec::new();
        for (alias, alias_type) in candidates {
            if let Some((isin, confidence, _)) = cache.get_isin_by_alias(alias, *alias_type)?
                && confidence >= RESOLVED_CONFIDENCE_FLOOR
            {
                hits.push((alias.clone(), isin, confidence));
            }
        }
        if hits.is_empty() {
            return Ok(None);
        }

        // Prefer the variant whose listing matches the expected exchange or
        // currency, when the caller supplied one.
        if context.exchange.is_some() || context.currency.is_some() {
            for (alias, isin, confidence) in &hits {
                let listings = cache.find_listing(alias)?;
                let matches = listings.iter().any(|(listed, exchange, currency)| {
                    listed == isin
                        && (context.exchange.is_none() || *exchange == context.exchange)
                        && (context.currency.is_none() || *currency == context.currency)
                });
                if matches {
                    return Ok(Some(ResolutionResult::resolved(
                        isin.clone(),
                        ResolutionSource::Cache,
                        *confidence,
                    )));
                }
            }
        }

        let (_, isin, confidence) = hits.swap_remove(0);
        Ok(Some(ResolutionResult::resolved(
            isin,
            ResolutionSource::Cache,
            confidence,
        )))
    }

    fn all_negative(&self, candidates: &[(String, AliasType)]) -> PrismResult<bool> {
        let cache = self.cache.lock().expect("identity cache poisoned");
        for (alias, alias_type) in candidates {
            if !cache.is_negative(alias, *alias_type)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn from_hive(
        &self,
        candidates: &[(String, AliasType)],
        transient: &mut Vec<PipelineError>,
    ) -> PrismResult<Option<ResolutionResult>> {
        for (alias, alias_type) in candidates {
            let lookup = match alias_type {
                AliasType::Ticker => self.hive.resolve_ticker(alias).await,
                _ => self.hive.lookup_alias(alias, *alias_type).await,
            };
            let hit = match lookup {
                Ok(Some(hit)) if hit.confidence >= RESOLVED_CONFIDENCE_FLOOR => hit,
                Ok(_) => continue,
                Err(e) => {
                    warn!(%alias, error = %e, "hive lookup failed; continuing cascade");
                    transient.push(PipelineError::new(
                        Phase::Decomposing,
                        Severity::Medium,
                        ErrorCategory::ApiError,
                        "HIVE_LOOKUP_FAILED",
                        alias,
                        e.to_string(),
                    ));
                    continue;
                }
            };

            self.cache_hive_hit(alias, *alias_type, &hit)?;
            return Ok(Some(ResolutionResult::resolved(
                hit.isin,
                ResolutionSource::Hive,
                hit.confidence,
            )));
        }
        Ok(None)
    }

    fn cache_hive_hit(&self, alias: &str, alias_type: AliasType, hit: &HiveHit) -> PrismResult<()> {
        let mut cache = self.cache.lock().expect("identity cache poisoned");
        let source = hit.source.unwrap_or(IdentitySource::Seed);
        let record = Alias::new(alias, hit.isin.clone(), alias_type, source)
            .with_confidence(hit.confidence)
            .with_listing(hit.currency.clone(), hit.exchange.clone());
        cache.upsert_alias(&record)?;
        if alias_type == AliasType::Ticker {
            cache.upsert_listing(
                alias,
                hit.exchange.as_deref(),
                &hit.isin,
                hit.currency.as_deref(),
            )?;
        }
        cache.clear_negative(alias, alias_type)?;
        Ok(())
    }

    async fn from_apis(
        &self,
        candidates: &[(String, AliasType)],
        ticker: Option<&str>,
        name: Option<&str>,
        context: &ResolveContext,
        transient: &mut Vec<PipelineError>,
    ) -> PrismResult<Option<ResolutionResult>> {
        let variants: Vec<String> = ticker.map(|t| ticker_variants(t)).unwrap_or_default();

        for api in &self.apis {
            let attempts: Vec<(Option<&str>, Option<&str>)> = if variants.is_empty() {
                vec![(None, name)]
            } else {
                variants.iter().map(|v| (Some(v.as_str()), name)).collect()
            };

            for (ticker_variant, name_arg) in attempts {
                let item = ticker_variant.or(name_arg).unwrap_or_default().to_string();
                let outcome =
                    tokio::time::timeout(API_TIMEOUT, api.resolve(ticker_variant, name_arg, context))
                        .await;
                let hit = match outcome {
                    Err(_) => {
                        warn!(api = %api.source(), "external resolver timed out");
                        transient.push(PipelineError::new(
                            Phase::Decomposing,
                            Severity::Medium,
                            ErrorCategory::ApiError,
                            "API_TIMEOUT",
                            item,
                            format!("{} resolver timed out", api.source()),
                        ));
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(api = %api.source(), error = %e, "external resolver failed");
                        transient.push(PipelineError::new(
                            Phase::Decomposing,
                            Severity::Medium,
                            ErrorCategory::ApiError,
                            "API_ERROR",
                            item,
                            e.to_string(),
                        ));
                        break;
                    }
                    Ok(Ok(None)) => continue,
                    Ok(Ok(Some(hit))) => hit,
                };
                if hit.confidence < RESOLVED_CONFIDENCE_FLOOR {
                    continue;
                }

                debug!(api = %api.source(), isin = %hit.isin, "external resolution");
                let contributed = self
                    .commit_external_hit(candidates, ticker_variant, api.source(), &hit)
                    .await?;
                let mut result = ResolutionResult::resolved(
                    hit.isin,
                    api.source().into(),
                    hit.confidence,
                );
                result.contributed = contributed;
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// Local cache first, Hive contribution best-effort after. A failed
    /// contribution never rolls back the local write.
    async fn commit_external_hit(
        &self,
        candidates: &[(String, AliasType)],
        matched_ticker: Option<&str>,
        source: IdentitySource,
        hit: &ExternalHit,
    ) -> PrismResult<bool> {
        let (alias, alias_type) = match matched_ticker {
            Some(ticker) => (ticker.to_string(), AliasType::Ticker),
            None => candidates
                .iter()
                .find(|(_, t)| *t == AliasType::Name)
                .cloned()
                .unwrap_or_else(|| (hit.isin.to_string(), AliasType::Abbreviation)),
        };

        let record = Alias::new(alias.clone(), hit.isin.clone(), alias_type, source)
            .with_confidence(hit.confidence)
            .with_listing(hit.currency.clone(), hit.exchange.clone());

        {
            let mut cache = self.cache.lock().expect("identity cache poisoned");
            cache.upsert_alias(&record)?;
            if alias_type == AliasType::Ticker {
                cache.upsert_listing(
                    &alias,
                    hit.exchange.as_deref(),
                    &hit.isin,
                    hit.currency.as_deref(),
                )?;
            }
            for (candidate, candidate_type) in candidates {
                cache.clear_negative(candidate, *candidate_type)?;
            }
        }

        if !self.contributor.contributions_enabled() {
            return Ok(false);
        }
        let mut contribution = record;
        contribution.contributor_hash = Some(self.contributor_hash.clone());
        match self.contributor.contribute_alias(&contribution).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(error = %e, alias = %contribution.alias, "hive contribution failed; continuing");
                Ok(false)
            }
        }
    }
}

fn candidate_aliases(ticker: Option<&str>, name: Option<&str>) -> Vec<(String, AliasType)> {
    let mut candidates = Vec::new();
    if let Some(ticker) = ticker {
        for variant in ticker_variants(ticker) {
            candidates.push((variant, AliasType::Ticker));
        }
    }
    if let Some(name) = name {
        let normalized = normalize_name(name);
        if !normalized.is_empty() {
            candidates.push((normalized, AliasType::Name));
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::InMemoryHive;
    use crate::model::ResolutionStatus;

    fn resolver_with(
        hive: Arc<InMemoryHive>,
        apis: Vec<Arc<dyn ExternalResolver>>,
    ) -> IsinResolver {
        let cache = Arc::new(Mutex::new(IdentityCache::open_in_memory().unwrap()));
        IsinResolver::new(cache, hive.clone(), hive, apis)
    }

    #[tokio::test]
    async fn pass_through_wins_over_everything() {
        let hive = Arc::new(InMemoryHive::new());
        let resolver = resolver_with(hive.clone(), vec![]);

        let result = resolver
            .resolve(&ResolveRequest::ticker("AAPL").with_isin("US0378331005"))
            .await
            .unwrap();
        assert_eq!(result.source, Some(ResolutionSource::Direct));
        assert_eq!(result.confidence, 1.0);
        assert_eq!(hive.read_calls(), 0);
    }

    #[tokio::test]
    async fn garbage_input_is_refused_without_io() {
        let hive = Arc::new(InMemoryHive::new());
        let resolver = resolver_with(hive.clone(), vec![]);

        let result = resolver
            .resolve(&ResolveRequest::name("x'; DROP TABLE aliases; --"))
            .await
            .unwrap();
        assert_eq!(result.status, ResolutionStatus::Unresolved);
        assert_eq!(result.detail, Some(ResolutionDetail::InvalidInput));
        assert_eq!(hive.read_calls(), 0);
    }

    #[tokio::test]
    async fn hive_hit_is_cached_then_served_locally() {
        let hive = Arc::new(InMemoryHive::new().with_ticker("NVDA", "US67066G1040", 0.80));
        let resolver = resolver_with(hive.clone(), vec![]);

        let first = resolver
            .resolve(&ResolveRequest::ticker("NVDA"))
            .await
            .unwrap();
        assert_eq!(first.source, Some(ResolutionSource::Hive));
        assert!(first.confidence >= 0.75);
        let reads_after_first = hive.read_calls();

        let second = resolver
            .resolve(&ResolveRequest::ticker("NVDA"))
            .await
            .unwrap();
        assert_eq!(second.source, Some(ResolutionSource::Cache));
        assert_eq!(second.isin, first.isin);
        assert_eq!(hive.read_calls(), reads_after_first, "cache must absorb the second call");
    }

    #[tokio::test]
    async fn api_success_caches_contributes_and_clears_negative() {
        let hive = Arc::new(InMemoryHive::new());
        let api = Arc::new(
            ScriptedResolver::new(IdentitySource::OpenFigi).answers("SHOP", "CA82509L1076"),
        );
        let resolver = resolver_with(hive.clone(), vec![api.clone()]);

        let result = resolver
            .resolve(&ResolveRequest::ticker("SHOP"))
            .await
            .unwrap();
        assert_eq!(result.source, Some(ResolutionSource::OpenFigi));
        assert!(result.contributed);
        assert_eq!(hive.contributed_aliases().len(), 1);
        assert_eq!(
            hive.contributed_aliases()[0].contributor_hash.is_some(),
            true
        );

        // The second call never reaches the API again.
        let second = resolver
            .resolve(&ResolveRequest::ticker("SHOP"))
            .await
            .unwrap();
        assert_eq!(second.source, Some(ResolutionSource::Cache));
        assert_eq!(api.call_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_miss_hits_negative_cache_next_time() {
        let hive = Arc::new(InMemoryHive::new());
        let api = Arc::new(ScriptedResolver::new(IdentitySource::Yfinance));
        let resolver = resolver_with(hive.clone(), vec![api.clone()]);

        let first = resolver
            .resolve(&ResolveRequest::ticker("ZZZZ"))
            .await
            .unwrap();
        assert_eq!(first.detail, Some(ResolutionDetail::Exhausted));
        let calls_after_first = api.call_count();
        assert!(calls_after_first >= 1);

        let second = resolver
            .resolve(&ResolveRequest::ticker("ZZZZ"))
            .await
            .unwrap();
        assert_eq!(second.detail, Some(ResolutionDetail::NegativeCache));
        assert!(second.negative_cache_hit);
        assert_eq!(api.call_count(), calls_after_first, "negative cache must absorb the retry");
    }

    #[tokio::test]
    async fn tier2_skips_the_api_tier() {
        let hive = Arc::new(InMemoryHive::new());
        let api = Arc::new(
            ScriptedResolver::new(IdentitySource::OpenFigi).answers("ZZZZ", "US0000000018"),
        );
        let resolver = resolver_with(hive.clone(), vec![api.clone()]);

        let result = resolver
            .resolve(&ResolveRequest::ticker("ZZZZ").tier(Tier::Tier2))
            .await
            .unwrap();
        assert_eq!(result.status, ResolutionStatus::SkippedTier2);
        assert_eq!(api.call_count(), 0);
    }

    #[tokio::test]
    async fn hive_outage_is_reported_not_swallowed() {
        let hive = Arc::new(InMemoryHive::new().with_failing_reads());
        let api = Arc::new(
            ScriptedResolver::new(IdentitySource::OpenFigi).answers("SHOP", "CA82509L1076"),
        );
        let resolver = resolver_with(hive, vec![api]);

        let result = resolver
            .resolve(&ResolveRequest::ticker("SHOP"))
            .await
            .unwrap();
        // The outage never aborts the cascade; the API still answers.
        assert_eq!(result.source, Some(ResolutionSource::OpenFigi));
        assert!(result.is_resolved());

        assert_eq!(result.transient_errors.len(), 1);
        let err = &result.transient_errors[0];
        assert_eq!(err.code, "HIVE_LOOKUP_FAILED");
        assert_eq!(err.category, ErrorCategory::ApiError);
        assert_eq!(err.severity, Severity::Medium);
        assert_eq!(err.item, "SHOP");
    }

    #[tokio::test]
    async fn api_outage_is_reported_and_cascade_continues() {
        let hive = Arc::new(InMemoryHive::new());
        let down = Arc::new(ScriptedResolver::new(IdentitySource::OpenFigi).with_failure());
        let up = Arc::new(
            ScriptedResolver::new(IdentitySource::Wikidata).answers("SHOP", "CA82509L1076"),
        );
        let resolver = resolver_with(hive, vec![down.clone(), up]);

        let result = resolver
            .resolve(&ResolveRequest::ticker("SHOP"))
            .await
            .unwrap();
        assert_eq!(result.source, Some(ResolutionSource::Wikidata));
        assert_eq!(down.call_count(), 1);

        assert_eq!(result.transient_errors.len(), 1);
        let err = &result.transient_errors[0];
        assert_eq!(err.code, "API_ERROR");
        assert_eq!(err.category, ErrorCategory::ApiError);
        assert_eq!(err.severity, Severity::Medium);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_negative_cache() {
        let hive = Arc::new(InMemoryHive::new());
        let api = Arc::new(ScriptedResolver::new(IdentitySource::Yfinance));
        let resolver = resolver_with(hive.clone(), vec![api.clone()]);

        resolver
            .resolve(&ResolveRequest::ticker("ZZZZ"))
            .await
            .unwrap();
        let calls = api.call_count();

        let refreshed = resolver
            .resolve(&ResolveRequest::ticker("ZZZZ").force_refresh())
            .await
            .unwrap();
        assert_eq!(refreshed.detail, Some(ResolutionDetail::Exhausted));
        assert!(api.call_count() > calls);
    }
}
