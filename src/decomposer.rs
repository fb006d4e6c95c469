use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapter::EtfHoldingsAdapter;
use crate::cache::IdentityCache;
use crate::error::{AdapterError, PrismResult};
use crate::model::{
    CanonicalPosition, ErrorCategory, Holding, HoldingsSource, Isin, Phase, PipelineError,
    ResolutionResult, Severity,
};
use crate::resolver::{IsinResolver, ResolveContext, ResolveRequest, Tier};

/// Minimum gap between two per-ETF progress emissions.
const PROGRESS_THROTTLE: Duration = Duration::from_millis(100);

/// Tuning knobs for one decomposition run.
#[derive(Debug, Clone)]
pub struct DecomposeLimits {
    /// Bound on concurrent holdings fetches across distinct ETFs.
    pub concurrency: usize,
    /// Holdings below this weight resolve without external APIs.
    pub tier2_threshold: Decimal,
    /// Cache entries older than this are refetched.
    pub holdings_ttl: Duration,
    /// Ignore the cache entirely and refetch everything.
    pub force_refresh: bool,
}

impl Default for DecomposeLimits {
    fn default() -> Self {
        Self {
            concurrency: 5,
            tier2_threshold: Decimal::new(5, 3),
            holdings_ttl: Duration::from_secs(24 * 60 * 60),
            force_refresh: false,
        }
    }
}

/// One child row after scaling to the parent position's value.
#[derive(Debug, Clone)]
pub struct ExpandedHolding {
    pub parent_isin: Isin,
    /// Exposure key: the child ISIN, or `UNRESOLVED:{ticker|name}`.
    pub key: String,
    pub child_isin: Option<Isin>,
    pub name: String,
    pub weight: Decimal,
    pub value: Decimal,
    pub shares: Option<Decimal>,
    pub confidence: f64,
}

/// The decomposition of one ETF position, with provenance.
#[derive(Debug)]
pub struct DecomposedEtf {
    pub parent: CanonicalPosition,
    /// `None` when the ETF passes through undecomposed.
    pub source: Option<HoldingsSource>,
    pub holdings: Vec<ExpandedHolding>,
    pub weight_sum: Decimal,
    pub status: String,
    pub errors: Vec<PipelineError>,
    /// Resolver outcomes, keyed by the holding's ticker-or-name label, for
    /// the provenance monitor and the unresolved list.
    pub resolutions: Vec<(String, ResolutionResult)>,
    pub tier1_resolved: usize,
    pub tier1_failed: usize,
}

impl DecomposedEtf {
    pub fn is_passthrough(&self) -> bool {
        self.source.is_none()
    }
}

enum FetchOutcome {
    Fresh(Vec<Holding>),
    Hive(Vec<Holding>),
    Adapter(String, Vec<Holding>),
    ManualUpload,
    NoAdapter,
    Failed(String),
    Crashed(String),
}

/// One ETF's fetch result. A Hive RPC failure is carried separately from the
/// outcome so "the Hive errored" stays distinguishable from "the Hive had no
/// data" in the run's error buffer, even when the adapter fallback served.
struct Fetched {
    outcome: FetchOutcome,
    hive_error: Option<String>,
}

impl Fetched {
    fn of(outcome: FetchOutcome) -> Self {
        Self {
            outcome,
            hive_error: None,
        }
    }
}

/// Expands ETF positions into their underlying holdings.
///
/// Fetches run in parallel across distinct ETFs on a bounded worker pool;
/// per-ETF processing then happens strictly in input order so completion
/// order never leaks into results.
pub struct Decomposer {
    cache: Arc<Mutex<IdentityCache>>,
    hive: Arc<dyn crate::hive::HiveDirectory>,
    adapters: Vec<Arc<dyn EtfHoldingsAdapter>>,
    resolver: Arc<IsinResolver>,
    limits: DecomposeLimits,
}

impl Decomposer {
    pub fn new(
        cache: Arc<Mutex<IdentityCache>>,
        hive: Arc<dyn crate::hive::HiveDirectory>,
        adapters: Vec<Arc<dyn EtfHoldingsAdapter>>,
        resolver: Arc<IsinResolver>,
        limits: DecomposeLimits,
    ) -> Self {
        Self {
            cache,
            hive,
            adapters,
            resolver,
            limits,
        }
    }

    /// Decomposes every ETF position, emitting `decomposing {i}/{n}: {isin}`
    /// progress at most once per 100 ms. Cancellation is honored between
    /// ETFs; already-processed results are returned.
    #[tracing::instrument(skip_all, fields(etfs = etfs.len()))]
    pub async fn decompose_all(
        &self,
        etfs: &[CanonicalPosition],
        cx: &CancellationToken,
        on_progress: &mut (dyn FnMut(usize, usize, String) + Send),
    ) -> PrismResult<Vec<DecomposedEtf>> {
        let mut outcomes = self.prefetch(etfs, cx).await;
        self.persist_fetched(&mut outcomes)?;

        let total = etfs.len();
        let mut results = Vec::with_capacity(total);
        let mut last_emit: Option<Instant> = None;

        for (index, etf) in etfs.iter().enumerate() {
            if cx.is_cancelled() {
                break;
            }

            let throttle_open = last_emit
                .is_none_or(|t| t.elapsed() >= PROGRESS_THROTTLE);
            if throttle_open || index + 1 == total {
                let isin_label = etf
                    .isin
                    .as_ref()
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| etf.exposure_key());
                on_progress(index + 1, total, format!("decomposing {}/{}: {}", index + 1, total, isin_label));
                last_emit = Some(Instant::now());
            }

            // Duplicate positions on the same ETF reuse the freshly cached
            // composition instead of consuming a second fetch.
            let fetched = etf.isin.as_ref().and_then(|isin| {
                outcomes.remove(isin).or_else(|| {
                    self.fresh_cached(isin)
                        .map(|h| Fetched::of(FetchOutcome::Fresh(h)))
                })
            });
            results.push(self.expand(etf, fetched).await?);
        }
        Ok(results)
    }

    /// Parallel holdings fetch for every ETF without a fresh cache entry.
    /// Workers pull from a shared queue; a crash inside one fetch is
    /// contained to that ETF.
    async fn prefetch(
        &self,
        etfs: &[CanonicalPosition],
        cx: &CancellationToken,
    ) -> HashMap<Isin, Fetched> {
        let mut outcomes = HashMap::new();
        let mut jobs = Vec::new();

        for etf in etfs {
            let Some(parent) = &etf.isin else { continue };
            if outcomes.contains_key(parent) || jobs.contains(parent) {
                continue;
            }
            if !self.limits.force_refresh
                && let Some(holdings) = self.fresh_cached(parent)
            {
                outcomes.insert(parent.clone(), Fetched::of(FetchOutcome::Fresh(holdings)));
                continue;
            }
            jobs.push(parent.clone());
        }

        if jobs.is_empty() {
            return outcomes;
        }

        let workers = self.limits.concurrency.min(jobs.len()).max(1);
        let (job_tx, job_rx) = async_channel::bounded::<Isin>(jobs.len());
        for job in jobs {
            // Queue is sized to the job list; sends cannot fail.
            let _ = job_tx.try_send(job);
        }
        drop(job_tx);

        let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let rx = job_rx.clone();
            let tx = out_tx.clone();
            let hive = self.hive.clone();
            let adapters = self.adapters.clone();
            let cx = cx.clone();
            pool.spawn(async move {
                while let Ok(parent) = rx.recv().await {
                    if cx.is_cancelled() {
                        break;
                    }
                    // A separate task per fetch so a panicking adapter takes
                    // down one ETF, not the worker.
                    let handle = tokio::spawn(fetch_one(hive.clone(), adapters.clone(), parent.clone()));
                    let fetched = match handle.await {
                        Ok(fetched) => fetched,
                        Err(join_err) => Fetched::of(FetchOutcome::Crashed(join_err.to_string())),
                    };
                    if tx.send((parent, fetched)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(out_tx);
        drop(job_rx);

        while let Some((parent, fetched)) = out_rx.recv().await {
            outcomes.insert(parent, fetched);
        }
        while pool.join_next().await.is_some() {}
        outcomes
    }

    fn fresh_cached(&self, parent: &Isin) -> Option<Vec<Holding>> {
        let cache = self.cache.lock().expect("identity cache poisoned");
        let (holdings, _tag, fetched_at) = cache.get_etf_holdings(parent).ok()??;
        let age = Utc::now().signed_duration_since(fetched_at);
        (age.to_std().unwrap_or_default() <= self.limits.holdings_ttl && !holdings.is_empty())
            .then_some(holdings)
    }

    /// Newly fetched compositions are cached wholesale before expansion so a
    /// second run is served locally.
    fn persist_fetched(&self, outcomes: &mut HashMap<Isin, Fetched>) -> PrismResult<()> {
        let mut cache = self.cache.lock().expect("identity cache poisoned");
        for (parent, fetched) in outcomes.iter() {
            match &fetched.outcome {
                FetchOutcome::Hive(holdings) => {
                    cache.put_etf_holdings(parent, holdings, "hive")?;
                }
                FetchOutcome::Adapter(tag, holdings) => {
                    cache.put_etf_holdings(parent, holdings, tag)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn expand(
        &self,
        etf: &CanonicalPosition,
        fetched: Option<Fetched>,
    ) -> PrismResult<DecomposedEtf> {
        let parent_value = etf.market_value();
        let parent_isin = etf.isin.clone();
        let item = etf.exposure_key();

        let mut errors = Vec::new();
        let outcome = fetched.map(|f| {
            if let Some(msg) = f.hive_error {
                errors.push(PipelineError::new(
                    Phase::Decomposing,
                    Severity::Low,
                    ErrorCategory::ApiError,
                    "HIVE_HOLDINGS_LOOKUP_FAILED",
                    &item,
                    msg,
                ));
            }
            f.outcome
        });

        let (source, holdings) = match outcome {
            Some(FetchOutcome::Fresh(h)) => (HoldingsSource::Cached, h),
            Some(FetchOutcome::Hive(h)) => (HoldingsSource::Hive, h),
            Some(FetchOutcome::Adapter(tag, h)) => (HoldingsSource::Adapter(tag), h),
            Some(FetchOutcome::ManualUpload) | Some(FetchOutcome::NoAdapter) => {
                errors.push(
                    PipelineError::new(
                        Phase::Decomposing,
                        Severity::High,
                        ErrorCategory::MissingSource,
                        "MANUAL_UPLOAD_REQUIRED",
                        &item,
                        format!("no holdings source can serve {item}"),
                    )
                    .with_fix_hint(
                        "Upload the issuer's holdings file for this ETF via the import dialog",
                    ),
                );
                return Ok(passthrough(etf, "manual_upload_required", errors));
            }
            Some(FetchOutcome::Failed(msg)) => {
                errors.push(
                    PipelineError::new(
                        Phase::Decomposing,
                        Severity::High,
                        ErrorCategory::AdapterError,
                        "ADAPTER_FAILED",
                        &item,
                        msg,
                    )
                    .with_fix_hint("Retry later or upload the issuer's holdings file manually"),
                );
                return Ok(passthrough(etf, "adapter_failed", errors));
            }
            Some(FetchOutcome::Crashed(msg)) => {
                errors.push(
                    PipelineError::new(
                        Phase::Decomposing,
                        Severity::Critical,
                        ErrorCategory::AdapterError,
                        "ADAPTER_CRASHED",
                        &item,
                        msg,
                    )
                    .with_fix_hint("Upload the issuer's holdings file for this ETF manually"),
                );
                return Ok(passthrough(etf, "adapter_crashed", errors));
            }
            None => {
                errors.push(
                    PipelineError::new(
                        Phase::Decomposing,
                        Severity::High,
                        ErrorCategory::MissingSource,
                        "MANUAL_UPLOAD_REQUIRED",
                        &item,
                        "ETF position carries no ISIN to fetch holdings for",
                    )
                    .with_fix_hint("Resolve the ETF's ISIN or upload its holdings file"),
                );
                return Ok(passthrough(etf, "manual_upload_required", errors));
            }
        };

        let weight_sum: Decimal = holdings.iter().map(|h| h.weight).sum();
        let (min, max) = Holding::weight_sum_bounds();
        let mut status = "ok";
        if weight_sum < min || weight_sum > max {
            status = "weight_drift";
            errors.push(
                PipelineError::new(
                    Phase::Decomposing,
                    Severity::High,
                    ErrorCategory::DataCorruption,
                    "WEIGHT_SUM_DRIFT",
                    &item,
                    "sum of holding weights outside the tolerated band",
                )
                .with_expected_actual("[0.95, 1.05]", weight_sum.to_string()),
            );
        }

        let parent = parent_isin.clone().expect("ISIN checked in fetch dispatch");
        let mut expanded = Vec::with_capacity(holdings.len());
        let mut resolutions = Vec::new();
        let mut tier1_resolved = 0usize;
        let mut tier1_failed = 0usize;

        for holding in &holdings {
            let tier = if holding.weight < self.limits.tier2_threshold {
                Tier::Tier2
            } else {
                Tier::Tier1
            };

            let label = holding
                .child_ticker
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| holding.child_name.clone());

            let (child_isin, resolution) = self.child_identity(etf, holding, tier).await?;
            if let Some(mut resolution) = resolution {
                errors.append(&mut resolution.transient_errors);
                if tier == Tier::Tier1 {
                    if resolution.is_resolved() {
                        tier1_resolved += 1;
                    } else {
                        tier1_failed += 1;
                        let reason = resolution
                            .detail
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "no answer above the confidence floor".into());
                        errors.push(PipelineError::new(
                            Phase::Decomposing,
                            Severity::Medium,
                            ErrorCategory::ResolutionError,
                            "RESOLUTION_EXHAUSTED",
                            &label,
                            format!("could not resolve '{label}' to an ISIN ({reason})"),
                        ));
                    }
                }
                resolutions.push((label.clone(), resolution));
            } else if tier == Tier::Tier1 && child_isin.is_some() {
                tier1_resolved += 1;
            }

            let key = match &child_isin {
                Some(isin) => isin.to_string(),
                None => format!("UNRESOLVED:{label}"),
            };

            expanded.push(ExpandedHolding {
                parent_isin: parent.clone(),
                key,
                child_isin,
                name: holding.child_name.clone(),
                weight: holding.weight,
                value: holding.weight * parent_value,
                shares: holding.shares,
                confidence: holding.confidence,
            });
        }

        debug!(
            parent = %parent,
            source = %source,
            holdings = expanded.len(),
            %weight_sum,
            "etf decomposed"
        );

        Ok(DecomposedEtf {
            parent: etf.clone(),
            source: Some(source),
            holdings: expanded,
            weight_sum,
            status: status.to_string(),
            errors,
            resolutions,
            tier1_resolved,
            tier1_failed,
        })
    }

    /// Child identity per the replacement rule: an adapter-supplied valid
    /// ISIN is authoritative; resolution only fills gaps, and only above
    /// 0.70 confidence.
    async fn child_identity(
        &self,
        etf: &CanonicalPosition,
        holding: &Holding,
        tier: Tier,
    ) -> PrismResult<(Option<Isin>, Option<ResolutionResult>)> {
        if let Some(isin) = &holding.child_isin {
            return Ok((Some(isin.clone()), None));
        }

        let request = ResolveRequest::of(
            holding.child_ticker.clone(),
            (!holding.child_name.is_empty()).then(|| holding.child_name.clone()),
        )
        .with_context(ResolveContext {
            currency: Some(etf.currency.clone()),
            exchange: None,
        })
        .tier(tier);

        let resolution = self.resolver.resolve(&request).await?;
        let replacement = (resolution.is_resolved() && resolution.confidence > 0.70)
            .then(|| resolution.isin.clone())
            .flatten();
        Ok((replacement, Some(resolution)))
    }
}

fn passthrough(etf: &CanonicalPosition, status: &str, errors: Vec<PipelineError>) -> DecomposedEtf {
    DecomposedEtf {
        parent: etf.clone(),
        source: None,
        holdings: Vec::new(),
        weight_sum: Decimal::ZERO,
        status: status.to_string(),
        errors,
        resolutions: Vec::new(),
        tier1_resolved: 0,
        tier1_failed: 0,
    }
}

async fn fetch_one(
    hive: Arc<dyn crate::hive::HiveDirectory>,
    adapters: Vec<Arc<dyn EtfHoldingsAdapter>>,
    parent: Isin,
) -> Fetched {
    let mut hive_error = None;
    match hive.get_etf_holdings(&parent).await {
        Ok(Some(holdings)) => return Fetched::of(FetchOutcome::Hive(holdings)),
        Ok(None) => {}
        Err(e) => {
            warn!(parent = %parent, error = %e, "hive holdings lookup failed");
            hive_error = Some(e.to_string());
        }
    }

    let outcome = match adapters.iter().find(|a| a.covers(&parent)) {
        None => FetchOutcome::NoAdapter,
        Some(adapter) => match adapter.fetch_holdings(&parent).await {
            Ok(holdings) if holdings.is_empty() => FetchOutcome::Failed(format!(
                "{} returned an empty composition",
                adapter.adapter_tag()
            )),
            Ok(holdings) => FetchOutcome::Adapter(adapter.adapter_tag().to_string(), holdings),
            Err(AdapterError::ManualUploadRequired { .. }) => FetchOutcome::ManualUpload,
            Err(e) => FetchOutcome::Failed(e.to_string()),
        },
    };
    Fetched {
        outcome,
        hive_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ScriptedBehavior, ScriptedHoldingsAdapter};
    use crate::hive::InMemoryHive;
    use crate::model::AssetClass;
    use crate::resolver::IsinResolver;

    const WORLD_ETF: &str = "IE00B4L5Y983";
    const APPLE: &str = "US0378331005";
    const MSFT: &str = "US5949181045";

    fn etf_position(isin: &str, quantity: &str, unit_price: &str) -> CanonicalPosition {
        CanonicalPosition {
            isin: Some(isin.parse().unwrap()),
            symbol: None,
            name: "Test ETF".into(),
            asset_class: AssetClass::Etf,
            quantity: quantity.parse().unwrap(),
            unit_price: unit_price.parse().unwrap(),
            currency: "EUR".into(),
            cost_basis: None,
            source_tag: "test".into(),
            as_of: Utc::now(),
        }
    }

    fn holding(parent: &str, child_isin: Option<&str>, name: &str, weight: &str) -> Holding {
        Holding {
            parent_isin: parent.parse().unwrap(),
            child_isin: child_isin.map(|i| i.parse().unwrap()),
            child_ticker: None,
            child_name: name.into(),
            weight: weight.parse().unwrap(),
            shares: None,
            confidence: 0.95,
            as_of: Utc::now(),
        }
    }

    fn decomposer(
        adapter: Arc<ScriptedHoldingsAdapter>,
        hive: Arc<InMemoryHive>,
    ) -> Decomposer {
        let cache = Arc::new(Mutex::new(IdentityCache::open_in_memory().unwrap()));
        let resolver = Arc::new(IsinResolver::new(
            cache.clone(),
            hive.clone(),
            hive.clone(),
            vec![],
        ));
        Decomposer::new(cache, hive, vec![adapter], resolver, DecomposeLimits::default())
    }

    fn no_progress() -> impl FnMut(usize, usize, String) {
        |_, _, _| {}
    }

    #[tokio::test]
    async fn adapter_serves_then_cache_serves() {
        let adapter = Arc::new(ScriptedHoldingsAdapter::new("ishares").serve(
            WORLD_ETF.parse().unwrap(),
            vec![
                holding(WORLD_ETF, Some(APPLE), "Apple", "0.6"),
                holding(WORLD_ETF, Some(MSFT), "Microsoft", "0.4"),
            ],
        ));
        let hive = Arc::new(InMemoryHive::new());
        let d = decomposer(adapter.clone(), hive);
        let etfs = [etf_position(WORLD_ETF, "1", "100")];
        let cx = CancellationToken::new();

        let first = d
            .decompose_all(&etfs, &cx, &mut no_progress())
            .await
            .unwrap();
        assert_eq!(
            first[0].source,
            Some(HoldingsSource::Adapter("ishares".into()))
        );
        assert_eq!(first[0].holdings.len(), 2);
        assert_eq!(first[0].holdings[0].value, "60".parse().unwrap());
        assert_eq!(first[0].holdings[1].value, "40".parse().unwrap());
        assert_eq!(adapter.call_count(), 1);

        let second = d
            .decompose_all(&etfs, &cx, &mut no_progress())
            .await
            .unwrap();
        assert_eq!(second[0].source, Some(HoldingsSource::Cached));
        assert_eq!(adapter.call_count(), 1, "cache must absorb the second run");
    }

    #[tokio::test]
    async fn hive_outranks_adapter() {
        let adapter = Arc::new(ScriptedHoldingsAdapter::new("ishares").serve(
            WORLD_ETF.parse().unwrap(),
            vec![holding(WORLD_ETF, Some(APPLE), "Apple", "1.0")],
        ));
        let hive = Arc::new(InMemoryHive::new().with_holdings(
            WORLD_ETF,
            vec![holding(WORLD_ETF, Some(MSFT), "Microsoft", "1.0")],
        ));
        let d = decomposer(adapter.clone(), hive);

        let results = d
            .decompose_all(
                &[etf_position(WORLD_ETF, "1", "100")],
                &CancellationToken::new(),
                &mut no_progress(),
            )
            .await
            .unwrap();
        assert_eq!(results[0].source, Some(HoldingsSource::Hive));
        assert_eq!(results[0].holdings[0].child_isin.as_ref().unwrap().as_str(), MSFT);
        assert_eq!(adapter.call_count(), 0);
    }

    #[tokio::test]
    async fn manual_upload_becomes_passthrough_with_fix_hint() {
        let adapter = Arc::new(ScriptedHoldingsAdapter::new("ishares").with_behavior(
            WORLD_ETF.parse().unwrap(),
            ScriptedBehavior::ManualUpload,
        ));
        let d = decomposer(adapter, Arc::new(InMemoryHive::new()));

        let results = d
            .decompose_all(
                &[etf_position(WORLD_ETF, "2", "50")],
                &CancellationToken::new(),
                &mut no_progress(),
            )
            .await
            .unwrap();
        let etf = &results[0];
        assert!(etf.is_passthrough());
        assert_eq!(etf.errors.len(), 1);
        assert_eq!(etf.errors[0].category, ErrorCategory::MissingSource);
        assert_eq!(etf.errors[0].severity, Severity::High);
        assert!(etf.errors[0].fix_hint.is_some());
    }

    #[tokio::test]
    async fn adapter_panic_is_contained_as_critical() {
        let adapter = Arc::new(ScriptedHoldingsAdapter::new("ishares").with_behavior(
            WORLD_ETF.parse().unwrap(),
            ScriptedBehavior::Panic,
        ));
        let d = decomposer(adapter, Arc::new(InMemoryHive::new()));

        let results = d
            .decompose_all(
                &[etf_position(WORLD_ETF, "2", "50")],
                &CancellationToken::new(),
                &mut no_progress(),
            )
            .await
            .unwrap();
        let etf = &results[0];
        assert!(etf.is_passthrough());
        assert_eq!(etf.errors[0].severity, Severity::Critical);
        assert_eq!(etf.errors[0].category, ErrorCategory::AdapterError);
    }

    #[tokio::test]
    async fn weight_drift_is_recorded_not_corrected() {
        let adapter = Arc::new(ScriptedHoldingsAdapter::new("ishares").serve(
            WORLD_ETF.parse().unwrap(),
            vec![holding(WORLD_ETF, Some(APPLE), "Apple", "0.5")],
        ));
        let d = decomposer(adapter, Arc::new(InMemoryHive::new()));

        let results = d
            .decompose_all(
                &[etf_position(WORLD_ETF, "1", "100")],
                &CancellationToken::new(),
                &mut no_progress(),
            )
            .await
            .unwrap();
        let etf = &results[0];
        assert_eq!(etf.status, "weight_drift");
        assert_eq!(etf.errors[0].category, ErrorCategory::DataCorruption);
        assert_eq!(etf.weight_sum, "0.5".parse().unwrap());
        // The holding itself is untouched.
        assert_eq!(etf.holdings[0].value, "50".parse().unwrap());
    }

    #[tokio::test]
    async fn unresolved_tier1_holding_records_resolution_error() {
        let mut unknown = holding(WORLD_ETF, None, "", "0.5");
        unknown.child_ticker = Some("ZZZZ".into());
        let adapter = Arc::new(ScriptedHoldingsAdapter::new("ishares").serve(
            WORLD_ETF.parse().unwrap(),
            vec![holding(WORLD_ETF, Some(APPLE), "Apple", "0.5"), unknown],
        ));
        let d = decomposer(adapter, Arc::new(InMemoryHive::new()));

        let results = d
            .decompose_all(
                &[etf_position(WORLD_ETF, "1", "100")],
                &CancellationToken::new(),
                &mut no_progress(),
            )
            .await
            .unwrap();
        let etf = &results[0];
        assert_eq!(etf.tier1_failed, 1);

        let err = etf
            .errors
            .iter()
            .find(|e| e.code == "RESOLUTION_EXHAUSTED")
            .expect("exhausted tier-1 resolution must be recorded");
        assert_eq!(err.category, ErrorCategory::ResolutionError);
        assert_eq!(err.severity, Severity::Medium);
        assert_eq!(err.item, "ZZZZ");

        // The row still flows through as clearly marked unresolved exposure.
        assert_eq!(etf.holdings[1].key, "UNRESOLVED:ZZZZ");
    }

    #[tokio::test]
    async fn hive_holdings_outage_is_recorded_alongside_adapter_result() {
        let adapter = Arc::new(ScriptedHoldingsAdapter::new("ishares").serve(
            WORLD_ETF.parse().unwrap(),
            vec![holding(WORLD_ETF, Some(APPLE), "Apple", "1.0")],
        ));
        let hive = Arc::new(InMemoryHive::new().with_failing_reads());
        let d = decomposer(adapter, hive);

        let results = d
            .decompose_all(
                &[etf_position(WORLD_ETF, "1", "100")],
                &CancellationToken::new(),
                &mut no_progress(),
            )
            .await
            .unwrap();
        let etf = &results[0];
        // The adapter fallback still serves the composition.
        assert_eq!(
            etf.source,
            Some(HoldingsSource::Adapter("ishares".into()))
        );

        let err = etf
            .errors
            .iter()
            .find(|e| e.code == "HIVE_HOLDINGS_LOOKUP_FAILED")
            .expect("hive RPC failure must be distinguishable from a miss");
        assert_eq!(err.category, ErrorCategory::ApiError);
        assert_eq!(err.severity, Severity::Low);
    }

    #[tokio::test]
    async fn micro_weight_unknowns_become_unresolved_without_api() {
        let mut unknown = holding(WORLD_ETF, None, "", "0.0001");
        unknown.child_ticker = Some("ZZZZ".into());
        let adapter = Arc::new(ScriptedHoldingsAdapter::new("ishares").serve(
            WORLD_ETF.parse().unwrap(),
            vec![holding(WORLD_ETF, Some(APPLE), "Apple", "0.9999"), unknown],
        ));
        let d = decomposer(adapter, Arc::new(InMemoryHive::new()));

        let results = d
            .decompose_all(
                &[etf_position(WORLD_ETF, "1", "10000")],
                &CancellationToken::new(),
                &mut no_progress(),
            )
            .await
            .unwrap();
        let etf = &results[0];
        assert_eq!(etf.holdings[1].key, "UNRESOLVED:ZZZZ");
        let (_, resolution) = &etf.resolutions[0];
        assert_eq!(
            resolution.status,
            crate::model::ResolutionStatus::SkippedTier2
        );
        // Value reconciliation still holds exactly.
        let total: Decimal = etf.holdings.iter().map(|h| h.value).sum();
        assert_eq!(total, etf.parent.market_value() * etf.weight_sum);
    }

    #[tokio::test]
    async fn cancellation_stops_between_etfs() {
        let adapter = Arc::new(
            ScriptedHoldingsAdapter::new("ishares")
                .serve(
                    WORLD_ETF.parse().unwrap(),
                    vec![holding(WORLD_ETF, Some(APPLE), "Apple", "1.0")],
                )
                .serve(
                    "IE00B3RBWM25".parse().unwrap(),
                    vec![holding("IE00B3RBWM25", Some(MSFT), "Microsoft", "1.0")],
                ),
        );
        let d = decomposer(adapter, Arc::new(InMemoryHive::new()));
        let etfs = [
            etf_position(WORLD_ETF, "1", "100"),
            etf_position("IE00B3RBWM25", "1", "100"),
        ];

        let cx = CancellationToken::new();
        let mut on_progress = |done: usize, _total: usize, _msg: String| {
            if done == 1 {
                cx.cancel();
            }
        };
        // Cancel fires after the first ETF's progress tick; the loop checks
        // the flag before the second ETF.
        let results = d.decompose_all(&etfs, &cx, &mut on_progress).await.unwrap();
        assert_eq!(results.len(), 1);
    }
}
