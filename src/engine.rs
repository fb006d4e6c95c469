use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::adapter::{EtfHoldingsAdapter, PositionSource};
use crate::cache::{IdentityCache, PositionsStore};
use crate::config::EngineConfig;
use crate::decomposer::{DecomposeLimits, Decomposer};
use crate::enricher::Enricher;
use crate::error::{IoError, PrismResult};
use crate::hive::{DisabledHive, HiveClient, HiveContributor, HiveDirectory};
use crate::model::Isin;
use crate::normalizer::NormalizedBatch;
use crate::pipeline::{PipelineOrchestrator, report};
use crate::resolver::{ExternalResolver, IsinResolver};
use crate::transport::EventBus;

/// The engine process state: configuration, stores, the Hive connection and
/// the pipeline orchestrator, built once at startup and shared by both
/// transports.
pub struct Engine {
    config: EngineConfig,
    identity: Arc<Mutex<IdentityCache>>,
    store: Arc<Mutex<PositionsStore>>,
    import_source: Option<Arc<dyn PositionSource>>,
    contribution_flag: Arc<AtomicBool>,
    orchestrator: PipelineOrchestrator,
    events: EventBus,
}

impl Engine {
    /// Builds the production wiring from configuration alone.
    pub fn bootstrap(
        config: EngineConfig,
        import_source: Option<Arc<dyn PositionSource>>,
        adapters: Vec<Arc<dyn EtfHoldingsAdapter>>,
    ) -> PrismResult<Arc<Self>> {
        let contribution_flag = Arc::new(AtomicBool::new(read_contribution_flag(&config)));
        let (hive_read, hive_write): (Arc<dyn HiveDirectory>, Arc<dyn HiveContributor>) =
            match &config.hive {
                Some(hive_config) => {
                    let client =
                        Arc::new(HiveClient::new(hive_config, contribution_flag.clone())?);
                    (client.clone(), client)
                }
                None => {
                    let disabled = Arc::new(DisabledHive);
                    (disabled.clone(), disabled)
                }
            };
        let apis = IsinResolver::api_tier_from_config(&config);
        Self::bootstrap_with(
            config,
            import_source,
            None,
            adapters,
            hive_read,
            hive_write,
            apis,
            contribution_flag,
        )
    }

    /// Wiring with injectable seams, used by tests and by the production
    /// path above.
    #[allow(clippy::too_many_arguments)]
    pub fn bootstrap_with(
        config: EngineConfig,
        import_source: Option<Arc<dyn PositionSource>>,
        pipeline_source: Option<Arc<dyn PositionSource>>,
        adapters: Vec<Arc<dyn EtfHoldingsAdapter>>,
        hive_read: Arc<dyn HiveDirectory>,
        hive_write: Arc<dyn HiveContributor>,
        apis: Vec<Arc<dyn ExternalResolver>>,
        contribution_flag: Arc<AtomicBool>,
    ) -> PrismResult<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir).map_err(IoError::Io)?;

        let identity = Arc::new(Mutex::new(IdentityCache::open(&config.identity_db_path())?));
        let store = Arc::new(Mutex::new(PositionsStore::open(
            &config.portfolio_db_path(),
        )?));
        let events = EventBus::new();

        let resolver = Arc::new(IsinResolver::new(
            identity.clone(),
            hive_read.clone(),
            hive_write.clone(),
            apis,
        ));
        let decomposer = Decomposer::new(
            identity.clone(),
            hive_read.clone(),
            adapters,
            resolver,
            DecomposeLimits {
                concurrency: config.decompose_concurrency,
                tier2_threshold: config.tier2_threshold,
                holdings_ttl: config.holdings_ttl,
                force_refresh: false,
            },
        );
        let enricher = Enricher::new(identity.clone(), hive_read, hive_write);

        let pipeline_source = pipeline_source.unwrap_or_else(|| {
            Arc::new(StorePositionSource {
                store: store.clone(),
            })
        });
        let orchestrator = PipelineOrchestrator::new(
            pipeline_source,
            decomposer,
            enricher,
            store.clone(),
            config.health_report_path(),
            events.clone(),
        );

        info!(data_dir = %config.data_dir.display(), "engine bootstrapped");
        Ok(Arc::new(Self {
            config,
            identity,
            store,
            import_source,
            contribution_flag,
            orchestrator,
            events,
        }))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }

    /// Called when the command stream closes: stop whatever is running.
    pub fn shutdown(&self) {
        self.orchestrator.cancel();
    }

    // ============================================================================================
    // Commands
    // ============================================================================================

    pub fn ping(&self) -> Value {
        json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") })
    }

    pub fn get_positions(&self, _portfolio_id: &str) -> PrismResult<Value> {
        let positions = self
            .store
            .lock()
            .expect("positions store poisoned")
            .get_positions()?;

        let total_value: Decimal = positions.iter().map(|p| p.market_value()).sum();
        let cost: Decimal = positions.iter().filter_map(|p| p.cost_basis).sum();
        let pnl = total_value - cost;
        let pnl_percent = if cost > Decimal::ZERO {
            (pnl / cost * Decimal::from(100)).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };
        let last_sync = positions.iter().map(|p| p.as_of).max();

        Ok(json!({
            "positions": positions,
            "totalValue": total_value.to_f64(),
            "totalPnl": pnl.to_f64(),
            "totalPnlPercent": pnl_percent,
            "lastSyncTime": last_sync,
        }))
    }

    pub async fn sync_positions(&self, portfolio_id: &str, dry_run: bool) -> PrismResult<Value> {
        let Some(source) = &self.import_source else {
            return Ok(json!({
                "syncedPositions": 0,
                "newPositions": 0,
                "updatedPositions": 0,
                "totalValue": 0.0,
                "durationMs": 0,
                "warning": "no import source configured",
            }));
        };

        let batch = source.load_positions(portfolio_id).await?;
        for err in &batch.errors {
            warn!(item = %err.item, code = %err.code, "sync dropped a row");
        }
        let total_value: Decimal = batch.positions.iter().map(|p| p.market_value()).sum();
        let outcome = self
            .store
            .lock()
            .expect("positions store poisoned")
            .sync_positions(&batch.positions, dry_run)?;

        Ok(json!({
            "syncedPositions": outcome.synced_positions,
            "newPositions": outcome.new_positions,
            "updatedPositions": outcome.updated_positions,
            "totalValue": total_value.to_f64(),
            "durationMs": outcome.duration_ms,
        }))
    }

    pub async fn run_pipeline(&self, portfolio_id: &str) -> PrismResult<Value> {
        let started = Instant::now();
        let summary = self.orchestrator.run(portfolio_id).await?;
        Ok(json!({
            "success": summary.success,
            "errors": summary.errors,
            "durationMs": started.elapsed().as_millis() as u64,
        }))
    }

    pub fn get_pipeline_report(&self) -> PrismResult<Value> {
        match report::read(&self.config.health_report_path())? {
            Some(report) => Ok(serde_json::to_value(report).map_err(IoError::Json)?),
            None => Ok(Value::Null),
        }
    }

    pub fn get_true_holdings(&self) -> PrismResult<Value> {
        let Some(outcome) = self.orchestrator.last_outcome() else {
            return Ok(json!({ "holdings": [], "summary": Value::Null }));
        };

        let resolved = outcome.rows.iter().filter(|r| r.resolved).count();
        let unresolved = outcome.rows.len() - resolved;
        let total: Decimal = outcome.rows.iter().map(|r| r.total_value).sum();
        Ok(json!({
            "holdings": outcome.rows,
            "summary": {
                "totalValue": total.to_f64(),
                "resolvedCount": resolved,
                "unresolvedCount": unresolved,
                "status": outcome.summary.status,
            },
        }))
    }

    pub fn get_dashboard_data(&self, portfolio_id: &str) -> PrismResult<Value> {
        let (positions, history) = {
            let store = self.store.lock().expect("positions store poisoned");
            (store.get_positions()?, store.run_history(30)?)
        };

        let total_value: Decimal = positions.iter().map(|p| p.market_value()).sum();
        let cost: Decimal = positions.iter().filter_map(|p| p.cost_basis).sum();
        let total_gain = total_value - cost;
        let gain_percentage = if cost > Decimal::ZERO {
            (total_gain / cost * Decimal::from(100)).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        // Day change against the previous recorded run.
        let (day_change, day_change_percent) = match history.as_slice() {
            [(_, latest), (_, previous), ..] if *previous > Decimal::ZERO => {
                let change = latest - previous;
                (
                    change.to_f64().unwrap_or(0.0),
                    (change / previous * Decimal::from(100)).to_f64().unwrap_or(0.0),
                )
            }
            _ => (0.0, 0.0),
        };

        let (top_holdings, allocations) = match self.orchestrator.last_outcome() {
            Some(outcome) => {
                let top: Vec<Value> = outcome
                    .rows
                    .iter()
                    .take(5)
                    .map(|r| {
                        json!({
                            "key": r.key,
                            "name": r.name,
                            "value": r.total_value.to_f64(),
                        })
                    })
                    .collect();
                (top, allocations_of(&outcome.rows))
            }
            None => (Vec::new(), json!({ "sector": {}, "region": {} })),
        };

        Ok(json!({
            "portfolioId": portfolio_id,
            "totalValue": total_value.to_f64(),
            "totalGain": total_gain.to_f64(),
            "gainPercentage": gain_percentage,
            "dayChange": day_change,
            "dayChangePercent": day_change_percent,
            "positionCount": positions.len(),
            "isEmpty": positions.is_empty(),
            "history": history
                .iter()
                .rev()
                .map(|(at, value)| json!({ "date": at, "value": value.to_f64() }))
                .collect::<Vec<_>>(),
            "topHoldings": top_holdings,
            "allocations": allocations,
        }))
    }

    pub fn get_overlap_analysis(&self) -> PrismResult<Value> {
        let etf_isins: Vec<Isin> = {
            let store = self.store.lock().expect("positions store poisoned");
            store
                .get_positions()?
                .into_iter()
                .filter(|p| p.is_etf())
                .filter_map(|p| p.isin)
                .collect()
        };

        let mut compositions: Vec<(Isin, BTreeMap<Isin, Decimal>)> = Vec::new();
        {
            let identity = self.identity.lock().expect("identity cache poisoned");
            for parent in &etf_isins {
                let Some((holdings, _, _)) = identity.get_etf_holdings(parent)? else {
                    continue;
                };
                let weights: BTreeMap<Isin, Decimal> = holdings
                    .into_iter()
                    .filter_map(|h| h.child_isin.map(|c| (c, h.weight)))
                    .collect();
                compositions.push((parent.clone(), weights));
            }
        }

        let n = compositions.len();
        let mut matrix = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    matrix[i][j] = 1.0;
                    continue;
                }
                let overlap: Decimal = compositions[i]
                    .1
                    .iter()
                    .filter_map(|(child, w)| {
                        compositions[j].1.get(child).map(|other| (*w).min(*other))
                    })
                    .sum();
                matrix[i][j] = overlap.to_f64().unwrap_or(0.0);
            }
        }

        let mut shared: BTreeMap<Isin, Vec<(Isin, Decimal)>> = BTreeMap::new();
        for (parent, weights) in &compositions {
            for (child, weight) in weights {
                shared
                    .entry(child.clone())
                    .or_default()
                    .push((parent.clone(), *weight));
            }
        }
        let shared_holdings: Vec<Value> = shared
            .into_iter()
            .filter(|(_, parents)| parents.len() >= 2)
            .map(|(child, parents)| {
                json!({
                    "isin": child,
                    "etfs": parents.iter().map(|(p, _)| p.clone()).collect::<Vec<_>>(),
                    "weights": parents
                        .iter()
                        .map(|(_, w)| w.to_f64().unwrap_or(0.0))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();

        Ok(json!({
            "etfs": compositions.iter().map(|(p, _)| p.clone()).collect::<Vec<_>>(),
            "matrix": matrix,
            "sharedHoldings": shared_holdings,
        }))
    }

    pub fn get_hive_contribution(&self) -> Value {
        json!({ "enabled": self.contribution_flag.load(Ordering::Relaxed) })
    }

    pub fn set_hive_contribution(&self, enabled: Option<bool>) -> PrismResult<Value> {
        if let Some(enabled) = enabled {
            self.contribution_flag.store(enabled, Ordering::Relaxed);
            std::fs::write(
                self.config.contribution_flag_path(),
                if enabled { "true\n" } else { "false\n" },
            )
            .map_err(IoError::Io)?;
            crate::cache::restrict_permissions(&self.config.contribution_flag_path());
            info!(enabled, "hive contribution preference updated");
        }
        Ok(self.get_hive_contribution())
    }
}

/// Opt-in defaults to off; the flag file is a single `true`/`false` line.
fn read_contribution_flag(config: &EngineConfig) -> bool {
    std::fs::read_to_string(config.contribution_flag_path())
        .map(|raw| raw.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn allocations_of(rows: &[crate::model::TrueExposureRow]) -> Value {
    let mut by_sector: BTreeMap<String, f64> = BTreeMap::new();
    let mut by_region: BTreeMap<String, f64> = BTreeMap::new();
    let total: Decimal = rows
        .iter()
        .filter(|r| r.resolved)
        .map(|r| r.total_value)
        .sum();
    if total <= Decimal::ZERO {
        return json!({ "sector": {}, "region": {} });
    }

    for row in rows.iter().filter(|r| r.resolved) {
        let share = (row.total_value / total * Decimal::from(100))
            .to_f64()
            .unwrap_or(0.0);
        if let Some(sector) = &row.sector {
            *by_sector.entry(sector.clone()).or_default() += share;
        }
        if let Some(region) = &row.geography {
            *by_region.entry(region.clone()).or_default() += share;
        }
    }
    json!({ "sector": by_sector, "region": by_region })
}

/// Pipeline position source backed by the local positions store: whatever
/// was last synced is what gets decomposed.
struct StorePositionSource {
    store: Arc<Mutex<PositionsStore>>,
}

#[async_trait]
impl PositionSource for StorePositionSource {
    fn source_tag(&self) -> &str {
        "store"
    }

    async fn load_positions(&self, _portfolio_id: &str) -> PrismResult<NormalizedBatch> {
        let positions = self
            .store
            .lock()
            .expect("positions store poisoned")
            .get_positions()?;
        Ok(NormalizedBatch {
            positions,
            errors: Vec::new(),
        })
    }
}
