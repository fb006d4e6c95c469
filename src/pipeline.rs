pub mod monitor;
pub mod report;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapter::PositionSource;
use crate::aggregator::Aggregator;
use crate::cache::{PositionsStore, positions::RunRecord};
use crate::decomposer::{DecomposedEtf, Decomposer};
use crate::enricher::Enricher;
use crate::error::{PipelineFault, PrismError, PrismResult};
use crate::model::report::{DataQuality, DecompositionSection, EnrichmentSection};
use crate::model::{
    CanonicalPosition, EngineEvent, ErrorCategory, EtfSourceRow, HealthReport, Isin, Phase,
    PipelineError, PipelineProgress, PipelineSummary, ResolutionStatus, RunStatus, Severity,
    SummaryMetrics, TrueExposureRow,
};
use crate::transport::EventBus;

pub use monitor::RunMonitor;

/// Hard ceiling on one run's wall clock.
pub const RUN_DEADLINE: Duration = Duration::from_secs(600);

/// Cap on the unresolved list in the summary.
const UNRESOLVED_CAP: usize = 100;

/// Everything one finished run leaves behind.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub summary: PipelineSummary,
    pub rows: Vec<TrueExposureRow>,
    pub report: HealthReport,
}

/// Drives the phase state machine: Loading → Decomposing → Enriching →
/// Aggregating → Reporting, with exactly one run in flight per process.
///
/// Phase problems travel as [`PipelineError`] values inside the summary;
/// only [`PipelineFault::AlreadyRunning`] surfaces as a hard error.
pub struct PipelineOrchestrator {
    source: Arc<dyn PositionSource>,
    decomposer: Decomposer,
    enricher: Enricher,
    store: Arc<Mutex<PositionsStore>>,
    report_path: PathBuf,
    events: EventBus,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    last_outcome: Mutex<Option<Arc<PipelineOutcome>>>,
}

impl PipelineOrchestrator {
    pub fn new(
        source: Arc<dyn PositionSource>,
        decomposer: Decomposer,
        enricher: Enricher,
        store: Arc<Mutex<PositionsStore>>,
        report_path: PathBuf,
        events: EventBus,
    ) -> Self {
        Self {
            source,
            decomposer,
            enricher,
            store,
            report_path,
            events,
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            last_outcome: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cooperative cancellation: honored between phases and between per-ETF
    /// iterations.
    pub fn cancel(&self) {
        self.cancel.lock().expect("cancel token poisoned").cancel();
    }

    pub fn last_outcome(&self) -> Option<Arc<PipelineOutcome>> {
        self.last_outcome
            .lock()
            .expect("outcome slot poisoned")
            .clone()
    }

    #[tracing::instrument(skip_all, fields(portfolio_id))]
    pub async fn run(&self, portfolio_id: &str) -> PrismResult<PipelineSummary> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PipelineFault::AlreadyRunning.into());
        }

        let token = CancellationToken::new();
        *self.cancel.lock().expect("cancel token poisoned") = token.clone();

        let started_at = Utc::now();
        let outcome = tokio::time::timeout(RUN_DEADLINE, self.run_inner(portfolio_id, &token)).await;
        self.running.store(false, Ordering::SeqCst);

        let outcome = match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => self.failed_outcome(e, started_at),
            Err(_elapsed) => self.failed_outcome(PipelineFault::Timeout.into(), started_at),
        };

        let summary = outcome.summary.clone();
        *self.last_outcome.lock().expect("outcome slot poisoned") = Some(Arc::new(outcome));
        Ok(summary)
    }

    async fn run_inner(
        &self,
        portfolio_id: &str,
        cx: &CancellationToken,
    ) -> PrismResult<PipelineOutcome> {
        let mut monitor = RunMonitor::start();
        let mut errors: Vec<PipelineError> = Vec::new();
        let started_at = Utc::now();
        let mut progress = ProgressEmitter::new(&self.events);

        // ── Loading ─────────────────────────────────────────────────────
        let phase_start = Instant::now();
        let batch = self.source.load_positions(portfolio_id).await?;
        errors.extend(batch.errors.iter().cloned());
        let positions = batch.positions;
        monitor.set_phase_duration(Phase::Loading, phase_start.elapsed().as_secs_f64());

        if positions.is_empty() {
            info!("empty portfolio; nothing to decompose");
            return self.finalize(
                RunStatus::Completed,
                started_at,
                monitor,
                errors,
                SummaryMetrics::default(),
                Vec::new(),
                Vec::new(),
                &mut progress,
            );
        }
        progress.emit(Phase::Loading, "loading portfolio".into(), 5.0);

        let (etfs, mut direct): (Vec<_>, Vec<_>) =
            positions.into_iter().partition(|p| p.is_etf());
        let direct_holdings = direct.len();
        let etf_positions = etfs.len();

        // ── Decomposing ─────────────────────────────────────────────────
        let phase_start = Instant::now();
        let decomposed = {
            let progress = &mut progress;
            let mut on_progress = |done: usize, total: usize, msg: String| {
                let pct = 10.0 + 60.0 * done as f64 / total.max(1) as f64;
                progress.emit(Phase::Decomposing, msg, pct);
            };
            self.decomposer
                .decompose_all(&etfs, cx, &mut on_progress)
                .await?
        };
        monitor.set_phase_duration(Phase::Decomposing, phase_start.elapsed().as_secs_f64());

        let mut metrics = SummaryMetrics {
            direct_holdings,
            etf_positions,
            etfs_processed: decomposed.len(),
            ..SummaryMetrics::default()
        };
        let mut unresolved = Vec::new();
        for etf in &decomposed {
            errors.extend(etf.errors.iter().cloned());
            metrics.tier1_resolved += etf.tier1_resolved;
            metrics.tier1_failed += etf.tier1_failed;
            for (label, resolution) in &etf.resolutions {
                monitor.record_resolution(resolution);
                if resolution.status == ResolutionStatus::Unresolved
                    && unresolved.len() < UNRESOLVED_CAP
                {
                    unresolved.push(label.clone());
                }
            }
            if let Some(isin) = &etf.parent.isin {
                monitor.record_etf(EtfSourceRow {
                    isin: isin.clone(),
                    source: etf.source.clone(),
                    holdings_count: etf.holdings.len(),
                    weight_sum: etf.weight_sum,
                    status: etf.status.clone(),
                });
                if let Some(symbol) = &etf.parent.symbol {
                    monitor.tickers.insert(isin.clone(), symbol.clone());
                }
            }
            if etf.is_passthrough() {
                direct.push(etf.parent.clone());
            }
        }

        if cx.is_cancelled() {
            warn!("pipeline cancelled during decomposition");
            return self.finalize(
                RunStatus::Cancelled,
                started_at,
                monitor,
                errors,
                metrics,
                Vec::new(),
                unresolved,
                &mut progress,
            );
        }

        // ── Enriching ───────────────────────────────────────────────────
        let phase_start = Instant::now();
        let child_isins = unique_isins(&direct, &decomposed);
        progress.emit(
            Phase::Enriching,
            format!("enriching {} securities", child_isins.len()),
            72.0,
        );
        let enrichment = self.enricher.enrich(&child_isins).await?;
        errors.extend(enrichment.errors.iter().cloned());
        monitor.absorb_enrichment(&enrichment);
        monitor.set_phase_duration(Phase::Enriching, phase_start.elapsed().as_secs_f64());

        if cx.is_cancelled() {
            return self.finalize(
                RunStatus::Cancelled,
                started_at,
                monitor,
                errors,
                metrics,
                Vec::new(),
                unresolved,
                &mut progress,
            );
        }

        // ── Aggregating ─────────────────────────────────────────────────
        let phase_start = Instant::now();
        progress.emit(Phase::Aggregating, "aggregating exposure".into(), 88.0);
        let aggregation = Aggregator::aggregate(&direct, &decomposed, &enrichment.metadata)?;
        errors.extend(aggregation.errors.iter().cloned());
        monitor.set_phase_duration(Phase::Aggregating, phase_start.elapsed().as_secs_f64());

        self.persist_breakdown(&decomposed)?;

        let outcome = self.finalize(
            RunStatus::Completed,
            started_at,
            monitor,
            errors,
            metrics,
            aggregation.rows,
            unresolved,
            &mut progress,
        )?;
        self.record_run(&outcome, aggregation.grand_total, started_at)?;
        Ok(outcome)
    }

    /// Reporting phase shared by every terminal path: builds the summary and
    /// health report, writes the report atomically, then emits the summary
    /// followed by the final 100% progress tick.
    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        status: RunStatus,
        started_at: chrono::DateTime<chrono::Utc>,
        mut monitor: RunMonitor,
        errors: Vec<PipelineError>,
        metrics: SummaryMetrics,
        rows: Vec<TrueExposureRow>,
        unresolved: Vec<String>,
        progress: &mut ProgressEmitter<'_>,
    ) -> PrismResult<PipelineOutcome> {
        let phase_start = Instant::now();
        // An empty run (or a failure before the first phase tick) goes
        // straight to its terminal event instead of a reporting tick.
        if progress.has_emitted() {
            progress.emit(Phase::Reporting, "writing health report".into(), 96.0);
        }

        let total_assets = rows.len();
        monitor.set_phase_duration(Phase::Reporting, phase_start.elapsed().as_secs_f64());
        let performance = monitor.performance(total_assets);
        let enrichment_stats = monitor.enrichment_stats();
        let hive_log = monitor.hive_log();

        let mut data_quality = DataQuality::from_errors(&errors);
        if errors.iter().any(|e| {
            e.category == ErrorCategory::InvariantViolation || e.severity == Severity::Critical
        }) {
            data_quality.mark_untrustworthy();
        }

        let report = HealthReport {
            timestamp: Utc::now(),
            metrics,
            performance: performance.clone(),
            decomposition: DecompositionSection {
                per_etf: monitor.per_etf.clone(),
            },
            enrichment: EnrichmentSection {
                stats: enrichment_stats,
                hive_log: hive_log.clone(),
            },
            etf_stats: report::etf_stats(&monitor.per_etf, &monitor.tickers),
            failures: errors.clone(),
            data_quality,
        };
        if let Err(e) = report::write_atomic(&self.report_path, &report) {
            error!(error = %e, "health report write failed");
        }

        let summary = PipelineSummary {
            success: status == RunStatus::Completed,
            status,
            metrics,
            performance,
            decomposition: monitor.per_etf.clone(),
            enrichment: enrichment_stats,
            hive_log,
            unresolved,
            errors,
            timestamp: Utc::now(),
        };

        self.events
            .emit(EngineEvent::Summary(Box::new(summary.clone())));
        // The 100% tick marks Done; a failed run never reaches it.
        if status != RunStatus::Failed {
            progress.emit(Phase::Reporting, "pipeline complete".into(), 100.0);
        }

        info!(
            status = %summary.status,
            etfs = summary.metrics.etfs_processed,
            errors = summary.errors.len(),
            seconds = summary.performance.execution_time_seconds,
            started = %started_at,
            "pipeline finished"
        );
        Ok(PipelineOutcome {
            summary,
            rows,
            report,
        })
    }

    /// A phase raised: convert to a Failed summary so nothing escapes to the
    /// transport layer.
    fn failed_outcome(
        &self,
        fault: PrismError,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> PipelineOutcome {
        error!(error = %fault, "pipeline failed");
        let code = match &fault {
            PrismError::Pipeline(PipelineFault::Timeout) => "TIMEOUT",
            _ => "PIPELINE_FAULT",
        };
        let errors = vec![PipelineError::new(
            Phase::Reporting,
            Severity::Critical,
            ErrorCategory::ApiError,
            code,
            "pipeline",
            fault.to_string(),
        )];

        let mut progress = ProgressEmitter::new(&self.events);
        match self.finalize(
            RunStatus::Failed,
            started_at,
            RunMonitor::start(),
            errors,
            SummaryMetrics::default(),
            Vec::new(),
            Vec::new(),
            &mut progress,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Reporting itself failed; fall back to a bare summary.
                error!(error = %e, "failed to assemble failure report");
                let summary = PipelineSummary {
                    success: false,
                    status: RunStatus::Failed,
                    metrics: SummaryMetrics::default(),
                    performance: Default::default(),
                    decomposition: Vec::new(),
                    enrichment: Default::default(),
                    hive_log: Default::default(),
                    unresolved: Vec::new(),
                    errors: Vec::new(),
                    timestamp: Utc::now(),
                };
                PipelineOutcome {
                    report: HealthReport {
                        timestamp: Utc::now(),
                        metrics: SummaryMetrics::default(),
                        performance: Default::default(),
                        decomposition: DecompositionSection { per_etf: vec![] },
                        enrichment: EnrichmentSection {
                            stats: Default::default(),
                            hive_log: Default::default(),
                        },
                        etf_stats: Vec::new(),
                        failures: Vec::new(),
                        data_quality: DataQuality::from_errors(&[]),
                    },
                    summary,
                    rows: Vec::new(),
                }
            }
        }
    }

    fn persist_breakdown(&self, decomposed: &[DecomposedEtf]) -> PrismResult<()> {
        let breakdown: Vec<(Isin, Isin, Decimal, Option<Decimal>, f64)> = decomposed
            .iter()
            .filter(|e| !e.is_passthrough())
            .flat_map(|etf| {
                etf.holdings.iter().filter_map(|h| {
                    let child = h.child_isin.clone()?;
                    Some((
                        h.parent_isin.clone(),
                        child,
                        h.weight,
                        h.shares,
                        h.confidence,
                    ))
                })
            })
            .collect();

        let mut store = self.store.lock().expect("positions store poisoned");
        store.replace_breakdown(&breakdown)
    }

    fn record_run(
        &self,
        outcome: &PipelineOutcome,
        grand_total: Decimal,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> PrismResult<()> {
        let mut store = self.store.lock().expect("positions store poisoned");
        store.record_run(&RunRecord {
            run_id: format!("run-{}", started_at.timestamp_millis()),
            started_at,
            finished_at: Utc::now(),
            status: outcome.summary.status,
            total_value: grand_total,
            summary_json: serde_json::to_string(&outcome.summary).unwrap_or_default(),
        })
    }
}

/// Keeps emitted percentages monotone within a run.
struct ProgressEmitter<'a> {
    events: &'a EventBus,
    high_water: f64,
    emitted: bool,
}

impl<'a> ProgressEmitter<'a> {
    fn new(events: &'a EventBus) -> Self {
        Self {
            events,
            high_water: 0.0,
            emitted: false,
        }
    }

    fn emit(&mut self, phase: Phase, message: String, percentage: f64) {
        let percentage = percentage.max(self.high_water);
        self.high_water = percentage;
        self.emitted = true;
        self.events
            .emit(EngineEvent::Progress(PipelineProgress::new(
                phase, message, percentage,
            )));
    }

    fn has_emitted(&self) -> bool {
        self.emitted
    }
}

fn unique_isins(direct: &[CanonicalPosition], decomposed: &[DecomposedEtf]) -> Vec<Isin> {
    let mut set = std::collections::BTreeSet::new();
    for p in direct {
        if let Some(isin) = &p.isin {
            set.insert(isin.clone());
        }
    }
    for etf in decomposed.iter().filter(|e| !e.is_passthrough()) {
        for h in &etf.holdings {
            if let Some(isin) = &h.child_isin {
                set.insert(isin.clone());
            }
        }
    }
    set.into_iter().collect()
}
