use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::isin::Isin;
use super::report::{EnrichmentStats, PipelineError};

/// Pipeline phases, in their fixed execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Loading,
    Decomposing,
    Enriching,
    Aggregating,
    Reporting,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Loading,
        Phase::Decomposing,
        Phase::Enriching,
        Phase::Aggregating,
        Phase::Reporting,
    ];
}

/// Terminal disposition of a pipeline run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed,
}

/// One progress tick on the event channel. Percentages are monotone
/// non-decreasing within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineProgress {
    pub phase: Phase,
    pub message: String,
    pub percentage: f64,
    pub timestamp: DateTime<Utc>,
}

impl PipelineProgress {
    pub fn new(phase: Phase, message: impl Into<String>, percentage: f64) -> Self {
        Self {
            phase,
            message: message.into(),
            percentage: percentage.clamp(0.0, 100.0),
            timestamp: Utc::now(),
        }
    }
}

/// Which source actually served an ETF's composition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HoldingsSource {
    Cached,
    Hive,
    Adapter(String),
}

impl fmt::Display for HoldingsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldingsSource::Cached => f.write_str("cached"),
            HoldingsSource::Hive => f.write_str("hive"),
            HoldingsSource::Adapter(tag) => write!(f, "{tag}_adapter"),
        }
    }
}

impl Serialize for HoldingsSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HoldingsSource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "cached" => HoldingsSource::Cached,
            "hive" => HoldingsSource::Hive,
            other => match other.strip_suffix("_adapter") {
                Some(tag) => HoldingsSource::Adapter(tag.to_string()),
                None => HoldingsSource::Adapter(other.to_string()),
            },
        })
    }
}

/// Per-ETF provenance row in the summary and health report. `source` is
/// absent when no holdings source could serve the ETF at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtfSourceRow {
    pub isin: Isin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<HoldingsSource>,
    pub holdings_count: usize,
    pub weight_sum: Decimal,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SummaryMetrics {
    pub direct_holdings: usize,
    pub etf_positions: usize,
    pub etfs_processed: usize,
    pub tier1_resolved: usize,
    pub tier1_failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PhaseDurations {
    pub loading: f64,
    pub decomposing: f64,
    pub enriching: f64,
    pub aggregating: f64,
    pub reporting: f64,
}

impl PhaseDurations {
    pub fn set(&mut self, phase: Phase, seconds: f64) {
        match phase {
            Phase::Loading => self.loading = seconds,
            Phase::Decomposing => self.decomposing = seconds,
            Phase::Enriching => self.enriching = seconds,
            Phase::Aggregating => self.aggregating = seconds,
            Phase::Reporting => self.reporting = seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub execution_time_seconds: f64,
    pub hive_hit_rate: f64,
    pub api_fallback_rate: f64,
    pub total_assets_processed: usize,
    pub phase_durations: PhaseDurations,
}

/// Raw ISIN lists backing the set-cardinality statistics.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HiveLog {
    pub contributions: Vec<Isin>,
    pub hits: Vec<Isin>,
}

/// Emitted exactly once at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub success: bool,
    pub status: RunStatus,
    pub metrics: SummaryMetrics,
    pub performance: PerformanceStats,
    /// Per-ETF source table, indexed by ETF ISIN order of the input.
    pub decomposition: Vec<EtfSourceRow>,
    pub enrichment: EnrichmentStats,
    pub hive_log: HiveLog,
    /// Capped at 100 entries; tier-2 skips are excluded to keep the list
    /// readable.
    pub unresolved: Vec<String>,
    pub errors: Vec<PipelineError>,
    pub timestamp: DateTime<Utc>,
}

/// Everything the event channels can carry. The SSE layer maps the variant to
/// the `event:` name and the payload to the `data:` body.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Progress(PipelineProgress),
    Summary(Box<PipelineSummary>),
    Heartbeat { timestamp: DateTime<Utc> },
}

impl EngineEvent {
    pub fn heartbeat() -> Self {
        EngineEvent::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    pub fn sse_name(&self) -> &'static str {
        match self {
            EngineEvent::Progress(_) => "pipeline_progress",
            EngineEvent::Summary(_) => "pipeline_summary",
            EngineEvent::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            EngineEvent::Progress(p) => serde_json::to_value(p).unwrap_or_default(),
            EngineEvent::Summary(s) => serde_json::to_value(s).unwrap_or_default(),
            EngineEvent::Heartbeat { timestamp } => serde_json::json!({ "timestamp": timestamp }),
        }
    }

    /// Summary events must survive queue pressure; progress may coalesce.
    pub fn is_droppable(&self) -> bool {
        matches!(self, EngineEvent::Progress(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holdings_source_round_trips_wire_strings() {
        for (source, wire) in [
            (HoldingsSource::Cached, "\"cached\""),
            (HoldingsSource::Hive, "\"hive\""),
            (HoldingsSource::Adapter("ishares".into()), "\"ishares_adapter\""),
        ] {
            let json = serde_json::to_string(&source).unwrap();
            assert_eq!(json, wire);
            let back: HoldingsSource = serde_json::from_str(&json).unwrap();
            assert_eq!(back, source);
        }
    }

    #[test]
    fn progress_clamps_percentage() {
        let p = PipelineProgress::new(Phase::Loading, "x", 140.0);
        assert_eq!(p.percentage, 100.0);
    }

    #[test]
    fn sse_names_match_channel_contract() {
        let hb = EngineEvent::heartbeat();
        assert_eq!(hb.sse_name(), "heartbeat");
        assert!(!hb.is_droppable());

        let progress = EngineEvent::Progress(PipelineProgress::new(Phase::Reporting, "x", 99.0));
        assert_eq!(progress.sse_name(), "pipeline_progress");
        assert!(progress.is_droppable());
    }
}
