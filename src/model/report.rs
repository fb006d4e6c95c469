use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::events::{
    EtfSourceRow, HiveLog, PerformanceStats, Phase, SummaryMetrics,
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Penalty applied to the quality score, on a 0–100 scale.
    pub fn penalty(self) -> f64 {
        match self {
            Severity::Critical => 25.0,
            Severity::High => 10.0,
            Severity::Medium => 3.0,
            Severity::Low => 1.0,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ApiError,
    AdapterError,
    SchemaError,
    DataCorruption,
    ResolutionError,
    MissingSource,
    InvariantViolation,
}

/// A run-scoped diagnostic. Always a value, always serializable, never raised
/// across a phase boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineError {
    pub phase: Phase,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub code: String,
    /// The affected item, usually an ISIN or alias.
    pub item: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl PipelineError {
    pub fn new(
        phase: Phase,
        severity: Severity,
        category: ErrorCategory,
        code: impl Into<String>,
        item: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            phase,
            severity,
            category,
            code: code.into(),
            item: item.into(),
            message: message.into(),
            fix_hint: None,
            expected: None,
            actual: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    pub fn with_expected_actual(
        mut self,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }
}

/// Set-cardinality statistics from the enrichment phase. Each count is the
/// size of an ISIN set, so the same security can never inflate a statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnrichmentStats {
    pub hive_hits: usize,
    pub hive_misses: usize,
    pub api_calls: usize,
    pub new_contributions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityIssue {
    pub severity: Severity,
    pub category: ErrorCategory,
    pub item: String,
    pub message: String,
}

impl From<&PipelineError> for DataQualityIssue {
    fn from(err: &PipelineError) -> Self {
        Self {
            severity: err.severity,
            category: err.category,
            item: err.item.clone(),
            message: err.message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQuality {
    pub quality_score: f64,
    pub is_trustworthy: bool,
    pub total_issues: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub issues: Vec<DataQualityIssue>,
}

impl DataQuality {
    pub const TRUST_FLOOR: f64 = 0.70;

    /// Aggregates run diagnostics into a single score on `[0, 1]`.
    pub fn from_errors(errors: &[PipelineError]) -> Self {
        let mut by_severity = BTreeMap::new();
        let mut by_category = BTreeMap::new();
        let mut penalty = 0.0;
        for err in errors {
            *by_severity.entry(err.severity).or_insert(0) += 1;
            *by_category.entry(err.category).or_insert(0) += 1;
            penalty += err.severity.penalty();
        }
        let quality_score = ((100.0 - penalty) / 100.0).clamp(0.0, 1.0);
        Self {
            quality_score,
            is_trustworthy: quality_score >= Self::TRUST_FLOOR,
            total_issues: errors.len(),
            by_severity,
            by_category,
            issues: errors.iter().map(DataQualityIssue::from).collect(),
        }
    }

    pub fn mark_untrustworthy(&mut self) {
        self.is_trustworthy = false;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionSection {
    pub per_etf: Vec<EtfSourceRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentSection {
    pub stats: EnrichmentStats,
    pub hive_log: HiveLog,
}

/// Per-ETF row keyed by ticker for the compact stats table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtfStatsRow {
    pub ticker: String,
    pub holdings_count: usize,
    pub weight_sum: rust_decimal::Decimal,
    pub status: String,
}

/// The persisted `pipeline_health.json` document. Written atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub metrics: SummaryMetrics,
    pub performance: PerformanceStats,
    pub decomposition: DecompositionSection,
    pub enrichment: EnrichmentSection,
    pub etf_stats: Vec<EtfStatsRow>,
    pub failures: Vec<PipelineError>,
    pub data_quality: DataQuality,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(severity: Severity) -> PipelineError {
        PipelineError::new(
            Phase::Decomposing,
            severity,
            ErrorCategory::AdapterError,
            "X",
            "IE00B4L5Y983",
            "boom",
        )
    }

    #[test]
    fn empty_run_scores_perfect() {
        let q = DataQuality::from_errors(&[]);
        assert_eq!(q.quality_score, 1.0);
        assert!(q.is_trustworthy);
        assert_eq!(q.total_issues, 0);
    }

    #[test]
    fn penalties_accumulate_and_clamp() {
        let errors = vec![error(Severity::Critical), error(Severity::High)];
        let q = DataQuality::from_errors(&errors);
        assert!((q.quality_score - 0.65).abs() < 1e-9);
        assert!(!q.is_trustworthy);

        let many: Vec<_> = (0..10).map(|_| error(Severity::Critical)).collect();
        let floor = DataQuality::from_errors(&many);
        assert_eq!(floor.quality_score, 0.0);
    }

    #[test]
    fn trust_boundary_is_inclusive() {
        // Exactly one critical plus one medium: 1.0 - 0.28 = 0.72.
        let errors = vec![error(Severity::Critical), error(Severity::Medium)];
        let q = DataQuality::from_errors(&errors);
        assert!(q.is_trustworthy);

        // Three highs land exactly on 0.70.
        let edge: Vec<_> = (0..3).map(|_| error(Severity::High)).collect();
        let q = DataQuality::from_errors(&edge);
        assert!((q.quality_score - 0.70).abs() < 1e-9);
        assert!(q.is_trustworthy);
    }
}
