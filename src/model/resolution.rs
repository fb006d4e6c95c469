use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::alias::IdentitySource;
use super::isin::Isin;
use super::report::PipelineError;

/// A result is only "resolved" above this confidence.
pub const RESOLVED_CONFIDENCE_FLOOR: f64 = 0.50;

/// Which rung of the cascade produced an answer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ResolutionSource {
    /// A syntactically valid ISIN was already present on the input.
    Direct,
    Cache,
    Hive,
    #[strum(serialize = "openfigi")]
    OpenFigi,
    Wikidata,
    Finnhub,
    Yfinance,
}

impl From<IdentitySource> for ResolutionSource {
    fn from(value: IdentitySource) -> Self {
        match value {
            IdentitySource::OpenFigi => ResolutionSource::OpenFigi,
            IdentitySource::Wikidata => ResolutionSource::Wikidata,
            IdentitySource::Finnhub => ResolutionSource::Finnhub,
            IdentitySource::Yfinance => ResolutionSource::Yfinance,
            // Seed/user facts only ever reach callers through the cache.
            IdentitySource::Seed | IdentitySource::User => ResolutionSource::Cache,
        }
    }
}

impl ResolutionSource {
    pub fn is_external_api(self) -> bool {
        matches!(
            self,
            ResolutionSource::OpenFigi
                | ResolutionSource::Wikidata
                | ResolutionSource::Finnhub
                | ResolutionSource::Yfinance
        )
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved,
    Unresolved,
    SkippedTier2,
}

/// Machine-readable reason attached to non-resolved outcomes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResolutionDetail {
    InvalidInput,
    NegativeCache,
    Exhausted,
}

/// Outcome of one resolver call, with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isin: Option<Isin>,
    pub status: ResolutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ResolutionSource>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<ResolutionDetail>,
    pub negative_cache_hit: bool,
    /// Set when this call wrote a new fact back to the Hive. Internal
    /// bookkeeping for the provenance monitor, not part of the wire shape.
    #[serde(skip)]
    pub contributed: bool,
    /// Hive/API failures encountered along the cascade. The caller drains
    /// these into the run's error buffer; a failed rung never aborts the
    /// cascade itself. Not part of the wire shape.
    #[serde(skip)]
    pub transient_errors: Vec<PipelineError>,
}

impl ResolutionResult {
    pub fn resolved(isin: Isin, source: ResolutionSource, confidence: f64) -> Self {
        Self {
            isin: Some(isin),
            status: ResolutionStatus::Resolved,
            source: Some(source),
            confidence,
            detail: None,
            negative_cache_hit: false,
            contributed: false,
            transient_errors: Vec::new(),
        }
    }

    pub fn unresolved(detail: ResolutionDetail) -> Self {
        Self {
            isin: None,
            status: ResolutionStatus::Unresolved,
            source: None,
            confidence: 0.0,
            detail: Some(detail),
            negative_cache_hit: matches!(detail, ResolutionDetail::NegativeCache),
            contributed: false,
            transient_errors: Vec::new(),
        }
    }

    pub fn skipped_tier2() -> Self {
        Self {
            isin: None,
            status: ResolutionStatus::SkippedTier2,
            source: None,
            confidence: 0.0,
            detail: None,
            negative_cache_hit: false,
            contributed: false,
            transient_errors: Vec::new(),
        }
    }

    pub fn with_transient_errors(mut self, errors: Vec<PipelineError>) -> Self {
        self.transient_errors = errors;
        self
    }

    /// Resolved means: a syntactically valid ISIN is present and confidence
    /// clears the floor.
    pub fn is_resolved(&self) -> bool {
        self.status == ResolutionStatus::Resolved
            && self.isin.is_some()
            && self.confidence >= RESOLVED_CONFIDENCE_FLOOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_requires_confidence_floor() {
        let isin: Isin = "US0378331005".parse().unwrap();
        let strong = ResolutionResult::resolved(isin.clone(), ResolutionSource::Hive, 0.75);
        assert!(strong.is_resolved());

        let weak = ResolutionResult::resolved(isin, ResolutionSource::Yfinance, 0.40);
        assert!(!weak.is_resolved());
    }

    #[test]
    fn negative_cache_detail_sets_flag() {
        let miss = ResolutionResult::unresolved(ResolutionDetail::NegativeCache);
        assert!(miss.negative_cache_hit);
        assert_eq!(miss.detail, Some(ResolutionDetail::NegativeCache));

        let exhausted = ResolutionResult::unresolved(ResolutionDetail::Exhausted);
        assert!(!exhausted.negative_cache_hit);
    }
}
