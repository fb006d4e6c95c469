pub mod alias;
pub mod events;
pub mod exposure;
pub mod holding;
pub mod isin;
pub mod position;
pub mod report;
pub mod resolution;

pub use alias::{Alias, AliasType, IdentitySource};
pub use events::{
    EngineEvent, EtfSourceRow, HiveLog, HoldingsSource, PerformanceStats, Phase, PhaseDurations,
    PipelineProgress, PipelineSummary, RunStatus, SummaryMetrics,
};
pub use exposure::{ExposureParent, ExposureSource, TrueExposureRow};
pub use holding::Holding;
pub use isin::Isin;
pub use position::{AssetClass, CanonicalPosition};
pub use report::{
    DataQuality, DataQualityIssue, EnrichmentStats, ErrorCategory, HealthReport, PipelineError,
    Severity,
};
pub use resolution::{ResolutionDetail, ResolutionResult, ResolutionSource, ResolutionStatus};
