use std::fs;
use std::path::Path;

use tracing::info;

use crate::error::{IoError, PrismResult};
use crate::model::HealthReport;
use crate::model::report::{DecompositionSection, EnrichmentSection, EtfStatsRow};

/// Writes the health report via `tmp + rename` so a concurrent reader can
/// never observe a torn file.
pub fn write_atomic(path: &Path, report: &HealthReport) -> PrismResult<()> {
    let bytes = serde_json::to_vec_pretty(report).map_err(IoError::Json)?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &bytes).map_err(IoError::Io)?;
    crate::cache::restrict_permissions(&tmp);
    fs::rename(&tmp, path)
        .map_err(|e| IoError::ReportWrite(format!("rename into place failed: {e}")))?;

    info!(path = %path.display(), bytes = bytes.len(), "health report written");
    Ok(())
}

pub fn read(path: &Path) -> PrismResult<Option<HealthReport>> {
    match fs::read(path) {
        Ok(bytes) => {
            let report = serde_json::from_slice(&bytes).map_err(IoError::Json)?;
            Ok(Some(report))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(IoError::Io(e).into()),
    }
}

/// The compact per-ETF stats table, keyed by ticker where one is known.
pub fn etf_stats(
    per_etf: &[crate::model::EtfSourceRow],
    tickers: &std::collections::HashMap<crate::model::Isin, String>,
) -> Vec<EtfStatsRow> {
    per_etf
        .iter()
        .map(|row| EtfStatsRow {
            ticker: tickers
                .get(&row.isin)
                .cloned()
                .unwrap_or_else(|| row.isin.to_string()),
            holdings_count: row.holdings_count,
            weight_sum: row.weight_sum,
            status: row.status.clone(),
        })
        .collect()
}

pub fn sections(
    per_etf: Vec<crate::model::EtfSourceRow>,
    stats: crate::model::EnrichmentStats,
    hive_log: crate::model::HiveLog,
) -> (DecompositionSection, EnrichmentSection) {
    (
        DecompositionSection { per_etf },
        EnrichmentSection { stats, hive_log },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::report::DataQuality;
    use crate::model::{PerformanceStats, SummaryMetrics};
    use chrono::Utc;

    fn report() -> HealthReport {
        HealthReport {
            timestamp: Utc::now(),
            metrics: SummaryMetrics::default(),
            performance: PerformanceStats::default(),
            decomposition: DecompositionSection { per_etf: vec![] },
            enrichment: EnrichmentSection {
                stats: Default::default(),
                hive_log: Default::default(),
            },
            etf_stats: vec![],
            failures: vec![],
            data_quality: DataQuality::from_errors(&[]),
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline_health.json");

        let original = report();
        write_atomic(&path, &original).unwrap();
        let loaded = read(&path).unwrap().unwrap();
        assert_eq!(loaded.metrics, original.metrics);

        // No stray temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_report_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read(&dir.path().join("absent.json")).unwrap().is_none());
    }
}
