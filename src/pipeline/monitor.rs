use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use crate::enricher::EnrichmentResult;
use crate::model::{
    EnrichmentStats, EtfSourceRow, HiveLog, Isin, PerformanceStats, Phase, PhaseDurations,
    ResolutionResult, ResolutionSource,
};

/// Run-scoped provenance accounting.
///
/// Every statistic is an ISIN *set*, never a counter, so re-resolving the
/// same security cannot inflate anything. A hit always wins over a miss for
/// the same ISIN, keeping the two sets disjoint.
#[derive(Debug)]
pub struct RunMonitor {
    hive_hits: BTreeSet<Isin>,
    hive_misses: BTreeSet<Isin>,
    api_calls: BTreeSet<Isin>,
    contributions: BTreeSet<Isin>,
    pub per_etf: Vec<EtfSourceRow>,
    /// Known tickers per ETF, for the compact stats table.
    pub tickers: HashMap<Isin, String>,
    pub phase_durations: PhaseDurations,
    started: Instant,
}

impl RunMonitor {
    pub fn start() -> Self {
        Self {
            hive_hits: BTreeSet::new(),
            hive_misses: BTreeSet::new(),
            api_calls: BTreeSet::new(),
            contributions: BTreeSet::new(),
            per_etf: Vec::new(),
            tickers: HashMap::new(),
            phase_durations: PhaseDurations::default(),
            started: Instant::now(),
        }
    }

    pub fn record_hive_hit(&mut self, isin: &Isin) {
        self.hive_misses.remove(isin);
        self.hive_hits.insert(isin.clone());
    }

    pub fn record_hive_miss(&mut self, isin: &Isin) {
        if !self.hive_hits.contains(isin) {
            self.hive_misses.insert(isin.clone());
        }
    }

    pub fn record_api_call(&mut self, isin: &Isin) {
        self.api_calls.insert(isin.clone());
    }

    pub fn record_contribution(&mut self, isin: &Isin) {
        self.contributions.insert(isin.clone());
    }

    /// Books one resolver outcome: where the answer came from, and whether
    /// the Hive had to be bypassed for it.
    pub fn record_resolution(&mut self, resolution: &ResolutionResult) {
        let Some(isin) = &resolution.isin else { return };
        match resolution.source {
            Some(ResolutionSource::Hive) => self.record_hive_hit(isin),
            Some(source) if source.is_external_api() => {
                self.record_api_call(isin);
                self.record_hive_miss(isin);
            }
            _ => {}
        }
        if resolution.contributed {
            self.record_contribution(isin);
        }
    }

    pub fn absorb_enrichment(&mut self, enrichment: &EnrichmentResult) {
        for isin in &enrichment.hits {
            self.record_hive_hit(isin);
        }
        for isin in &enrichment.misses {
            self.record_hive_miss(isin);
        }
        for isin in &enrichment.contributions {
            self.record_contribution(isin);
        }
    }

    pub fn record_etf(&mut self, row: EtfSourceRow) {
        self.per_etf.push(row);
    }

    pub fn set_phase_duration(&mut self, phase: Phase, seconds: f64) {
        self.phase_durations.set(phase, seconds);
    }

    pub fn hive_hit_rate(&self) -> f64 {
        let total = self.hive_hits.len() + self.hive_misses.len();
        if total == 0 {
            0.0
        } else {
            self.hive_hits.len() as f64 / total as f64
        }
    }

    pub fn api_fallback_rate(&self, total_assets: usize) -> f64 {
        if total_assets == 0 {
            0.0
        } else {
            self.api_calls.len() as f64 / total_assets as f64
        }
    }

    pub fn enrichment_stats(&self) -> EnrichmentStats {
        EnrichmentStats {
            hive_hits: self.hive_hits.len(),
            hive_misses: self.hive_misses.len(),
            api_calls: self.api_calls.len(),
            new_contributions: self.contributions.len(),
        }
    }

    pub fn hive_log(&self) -> HiveLog {
        HiveLog {
            contributions: self.contributions.iter().cloned().collect(),
            hits: self.hive_hits.iter().cloned().collect(),
        }
    }

    pub fn performance(&self, total_assets: usize) -> PerformanceStats {
        PerformanceStats {
            execution_time_seconds: self.started.elapsed().as_secs_f64(),
            hive_hit_rate: self.hive_hit_rate(),
            api_fallback_rate: self.api_fallback_rate(total_assets),
            total_assets_processed: total_assets,
            phase_durations: self.phase_durations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResolutionResult;

    fn isin(raw: &str) -> Isin {
        raw.parse().unwrap()
    }

    #[test]
    fn hit_and_miss_sets_stay_disjoint() {
        let mut m = RunMonitor::start();
        let apple = isin("US0378331005");

        m.record_hive_miss(&apple);
        m.record_hive_hit(&apple);
        m.record_hive_miss(&apple);

        let stats = m.enrichment_stats();
        assert_eq!(stats.hive_hits, 1);
        assert_eq!(stats.hive_misses, 0, "a hit permanently outranks a miss");
    }

    #[test]
    fn duplicate_resolutions_never_inflate() {
        let mut m = RunMonitor::start();
        let result = ResolutionResult::resolved(
            isin("US0378331005"),
            ResolutionSource::Hive,
            0.8,
        );
        m.record_resolution(&result);
        m.record_resolution(&result);
        m.record_resolution(&result);

        assert_eq!(m.enrichment_stats().hive_hits, 1);
        assert!((m.hive_hit_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn api_resolution_counts_as_hive_miss() {
        let mut m = RunMonitor::start();
        let mut result = ResolutionResult::resolved(
            isin("US67066G1040"),
            ResolutionSource::OpenFigi,
            0.85,
        );
        result.contributed = true;
        m.record_resolution(&result);

        let stats = m.enrichment_stats();
        assert_eq!(stats.api_calls, 1);
        assert_eq!(stats.hive_misses, 1);
        assert_eq!(stats.new_contributions, 1);
        assert_eq!(m.hive_hit_rate(), 0.0);
    }
}
