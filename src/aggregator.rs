use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use tracing::debug;

use crate::cache::AssetMeta;
use crate::decomposer::DecomposedEtf;
use crate::error::PrismResult;
use crate::model::{
    CanonicalPosition, ErrorCategory, ExposureParent, ExposureSource, Isin, Phase, PipelineError,
    Severity, TrueExposureRow,
};

/// Largest tolerated difference between the exposure grand total and the
/// input positions' market value.
pub const RECONCILIATION_TOLERANCE: &str = "0.01";

#[derive(Debug)]
pub struct AggregationOutcome {
    /// One row per canonical ISIN (or `UNRESOLVED:` key), largest first.
    pub rows: Vec<TrueExposureRow>,
    pub grand_total: Decimal,
    pub input_total: Decimal,
    pub reconciled: bool,
    pub errors: Vec<PipelineError>,
}

/// Folds direct positions and decomposed child holdings into the single
/// true-exposure table.
pub struct Aggregator;

impl Aggregator {
    /// `direct` must already include undecomposed ETF positions so the grand
    /// total reconciles even when a holdings source was missing.
    #[tracing::instrument(skip_all, fields(direct = direct.len(), etfs = decomposed.len()))]
    pub fn aggregate(
        direct: &[CanonicalPosition],
        decomposed: &[DecomposedEtf],
        metadata: &HashMap<Isin, AssetMeta>,
    ) -> PrismResult<AggregationOutcome> {
        let mut rows: BTreeMap<String, TrueExposureRow> = BTreeMap::new();

        for position in direct {
            let key = position.exposure_key();
            let entry = rows
                .entry(key.clone())
                .or_insert_with(|| empty_row(key, position.isin.clone(), &position.name));
            entry.total_value += position.market_value();
            entry.sources.push(ExposureSource {
                parent: ExposureParent::direct(),
                value: position.market_value(),
                weight: None,
            });
        }

        for etf in decomposed.iter().filter(|e| !e.is_passthrough()) {
            for holding in &etf.holdings {
                let entry = rows.entry(holding.key.clone()).or_insert_with(|| {
                    empty_row(holding.key.clone(), holding.child_isin.clone(), &holding.name)
                });
                entry.total_value += holding.value;
                entry.sources.push(ExposureSource {
                    parent: ExposureParent::Etf(holding.parent_isin.clone()),
                    value: holding.value,
                    weight: Some(holding.weight),
                });
            }
        }

        for row in rows.values_mut() {
            if let Some(isin) = &row.isin
                && let Some(meta) = metadata.get(isin)
            {
                row.sector = meta.sector.clone();
                row.geography = meta.geography.clone();
                row.currency = meta.currency.clone();
            }
        }

        let grand_total: Decimal = rows.values().map(|r| r.total_value).sum();
        let input_total = expected_total(direct, decomposed);
        let tolerance: Decimal = RECONCILIATION_TOLERANCE.parse().expect("constant parses");
        let drift = (grand_total - input_total).abs();
        let reconciled = drift <= tolerance;

        let mut errors = Vec::new();
        if !reconciled {
            errors.push(
                PipelineError::new(
                    Phase::Aggregating,
                    Severity::High,
                    ErrorCategory::InvariantViolation,
                    "EXPOSURE_TOTAL_MISMATCH",
                    "portfolio",
                    "exposure grand total does not reconcile with input positions",
                )
                .with_expected_actual(input_total.to_string(), grand_total.to_string()),
            );
        }

        let mut rows: Vec<TrueExposureRow> = rows.into_values().collect();
        rows.sort_by(|a, b| b.total_value.cmp(&a.total_value).then(a.key.cmp(&b.key)));

        debug!(rows = rows.len(), %grand_total, %input_total, reconciled, "aggregation complete");
        Ok(AggregationOutcome {
            rows,
            grand_total,
            input_total,
            reconciled,
            errors,
        })
    }
}

/// What the exposure table should sum to: every direct position at full
/// value, every decomposed ETF at its value scaled by the observed weight
/// sum (deviations there are already recorded separately).
fn expected_total(direct: &[CanonicalPosition], decomposed: &[DecomposedEtf]) -> Decimal {
    let direct_total: Decimal = direct.iter().map(|p| p.market_value()).sum();
    let decomposed_total: Decimal = decomposed
        .iter()
        .filter(|e| !e.is_passthrough())
        .map(|e| e.parent.market_value() * e.weight_sum)
        .sum();
    direct_total + decomposed_total
}

fn empty_row(key: String, isin: Option<Isin>, name: &str) -> TrueExposureRow {
    let resolved = !key.starts_with("UNRESOLVED:");
    TrueExposureRow {
        key,
        isin,
        name: name.to_string(),
        total_value: Decimal::ZERO,
        sources: Vec::new(),
        resolved,
        sector: None,
        geography: None,
        currency: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposer::ExpandedHolding;
    use crate::model::AssetClass;
    use chrono::Utc;

    const APPLE: &str = "US0378331005";
    const MSFT: &str = "US5949181045";
    const WORLD_ETF: &str = "IE00B4L5Y983";

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn position(isin: &str, name: &str, quantity: &str, unit_price: &str) -> CanonicalPosition {
        CanonicalPosition {
            isin: Some(isin.parse().unwrap()),
            symbol: None,
            name: name.into(),
            asset_class: AssetClass::Equity,
            quantity: dec(quantity),
            unit_price: dec(unit_price),
            currency: "EUR".into(),
            cost_basis: None,
            source_tag: "test".into(),
            as_of: Utc::now(),
        }
    }

    fn expanded(parent: &str, child: Option<&str>, key: &str, name: &str, weight: &str, value: &str) -> ExpandedHolding {
        ExpandedHolding {
            parent_isin: parent.parse().unwrap(),
            key: key.into(),
            child_isin: child.map(|c| c.parse().unwrap()),
            name: name.into(),
            weight: dec(weight),
            value: dec(value),
            shares: None,
            confidence: 0.95,
        }
    }

    fn decomposed_etf(parent: CanonicalPosition, holdings: Vec<ExpandedHolding>) -> DecomposedEtf {
        let weight_sum = holdings.iter().map(|h| h.weight).sum();
        DecomposedEtf {
            parent,
            source: Some(crate::model::HoldingsSource::Cached),
            holdings,
            weight_sum,
            status: "ok".into(),
            errors: Vec::new(),
            resolutions: Vec::new(),
            tier1_resolved: 0,
            tier1_failed: 0,
        }
    }

    #[test]
    fn direct_and_lookthrough_merge_on_isin() {
        // 10 AAPL held directly, plus AAPL inside the ETF.
        let direct = vec![position(APPLE, "Apple Inc", "10", "150")];
        let mut etf_pos = position(WORLD_ETF, "World ETF", "1", "100");
        etf_pos.asset_class = AssetClass::Etf;
        let etf = decomposed_etf(
            etf_pos,
            vec![
                expanded(WORLD_ETF, Some(APPLE), APPLE, "Apple Inc", "0.6", "60"),
                expanded(WORLD_ETF, Some(MSFT), MSFT, "Microsoft", "0.4", "40"),
            ],
        );

        let outcome = Aggregator::aggregate(&direct, &[etf], &HashMap::new()).unwrap();
        assert_eq!(outcome.rows.len(), 2);
        assert!(outcome.reconciled);
        assert_eq!(outcome.grand_total, dec("1600"));

        let apple = &outcome.rows[0];
        assert_eq!(apple.key, APPLE);
        assert_eq!(apple.total_value, dec("1560"));
        assert_eq!(apple.sources.len(), 2);
        assert!(apple.sources[0].parent.is_direct());
        assert_eq!(
            apple.sources[1].parent,
            ExposureParent::Etf(WORLD_ETF.parse().unwrap())
        );
    }

    #[test]
    fn unresolved_rows_are_marked_and_counted_in_total() {
        let mut etf_pos = position(WORLD_ETF, "World ETF", "1", "100");
        etf_pos.asset_class = AssetClass::Etf;
        let etf = decomposed_etf(
            etf_pos,
            vec![
                expanded(WORLD_ETF, Some(APPLE), APPLE, "Apple Inc", "0.9999", "99.99"),
                expanded(WORLD_ETF, None, "UNRESOLVED:ZZZZ", "", "0.0001", "0.01"),
            ],
        );

        let outcome = Aggregator::aggregate(&[], &[etf], &HashMap::new()).unwrap();
        assert!(outcome.reconciled);

        let unresolved = outcome
            .rows
            .iter()
            .find(|r| r.key == "UNRESOLVED:ZZZZ")
            .unwrap();
        assert!(!unresolved.resolved);
        assert!(unresolved.isin.is_none());
        assert_eq!(outcome.grand_total, dec("100.00"));
    }

    #[test]
    fn metadata_attaches_to_resolved_rows_only() {
        let direct = vec![position(APPLE, "Apple Inc", "1", "100")];
        let mut metadata = HashMap::new();
        metadata.insert(
            APPLE.parse::<Isin>().unwrap(),
            AssetMeta {
                sector: Some("Technology".into()),
                geography: Some("US".into()),
                currency: Some("USD".into()),
            },
        );

        let outcome = Aggregator::aggregate(&direct, &[], &metadata).unwrap();
        assert_eq!(outcome.rows[0].sector.as_deref(), Some("Technology"));
        assert_eq!(outcome.rows[0].geography.as_deref(), Some("US"));
    }

    #[test]
    fn tampered_totals_raise_invariant_violation() {
        let mut etf_pos = position(WORLD_ETF, "World ETF", "1", "100");
        etf_pos.asset_class = AssetClass::Etf;
        // Child value does not match weight x parent value.
        let etf = decomposed_etf(
            etf_pos,
            vec![expanded(WORLD_ETF, Some(APPLE), APPLE, "Apple", "1.0", "50")],
        );

        let outcome = Aggregator::aggregate(&[], &[etf], &HashMap::new()).unwrap();
        assert!(!outcome.reconciled);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].category, ErrorCategory::InvariantViolation);
        assert_eq!(outcome.errors[0].severity, Severity::High);
    }

    #[test]
    fn empty_portfolio_aggregates_to_nothing() {
        let outcome = Aggregator::aggregate(&[], &[], &HashMap::new()).unwrap();
        assert!(outcome.rows.is_empty());
        assert!(outcome.reconciled);
        assert_eq!(outcome.grand_total, Decimal::ZERO);
    }
}
