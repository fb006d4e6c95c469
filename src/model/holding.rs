use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::isin::Isin;

/// One row inside an ETF's composition.
///
/// At least one of `child_isin`, `child_ticker`, `child_name` must identify
/// the constituent; [`Holding::has_identity`] checks that. Per-ETF weight sums
/// are allowed to drift inside [`WEIGHT_SUM_MIN`], [`WEIGHT_SUM_MAX`];
/// deviations are recorded by the decomposer, never silently corrected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub parent_isin: Isin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_isin: Option<Isin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_ticker: Option<String>,
    pub child_name: String,
    /// Fraction of the parent in `[0, 1]`.
    pub weight: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<Decimal>,
    /// Trust in this row as supplied by its source, in `[0, 1]`.
    pub confidence: f64,
    pub as_of: DateTime<Utc>,
}

/// Tolerated band for the sum of weights across an ETF's rows.
pub const WEIGHT_SUM_MIN: &str = "0.95";
pub const WEIGHT_SUM_MAX: &str = "1.05";

impl Holding {
    pub fn has_identity(&self) -> bool {
        self.child_isin.is_some()
            || self.child_ticker.as_deref().is_some_and(|t| !t.is_empty())
            || !self.child_name.is_empty()
    }

    pub fn weight_sum_bounds() -> (Decimal, Decimal) {
        (
            WEIGHT_SUM_MIN.parse().expect("constant parses"),
            WEIGHT_SUM_MAX.parse().expect("constant parses"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holding() -> Holding {
        Holding {
            parent_isin: "IE00B4L5Y983".parse().unwrap(),
            child_isin: None,
            child_ticker: None,
            child_name: String::new(),
            weight: Decimal::new(6, 1),
            shares: None,
            confidence: 0.9,
            as_of: Utc::now(),
        }
    }

    #[test]
    fn identity_requires_at_least_one_field() {
        let mut h = holding();
        assert!(!h.has_identity());

        h.child_ticker = Some("AAPL".into());
        assert!(h.has_identity());

        h.child_ticker = Some(String::new());
        assert!(!h.has_identity());

        h.child_name = "Apple Inc".into();
        assert!(h.has_identity());
    }
}
