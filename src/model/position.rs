use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::isin::Isin;

/// Broad instrument classification carried on every canonical position.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
pub enum AssetClass {
    Equity,
    #[strum(serialize = "ETF")]
    #[serde(rename = "ETF")]
    Etf,
    Bond,
    Cash,
    Crypto,
}

/// A normalized broker position.
///
/// The total value is never stored; it is always derived from quantity and
/// per-unit price so the two can never drift apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPosition {
    /// Canonical identifier, when known. Positions without one travel through
    /// the pipeline and surface as clearly marked unresolved exposure.
    pub isin: Option<Isin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub name: String,
    pub asset_class: AssetClass,
    /// Non-negative; fractional units allowed.
    pub quantity: Decimal,
    /// Per-unit price in `currency`. Never a precomputed total.
    pub unit_price: Decimal,
    /// ISO 4217 code.
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_basis: Option<Decimal>,
    /// Opaque tag naming the adapter that produced this row.
    pub source_tag: String,
    pub as_of: DateTime<Utc>,
}

impl CanonicalPosition {
    /// Derived total value. The storage schema enforces the same derivation
    /// through a generated column.
    pub fn market_value(&self) -> Decimal {
        self.quantity * self.unit_price
    }

    pub fn is_etf(&self) -> bool {
        self.asset_class == AssetClass::Etf
    }

    /// Aggregation key: the ISIN, or a marked synthetic key for positions the
    /// resolver could not identify.
    pub fn exposure_key(&self) -> String {
        match &self.isin {
            Some(isin) => isin.to_string(),
            None => {
                let fallback = self.symbol.as_deref().unwrap_or(&self.name);
                format!("UNRESOLVED:{fallback}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn position(quantity: &str, unit_price: &str) -> CanonicalPosition {
        CanonicalPosition {
            isin: Some("US0378331005".parse().unwrap()),
            symbol: Some("AAPL".into()),
            name: "Apple Inc".into(),
            asset_class: AssetClass::Equity,
            quantity: dec(quantity),
            unit_price: dec(unit_price),
            currency: "USD".into(),
            cost_basis: None,
            source_tag: "test".into(),
            as_of: Utc::now(),
        }
    }

    #[test]
    fn market_value_is_exact_product() {
        let p = position("10", "150.00");
        assert_eq!(p.market_value(), dec("1500.00"));

        let fractional = position("0.375", "201.12");
        assert_eq!(fractional.market_value(), dec("75.42"));
    }

    #[test]
    fn exposure_key_prefers_isin_then_symbol() {
        let p = position("1", "1");
        assert_eq!(p.exposure_key(), "US0378331005");

        let mut unresolved = position("1", "1");
        unresolved.isin = None;
        assert_eq!(unresolved.exposure_key(), "UNRESOLVED:AAPL");

        unresolved.symbol = None;
        assert_eq!(unresolved.exposure_key(), "UNRESOLVED:Apple Inc");
    }

    #[test]
    fn asset_class_wire_names() {
        assert_eq!(serde_json::to_string(&AssetClass::Etf).unwrap(), "\"ETF\"");
        assert_eq!(
            serde_json::to_string(&AssetClass::Equity).unwrap(),
            "\"Equity\""
        );
    }
}
