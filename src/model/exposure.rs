use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::isin::Isin;

/// Which vehicle contributed a slice of exposure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExposureParent {
    /// Held outright; serialized as the literal string `"DIRECT"`.
    Direct(DirectTag),
    Etf(Isin),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectTag {
    #[serde(rename = "DIRECT")]
    Direct,
}

impl ExposureParent {
    pub fn direct() -> Self {
        ExposureParent::Direct(DirectTag::Direct)
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, ExposureParent::Direct(_))
    }
}

/// One vehicle's contribution to a row of the exposure table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureSource {
    pub parent: ExposureParent,
    pub value: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<Decimal>,
}

/// One row of the true-exposure table: everything the portfolio ultimately
/// owns of a single underlying security, across all vehicles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrueExposureRow {
    /// The canonical ISIN, or `UNRESOLVED:{ticker|name}` for rows the
    /// resolver could not identify.
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isin: Option<Isin>,
    pub name: String,
    pub total_value: Decimal,
    pub sources: Vec<ExposureSource>,
    /// Unresolved rows are excluded from sector/geography breakdowns but
    /// included in the grand total.
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geography: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_parent_serializes_as_literal() {
        let source = ExposureSource {
            parent: ExposureParent::direct(),
            value: Decimal::new(1500, 2),
            weight: None,
        };
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["parent"], "DIRECT");
    }

    #[test]
    fn etf_parent_serializes_as_isin() {
        let source = ExposureSource {
            parent: ExposureParent::Etf("IE00B4L5Y983".parse().unwrap()),
            value: Decimal::new(6000, 2),
            weight: Some(Decimal::new(6, 1)),
        };
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["parent"], "IE00B4L5Y983");
    }
}
