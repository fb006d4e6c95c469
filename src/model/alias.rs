use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::isin::Isin;

/// The shape of an alias string.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AliasType {
    Name,
    Ticker,
    Abbreviation,
    LocalName,
}

/// Where an identity fact originally came from. Carries the initial trust
/// assigned to facts from that source; corroboration is additive through
/// `contributor_count`, never through confidence inflation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum IdentitySource {
    Seed,
    #[strum(serialize = "openfigi")]
    OpenFigi,
    Wikidata,
    Finnhub,
    Yfinance,
    User,
}

impl IdentitySource {
    pub fn initial_confidence(self) -> f64 {
        match self {
            IdentitySource::Seed => 0.95,
            IdentitySource::OpenFigi => 0.85,
            IdentitySource::Wikidata => 0.80,
            IdentitySource::Finnhub => 0.75,
            IdentitySource::Yfinance => 0.70,
            IdentitySource::User => 0.70,
        }
    }
}

/// A community- or API-sourced mapping from an alias string to an ISIN.
///
/// Uniqueness is on `(UPPER(alias), isin)`; lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    pub alias: String,
    pub isin: Isin,
    pub alias_type: AliasType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub source: IdentitySource,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contributor_hash: Option<String>,
    pub contributor_count: u32,
}

impl Alias {
    pub fn new(
        alias: impl Into<String>,
        isin: Isin,
        alias_type: AliasType,
        source: IdentitySource,
    ) -> Self {
        Self {
            alias: alias.into(),
            isin,
            alias_type,
            language: None,
            source,
            confidence: source.initial_confidence(),
            currency: None,
            exchange: None,
            contributor_hash: None,
            contributor_count: 1,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_listing(mut self, currency: Option<String>, exchange: Option<String>) -> Self {
        self.currency = currency;
        self.exchange = exchange;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_trust_ladder_is_ordered() {
        let ladder = [
            IdentitySource::Seed,
            IdentitySource::OpenFigi,
            IdentitySource::Wikidata,
            IdentitySource::Finnhub,
            IdentitySource::Yfinance,
        ];
        for pair in ladder.windows(2) {
            assert!(pair[0].initial_confidence() > pair[1].initial_confidence());
        }
    }

    #[test]
    fn wire_names_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&IdentitySource::OpenFigi).unwrap(),
            "\"openfigi\""
        );
        assert_eq!(
            serde_json::to_string(&AliasType::LocalName).unwrap(),
            "\"local_name\""
        );
    }
}
