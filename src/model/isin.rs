use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ResolveError;

/// A syntactically validated International Securities Identification Number.
///
/// Twelve alphanumeric characters with a numeric final digit. Validation here
/// is purely syntactic; whether the identifier denotes a real security is the
/// resolver's business.
///
/// # Examples
///
/// ```
/// # use prism_engine::model::Isin;
/// let isin: Isin = "US0378331005".parse().unwrap();
/// assert_eq!(isin.as_str(), "US0378331005");
/// assert!("not-an-isin".parse::<Isin>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Isin(String);

impl Isin {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Syntactic validity check without constructing.
    pub fn is_valid(raw: &str) -> bool {
        raw.len() == 12
            && raw.bytes().all(|b| b.is_ascii_alphanumeric())
            && raw.as_bytes()[11].is_ascii_digit()
    }
}

impl FromStr for Isin {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let candidate = s.trim().to_ascii_uppercase();
        if Isin::is_valid(&candidate) {
            Ok(Isin(candidate))
        } else {
            Err(ResolveError::InvalidInput(format!(
                "'{s}' is not a valid ISIN"
            )))
        }
    }
}

impl TryFrom<String> for Isin {
    type Error = ResolveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Isin> for String {
    fn from(value: Isin) -> Self {
        value.0
    }
}

impl fmt::Display for Isin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_isins() {
        for raw in ["US0378331005", "IE00B4L5Y983", "DE0007164600", "US5949181045"] {
            assert!(raw.parse::<Isin>().is_ok(), "{raw} should parse");
        }
    }

    #[test]
    fn lowercases_are_normalized() {
        let isin: Isin = "us0378331005".parse().unwrap();
        assert_eq!(isin.as_str(), "US0378331005");
    }

    #[test]
    fn rejects_bad_shapes() {
        for raw in ["", "US037833100", "US03783310051", "US037833100X", "US03783!1005"] {
            assert!(raw.parse::<Isin>().is_err(), "{raw} should be rejected");
        }
    }
}
