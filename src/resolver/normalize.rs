use std::sync::LazyLock;

use regex::Regex;

static TICKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9.\-]{1,20}$").expect("ticker regex"));

static NON_ALNUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Z0-9 ]+").expect("alnum regex"));

static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("spaces regex"));

/// Corporate suffixes stripped from the tail of normalized names.
const CORPORATE_SUFFIXES: &[&str] = &[
    "INC", "CORP", "CORPORATION", "LTD", "LIMITED", "PLC", "SA", "NV", "AG", "SE", "CO",
    "COMPANY", "HOLDING", "HOLDINGS", "GROUP",
];

/// Characters that would let an alias smuggle SQL into a lookup.
const SQL_META: &[char] = &[';', '\'', '"', '\\', '%'];

/// Upper-cases and validates a ticker. `None` means the input cannot be a
/// ticker at all.
pub fn validate_ticker(raw: &str) -> Option<String> {
    let candidate = raw.trim().to_ascii_uppercase();
    TICKER_RE.is_match(&candidate).then_some(candidate)
}

/// Validates a display name: 1–200 characters and no SQL metacharacters.
pub fn validate_name(raw: &str) -> Option<String> {
    let candidate = raw.trim();
    if candidate.is_empty() || candidate.chars().count() > 200 {
        return None;
    }
    if candidate.chars().any(|c| SQL_META.contains(&c)) {
        return None;
    }
    Some(candidate.to_string())
}

/// Canonical alias form of a company name: upper-cased, punctuation
/// stripped, trailing corporate suffixes removed.
///
/// # Examples
///
/// ```
/// # use prism_engine::resolver::normalize::normalize_name;
/// assert_eq!(normalize_name("Apple Inc."), "APPLE");
/// assert_eq!(normalize_name("Siemens AG"), "SIEMENS");
/// ```
pub fn normalize_name(name: &str) -> String {
    // Periods vanish (so "N.V." becomes "NV"); other punctuation splits.
    let upper = name.to_uppercase().replace('.', "");
    let stripped = NON_ALNUM_RE.replace_all(&upper, " ");
    let collapsed = SPACES_RE.replace_all(stripped.trim(), " ").to_string();

    let mut tokens: Vec<&str> = collapsed.split(' ').collect();
    while tokens.len() > 1
        && CORPORATE_SUFFIXES.contains(tokens.last().expect("non-empty tokens"))
    {
        tokens.pop();
    }
    tokens.join(" ")
}

/// Ticker variants to try, in order: the exchange-suffixed original first,
/// then the bare symbol.
pub fn ticker_variants(ticker: &str) -> Vec<String> {
    let mut variants = vec![ticker.to_string()];
    if let Some((bare, _suffix)) = ticker.split_once('.')
        && !bare.is_empty()
        && !variants.contains(&bare.to_string())
    {
        variants.push(bare.to_string());
    }
    variants
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_validation_normalizes_case_and_shape() {
        assert_eq!(validate_ticker(" aapl "), Some("AAPL".into()));
        assert_eq!(validate_ticker("VOD.L"), Some("VOD.L".into()));
        assert_eq!(validate_ticker("BRK-B"), Some("BRK-B".into()));
        assert_eq!(validate_ticker(""), None);
        assert_eq!(validate_ticker("WAY TOO LONG FOR A TICKER"), None);
        assert_eq!(validate_ticker("bad$char"), None);
    }

    #[test]
    fn name_validation_rejects_sql_metacharacters() {
        assert!(validate_name("Apple Inc").is_some());
        assert!(validate_name("Robert'); DROP TABLE aliases;--").is_none());
        assert!(validate_name("").is_none());
        assert!(validate_name(&"x".repeat(201)).is_none());
    }

    #[test]
    fn name_normalization_strips_suffixes_and_punctuation() {
        assert_eq!(normalize_name("Apple Inc."), "APPLE");
        assert_eq!(normalize_name("Microsoft Corporation"), "MICROSOFT");
        assert_eq!(normalize_name("ASML Holding N.V."), "ASML");
        assert_eq!(normalize_name("Koninklijke Philips N.V."), "KONINKLIJKE PHILIPS");
        assert_eq!(normalize_name("AT&T Inc."), "AT T");
    }

    #[test]
    fn suffix_stripping_never_empties_the_name() {
        assert_eq!(normalize_name("Inc"), "INC");
        assert_eq!(normalize_name("SA"), "SA");
    }

    #[test]
    fn variants_strip_exchange_suffix() {
        assert_eq!(ticker_variants("VOD.L"), vec!["VOD.L", "VOD"]);
        assert_eq!(ticker_variants("SAP.DE"), vec!["SAP.DE", "SAP"]);
        assert_eq!(ticker_variants("AAPL"), vec!["AAPL"]);
    }
}
