use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::ResolveError;
use crate::model::{IdentitySource, Isin};

pub const API_TIMEOUT: Duration = Duration::from_secs(10);

/// What the resolver needs to disambiguate cross-listed tickers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveContext {
    pub currency: Option<String>,
    pub exchange: Option<String>,
}

/// A positive answer from one external API.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalHit {
    pub isin: Isin,
    pub confidence: f64,
    pub currency: Option<String>,
    pub exchange: Option<String>,
}

/// One external identity API. Implementations are thin HTTP clients; retry
/// and negative caching live in the cascade, not here.
#[async_trait]
pub trait ExternalResolver: Send + Sync {
    fn source(&self) -> IdentitySource;

    async fn resolve(
        &self,
        ticker: Option<&str>,
        name: Option<&str>,
        context: &ResolveContext,
    ) -> Result<Option<ExternalHit>, ResolveError>;
}

fn http_client(source: IdentitySource) -> Result<reqwest::Client, ResolveError> {
    reqwest::Client::builder()
        .timeout(API_TIMEOUT)
        .build()
        .map_err(|e| ResolveError::Api {
            api: source.to_string(),
            msg: e.to_string(),
        })
}

fn api_err(source: IdentitySource, err: impl ToString) -> ResolveError {
    ResolveError::Api {
        api: source.to_string(),
        msg: err.to_string(),
    }
}

fn hit(source: IdentitySource, isin: Isin, currency: Option<String>, exchange: Option<String>) -> ExternalHit {
    ExternalHit {
        isin,
        confidence: source.initial_confidence(),
        currency,
        exchange,
    }
}

// ================================================================================================
// OpenFIGI
// ================================================================================================

pub struct OpenFigiResolver {
    http: reqwest::Client,
    base_url: String,
}

impl OpenFigiResolver {
    pub fn new() -> Result<Self, ResolveError> {
        Ok(Self {
            http: http_client(IdentitySource::OpenFigi)?,
            base_url: "https://api.openfigi.com".into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct FigiMapping {
    #[serde(default)]
    data: Vec<FigiRow>,
}

#[derive(Debug, Deserialize)]
struct FigiRow {
    #[serde(default)]
    isin: Option<String>,
    #[serde(default, rename = "exchCode")]
    exch_code: Option<String>,
}

#[async_trait]
impl ExternalResolver for OpenFigiResolver {
    fn source(&self) -> IdentitySource {
        IdentitySource::OpenFigi
    }

    async fn resolve(
        &self,
        ticker: Option<&str>,
        _name: Option<&str>,
        _context: &ResolveContext,
    ) -> Result<Option<ExternalHit>, ResolveError> {
        let Some(ticker) = ticker else {
            return Ok(None);
        };

        let url = format!("{}/v3/mapping", self.base_url);
        let body = json!([{ "idType": "TICKER", "idValue": ticker }]);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| api_err(self.source(), e))?;
        if !response.status().is_success() {
            return Err(api_err(
                self.source(),
                format!("status {}", response.status()),
            ));
        }

        let mappings: Vec<FigiMapping> = response
            .json()
            .await
            .map_err(|e| api_err(self.source(), e))?;
        let row = mappings
            .into_iter()
            .flat_map(|m| m.data)
            .find(|row| row.isin.is_some());

        Ok(row.and_then(|row| {
            let isin = row.isin?.parse().ok()?;
            debug!(%ticker, %isin, "openfigi hit");
            Some(hit(self.source(), isin, None, row.exch_code))
        }))
    }
}

// ================================================================================================
// Wikidata
// ================================================================================================

pub struct WikidataResolver {
    http: reqwest::Client,
    base_url: String,
}

impl WikidataResolver {
    pub fn new() -> Result<Self, ResolveError> {
        Ok(Self {
            http: http_client(IdentitySource::Wikidata)?,
            base_url: "https://query.wikidata.org".into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlBindings,
}

#[derive(Debug, Deserialize)]
struct SparqlBindings {
    bindings: Vec<serde_json::Value>,
}

#[async_trait]
impl ExternalResolver for WikidataResolver {
    fn source(&self) -> IdentitySource {
        IdentitySource::Wikidata
    }

    async fn resolve(
        &self,
        _ticker: Option<&str>,
        name: Option<&str>,
        _context: &ResolveContext,
    ) -> Result<Option<ExternalHit>, ResolveError> {
        let Some(name) = name else {
            return Ok(None);
        };

        // P946 is the ISIN property. Labels were sanitized upstream, so the
        // literal interpolation cannot escape the quotes.
        let query = format!(
            r#"SELECT ?isin WHERE {{ ?company rdfs:label "{name}"@en ; wdt:P946 ?isin . }} LIMIT 1"#,
        );
        let response = self
            .http
            .get(format!("{}/sparql", self.base_url))
            .query(&[("query", query.as_str()), ("format", "json")])
            .header("User-Agent", "portfolio-prism/0.1")
            .send()
            .await
            .map_err(|e| api_err(self.source(), e))?;
        if !response.status().is_success() {
            return Err(api_err(
                self.source(),
                format!("status {}", response.status()),
            ));
        }

        let payload: SparqlResponse = response
            .json()
            .await
            .map_err(|e| api_err(self.source(), e))?;
        Ok(payload
            .results
            .bindings
            .first()
            .and_then(|b| b["isin"]["value"].as_str())
            .and_then(|raw| raw.parse::<Isin>().ok())
            .map(|isin| hit(self.source(), isin, None, None)))
    }
}

// ================================================================================================
// Finnhub
// ================================================================================================

pub struct FinnhubResolver {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl FinnhubResolver {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ResolveError> {
        Ok(Self {
            http: http_client(IdentitySource::Finnhub)?,
            base_url: "https://finnhub.io".into(),
            api_key: api_key.into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct FinnhubProfile {
    #[serde(default)]
    isin: Option<String>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    exchange: Option<String>,
}

#[async_trait]
impl ExternalResolver for FinnhubResolver {
    fn source(&self) -> IdentitySource {
        IdentitySource::Finnhub
    }

    async fn resolve(
        &self,
        ticker: Option<&str>,
        _name: Option<&str>,
        _context: &ResolveContext,
    ) -> Result<Option<ExternalHit>, ResolveError> {
        let Some(ticker) = ticker else {
            return Ok(None);
        };

        let response = self
            .http
            .get(format!("{}/api/v1/stock/profile2", self.base_url))
            .query(&[("symbol", ticker), ("token", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| api_err(self.source(), e))?;
        if !response.status().is_success() {
            return Err(api_err(
                self.source(),
                format!("status {}", response.status()),
            ));
        }

        let profile: FinnhubProfile = response
            .json()
            .await
            .map_err(|e| api_err(self.source(), e))?;
        Ok(profile
            .isin
            .and_then(|raw| raw.parse::<Isin>().ok())
            .map(|isin| hit(self.source(), isin, profile.currency, profile.exchange)))
    }
}

// ================================================================================================
// Yahoo Finance
// ================================================================================================

pub struct YfinanceResolver {
    http: reqwest::Client,
    base_url: String,
}

impl YfinanceResolver {
    pub fn new() -> Result<Self, ResolveError> {
        Ok(Self {
            http: http_client(IdentitySource::Yfinance)?,
            base_url: "https://query2.finance.yahoo.com".into(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct QuoteSummaryEnvelope {
    #[serde(rename = "quoteSummary")]
    quote_summary: QuoteSummary,
}

#[derive(Debug, Deserialize)]
struct QuoteSummary {
    #[serde(default)]
    result: Vec<serde_json::Value>,
}

#[async_trait]
impl ExternalResolver for YfinanceResolver {
    fn source(&self) -> IdentitySource {
        IdentitySource::Yfinance
    }

    async fn resolve(
        &self,
        ticker: Option<&str>,
        _name: Option<&str>,
        _context: &ResolveContext,
    ) -> Result<Option<ExternalHit>, ResolveError> {
        let Some(ticker) = ticker else {
            return Ok(None);
        };

        let url = format!(
            "{}/v10/finance/quoteSummary/{ticker}",
            self.base_url
        );
        let response = self
            .http
            .get(&url)
            .query(&[("modules", "quoteType")])
            .send()
            .await
            .map_err(|e| api_err(self.source(), e))?;
        if !response.status().is_success() {
            return Err(api_err(
                self.source(),
                format!("status {}", response.status()),
            ));
        }

        let envelope: QuoteSummaryEnvelope = response
            .json()
            .await
            .map_err(|e| api_err(self.source(), e))?;
        Ok(envelope
            .quote_summary
            .result
            .first()
            .and_then(|r| r["quoteType"]["isin"].as_str())
            .and_then(|raw| raw.parse::<Isin>().ok())
            .map(|isin| hit(self.source(), isin, None, None)))
    }
}

// ================================================================================================
// Scripted resolver (test support)
// ================================================================================================

/// A resolver driven by a fixed answer table, with call accounting so tests
/// can prove when the cascade did or did not reach the API tier.
pub struct ScriptedResolver {
    source: IdentitySource,
    answers: std::collections::HashMap<String, Isin>,
    calls: std::sync::atomic::AtomicUsize,
    fail: bool,
}

impl ScriptedResolver {
    pub fn new(source: IdentitySource) -> Self {
        Self {
            source,
            answers: std::collections::HashMap::new(),
            calls: std::sync::atomic::AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn answers(mut self, ticker_or_name: &str, isin: &str) -> Self {
        self.answers
            .insert(ticker_or_name.to_uppercase(), isin.parse().expect("fixture isin"));
        self
    }

    /// Every call errors, as if the provider were down.
    pub fn with_failure(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ExternalResolver for ScriptedResolver {
    fn source(&self) -> IdentitySource {
        self.source
    }

    async fn resolve(
        &self,
        ticker: Option<&str>,
        name: Option<&str>,
        _context: &ResolveContext,
    ) -> Result<Option<ExternalHit>, ResolveError> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail {
            return Err(api_err(self.source, "scripted resolver outage"));
        }
        let key = ticker.or(name).unwrap_or_default().to_uppercase();
        Ok(self
            .answers
            .get(&key)
            .map(|isin| hit(self.source, isin.clone(), None, None)))
    }
}
