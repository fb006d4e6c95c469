use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;
use tracing::{debug, info};

use crate::adapter::EtfHoldingsAdapter;
use crate::adapter::retry::with_backoff;
use crate::error::AdapterError;
use crate::model::{Holding, Isin};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// One issuer's public holdings endpoint. ETFs outside the listed ISIN
/// prefixes are not served by that issuer.
#[derive(Debug, Clone)]
pub struct IssuerProfile {
    pub tag: &'static str,
    /// Template with `{isin}` substituted per request.
    pub holdings_url: &'static str,
    /// ISIN prefixes this issuer actually manages.
    pub isin_prefixes: &'static [&'static str],
}

impl IssuerProfile {
    pub fn builtin() -> Vec<IssuerProfile> {
        vec![
            IssuerProfile {
                tag: "ishares",
                holdings_url:
                    "https://www.ishares.com/api/products/{isin}/holdings?format=json",
                isin_prefixes: &["IE00B", "IE000"],
            },
            IssuerProfile {
                tag: "xtrackers",
                holdings_url: "https://etf.dws.com/api/etf/{isin}/constituents.json",
                isin_prefixes: &["LU", "IE00BJ"],
            },
        ]
    }

    fn url_for(&self, parent: &Isin) -> String {
        self.holdings_url.replace("{isin}", parent.as_str())
    }
}

/// Wire shape of the issuer constituents payload.
#[derive(Debug, Deserialize)]
struct IssuerHoldingRow {
    #[serde(default)]
    isin: Option<String>,
    #[serde(default)]
    ticker: Option<String>,
    name: String,
    /// Percentage points (e.g. `4.2` for 4.2%).
    weight_pct: f64,
    #[serde(default)]
    shares: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct IssuerHoldingsPayload {
    holdings: Vec<IssuerHoldingRow>,
}

/// Fetches ETF constituents from an issuer's public endpoint.
///
/// Transient HTTP failures are retried with exponential backoff; a 404 means
/// the issuer does not publish this ETF and the user must upload a file.
pub struct IssuerHoldingsAdapter {
    profile: IssuerProfile,
    http: reqwest::Client,
}

impl IssuerHoldingsAdapter {
    pub fn new(profile: IssuerProfile) -> Result<Self, AdapterError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AdapterError::Http(e.to_string()))?;
        Ok(Self { profile, http })
    }

    async fn fetch_once(&self, parent: &Isin) -> Result<Vec<Holding>, AdapterError> {
        let url = self.profile.url_for(parent);
        debug!(%url, "fetching issuer holdings");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AdapterError::Http(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AdapterError::ManualUploadRequired {
                isin: parent.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(AdapterError::Http(format!(
                "issuer endpoint returned {}",
                response.status()
            )));
        }

        let payload: IssuerHoldingsPayload = response
            .json()
            .await
            .map_err(|e| AdapterError::Parse(e.to_string()))?;

        Ok(payload
            .holdings
            .into_iter()
            .filter_map(|row| into_holding(parent, row))
            .collect())
    }
}

fn into_holding(parent: &Isin, row: IssuerHoldingRow) -> Option<Holding> {
    let weight = Decimal::from_f64(row.weight_pct / 100.0)?.round_dp(8);
    let holding = Holding {
        parent_isin: parent.clone(),
        child_isin: row.isin.and_then(|raw| raw.parse().ok()),
        child_ticker: row.ticker.filter(|t| !t.is_empty()),
        child_name: row.name,
        weight,
        shares: row.shares.and_then(Decimal::from_f64),
        confidence: 0.95,
        as_of: Utc::now(),
    };
    holding.has_identity().then_some(holding)
}

#[async_trait]
impl EtfHoldingsAdapter for IssuerHoldingsAdapter {
    fn adapter_tag(&self) -> &str {
        self.profile.tag
    }

    fn covers(&self, parent: &Isin) -> bool {
        self.profile
            .isin_prefixes
            .iter()
            .any(|prefix| parent.as_str().starts_with(prefix))
    }

    async fn fetch_holdings(&self, parent: &Isin) -> Result<Vec<Holding>, AdapterError> {
        let holdings = with_backoff(self.profile.tag, || self.fetch_once(parent)).await?;
        info!(
            parent = %parent,
            count = holdings.len(),
            adapter = %self.profile.tag,
            "issuer holdings fetched"
        );
        Ok(holdings)
    }
}
