use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::cache::AssetMeta;
use crate::config::HiveConfig;
use crate::error::HiveError;
use crate::hive::{HiveContributor, HiveDirectory, HiveHit};
use crate::model::{Alias, AliasType, Holding, Isin};

const RPC_TIMEOUT: Duration = Duration::from_secs(10);
const BATCH_TICKER_CHUNK: usize = 100;
const META_CHUNK: usize = 500;
const RATE_LIMIT_ATTEMPTS: u32 = 4;

/// Thin authenticated wrapper over the registry's named RPCs.
///
/// One pooled HTTP client per engine process. HTTP 429 responses back off
/// exponentially; the final failure surfaces as [`HiveError::RateLimited`]
/// and the caller continues with whatever already resolved.
pub struct HiveClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    contributions: Arc<AtomicBool>,
}

impl HiveClient {
    pub fn new(config: &HiveConfig, contributions: Arc<AtomicBool>) -> Result<Self, HiveError> {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(HiveError::from)?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            anon_key: config.anon_key.clone(),
            contributions,
        })
    }

    async fn rpc<T: DeserializeOwned>(&self, name: &str, payload: Value) -> Result<T, HiveError> {
        let url = format!("{}/rest/v1/rpc/{name}", self.base_url);
        let mut delay = Duration::from_millis(500);

        for attempt in 1..=RATE_LIMIT_ATTEMPTS {
            let response = self
                .http
                .post(&url)
                .header("apikey", &self.anon_key)
                .bearer_auth(&self.anon_key)
                .json(&payload)
                .send()
                .await
                .map_err(HiveError::from)?;

            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if attempt == RATE_LIMIT_ATTEMPTS {
                    return Err(HiveError::RateLimited {
                        rpc: name.to_string(),
                        attempts: attempt,
                    });
                }
                warn!(rpc = name, attempt, ?delay, "hive rate limited; backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
                continue;
            }

            if !response.status().is_success() {
                return Err(HiveError::Rpc {
                    rpc: name.to_string(),
                    msg: format!("status {}", response.status()),
                });
            }

            debug!(rpc = name, "hive rpc ok");
            return response.json::<T>().await.map_err(|e| HiveError::Payload {
                rpc: name.to_string(),
                msg: e.to_string(),
            });
        }
        unreachable!("rate limit loop returns on its final attempt")
    }
}

#[async_trait]
impl HiveDirectory for HiveClient {
    async fn lookup_alias(
        &self,
        alias: &str,
        alias_type: AliasType,
    ) -> Result<Option<HiveHit>, HiveError> {
        self.rpc(
            "lookup_alias",
            json!({ "p_alias": alias, "p_alias_type": alias_type }),
        )
        .await
    }

    async fn resolve_ticker(&self, ticker: &str) -> Result<Option<HiveHit>, HiveError> {
        self.rpc("resolve_ticker", json!({ "p_ticker": ticker })).await
    }

    async fn batch_resolve_tickers(
        &self,
        tickers: &[String],
    ) -> Result<HashMap<String, HiveHit>, HiveError> {
        let mut resolved = HashMap::new();
        for chunk in tickers.chunks(BATCH_TICKER_CHUNK) {
            let page: HashMap<String, HiveHit> = self
                .rpc("batch_resolve_tickers", json!({ "p_tickers": chunk }))
                .await?;
            resolved.extend(page);
        }
        Ok(resolved)
    }

    async fn get_etf_holdings(&self, parent: &Isin) -> Result<Option<Vec<Holding>>, HiveError> {
        let holdings: Option<Vec<Holding>> = self
            .rpc("get_etf_holdings", json!({ "p_isin": parent }))
            .await?;
        Ok(holdings.filter(|h| !h.is_empty()))
    }

    async fn get_asset_meta(
        &self,
        isins: &[Isin],
    ) -> Result<HashMap<Isin, AssetMeta>, HiveError> {
        #[derive(serde::Deserialize)]
        struct MetaRow {
            isin: Isin,
            sector: Option<String>,
            geography: Option<String>,
            currency: Option<String>,
        }

        let mut meta = HashMap::new();
        for chunk in isins.chunks(META_CHUNK) {
            let rows: Vec<MetaRow> = self
                .rpc("batch_get_assets", json!({ "p_isins": chunk }))
                .await?;
            for row in rows {
                meta.insert(
                    row.isin,
                    AssetMeta {
                        sector: row.sector,
                        geography: row.geography,
                        currency: row.currency,
                    },
                );
            }
        }
        Ok(meta)
    }

    async fn fetch_aliases_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Alias>, HiveError> {
        self.rpc(
            "get_all_aliases",
            json!({ "p_offset": offset, "p_limit": limit }),
        )
        .await
    }

    async fn fetch_assets_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(Isin, String, AssetMeta)>, HiveError> {
        #[derive(serde::Deserialize)]
        struct AssetRow {
            isin: Isin,
            name: String,
            sector: Option<String>,
            geography: Option<String>,
            currency: Option<String>,
        }

        let rows: Vec<AssetRow> = self
            .rpc(
                "get_all_assets",
                json!({ "p_offset": offset, "p_limit": limit }),
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.isin,
                    row.name,
                    AssetMeta {
                        sector: row.sector,
                        geography: row.geography,
                        currency: row.currency,
                    },
                )
            })
            .collect())
    }
}

#[async_trait]
impl HiveContributor for HiveClient {
    fn contributions_enabled(&self) -> bool {
        self.contributions.load(Ordering::Relaxed)
    }

    async fn contribute_alias(&self, alias: &Alias) -> Result<(), HiveError> {
        self.rpc::<Value>("contribute_alias", json!({ "p_alias": alias }))
            .await?;
        Ok(())
    }

    async fn contribute_asset(
        &self,
        isin: &Isin,
        name: &str,
        meta: &AssetMeta,
    ) -> Result<(), HiveError> {
        self.rpc::<Value>(
            "contribute_asset",
            json!({
                "p_isin": isin,
                "p_name": name,
                "p_sector": meta.sector,
                "p_geography": meta.geography,
                "p_currency": meta.currency,
            }),
        )
        .await?;
        Ok(())
    }

    async fn contribute_listing(
        &self,
        ticker: &str,
        exchange: Option<&str>,
        isin: &Isin,
        currency: Option<&str>,
    ) -> Result<(), HiveError> {
        self.rpc::<Value>(
            "contribute_listing",
            json!({
                "p_ticker": ticker,
                "p_exchange": exchange,
                "p_isin": isin,
                "p_currency": currency,
            }),
        )
        .await?;
        Ok(())
    }

    async fn contribute_mapping(
        &self,
        parent: &Isin,
        holdings: &[Holding],
        source_tag: &str,
    ) -> Result<(), HiveError> {
        self.rpc::<Value>(
            "contribute_mapping",
            json!({
                "p_parent_isin": parent,
                "p_holdings": holdings,
                "p_source": source_tag,
            }),
        )
        .await?;
        Ok(())
    }
}
