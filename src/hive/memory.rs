use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::cache::AssetMeta;
use crate::error::HiveError;
use crate::hive::{HiveContributor, HiveDirectory, HiveHit};
use crate::model::{Alias, AliasType, Holding, Isin};

/// Stand-in when no registry is configured: every read misses, every write
/// is refused.
pub struct DisabledHive;

#[async_trait]
impl HiveDirectory for DisabledHive {
    async fn lookup_alias(
        &self,
        _alias: &str,
        _alias_type: AliasType,
    ) -> Result<Option<HiveHit>, HiveError> {
        Ok(None)
    }

    async fn resolve_ticker(&self, _ticker: &str) -> Result<Option<HiveHit>, HiveError> {
        Ok(None)
    }

    async fn batch_resolve_tickers(
        &self,
        _tickers: &[String],
    ) -> Result<HashMap<String, HiveHit>, HiveError> {
        Ok(HashMap::new())
    }

    async fn get_etf_holdings(&self, _parent: &Isin) -> Result<Option<Vec<Holding>>, HiveError> {
        Ok(None)
    }

    async fn get_asset_meta(
        &self,
        _isins: &[Isin],
    ) -> Result<HashMap<Isin, AssetMeta>, HiveError> {
        Ok(HashMap::new())
    }

    async fn fetch_aliases_page(
        &self,
        _offset: usize,
        _limit: usize,
    ) -> Result<Vec<Alias>, HiveError> {
        Ok(Vec::new())
    }

    async fn fetch_assets_page(
        &self,
        _offset: usize,
        _limit: usize,
    ) -> Result<Vec<(Isin, String, AssetMeta)>, HiveError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl HiveContributor for DisabledHive {
    fn contributions_enabled(&self) -> bool {
        false
    }

    async fn contribute_alias(&self, _alias: &Alias) -> Result<(), HiveError> {
        Err(HiveError::Disabled)
    }

    async fn contribute_asset(
        &self,
        _isin: &Isin,
        _name: &str,
        _meta: &AssetMeta,
    ) -> Result<(), HiveError> {
        Err(HiveError::Disabled)
    }

    async fn contribute_listing(
        &self,
        _ticker: &str,
        _exchange: Option<&str>,
        _isin: &Isin,
        _currency: Option<&str>,
    ) -> Result<(), HiveError> {
        Err(HiveError::Disabled)
    }

    async fn contribute_mapping(
        &self,
        _parent: &Isin,
        _holdings: &[Holding],
        _source_tag: &str,
    ) -> Result<(), HiveError> {
        Err(HiveError::Disabled)
    }
}

#[derive(Default)]
struct InMemoryState {
    aliases: HashMap<(String, AliasType), HiveHit>,
    tickers: HashMap<String, HiveHit>,
    holdings: HashMap<Isin, Vec<Holding>>,
    meta: HashMap<Isin, AssetMeta>,
    contributed_aliases: Vec<Alias>,
    contributed_mappings: Vec<Isin>,
}

/// An in-process registry with call accounting. Backs unit and integration
/// tests, and doubles as the offline fixture registry.
#[derive(Default)]
pub struct InMemoryHive {
    state: Mutex<InMemoryState>,
    read_calls: AtomicUsize,
    contributions_on: bool,
    fail_reads: bool,
}

impl InMemoryHive {
    pub fn new() -> Self {
        Self {
            contributions_on: true,
            ..Self::default()
        }
    }

    /// Every read RPC fails as if the registry were unreachable; writes keep
    /// working. Lets tests prove that an outage is reported, not fatal.
    pub fn with_failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    fn read_failure(&self, rpc: &str) -> Result<(), HiveError> {
        if self.fail_reads {
            Err(HiveError::Rpc {
                rpc: rpc.to_string(),
                msg: "scripted hive outage".into(),
            })
        } else {
            Ok(())
        }
    }

    pub fn with_ticker(self, ticker: &str, isin: &str, confidence: f64) -> Self {
        self.state.lock().unwrap().tickers.insert(
            ticker.to_uppercase(),
            HiveHit {
                isin: isin.parse().expect("fixture isin"),
                confidence,
                name: None,
                currency: None,
                exchange: None,
                source: None,
            },
        );
        self
    }

    pub fn with_holdings(self, parent: &str, holdings: Vec<Holding>) -> Self {
        self.state
            .lock()
            .unwrap()
            .holdings
            .insert(parent.parse().expect("fixture isin"), holdings);
        self
    }

    pub fn with_meta(self, isin: &str, sector: &str, geography: &str) -> Self {
        self.state.lock().unwrap().meta.insert(
            isin.parse().expect("fixture isin"),
            AssetMeta {
                sector: Some(sector.to_string()),
                geography: Some(geography.to_string()),
                currency: None,
            },
        );
        self
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn contributed_aliases(&self) -> Vec<Alias> {
        self.state.lock().unwrap().contributed_aliases.clone()
    }

    pub fn contributed_mappings(&self) -> Vec<Isin> {
        self.state.lock().unwrap().contributed_mappings.clone()
    }
}

#[async_trait]
impl HiveDirectory for InMemoryHive {
    async fn lookup_alias(
        &self,
        alias: &str,
        alias_type: AliasType,
    ) -> Result<Option<HiveHit>, HiveError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.read_failure("lookup_alias")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .aliases
            .get(&(alias.to_uppercase(), alias_type))
            .cloned())
    }

    async fn resolve_ticker(&self, ticker: &str) -> Result<Option<HiveHit>, HiveError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.read_failure("resolve_ticker")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .tickers
            .get(&ticker.to_uppercase())
            .cloned())
    }

    async fn batch_resolve_tickers(
        &self,
        tickers: &[String],
    ) -> Result<HashMap<String, HiveHit>, HiveError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.read_failure("batch_resolve_tickers")?;
        let state = self.state.lock().unwrap();
        Ok(tickers
            .iter()
            .filter_map(|t| {
                state
                    .tickers
                    .get(&t.to_uppercase())
                    .map(|hit| (t.clone(), hit.clone()))
            })
            .collect())
    }

    async fn get_etf_holdings(&self, parent: &Isin) -> Result<Option<Vec<Holding>>, HiveError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.read_failure("get_etf_holdings")?;
        Ok(self.state.lock().unwrap().holdings.get(parent).cloned())
    }

    async fn get_asset_meta(
        &self,
        isins: &[Isin],
    ) -> Result<HashMap<Isin, AssetMeta>, HiveError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.read_failure("batch_get_assets")?;
        let state = self.state.lock().unwrap();
        Ok(isins
            .iter()
            .filter_map(|isin| state.meta.get(isin).map(|m| (isin.clone(), m.clone())))
            .collect())
    }

    async fn fetch_aliases_page(
        &self,
        offset: usize,
        _limit: usize,
    ) -> Result<Vec<Alias>, HiveError> {
        // Fixtures are small; everything fits in the first page.
        if offset > 0 {
            return Ok(Vec::new());
        }
        Ok(Vec::new())
    }

    async fn fetch_assets_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(Isin, String, AssetMeta)>, HiveError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .meta
            .iter()
            .skip(offset)
            .take(limit)
            .map(|(isin, meta)| (isin.clone(), isin.to_string(), meta.clone()))
            .collect())
    }
}

#[async_trait]
impl HiveContributor for InMemoryHive {
    fn contributions_enabled(&self) -> bool {
        self.contributions_on
    }

    async fn contribute_alias(&self, alias: &Alias) -> Result<(), HiveError> {
        self.state
            .lock()
            .unwrap()
            .contributed_aliases
            .push(alias.clone());
        Ok(())
    }

    async fn contribute_asset(
        &self,
        isin: &Isin,
        _name: &str,
        meta: &AssetMeta,
    ) -> Result<(), HiveError> {
        self.state
            .lock()
            .unwrap()
            .meta
            .insert(isin.clone(), meta.clone());
        Ok(())
    }

    async fn contribute_listing(
        &self,
        _ticker: &str,
        _exchange: Option<&str>,
        _isin: &Isin,
        _currency: Option<&str>,
    ) -> Result<(), HiveError> {
        Ok(())
    }

    async fn contribute_mapping(
        &self,
        parent: &Isin,
        _holdings: &[Holding],
        _source_tag: &str,
    ) -> Result<(), HiveError> {
        self.state
            .lock()
            .unwrap()
            .contributed_mappings
            .push(parent.clone());
        Ok(())
    }
}
