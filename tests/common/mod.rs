#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use prism_engine::adapter::{
    EtfHoldingsAdapter, PositionSource, ScriptedHoldingsAdapter, ScriptedPositionSource,
};
use prism_engine::hive::InMemoryHive;
use prism_engine::model::{AssetClass, CanonicalPosition, Holding, PipelineError};
use prism_engine::normalizer::NormalizedBatch;
use prism_engine::resolver::ExternalResolver;
use prism_engine::{Engine, EngineConfig, PrismResult};

pub const APPLE: &str = "US0378331005";
pub const MSFT: &str = "US5949181045";
pub const NVDA_ISIN: &str = "US67066G1040";
pub const WORLD_ETF: &str = "IE00B4L5Y983";
pub const EM_ETF: &str = "IE00B3RBWM25";

pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        data_dir: dir.to_path_buf(),
        hive: None,
        proxy: None,
        finnhub_api_key: None,
        telemetry_enabled: false,
        tier2_threshold: "0.005".parse().unwrap(),
        decompose_concurrency: 5,
        holdings_ttl: Duration::from_secs(24 * 60 * 60),
        bridge_addr: None,
    }
}

pub fn equity(isin: &str, symbol: &str, quantity: &str, unit_price: &str) -> CanonicalPosition {
    CanonicalPosition {
        isin: Some(isin.parse().unwrap()),
        symbol: Some(symbol.into()),
        name: format!("{symbol} Equity"),
        asset_class: AssetClass::Equity,
        quantity: quantity.parse().unwrap(),
        unit_price: unit_price.parse().unwrap(),
        currency: "EUR".into(),
        cost_basis: None,
        source_tag: "test".into(),
        as_of: Utc::now(),
    }
}

pub fn etf(isin: &str, quantity: &str, unit_price: &str) -> CanonicalPosition {
    CanonicalPosition {
        isin: Some(isin.parse().unwrap()),
        symbol: None,
        name: "Test UCITS ETF".into(),
        asset_class: AssetClass::Etf,
        quantity: quantity.parse().unwrap(),
        unit_price: unit_price.parse().unwrap(),
        currency: "EUR".into(),
        cost_basis: None,
        source_tag: "test".into(),
        as_of: Utc::now(),
    }
}

pub fn holding(parent: &str, child_isin: Option<&str>, name: &str, weight: &str) -> Holding {
    Holding {
        parent_isin: parent.parse().unwrap(),
        child_isin: child_isin.map(|i| i.parse().unwrap()),
        child_ticker: None,
        child_name: name.into(),
        weight: weight.parse().unwrap(),
        shares: None,
        confidence: 0.95,
        as_of: Utc::now(),
    }
}

pub fn ticker_holding(parent: &str, ticker: &str, name: &str, weight: &str) -> Holding {
    Holding {
        parent_isin: parent.parse().unwrap(),
        child_isin: None,
        child_ticker: Some(ticker.into()),
        child_name: name.into(),
        weight: weight.parse().unwrap(),
        shares: None,
        confidence: 0.95,
        as_of: Utc::now(),
    }
}

/// A position source that also reports normalization diagnostics, for
/// driving schema-error scenarios end to end.
pub struct FaultyPositionSource {
    pub positions: Vec<CanonicalPosition>,
    pub errors: Vec<PipelineError>,
}

#[async_trait]
impl PositionSource for FaultyPositionSource {
    fn source_tag(&self) -> &str {
        "faulty"
    }

    async fn load_positions(&self, _portfolio_id: &str) -> PrismResult<NormalizedBatch> {
        Ok(NormalizedBatch {
            positions: self.positions.clone(),
            errors: self.errors.clone(),
        })
    }
}

pub struct TestRig {
    pub engine: Arc<Engine>,
    pub hive: Arc<InMemoryHive>,
    pub adapter: Arc<ScriptedHoldingsAdapter>,
    pub dir: TempDir,
}

pub fn rig(
    positions: Vec<CanonicalPosition>,
    adapter: ScriptedHoldingsAdapter,
    hive: InMemoryHive,
    apis: Vec<Arc<dyn ExternalResolver>>,
) -> TestRig {
    rig_with_source(
        Arc::new(ScriptedPositionSource::new("test", positions)),
        adapter,
        hive,
        apis,
    )
}

pub fn rig_with_source(
    source: Arc<dyn PositionSource>,
    adapter: ScriptedHoldingsAdapter,
    hive: InMemoryHive,
    apis: Vec<Arc<dyn ExternalResolver>>,
) -> TestRig {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(dir.path());
    let hive = Arc::new(hive);
    let adapter = Arc::new(adapter);
    let adapters: Vec<Arc<dyn EtfHoldingsAdapter>> = vec![adapter.clone()];

    let engine = Engine::bootstrap_with(
        config,
        None,
        Some(source),
        adapters,
        hive.clone(),
        hive.clone(),
        apis,
        Arc::new(AtomicBool::new(true)),
    )
    .expect("engine bootstrap");

    TestRig {
        engine,
        hive,
        adapter,
        dir,
    }
}
