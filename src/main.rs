use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use prism_engine::adapter::{
    CsvPositionSource, EtfHoldingsAdapter, IssuerHoldingsAdapter, IssuerProfile, PositionSource,
};
use prism_engine::transport::{run_stdio, serve_bridge};
use prism_engine::{Engine, EngineConfig, PrismResult};

#[tokio::main]
async fn main() {
    // Stdout is reserved for framed responses; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "engine terminated abnormally");
        std::process::exit(1);
    }
}

async fn run() -> PrismResult<()> {
    let config = EngineConfig::from_env()?;
    info!(data_dir = %config.data_dir.display(), "starting prism engine");

    // Broker exports are imported through the normalizer; the pipeline
    // itself always reads from the positions store.
    let import_source: Option<Arc<dyn PositionSource>> =
        match std::env::var("PRISM_POSITIONS_FILE") {
            Ok(path) if !path.is_empty() => {
                let profile = std::env::var("PRISM_POSITIONS_SOURCE")
                    .unwrap_or_else(|_| "generic".to_string());
                Some(Arc::new(CsvPositionSource::new(path, profile)))
            }
            _ => None,
        };

    let mut adapters: Vec<Arc<dyn EtfHoldingsAdapter>> = Vec::new();
    for profile in IssuerProfile::builtin() {
        let tag = profile.tag;
        match IssuerHoldingsAdapter::new(profile) {
            Ok(adapter) => adapters.push(Arc::new(adapter)),
            Err(e) => tracing::warn!(adapter = tag, error = %e, "issuer adapter unavailable"),
        }
    }

    let bridge_addr = config.bridge_addr;
    let engine = Engine::bootstrap(config, import_source, adapters)?;

    if let Some(addr) = bridge_addr {
        let bridge_engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_bridge(bridge_engine, addr).await {
                error!(error = %e, "http bridge stopped");
            }
        });
    }

    run_stdio(engine, tokio::io::stdin(), tokio::io::stdout()).await
}
