pub mod csv_source;
pub mod issuer;
pub mod retry;
pub mod scripted;

use async_trait::async_trait;

use crate::error::{AdapterError, PrismResult};
use crate::model::{Holding, Isin};
use crate::normalizer::NormalizedBatch;

pub use csv_source::CsvPositionSource;
pub use issuer::{IssuerHoldingsAdapter, IssuerProfile};
pub use scripted::{ScriptedBehavior, ScriptedHoldingsAdapter, ScriptedPositionSource};

/// Produces the canonical positions of one portfolio. Broker authentication
/// and session handling live entirely behind this seam.
///
/// The returned batch carries per-row diagnostics alongside the surviving
/// positions so the pipeline can record what was dropped.
#[async_trait]
pub trait PositionSource: Send + Sync {
    fn source_tag(&self) -> &str;

    async fn load_positions(&self, portfolio_id: &str) -> PrismResult<NormalizedBatch>;
}

/// Serves the composition of one ETF, typically by reading an issuer file.
///
/// Adapters are pure with respect to the pipeline: no shared mutable state,
/// and internal retries for transient network failures are their own
/// responsibility (see [`retry::with_backoff`]).
/// [`AdapterError::ManualUploadRequired`] is terminal for that ETF within a
/// run and must never be retried.
#[async_trait]
pub trait EtfHoldingsAdapter: Send + Sync {
    fn adapter_tag(&self) -> &str;

    /// Whether this adapter recognizes the ETF at all. Lets the decomposer
    /// pick an adapter without paying for a failed fetch.
    fn covers(&self, parent: &Isin) -> bool;

    async fn fetch_holdings(&self, parent: &Isin) -> Result<Vec<Holding>, AdapterError>;
}
