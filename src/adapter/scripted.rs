use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::adapter::{EtfHoldingsAdapter, PositionSource};
use crate::error::{AdapterError, PrismResult};
use crate::model::{CanonicalPosition, Holding, Isin};
use crate::normalizer::NormalizedBatch;

/// A position source backed by a fixed list. Used by tests and by manual
/// imports where the positions were already normalized elsewhere.
pub struct ScriptedPositionSource {
    tag: String,
    positions: Vec<CanonicalPosition>,
}

impl ScriptedPositionSource {
    pub fn new(tag: impl Into<String>, positions: Vec<CanonicalPosition>) -> Self {
        Self {
            tag: tag.into(),
            positions,
        }
    }
}

#[async_trait]
impl PositionSource for ScriptedPositionSource {
    fn source_tag(&self) -> &str {
        &self.tag
    }

    async fn load_positions(&self, _portfolio_id: &str) -> PrismResult<NormalizedBatch> {
        Ok(NormalizedBatch {
            positions: self.positions.clone(),
            errors: Vec::new(),
        })
    }
}

/// What a scripted adapter should do for one ETF.
#[derive(Debug, Clone)]
pub enum ScriptedBehavior {
    Serve(Vec<Holding>),
    ManualUpload,
    TransientFailure { until_attempt: usize },
    Panic,
}

/// A holdings adapter driven by a per-ISIN script. The call counter lets
/// tests assert on retry and caching behavior.
pub struct ScriptedHoldingsAdapter {
    tag: String,
    script: Mutex<HashMap<Isin, ScriptedBehavior>>,
    calls: AtomicUsize,
}

impl ScriptedHoldingsAdapter {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            script: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_behavior(self, parent: Isin, behavior: ScriptedBehavior) -> Self {
        self.script.lock().unwrap().insert(parent, behavior);
        self
    }

    pub fn serve(self, parent: Isin, holdings: Vec<Holding>) -> Self {
        self.with_behavior(parent, ScriptedBehavior::Serve(holdings))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EtfHoldingsAdapter for ScriptedHoldingsAdapter {
    fn adapter_tag(&self) -> &str {
        &self.tag
    }

    fn covers(&self, parent: &Isin) -> bool {
        self.script.lock().unwrap().contains_key(parent)
    }

    async fn fetch_holdings(&self, parent: &Isin) -> Result<Vec<Holding>, AdapterError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let behavior = self.script.lock().unwrap().get(parent).cloned();
        match behavior {
            Some(ScriptedBehavior::Serve(holdings)) => Ok(holdings),
            Some(ScriptedBehavior::ManualUpload) | None => {
                Err(AdapterError::ManualUploadRequired {
                    isin: parent.to_string(),
                })
            }
            Some(ScriptedBehavior::TransientFailure { until_attempt }) => {
                if attempt >= until_attempt {
                    Ok(Vec::new())
                } else {
                    Err(AdapterError::Http("scripted transient failure".into()))
                }
            }
            Some(ScriptedBehavior::Panic) => panic!("scripted adapter crash for {parent}"),
        }
    }
}
