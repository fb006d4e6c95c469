use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use strum_macros::EnumString;
use tracing::debug;

use crate::engine::Engine;
use crate::error::{PipelineFault, PrismError, TransportError};
use crate::transport::codec::{Request, Response};

/// The fixed command registry. Anything else is `UNKNOWN_COMMAND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
enum CommandKind {
    Ping,
    GetPositions,
    SyncPositions,
    RunPipeline,
    GetPipelineReport,
    GetTrueHoldings,
    GetDashboardData,
    GetOverlapAnalysis,
    GetHiveContribution,
    SetHiveContribution,
}

#[derive(Debug, Deserialize)]
struct PortfolioPayload {
    #[serde(default = "default_portfolio")]
    portfolio_id: String,
}

#[derive(Debug, Deserialize)]
struct SyncPayload {
    #[serde(default = "default_portfolio")]
    portfolio_id: String,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
struct ContributionPayload {
    #[serde(default)]
    enabled: Option<bool>,
}

fn default_portfolio() -> String {
    "default".to_string()
}

/// Validates incoming frames against the registry and routes them to the
/// engine. Both the stdio loop and the HTTP bridge go through here, so the
/// two transports cannot drift apart.
#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<Engine>,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        let Request { id, command, payload } = request;
        debug!(%command, "dispatching");

        let Ok(kind) = command.parse::<CommandKind>() else {
            return Response::failure(
                id,
                "UNKNOWN_COMMAND",
                format!("'{command}' is not a recognized command"),
            );
        };

        let result = self.execute(kind, &command, payload).await;
        match result {
            Ok(data) => Response::success(id, data),
            Err(e) => {
                let (code, message) = error_frame(&e);
                Response::failure(id, code, message)
            }
        }
    }

    async fn execute(
        &self,
        kind: CommandKind,
        command: &str,
        payload: Value,
    ) -> Result<Value, PrismError> {
        match kind {
            CommandKind::Ping => Ok(self.engine.ping()),
            CommandKind::GetPositions => {
                let p: PortfolioPayload = parse_payload(command, payload)?;
                self.engine.get_positions(&p.portfolio_id)
            }
            CommandKind::SyncPositions => {
                let p: SyncPayload = parse_payload(command, payload)?;
                self.engine.sync_positions(&p.portfolio_id, p.dry_run).await
            }
            CommandKind::RunPipeline => {
                let p: PortfolioPayload = parse_payload(command, payload)?;
                self.engine.run_pipeline(&p.portfolio_id).await
            }
            CommandKind::GetPipelineReport => self.engine.get_pipeline_report(),
            CommandKind::GetTrueHoldings => self.engine.get_true_holdings(),
            CommandKind::GetDashboardData => {
                let p: PortfolioPayload = parse_payload(command, payload)?;
                self.engine.get_dashboard_data(&p.portfolio_id)
            }
            CommandKind::GetOverlapAnalysis => self.engine.get_overlap_analysis(),
            CommandKind::GetHiveContribution => Ok(self.engine.get_hive_contribution()),
            CommandKind::SetHiveContribution => {
                let p: ContributionPayload = parse_payload(command, payload)?;
                self.engine.set_hive_contribution(p.enabled)
            }
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    command: &str,
    payload: Value,
) -> Result<T, PrismError> {
    let payload = if payload.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|e| {
        TransportError::BadPayload {
            command: command.to_string(),
            msg: e.to_string(),
        }
        .into()
    })
}

fn error_frame(error: &PrismError) -> (&'static str, String) {
    match error {
        PrismError::Pipeline(PipelineFault::AlreadyRunning) => {
            ("ALREADY_RUNNING", error.to_string())
        }
        PrismError::Pipeline(PipelineFault::Timeout) => ("TIMEOUT", error.to_string()),
        PrismError::Transport(TransportError::BadPayload { .. }) => {
            ("BAD_PAYLOAD", error.to_string())
        }
        PrismError::Transport(TransportError::UnknownCommand(_)) => {
            ("UNKNOWN_COMMAND", error.to_string())
        }
        PrismError::Schema(_) => ("SCHEMA_ERROR", error.to_string()),
        PrismError::Cache(_) => ("STORAGE_ERROR", error.to_string()),
        PrismError::Hive(_) => ("HIVE_ERROR", error.to_string()),
        PrismError::Adapter(_) => ("ADAPTER_ERROR", error.to_string()),
        _ => ("INTERNAL_ERROR", error.to_string()),
    }
}
