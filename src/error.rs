use thiserror::Error;

pub type PrismResult<T> = Result<T, PrismError>;

#[derive(Debug, Error)]
pub enum PrismError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Hive(#[from] HiveError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Pipeline(#[from] PipelineFault),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Io(#[from] IoError),
}

/// Errors raised while normalizing a provider batch into canonical columns.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Unknown position source: '{0}'")]
    UnknownSource(String),

    #[error("Neither a unit price nor a derivable total is present: {0}")]
    MissingPrice(String),

    #[error("Price and provider total disagree beyond tolerance: {0}")]
    AmbiguousPrice(String),

    #[error("Missing required column '{0}'")]
    MissingColumn(String),

    #[error("Data frame error: {0}")]
    DataFrame(String),

    #[error("Invalid value in column '{column}' at row {row}: {msg}")]
    InvalidValue {
        column: String,
        row: usize,
        msg: String,
    },
}

/// Errors from the embedded local stores.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Corrupt row in '{table}': {msg}")]
    CorruptRow { table: String, msg: String },
}

/// Errors from the community registry RPCs.
#[derive(Debug, Error)]
pub enum HiveError {
    #[error("Hive is not configured")]
    Disabled,

    #[error("RPC '{rpc}' failed: {msg}")]
    Rpc { rpc: String, msg: String },

    #[error("Rate limited on '{rpc}' after {attempts} attempts")]
    RateLimited { rpc: String, attempts: u32 },

    #[error("Unexpected RPC payload from '{rpc}': {msg}")]
    Payload { rpc: String, msg: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for HiveError {
    fn from(value: reqwest::Error) -> Self {
        HiveError::Http(value.to_string())
    }
}

/// Errors from the identity resolution cascade.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Invalid resolver input: {0}")]
    InvalidInput(String),

    #[error("External resolver '{api}' failed: {msg}")]
    Api { api: String, msg: String },

    #[error("External resolver '{api}' timed out")]
    Timeout { api: String },
}

/// Errors from broker/issuer adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Terminal for the affected ETF within a run; never retried.
    #[error("Holdings for {isin} require a manual file upload")]
    ManualUploadRequired { isin: String },

    #[error("No adapter can serve holdings for {isin}")]
    NoAdapter { isin: String },

    #[error("HTTP fetch failed: {0}")]
    Http(String),

    #[error("Failed to parse issuer payload: {0}")]
    Parse(String),

    #[error("Position source '{source_name}' failed: {msg}")]
    Source { source_name: String, msg: String },
}

impl AdapterError {
    /// Transient errors are worth another attempt; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Http(_))
    }
}

/// Hard faults of the orchestrator itself. Per-item problems travel as
/// [`crate::model::PipelineError`] values instead.
#[derive(Debug, Error)]
pub enum PipelineFault {
    #[error("A pipeline is already running")]
    AlreadyRunning,

    #[error("Pipeline exceeded the overall deadline")]
    Timeout,

    #[error("Pipeline state error: {0}")]
    State(String),
}

/// Errors at the command/event transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Malformed request frame: {0}")]
    BadFrame(String),

    #[error("Unknown command: '{0}'")]
    UnknownCommand(String),

    #[error("Invalid payload for '{command}': {msg}")]
    BadPayload { command: String, msg: String },

    #[error("Event channel closed")]
    ChannelClosed,
}

/// Errors in startup configuration.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: {msg}")]
    InvalidVar { var: String, msg: String },

    #[error("Data directory is not usable: {0}")]
    DataDir(String),
}

/// Errors related to file I/O and serialization.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("IO operation failed")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed")]
    Json(#[from] serde_json::Error),

    #[error("Failed to write report: {0}")]
    ReportWrite(String),
}
