use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::warn;

use crate::error::{EnvError, PrismResult};

/// Immutable engine configuration, read from the environment exactly once at
/// startup and passed by value into component constructors.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of all persisted state (`portfolio.db`, `hive_cache.db`,
    /// `pipeline_health.json`, `hive_contribution.flag`).
    pub data_dir: PathBuf,

    /// Hive connection; `None` disables the community registry entirely.
    pub hive: Option<HiveConfig>,

    /// Contribution/telemetry proxy; `None` disables proxied writes.
    pub proxy: Option<ProxyConfig>,

    /// Finnhub resolver key; absent disables that resolver.
    pub finnhub_api_key: Option<String>,

    /// When `false`, no telemetry is emitted anywhere.
    pub telemetry_enabled: bool,

    /// Holdings below this weight bypass external API resolution.
    pub tier2_threshold: Decimal,

    /// Bound on concurrent issuer-adapter fetches during decomposition.
    pub decompose_concurrency: usize,

    /// Freshness window for cached ETF holdings.
    pub holdings_ttl: Duration,

    /// Local HTTP bridge bind address; `None` runs stdio-only.
    pub bridge_addr: Option<std::net::SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct HiveConfig {
    pub url: String,
    pub anon_key: String,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub url: String,
    pub api_key: Option<String>,
}

impl EngineConfig {
    /// Reads the recognized environment variables, disabling subsystems whose
    /// optional variables are absent.
    pub fn from_env() -> PrismResult<Self> {
        let data_dir = match std::env::var("DATA_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => default_data_dir()?,
        };

        let hive = match (std::env::var("HIVE_URL"), std::env::var("HIVE_ANON_KEY")) {
            (Ok(url), Ok(anon_key)) if !url.is_empty() && !anon_key.is_empty() => {
                Some(HiveConfig { url, anon_key })
            }
            _ => {
                warn!("HIVE_URL/HIVE_ANON_KEY not set; community registry disabled");
                None
            }
        };

        let proxy = match std::env::var("PROXY_URL") {
            Ok(url) if !url.is_empty() => Some(ProxyConfig {
                url,
                api_key: std::env::var("PROXY_API_KEY").ok(),
            }),
            _ => {
                warn!("PROXY_URL not set; contribution proxy disabled");
                None
            }
        };

        let finnhub_api_key = match std::env::var("FINNHUB_API_KEY") {
            Ok(key) if !key.is_empty() => Some(key),
            _ => {
                warn!("FINNHUB_API_KEY not set; Finnhub resolver disabled");
                None
            }
        };

        let telemetry_enabled = match std::env::var("TELEMETRY_ENABLED") {
            Ok(raw) => parse_bool("TELEMETRY_ENABLED", &raw)?,
            Err(_) => true,
        };

        let tier2_threshold = match std::env::var("RESOLVER_TIER2_THRESHOLD") {
            Ok(raw) => raw
                .trim()
                .parse::<Decimal>()
                .map_err(|e| EnvError::InvalidVar {
                    var: "RESOLVER_TIER2_THRESHOLD".into(),
                    msg: e.to_string(),
                })?,
            Err(_) => Decimal::new(5, 3), // 0.005
        };

        let bridge_addr = match std::env::var("PRISM_BRIDGE_ADDR") {
            Ok(raw) if !raw.is_empty() => {
                Some(raw.parse().map_err(|_| EnvError::InvalidVar {
                    var: "PRISM_BRIDGE_ADDR".into(),
                    msg: format!("'{raw}' is not a socket address"),
                })?)
            }
            _ => None,
        };

        Ok(Self {
            data_dir,
            hive,
            proxy,
            finnhub_api_key,
            telemetry_enabled,
            tier2_threshold,
            decompose_concurrency: 5,
            holdings_ttl: Duration::from_secs(24 * 60 * 60),
            bridge_addr,
        })
    }

    pub fn health_report_path(&self) -> PathBuf {
        self.data_dir.join("pipeline_health.json")
    }

    pub fn portfolio_db_path(&self) -> PathBuf {
        self.data_dir.join("portfolio.db")
    }

    pub fn identity_db_path(&self) -> PathBuf {
        self.data_dir.join("hive_cache.db")
    }

    pub fn contribution_flag_path(&self) -> PathBuf {
        self.data_dir.join("hive_contribution.flag")
    }
}

fn default_data_dir() -> PrismResult<PathBuf> {
    dirs::data_dir()
        .map(|d| d.join("portfolio-prism"))
        .ok_or_else(|| EnvError::DataDir("no platform data directory available".into()).into())
}

fn parse_bool(var: &str, raw: &str) -> PrismResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(EnvError::InvalidVar {
            var: var.into(),
            msg: format!("expected a boolean, got '{other}'"),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("X", "true").unwrap());
        assert!(parse_bool("X", "1").unwrap());
        assert!(!parse_bool("X", "FALSE").unwrap());
        assert!(parse_bool("X", "banana").is_err());
    }
}
