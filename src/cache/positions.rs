use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CacheError, PrismResult};
use crate::model::{AssetClass, CanonicalPosition, Isin, RunStatus};

/// Result of reconciling a position batch against the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub synced_positions: usize,
    pub new_positions: usize,
    pub updated_positions: usize,
    pub skipped_unidentified: usize,
    pub duration_ms: u64,
}

/// One persisted pipeline run, for dashboards and history.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub total_value: Decimal,
    pub summary_json: String,
}

/// The positions store (`portfolio.db`).
///
/// `market_value` exists only as a generated column so a stored total can
/// never diverge from `quantity × unit_price`.
#[derive(Debug)]
pub struct PositionsStore {
    conn: Connection,
}

impl PositionsStore {
    pub fn open(path: &Path) -> PrismResult<Self> {
        let conn = Connection::open(path).map_err(CacheError::Sqlite)?;
        super::restrict_permissions(path);
        Self::new(conn)
    }

    pub fn open_in_memory() -> PrismResult<Self> {
        let conn = Connection::open_in_memory().map_err(CacheError::Sqlite)?;
        Self::new(conn)
    }

    fn new(conn: Connection) -> PrismResult<Self> {
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> PrismResult<()> {
        self.conn
            .execute_batch(
                r#"
                PRAGMA journal_mode = WAL;

                CREATE TABLE IF NOT EXISTS positions (
                    isin          TEXT PRIMARY KEY,
                    symbol        TEXT,
                    name          TEXT NOT NULL,
                    asset_class   TEXT NOT NULL,
                    quantity      TEXT NOT NULL,
                    unit_price    TEXT NOT NULL,
                    currency      TEXT NOT NULL,
                    cost_basis    TEXT,
                    source_tag    TEXT NOT NULL,
                    as_of         INTEGER NOT NULL,
                    market_value  REAL GENERATED ALWAYS AS
                        (CAST(quantity AS REAL) * CAST(unit_price AS REAL)) VIRTUAL
                );

                CREATE TABLE IF NOT EXISTS holdings_breakdown (
                    parent_isin  TEXT NOT NULL,
                    child_isin   TEXT NOT NULL,
                    weight       TEXT NOT NULL,
                    shares       TEXT,
                    confidence   REAL NOT NULL,
                    as_of        INTEGER NOT NULL,
                    PRIMARY KEY (parent_isin, child_isin)
                );

                CREATE TABLE IF NOT EXISTS pipeline_runs (
                    run_id        TEXT PRIMARY KEY,
                    started_at    INTEGER NOT NULL,
                    finished_at   INTEGER NOT NULL,
                    status        TEXT NOT NULL,
                    total_value   TEXT NOT NULL,
                    summary_json  TEXT NOT NULL
                );
                "#,
            )
            .map_err(|e| CacheError::Migration(e.to_string()))?;
        Ok(())
    }

    /// Writes a normalized batch into the store, insert-or-update by ISIN.
    /// Positions without an ISIN cannot be keyed and are skipped (counted in
    /// the outcome). With `dry_run` the diff is computed but nothing is
    /// written.
    pub fn sync_positions(
        &mut self,
        positions: &[CanonicalPosition],
        dry_run: bool,
    ) -> PrismResult<SyncOutcome> {
        let started = Instant::now();
        let mut outcome = SyncOutcome::default();

        let tx = self.conn.transaction().map_err(CacheError::Sqlite)?;
        for p in positions {
            let Some(isin) = &p.isin else {
                outcome.skipped_unidentified += 1;
                continue;
            };

            let existing: Option<(String, String)> = tx
                .query_row(
                    "SELECT quantity, unit_price FROM positions WHERE isin = ?1",
                    params![isin.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(CacheError::Sqlite)?;

            match &existing {
                None => outcome.new_positions += 1,
                Some((quantity, unit_price))
                    if *quantity != p.quantity.to_string()
                        || *unit_price != p.unit_price.to_string() =>
                {
                    outcome.updated_positions += 1;
                }
                Some(_) => {}
            }
            outcome.synced_positions += 1;

            if !dry_run {
                tx.execute(
                    "INSERT INTO positions
                       (isin, symbol, name, asset_class, quantity, unit_price, currency,
                        cost_basis, source_tag, as_of)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT (isin) DO UPDATE SET
                       symbol = excluded.symbol,
                       name = excluded.name,
                       asset_class = excluded.asset_class,
                       quantity = excluded.quantity,
                       unit_price = excluded.unit_price,
                       currency = excluded.currency,
                       cost_basis = excluded.cost_basis,
                       source_tag = excluded.source_tag,
                       as_of = excluded.as_of",
                    params![
                        isin.as_str(),
                        p.symbol,
                        p.name,
                        p.asset_class.to_string(),
                        p.quantity.to_string(),
                        p.unit_price.to_string(),
                        p.currency,
                        p.cost_basis.map(|c| c.to_string()),
                        p.source_tag,
                        p.as_of.timestamp(),
                    ],
                )
                .map_err(CacheError::Sqlite)?;
            }
        }

        if dry_run {
            // Explicitly discard; a dry run must leave no trace.
            drop(tx);
        } else {
            tx.commit().map_err(CacheError::Sqlite)?;
        }

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            synced = outcome.synced_positions,
            new = outcome.new_positions,
            updated = outcome.updated_positions,
            dry_run,
            "positions synced"
        );
        Ok(outcome)
    }

    pub fn get_positions(&self) -> PrismResult<Vec<CanonicalPosition>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT isin, symbol, name, asset_class, quantity, unit_price, currency,
                        cost_basis, source_tag, as_of
                 FROM positions ORDER BY isin",
            )
            .map_err(CacheError::Sqlite)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, i64>(9)?,
                ))
            })
            .map_err(CacheError::Sqlite)?;

        let mut positions = Vec::new();
        for row in rows {
            let (isin, symbol, name, asset_class, quantity, unit_price, currency, cost_basis, source_tag, as_of) =
                row.map_err(CacheError::Sqlite)?;
            positions.push(CanonicalPosition {
                isin: Some(parse_isin(&isin)?),
                symbol,
                name,
                asset_class: asset_class
                    .parse::<AssetClass>()
                    .map_err(|_| corrupt("positions", format!("asset class '{asset_class}'")))?,
                quantity: parse_decimal(&quantity)?,
                unit_price: parse_decimal(&unit_price)?,
                currency,
                cost_basis: cost_basis.as_deref().map(parse_decimal).transpose()?,
                source_tag,
                as_of: Utc
                    .timestamp_opt(as_of, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(positions)
    }

    /// Replaces the whole look-through table for the given parents.
    pub fn replace_breakdown(
        &mut self,
        rows: &[(Isin, Isin, Decimal, Option<Decimal>, f64)],
    ) -> PrismResult<()> {
        let tx = self.conn.transaction().map_err(CacheError::Sqlite)?;
        tx.execute("DELETE FROM holdings_breakdown", [])
            .map_err(CacheError::Sqlite)?;
        let now = Utc::now().timestamp();
        for (parent, child, weight, shares, confidence) in rows {
            tx.execute(
                "INSERT OR REPLACE INTO holdings_breakdown
                   (parent_isin, child_isin, weight, shares, confidence, as_of)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    parent.as_str(),
                    child.as_str(),
                    weight.to_string(),
                    shares.map(|s| s.to_string()),
                    confidence,
                    now,
                ],
            )
            .map_err(CacheError::Sqlite)?;
        }
        tx.commit().map_err(CacheError::Sqlite)?;
        Ok(())
    }

    pub fn record_run(&mut self, record: &RunRecord) -> PrismResult<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO pipeline_runs
                   (run_id, started_at, finished_at, status, total_value, summary_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.run_id,
                    record.started_at.timestamp(),
                    record.finished_at.timestamp(),
                    record.status.to_string(),
                    record.total_value.to_string(),
                    record.summary_json,
                ],
            )
            .map_err(CacheError::Sqlite)?;
        Ok(())
    }

    /// Most recent runs first.
    pub fn run_history(&self, limit: usize) -> PrismResult<Vec<(DateTime<Utc>, Decimal)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT finished_at, total_value FROM pipeline_runs
                 ORDER BY finished_at DESC LIMIT ?1",
            )
            .map_err(CacheError::Sqlite)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(CacheError::Sqlite)?;

        let mut history = Vec::new();
        for row in rows {
            let (ts, total) = row.map_err(CacheError::Sqlite)?;
            history.push((
                Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now),
                parse_decimal(&total)?,
            ));
        }
        Ok(history)
    }
}

fn parse_isin(raw: &str) -> PrismResult<Isin> {
    raw.parse()
        .map_err(|_| corrupt("positions", format!("isin '{raw}'")).into())
}

fn parse_decimal(raw: &str) -> PrismResult<Decimal> {
    raw.parse()
        .map_err(|_| corrupt("positions", format!("decimal '{raw}'")).into())
}

fn corrupt(table: &str, msg: String) -> CacheError {
    CacheError::CorruptRow {
        table: table.into(),
        msg,
    }
}
