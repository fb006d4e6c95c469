use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::{CacheError, PrismResult};
use crate::model::{Alias, AliasType, Holding, IdentitySource, Isin};

/// Initial time-to-live of a negative resolution, doubled on every
/// subsequent miss up to [`NEGATIVE_TTL_MAX_DAYS`].
pub const NEGATIVE_TTL_INITIAL_DAYS: i64 = 14;
pub const NEGATIVE_TTL_MAX_DAYS: i64 = 90;

/// Sector/geography/currency metadata attached to an asset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AssetMeta {
    pub sector: Option<String>,
    pub geography: Option<String>,
    pub currency: Option<String>,
}

/// Local mirror of the Hive identity domain plus the negative-resolution
/// table, backed by `hive_cache.db`.
///
/// One writer per process; every write runs inside a transaction so no
/// partial state is ever observable.
#[derive(Debug)]
pub struct IdentityCache {
    conn: Connection,
}

impl IdentityCache {
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
        let cache = Self { conn };
        cache.migrate()?;
        Ok(cache)
    }

    fn migrate(&self) -> PrismResult<()> {
        self.conn
            .execute_batch(
                r#"
                PRAGMA journal_mode = WAL;

                CREATE TABLE IF NOT EXISTS assets (
                    isin        TEXT PRIMARY KEY,
                    name        TEXT NOT NULL,
                    sector      TEXT,
                    geography   TEXT,
                    currency    TEXT,
                    updated_at  INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS listings (
                    ticker    TEXT NOT NULL,
                    exchange  TEXT,
                    isin      TEXT NOT NULL,
                    currency  TEXT,
                    UNIQUE (ticker, isin, exchange)
                );

                CREATE TABLE IF NOT EXISTS aliases (
                    alias              TEXT NOT NULL,
                    alias_upper        TEXT NOT NULL,
                    isin               TEXT NOT NULL,
                    alias_type         TEXT NOT NULL,
                    language           TEXT,
                    source             TEXT NOT NULL,
                    confidence         REAL NOT NULL,
                    currency           TEXT,
                    exchange           TEXT,
                    contributor_hash   TEXT,
                    contributor_count  INTEGER NOT NULL DEFAULT 1,
                    UNIQUE (alias_upper, isin)
                );

                CREATE TABLE IF NOT EXISTS negative_cache (
                    alias          TEXT NOT NULL,
                    alias_type     TEXT NOT NULL,
                    last_attempt   INTEGER NOT NULL,
                    attempt_count  INTEGER NOT NULL DEFAULT 1,
                    ttl_days       INTEGER NOT NULL,
                    PRIMARY KEY (alias, alias_type)
                );

                CREATE TABLE IF NOT EXISTS etf_holdings (
                    parent_isin   TEXT NOT NULL,
                    child_isin    TEXT,
                    child_ticker  TEXT,
                    child_name    TEXT NOT NULL,
                    weight        TEXT NOT NULL,
                    shares        TEXT,
                    confidence    REAL NOT NULL,
                    as_of         INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_etf_holdings_parent
                    ON etf_holdings (parent_isin);

                CREATE TABLE IF NOT EXISTS etf_holdings_meta (
                    parent_isin  TEXT PRIMARY KEY,
                    source_tag   TEXT NOT NULL,
                    fetched_at   INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sync_metadata (
                    domain        TEXT PRIMARY KEY,
                    last_sync_at  INTEGER NOT NULL
                );
                "#,
            )
            .map_err(|e| CacheError::Migration(e.to_string()))?;
        Ok(())
    }

    // ============================================================================================
    // Aliases
    // ============================================================================================

    /// Case-insensitive best match for an alias: highest confidence first,
    /// broadest corroboration as the tie-break.
    pub fn get_isin_by_alias(
        &self,
        alias: &str,
        alias_type: AliasType,
    ) -> PrismResult<Option<(Isin, f64, IdentitySource)>> {
        let row = self
            .conn
            .query_row(
                "SELECT isin, confidence, source FROM aliases
                 WHERE alias_upper = ?1 AND alias_type = ?2
                 ORDER BY confidence DESC, contributor_count DESC
                 LIMIT 1",
                params![alias.trim().to_uppercase(), alias_type.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(CacheError::Sqlite)?;

        let Some((isin_raw, confidence, source_raw)) = row else {
            return Ok(None);
        };
        let isin = isin_raw.parse::<Isin>().map_err(|_| CacheError::CorruptRow {
            table: "aliases".into(),
            msg: format!("invalid isin '{isin_raw}'"),
        })?;
        let source = source_raw
            .parse::<IdentitySource>()
            .map_err(|_| CacheError::CorruptRow {
                table: "aliases".into(),
                msg: format!("unknown source '{source_raw}'"),
            })?;
        Ok(Some((isin, confidence, source)))
    }

    /// Upsert with corroboration semantics: an existing `(alias, isin)` row
    /// takes the max confidence and gains a contributor.
    pub fn upsert_alias(&mut self, alias: &Alias) -> PrismResult<()> {
        let tx = self.conn.transaction().map_err(CacheError::Sqlite)?;
        tx.execute(
            "INSERT INTO aliases
               (alias, alias_upper, isin, alias_type, language, source, confidence,
                currency, exchange, contributor_hash, contributor_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT (alias_upper, isin) DO UPDATE SET
               confidence = MAX(confidence, excluded.confidence),
               contributor_count = contributor_count + 1,
               source = excluded.source",
            params![
                alias.alias,
                alias.alias.trim().to_uppercase(),
                alias.isin.as_str(),
                alias.alias_type.to_string(),
                alias.language,
                alias.source.to_string(),
                alias.confidence,
                alias.currency,
                alias.exchange,
                alias.contributor_hash,
                alias.contributor_count,
            ],
        )
        .map_err(CacheError::Sqlite)?;
        tx.commit().map_err(CacheError::Sqlite)?;
        Ok(())
    }

    // ============================================================================================
    // Assets & listings
    // ============================================================================================

    pub fn upsert_asset(&mut self, isin: &Isin, name: &str, meta: &AssetMeta) -> PrismResult<()> {
        let tx = self.conn.transaction().map_err(CacheError::Sqlite)?;
        tx.execute(
            "INSERT INTO assets (isin, name, sector, geography, currency, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (isin) DO UPDATE SET
               name = excluded.name,
               sector = COALESCE(excluded.sector, sector),
               geography = COALESCE(excluded.geography, geography),
               currency = COALESCE(excluded.currency, currency),
               updated_at = excluded.updated_at",
            params![
                isin.as_str(),
                name,
                meta.sector,
                meta.geography,
                meta.currency,
                Utc::now().timestamp(),
            ],
        )
        .map_err(CacheError::Sqlite)?;
        tx.commit().map_err(CacheError::Sqlite)?;
        Ok(())
    }

    pub fn get_asset_meta(&self, isin: &Isin) -> PrismResult<Option<AssetMeta>> {
        self.conn
            .query_row(
                "SELECT sector, geography, currency FROM assets WHERE isin = ?1",
                params![isin.as_str()],
                |row| {
                    Ok(AssetMeta {
                        sector: row.get(0)?,
                        geography: row.get(1)?,
                        currency: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|e| CacheError::Sqlite(e).into())
    }

    pub fn upsert_listing(
        &mut self,
        ticker: &str,
        exchange: Option<&str>,
        isin: &Isin,
        currency: Option<&str>,
    ) -> PrismResult<()> {
        let tx = self.conn.transaction().map_err(CacheError::Sqlite)?;
        tx.execute(
            "INSERT OR REPLACE INTO listings (ticker, exchange, isin, currency)
             VALUES (?1, ?2, ?3, ?4)",
            params![ticker.to_uppercase(), exchange, isin.as_str(), currency],
        )
        .map_err(CacheError::Sqlite)?;
        tx.commit().map_err(CacheError::Sqlite)?;
        Ok(())
    }

    /// Listing lookup used to prefer the ticker variant matching the caller's
    /// expected exchange or currency.
    pub fn find_listing(
        &self,
        ticker: &str,
    ) -> PrismResult<Vec<(Isin, Option<String>, Option<String>)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT isin, exchange, currency FROM listings WHERE ticker = ?1",
            )
            .map_err(CacheError::Sqlite)?;
        let rows = stmt
            .query_map(params![ticker.to_uppercase()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(CacheError::Sqlite)?;

        let mut listings = Vec::new();
        for row in rows {
            let (isin_raw, exchange, currency) = row.map_err(CacheError::Sqlite)?;
            if let Ok(isin) = isin_raw.parse() {
                listings.push((isin, exchange, currency));
            }
        }
        Ok(listings)
    }

    // ============================================================================================
    // Negative cache
    // ============================================================================================

    /// Records a failed resolution. Repeated misses double the TTL, capped at
    /// [`NEGATIVE_TTL_MAX_DAYS`].
    pub fn record_negative(&mut self, alias: &str, alias_type: AliasType) -> PrismResult<()> {
        let tx = self.conn.transaction().map_err(CacheError::Sqlite)?;
        tx.execute(
            "INSERT INTO negative_cache (alias, alias_type, last_attempt, attempt_count, ttl_days)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT (alias, alias_type) DO UPDATE SET
               last_attempt = excluded.last_attempt,
               attempt_count = attempt_count + 1,
               ttl_days = MIN(ttl_days * 2, ?5)",
            params![
                alias.trim().to_uppercase(),
                alias_type.to_string(),
                Utc::now().timestamp(),
                NEGATIVE_TTL_INITIAL_DAYS,
                NEGATIVE_TTL_MAX_DAYS,
            ],
        )
        .map_err(CacheError::Sqlite)?;
        tx.commit().map_err(CacheError::Sqlite)?;
        Ok(())
    }

    pub fn is_negative(&self, alias: &str, alias_type: AliasType) -> PrismResult<bool> {
        let row = self
            .conn
            .query_row(
                "SELECT last_attempt, ttl_days FROM negative_cache
                 WHERE alias = ?1 AND alias_type = ?2",
                params![alias.trim().to_uppercase(), alias_type.to_string()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .map_err(CacheError::Sqlite)?;

        Ok(match row {
            Some((last_attempt, ttl_days)) => {
                let expires = last_attempt + ttl_days * 86_400;
                Utc::now().timestamp() < expires
            }
            None => false,
        })
    }

    /// Successful resolutions clear the entry so the alias is never
    /// short-circuited again.
    pub fn clear_negative(&mut self, alias: &str, alias_type: AliasType) -> PrismResult<()> {
        self.conn
            .execute(
                "DELETE FROM negative_cache WHERE alias = ?1 AND alias_type = ?2",
                params![alias.trim().to_uppercase(), alias_type.to_string()],
            )
            .map_err(CacheError::Sqlite)?;
        Ok(())
    }

    // ============================================================================================
    // ETF holdings cache
    // ============================================================================================

    pub fn get_etf_holdings(
        &self,
        parent: &Isin,
    ) -> PrismResult<Option<(Vec<Holding>, String, DateTime<Utc>)>> {
        let meta = self
            .conn
            .query_row(
                "SELECT source_tag, fetched_at FROM etf_holdings_meta WHERE parent_isin = ?1",
                params![parent.as_str()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .map_err(CacheError::Sqlite)?;

        let Some((source_tag, fetched_at)) = meta else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT child_isin, child_ticker, child_name, weight, shares, confidence, as_of
                 FROM etf_holdings WHERE parent_isin = ?1",
            )
            .map_err(CacheError::Sqlite)?;
        let rows = stmt
            .query_map(params![parent.as_str()], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })
            .map_err(CacheError::Sqlite)?;

        let mut holdings = Vec::new();
        for row in rows {
            let (child_isin, child_ticker, child_name, weight, shares, confidence, as_of) =
                row.map_err(CacheError::Sqlite)?;
            holdings.push(Holding {
                parent_isin: parent.clone(),
                child_isin: child_isin.and_then(|raw| raw.parse().ok()),
                child_ticker,
                child_name,
                weight: parse_decimal("etf_holdings", &weight)?,
                shares: shares.as_deref().map(|s| parse_decimal("etf_holdings", s)).transpose()?,
                confidence,
                as_of: timestamp_to_utc(as_of),
            });
        }

        let fetched = timestamp_to_utc(fetched_at);
        Ok(Some((holdings, source_tag, fetched)))
    }

    /// Wholesale replacement: a refresh replaces every row of the entry or
    /// none of them.
    pub fn put_etf_holdings(
        &mut self,
        parent: &Isin,
        holdings: &[Holding],
        source_tag: &str,
    ) -> PrismResult<()> {
        let tx = self.conn.transaction().map_err(CacheError::Sqlite)?;
        tx.execute(
            "DELETE FROM etf_holdings WHERE parent_isin = ?1",
            params![parent.as_str()],
        )
        .map_err(CacheError::Sqlite)?;
        for h in holdings {
            tx.execute(
                "INSERT INTO etf_holdings
                   (parent_isin, child_isin, child_ticker, child_name, weight, shares,
                    confidence, as_of)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    parent.as_str(),
                    h.child_isin.as_ref().map(|i| i.as_str()),
                    h.child_ticker,
                    h.child_name,
                    h.weight.to_string(),
                    h.shares.map(|s| s.to_string()),
                    h.confidence,
                    h.as_of.timestamp(),
                ],
            )
            .map_err(CacheError::Sqlite)?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO etf_holdings_meta (parent_isin, source_tag, fetched_at)
             VALUES (?1, ?2, ?3)",
            params![parent.as_str(), source_tag, Utc::now().timestamp()],
        )
        .map_err(CacheError::Sqlite)?;
        tx.commit().map_err(CacheError::Sqlite)?;
        debug!(parent = %parent, count = holdings.len(), source_tag, "holdings cached");
        Ok(())
    }

    pub fn invalidate_etf_holdings(&mut self, parent: &Isin) -> PrismResult<()> {
        let tx = self.conn.transaction().map_err(CacheError::Sqlite)?;
        tx.execute(
            "DELETE FROM etf_holdings WHERE parent_isin = ?1",
            params![parent.as_str()],
        )
        .map_err(CacheError::Sqlite)?;
        tx.execute(
            "DELETE FROM etf_holdings_meta WHERE parent_isin = ?1",
            params![parent.as_str()],
        )
        .map_err(CacheError::Sqlite)?;
        tx.commit().map_err(CacheError::Sqlite)?;
        Ok(())
    }

    /// All ETF ISINs with cached compositions, for overlap analysis.
    pub fn cached_etf_parents(&self) -> PrismResult<Vec<Isin>> {
        let mut stmt = self
            .conn
            .prepare("SELECT parent_isin FROM etf_holdings_meta ORDER BY parent_isin")
            .map_err(CacheError::Sqlite)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(CacheError::Sqlite)?;
        let mut parents = Vec::new();
        for row in rows {
            if let Ok(isin) = row.map_err(CacheError::Sqlite)?.parse() {
                parents.push(isin);
            }
        }
        Ok(parents)
    }

    // ============================================================================================
    // Sync metadata
    // ============================================================================================

    pub fn mark_synced(&mut self, domain: &str) -> PrismResult<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_metadata (domain, last_sync_at) VALUES (?1, ?2)",
                params![domain, Utc::now().timestamp()],
            )
            .map_err(CacheError::Sqlite)?;
        Ok(())
    }

    pub fn is_stale(&self, domain: &str, max_age: Duration) -> PrismResult<bool> {
        let last = self
            .conn
            .query_row(
                "SELECT last_sync_at FROM sync_metadata WHERE domain = ?1",
                params![domain],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(CacheError::Sqlite)?;

        Ok(match last {
            Some(ts) => Utc::now().timestamp() - ts > max_age.as_secs() as i64,
            None => true,
        })
    }
}

fn parse_decimal(table: &str, raw: &str) -> PrismResult<Decimal> {
    raw.parse().map_err(|_| {
        CacheError::CorruptRow {
            table: table.into(),
            msg: format!("'{raw}' is not a decimal"),
        }
        .into()
    })
}

fn timestamp_to_utc(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}
