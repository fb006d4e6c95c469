use std::collections::HashMap;

use chrono::{DateTime, Utc};
use polars::prelude::*;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use strum_macros::{Display, EnumString, IntoStaticStr};
use tracing::warn;

use crate::error::{PrismResult, SchemaError};
use crate::model::{
    AssetClass, CanonicalPosition, ErrorCategory, Isin, Phase, PipelineError, Severity,
};

/// Tolerated relative disagreement between `quantity × unit_price` and a
/// provider-supplied total before a row is refused as ambiguous.
const PRICE_TOTAL_TOLERANCE: f64 = 0.01;

/// The canonical column set every normalized batch carries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
pub enum CanonicalColumn {
    #[strum(serialize = "isin")]
    Isin,
    #[strum(serialize = "symbol")]
    Symbol,
    #[strum(serialize = "name")]
    Name,
    #[strum(serialize = "asset_class")]
    AssetClass,
    #[strum(serialize = "quantity")]
    Quantity,
    #[strum(serialize = "unit_price")]
    UnitPrice,
    #[strum(serialize = "currency")]
    Currency,
    #[strum(serialize = "cost_basis")]
    CostBasis,
    /// A provider-supplied precomputed total. Deliberately renamed away from
    /// anything price-shaped so it can never be stored as a value column.
    #[strum(serialize = "provider_total")]
    ProviderTotal,
}

impl CanonicalColumn {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Column aliasing for one named position source, applied once per batch at
/// the boundary.
#[derive(Debug, Clone)]
pub struct SourceProfile {
    pub source_tag: String,
    renames: Vec<(&'static str, CanonicalColumn)>,
}

impl SourceProfile {
    pub fn new(source_tag: impl Into<String>) -> Self {
        Self {
            source_tag: source_tag.into(),
            renames: Vec::new(),
        }
    }

    pub fn map(mut self, provider: &'static str, canonical: CanonicalColumn) -> Self {
        self.renames.push((provider, canonical));
        self
    }
}

/// The outcome of normalizing one provider batch: canonical positions plus
/// per-row diagnostics for everything that had to be dropped.
#[derive(Debug)]
pub struct NormalizedBatch {
    pub positions: Vec<CanonicalPosition>,
    pub errors: Vec<PipelineError>,
}

/// Maps source-specific tabular batches onto the canonical column set.
///
/// All structural work is vectorized; rows are only visited individually at
/// the final typed-extraction boundary.
#[derive(Debug, Clone)]
pub struct SchemaNormalizer {
    profiles: HashMap<String, SourceProfile>,
}

impl Default for SchemaNormalizer {
    fn default() -> Self {
        Self::with_builtin_profiles()
    }
}

impl SchemaNormalizer {
    pub fn new() -> Self {
        Self {
            profiles: HashMap::new(),
        }
    }

    /// Profiles for the sources the engine ships with. `generic` accepts
    /// already-canonical exports and only quarantines total-value columns.
    pub fn with_builtin_profiles() -> Self {
        let mut normalizer = Self::new();
        normalizer.register(
            SourceProfile::new("generic")
                .map("ISIN", CanonicalColumn::Isin)
                .map("ticker", CanonicalColumn::Symbol)
                .map("price", CanonicalColumn::UnitPrice)
                .map("market_value", CanonicalColumn::ProviderTotal)
                .map("total_value", CanonicalColumn::ProviderTotal),
        );
        normalizer.register(
            SourceProfile::new("ibkr")
                .map("ISIN", CanonicalColumn::Isin)
                .map("Symbol", CanonicalColumn::Symbol)
                .map("Description", CanonicalColumn::Name)
                .map("AssetClass", CanonicalColumn::AssetClass)
                .map("Position", CanonicalColumn::Quantity)
                .map("MarkPrice", CanonicalColumn::UnitPrice)
                .map("CurrencyPrimary", CanonicalColumn::Currency)
                .map("CostBasisMoney", CanonicalColumn::CostBasis)
                .map("PositionValue", CanonicalColumn::ProviderTotal),
        );
        normalizer.register(
            SourceProfile::new("trade_republic")
                .map("isin", CanonicalColumn::Isin)
                .map("instrument", CanonicalColumn::Name)
                .map("shares", CanonicalColumn::Quantity)
                .map("CurrentPrice", CanonicalColumn::UnitPrice)
                .map("currency", CanonicalColumn::Currency)
                .map("NetValue", CanonicalColumn::ProviderTotal),
        );
        normalizer
    }

    pub fn register(&mut self, profile: SourceProfile) {
        self.profiles.insert(profile.source_tag.clone(), profile);
    }

    /// Normalizes a provider batch into canonical positions.
    ///
    /// Structural refusals (`SCHEMA_MISSING`, unknown source) fail the whole
    /// batch; per-row refusals (`SCHEMA_AMBIGUOUS`, unparseable values) drop
    /// the row and record a diagnostic so the run can continue.
    pub fn normalize(&self, df: DataFrame, source: &str) -> PrismResult<NormalizedBatch> {
        let profile = self
            .profiles
            .get(source)
            .ok_or_else(|| SchemaError::UnknownSource(source.to_string()))?;

        let mut df = rename_columns(df, profile)?;
        let mut errors = Vec::new();

        if df.height() == 0 {
            return Ok(NormalizedBatch {
                positions: Vec::new(),
                errors,
            });
        }

        let quantity = CanonicalColumn::Quantity.as_str();
        if df.column(quantity).is_err() {
            return Err(SchemaError::MissingColumn(quantity.into()).into());
        }

        df = attach_unit_price(df)?;
        df = drop_ambiguous_rows(df, &mut errors)?;

        let positions = extract_positions(&df, &profile.source_tag, &mut errors)?;
        Ok(NormalizedBatch { positions, errors })
    }
}

fn rename_columns(mut df: DataFrame, profile: &SourceProfile) -> PrismResult<DataFrame> {
    for (provider, canonical) in &profile.renames {
        if df.column(provider).is_ok() && df.column(canonical.as_str()).is_err() {
            df.rename(provider, canonical.as_str().into())
                .map_err(|e| SchemaError::DataFrame(e.to_string()))?;
        }
    }
    Ok(df)
}

/// Resolves the per-unit price column according to the precedence rules:
/// an explicit unit price wins; otherwise the price is synthesized from the
/// provider total and quantity, with divide-by-zero yielding 0.
pub fn unit_price_series(df: &DataFrame) -> PrismResult<Series> {
    let unit_price = CanonicalColumn::UnitPrice.as_str();
    let total = CanonicalColumn::ProviderTotal.as_str();
    let quantity = CanonicalColumn::Quantity.as_str();

    if let Ok(column) = df.column(unit_price) {
        let series = column
            .cast(&DataType::Float64)
            .map_err(|e| SchemaError::DataFrame(e.to_string()))?;
        return Ok(series.as_materialized_series().clone());
    }

    if df.column(total).is_ok() && df.column(quantity).is_ok() {
        warn!("no unit price column; synthesizing from provider total / quantity");
        let derived = df
            .clone()
            .lazy()
            .select([when(col(quantity).abs().gt(lit(0.0)))
                .then(col(total).cast(DataType::Float64) / col(quantity).cast(DataType::Float64))
                .otherwise(lit(0.0))
                .alias(unit_price)])
            .collect()
            .map_err(|e| SchemaError::DataFrame(e.to_string()))?;
        let series = derived
            .column(unit_price)
            .map_err(|e| SchemaError::DataFrame(e.to_string()))?;
        return Ok(series.as_materialized_series().clone());
    }

    Err(SchemaError::MissingPrice(
        "no unit price column and no provider total to derive one from".into(),
    )
    .into())
}

/// Vectorized `quantity × unit_price` for a canonical batch.
pub fn position_values(df: &DataFrame) -> PrismResult<Series> {
    let out = df
        .clone()
        .lazy()
        .select([(col(CanonicalColumn::Quantity.as_str()).cast(DataType::Float64)
            * col(CanonicalColumn::UnitPrice.as_str()).cast(DataType::Float64))
        .alias("market_value")])
        .collect()
        .map_err(|e| SchemaError::DataFrame(e.to_string()))?;
    let series = out
        .column("market_value")
        .map_err(|e| SchemaError::DataFrame(e.to_string()))?;
    Ok(series.as_materialized_series().clone())
}

fn attach_unit_price(mut df: DataFrame) -> PrismResult<DataFrame> {
    let unit_price = CanonicalColumn::UnitPrice.as_str();
    if df.column(unit_price).is_err() {
        let series = unit_price_series(&df)?.with_name(unit_price.into());
        df.with_column(series)
            .map_err(|e| SchemaError::DataFrame(e.to_string()))?;
    }
    Ok(df)
}

/// Where both a unit price and a provider total are present they must agree;
/// disagreeing rows are refused and recorded, never auto-picked.
fn drop_ambiguous_rows(
    df: DataFrame,
    errors: &mut Vec<PipelineError>,
) -> PrismResult<DataFrame> {
    let total = CanonicalColumn::ProviderTotal.as_str();
    if df.column(total).is_err() {
        return Ok(df);
    }

    let quantity = CanonicalColumn::Quantity.as_str();
    let unit_price = CanonicalColumn::UnitPrice.as_str();
    const DEVIATION: &str = "price_total_deviation";

    let checked = df
        .lazy()
        .with_column(
            when(col(total).cast(DataType::Float64).abs().gt(lit(0.0)))
                .then(
                    ((col(quantity).cast(DataType::Float64)
                        * col(unit_price).cast(DataType::Float64))
                        - col(total).cast(DataType::Float64))
                    .abs()
                        / col(total).cast(DataType::Float64).abs(),
                )
                .otherwise(lit(0.0))
                .alias(DEVIATION),
        )
        .collect()
        .map_err(|e| SchemaError::DataFrame(e.to_string()))?;

    let deviations = checked
        .column(DEVIATION)
        .and_then(|c| c.f64())
        .map_err(|e| SchemaError::DataFrame(e.to_string()))?
        .clone();

    let ambiguous: Vec<usize> = deviations
        .iter()
        .enumerate()
        .filter_map(|(i, dev)| (dev.unwrap_or(0.0) > PRICE_TOTAL_TOLERANCE).then_some(i))
        .collect();

    if ambiguous.is_empty() {
        return drop_helper_column(checked, DEVIATION);
    }

    for &row in &ambiguous {
        let item = row_item(&checked, row);
        let expected = scalar_f64(&checked, total, row);
        let actual = scalar_f64(&checked, quantity, row) * scalar_f64(&checked, unit_price, row);
        errors.push(
            PipelineError::new(
                Phase::Loading,
                Severity::Critical,
                ErrorCategory::SchemaError,
                "SCHEMA_AMBIGUOUS",
                item,
                format!(
                    "quantity x unit_price disagrees with provider total by more than {:.0}%",
                    PRICE_TOTAL_TOLERANCE * 100.0
                ),
            )
            .with_expected_actual(format!("{expected}"), format!("{actual}")),
        );
    }

    let filtered = checked
        .lazy()
        .filter(col(DEVIATION).lt_eq(lit(PRICE_TOTAL_TOLERANCE)))
        .collect()
        .map_err(|e| SchemaError::DataFrame(e.to_string()))?;
    drop_helper_column(filtered, DEVIATION)
}

fn drop_helper_column(mut df: DataFrame, name: &str) -> PrismResult<DataFrame> {
    let _ = df.drop_in_place(name);
    Ok(df)
}

fn extract_positions(
    df: &DataFrame,
    source_tag: &str,
    errors: &mut Vec<PipelineError>,
) -> PrismResult<Vec<CanonicalPosition>> {
    let height = df.height();
    let mut positions = Vec::with_capacity(height);

    let quantities = float_column(df, CanonicalColumn::Quantity.as_str())?;
    let prices = float_column(df, CanonicalColumn::UnitPrice.as_str())?;
    let cost_basis = float_column(df, CanonicalColumn::CostBasis.as_str()).ok();

    for row in 0..height {
        let name = opt_str(df, CanonicalColumn::Name.as_str(), row).unwrap_or_default();
        let symbol = opt_str(df, CanonicalColumn::Symbol.as_str(), row);
        let isin = opt_str(df, CanonicalColumn::Isin.as_str(), row)
            .and_then(|raw| raw.parse::<Isin>().ok());

        let Some(quantity) = quantities.get(row).and_then(Decimal::from_f64) else {
            errors.push(row_error(df, row, "quantity is missing or not numeric"));
            continue;
        };
        let Some(unit_price) = prices.get(row).and_then(Decimal::from_f64) else {
            errors.push(row_error(df, row, "unit price is missing or not numeric"));
            continue;
        };
        if quantity.is_sign_negative() || unit_price.is_sign_negative() {
            errors.push(row_error(df, row, "negative quantity or unit price"));
            continue;
        }

        let asset_class = opt_str(df, CanonicalColumn::AssetClass.as_str(), row)
            .and_then(|raw| raw.parse::<AssetClass>().ok())
            .unwrap_or_else(|| infer_asset_class(&name));

        positions.push(CanonicalPosition {
            isin,
            symbol,
            name,
            asset_class,
            quantity: quantity.round_dp(8),
            unit_price: unit_price.round_dp(8),
            currency: opt_str(df, CanonicalColumn::Currency.as_str(), row)
                .unwrap_or_else(|| "EUR".to_string()),
            cost_basis: cost_basis
                .as_ref()
                .and_then(|c| c.get(row))
                .and_then(Decimal::from_f64),
            source_tag: source_tag.to_string(),
            as_of: row_as_of(df, row),
        });
    }

    Ok(positions)
}

/// Names containing fund markers are treated as decomposable when the source
/// did not classify the row.
fn infer_asset_class(name: &str) -> AssetClass {
    let upper = name.to_ascii_uppercase();
    if ["ETF", "UCITS", "INDEX FUND", "ISHARES", "XTRACKERS", "VANGUARD FTSE"]
        .iter()
        .any(|marker| upper.contains(marker))
    {
        AssetClass::Etf
    } else {
        AssetClass::Equity
    }
}

fn float_column(df: &DataFrame, name: &str) -> PrismResult<Float64Chunked> {
    let column = df
        .column(name)
        .map_err(|_| SchemaError::MissingColumn(name.into()))?;
    let casted = column
        .cast(&DataType::Float64)
        .map_err(|e| SchemaError::DataFrame(e.to_string()))?;
    let chunked = casted
        .f64()
        .map_err(|e| SchemaError::DataFrame(e.to_string()))?
        .clone();
    Ok(chunked)
}

fn opt_str(df: &DataFrame, name: &str, row: usize) -> Option<String> {
    let value = df
        .column(name)
        .ok()?
        .str()
        .ok()?
        .get(row)?
        .trim()
        .to_string();
    (!value.is_empty()).then_some(value)
}

fn scalar_f64(df: &DataFrame, name: &str, row: usize) -> f64 {
    df.column(name)
        .ok()
        .and_then(|c| c.cast(&DataType::Float64).ok())
        .and_then(|c| c.f64().ok().and_then(|ca| ca.get(row)))
        .unwrap_or(0.0)
}

fn row_item(df: &DataFrame, row: usize) -> String {
    opt_str(df, CanonicalColumn::Isin.as_str(), row)
        .or_else(|| opt_str(df, CanonicalColumn::Symbol.as_str(), row))
        .or_else(|| opt_str(df, CanonicalColumn::Name.as_str(), row))
        .unwrap_or_else(|| format!("row {row}"))
}

fn row_error(df: &DataFrame, row: usize, msg: &str) -> PipelineError {
    PipelineError::new(
        Phase::Loading,
        Severity::Critical,
        ErrorCategory::SchemaError,
        "SCHEMA_INVALID_ROW",
        row_item(df, row),
        msg,
    )
}

fn row_as_of(df: &DataFrame, row: usize) -> DateTime<Utc> {
    opt_str(df, "as_of", row)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}
