use std::path::PathBuf;

use async_trait::async_trait;
use polars::prelude::*;
use tracing::info;

use crate::adapter::PositionSource;
use crate::error::{AdapterError, PrismResult};
use crate::normalizer::{NormalizedBatch, SchemaNormalizer};

/// Reads a broker CSV export and runs it through the schema normalizer.
///
/// The file is re-read on every call; portfolio exports are small and the
/// freshest file on disk should win.
pub struct CsvPositionSource {
    path: PathBuf,
    source_name: String,
    normalizer: SchemaNormalizer,
}

impl CsvPositionSource {
    pub fn new(path: impl Into<PathBuf>, source_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source_name: source_name.into(),
            normalizer: SchemaNormalizer::with_builtin_profiles(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: SchemaNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    fn read_frame(&self) -> Result<DataFrame, AdapterError> {
        CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(200))
            .try_into_reader_with_file_path(Some(self.path.clone()))
            .map_err(|e| AdapterError::Source {
                source_name: self.source_name.clone(),
                msg: e.to_string(),
            })?
            .finish()
            .map_err(|e| AdapterError::Parse(e.to_string()))
    }
}

#[async_trait]
impl PositionSource for CsvPositionSource {
    fn source_tag(&self) -> &str {
        &self.source_name
    }

    async fn load_positions(&self, portfolio_id: &str) -> PrismResult<NormalizedBatch> {
        let df = self.read_frame()?;
        info!(
            portfolio_id,
            rows = df.height(),
            source = %self.source_name,
            "loaded broker export"
        );
        let batch = self.normalizer.normalize(df, &self.source_name)?;
        for err in &batch.errors {
            tracing::warn!(item = %err.item, code = %err.code, "dropped row during normalization");
        }
        Ok(batch)
    }
}
