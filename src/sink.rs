use crate::api_client::ReportCategory;
use crate::config::Config;
use crate::data::{convert_records_to_df, dedup_and_save, record_schema, CanonicalRecord};
use crate::error::Error;
use datafusion::prelude::{ParquetReadOptions, SessionContext};
use log::{debug, info};
use std::fs;

#[async_trait::async_trait]
pub trait RecordSink: Send + Sync + 'static {
    /// Stores every record polled for one entity and category, keeping what
    /// earlier runs stored.
    ///
    /// # Arguments
    /// * `entity` - The app the records belong to.
    /// * `category` - The report category that was polled.
    /// * `records` - The canonicalized rows; may contain duplicates.
    ///
    /// # Returns
    /// A Result containing either the number of distinct records now stored
    /// for the entity and category, or an Error.
    async fn write(
        &self,
        entity: &str,
        category: ReportCategory,
        records: &[CanonicalRecord],
    ) -> Result<usize, Error>;
}

#[derive(Clone)]
pub struct ParquetSink {
    output_dir: String,
}

impl ParquetSink {
    pub fn new(config: &Config) -> Self {
        ParquetSink {
            output_dir: config.output_dir.clone(),
        }
    }

    fn path_for(&self, entity: &str, category: ReportCategory) -> String {
        format!(
            "{}/{}-{}.parquet",
            self.output_dir.trim_end_matches('/'),
            category.as_str().to_lowercase(),
            entity
        )
    }
}

#[async_trait::async_trait]
impl RecordSink for ParquetSink {
    async fn write(
        &self,
        entity: &str,
        category: ReportCategory,
        records: &[CanonicalRecord],
    ) -> Result<usize, Error> {
        if records.is_empty() {
            info!("No {} records for {}, nothing to write", category, entity);
            return Ok(0);
        }

        fs::create_dir_all(&self.output_dir)?;

        let ctx = SessionContext::new();
        let schema = record_schema();
        let path = self.path_for(entity, category);
        let fresh = convert_records_to_df(records, &ctx, schema.clone())?;

        // rows outside this run's window only live in the stored file
        let merged = if fs::metadata(&path).is_ok() {
            debug!("Merging {} new records into {}", records.len(), path);
            let stored = ctx
                .read_parquet(&path, ParquetReadOptions::new().schema(&schema))
                .await?;
            stored.union(fresh)?
        } else {
            fresh
        };

        let tmp_path = format!("{}.tmp", path);
        let written = dedup_and_save(merged, &tmp_path).await?;
        fs::rename(&tmp_path, &path).map_err(|err| {
            let _ = fs::remove_file(&tmp_path);
            err
        })?;

        info!("Stored {} {} records for {} in {}", written, category, entity, path);

        Ok(written)
    }
}
