use crate::api_client::{Granularity, ReportCategory};
use crate::day_key::{CanonicalDayKey, DateTimeSample, DayKeyNormalizer, SourceConvention};
use crate::decode::ReportRow;
use crate::error::Error;
use crate::report::ReportBatch;
use chrono::NaiveDateTime;
use datafusion::arrow::array::{Date64Builder, RecordBatch, StringBuilder, StringDictionaryBuilder};
use datafusion::arrow::datatypes::{DataType, Field, Int32Type, Schema};
use datafusion::dataframe::DataFrameWriteOptions;
use datafusion::prelude::{DataFrame, SessionContext};
use log::warn;
use std::sync::Arc;

/// Column that carries the business day in App Store analytics reports.
pub const DATE_COLUMN: &str = "Date";

/// One report row keyed for loading.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub entity: String,
    pub category: ReportCategory,
    pub report_name: String,
    pub granularity: Granularity,
    pub processing_date: chrono::NaiveDate,
    pub day_key: CanonicalDayKey,
    pub fields: ReportRow,
}

/// Keys every row of a batch by its business day.
///
/// App Store dates are already Pacific calendar days, so they are read with
/// [`SourceConvention::CivilDate`]. Rows whose date cannot be parsed are
/// dropped.
pub fn canonicalize_batch(batch: &ReportBatch, normalizer: &DayKeyNormalizer) -> Vec<CanonicalRecord> {
    let mut dropped = 0;

    let records: Vec<CanonicalRecord> = batch
        .rows
        .iter()
        .filter_map(|row| {
            let sample = DateTimeSample::from(row.get(DATE_COLUMN).map_or("", String::as_str));
            match normalizer.normalize(&sample, SourceConvention::CivilDate) {
                Ok(day_key) => Some(CanonicalRecord {
                    entity: batch.entity.clone(),
                    category: batch.category,
                    report_name: batch.report_name.clone(),
                    granularity: batch.instance.granularity,
                    processing_date: batch.instance.processing_date,
                    day_key,
                    fields: row.clone(),
                }),
                Err(err) => {
                    dropped += 1;
                    warn!("Dropping row of {}: {}", batch.report_name, err);
                    None
                }
            }
        })
        .collect();

    if dropped > 0 {
        warn!(
            "Dropped {} of {} rows of instance {} for {}",
            dropped,
            batch.rows.len(),
            batch.instance.id,
            batch.entity
        );
    }

    records
}

/// Creates the schema for canonical records.
///
/// # Returns
/// An [`Arc<Schema>`] with the natural key columns (entity, category,
/// granularity, processing_date, payload) plus report_name and day_key.
pub fn record_schema() -> Arc<Schema> {
    let dictionary = || DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8));

    Arc::new(Schema::new(vec![
        Field::new("entity", dictionary(), false),
        Field::new("category", dictionary(), false),
        Field::new("report_name", dictionary(), false),
        Field::new("granularity", dictionary(), false),
        Field::new("processing_date", DataType::Date64, false),
        Field::new("day_key", DataType::Date64, false),
        Field::new("payload", DataType::Utf8, false),
    ]))
}

/// Converts canonical records to a DataFrame.
///
/// # Arguments
/// * `records` - the records to load
/// * `ctx` - the [`SessionContext`] for DataFrame operations
/// * `schema` - normally [`record_schema`]
///
/// # Returns
/// A Result containing either a [`DataFrame`] or an [`Error`]
pub fn convert_records_to_df(
    records: &[CanonicalRecord],
    ctx: &SessionContext,
    schema: Arc<Schema>,
) -> Result<DataFrame, Error> {
    let num_records = records.len();

    let mut entity_builder = StringDictionaryBuilder::<Int32Type>::new();
    let mut category_builder = StringDictionaryBuilder::<Int32Type>::new();
    let mut report_name_builder = StringDictionaryBuilder::<Int32Type>::new();
    let mut granularity_builder = StringDictionaryBuilder::<Int32Type>::new();
    let mut processing_date_builder = Date64Builder::with_capacity(num_records);
    let mut day_key_builder = Date64Builder::with_capacity(num_records);
    let mut payload_builder = StringBuilder::new();

    for record in records {
        entity_builder.append(&record.entity)?;
        category_builder.append(record.category.as_str())?;
        report_name_builder.append(&record.report_name)?;
        granularity_builder.append(record.granularity.as_str())?;
        processing_date_builder.append_value(date_as_unix_ms(record.processing_date));
        day_key_builder.append_value(record.day_key.unix_millis());
        payload_builder.append_value(serde_json::to_string(&record.fields)?);
    }

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(entity_builder.finish()),
            Arc::new(category_builder.finish()),
            Arc::new(report_name_builder.finish()),
            Arc::new(granularity_builder.finish()),
            Arc::new(processing_date_builder.finish()),
            Arc::new(day_key_builder.finish()),
            Arc::new(payload_builder.finish()),
        ],
    )?;

    Ok(ctx.read_batch(batch)?)
}

/// Drops duplicate records and writes the rest to a single Parquet file.
///
/// # Returns
/// The number of distinct records written.
pub async fn dedup_and_save(df: DataFrame, path: &str) -> Result<usize, Error> {
    let distinct = df.distinct()?;
    let count = distinct.clone().count().await?;

    distinct
        .write_parquet(
            path,
            DataFrameWriteOptions::new().with_single_file_output(true),
            None,
        )
        .await?;

    Ok(count)
}

fn date_as_unix_ms(date: chrono::NaiveDate) -> i64 {
    (date - NaiveDateTime::UNIX_EPOCH.date()).num_milliseconds()
}
