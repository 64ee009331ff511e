//! Parquet encoding of cleaned tables and decoding of status observations.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Int64Array, RecordBatch, StringArray,
    TimestampMillisecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use opstat_core::{CleanRecord, CleanTable, EventName, Platform, RecordFields};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::reconcile::StatusObservation;

/// Partition value used when a row has no creation timestamp.
pub const HIVE_DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// `year=YYYY/month=M` path fragment for a partition.
pub fn partition_path(year: Option<i32>, month: Option<u32>) -> String {
    let year = year.map_or_else(|| HIVE_DEFAULT_PARTITION.to_string(), |y| y.to_string());
    let month = month.map_or_else(|| HIVE_DEFAULT_PARTITION.to_string(), |m| m.to_string());
    format!("year={year}/month={month}")
}

/// Rows grouped by `(year, month)`, preserving input order inside each group.
pub fn partition_clean_table(table: &CleanTable) -> BTreeMap<(Option<i32>, Option<u32>), Vec<&CleanRecord>> {
    let mut partitions: BTreeMap<_, Vec<&CleanRecord>> = BTreeMap::new();
    for row in &table.rows {
        partitions.entry((row.year, row.month)).or_default().push(row);
    }
    partitions
}

#[derive(Default)]
struct ColumnSet {
    fields: Vec<ArrowField>,
    arrays: Vec<ArrayRef>,
}

impl ColumnSet {
    fn push(&mut self, name: &str, data_type: DataType, array: ArrayRef) {
        self.fields.push(ArrowField::new(name, data_type, true));
        self.arrays.push(array);
    }

    fn utf8(&mut self, name: &str, values: Vec<Option<String>>) {
        self.push(name, DataType::Utf8, Arc::new(StringArray::from(values)));
    }

    fn int64(&mut self, name: &str, values: Vec<Option<i64>>) {
        self.push(name, DataType::Int64, Arc::new(Int64Array::from(values)));
    }

    fn boolean(&mut self, name: &str, values: Vec<Option<bool>>) {
        self.push(name, DataType::Boolean, Arc::new(BooleanArray::from(values)));
    }

    fn timestamp(&mut self, name: &str, values: Vec<Option<DateTime<Utc>>>) {
        let millis: Vec<Option<i64>> = values.iter().map(|v| v.map(|at| at.timestamp_millis())).collect();
        self.push(
            name,
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            Arc::new(TimestampMillisecondArray::from(millis).with_timezone("UTC")),
        );
    }

    fn into_batch(self, label: &str) -> Result<RecordBatch> {
        RecordBatch::try_new(Arc::new(Schema::new(self.fields)), self.arrays)
            .with_context(|| format!("building {label} record batch"))
    }
}

fn push_record_columns(columns: &mut ColumnSet, rows: &[&RecordFields], extra_columns: &[String]) {
    macro_rules! column {
        ($kind:ident, $name:ident) => {
            columns.$kind(
                stringify!($name),
                rows.iter().map(|r| r.$name.clone()).collect(),
            )
        };
    }

    column!(int64, company_id);
    column!(utf8, shop_id);
    column!(boolean, is_delete);
    column!(int64, user_id);
    columns.utf8(
        "platform_name",
        rows.iter()
            .map(|r| r.platform_name.map(|p| p.display_name().to_string()))
            .collect(),
    );
    column!(utf8, platform_info);
    column!(timestamp, expired_at);
    column!(int64, payment_channel_id);
    column!(timestamp, created_at);
    column!(int64, expires_in);
    column!(boolean, is_vat);
    column!(utf8, payload);
    column!(utf8, guid);
    column!(int64, refresh_expires_in);
    column!(timestamp, updated_at);
    column!(utf8, refresh_token);
    column!(utf8, remarks);
    column!(utf8, access_token);

    for extra in extra_columns {
        columns.utf8(
            extra,
            rows.iter()
                .map(|r| r.extras.get(extra).cloned().flatten())
                .collect(),
        );
    }
}

fn encode_parquet(batch: &RecordBatch, label: &str) -> Result<Vec<u8>> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .with_context(|| format!("opening parquet writer for {label}"))?;
    writer
        .write(batch)
        .with_context(|| format!("writing {label} record batch"))?;
    writer
        .into_inner()
        .with_context(|| format!("closing parquet writer for {label}"))
}

/// One CDC partition file. Partition columns live in the object path, not the file.
///
/// `extra_columns` is the table-wide extra set so every partition shares a schema.
pub fn encode_cdc_rows(rows: &[&CleanRecord], extra_columns: &[String]) -> Result<Vec<u8>> {
    let mut columns = ColumnSet::default();
    columns.utf8("event_id", rows.iter().map(|r| r.event_id.clone()).collect());
    columns.utf8(
        "event_name",
        rows.iter()
            .map(|r| r.event_name.as_ref().map(ToString::to_string))
            .collect(),
    );
    columns.utf8("table_name", rows.iter().map(|r| r.table_name.clone()).collect());
    columns.timestamp(
        "approximate_creation_date_time",
        rows.iter().map(|r| r.approximate_creation_date_time).collect(),
    );
    let fields: Vec<&RecordFields> = rows.iter().map(|r| &r.fields).collect();
    push_record_columns(&mut columns, &fields, extra_columns);
    encode_parquet(&columns.into_batch("cdc")?, "cdc")
}

/// A full table export with its `export_id` column.
pub fn encode_export_rows(export_id: &str, rows: &[RecordFields]) -> Result<Vec<u8>> {
    let extra_columns: Vec<String> = rows
        .iter()
        .flat_map(|r| r.extras.keys().cloned())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    let refs: Vec<&RecordFields> = rows.iter().collect();
    let mut columns = ColumnSet::default();
    push_record_columns(&mut columns, &refs, &extra_columns);
    columns.utf8(
        opstat_cleaning::EXPORT_ID_COLUMN,
        vec![Some(export_id.to_string()); rows.len()],
    );
    encode_parquet(&columns.into_batch("export")?, "export")
}

fn strings(batch: &RecordBatch, name: &str) -> Vec<Option<String>> {
    match batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
    {
        Some(array) => array.iter().map(|v| v.map(str::to_string)).collect(),
        None => vec![None; batch.num_rows()],
    }
}

fn int64s(batch: &RecordBatch, name: &str) -> Vec<Option<i64>> {
    match batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
    {
        Some(array) => array.iter().collect(),
        None => vec![None; batch.num_rows()],
    }
}

fn booleans(batch: &RecordBatch, name: &str) -> Vec<Option<bool>> {
    match batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<BooleanArray>())
    {
        Some(array) => array.iter().collect(),
        None => vec![None; batch.num_rows()],
    }
}

fn timestamps(batch: &RecordBatch, name: &str) -> Vec<Option<DateTime<Utc>>> {
    match batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<TimestampMillisecondArray>())
    {
        Some(array) => array
            .iter()
            .map(|v| v.and_then(DateTime::from_timestamp_millis))
            .collect(),
        None => vec![None; batch.num_rows()],
    }
}

/// Reads the status-relevant columns of a cleaned CDC or export file.
///
/// Missing columns read as null, so export files (no event columns) decode too.
pub fn decode_status_observations(bytes: Vec<u8>) -> Result<Vec<StatusObservation>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
        .context("opening parquet reader")?
        .build()
        .context("building parquet reader")?;

    let mut observations = Vec::new();
    for batch in reader {
        let batch = batch.context("reading record batch")?;
        let event_ids = strings(&batch, "event_id");
        let event_names = strings(&batch, "event_name");
        let platforms = strings(&batch, "platform_name");
        let company_ids = int64s(&batch, "company_id");
        let observed = timestamps(&batch, "approximate_creation_date_time");
        let deleted = booleans(&batch, "is_delete");
        for idx in 0..batch.num_rows() {
            observations.push(StatusObservation {
                event_id: event_ids[idx].clone(),
                company_id: company_ids[idx],
                platform: platforms[idx].as_deref().and_then(Platform::from_display_name),
                event_name: event_names[idx].as_deref().map(EventName::parse),
                observed_at: observed[idx],
                is_delete: deleted[idx],
            });
        }
    }
    Ok(observations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(year: Option<i32>, name: &str, company: i64) -> CleanRecord {
        CleanRecord {
            year,
            month: year.map(|_| 3),
            event_id: Some(format!("evt-{company}")),
            event_name: Some(EventName::parse(name)),
            table_name: Some("open-platform".into()),
            approximate_creation_date_time: year
                .and_then(|_| Utc.with_ymd_and_hms(2022, 3, 8, 9, 5, 8).single()),
            fields: RecordFields {
                company_id: Some(company),
                platform_name: Some(Platform::Shopee),
                ..RecordFields::default()
            },
        }
    }

    #[test]
    fn partition_paths_use_hive_default_for_nulls() {
        assert_eq!(partition_path(Some(2022), Some(3)), "year=2022/month=3");
        assert_eq!(
            partition_path(None, None),
            "year=__HIVE_DEFAULT_PARTITION__/month=__HIVE_DEFAULT_PARTITION__"
        );
    }

    #[test]
    fn partitions_group_rows_by_year_and_month() {
        let table = CleanTable {
            rows: vec![
                record(Some(2022), "INSERT", 1),
                record(None, "INSERT", 2),
                record(Some(2022), "REMOVE", 3),
            ],
        };
        let partitions = partition_clean_table(&table);
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[&(Some(2022), Some(3))].len(), 2);
        assert_eq!(partitions[&(None, None)].len(), 1);
    }

    #[test]
    fn cdc_rows_decode_into_observations() {
        let rows = [record(Some(2022), "INSERT", 1000), record(Some(2022), "MODIFY", 1001)];
        let refs: Vec<&CleanRecord> = rows.iter().collect();
        let bytes = encode_cdc_rows(&refs, &["note".to_string()]).unwrap();
        let observations = decode_status_observations(bytes).unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].company_id, Some(1000));
        assert_eq!(observations[0].platform, Some(Platform::Shopee));
        assert_eq!(observations[0].event_name, Some(EventName::Insert));
        assert_eq!(
            observations[0].observed_at,
            Utc.with_ymd_and_hms(2022, 3, 8, 9, 5, 8).single()
        );
        assert!(observations[1].is_skipped_event());
    }

    #[test]
    fn export_rows_decode_without_event_columns() {
        let rows = vec![RecordFields {
            company_id: Some(7),
            platform_name: Some(Platform::Lazada),
            ..RecordFields::default()
        }];
        let bytes = encode_export_rows("01646035200000-abc", &rows).unwrap();
        let observations = decode_status_observations(bytes).unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].company_id, Some(7));
        assert_eq!(observations[0].event_name, None);
        assert_eq!(observations[0].observed_at, None);
        assert_eq!(observations[0].is_delete, None);
    }

    #[test]
    fn soft_delete_flag_survives_parquet() {
        let rows = vec![RecordFields {
            company_id: Some(7),
            platform_name: Some(Platform::Lazada),
            is_delete: Some(true),
            ..RecordFields::default()
        }];
        let bytes = encode_export_rows("01646035200000-abc", &rows).unwrap();
        let observations = decode_status_observations(bytes).unwrap();
        assert_eq!(observations[0].is_delete, Some(true));
        let pairs = crate::reconcile::observed_pairs(&observations, &opstat_core::DimensionMapping::from([(7, 1)]));
        assert!(pairs.is_empty());
    }
}
