//! Cleaning of CDC batches and table exports into typed, normalized records.

use chrono::{DateTime, Datelike, Utc};
use opstat_core::{
    normalize_column_name, AttributeMap, ChangeEvent, CleanRecord, CleanTable, EventName,
    Platform, RecordFields, CDC_METADATA_COLUMNS,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "opstat-cleaning";

pub const MANIFEST_SUMMARY_FILE: &str = "manifest-summary.json";

/// Column added to every cleaned export row.
pub const EXPORT_ID_COLUMN: &str = "export_id";

#[derive(Debug, Error)]
pub enum CleanError {
    #[error("line {line}: malformed change event: {source}")]
    MalformedEvent {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("line {line}: malformed export item: {reason}")]
    MalformedItem { line: usize, reason: String },
    #[error("malformed manifest summary: {0}")]
    ManifestSummary(#[source] serde_json::Error),
    #[error("line {line}: malformed manifest file entry: {source}")]
    ManifestFile {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed arn {0:?}")]
    Arn(String),
    #[error("invalid file trigger: {0}")]
    InvalidTrigger(String),
}

/// A typed-value wrapper with its type tag stripped.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Null,
    String(String),
    Number(String),
    Bool(bool),
    /// Maps, lists and sets are kept as raw JSON.
    Nested(JsonValue),
}

impl AttributeValue {
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::String(s) | Self::Number(s) => Some(s.clone()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Nested(value) => Some(value.to_string()),
        }
    }

    /// Integer coercion; anything unparseable is null.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::String(s) | Self::Number(s) => parse_integer(s),
            _ => None,
        }
    }

    /// Strict: only boolean-tagged values qualify.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Epoch seconds -> UTC timestamp.
    pub fn as_epoch_seconds(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::String(s) | Self::Number(s) => {
                let secs: f64 = s.trim().parse().ok()?;
                from_epoch_millis_f64(secs * 1000.0)
            }
            _ => None,
        }
    }
}

fn parse_integer(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<i64>() {
        return Some(value);
    }
    let value: f64 = raw.parse().ok()?;
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

fn from_epoch_millis_f64(millis: f64) -> Option<DateTime<Utc>> {
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }
    from_epoch_millis(millis.round() as i64)
}

/// Timestamps outside years 0..=9999 have no `YYYYMMDD` date key and read as null.
fn from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).filter(|at| (0..=9999).contains(&at.year()))
}

/// Epoch milliseconds (number or numeric string) -> UTC timestamp.
pub fn parse_epoch_millis(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => match n.as_i64() {
            Some(ms) => from_epoch_millis(ms),
            None => from_epoch_millis_f64(n.as_f64()?),
        },
        JsonValue::String(s) => from_epoch_millis_f64(s.trim().parse().ok()?),
        _ => None,
    }
}

/// Drops the single type tag of a wrapper such as `{"N": "9999"}`.
pub fn unwrap_typed_value(value: &JsonValue) -> AttributeValue {
    match value {
        JsonValue::Object(map) if map.len() == 1 => {
            let Some((tag, inner)) = map.iter().next() else {
                return AttributeValue::Null;
            };
            match (tag.as_str(), inner) {
                ("S", JsonValue::String(s)) => AttributeValue::String(s.clone()),
                ("N", JsonValue::String(s)) => AttributeValue::Number(s.clone()),
                ("N", JsonValue::Number(n)) => AttributeValue::Number(n.to_string()),
                ("BOOL", JsonValue::Bool(b)) => AttributeValue::Bool(*b),
                ("NULL", _) => AttributeValue::Null,
                (_, inner) => AttributeValue::Nested(inner.clone()),
            }
        }
        JsonValue::Null => AttributeValue::Null,
        JsonValue::String(s) => AttributeValue::String(s.clone()),
        JsonValue::Number(n) => AttributeValue::Number(n.to_string()),
        JsonValue::Bool(b) => AttributeValue::Bool(*b),
        other => AttributeValue::Nested(other.clone()),
    }
}

fn is_reserved_column(name: &str) -> bool {
    name == EXPORT_ID_COLUMN || CDC_METADATA_COLUMNS.contains(&name)
}

/// Flattens one record image into typed known fields plus extras.
pub fn clean_attributes(image: &AttributeMap) -> RecordFields {
    let mut fields = RecordFields::default();
    for (raw_name, raw_value) in image {
        let column = normalize_column_name(raw_name);
        let value = unwrap_typed_value(raw_value);
        match column.as_str() {
            "company_id" => fields.company_id = value.as_i64(),
            "shop_id" => fields.shop_id = value.as_text(),
            "is_delete" => fields.is_delete = value.as_bool(),
            "user_id" => fields.user_id = value.as_i64(),
            "platform_name" => {
                let code = value.as_text();
                fields.platform_name = code.as_deref().and_then(Platform::from_source_code);
                if fields.platform_name.is_none() {
                    debug!(code = ?code, "unmapped platform code");
                }
            }
            "platform_info" => fields.platform_info = value.as_text(),
            "expired_at" => fields.expired_at = value.as_epoch_seconds(),
            "payment_channel_id" => fields.payment_channel_id = value.as_i64(),
            "created_at" => fields.created_at = value.as_epoch_seconds(),
            "expires_in" => fields.expires_in = value.as_i64(),
            "is_vat" => fields.is_vat = value.as_bool(),
            "payload" => fields.payload = value.as_text(),
            "guid" => fields.guid = value.as_text(),
            "refresh_expires_in" => fields.refresh_expires_in = value.as_i64(),
            "updated_at" => fields.updated_at = value.as_epoch_seconds(),
            "refresh_token" => fields.refresh_token = value.as_text(),
            "remarks" => fields.remarks = value.as_text(),
            "access_token" => fields.access_token = value.as_text(),
            other if is_reserved_column(other) => {
                warn!(attribute = %raw_name, "record attribute shadows a metadata column; dropped");
            }
            _ => {
                fields.extras.insert(column.clone(), value.as_text());
            }
        }
    }
    fields
}

/// Image representing the record's current state for this event.
///
/// INSERT/MODIFY prefer the new image, everything else the old one; either
/// falls back to whichever image is present.
pub fn select_image(event: &ChangeEvent) -> Option<&AttributeMap> {
    let record = &event.dynamodb;
    let prefers_new = event
        .event_name
        .as_ref()
        .is_some_and(EventName::prefers_new_image);
    let (preferred, fallback) = if prefers_new {
        (record.new_image.as_ref(), record.old_image.as_ref())
    } else {
        (record.old_image.as_ref(), record.new_image.as_ref())
    };
    preferred.or(fallback)
}

pub fn clean_change_event(event: &ChangeEvent) -> CleanRecord {
    let created = event
        .dynamodb
        .approximate_creation_date_time
        .as_ref()
        .and_then(parse_epoch_millis);
    CleanRecord {
        year: created.map(|at| at.year()),
        month: created.map(|at| at.month()),
        event_id: event.event_id.clone(),
        event_name: event.event_name.clone(),
        table_name: event.table_name.clone(),
        approximate_creation_date_time: created,
        fields: select_image(event).map(clean_attributes).unwrap_or_default(),
    }
}

/// CDC batch -> typed table. An empty batch yields an empty table that still
/// carries the full known column set.
pub fn flatten(events: &[ChangeEvent]) -> CleanTable {
    CleanTable {
        rows: events.iter().map(clean_change_event).collect(),
    }
}

/// Parses a JSON-lines CDC object; blank lines are ignored.
pub fn parse_change_events(text: &str) -> Result<Vec<ChangeEvent>, CleanError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| CleanError::MalformedEvent {
                line: idx + 1,
                source,
            })
        })
        .collect()
}

/// Table export summary, read camelCase and written snake_case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
pub struct ManifestSummary {
    #[serde(default)]
    pub version: Option<String>,
    pub export_arn: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub table_arn: String,
    pub export_time: DateTime<Utc>,
    #[serde(default)]
    pub s3_bucket: Option<String>,
    #[serde(default)]
    pub s3_prefix: Option<String>,
    #[serde(default)]
    pub s3_sse_algorithm: Option<String>,
    #[serde(default)]
    pub s3_sse_kms_key_id: Option<String>,
    pub manifest_files_s3_key: String,
    #[serde(default)]
    pub billed_size_bytes: Option<i64>,
    #[serde(default)]
    pub item_count: Option<i64>,
    #[serde(default)]
    pub output_format: Option<String>,
    #[serde(default, skip_deserializing)]
    pub export_id: String,
    #[serde(default, skip_deserializing)]
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
pub struct ManifestFile {
    pub item_count: i64,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    pub data_file_s3_key: String,
    #[serde(default, skip_deserializing)]
    pub export_id: String,
}

fn last_arn_segment(arn: &str) -> Result<String, CleanError> {
    match arn.rsplit_once('/') {
        Some((_, tail)) if !tail.is_empty() => Ok(tail.to_string()),
        _ => Err(CleanError::Arn(arn.to_string())),
    }
}

/// Rejects triggers that are not the export's summary object.
pub fn require_manifest_summary_key(key: &str) -> Result<(), CleanError> {
    if key.rsplit('/').next() == Some(MANIFEST_SUMMARY_FILE) {
        Ok(())
    } else {
        Err(CleanError::InvalidTrigger(key.to_string()))
    }
}

pub fn clean_manifest_summary(text: &str) -> Result<ManifestSummary, CleanError> {
    let mut summary: ManifestSummary =
        serde_json::from_str(text).map_err(CleanError::ManifestSummary)?;
    summary.export_id = last_arn_segment(&summary.export_arn)?;
    summary.table = last_arn_segment(&summary.table_arn)?;
    Ok(summary)
}

pub fn clean_manifest_files(text: &str, export_id: &str) -> Result<Vec<ManifestFile>, CleanError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            let mut file: ManifestFile =
                serde_json::from_str(line).map_err(|source| CleanError::ManifestFile {
                    line: idx + 1,
                    source,
                })?;
            file.export_id = export_id.to_string();
            Ok(file)
        })
        .collect()
}

/// Parses one exported data file: JSON lines of `{"Item": {attr: typed-value}}`.
pub fn clean_exported_items(text: &str) -> Result<Vec<RecordFields>, CleanError> {
    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let malformed = |reason: String| CleanError::MalformedItem {
            line: idx + 1,
            reason,
        };
        let value: JsonValue = serde_json::from_str(line).map_err(|err| malformed(err.to_string()))?;
        let item = value
            .get("Item")
            .and_then(JsonValue::as_object)
            .ok_or_else(|| malformed("missing Item object".to_string()))?;
        rows.push(clean_attributes(item));
    }
    Ok(rows)
}
