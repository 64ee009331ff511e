//! Core domain model for the open-platform connection status pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub const CRATE_NAME: &str = "opstat-core";

/// Attribute name -> single-key typed-value wrapper (`{"N": "9999"}`, `{"S": "0"}`, ...).
pub type AttributeMap = JsonMap<String, JsonValue>;

/// Natural key -> surrogate key for the company dimension.
pub type DimensionMapping = BTreeMap<i64, i64>;

/// Splits an identifier at ASCII uppercase boundaries and joins the lower-cased
/// segments with `_`.
///
/// Every uppercase letter opens a new segment, so runs of capitals become
/// one-letter segments (`eventID` -> `event_i_d`). A leading capital opens the
/// first segment rather than an empty one (`PascalCase` -> `pascal_case`).
/// Downstream column names depend on this exact segmentation.
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (idx, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() && idx > 0 {
            out.push('_');
        }
        out.push(ch);
    }
    out.to_lowercase()
}

/// Lower-cases the first character when it is uppercase (`NewImage` -> `newImage`).
pub fn lower_first(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_uppercase() => first.to_lowercase().chain(chars).collect(),
        _ => name.to_string(),
    }
}

/// Column name for a raw source attribute: casing fix, then snake case.
pub fn normalize_column_name(name: &str) -> String {
    to_snake_case(&lower_first(name))
}

/// CDC event kind. Only `Insert` and `Remove` are valid connection transitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventName {
    Insert,
    Modify,
    Remove,
    Other(String),
}

impl EventName {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "INSERT" => Self::Insert,
            "MODIFY" => Self::Modify,
            "REMOVE" => Self::Remove,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "INSERT",
            Self::Modify => "MODIFY",
            Self::Remove => "REMOVE",
            Self::Other(raw) => raw,
        }
    }

    /// INSERT -> connected, REMOVE -> disconnected, anything else is not a transition.
    pub fn connection_status(&self) -> Option<bool> {
        match self {
            Self::Insert => Some(true),
            Self::Remove => Some(false),
            _ => None,
        }
    }

    pub fn prefers_new_image(&self) -> bool {
        matches!(self, Self::Insert | Self::Modify)
    }
}

impl From<String> for EventName {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<EventName> for String {
    fn from(name: EventName) -> Self {
        name.as_str().to_string()
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Third-party sales platform a company can connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Platform {
    Lazada,
    Shopee,
    KCash,
    FoodStory,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Lazada,
        Platform::Shopee,
        Platform::KCash,
        Platform::FoodStory,
    ];

    /// Platforms the source store currently emits codes for.
    pub const WITH_SOURCE_CODE: [Platform; 2] = [Platform::Lazada, Platform::Shopee];

    /// Maps a raw `platformName` code from the source store. Unknown codes are unmapped.
    pub fn from_source_code(code: &str) -> Option<Self> {
        match code {
            "lazada" => Some(Self::Lazada),
            "shopee" => Some(Self::Shopee),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Lazada => "Lazada",
            Self::Shopee => "Shopee",
            Self::KCash => "K-Cash",
            Self::FoodStory => "FoodStory",
        }
    }

    pub fn from_display_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.display_name() == name)
    }

    /// CRM company property holding this platform's connection flag.
    pub fn crm_property(self) -> &'static str {
        match self {
            Self::Lazada => "lazada_api",
            Self::Shopee => "shopee_api",
            Self::KCash => "k_cash_connect_api",
            Self::FoodStory => "foodstory_api",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// One CDC notification as delivered by the source store's stream.
///
/// Envelope fields of the wrong JSON type read as null instead of failing the batch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangeEvent {
    #[serde(deserialize_with = "lenient_string")]
    pub aws_region: Option<String>,
    #[serde(rename = "eventID", deserialize_with = "lenient_string")]
    pub event_id: Option<String>,
    #[serde(deserialize_with = "lenient_event_name")]
    pub event_name: Option<EventName>,
    pub user_identity: Option<JsonValue>,
    #[serde(deserialize_with = "lenient_string")]
    pub record_format: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub table_name: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub event_source: Option<String>,
    #[serde(deserialize_with = "lenient_stream_record")]
    pub dynamodb: StreamRecord,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StreamRecord {
    /// Epoch milliseconds; kept raw so malformed values coerce to null.
    pub approximate_creation_date_time: Option<JsonValue>,
    #[serde(deserialize_with = "lenient_map")]
    pub keys: Option<AttributeMap>,
    #[serde(deserialize_with = "lenient_map")]
    pub new_image: Option<AttributeMap>,
    #[serde(deserialize_with = "lenient_map")]
    pub old_image: Option<AttributeMap>,
    #[serde(deserialize_with = "lenient_u64")]
    pub size_bytes: Option<u64>,
}

/// Strings pass through, numbers and booleans keep their JSON text.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn lenient_event_name<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<EventName>, D::Error> {
    Ok(lenient_string(deserializer)?.map(EventName::from))
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_map<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<AttributeMap>, D::Error> {
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Object(map) => Some(map),
        _ => None,
    })
}

fn lenient_stream_record<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StreamRecord, D::Error> {
    let value = JsonValue::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Typed known columns of a source record plus whatever else the record carried.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordFields {
    pub company_id: Option<i64>,
    pub shop_id: Option<String>,
    pub is_delete: Option<bool>,
    pub user_id: Option<i64>,
    pub platform_name: Option<Platform>,
    pub platform_info: Option<String>,
    pub expired_at: Option<DateTime<Utc>>,
    pub payment_channel_id: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_in: Option<i64>,
    pub is_vat: Option<bool>,
    pub payload: Option<String>,
    pub guid: Option<String>,
    pub refresh_expires_in: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
    pub remarks: Option<String>,
    pub access_token: Option<String>,
    /// Attributes outside the known set, keyed by normalized column name.
    pub extras: BTreeMap<String, Option<String>>,
}

/// Known record columns in output order.
pub const RECORD_COLUMNS: [&str; 18] = [
    "company_id",
    "shop_id",
    "is_delete",
    "user_id",
    "platform_name",
    "platform_info",
    "expired_at",
    "payment_channel_id",
    "created_at",
    "expires_in",
    "is_vat",
    "payload",
    "guid",
    "refresh_expires_in",
    "updated_at",
    "refresh_token",
    "remarks",
    "access_token",
];

/// Partition and CDC metadata columns that precede the record columns.
pub const CDC_METADATA_COLUMNS: [&str; 6] = [
    "year",
    "month",
    "event_id",
    "event_name",
    "table_name",
    "approximate_creation_date_time",
];

/// The guaranteed column set of a cleaned CDC table, in order.
pub fn known_cdc_columns() -> Vec<&'static str> {
    CDC_METADATA_COLUMNS
        .iter()
        .chain(RECORD_COLUMNS.iter())
        .copied()
        .collect()
}

/// One flattened, typed change event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CleanRecord {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub event_id: Option<String>,
    pub event_name: Option<EventName>,
    pub table_name: Option<String>,
    pub approximate_creation_date_time: Option<DateTime<Utc>>,
    pub fields: RecordFields,
}

/// Output of the CDC flattener: typed rows plus the open set of extra columns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CleanTable {
    pub rows: Vec<CleanRecord>,
}

impl CleanTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Extra columns observed across all rows, sorted.
    pub fn extra_columns(&self) -> Vec<String> {
        self.rows
            .iter()
            .flat_map(|row| row.fields.extras.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Known columns followed by observed extras.
    pub fn columns(&self) -> Vec<String> {
        known_cdc_columns()
            .into_iter()
            .map(ToString::to_string)
            .chain(self.extra_columns())
            .collect()
    }
}

/// `YYYYMMDD` as an integer, e.g. 2022-03-08 -> 20220308.
pub fn format_date_key(date: NaiveDate) -> i32 {
    date.year() * 10_000 + date.month() as i32 * 100 + date.day() as i32
}

/// `HMMSS` as an integer with an unpadded hour, e.g. 09:05:08 -> 90508.
pub fn format_time_key(time: NaiveTime) -> i32 {
    time.hour() as i32 * 10_000 + time.minute() as i32 * 100 + time.second() as i32
}

/// `(date_key, time_key)` stamp; ordering is date first, then time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StampKey {
    pub date_key: i32,
    pub time_key: i32,
}

impl StampKey {
    pub fn new(date_key: i32, time_key: i32) -> Self {
        Self { date_key, time_key }
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self {
            date_key: format_date_key(at.date_naive()),
            time_key: format_time_key(at.time()),
        }
    }
}

/// Whether an entity is connected to a platform as of a stamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionStatus<K> {
    pub entity_key: K,
    pub category: Platform,
    pub status: bool,
    pub as_of: StampKey,
}

/// Row of the append-only connection fact table, keyed by company surrogate.
pub type FactRow = ConnectionStatus<i64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_splits_camel_case() {
        assert_eq!(to_snake_case("manifestFilesS3Key"), "manifest_files_s3_key");
        assert_eq!(to_snake_case("companyId"), "company_id");
    }

    #[test]
    fn snake_case_edge_cases() {
        assert_eq!(to_snake_case(""), "");
        assert_eq!(to_snake_case("already_snake"), "already_snake");
        assert_eq!(to_snake_case("PascalCase"), "pascal_case");
        assert_eq!(to_snake_case("eventID"), "event_i_d");
        assert_eq!(to_snake_case("ABC"), "a_b_c");
    }

    #[test]
    fn snake_case_is_idempotent() {
        for input in ["manifestFilesS3Key", "PascalCase", "eventID", "x", "", "a_B_c"] {
            let once = to_snake_case(input);
            assert_eq!(to_snake_case(&once), once, "input {input}");
        }
    }

    #[test]
    fn column_names_fix_leading_capital_first() {
        assert_eq!(normalize_column_name("ApproximateCreationDateTime"), "approximate_creation_date_time");
        assert_eq!(normalize_column_name("isDelete"), "is_delete");
        assert_eq!(lower_first(""), "");
    }

    #[test]
    fn event_names_round_trip_through_strings() {
        let parsed: EventName = serde_json::from_str("\"REMOVE\"").unwrap();
        assert_eq!(parsed, EventName::Remove);
        assert_eq!(EventName::parse("TTL"), EventName::Other("TTL".into()));
        assert_eq!(serde_json::to_string(&EventName::Insert).unwrap(), "\"INSERT\"");
        assert_eq!(EventName::Modify.connection_status(), None);
    }

    #[test]
    fn platform_codes_map_to_display_names() {
        assert_eq!(Platform::from_source_code("lazada"), Some(Platform::Lazada));
        assert_eq!(Platform::from_source_code("kcash"), None);
        assert_eq!(Platform::from_display_name("K-Cash"), Some(Platform::KCash));
        assert_eq!(Platform::FoodStory.crm_property(), "foodstory_api");
    }

    #[test]
    fn date_and_time_keys_match_contract() {
        let date = NaiveDate::from_ymd_opt(2022, 3, 8).unwrap();
        let time = NaiveTime::from_hms_opt(9, 5, 8).unwrap();
        assert_eq!(format_date_key(date), 20220308);
        assert_eq!(format_time_key(time), 90508);
        assert_eq!(format_time_key(NaiveTime::from_hms_opt(0, 0, 7).unwrap()), 7);
        assert_eq!(format_time_key(NaiveTime::from_hms_opt(14, 30, 0).unwrap()), 143000);
    }

    #[test]
    fn stamp_keys_order_by_date_then_time() {
        assert!(StampKey::new(20220308, 235959) < StampKey::new(20220309, 0));
        assert!(StampKey::new(20220308, 90508) < StampKey::new(20220308, 143000));
    }

    #[test]
    fn envelope_tolerates_missing_fields() {
        let event: ChangeEvent = serde_json::from_value(serde_json::json!({
            "eventName": "INSERT",
            "dynamodb": {"NewImage": {"unregistered_column": {"N": "1"}}}
        }))
        .unwrap();
        assert_eq!(event.event_name, Some(EventName::Insert));
        assert!(event.dynamodb.old_image.is_none());
        assert!(event.event_id.is_none());
    }

    #[test]
    fn envelope_fields_of_the_wrong_type_read_leniently() {
        let event: ChangeEvent = serde_json::from_value(serde_json::json!({
            "eventID": 42,
            "eventName": ["INSERT"],
            "tableName": 5,
            "recordFormat": {"type": "json"},
            "awsRegion": true,
            "dynamodb": {"SizeBytes": "74", "Keys": "companyId", "NewImage": {"a": {"S": "b"}}}
        }))
        .unwrap();
        assert_eq!(event.event_id.as_deref(), Some("42"));
        assert_eq!(event.event_name, None);
        assert_eq!(event.table_name.as_deref(), Some("5"));
        assert_eq!(event.record_format, None);
        assert_eq!(event.aws_region.as_deref(), Some("true"));
        assert_eq!(event.dynamodb.size_bytes, Some(74));
        assert_eq!(event.dynamodb.keys, None);
        assert!(event.dynamodb.new_image.is_some());

        let event: ChangeEvent =
            serde_json::from_value(serde_json::json!({"eventName": "REMOVE", "dynamodb": "gone"})).unwrap();
        assert_eq!(event.event_name, Some(EventName::Remove));
        assert_eq!(event.dynamodb, StreamRecord::default());
    }

    #[test]
    fn empty_table_still_has_known_columns() {
        let table = CleanTable::default();
        assert_eq!(table.columns().len(), 24);
        assert_eq!(table.columns()[0], "year");
    }
}
