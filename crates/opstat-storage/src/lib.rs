//! Object storage + trigger notification utilities for the pipeline.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "opstat-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("object s3://{bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding object {key}: {reason}")]
    Decode { key: String, reason: String },
    #[error("malformed trigger notification: {0}")]
    Trigger(String),
}

/// Bucket + key pointer to one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub object: ObjectRef,
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Filesystem-backed object store: `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_segment(bucket)?;
        validate_segment(key)?;
        Ok(self.root.join(bucket).join(key))
    }

    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    /// Reads an object as UTF-8 text, transparently gunzipping `.gz` keys.
    pub async fn get_text(&self, bucket: &str, key: &str) -> Result<String, StorageError> {
        let bytes = self.get_object(bucket, key).await?;
        decode_text(key, &bytes)
    }

    /// Store bytes under `bucket/key` with an atomic temp-file rename.
    ///
    /// Rewriting identical content is a no-op reported as `deduplicated`;
    /// different content replaces the object.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
    ) -> Result<StoredObject, StorageError> {
        let content_hash = Self::sha256_hex(bytes);
        let absolute_path = self.object_path(bucket, key)?;
        let stored = |deduplicated| StoredObject {
            object: ObjectRef::new(bucket, key),
            content_hash: content_hash.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .map_err(|source| StorageError::Io {
                path: parent.clone(),
                source,
            })?;

        if let Ok(existing) = fs::read(&absolute_path).await {
            if Self::sha256_hex(&existing) == content_hash {
                debug!(bucket, key, "object unchanged; skipping write");
                return Ok(stored(true));
            }
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StorageError::Io { path, source }
        };

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        file.write_all(bytes).await.map_err(io_err(&temp_path))?;
        file.flush().await.map_err(io_err(&temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io {
                path: absolute_path.clone(),
                source,
            });
        }
        Ok(stored(false))
    }
}

fn validate_segment(key: &str) -> Result<(), StorageError> {
    let invalid = |reason| StorageError::InvalidKey {
        key: key.to_string(),
        reason,
    };
    if key.is_empty() {
        return Err(invalid("empty"));
    }
    let path = Path::new(key);
    if path.is_absolute() {
        return Err(invalid("absolute path"));
    }
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(invalid("must not escape the bucket"));
    }
    Ok(())
}

pub fn decode_text(key: &str, bytes: &[u8]) -> Result<String, StorageError> {
    let decode_err = |reason: String| StorageError::Decode {
        key: key.to_string(),
        reason,
    };
    if key.ends_with(".gz") {
        let mut text = String::new();
        GzDecoder::new(bytes)
            .read_to_string(&mut text)
            .map_err(|err| decode_err(err.to_string()))?;
        Ok(text)
    } else {
        String::from_utf8(bytes.to_vec()).map_err(|err| decode_err(err.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct S3Event {
    #[serde(rename = "Records")]
    records: Vec<S3EventRecord>,
}

#[derive(Debug, Deserialize)]
struct S3EventRecord {
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
}

#[derive(Debug, Deserialize)]
struct SnsEvent {
    #[serde(rename = "Records")]
    records: Vec<SnsEventRecord>,
}

#[derive(Debug, Deserialize)]
struct SnsEventRecord {
    #[serde(rename = "Sns")]
    sns: SnsMessage,
}

#[derive(Debug, Deserialize)]
struct SnsMessage {
    #[serde(rename = "Message")]
    message: String,
}

/// Decodes a notification object key (`+` is a space, `%xx` escapes).
pub fn decode_object_key(raw: &str) -> String {
    // Notification keys are form-encoded, so `&` and `=` arrive escaped and the
    // whole key parses as a single name.
    url::form_urlencoded::parse(raw.as_bytes())
        .next()
        .map(|(name, _)| name.into_owned())
        .unwrap_or_default()
}

/// First object referenced by an object-created notification.
pub fn parse_s3_event(value: &JsonValue) -> Result<ObjectRef, StorageError> {
    let event: S3Event = serde_json::from_value(value.clone())
        .map_err(|err| StorageError::Trigger(err.to_string()))?;
    let record = event
        .records
        .into_iter()
        .next()
        .ok_or_else(|| StorageError::Trigger("no records".to_string()))?;
    Ok(ObjectRef {
        bucket: record.s3.bucket.name,
        key: decode_object_key(&record.s3.object.key),
    })
}

/// Object-created notification relayed through a topic, with the S3 event as a JSON string.
pub fn parse_sns_wrapped_s3_event(value: &JsonValue) -> Result<ObjectRef, StorageError> {
    let event: SnsEvent = serde_json::from_value(value.clone())
        .map_err(|err| StorageError::Trigger(err.to_string()))?;
    let record = event
        .records
        .into_iter()
        .next()
        .ok_or_else(|| StorageError::Trigger("no records".to_string()))?;
    let inner: JsonValue = serde_json::from_str(&record.sns.message)
        .map_err(|err| StorageError::Trigger(format!("sns message is not json: {err}")))?;
    parse_s3_event(&inner)
}

/// Accepts either a direct or topic-relayed object-created notification.
pub fn parse_trigger(value: &JsonValue) -> Result<ObjectRef, StorageError> {
    if value.pointer("/Records/0/Sns").is_some() {
        parse_sns_wrapped_s3_event(value)
    } else {
        parse_s3_event(value)
    }
}
