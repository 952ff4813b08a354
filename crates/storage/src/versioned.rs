use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::database::{Database, Row, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to encode value for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// A raw record as persisted, for inspection tooling.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    pub key: String,
    pub schema_version: u32,
    pub value: serde_json::Value,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Key/value records tagged with the schema version they were written with.
///
/// Reads name the schema version they understand. A record written under any
/// other version is a miss, so callers fall back to defaults instead of
/// misinterpreting stale data.
pub struct VersionedStore<D: Database> {
    db: Arc<D>,
}

impl<D: Database> Clone for VersionedStore<D> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
        }
    }
}

impl<D: Database> VersionedStore<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<D> {
        &self.db
    }

    /// Persist `value` under `key`, replacing whatever was there.
    pub async fn set<T>(&self, key: &str, value: &T, schema_version: u32) -> Result<(), StoreError>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_json::to_string(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;

        self.db
            .execute(
                "INSERT INTO versioned_records (key, schema_version, value, updated_at) \
                 VALUES (?1, ?2, ?3, strftime('%Y-%m-%dT%H:%M:%SZ', 'now')) \
                 ON CONFLICT (key) DO UPDATE SET \
                 schema_version = excluded.schema_version, \
                 value = excluded.value, \
                 updated_at = excluded.updated_at",
                &[&key, &schema_version, &encoded],
            )
            .await?;

        debug!(key, schema_version, "stored versioned record");
        Ok(())
    }

    /// The value under `key` if it was written with `expected_schema_version`.
    pub async fn get<T>(&self, key: &str, expected_schema_version: u32) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned,
    {
        let rows: Vec<Row> = self
            .db
            .query(
                "SELECT schema_version, value FROM versioned_records WHERE key = ?1",
                &[&key],
            )
            .await?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let stored_version = row.integer(0);
        if stored_version != Some(i64::from(expected_schema_version)) {
            debug!(
                key,
                expected = expected_schema_version,
                stored = ?stored_version,
                "schema version mismatch, treating as absent"
            );
            return Ok(None);
        }

        let Some(raw) = row.text(1) else {
            warn!(key, "versioned record has no text payload");
            return Ok(None);
        };

        match serde_json::from_str(raw) {
            Ok(value) => Ok(Some(value)),
            Err(error) => {
                warn!(key, %error, "versioned record does not decode, treating as absent");
                Ok(None)
            }
        }
    }

    /// Delete the record under `key`. Returns whether anything was removed.
    pub async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let affected = self
            .db
            .execute("DELETE FROM versioned_records WHERE key = ?1", &[&key])
            .await?;
        Ok(affected > 0)
    }

    /// Every record whose key starts with `prefix`, ordered by key.
    pub async fn records_with_prefix(&self, prefix: &str) -> Result<Vec<VersionedRecord>, StoreError> {
        let pattern = format!("{}%", escape_like(prefix));
        let rows: Vec<Row> = self
            .db
            .query(
                "SELECT key, schema_version, value, updated_at FROM versioned_records \
                 WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
                &[&pattern],
            )
            .await?;

        Ok(rows.iter().filter_map(record_from_row).collect())
    }
}

fn record_from_row(row: &Row) -> Option<VersionedRecord> {
    let key = row.text(0)?.to_string();
    let schema_version = u32::try_from(row.integer(1)?).ok()?;
    let value = serde_json::from_str(row.text(2)?).unwrap_or(serde_json::Value::Null);
    let updated_at = row
        .text(3)
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|timestamp| timestamp.with_timezone(&Utc));

    Some(VersionedRecord {
        key,
        schema_version,
        value,
        updated_at,
    })
}

fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
