//! Job records: one row per uploaded photo, keyed by a client-generated id.

use crate::storage::Bucket;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use thiserror::Error;

/// Longest accepted job id
pub const MAX_JOB_ID_LEN: usize = 64;

/// Rejected job id
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Invalid job id {0:?}: expected 1-64 characters of [A-Za-z0-9_-]")]
pub struct InvalidJobId(pub String);

/// Client-generated job identifier.
///
/// The id doubles as a storage key component, so only ASCII alphanumerics,
/// `-` and `_` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct JobId(String);

impl JobId {
    /// Validate and wrap a raw id
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidJobId> {
        let raw = raw.into();
        let valid_len = !raw.is_empty() && raw.len() <= MAX_JOB_ID_LEN;
        let valid_chars = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

        if valid_len && valid_chars {
            Ok(Self(raw))
        } else {
            Err(InvalidJobId(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Processing state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "job_state", rename_all = "snake_case")]
pub enum JobState {
    /// Input registered, never attempted
    Created,
    /// An attempt holds the job
    Processing,
    /// Output (and preview, when enabled) committed
    OutputReady,
    /// Last attempt failed; the next process call retries
    Failed,
}

/// Payment reconciliation status of the latest charge intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "charge_status", rename_all = "snake_case")]
pub enum ChargeStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Location of a blob in one of the three buckets
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobRef {
    pub bucket: Bucket,
    pub key: String,
}

/// Stored job record
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Job {
    /// Client-generated id, immutable
    pub job_id: JobId,
    /// Key of the original upload in the input bucket
    pub input_key: String,
    /// MIME type recorded at upload time
    pub input_content_type: String,
    /// Key of the full-resolution result in the output bucket
    pub output_key: Option<String>,
    /// Key of the watermarked preview in the preview bucket
    pub preview_key: Option<String>,
    /// Owning identity; null until claimed in cookie-only flows
    pub owner_id: Option<String>,
    pub state: JobState,
    /// Last failure description
    pub error_message: Option<String>,
    /// Number of processing attempts claimed so far
    pub attempts: i32,
    /// Start of the attempt currently holding the job
    pub processing_started_at: Option<DateTime<Utc>>,
    pub purchased: bool,
    pub charge_intent_id: Option<String>,
    pub charge_status: Option<ChargeStatus>,
    /// Charged amount in minor currency units
    pub charge_amount: Option<i64>,
    pub purchased_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn input_ref(&self) -> BlobRef {
        BlobRef {
            bucket: Bucket::Input,
            key: self.input_key.clone(),
        }
    }

    pub fn output_ref(&self) -> Option<BlobRef> {
        self.output_key.as_ref().map(|key| BlobRef {
            bucket: Bucket::Output,
            key: key.clone(),
        })
    }

    pub fn preview_ref(&self) -> Option<BlobRef> {
        self.preview_key.as_ref().map(|key| BlobRef {
            bucket: Bucket::Preview,
            key: key.clone(),
        })
    }

    pub fn is_output_ready(&self) -> bool {
        self.state == JobState::OutputReady && self.output_key.is_some()
    }
}

/// Values needed to register a job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: JobId,
    pub input_key: String,
    pub input_content_type: String,
    pub owner_id: Option<String>,
}

/// Refs committed by a successful attempt, written together
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedAttempt {
    pub output_key: String,
    pub preview_key: Option<String>,
}

/// Outstanding anonymous-to-authenticated migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct MigrationMarker {
    pub from_owner: String,
    pub to_owner: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_accepts_uuid_and_short_ids() {
        assert!(JobId::parse("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(JobId::parse("abc").is_ok());
        assert!(JobId::parse("new_job-2").is_ok());
    }

    #[test]
    fn test_job_id_rejects_bad_shapes() {
        assert!(JobId::parse("").is_err());
        assert!(JobId::parse("../etc/passwd").is_err());
        assert!(JobId::parse("has space").is_err());
        assert!(JobId::parse("a.png").is_err());
        assert!(JobId::parse("x".repeat(MAX_JOB_ID_LEN + 1)).is_err());
        assert!(JobId::parse("x".repeat(MAX_JOB_ID_LEN)).is_ok());
    }

    #[test]
    fn test_job_state_serializes_snake_case() {
        let json = serde_json::to_string(&JobState::OutputReady).unwrap();
        assert_eq!(json, "\"output_ready\"");
    }
}
