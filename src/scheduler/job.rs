use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SchedulerError};

/// Lifecycle of a job. `Terminated` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Computing,
    Terminated,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Computing => "COMPUTING",
            JobStatus::Terminated => "TERMINATED",
            JobStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Terminated | JobStatus::Error)
    }

    /// Whether a save may move a record from `self` to `next`.
    ///
    /// Re-saving the same status is always allowed. The only backward move,
    /// COMPUTING to QUEUED, belongs to startup recovery and never goes
    /// through here.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            JobStatus::Queued => true,
            JobStatus::Computing => next.is_terminal(),
            JobStatus::Terminated | JobStatus::Error => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "COMPUTING" => Ok(JobStatus::Computing),
            "TERMINATED" => Ok(JobStatus::Terminated),
            "ERROR" => Ok(JobStatus::Error),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A job as exchanged between the store, the scheduler and workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    pub created: i64,
    #[serde(default)]
    pub claimed_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
    pub status: JobStatus,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    #[serde(default, with = "b64::option")]
    pub result: Option<Vec<u8>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl JobRecord {
    /// A fresh QUEUED record whose id is derived from `payload`.
    pub fn new(payload: Vec<u8>, version: Option<String>, created: i64) -> Self {
        Self {
            id: job_id_for(&payload),
            version,
            created,
            claimed_at: None,
            finished_at: None,
            status: JobStatus::Queued,
            payload,
            result: None,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the job as successfully computed.
    pub fn complete(mut self, result: Vec<u8>) -> Self {
        self.status = JobStatus::Terminated;
        self.result = Some(result);
        self.error_message = None;
        self
    }

    /// Mark the job as failed. An empty message is replaced so that ERROR
    /// records always explain themselves.
    pub fn fail(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.status = JobStatus::Error;
        self.result = None;
        self.error_message = Some(if message.trim().is_empty() {
            "computation failed without a message".to_string()
        } else {
            message
        });
        self
    }

    /// Check the field invariants tied to `status`.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_job_id(&self.id) {
            return Err(SchedulerError::InvalidRecord(format!(
                "malformed job id: {:?}",
                self.id
            )));
        }
        let has_message = self
            .error_message
            .as_deref()
            .is_some_and(|m| !m.is_empty());

        match self.status {
            JobStatus::Terminated if self.result.is_none() => Err(SchedulerError::InvalidRecord(
                format!("job {} is TERMINATED without a result", self.id),
            )),
            JobStatus::Error if !has_message => Err(SchedulerError::InvalidRecord(format!(
                "job {} is ERROR without a message",
                self.id
            ))),
            JobStatus::Error if self.result.is_some() => Err(SchedulerError::InvalidRecord(
                format!("job {} is ERROR but carries a result", self.id),
            )),
            JobStatus::Queued | JobStatus::Computing | JobStatus::Terminated if has_message => {
                Err(SchedulerError::InvalidRecord(format!(
                    "job {} is {} but carries an error message",
                    self.id, self.status
                )))
            }
            JobStatus::Queued | JobStatus::Computing if self.result.is_some() => {
                Err(SchedulerError::InvalidRecord(format!(
                    "job {} is {} but carries a result",
                    self.id, self.status
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Content address of a payload: lowercase hex SHA-256.
pub fn job_id_for(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Ids are exactly 64 lowercase hex characters.
pub fn is_valid_job_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Base64 (standard alphabet) encoding for opaque byte fields on the wire.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            let encoded: Option<String> = Option::deserialize(deserializer)?;
            encoded
                .map(|e| STANDARD.decode(e.as_bytes()).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
