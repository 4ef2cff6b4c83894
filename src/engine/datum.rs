use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One stored entry, as written to its file.
///
/// `value` distinguishes a missing payload (`None`, the field is omitted on disk) from a
/// stored JSON `null` (`Some(Value::Null)`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Datum {
    /// Empty when the file on disk carries no key.
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub value: Option<Value>,
    /// Absolute expiry instant in milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

// A present field always deserializes to `Some`, even when it holds `null`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Datum {
    pub fn new(key: &str, value: Option<Value>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.to_string(),
            value,
            ttl: ttl.map(|ttl| now_millis().saturating_add(saturating_millis(ttl))),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.ttl, Some(expires_at) if expires_at <= now)
    }
}

/// Acknowledgment of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub file: PathBuf,
    /// Size of the serialized datum.
    pub bytes: usize,
}

/// Acknowledgment of a deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResult {
    pub file: PathBuf,
    /// The entry file was present before the call.
    pub existed: bool,
    pub removed: bool,
}

fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(saturating_millis)
        .unwrap_or_default()
}
