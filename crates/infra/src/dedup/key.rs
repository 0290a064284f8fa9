//! Idempotency keys.

use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Bumped whenever the digest input format changes, so entries written by an
/// older format are never mistaken for current ones.
pub const KEY_FORMAT_VERSION: &str = "v1";

/// Deterministic fingerprint of a job: type, canonical arguments, scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    job_type: String,
    digest: String,
}

impl IdempotencyKey {
    /// Derive the key for a job.
    ///
    /// Object keys inside `args` are sorted recursively before hashing, so
    /// keyword-style arguments built in different orders yield the same key.
    pub fn derive(job_type: &str, args: &Value, scope: Option<&str>) -> Self {
        let mut canonical = String::new();
        write_canonical(args, &mut canonical);

        let mut hasher = Sha256::new();
        hasher.update(job_type.as_bytes());
        hasher.update(b":");
        hasher.update(canonical.as_bytes());
        if let Some(scope) = scope {
            hasher.update(b":");
            hasher.update(scope.as_bytes());
        }

        Self {
            job_type: job_type.to_string(),
            digest: hex::encode(hasher.finalize()),
        }
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Hex SHA-256 digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Key under which the deduplication entry lives in the coordination store.
    pub fn storage_key(&self, namespace: &str) -> String {
        format!(
            "{}:duplicate:{}:{}:{}",
            namespace, KEY_FORMAT_VERSION, self.job_type, self.digest
        )
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.job_type, self.digest)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));

            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Strings serialize infallibly.
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
