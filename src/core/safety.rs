//! Safety policy for generated SQL.
//!
//! Rejects any statement containing a mutating keyword as a whole word.
//! Matching is a single left-to-right scan over identifier-like tokens, so a
//! column such as `updated_at` never matches `UPDATE`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Keywords rejected by the default policy
pub const FORBIDDEN_KEYWORDS: [&str; 8] = [
    "DROP", "DELETE", "TRUNCATE", "UPDATE", "INSERT", "ALTER", "GRANT", "REVOKE",
];

/// Denylist policy for candidate SQL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlSafetyPolicy {
    /// Keywords that make a statement unsafe (case-insensitive, whole word)
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
}

fn default_denylist() -> Vec<String> {
    FORBIDDEN_KEYWORDS.iter().map(|k| k.to_string()).collect()
}

impl Default for SqlSafetyPolicy {
    fn default() -> Self {
        Self {
            denylist: default_denylist(),
        }
    }
}

impl SqlSafetyPolicy {
    /// Check a statement, returning the first violation found
    pub fn check(&self, sql: &str) -> Result<(), SafetyViolation> {
        if sql.trim().is_empty() {
            return Err(SafetyViolation::Empty);
        }

        for word in words(sql) {
            if let Some(keyword) = self
                .denylist
                .iter()
                .find(|keyword| keyword.eq_ignore_ascii_case(word))
            {
                return Err(SafetyViolation::ForbiddenKeyword {
                    keyword: keyword.to_ascii_uppercase(),
                });
            }
        }

        Ok(())
    }

    /// Validate a statement as an (accepted, reason) verdict
    pub fn validate(&self, sql: &str) -> SafetyVerdict {
        match self.check(sql) {
            Ok(()) => SafetyVerdict {
                accepted: true,
                reason: None,
            },
            Err(violation) => SafetyVerdict {
                accepted: false,
                reason: Some(violation.to_string()),
            },
        }
    }
}

/// Validate against the default denylist
pub fn validate(sql: &str) -> SafetyVerdict {
    SqlSafetyPolicy::default().validate(sql)
}

/// Result of running the safety policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub accepted: bool,
    pub reason: Option<String>,
}

/// Why a statement was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("No SQL query was generated.")]
    Empty,

    #[error("SQL query contains forbidden keyword: {keyword}. Only read-only queries are allowed.")]
    ForbiddenKeyword { keyword: String },
}

/// Split into identifier-like words (letters, digits, `_`, `$`)
fn words(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
        .filter(|word| !word.is_empty())
}

/// Short stable fingerprint of a statement (first 16 hex chars of SHA-256)
pub fn fingerprint(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.trim().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}
