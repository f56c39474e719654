// Validated Types
// Strongly-typed wrappers that enforce invariants at construction time.
// These types cannot be built from invalid data, which keeps the service
// layer free of defensive re-validation.

use anyhow::{ensure, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A stable entity identifier.
///
/// # Invariants
/// - Non-empty after trimming
/// - No NUL bytes
/// - Length <= 512 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId {
    inner: String,
}

impl EntityId {
    const MAX_LENGTH: usize = 512;

    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        ensure!(!trimmed.is_empty(), "Entity id cannot be empty");
        ensure!(!trimmed.contains('\0'), "Entity id cannot contain NUL");
        ensure!(
            trimmed.len() <= Self::MAX_LENGTH,
            "Entity id exceeds maximum length of {} bytes",
            Self::MAX_LENGTH
        );
        Ok(Self {
            inner: trimmed.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A repository-relative path that has been validated.
///
/// # Invariants
/// - Non-empty
/// - No directory traversal (`..`)
/// - No NUL bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoPath {
    inner: String,
}

impl RepoPath {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        ensure!(!path.is_empty(), "Path cannot be empty");
        ensure!(!path.contains('\0'), "Path cannot contain NUL");
        ensure!(
            !path.split(['/', '\\']).any(|seg| seg == ".."),
            "Path cannot contain directory traversal"
        );
        // Normalize Windows separators so index keys are stable
        let normalized = path.replace('\\', "/");
        Ok(Self { inner: normalized })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// File extension without the leading dot, if any.
    pub fn extension(&self) -> Option<&str> {
        let name = self.inner.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() {
            None
        } else {
            Some(ext)
        }
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A query limit guaranteed to be within sane bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidatedLimit {
    inner: usize,
}

impl ValidatedLimit {
    const MAX: usize = 10_000;

    pub fn new(limit: usize) -> Result<Self> {
        ensure!(limit > 0, "Limit must be positive");
        ensure!(limit <= Self::MAX, "Limit exceeds maximum of {}", Self::MAX);
        Ok(Self { inner: limit })
    }

    pub fn get(&self) -> usize {
        self.inner
    }
}

impl Default for ValidatedLimit {
    fn default() -> Self {
        Self { inner: 10 }
    }
}

/// Correlation identifier grouping all mutations made during one ingestion
/// run. Stamped onto versions and temporal edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSetId {
    inner: Uuid,
}

impl ChangeSetId {
    pub fn new() -> Self {
        Self {
            inner: Uuid::new_v4(),
        }
    }

    pub fn from_uuid(id: Uuid) -> Result<Self> {
        ensure!(!id.is_nil(), "Change set id cannot be nil UUID");
        Ok(Self { inner: id })
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::from_uuid(Uuid::parse_str(s)?)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.inner
    }
}

impl Default for ChangeSetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChangeSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// Paired creation/modification timestamps with the ordering invariant
/// `created <= modified` enforced at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampPair {
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
}

impl TimestampPair {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            created: now,
            modified: now,
        }
    }

    pub fn new(created: DateTime<Utc>, modified: DateTime<Utc>) -> Result<Self> {
        ensure!(
            modified >= created,
            "Modified timestamp must be >= created timestamp"
        );
        Ok(Self { created, modified })
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    /// Bump the modification time, preserving creation time.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.modified {
            self.modified = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_rejects_empty_and_traversal_free_paths_validate() {
        assert!(EntityId::new("").is_err());
        assert!(EntityId::new("   ").is_err());
        assert!(EntityId::new("sym:src/auth.ts#login").is_ok());

        assert!(RepoPath::new("../etc/passwd").is_err());
        assert!(RepoPath::new("src/auth.ts").is_ok());
    }

    #[test]
    fn repo_path_normalizes_separators() {
        let p = RepoPath::new("src\\services\\auth.ts").unwrap();
        assert_eq!(p.as_str(), "src/services/auth.ts");
        assert_eq!(p.extension(), Some("ts"));
    }

    #[test]
    fn dotfiles_have_no_extension() {
        let p = RepoPath::new(".gitignore").unwrap();
        assert_eq!(p.extension(), None);
    }

    #[test]
    fn limit_bounds() {
        assert!(ValidatedLimit::new(0).is_err());
        assert!(ValidatedLimit::new(10_001).is_err());
        assert_eq!(ValidatedLimit::new(25).unwrap().get(), 25);
    }

    #[test]
    fn timestamp_pair_enforces_ordering() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::seconds(5);
        assert!(TimestampPair::new(later, earlier).is_err());
        assert!(TimestampPair::new(earlier, later).is_ok());
    }
}
