//! Document shapes for the `files`, `archives`, `stage` and failure
//! collections (spec.md §3).

use serde::{Deserialize, Serialize};

/// A file record's lifecycle state. Serialized to/from the exact textual
/// forms spec.md §3 names (`new`, `added: <path>`, …) so the on-disk
/// documents stay readable by the original Python tooling's expectations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileState {
    New,
    Added(String),
    Archived(String),
    Verified(String),
    DownloadFailed,
    Failed,
}

impl FileState {
    pub fn container_path(&self) -> Option<&str> {
        match self {
            Self::Added(p) | Self::Archived(p) | Self::Verified(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_locked_incompatible(&self) -> bool {
        // I4: locked(r) => r.state not in {new, verified:*}
        !matches!(self, Self::New | Self::Verified(_))
    }
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Added(p) => write!(f, "added: {p}"),
            Self::Archived(p) => write!(f, "archived: {p}"),
            Self::Verified(p) => write!(f, "verified: {p}"),
            Self::DownloadFailed => write!(f, "download failed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized state string: {0}")]
pub struct StateParseError(pub String);

impl std::str::FromStr for FileState {
    type Err = StateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "new" {
            return Ok(Self::New);
        }
        if s == "download failed" {
            return Ok(Self::DownloadFailed);
        }
        if s == "failed" {
            return Ok(Self::Failed);
        }
        if let Some(rest) = s.strip_prefix("added: ") {
            return Ok(Self::Added(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("archived: ") {
            return Ok(Self::Archived(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("verified: ") {
            return Ok(Self::Verified(rest.to_string()));
        }
        Err(StateParseError(s.to_string()))
    }
}

impl Serialize for FileState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FileState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A `files` collection document, keyed by `pnfsid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub pnfsid: String,
    pub path: String,
    pub parent: String,
    pub size: u64,
    pub ctime: i64,
    pub store: String,
    pub group: String,
    pub hsm_type: String,
    pub hsm_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub localpath: Option<String>,
    pub state: FileState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "archiveUrl")]
    pub archive_url: Option<String>,
}

/// An `archives` collection document, keyed by `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub path: String,
    pub dest_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    New,
    Done,
    Failure,
}

/// A `stage` collection document, keyed by `pnfsid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<bson::oid::ObjectId>,
    pub pnfsid: String,
    pub filepath: String,
    pub locations: Vec<String>,
    pub driver_url: String,
    pub status: StageStatus,
}

impl StageRecord {
    /// Seconds since epoch the record was created, taken from the Mongo
    /// `ObjectId` timestamp (SPEC_FULL.md §3's `requested_at`). Only
    /// meaningful when `id` is set, i.e. once the document round-tripped
    /// through the catalog.
    pub fn requested_at(&self) -> Option<i64> {
        self.id.map(|oid| oid.timestamp().timestamp_millis() / 1000)
    }
}

/// `failures` collection: entries present in a sealed archive but missing
/// from the catalog (spec.md §3, §4.F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    #[serde(rename = "archivePath")]
    pub archive_path: String,
    pub pnfsid: String,
}

/// `archive_failure` collection: duplicate remote archives with divergent
/// digests (spec.md §3, §4.F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveFailureRecord {
    pub pnfsid: String,
    pub location: String,
    pub files: Vec<String>,
}

/// A neutral predicate carrying a regex pattern and its anchoring rule,
/// so the catalog driver (not the caller) owns translating it to the
/// underlying query language (spec.md §9).
#[derive(Debug, Clone)]
pub struct PathPredicate {
    pub pattern: String,
    /// When true, the pattern is anchored with `^` before being matched,
    /// mirroring `^pathPattern` in spec.md §4.E step 1.
    pub anchored: bool,
}

impl PathPredicate {
    pub fn anchored(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            anchored: true,
        }
    }

    pub fn unanchored(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            anchored: false,
        }
    }

    pub fn as_regex_str(&self) -> String {
        if self.anchored && !self.pattern.starts_with('^') {
            format!("^{}", self.pattern)
        } else {
            self.pattern.clone()
        }
    }

    pub fn compile(&self) -> Result<regex::Regex, regex::Error> {
        regex::Regex::new(&self.as_regex_str())
    }
}

/// Selection filter for `ListNewFiles`/`CountNewFiles` (spec.md §4.B).
#[derive(Debug, Clone)]
pub struct NewFileFilter {
    pub path_pattern: Option<PathPredicate>,
    pub group_pattern: Option<PathPredicate>,
    pub store_pattern: Option<PathPredicate>,
    pub ctime_max: Option<i64>,
}

impl NewFileFilter {
    pub fn matches_path(&self, path: &str) -> bool {
        self.path_pattern
            .as_ref()
            .and_then(|p| p.compile().ok())
            .map(|re| re.is_match(path))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_display_and_parse() {
        for state in [
            FileState::New,
            FileState::Added("/c/1".into()),
            FileState::Archived("/c/2".into()),
            FileState::Verified("/c/3".into()),
            FileState::DownloadFailed,
            FileState::Failed,
        ] {
            let s = state.to_string();
            let parsed: FileState = s.parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn locked_state_excludes_new_and_verified() {
        assert!(!FileState::New.is_locked_incompatible());
        assert!(!FileState::Verified("/c/1".into()).is_locked_incompatible());
        assert!(FileState::Added("/c/1".into()).is_locked_incompatible());
        assert!(FileState::Archived("/c/1".into()).is_locked_incompatible());
    }

    #[test]
    fn path_predicate_anchors_by_default() {
        let pred = PathPredicate::anchored("/data/a");
        assert_eq!(pred.as_regex_str(), "^/data/a");
        let compiled = pred.compile().unwrap();
        assert!(compiled.is_match("/data/a/foo"));
        assert!(!compiled.is_match("/other/data/a"));
    }
}
