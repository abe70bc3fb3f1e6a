//! Consolidation engine: merge many workers' divergent changes back into a
//! single revision through structured conflict detection and resolution.

mod conflict;
mod diff;
mod engine;
mod score;
mod store;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use conflict::{detect_conflicts, recommended_strategy};
pub use diff::{FileDiff, Hunk, parse_unified_diff};
pub use engine::Consolidator;
pub use score::{FileMetrics, QualityScore, compute_metrics, is_test_file};
pub use store::ConsolidationStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStatus {
    Pending,
    Analyzing,
    Analyzed,
    Ready,
    Completed,
}

impl ConsolidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Analyzed => "analyzed",
            Self::Ready => "ready",
            Self::Completed => "completed",
        }
    }

    /// Rank in the monotone lifecycle; transitions never move backwards.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Analyzing => 1,
            Self::Analyzed => 2,
            Self::Ready => 3,
            Self::Completed => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    #[default]
    Auto,
    Voting,
    Union,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    SameLine,
    DeleteModify,
    ImportConflict,
    ExportConflict,
    Structural,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionAction {
    Merge,
    Reject,
    KeepOurs,
    KeepTheirs,
    Voting,
    Union,
    Manual,
}

/// Per-file quality report for one worker's version of a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    pub path: String,
    pub source_worker: String,
    pub score: QualityScore,
    pub metrics: FileMetrics,
    pub is_test_file: bool,
    pub test_line_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub path: String,
    pub conflict_type: ConflictType,
    pub workers: (String, String),
    pub ours_hunk: Hunk,
    pub theirs_hunk: Hunk,
    /// Overlapping base-revision line range, for same-line conflicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePreview {
    pub total_files: usize,
    pub auto_mergeable: usize,
    pub conflicting: usize,
    pub files: Vec<FileReport>,
    pub conflicts: Vec<ConflictRecord>,
    pub recommended: MergeStrategy,
}

/// Caller-supplied decision for one path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub path: String,
    pub action: ResolutionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_worker: Option<String>,
    /// Out-of-band content for `manual` resolutions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedFile {
    pub path: String,
    pub action: ResolutionAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MergePlan {
    pub files: Vec<PlannedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MergeResult {
    pub merged: Vec<String>,
    pub failed: Vec<MergeFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consolidation {
    pub id: String,
    pub project: PathBuf,
    pub base_revision: String,
    pub participants: Vec<String>,
    pub strategy: MergeStrategy,
    pub status: ConsolidationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<MergePreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<MergePlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<MergeResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Consolidation {
    pub fn new(
        id: impl Into<String>,
        project: impl Into<PathBuf>,
        base_revision: impl Into<String>,
        participants: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project: project.into(),
            base_revision: base_revision.into(),
            participants,
            strategy: MergeStrategy::default(),
            status: ConsolidationStatus::Pending,
            preview: None,
            plan: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-worker parsed diffs, the analysis working set.
pub type WorkerDiffs = HashMap<String, Vec<FileDiff>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_monotone() {
        assert!(ConsolidationStatus::Pending.rank() < ConsolidationStatus::Analyzing.rank());
        assert!(ConsolidationStatus::Analyzing.rank() < ConsolidationStatus::Analyzed.rank());
        assert!(ConsolidationStatus::Analyzed.rank() < ConsolidationStatus::Ready.rank());
        assert!(ConsolidationStatus::Ready.rank() < ConsolidationStatus::Completed.rank());
    }

    #[test]
    fn test_conflict_type_wire_names() {
        assert_eq!(
            serde_json::to_value(ConflictType::SameLine).unwrap(),
            serde_json::json!("same-line")
        );
        assert_eq!(
            serde_json::to_value(ConflictType::DeleteModify).unwrap(),
            serde_json::json!("delete-modify")
        );
    }

    #[test]
    fn test_resolution_action_wire_names() {
        assert_eq!(
            serde_json::to_value(ResolutionAction::KeepOurs).unwrap(),
            serde_json::json!("keep-ours")
        );
    }
}
