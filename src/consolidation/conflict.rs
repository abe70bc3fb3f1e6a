//! Pairwise conflict detection between workers that touched the same path.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::{ConflictRecord, ConflictType, FileDiff, Hunk, MergeStrategy, WorkerDiffs};

/// Top-level import statements across the languages workers commonly edit:
/// ES `import X from`, `import { A, B }`, Rust `use a::b::C;`, Python
/// `from m import X`.
static IMPORT_BINDINGS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"^\s*import\s+(\w+)\s+from\b").unwrap(),
        Regex::new(r"^\s*import\s*\{([^}]+)\}").unwrap(),
        Regex::new(r"^\s*use\s+[\w:]*?(\w+)\s*;").unwrap(),
        Regex::new(r"^\s*from\s+\S+\s+import\s+(\w+)").unwrap(),
    ]
});

/// Top-level export statements: ES `export (default) fn/class/const X`,
/// Rust `pub fn/struct/... X`.
static EXPORT_BINDINGS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(
            r"^\s*export\s+(?:default\s+)?(?:async\s+)?(?:function|class|const|let|var|interface|type|enum)\s+(\w+)",
        )
        .unwrap(),
        Regex::new(r"^\s*pub\s+(?:async\s+)?(?:fn|struct|enum|trait|const|static|type)\s+(\w+)")
            .unwrap(),
    ]
});

/// Declaration signatures for structural comparison: name → the rest of
/// the declaration line.
static DECLARATIONS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"^\s*(?:pub\s+)?(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:function|fn)\s+(\w+)\s*(\([^)]*\))").unwrap(),
        Regex::new(r"^\s*(?:export\s+)?(?:abstract\s+)?class\s+(\w+)([^\{]*)").unwrap(),
        Regex::new(r"^\s*(?:export\s+)?interface\s+(\w+)([^\{]*)").unwrap(),
    ]
});

fn bindings(lines: impl Iterator<Item = String>, patterns: &[Regex]) -> HashMap<String, String> {
    let mut found = HashMap::new();
    for line in lines {
        for pattern in patterns {
            if let Some(caps) = pattern.captures(&line) {
                let names = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                // Brace imports may bind several names at once.
                for name in names.split(',') {
                    let name = name.trim();
                    if !name.is_empty() {
                        found.insert(name.to_string(), line.trim().to_string());
                    }
                }
                break;
            }
        }
    }
    found
}

fn declarations(lines: impl Iterator<Item = String>) -> HashMap<String, String> {
    let mut found = HashMap::new();
    for line in lines {
        for pattern in DECLARATIONS.iter() {
            if let Some(caps) = pattern.captures(&line) {
                let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                let signature = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
                if !name.is_empty() {
                    found.insert(name.to_string(), signature.to_string());
                }
                break;
            }
        }
    }
    found
}

fn added_lines(diff: &FileDiff) -> impl Iterator<Item = String> + '_ {
    diff.added().map(str::to_string)
}

fn representative_hunk(diff: &FileDiff) -> Hunk {
    diff.hunks.first().cloned().unwrap_or_default()
}

fn pair_conflicts(
    path: &str,
    ours_worker: &str,
    ours: &FileDiff,
    theirs_worker: &str,
    theirs: &FileDiff,
) -> Vec<ConflictRecord> {
    let mut conflicts = Vec::new();
    let workers = (ours_worker.to_string(), theirs_worker.to_string());

    if ours.is_deleted != theirs.is_deleted {
        conflicts.push(ConflictRecord {
            path: path.to_string(),
            conflict_type: ConflictType::DeleteModify,
            workers: workers.clone(),
            ours_hunk: representative_hunk(ours),
            theirs_hunk: representative_hunk(theirs),
            overlap: None,
        });
        return conflicts;
    }

    for ours_hunk in &ours.hunks {
        for theirs_hunk in &theirs.hunks {
            if let Some(overlap) = ours_hunk.overlaps(theirs_hunk) {
                conflicts.push(ConflictRecord {
                    path: path.to_string(),
                    conflict_type: ConflictType::SameLine,
                    workers: workers.clone(),
                    ours_hunk: ours_hunk.clone(),
                    theirs_hunk: theirs_hunk.clone(),
                    overlap: Some(overlap),
                });
            }
        }
    }

    let ours_imports = bindings(added_lines(ours), &IMPORT_BINDINGS);
    let theirs_imports = bindings(added_lines(theirs), &IMPORT_BINDINGS);
    for (name, ours_stmt) in &ours_imports {
        if let Some(theirs_stmt) = theirs_imports.get(name)
            && ours_stmt != theirs_stmt
        {
            conflicts.push(ConflictRecord {
                path: path.to_string(),
                conflict_type: ConflictType::ImportConflict,
                workers: workers.clone(),
                ours_hunk: representative_hunk(ours),
                theirs_hunk: representative_hunk(theirs),
                overlap: None,
            });
        }
    }

    let ours_exports = bindings(added_lines(ours), &EXPORT_BINDINGS);
    let theirs_exports = bindings(added_lines(theirs), &EXPORT_BINDINGS);
    for (name, ours_stmt) in &ours_exports {
        if let Some(theirs_stmt) = theirs_exports.get(name)
            && ours_stmt != theirs_stmt
        {
            conflicts.push(ConflictRecord {
                path: path.to_string(),
                conflict_type: ConflictType::ExportConflict,
                workers: workers.clone(),
                ours_hunk: representative_hunk(ours),
                theirs_hunk: representative_hunk(theirs),
                overlap: None,
            });
        }
    }

    let ours_decls = declarations(added_lines(ours));
    let theirs_decls = declarations(added_lines(theirs));
    for (name, ours_sig) in &ours_decls {
        if let Some(theirs_sig) = theirs_decls.get(name)
            && ours_sig != theirs_sig
        {
            conflicts.push(ConflictRecord {
                path: path.to_string(),
                conflict_type: ConflictType::Structural,
                workers: workers.clone(),
                ours_hunk: representative_hunk(ours),
                theirs_hunk: representative_hunk(theirs),
                overlap: None,
            });
        }
    }

    conflicts
}

/// Inspect every pair of participants that modified the same path.
/// Participant order is preserved so conflict records are deterministic.
pub fn detect_conflicts(participants: &[String], diffs: &WorkerDiffs) -> Vec<ConflictRecord> {
    let mut conflicts = Vec::new();

    for (i, ours_worker) in participants.iter().enumerate() {
        for theirs_worker in participants.iter().skip(i + 1) {
            let (Some(ours_diffs), Some(theirs_diffs)) =
                (diffs.get(ours_worker), diffs.get(theirs_worker))
            else {
                continue;
            };

            let theirs_by_path: HashMap<&str, &FileDiff> = theirs_diffs
                .iter()
                .map(|d| (d.path.as_str(), d))
                .collect();

            for ours in ours_diffs {
                if let Some(theirs) = theirs_by_path.get(ours.path.as_str()) {
                    conflicts.extend(pair_conflicts(
                        &ours.path,
                        ours_worker,
                        ours,
                        theirs_worker,
                        theirs,
                    ));
                }
            }
        }
    }

    conflicts
}

/// Strategy suggestion from the conflict mix: any delete-modify demands a
/// human; a pure import/export mix unions cleanly; mostly same-line is a
/// vote; no conflicts auto-merge.
pub fn recommended_strategy(conflicts: &[ConflictRecord]) -> MergeStrategy {
    if conflicts.is_empty() {
        return MergeStrategy::Auto;
    }
    if conflicts
        .iter()
        .any(|c| c.conflict_type == ConflictType::DeleteModify)
    {
        return MergeStrategy::Manual;
    }
    if conflicts.iter().all(|c| {
        matches!(
            c.conflict_type,
            ConflictType::ImportConflict | ConflictType::ExportConflict
        )
    }) {
        return MergeStrategy::Union;
    }

    let same_line = conflicts
        .iter()
        .filter(|c| c.conflict_type == ConflictType::SameLine)
        .count();
    if same_line * 2 >= conflicts.len() {
        MergeStrategy::Voting
    } else {
        MergeStrategy::Manual
    }
}
