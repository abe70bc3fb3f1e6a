//! Unified diff parsing.

use serde::{Deserialize, Serialize};

/// A contiguous region of change, addressed by its starting line in the
/// base revision.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Hunk {
    pub base_start: usize,
    pub base_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl Hunk {
    /// Base-revision range covered by this hunk. Pure insertions (len 0)
    /// still occupy their insertion point.
    pub fn base_range(&self) -> (usize, usize) {
        (self.base_start, self.base_start + self.base_len.max(1) - 1)
    }

    pub fn overlaps(&self, other: &Hunk) -> Option<(usize, usize)> {
        let (a_start, a_end) = self.base_range();
        let (b_start, b_end) = other.base_range();
        let start = a_start.max(b_start);
        let end = a_end.min(b_end);
        (start <= end).then_some((start, end))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub hunks: Vec<Hunk>,
    pub is_new: bool,
    pub is_deleted: bool,
    pub added_lines: usize,
    pub removed_lines: usize,
}

impl FileDiff {
    pub fn net_change(&self) -> i64 {
        self.added_lines as i64 - self.removed_lines as i64
    }

    /// All lines added by this diff, across hunks.
    pub fn added(&self) -> impl Iterator<Item = &str> {
        self.hunks
            .iter()
            .flat_map(|h| h.added.iter().map(String::as_str))
    }
}

fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    // @@ -base_start,base_len +new_start,new_len @@
    let inner = line.strip_prefix("@@ ")?;
    let inner = &inner[..inner.find(" @@")?];
    let mut parts = inner.split(' ');

    let base = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;

    let parse_pair = |s: &str| -> Option<(usize, usize)> {
        match s.split_once(',') {
            Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
            None => Some((s.parse().ok()?, 1)),
        }
    };

    let (base_start, base_len) = parse_pair(base)?;
    let (new_start, new_len) = parse_pair(new)?;
    Some((base_start, base_len, new_start, new_len))
}

fn parse_file_path(line: &str) -> Option<String> {
    // diff --git a/path b/path
    let rest = line.strip_prefix("diff --git a/")?;
    let (a_path, _) = rest.split_once(" b/")?;
    Some(a_path.to_string())
}

/// Parse `git diff` output into per-file hunk sets. Unknown lines are
/// skipped so mode changes and binary notices do not derail parsing.
pub fn parse_unified_diff(text: &str) -> Vec<FileDiff> {
    let mut files: Vec<FileDiff> = Vec::new();
    let mut current: Option<FileDiff> = None;
    let mut hunk: Option<Hunk> = None;

    let flush_hunk = |file: &mut Option<FileDiff>, hunk: &mut Option<Hunk>| {
        if let (Some(file), Some(hunk)) = (file.as_mut(), hunk.take()) {
            file.added_lines += hunk.added.len();
            file.removed_lines += hunk.removed.len();
            file.hunks.push(hunk);
        }
    };

    for line in text.lines() {
        if let Some(path) = parse_file_path(line) {
            flush_hunk(&mut current, &mut hunk);
            if let Some(file) = current.take() {
                files.push(file);
            }
            current = Some(FileDiff {
                path,
                hunks: Vec::new(),
                is_new: false,
                is_deleted: false,
                added_lines: 0,
                removed_lines: 0,
            });
        } else if line.starts_with("new file mode") {
            if let Some(file) = current.as_mut() {
                file.is_new = true;
            }
        } else if line.starts_with("deleted file mode") {
            if let Some(file) = current.as_mut() {
                file.is_deleted = true;
            }
        } else if line.starts_with("@@ ") {
            flush_hunk(&mut current, &mut hunk);
            if let Some((base_start, base_len, new_start, new_len)) = parse_hunk_header(line) {
                hunk = Some(Hunk {
                    base_start,
                    base_len,
                    new_start,
                    new_len,
                    added: Vec::new(),
                    removed: Vec::new(),
                });
            }
        } else if let Some(h) = hunk.as_mut() {
            if let Some(added) = line.strip_prefix('+') {
                if !line.starts_with("+++") {
                    h.added.push(added.to_string());
                }
            } else if let Some(removed) = line.strip_prefix('-') {
                if !line.starts_with("---") {
                    h.removed.push(removed.to_string());
                }
            }
        }
    }

    flush_hunk(&mut current, &mut hunk);
    if let Some(file) = current {
        files.push(file);
    }

    files
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
diff --git a/src/auth.rs b/src/auth.rs
index 1111111..2222222 100644
--- a/src/auth.rs
+++ b/src/auth.rs
@@ -10,4 +10,5 @@ fn login() {
 context
-    let old = 1;
+    let new = 1;
+    let extra = 2;
 context
@@ -40,2 +41,2 @@
-fn check(a: u32) {
+fn check(a: u32, b: u32) {
diff --git a/README.md b/README.md
new file mode 100644
--- /dev/null
+++ b/README.md
@@ -0,0 +1,2 @@
+# Title
+Body
";

    #[test]
    fn test_parse_two_files() {
        let files = parse_unified_diff(SAMPLE);
        assert_eq!(files.len(), 2);

        let auth = &files[0];
        assert_eq!(auth.path, "src/auth.rs");
        assert_eq!(auth.hunks.len(), 2);
        assert_eq!(auth.added_lines, 3);
        assert_eq!(auth.removed_lines, 2);
        assert!(!auth.is_new);

        let readme = &files[1];
        assert!(readme.is_new);
        assert_eq!(readme.added_lines, 2);
        assert_eq!(readme.hunks[0].base_start, 0);
    }

    #[test]
    fn test_hunk_header_without_len() {
        assert_eq!(parse_hunk_header("@@ -5 +5 @@"), Some((5, 1, 5, 1)));
        assert_eq!(parse_hunk_header("@@ -10,4 +10,5 @@ ctx"), Some((10, 4, 10, 5)));
        assert_eq!(parse_hunk_header("not a header"), None);
    }

    #[test]
    fn test_overlap_detection() {
        let a = Hunk {
            base_start: 10,
            base_len: 5,
            ..Default::default()
        };
        let b = Hunk {
            base_start: 13,
            base_len: 4,
            ..Default::default()
        };
        let c = Hunk {
            base_start: 20,
            base_len: 2,
            ..Default::default()
        };

        assert_eq!(a.overlaps(&b), Some((13, 14)));
        assert!(a.overlaps(&c).is_none());
    }

    #[test]
    fn test_insertion_occupies_its_point() {
        let insert = Hunk {
            base_start: 12,
            base_len: 0,
            ..Default::default()
        };
        let touching = Hunk {
            base_start: 10,
            base_len: 5,
            ..Default::default()
        };
        assert!(insert.overlaps(&touching).is_some());
    }

    #[test]
    fn test_empty_diff() {
        assert!(parse_unified_diff("").is_empty());
    }
}
