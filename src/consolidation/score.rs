//! File metrics and quality scoring.
//!
//! All scores live in [0, 1]. The total is a fixed weighted blend:
//! 0.30 consistency + 0.25 test coverage + 0.30 code quality +
//! 0.15 efficiency.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static BRANCH_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(if|for|while|case|catch|match)\b").unwrap()
});

static COMMENT_MARKERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(//|/\*|\s#\s|^#|<!--)").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileMetrics {
    pub line_count: usize,
    pub avg_line_length: f64,
    pub max_line_length: usize,
    /// Branch-token count as a proxy for cyclomatic complexity.
    pub complexity: u32,
    pub has_comments: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QualityScore {
    pub consistency: f64,
    pub test_coverage: f64,
    pub code_quality: f64,
    pub efficiency: f64,
    pub total: f64,
}

pub fn compute_metrics(content: &str) -> FileMetrics {
    let mut line_count = 0usize;
    let mut total_len = 0usize;
    let mut max_line_length = 0usize;
    let mut has_comments = false;

    for line in content.lines() {
        line_count += 1;
        total_len += line.len();
        max_line_length = max_line_length.max(line.len());
        if !has_comments && COMMENT_MARKERS.is_match(line) {
            has_comments = true;
        }
    }

    FileMetrics {
        line_count,
        avg_line_length: if line_count == 0 {
            0.0
        } else {
            total_len as f64 / line_count as f64
        },
        max_line_length,
        complexity: BRANCH_TOKENS.find_iter(content).count() as u32,
        has_comments,
    }
}

/// Path heuristic for test files.
pub fn is_test_file(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    let file = lower.rsplit('/').next().unwrap_or(&lower);

    lower.contains("/tests/")
        || lower.contains("/test/")
        || lower.contains("/__tests__/")
        || lower.starts_with("tests/")
        || lower.starts_with("test/")
        || file.starts_with("test_")
        || file.contains("_test.")
        || file.contains(".test.")
        || file.contains(".spec.")
}

/// Weighted blend of max line length (ideal ≤ 120), complexity
/// (ideal ≤ 20), and comment presence.
pub fn code_quality(metrics: &FileMetrics) -> f64 {
    let line_score = if metrics.max_line_length <= 120 {
        1.0
    } else {
        (1.0 - (metrics.max_line_length as f64 - 120.0) / 200.0).max(0.0)
    };
    let complexity_score = if metrics.complexity <= 20 {
        1.0
    } else {
        (1.0 - (metrics.complexity as f64 - 20.0) / 80.0).max(0.0)
    };
    let comment_score = if metrics.has_comments { 1.0 } else { 0.5 };

    0.4 * line_score + 0.4 * complexity_score + 0.2 * comment_score
}

/// Bounded test-to-code ratio, with a bonus for the change being a test
/// file itself.
pub fn test_coverage(test_line_ratio: f64, is_test: bool) -> f64 {
    let bonus = if is_test { 0.25 } else { 0.0 };
    (test_line_ratio.clamp(0.0, 1.0) + bonus).min(1.0)
}

/// Smaller absolute net change scores higher.
pub fn efficiency(net_change: i64) -> f64 {
    1.0 / (1.0 + net_change.unsigned_abs() as f64 / 200.0)
}

/// Population standard deviation of per-worker contributions; a single
/// participant is perfectly consistent.
pub fn consistency(contributions: &[f64]) -> f64 {
    if contributions.len() <= 1 {
        return 1.0;
    }
    let n = contributions.len() as f64;
    let mean = contributions.iter().sum::<f64>() / n;
    let variance = contributions
        .iter()
        .map(|c| (c - mean).powi(2))
        .sum::<f64>()
        / n;
    (1.0 - variance.sqrt()).clamp(0.0, 1.0)
}

pub fn total_score(
    consistency: f64,
    test_coverage: f64,
    code_quality: f64,
    efficiency: f64,
) -> QualityScore {
    QualityScore {
        consistency,
        test_coverage,
        code_quality,
        efficiency,
        total: 0.30 * consistency + 0.25 * test_coverage + 0.30 * code_quality
            + 0.15 * efficiency,
    }
}
