use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub line: String,
    pub at: DateTime<Utc>,
}

/// Bounded per-worker stdio capture. When full, the oldest lines are
/// evicted; `total_seen` keeps offsets stable for pagination.
pub struct LogBuffer {
    lines: Mutex<VecDeque<LogLine>>,
    capacity: usize,
    total_seen: Mutex<usize>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            total_seen: Mutex::new(0),
        }
    }

    pub fn push(&self, stream: LogStream, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(LogLine {
            stream,
            line,
            at: Utc::now(),
        });
        *self.total_seen.lock() += 1;
    }

    /// Page by absolute line offset. Lines evicted from the buffer are no
    /// longer returned but still count toward the total.
    pub fn page(&self, offset: usize, count: usize) -> (Vec<LogLine>, usize) {
        let lines = self.lines.lock();
        let total = *self.total_seen.lock();
        let evicted = total - lines.len();

        let start = offset.saturating_sub(evicted).min(lines.len());
        let page: Vec<LogLine> = lines.iter().skip(start).take(count).cloned().collect();
        (page, total)
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_page() {
        let buffer = LogBuffer::new(100);
        for i in 0..10 {
            buffer.push(LogStream::Stdout, format!("line {i}"));
        }

        let (page, total) = buffer.page(3, 4);
        assert_eq!(total, 10);
        assert_eq!(page.len(), 4);
        assert_eq!(page[0].line, "line 3");
        assert_eq!(page[3].line, "line 6");
    }

    #[test]
    fn test_eviction_keeps_total() {
        let buffer = LogBuffer::new(5);
        for i in 0..12 {
            buffer.push(LogStream::Stderr, format!("line {i}"));
        }

        assert_eq!(buffer.len(), 5);
        let (page, total) = buffer.page(0, 100);
        assert_eq!(total, 12);
        assert_eq!(page.len(), 5);
        assert_eq!(page[0].line, "line 7");
    }

    #[test]
    fn test_offset_past_end() {
        let buffer = LogBuffer::new(5);
        buffer.push(LogStream::Stdout, "only".into());
        let (page, total) = buffer.page(10, 5);
        assert!(page.is_empty());
        assert_eq!(total, 1);
    }
}
