//! Bounded rolling buffer of timestamped log lines.
//!
//! Each supervised program owns one [`LogBuffer`]. Append is the only
//! mutation; once capacity is reached the oldest line is evicted. Lines are
//! formatted as `[YYYY-MM-DD HH:MM:SS] <message>` in local time; that prefix
//! is load-bearing because [`LogBuffer::since`] filters by parsing it.
//!
//! The buffer also tracks the monotonic count of lines ever appended, so a
//! stream consumer can track its position by count observed rather than by
//! buffer index. Concurrent eviction then drops lines the consumer has not
//! reached, but never duplicates or skips the ones it has.

use std::collections::VecDeque;

use chrono::{Local, NaiveDateTime};

/// Timestamp format embedded in every log line.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fixed-capacity FIFO ring of timestamped text lines.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    appended: u64,
}

impl LogBuffer {
    /// Create an empty buffer holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            appended: 0,
        }
    }

    /// Append a message, timestamped with the current local time.
    ///
    /// Evicts the oldest line when the buffer is full.
    pub fn append(&mut self, message: &str) {
        let line = format!("[{}] {message}", Local::now().format(TIMESTAMP_FORMAT));
        self.push(line);
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.appended += 1;
    }

    /// Snapshot copy of all buffered lines, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Lines whose embedded timestamp is strictly after `ts`.
    ///
    /// Lines without a parseable timestamp prefix are included rather than
    /// dropped, so foreign or malformed diagnostics are never silently lost.
    #[must_use]
    pub fn since(&self, ts: NaiveDateTime) -> Vec<String> {
        self.lines
            .iter()
            .filter(|line| line_timestamp(line).is_none_or(|t| t > ts))
            .cloned()
            .collect()
    }

    /// The most recent `n` lines, oldest first.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Lines at or past the given global append index, oldest first.
    ///
    /// The global index of a line is its position in the append sequence
    /// since construction; eviction and [`clear`](Self::clear) never rewind
    /// it. An index pointing at evicted lines yields the surviving suffix.
    #[must_use]
    pub fn lines_from(&self, index: u64) -> Vec<String> {
        let first = self.appended - self.lines.len() as u64;
        let skip = usize::try_from(index.saturating_sub(first)).unwrap_or(usize::MAX);
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Empty the buffer.
    ///
    /// The append counter keeps counting across a clear, so attached streams
    /// treat the removed lines as evicted.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Number of lines currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the buffer holds no lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Maximum number of buffered lines.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of lines ever appended.
    #[must_use]
    pub const fn appended(&self) -> u64 {
        self.appended
    }
}

/// Parse the bracketed timestamp prefix of a log line, if present.
#[must_use]
pub fn line_timestamp(line: &str) -> Option<NaiveDateTime> {
    let rest = line.strip_prefix('[')?;
    let end = rest.find(']')?;
    NaiveDateTime::parse_from_str(&rest[..end], TIMESTAMP_FORMAT).ok()
}
