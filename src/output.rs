//! Log event model and in-memory buffering.
//!
//! This module defines the decoded [`LogEvent`] produced for every line a unit writes,
//! and [`LogBuffer`], the bounded ring that keeps the most recent events of a unit in
//! memory for fast replay and for serving history when the on-disk log is degraded.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ansi::Color;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// A run of text sharing one style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fg: Option<Color>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bold: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub underline: bool,
}

impl Segment {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fg: None,
            bold: false,
            underline: false,
        }
    }
}

/// A single decoded line of output from a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Name of the unit that produced the line.
    pub unit: String,
    /// Per-unit sequence number, starting at 1 and gap-free.
    pub seq: u64,
    /// Wall-clock time the line was recorded.
    pub timestamp: DateTime<Utc>,
    /// The stream it originated from (stdout/stderr).
    pub stream: StreamKind,
    /// Styled text runs.
    pub segments: Vec<Segment>,
    /// Raw bytes consumed from the pipe for this line.
    pub raw_len: usize,
}

impl LogEvent {
    /// Returns the line's text with all styling removed.
    pub fn text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }
}

/// A fixed-capacity ring buffer for storing `LogEvent`s.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    events: VecDeque<LogEvent>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            events: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds an event to the buffer.
    ///
    /// Returns `true` if an old event was dropped to make room.
    pub fn push(&mut self, event: LogEvent) -> bool {
        let mut dropped = false;
        self.events.push_back(event);
        while self.events.len() > self.max_lines {
            self.events.pop_front();
            dropped = true;
        }
        dropped
    }

    /// Returns the number of events currently in the buffer.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Sequence number of the oldest buffered event.
    pub fn first_seq(&self) -> Option<u64> {
        self.events.front().map(|e| e.seq)
    }

    /// Returns an iterator over the events in the buffer.
    pub fn iter(&self) -> impl Iterator<Item = &LogEvent> {
        self.events.iter()
    }

    /// Clones the buffered events whose sequence numbers fall in `[start, end)`.
    pub fn range(&self, start: u64, end: u64) -> Vec<LogEvent> {
        self.events
            .iter()
            .filter(|e| e.seq >= start && e.seq < end)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64, text: &str) -> LogEvent {
        LogEvent {
            unit: "bot".into(),
            seq,
            timestamp: Utc::now(),
            stream: StreamKind::Stdout,
            segments: vec![Segment::plain(text)],
            raw_len: text.len() + 1,
        }
    }

    #[test]
    fn log_buffer_drops_oldest() {
        let mut buffer = LogBuffer::new(2);
        buffer.push(event(1, "a"));
        buffer.push(event(2, "b"));
        let dropped = buffer.push(event(3, "c"));
        assert!(dropped);
        let lines = buffer.iter().map(|e| e.text()).collect::<Vec<_>>();
        assert_eq!(lines, vec!["b", "c"]);
        assert_eq!(buffer.first_seq(), Some(2));
    }

    #[test]
    fn range_is_half_open() {
        let mut buffer = LogBuffer::new(10);
        for seq in 1..=5 {
            buffer.push(event(seq, "x"));
        }
        let seqs: Vec<u64> = buffer.range(2, 4).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn event_serializes_compactly() {
        let json = serde_json::to_string(&event(7, "hi")).unwrap();
        assert!(json.contains("\"stream\":\"stdout\""));
        assert!(!json.contains("bold"));
        let back: LogEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.text(), "hi");
        assert_eq!(back.seq, 7);
    }
}
