//! Bounded per-unit log pane.

use std::collections::VecDeque;

use tracing::Level;

/// Lines kept per unit before the oldest are dropped.
pub const LOG_PANE_LINES: usize = 100;

/// One line in a unit's log pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: Level,
    pub text: String,
}

/// Fixed-capacity log that drops the oldest line when full.
///
/// Multi-line messages (the bilingual English/Chinese pairs) are split so
/// that capacity counts displayed lines, not messages.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitLog {
    lines: VecDeque<LogLine>,
    capacity: usize,
}

impl Default for UnitLog {
    fn default() -> Self {
        Self::new(LOG_PANE_LINES)
    }
}

impl UnitLog {
    /// # Panics
    /// Panics if capacity is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "UnitLog capacity must be > 0");
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, level: Level, message: &str) {
        for text in message.lines() {
            if self.lines.len() >= self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(LogLine {
                level,
                text: text.to_string(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LogLine> {
        self.lines.iter()
    }

    /// The newest `count` lines, oldest first.
    pub fn tail(&self, count: usize) -> impl Iterator<Item = &LogLine> {
        self.lines.iter().skip(self.lines.len().saturating_sub(count))
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}
