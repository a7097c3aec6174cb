// Progress sink shared between the update task (single writer) and any number of viewers

use heapless::{Deque, String};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Lines kept for viewers; older lines are overwritten. Holds everything an
/// update reports between two viewer polls.
pub const LOG_LINES: usize = 32;
/// Longer lines are truncated.
pub const LINE_CAPACITY: usize = 128;

/// Where the update task reports what it is doing.
pub trait ProgressSink {
    fn push_line(&self, text: &str);

    fn set_phase(&self, _phase: Phase) {}

    fn set_bytes_written(&self, _total: u64) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Running = 1,
    Failed = 2,
    Completed = 3,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Running,
            2 => Phase::Failed,
            3 => Phase::Completed,
            _ => Phase::Idle,
        }
    }
}

struct Entry {
    seq: u64,
    text: String<LINE_CAPACITY>,
}

struct Lines {
    entries: Deque<Entry, LOG_LINES>,
    next_seq: u64,
    attempt_start: u64,
}

/// Ring of recent status lines plus the observable state of the current attempt.
pub struct ProgressLog {
    lines: Mutex<Lines>,
    phase: AtomicU8,
    bytes_written: AtomicU32,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(Lines {
                entries: Deque::new(),
                next_seq: 0,
                attempt_start: 0,
            }),
            phase: AtomicU8::new(Phase::Idle as u8),
            bytes_written: AtomicU32::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lines> {
        match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Mark the start of a new attempt. Lines pushed from now on belong to it.
    pub fn begin_attempt(&self) {
        let mut lines = self.lock();
        lines.attempt_start = lines.next_seq;
        self.bytes_written.store(0, Ordering::Relaxed);
        self.phase.store(Phase::Running as u8, Ordering::Release);
    }

    /// Sequence number of the first line of the current attempt.
    pub fn attempt_start(&self) -> u64 {
        self.lock().attempt_start
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn bytes_written(&self) -> u32 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Last `LOG_LINES` lines, oldest first.
    pub fn recent_lines(&self) -> Vec<std::string::String> {
        self.lock().entries.iter().map(|e| e.text.as_str().into()).collect()
    }

    /// Lines with a sequence number of at least `cursor`, and the cursor to pass next time.
    ///
    /// Lines overwritten before the viewer got to them are skipped.
    pub fn lines_since(&self, cursor: u64) -> (Vec<std::string::String>, u64) {
        let lines = self.lock();
        let fresh = lines
            .entries
            .iter()
            .filter(|e| e.seq >= cursor)
            .map(|e| e.text.as_str().into())
            .collect();
        (fresh, lines.next_seq)
    }
}

impl Default for ProgressLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressLog {
    fn push_line(&self, text: &str) {
        let mut line = String::new();
        for c in text.chars().filter(|c| *c != '\r' && *c != '\n') {
            if line.push(c).is_err() {
                break;
            }
        }

        let mut lines = self.lock();
        let seq = lines.next_seq;
        lines.next_seq += 1;
        if lines.entries.is_full() {
            lines.entries.pop_front();
        }
        // Cannot fail: a slot was freed above.
        let _ = lines.entries.push_back(Entry { seq, text: line });
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn set_bytes_written(&self, total: u64) {
        let total = u32::try_from(total).unwrap_or(u32::MAX);
        self.bytes_written.store(total, Ordering::Relaxed);
    }
}
