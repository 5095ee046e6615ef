//! The operation journal and usage reporting.
//!
//! Every public engine call appends one audit record before the work is
//! attempted, so the journal reflects intent rather than success. Entries
//! live on the ordinary process heap, never in the managed heap, so usage
//! reports never count them. Appending cannot fail an allocation.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::blocklist::HeapUsage;

/// The four public operations the journal distinguishes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpKind {
    Allocate,
    Free,
    ZeroAllocate,
    Resize,
}

impl OpKind {
    pub fn label(&self) -> &'static str {
        match self {
            OpKind::Allocate => "allocate",
            OpKind::Free => "free",
            OpKind::ZeroAllocate => "zero-allocate",
            OpKind::Resize => "resize",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One append-only audit record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub kind: OpKind,
    /// Size the operation asked for; 0 where that is not meaningful (free).
    pub size: usize,
    /// Wall-clock seconds since the Unix epoch at record time.
    pub timestamp: u64,
    /// Per-kind sequence number; equals the matching call counter at the
    /// time the record was made.
    pub seq: u64,
}

impl fmt::Display for JournalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({} bytes) #{}",
            self.timestamp, self.kind, self.size, self.seq
        )
    }
}

/// The append-only operation log, reported newest-first.
#[derive(Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub(crate) fn record(&mut self, kind: OpKind, size: usize, seq: u64) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        self.entries.push(JournalEntry {
            kind,
            size,
            timestamp,
            seq,
        });
    }

    /// Release every entry at once.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in reporting order, most recent call first.
    pub fn newest_first(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter().rev()
    }
}

impl fmt::Display for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut start = true;
        for entry in self.newest_first() {
            if !start {
                writeln!(f)?;
            } else {
                start = false;
            }
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}

/// Monotonic call counters, one per public operation, bumped at operation
/// entry (including the operations `resize` and `zero_allocate` perform
/// internally).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OpCounters {
    pub allocate: u64,
    pub free: u64,
    pub zero_allocate: u64,
    pub resize: u64,
}

/// The call counters plus one usage walk, rendered as the familiar
/// statistics block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapStats {
    pub counters: OpCounters,
    pub usage: HeapUsage,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Memory usage statistics:")?;
        writeln!(f, "Allocate calls      : {}", self.counters.allocate)?;
        writeln!(f, "Free calls          : {}", self.counters.free)?;
        writeln!(f, "Zero-allocate calls : {}", self.counters.zero_allocate)?;
        writeln!(f, "Resize calls        : {}", self.counters.resize)?;
        write!(f, "{}", self.usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[test]
    fn entries_report_newest_first() {
        let mut journal = Journal::default();
        journal.record(OpKind::Allocate, 64, 1);
        journal.record(OpKind::Free, 0, 1);
        journal.record(OpKind::Allocate, 128, 2);

        let kinds: Vec<(OpKind, u64)> = journal
            .newest_first()
            .map(|entry| (entry.kind, entry.seq))
            .collect();
        assert_eq!(
            kinds,
            vec![(OpKind::Allocate, 2), (OpKind::Free, 1), (OpKind::Allocate, 1)]
        );
    }

    #[test]
    fn clear_releases_everything() {
        let mut journal = Journal::default();
        journal.record(OpKind::Resize, 32, 1);
        assert_eq!(journal.len(), 1);

        journal.clear();
        assert!(journal.is_empty());
    }

    #[test]
    fn entry_render_shape() {
        let entry = JournalEntry {
            kind: OpKind::ZeroAllocate,
            size: 80,
            timestamp: 1700000000,
            seq: 3,
        };
        assert_eq!(entry.to_string(), "[1700000000] zero-allocate (80 bytes) #3");
    }

    #[test]
    fn stats_render_includes_counters_and_usage() {
        let stats = HeapStats {
            counters: OpCounters {
                allocate: 4,
                free: 2,
                zero_allocate: 1,
                resize: 0,
            },
            usage: HeapUsage {
                used_bytes: 192,
                free_bytes: 64,
                used_blocks: 3,
                free_blocks: 1,
            },
        };
        let rendered = stats.to_string();
        assert!(rendered.contains("Allocate calls      : 4"));
        assert!(rendered.contains("Total used memory: 192 bytes"));
        assert!(rendered.contains("Total free memory: 64 bytes"));
    }
}
