//! The in-memory Raft log: an ordered run of entries whose prefix has been
//! replaced by a snapshot.
//!
//! `prev_index`/`prev_term` describe the entry just below the first one still
//! present; they always equal the snapshot's last included index and term.
//! Reading below that boundary is a programming error and panics.

use crate::state_machine::StateMachine;
use crate::types::{LogEntry, LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: StateMachine", deserialize = "S: StateMachine"))]
pub struct RaftLog<S: StateMachine> {
    prev_index: LogIndex,
    prev_term: Term,
    entries: VecDeque<LogEntry<S>>,
}

impl<S: StateMachine> RaftLog<S> {
    /// An empty log anchored just above `(prev_index, prev_term)`.
    pub fn new(prev_index: LogIndex, prev_term: Term) -> Self {
        Self {
            prev_index,
            prev_term,
            entries: VecDeque::new(),
        }
    }

    /// Index of the entry just below the first one present (the snapshot
    /// boundary).
    pub fn prev_index(&self) -> LogIndex {
        self.prev_index
    }

    /// Term of the entry at `prev_index`.
    pub fn prev_term(&self) -> Term {
        self.prev_term
    }

    /// Index of the last entry, or `prev_index` if the log is empty.
    pub fn latest_index(&self) -> LogIndex {
        LogIndex(self.prev_index.0 + self.entries.len() as u64)
    }

    /// Term of the last entry, or `prev_term` if the log is empty.
    pub fn latest_term(&self) -> Term {
        self.entries.back().map_or(self.prev_term, |e| e.term)
    }

    /// Term of the entry at `index`; `prev_index` itself is answerable from
    /// the snapshot metadata.
    ///
    /// Panics if `index` is below the snapshot boundary or past the tail.
    pub fn entry_term(&self, index: LogIndex) -> Term {
        if index == self.prev_index {
            return self.prev_term;
        }
        self.get(index).term
    }

    /// The entry at `index`.
    ///
    /// Panics if `index` is at or below the snapshot boundary or past the
    /// tail.
    pub fn get(&self, index: LogIndex) -> &LogEntry<S> {
        if index <= self.prev_index || index > self.latest_index() {
            panic!(
                "log index {} out of range ({}, {}]",
                index,
                self.prev_index,
                self.latest_index()
            );
        }
        &self.entries[(index.0 - self.prev_index.0 - 1) as usize]
    }

    /// Append one entry at the tail.
    pub fn append(&mut self, entry: LogEntry<S>) {
        self.entries.push_back(entry);
    }

    /// Drop every entry with index greater than `index`.
    ///
    /// Panics if `index` is below the snapshot boundary.
    pub fn truncate_after(&mut self, index: LogIndex) {
        if index < self.prev_index {
            panic!(
                "cannot truncate to {} below snapshot boundary {}",
                index, self.prev_index
            );
        }
        self.entries
            .truncate((index.0 - self.prev_index.0) as usize);
    }

    /// Discard every entry with index at or below `index`, advancing the
    /// snapshot boundary to it. No-op if `index` is already covered.
    ///
    /// Panics if `index` is past the tail.
    pub fn truncate_through(&mut self, index: LogIndex) {
        if index <= self.prev_index {
            return;
        }
        let term = self.entry_term(index);
        self.entries.drain(..(index.0 - self.prev_index.0) as usize);
        self.prev_index = index;
        self.prev_term = term;
    }

    /// Replace the whole log with an empty one anchored at the given point.
    /// Used when a snapshot is installed over this member.
    pub fn reset_to(&mut self, index: LogIndex, term: Term) {
        self.entries.clear();
        self.prev_index = index;
        self.prev_term = term;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryPayload;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Recorder {
        applied: Vec<u64>,
    }

    impl StateMachine for Recorder {
        type Change = u64;

        fn accepts(&self, _change: &u64) -> bool {
            true
        }

        fn apply(&mut self, change: &u64) {
            self.applied.push(*change);
        }
    }

    fn entry(term: u64, change: u64) -> LogEntry<Recorder> {
        LogEntry::new(Term(term), EntryPayload::Change(change))
    }

    fn log_with(n: u64) -> RaftLog<Recorder> {
        let mut log = RaftLog::new(LogIndex::ZERO, Term::ZERO);
        for i in 1..=n {
            log.append(entry(1, i));
        }
        log
    }

    #[test]
    fn append_and_read() {
        let log = log_with(3);
        assert_eq!(log.latest_index(), LogIndex(3));
        assert_eq!(log.latest_term(), Term(1));
        assert_eq!(log.entry_term(LogIndex(2)), Term(1));
        assert_eq!(log.get(LogIndex(2)).payload, EntryPayload::Change(2));
    }

    #[test]
    fn empty_log_answers_from_boundary() {
        let log: RaftLog<Recorder> = RaftLog::new(LogIndex(7), Term(3));
        assert_eq!(log.latest_index(), LogIndex(7));
        assert_eq!(log.latest_term(), Term(3));
        assert_eq!(log.entry_term(LogIndex(7)), Term(3));
    }

    #[test]
    fn truncate_after_drops_tail() {
        let mut log = log_with(5);
        log.truncate_after(LogIndex(3));
        assert_eq!(log.latest_index(), LogIndex(3));

        // Truncating at or past the tail is a no-op.
        log.truncate_after(LogIndex(9));
        assert_eq!(log.latest_index(), LogIndex(3));
    }

    #[test]
    fn truncate_through_advances_boundary() {
        let mut log = log_with(5);
        log.truncate_through(LogIndex(3));
        assert_eq!(log.prev_index(), LogIndex(3));
        assert_eq!(log.prev_term(), Term(1));
        assert_eq!(log.latest_index(), LogIndex(5));
        assert_eq!(log.get(LogIndex(4)).payload, EntryPayload::Change(4));

        // Already-covered indexes are ignored.
        log.truncate_through(LogIndex(2));
        assert_eq!(log.prev_index(), LogIndex(3));
    }

    #[test]
    fn reset_to_clears_everything() {
        let mut log = log_with(5);
        log.reset_to(LogIndex(100), Term(4));
        assert_eq!(log.prev_index(), LogIndex(100));
        assert_eq!(log.latest_index(), LogIndex(100));
        assert_eq!(log.latest_term(), Term(4));
    }

    #[test]
    #[should_panic]
    fn read_below_boundary_panics() {
        let mut log = log_with(5);
        log.truncate_through(LogIndex(3));
        log.get(LogIndex(3));
    }

    #[test]
    #[should_panic]
    fn read_past_tail_panics() {
        let log = log_with(2);
        log.get(LogIndex(3));
    }
}
