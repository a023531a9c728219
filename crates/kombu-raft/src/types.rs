//! Core Raft types: terms, log indexes, entry payloads, RPC messages,
//! and cluster configurations (including joint configurations).

use crate::state_machine::StateMachine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Raft term number (monotonically increasing).
///
/// Terms establish logical clocks in Raft. Each term has at most one leader.
/// When a member starts an election, it increments its term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log index (1-indexed, 0 is the sentinel for "before the log").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Member identifier (unique across the cluster).
///
/// A string to support DNS names, UUIDs, or IP:port combinations. Ordered so
/// it can live in `BTreeSet`-based configurations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        MemberId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raft role (Follower, Candidate, or Leader).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// What a log entry carries.
///
/// `Noop` entries are appended by a freshly elected leader so that commit
/// advancement only ever has to consider current-term entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: StateMachine", deserialize = "S: StateMachine"))]
pub enum EntryPayload<S: StateMachine> {
    Change(S::Change),
    Config(JointConfig),
    Noop,
}

/// A single log entry: the term it was created in plus its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: StateMachine", deserialize = "S: StateMachine"))]
pub struct LogEntry<S: StateMachine> {
    pub term: Term,
    pub payload: EntryPayload<S>,
}

impl<S: StateMachine> LogEntry<S> {
    pub fn new(term: Term, payload: EntryPayload<S>) -> Self {
        Self { term, payload }
    }
}

/// A set of voting members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub voting_members: BTreeSet<MemberId>,
}

impl ClusterConfig {
    pub fn new(members: impl IntoIterator<Item = MemberId>) -> Self {
        Self {
            voting_members: members.into_iter().collect(),
        }
    }

    pub fn is_member(&self, id: &MemberId) -> bool {
        self.voting_members.contains(id)
    }

    /// True if `acks` contains a strict majority of the voting members.
    pub fn has_quorum(&self, acks: &BTreeSet<MemberId>) -> bool {
        let quorum = self.voting_members.len() / 2 + 1;
        let count = self
            .voting_members
            .iter()
            .filter(|m| acks.contains(*m))
            .count();
        count >= quorum
    }
}

/// A configuration that may be in a joint-consensus transition.
///
/// While `new_config` is present, every quorum decision requires a majority
/// in both halves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointConfig {
    pub config: ClusterConfig,
    pub new_config: Option<ClusterConfig>,
}

impl JointConfig {
    pub fn single(config: ClusterConfig) -> Self {
        Self {
            config,
            new_config: None,
        }
    }

    pub fn is_joint(&self) -> bool {
        self.new_config.is_some()
    }

    pub fn is_member(&self, id: &MemberId) -> bool {
        self.config.is_member(id)
            || self
                .new_config
                .as_ref()
                .map_or(false, |c| c.is_member(id))
    }

    /// All members of the configuration (union of both halves when joint).
    pub fn all_members(&self) -> BTreeSet<MemberId> {
        let mut all = self.config.voting_members.clone();
        if let Some(new) = &self.new_config {
            all.extend(new.voting_members.iter().cloned());
        }
        all
    }

    /// Majority in `config` and, when joint, also in `new_config`.
    pub fn has_quorum(&self, acks: &BTreeSet<MemberId>) -> bool {
        self.config.has_quorum(acks)
            && self
                .new_config
                .as_ref()
                .map_or(true, |c| c.has_quorum(acks))
    }
}

/// AppendEntries RPC request. An empty `entries` list is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "S: StateMachine", deserialize = "S: StateMachine"))]
pub struct AppendEntriesRequest<S: StateMachine> {
    pub term: Term,
    pub leader_id: MemberId,
    /// Index of the log entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry<S>>,
    pub leader_commit: LogIndex,
}

/// How a follower disposed of an AppendEntries request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendOutcome {
    /// Entries accepted; the follower's log now extends through the batch.
    Success,
    /// Stale term or failed consistency check; the leader should back off
    /// and try again.
    Retry,
    /// The state machine's predicate refused a proposed change. Nothing was
    /// mutated; the proposal should be withdrawn.
    Rejected,
}

/// AppendEntries RPC reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub outcome: AppendOutcome,
}

/// RequestVote RPC request, sent by a candidate to all peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: MemberId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub granted: bool,
}

/// InstallSnapshot RPC request.
///
/// Carries the full state-machine image plus the configuration as of the
/// snapshot point, since the log entries that established it are gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "S: StateMachine", deserialize = "S: StateMachine"))]
pub struct InstallSnapshotRequest<S: StateMachine> {
    pub term: Term,
    pub leader_id: MemberId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub config: JointConfig,
    pub state: S,
}

/// InstallSnapshot RPC reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: Term,
}

/// Envelope for every RPC a member can receive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "S: StateMachine", deserialize = "S: StateMachine"))]
pub enum RpcRequest<S: StateMachine> {
    AppendEntries(AppendEntriesRequest<S>),
    RequestVote(RequestVoteRequest),
    InstallSnapshot(InstallSnapshotRequest<S>),
}

/// Envelope for every RPC reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcReply {
    AppendEntries(AppendEntriesReply),
    RequestVote(RequestVoteReply),
    InstallSnapshot(InstallSnapshotReply),
}
