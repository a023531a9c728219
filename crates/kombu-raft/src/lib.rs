//! kombu-raft: a per-replica Raft consensus member.
//!
//! Implements the Raft protocol for a single replicated state machine:
//! - Leader election with randomized timeouts
//! - Log replication with conflict backtracking
//! - Snapshot-on-apply compaction and InstallSnapshot catch-up
//! - Joint consensus for safe membership changes
//! - An application predicate that can refuse proposals before they commit
//!
//! The member is generic over the application [`StateMachine`] and talks to
//! the outside world through two seams: a [`transport::RaftTransport`] that
//! delivers RPCs to peers, and a [`storage::RaftStorage`] that durably
//! records persistent state before any reply depending on it goes out.
//! In-memory implementations of both ship for tests and embedding.
//!
//! Based on the Raft paper (Ongaro & Ousterhout, 2014).

pub mod config;
pub mod election;
pub mod error;
pub mod log;
pub mod member;
pub mod persist;
pub mod replication;
pub mod state_machine;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::RaftOptions;
pub use error::{RaftError, Result};
pub use member::{ChangeOutcome, ChangeToken, CommittedState, RaftMember};
pub use persist::PersistentState;
pub use state_machine::StateMachine;
pub use types::*;
