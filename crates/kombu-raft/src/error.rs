//! Raft error types.

use thiserror::Error;

use crate::types::MemberId;

/// Raft errors.
///
/// RPC handlers never surface errors to peers; failure is encoded in the
/// reply outcome. These errors cover the client-facing paths (proposals)
/// and the adapter seams (network, storage).
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader; `leader` redirects to the current term's leader when
    /// known.
    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<MemberId> },

    /// The state machine's predicate refused the proposed change.
    #[error("change rejected by the state machine")]
    ProposalRejected,

    /// A configuration transition is already in flight.
    #[error("a configuration change is already in progress")]
    ConfigChangeInProgress,

    /// The peer could not be reached.
    #[error("peer {member} is unreachable")]
    Unreachable { member: MemberId },

    /// The operation was cancelled (member shutting down).
    #[error("operation cancelled")]
    Cancelled,

    /// Persistent-state image could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Raft result type.
pub type Result<T> = std::result::Result<T, RaftError>;
