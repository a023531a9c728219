//! Everything a member must write to stable storage before replying to an
//! RPC that changed it.

use crate::log::RaftLog;
use crate::state_machine::StateMachine;
use crate::types::{ClusterConfig, JointConfig, LogIndex, MemberId, Term};
use serde::{Deserialize, Serialize};

/// A member's durable state.
///
/// The snapshot is the state-machine image at the log's snapshot boundary,
/// and `snapshot_config` is the configuration in force at that point (the
/// config entries that established it may have been compacted away).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: StateMachine", deserialize = "S: StateMachine"))]
pub struct PersistentState<S: StateMachine> {
    pub current_term: Term,
    pub voted_for: Option<MemberId>,
    pub log: RaftLog<S>,
    pub snapshot: S,
    pub snapshot_config: JointConfig,
}

impl<S: StateMachine> PersistentState<S> {
    /// The state a brand-new cluster member starts from.
    pub fn make_initial(state: S, config: ClusterConfig) -> Self {
        Self {
            current_term: Term::ZERO,
            voted_for: None,
            log: RaftLog::new(LogIndex::ZERO, Term::ZERO),
            snapshot: state,
            snapshot_config: JointConfig::single(config),
        }
    }
}
