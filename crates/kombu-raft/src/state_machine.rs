//! The application-provided state machine.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// State machine replicated by the Raft member.
///
/// The type is its own snapshot image: `Clone` produces the image and
/// assignment restores it, and the `serde` bounds let the storage adapter
/// persist it. `PartialEq` is used by the invariant checker in tests, not on
/// the hot path.
///
/// Implementations must be deterministic: `accepts` is a pure predicate over
/// the current state, and `apply` must only be called for a change that
/// `accepts` approved against that same state. The member enforces the
/// second half of that contract; a change is applied on every replica in
/// the same log order.
pub trait StateMachine:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The change type replicated through the log.
    type Change: Clone
        + fmt::Debug
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Whether `change` may be applied to the current state.
    ///
    /// Evaluated against speculative state (committed state plus the
    /// accepted-but-uncommitted log tail), so a proposal can be refused
    /// before it ever reaches the log. Must not mutate.
    fn accepts(&self, change: &Self::Change) -> bool;

    /// Apply `change` to the state.
    fn apply(&mut self, change: &Self::Change);
}
