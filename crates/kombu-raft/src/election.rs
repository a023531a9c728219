//! Leader election: the randomized timer and the candidate's vote round.
//!
//! Followers and candidates wait a randomized timeout; hearing from a
//! legitimate leader (or granting a vote) resets it. On expiry the member
//! increments its term, votes for itself, persists, and fans RequestVote
//! out to every member of every active configuration. Winning requires a
//! majority in each of them.

use crate::config::RaftOptions;
use crate::member::MemberInner;
use crate::replication::{self, LeadExit};
use crate::state_machine::StateMachine;
use crate::types::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};

/// Resettable election timer.
///
/// Each wait draws a fresh random timeout; a reset restarts the wait with a
/// new draw.
pub(crate) struct ElectionTimer {
    reset: Notify,
}

impl ElectionTimer {
    pub(crate) fn new() -> Self {
        Self {
            reset: Notify::new(),
        }
    }

    /// Restart the current wait. Called on every message from a legitimate
    /// leader and on every granted vote.
    pub(crate) fn reset(&self) {
        self.reset.notify_waiters();
    }

    /// Sleep until a full randomized timeout elapses without a reset.
    pub(crate) async fn wait(&self, options: &RaftOptions) {
        loop {
            let timeout = options.random_election_timeout();
            tokio::select! {
                _ = tokio::time::sleep(timeout) => return,
                _ = self.reset.notified() => {}
            }
        }
    }
}

/// The election-restriction comparison: a candidate is at least as
/// up-to-date as us iff its last entry's term is newer, or equal with an
/// index at least as large.
pub(crate) fn is_log_up_to_date(
    candidate_last_term: Term,
    candidate_last_index: LogIndex,
    our_last_term: Term,
    our_last_index: LogIndex,
) -> bool {
    candidate_last_term > our_last_term
        || (candidate_last_term == our_last_term && candidate_last_index >= our_last_index)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ElectionOutcome {
    Won,
    Lost,
    NoQuorum,
}

/// One candidacy: bump the term, vote for self, collect votes, and take
/// office on a quorum in every active configuration.
pub(crate) async fn run_election<S: StateMachine>(
    inner: &Arc<MemberInner<S>>,
) -> ElectionOutcome {
    let (term, request, voters, configs) = {
        let mut st = inner.state.lock().await;
        if st.role == Role::Leader {
            return ElectionOutcome::Lost;
        }
        let members = st.election_members();
        if !members.contains(&inner.id) {
            tracing::debug!(member = %inner.id, "not a voting member; staying follower");
            return ElectionOutcome::Lost;
        }

        let term = st.persistent.current_term.next();
        st.persistent.current_term = term;
        st.persistent.voted_for = Some(inner.id.clone());
        st.this_term_leader = None;
        st.role = Role::Candidate;
        inner.persist_locked(&st).await;

        let request = RequestVoteRequest {
            term,
            candidate_id: inner.id.clone(),
            last_log_index: st.persistent.log.latest_index(),
            last_log_term: st.persistent.log.latest_term(),
        };
        let voters: Vec<MemberId> = members.into_iter().filter(|m| *m != inner.id).collect();
        (term, request, voters, st.active_configs())
    };
    tracing::info!(member = %inner.id, term = %term, "election timeout, requesting votes");

    let rpc_timeout = inner.options.election_timeout_min;
    let vote_futures = voters.into_iter().map(|peer| {
        let transport = inner.transport.clone();
        let request = request.clone();
        async move {
            let reply = tokio::time::timeout(
                rpc_timeout,
                transport.send(&peer, RpcRequest::RequestVote(request)),
            )
            .await;
            (peer, reply)
        }
    });
    let results = futures::future::join_all(vote_futures).await;

    let mut granted: BTreeSet<MemberId> = BTreeSet::new();
    granted.insert(inner.id.clone());
    let mut highest = term;
    for (peer, reply) in results {
        match reply {
            Ok(Ok(RpcReply::RequestVote(r))) => {
                if r.term > highest {
                    highest = r.term;
                }
                if r.granted && r.term == term {
                    granted.insert(peer);
                }
            }
            Ok(Ok(_)) => tracing::warn!(member = %inner.id, peer = %peer, "mismatched rpc reply"),
            Ok(Err(_)) | Err(_) => {}
        }
    }

    if highest > term {
        let mut st = inner.state.lock().await;
        if highest > st.persistent.current_term {
            inner.bump_term_locked(&mut st, highest);
            inner.persist_locked(&st).await;
        }
        return ElectionOutcome::Lost;
    }

    if !configs.iter().all(|c| c.has_quorum(&granted)) {
        tracing::debug!(member = %inner.id, term = %term, votes = granted.len(), "no quorum, will retry");
        return ElectionOutcome::NoQuorum;
    }

    let mut st = inner.state.lock().await;
    if st.role != Role::Candidate || st.persistent.current_term != term {
        // Someone else took the term while we were counting.
        return ElectionOutcome::Lost;
    }
    tracing::info!(member = %inner.id, term = %term, votes = granted.len(), "won election");
    inner.become_leader_locked(&mut st).await;
    ElectionOutcome::Won
}

/// The member's role driver: wait out election timeouts, run candidacies,
/// and hold the leader phase until demotion or shutdown.
pub(crate) async fn driver_loop<S: StateMachine>(
    inner: Arc<MemberInner<S>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = inner.timer.wait(&inner.options) => {}
        }
        if run_election(&inner).await == ElectionOutcome::Won {
            if replication::lead(&inner, &mut shutdown).await == LeadExit::Shutdown {
                return;
            }
        }
    }
}
