//! The Raft member: one replica's role state machine.
//!
//! All member state lives behind a single async mutex. Every RPC handler,
//! client proposal and role transition acquires it before touching anything,
//! and storage writes happen with it held so that "persisted before reply"
//! is atomic with respect to every other handler. RPC sends never hold it.
//!
//! Two background tasks are spawned per member: a driver that owns the role
//! lifecycle (election timeouts, candidacy, and the leader phase with its
//! per-peer replication tasks), and an inbox loop that dispatches incoming
//! RPCs to the handlers.

use crate::config::RaftOptions;
use crate::election::{self, ElectionTimer};
use crate::error::{RaftError, Result};
use crate::log::RaftLog;
use crate::persist::PersistentState;
use crate::state_machine::StateMachine;
use crate::storage::RaftStorage;
use crate::transport::{RaftTransport, RpcReceiver};
use crate::types::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;

/// The committed projection published to observers: the state machine with
/// every committed change applied, plus the configuration in force there.
#[derive(Debug, Clone)]
pub struct CommittedState<S: StateMachine> {
    pub index: LogIndex,
    pub state: S,
    pub config: JointConfig,
}

/// How a proposed change ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// The change committed at the index the token was issued for.
    Committed,
    /// Another entry took the slot, or leadership was lost before commit.
    /// The change is not known to have committed (it may still, through a
    /// later leader).
    Superseded,
    /// A replica's state machine refused the change.
    Rejected,
}

/// Handle to a proposed change, resolved when its `(index, term)` slot
/// commits or is given up on.
pub struct ChangeToken {
    index: LogIndex,
    term: Term,
    rx: oneshot::Receiver<ChangeOutcome>,
}

impl ChangeToken {
    /// The log index the change was appended at.
    pub fn index(&self) -> LogIndex {
        self.index
    }

    /// The term the change was appended in.
    pub fn term(&self) -> Term {
        self.term
    }

    /// Wait for the change to resolve.
    pub async fn wait(self) -> ChangeOutcome {
        self.rx.await.unwrap_or(ChangeOutcome::Superseded)
    }
}

pub(crate) struct PendingChange {
    index: LogIndex,
    term: Term,
    tx: oneshot::Sender<ChangeOutcome>,
}

/// Leader-only replication bookkeeping.
pub(crate) struct LeaderVolatile {
    pub(crate) next_index: HashMap<MemberId, LogIndex>,
    pub(crate) match_index: HashMap<MemberId, LogIndex>,
    /// Index of the Noop appended on accession; once it commits, a quorum
    /// has been contacted in this term and the member is ready for changes.
    pub(crate) start_index: LogIndex,
}

/// Everything guarded by the member mutex.
pub(crate) struct MemberState<S: StateMachine> {
    pub(crate) persistent: PersistentState<S>,
    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) role: Role,
    /// The leader of the current term, once discovered. Never reassigned
    /// within a term.
    pub(crate) this_term_leader: Option<MemberId>,
    /// Snapshot plus every committed change: the state at `last_applied`.
    pub(crate) committed_state: S,
    /// Configuration as of `last_applied`.
    pub(crate) committed_config: JointConfig,
    /// Speculative projection: committed state plus the accepted but
    /// uncommitted log tail. Proposals are vetted against this.
    pub(crate) latest_state: S,
    pub(crate) leader: Option<LeaderVolatile>,
    pub(crate) pending: Vec<PendingChange>,
}

impl<S: StateMachine> MemberState<S> {
    /// Every configuration that currently constrains quorum decisions: the
    /// committed one plus any uncommitted config entries in the log.
    pub(crate) fn active_configs(&self) -> Vec<JointConfig> {
        let mut configs = vec![self.committed_config.clone()];
        let mut i = self.commit_index.0 + 1;
        while i <= self.persistent.log.latest_index().0 {
            if let EntryPayload::Config(c) = &self.persistent.log.get(LogIndex(i)).payload {
                configs.push(c.clone());
            }
            i += 1;
        }
        configs
    }

    /// Union of the members of all active configurations.
    pub(crate) fn election_members(&self) -> BTreeSet<MemberId> {
        let mut members = BTreeSet::new();
        for config in self.active_configs() {
            members.extend(config.all_members());
        }
        members
    }

    pub(crate) fn has_uncommitted_config(&self) -> bool {
        let mut i = self.commit_index.0 + 1;
        while i <= self.persistent.log.latest_index().0 {
            if matches!(
                self.persistent.log.get(LogIndex(i)).payload,
                EntryPayload::Config(_)
            ) {
                return true;
            }
            i += 1;
        }
        false
    }

    /// Recompute the speculative projection from the committed one.
    pub(crate) fn rebuild_latest(&mut self) {
        let mut state = self.committed_state.clone();
        let mut i = self.commit_index.0 + 1;
        while i <= self.persistent.log.latest_index().0 {
            if let EntryPayload::Change(c) = &self.persistent.log.get(LogIndex(i)).payload {
                state.apply(c);
            }
            i += 1;
        }
        self.latest_state = state;
    }
}

/// Shared core of a member, owned jointly by the handle and its tasks.
pub(crate) struct MemberInner<S: StateMachine> {
    pub(crate) id: MemberId,
    pub(crate) options: RaftOptions,
    pub(crate) transport: Arc<dyn RaftTransport<S>>,
    pub(crate) storage: Arc<dyn RaftStorage<S>>,
    pub(crate) state: Mutex<MemberState<S>>,
    pub(crate) committed_tx: watch::Sender<CommittedState<S>>,
    pub(crate) readiness_tx: watch::Sender<bool>,
    pub(crate) config_readiness_tx: watch::Sender<bool>,
    pub(crate) timer: ElectionTimer,
    /// Pulsed when the log or the commit point moves; wakes replicators.
    pub(crate) replicate: Notify,
    /// Pulsed on demotion and configuration changes; wakes the leader loop.
    pub(crate) leader_events: Notify,
}

impl<S: StateMachine> MemberInner<S> {
    /// Write the persistent state through the storage adapter. Called with
    /// the member mutex held; an adapter failure is unrecoverable.
    pub(crate) async fn persist_locked(&self, st: &MemberState<S>) {
        if let Err(e) = self.storage.write_persistent_state(&st.persistent).await {
            panic!("member {}: persistent state write failed: {e}", self.id);
        }
    }

    /// Adopt a higher term: clear the vote and leader records and fall back
    /// to Follower. The caller persists before replying.
    pub(crate) fn bump_term_locked(&self, st: &mut MemberState<S>, term: Term) {
        debug_assert!(term > st.persistent.current_term);
        tracing::debug!(member = %self.id, old = %st.persistent.current_term, new = %term, "adopting higher term");
        st.persistent.current_term = term;
        st.persistent.voted_for = None;
        st.this_term_leader = None;
        self.demote_locked(st);
    }

    /// Fall back to Follower in the current term, tearing down leader
    /// bookkeeping and failing any in-flight proposals.
    pub(crate) fn demote_locked(&self, st: &mut MemberState<S>) {
        st.role = Role::Follower;
        st.leader = None;
        self.fail_pending_above_locked(st, LogIndex::ZERO, ChangeOutcome::Superseded);
        self.refresh_readiness_locked(st);
        self.leader_events.notify_waiters();
    }

    pub(crate) fn fail_pending_above_locked(
        &self,
        st: &mut MemberState<S>,
        above: LogIndex,
        outcome: ChangeOutcome,
    ) {
        let mut i = 0;
        while i < st.pending.len() {
            if st.pending[i].index > above {
                let p = st.pending.swap_remove(i);
                let _ = p.tx.send(outcome);
            } else {
                i += 1;
            }
        }
    }

    pub(crate) fn fail_pending_in_range_locked(
        &self,
        st: &mut MemberState<S>,
        above: LogIndex,
        through: LogIndex,
        outcome: ChangeOutcome,
    ) {
        let mut i = 0;
        while i < st.pending.len() {
            if st.pending[i].index > above && st.pending[i].index <= through {
                let p = st.pending.swap_remove(i);
                let _ = p.tx.send(outcome);
            } else {
                i += 1;
            }
        }
    }

    fn refresh_readiness_locked(&self, st: &MemberState<S>) {
        let ready = st.role == Role::Leader
            && st
                .leader
                .as_ref()
                .map_or(false, |l| st.commit_index >= l.start_index);
        let config_ready =
            ready && !st.committed_config.is_joint() && !st.has_uncommitted_config();
        self.readiness_tx.send_if_modified(|v| {
            let changed = *v != ready;
            *v = ready;
            changed
        });
        self.config_readiness_tx.send_if_modified(|v| {
            let changed = *v != config_ready;
            *v = config_ready;
            changed
        });
    }

    fn publish_committed_locked(&self, st: &MemberState<S>) {
        self.committed_tx.send_replace(CommittedState {
            index: st.commit_index,
            state: st.committed_state.clone(),
            config: st.committed_config.clone(),
        });
    }

    fn record_leader_locked(&self, st: &mut MemberState<S>, leader_id: &MemberId) {
        match &st.this_term_leader {
            None => st.this_term_leader = Some(leader_id.clone()),
            Some(known) if known == leader_id => {}
            Some(known) => panic!(
                "two leaders in {}: {} and {}",
                st.persistent.current_term, known, leader_id
            ),
        }
    }

    /// Drop the uncommitted tail above `keep_through`, failing its tokens
    /// and recomputing the speculative projection.
    fn truncate_tail_locked(&self, st: &mut MemberState<S>, keep_through: LogIndex) {
        if keep_through < st.commit_index {
            panic!(
                "member {}: refusing to truncate committed entries (through {}, commit {})",
                self.id, keep_through, st.commit_index
            );
        }
        st.persistent.log.truncate_after(keep_through);
        self.fail_pending_above_locked(st, keep_through, ChangeOutcome::Superseded);
        st.rebuild_latest();
    }

    /// If the committed configuration is joint and its successor is not yet
    /// in the log, append it. Returns true if an entry was appended.
    fn complete_config_transition_locked(&self, st: &mut MemberState<S>) -> bool {
        if st.role != Role::Leader {
            return false;
        }
        let Some(new) = st.committed_config.new_config.clone() else {
            return false;
        };
        if st.has_uncommitted_config() {
            return false;
        }
        let term = st.persistent.current_term;
        tracing::info!(member = %self.id, term = %term, "completing configuration transition");
        st.persistent
            .log
            .append(LogEntry::new(term, EntryPayload::Config(JointConfig::single(new))));
        self.replicate.notify_waiters();
        self.leader_events.notify_waiters();
        true
    }

    /// Raise the commit point to `target`, applying the newly committed
    /// entries in order, resolving tokens, performing the leader's
    /// configuration duties, and folding the applied prefix into the
    /// snapshot when it outgrows the retention threshold.
    ///
    /// Returns true if persistent state changed (the caller must persist).
    pub(crate) fn update_commit_index_locked(
        &self,
        st: &mut MemberState<S>,
        target: LogIndex,
    ) -> bool {
        if target <= st.commit_index {
            return false;
        }
        if target > st.persistent.log.latest_index() {
            panic!(
                "member {}: commit target {} past log tail {}",
                self.id,
                target,
                st.persistent.log.latest_index()
            );
        }
        st.commit_index = target;
        let mut dirty = false;

        while st.last_applied < target {
            let index = st.last_applied.next();
            let payload = st.persistent.log.get(index).payload.clone();
            match payload {
                EntryPayload::Change(c) => st.committed_state.apply(&c),
                EntryPayload::Config(config) => st.committed_config = config,
                EntryPayload::Noop => {}
            }
            st.last_applied = index;
        }

        // Resolve tokens whose slot has now committed. Their entries are
        // still in the log: compaction runs below.
        let mut i = 0;
        while i < st.pending.len() {
            if st.pending[i].index <= target {
                let p = st.pending.swap_remove(i);
                let outcome = if st.persistent.log.entry_term(p.index) == p.term {
                    ChangeOutcome::Committed
                } else {
                    ChangeOutcome::Superseded
                };
                let _ = p.tx.send(outcome);
            } else {
                i += 1;
            }
        }

        if st.role == Role::Leader {
            if st.committed_config.is_joint() {
                if self.complete_config_transition_locked(st) {
                    dirty = true;
                }
            } else if !st.committed_config.is_member(&self.id) {
                tracing::info!(member = %self.id, "stepping down: excluded from the committed configuration");
                self.demote_locked(st);
            }
        }

        if st.last_applied.0 - st.persistent.log.prev_index().0 > self.options.snapshot_threshold
        {
            st.persistent.snapshot = st.committed_state.clone();
            st.persistent.snapshot_config = st.committed_config.clone();
            st.persistent.log.truncate_through(st.last_applied);
            dirty = true;
        }

        self.publish_committed_locked(st);
        self.refresh_readiness_locked(st);
        if st.role == Role::Leader {
            self.replicate.notify_waiters();
        }
        dirty
    }

    /// Leader-side commit advancement: the highest index carrying a
    /// current-term entry that a majority of every active configuration has
    /// replicated.
    pub(crate) fn advance_commit_locked(&self, st: &mut MemberState<S>) -> bool {
        let mut dirty = false;
        loop {
            if st.role != Role::Leader {
                return dirty;
            }
            let current = st.persistent.current_term;
            let configs = st.active_configs();
            let Some(leader) = st.leader.as_ref() else {
                return dirty;
            };

            let mut target = None;
            let mut n = st.persistent.log.latest_index();
            while n > st.commit_index {
                if st.persistent.log.entry_term(n) == current {
                    let mut acks: BTreeSet<MemberId> = leader
                        .match_index
                        .iter()
                        .filter(|(_, m)| **m >= n)
                        .map(|(p, _)| p.clone())
                        .collect();
                    acks.insert(self.id.clone());
                    if configs.iter().all(|c| c.has_quorum(&acks)) {
                        target = Some(n);
                        break;
                    }
                }
                n = LogIndex(n.0 - 1);
            }

            match target {
                Some(n) => {
                    if self.update_commit_index_locked(st, n) {
                        dirty = true;
                    }
                    // A completed config transition may have appended an
                    // entry that is itself already committable (small
                    // clusters); go around again.
                }
                None => return dirty,
            }
        }
    }

    /// Accession: record ourselves as this term's leader, append the Noop
    /// that makes commit advancement uniform, initialize replication
    /// bookkeeping, and finish any interrupted configuration transition.
    pub(crate) async fn become_leader_locked(&self, st: &mut MemberState<S>) {
        let term = st.persistent.current_term;
        st.role = Role::Leader;
        self.record_leader_locked(st, &self.id.clone());

        st.persistent
            .log
            .append(LogEntry::new(term, EntryPayload::Noop));
        let noop_index = st.persistent.log.latest_index();

        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in st.election_members() {
            if peer != self.id {
                next_index.insert(peer.clone(), noop_index.next());
                match_index.insert(peer, LogIndex::ZERO);
            }
        }
        st.leader = Some(LeaderVolatile {
            next_index,
            match_index,
            start_index: noop_index,
        });

        self.complete_config_transition_locked(st);
        self.persist_locked(st).await;
        if self.advance_commit_locked(st) {
            self.persist_locked(st).await;
        }
        self.refresh_readiness_locked(st);
        self.replicate.notify_waiters();
        tracing::info!(member = %self.id, term = %term, "became leader");
    }

    /// AppendEntries handler (§ the replication RPC).
    pub(crate) async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest<S>,
    ) -> AppendEntriesReply {
        let mut st = self.state.lock().await;
        let mut dirty = false;

        if req.term > st.persistent.current_term {
            self.bump_term_locked(&mut st, req.term);
            dirty = true;
        }
        let current = st.persistent.current_term;
        if req.term < current {
            return AppendEntriesReply {
                term: current,
                outcome: AppendOutcome::Retry,
            };
        }

        match st.role {
            Role::Leader => panic!(
                "member {}: AppendEntries from {} while leading {}",
                self.id, req.leader_id, current
            ),
            Role::Candidate => {
                tracing::debug!(member = %self.id, term = %current, leader = %req.leader_id, "candidate yielding to leader");
                st.role = Role::Follower;
            }
            Role::Follower => {}
        }
        self.timer.reset();

        let latest_incoming = LogIndex(req.prev_log_index.0 + req.entries.len() as u64);

        // Entries at or below our snapshot boundary are already committed
        // here; skip them and anchor the batch at the boundary.
        let boundary = st.persistent.log.prev_index();
        let mut prev_index = req.prev_log_index;
        let mut prev_term = req.prev_log_term;
        let mut entries = req.entries;
        if prev_index < boundary {
            if latest_incoming <= boundary {
                self.record_leader_locked(&mut st, &req.leader_id);
                if dirty {
                    self.persist_locked(&st).await;
                }
                return AppendEntriesReply {
                    term: current,
                    outcome: AppendOutcome::Success,
                };
            }
            entries.drain(..(boundary.0 - prev_index.0) as usize);
            prev_index = boundary;
            prev_term = st.persistent.log.prev_term();
        }

        // Application veto: every incoming change that the leader has not
        // already committed is probed against the speculative state it
        // would apply to. A refusal mutates nothing.
        let check_from = LogIndex(latest_incoming.0.min(req.leader_commit.0));
        if prev_index <= st.persistent.log.latest_index() {
            let needs_check = entries.iter().enumerate().any(|(k, e)| {
                LogIndex(prev_index.0 + 1 + k as u64) > check_from
                    && matches!(e.payload, EntryPayload::Change(_))
            });
            if needs_check {
                let mut probe = st.persistent.snapshot.clone();
                let mut i = boundary.0 + 1;
                while i <= prev_index.0 {
                    if let EntryPayload::Change(c) =
                        &st.persistent.log.get(LogIndex(i)).payload
                    {
                        probe.apply(c);
                    }
                    i += 1;
                }
                for (k, e) in entries.iter().enumerate() {
                    let index = LogIndex(prev_index.0 + 1 + k as u64);
                    if let EntryPayload::Change(c) = &e.payload {
                        if index > check_from && !probe.accepts(c) {
                            tracing::debug!(member = %self.id, %index, "refusing proposed change");
                            if dirty {
                                self.persist_locked(&st).await;
                            }
                            return AppendEntriesReply {
                                term: current,
                                outcome: AppendOutcome::Rejected,
                            };
                        }
                        probe.apply(c);
                    }
                }
            }
        }

        // Consistency check.
        if prev_index > st.persistent.log.latest_index()
            || st.persistent.log.entry_term(prev_index) != prev_term
        {
            if dirty {
                self.persist_locked(&st).await;
            }
            return AppendEntriesReply {
                term: current,
                outcome: AppendOutcome::Retry,
            };
        }

        // Truncate at the first conflict, then append whatever is new.
        for (k, e) in entries.into_iter().enumerate() {
            let index = LogIndex(prev_index.0 + 1 + k as u64);
            if index <= st.persistent.log.latest_index() {
                if st.persistent.log.entry_term(index) != e.term {
                    self.truncate_tail_locked(&mut st, LogIndex(index.0 - 1));
                    if let EntryPayload::Change(c) = &e.payload {
                        st.latest_state.apply(c);
                    }
                    st.persistent.log.append(e);
                    dirty = true;
                }
            } else {
                if let EntryPayload::Change(c) = &e.payload {
                    st.latest_state.apply(c);
                }
                st.persistent.log.append(e);
                dirty = true;
            }
        }

        if req.leader_commit > st.commit_index {
            let target = LogIndex(req.leader_commit.0.min(latest_incoming.0));
            if self.update_commit_index_locked(&mut st, target) {
                dirty = true;
            }
        }

        self.record_leader_locked(&mut st, &req.leader_id);
        if dirty {
            self.persist_locked(&st).await;
        }
        AppendEntriesReply {
            term: current,
            outcome: AppendOutcome::Success,
        }
    }

    /// RequestVote handler.
    pub(crate) async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteReply {
        let mut st = self.state.lock().await;
        let mut dirty = false;

        if req.term > st.persistent.current_term {
            self.bump_term_locked(&mut st, req.term);
            dirty = true;
        }
        let current = st.persistent.current_term;

        let mut granted = false;
        if req.term == current {
            let denied_by_vote = st
                .persistent
                .voted_for
                .as_ref()
                .map_or(false, |v| v != &req.candidate_id);
            if !denied_by_vote
                && election::is_log_up_to_date(
                    req.last_log_term,
                    req.last_log_index,
                    st.persistent.log.latest_term(),
                    st.persistent.log.latest_index(),
                )
            {
                granted = true;
                if st.persistent.voted_for.is_none() {
                    st.persistent.voted_for = Some(req.candidate_id.clone());
                    dirty = true;
                }
                self.timer.reset();
            }
        }

        if dirty {
            self.persist_locked(&st).await;
        }
        RequestVoteReply {
            term: current,
            granted,
        }
    }

    /// InstallSnapshot handler.
    pub(crate) async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest<S>,
    ) -> InstallSnapshotReply {
        let mut st = self.state.lock().await;
        let mut dirty = false;

        if req.term > st.persistent.current_term {
            self.bump_term_locked(&mut st, req.term);
            dirty = true;
        }
        let current = st.persistent.current_term;
        if req.term < current {
            return InstallSnapshotReply { term: current };
        }

        match st.role {
            Role::Leader => panic!(
                "member {}: InstallSnapshot from {} while leading {}",
                self.id, req.leader_id, current
            ),
            Role::Candidate => st.role = Role::Follower,
            Role::Follower => {}
        }
        self.timer.reset();

        let covered = req.last_included_index <= st.persistent.log.prev_index()
            || (req.last_included_index <= st.persistent.log.latest_index()
                && st.persistent.log.entry_term(req.last_included_index)
                    == req.last_included_term);
        if !covered {
            if st.commit_index > req.last_included_index {
                panic!(
                    "member {}: snapshot at {} conflicts with commit {}",
                    self.id, req.last_included_index, st.commit_index
                );
            }
            st.persistent.snapshot = req.state;
            st.persistent.snapshot_config = req.config.clone();
            st.persistent
                .log
                .reset_to(req.last_included_index, req.last_included_term);
            st.commit_index = req.last_included_index;
            st.last_applied = req.last_included_index;
            st.committed_state = st.persistent.snapshot.clone();
            st.committed_config = req.config;
            self.fail_pending_above_locked(&mut st, LogIndex::ZERO, ChangeOutcome::Superseded);
            st.rebuild_latest();
            self.publish_committed_locked(&st);
            self.record_leader_locked(&mut st, &req.leader_id);
            dirty = true;
            tracing::info!(
                member = %self.id,
                index = %req.last_included_index,
                term = %req.last_included_term,
                "installed snapshot"
            );
        }

        if dirty {
            self.persist_locked(&st).await;
        }
        InstallSnapshotReply { term: current }
    }

    /// Leader-only: vet a change against the speculative state and append it.
    pub(crate) async fn propose_change(&self, change: S::Change) -> Result<ChangeToken> {
        let mut st = self.state.lock().await;
        if st.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: st.this_term_leader.clone(),
            });
        }
        if !st.latest_state.accepts(&change) {
            return Err(RaftError::ProposalRejected);
        }
        st.latest_state.apply(&change);

        let term = st.persistent.current_term;
        let index = st.persistent.log.latest_index().next();
        st.persistent
            .log
            .append(LogEntry::new(term, EntryPayload::Change(change)));

        let (tx, rx) = oneshot::channel();
        st.pending.push(PendingChange { index, term, tx });

        self.persist_locked(&st).await;
        if self.advance_commit_locked(&mut st) {
            self.persist_locked(&st).await;
        }
        self.replicate.notify_waiters();
        Ok(ChangeToken { index, term, rx })
    }

    /// Leader-only: start a joint-consensus transition to `new_config`.
    pub(crate) async fn propose_config_change(
        &self,
        new_config: ClusterConfig,
    ) -> Result<ChangeToken> {
        let mut st = self.state.lock().await;
        if st.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: st.this_term_leader.clone(),
            });
        }
        if st.committed_config.is_joint() || st.has_uncommitted_config() {
            return Err(RaftError::ConfigChangeInProgress);
        }

        let joint = JointConfig {
            config: st.committed_config.config.clone(),
            new_config: Some(new_config),
        };
        let term = st.persistent.current_term;
        let index = st.persistent.log.latest_index().next();
        tracing::info!(member = %self.id, term = %term, %index, "proposing configuration change");
        st.persistent
            .log
            .append(LogEntry::new(term, EntryPayload::Config(joint)));

        let (tx, rx) = oneshot::channel();
        st.pending.push(PendingChange { index, term, tx });

        self.persist_locked(&st).await;
        if self.advance_commit_locked(&mut st) {
            self.persist_locked(&st).await;
        }
        self.refresh_readiness_locked(&st);
        self.replicate.notify_waiters();
        self.leader_events.notify_waiters();
        Ok(ChangeToken { index, term, rx })
    }
}

/// A running Raft member.
pub struct RaftMember<S: StateMachine> {
    inner: Arc<MemberInner<S>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<S: StateMachine> RaftMember<S> {
    /// Bring up a member from initial or recovered persistent state.
    ///
    /// The member immediately participates: it answers RPCs arriving on
    /// `rpc_rx` and runs elections when it hears no leader.
    pub fn new(
        id: MemberId,
        options: RaftOptions,
        persistent: PersistentState<S>,
        storage: Arc<dyn RaftStorage<S>>,
        transport: Arc<dyn RaftTransport<S>>,
        rpc_rx: RpcReceiver<S>,
    ) -> Self {
        if let Err(e) = options.validate() {
            panic!("invalid raft options: {e}");
        }

        let commit = persistent.log.prev_index();
        let committed_state = persistent.snapshot.clone();
        let committed_config = persistent.snapshot_config.clone();

        // The speculative projection restarts from the snapshot plus the
        // recovered tail; every entry in it passed the predicate before it
        // was appended.
        let mut latest_state = committed_state.clone();
        let mut i = commit.0 + 1;
        while i <= persistent.log.latest_index().0 {
            if let EntryPayload::Change(c) = &persistent.log.get(LogIndex(i)).payload {
                latest_state.apply(c);
            }
            i += 1;
        }

        let state = MemberState {
            persistent,
            commit_index: commit,
            last_applied: commit,
            role: Role::Follower,
            this_term_leader: None,
            committed_state,
            committed_config,
            latest_state,
            leader: None,
            pending: Vec::new(),
        };

        let (committed_tx, _) = watch::channel(CommittedState {
            index: state.commit_index,
            state: state.committed_state.clone(),
            config: state.committed_config.clone(),
        });
        let (readiness_tx, _) = watch::channel(false);
        let (config_readiness_tx, _) = watch::channel(false);

        let inner = Arc::new(MemberInner {
            id,
            options,
            transport,
            storage,
            state: Mutex::new(state),
            committed_tx,
            readiness_tx,
            config_readiness_tx,
            timer: ElectionTimer::new(),
            replicate: Notify::new(),
            leader_events: Notify::new(),
        });

        let (shutdown_tx, _) = broadcast::channel(4);
        let tasks = vec![
            tokio::spawn(election::driver_loop(
                inner.clone(),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(rpc_loop(inner.clone(), rpc_rx, shutdown_tx.subscribe())),
        ];

        Self {
            inner,
            shutdown_tx,
            tasks: parking_lot::Mutex::new(tasks),
        }
    }

    pub fn id(&self) -> &MemberId {
        &self.inner.id
    }

    pub async fn current_term(&self) -> Term {
        self.inner.state.lock().await.persistent.current_term
    }

    pub async fn role(&self) -> Role {
        self.inner.state.lock().await.role
    }

    pub async fn commit_index(&self) -> LogIndex {
        self.inner.state.lock().await.commit_index
    }

    /// The committed projection, updated on every apply.
    pub fn committed_state(&self) -> watch::Receiver<CommittedState<S>> {
        self.inner.committed_tx.subscribe()
    }

    /// True while this member is a leader that has committed in its term
    /// (i.e. it has contacted a quorum and can take proposals).
    pub fn readiness_for_change(&self) -> watch::Receiver<bool> {
        self.inner.readiness_tx.subscribe()
    }

    /// Like `readiness_for_change`, and additionally no configuration
    /// transition is in flight.
    pub fn readiness_for_config_change(&self) -> watch::Receiver<bool> {
        self.inner.config_readiness_tx.subscribe()
    }

    /// Propose a change. Fails fast with `NotLeader` (with a redirection
    /// hint) on non-leaders and with `ProposalRejected` when the state
    /// machine's predicate refuses the change.
    pub async fn propose_change(&self, change: S::Change) -> Result<ChangeToken> {
        self.inner.propose_change(change).await
    }

    /// Propose a membership change, run through joint consensus.
    pub async fn propose_config_change(&self, new_config: ClusterConfig) -> Result<ChangeToken> {
        self.inner.propose_config_change(new_config).await
    }

    /// A persistent-state image a joining member can start from: the
    /// committed projection with an empty log anchored at the commit point.
    pub async fn get_state_for_init(&self) -> PersistentState<S> {
        let st = self.inner.state.lock().await;
        PersistentState {
            current_term: st.persistent.current_term,
            voted_for: None,
            log: RaftLog::new(st.commit_index, st.persistent.log.entry_term(st.commit_index)),
            snapshot: st.committed_state.clone(),
            snapshot_config: st.committed_config.clone(),
        }
    }

    /// Direct handler access, for embedding without the inbox loop and for
    /// tests.
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest<S>,
    ) -> AppendEntriesReply {
        self.inner.handle_append_entries(req).await
    }

    pub async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteReply {
        self.inner.handle_request_vote(req).await
    }

    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest<S>,
    ) -> InstallSnapshotReply {
        self.inner.handle_install_snapshot(req).await
    }

    /// Stop and join every background task. Pending proposals fail.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Assert the protocol invariants across a set of members, locking each
    /// in turn. Intended for tests; panics on violation.
    pub async fn check_invariants(members: &[&RaftMember<S>]) {
        let mut states = Vec::new();
        for m in members {
            states.push((m.inner.id.clone(), m.inner.state.lock().await));
        }

        for (id, st) in &states {
            assert!(st.last_applied <= st.commit_index, "{id}: applied past commit");
            assert!(
                st.commit_index <= st.persistent.log.latest_index(),
                "{id}: commit past log tail"
            );
            assert!(
                st.commit_index >= st.persistent.log.prev_index(),
                "{id}: commit below snapshot boundary"
            );
            if st.role == Role::Leader {
                assert_eq!(
                    st.this_term_leader.as_ref(),
                    Some(id),
                    "{id}: leader has not recorded itself"
                );
            }
        }

        let mut leaders: HashMap<Term, MemberId> = HashMap::new();
        for (id, st) in &states {
            if st.role == Role::Leader {
                if let Some(other) = leaders.insert(st.persistent.current_term, id.clone()) {
                    panic!(
                        "two leaders in {}: {} and {}",
                        st.persistent.current_term, other, id
                    );
                }
            }
        }

        for a in 0..states.len() {
            for b in a + 1..states.len() {
                let (ida, sa) = &states[a];
                let (idb, sb) = &states[b];
                let la = &sa.persistent.log;
                let lb = &sb.persistent.log;
                let lo = la.prev_index().max(lb.prev_index());
                let hi = la.latest_index().min(lb.latest_index());

                // Find the topmost common index where terms agree; the log
                // matching property requires everything below it to agree
                // too.
                let mut top = None;
                let mut i = hi.0;
                while i > lo.0 {
                    if la.entry_term(LogIndex(i)) == lb.entry_term(LogIndex(i)) {
                        top = Some(i);
                        break;
                    }
                    i -= 1;
                }
                if let Some(top) = top {
                    let mut i = lo.0 + 1;
                    while i <= top {
                        assert_eq!(
                            la.get(LogIndex(i)),
                            lb.get(LogIndex(i)),
                            "log matching violated between {ida} and {idb} at {i}"
                        );
                        i += 1;
                    }
                }

                // Committed entries present in both logs must agree.
                let commit_min = sa.commit_index.min(sb.commit_index).min(hi);
                let mut i = lo.0 + 1;
                while i <= commit_min.0 {
                    assert_eq!(
                        la.get(LogIndex(i)),
                        lb.get(LogIndex(i)),
                        "committed entries diverge between {ida} and {idb} at {i}"
                    );
                    i += 1;
                }

                if sa.commit_index == sb.commit_index {
                    assert_eq!(
                        sa.committed_state, sb.committed_state,
                        "committed states diverge between {ida} and {idb}"
                    );
                }
            }
        }
    }
}

/// Inbox loop: dispatch incoming RPCs to the handlers and send replies back.
pub(crate) async fn rpc_loop<S: StateMachine>(
    inner: Arc<MemberInner<S>>,
    mut rpc_rx: RpcReceiver<S>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            msg = rpc_rx.recv() => {
                let Some(msg) = msg else {
                    tracing::debug!(member = %inner.id, "rpc channel closed");
                    break;
                };
                tracing::trace!(member = %inner.id, from = %msg.sender, "rpc");
                let reply = match msg.request {
                    RpcRequest::AppendEntries(req) => {
                        RpcReply::AppendEntries(inner.handle_append_entries(req).await)
                    }
                    RpcRequest::RequestVote(req) => {
                        RpcReply::RequestVote(inner.handle_request_vote(req).await)
                    }
                    RpcRequest::InstallSnapshot(req) => {
                        RpcReply::InstallSnapshot(inner.handle_install_snapshot(req).await)
                    }
                };
                let _ = msg.reply_tx.send(reply);
            }
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::transport::{InMemoryTransport, RpcSender};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    /// Records every change it receives, refusing zero.
    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    struct Recorder {
        applied: Vec<u64>,
    }

    impl StateMachine for Recorder {
        type Change = u64;

        fn accepts(&self, change: &u64) -> bool {
            *change != 0
        }

        fn apply(&mut self, change: &u64) {
            self.applied.push(*change);
        }
    }

    /// Timeouts long enough that the driver never starts an election while
    /// a handler test is poking at the member.
    fn quiet_options() -> RaftOptions {
        RaftOptions {
            heartbeat_interval: Duration::from_secs(1),
            election_timeout_min: Duration::from_secs(3600),
            election_timeout_max: Duration::from_secs(7200),
            ..RaftOptions::default()
        }
    }

    struct TestMember {
        member: RaftMember<Recorder>,
        storage: Arc<InMemoryStorage>,
        _rpc_tx: RpcSender<Recorder>,
    }

    fn bring_up(names: &[&str], options: RaftOptions) -> TestMember {
        let id = MemberId::new(names[0]);
        let config = ClusterConfig::new(names.iter().map(|n| MemberId::new(*n)));
        let storage = Arc::new(InMemoryStorage::new());
        let transport: Arc<dyn RaftTransport<Recorder>> =
            InMemoryTransport::new(id.clone());
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let member = RaftMember::new(
            id,
            options,
            PersistentState::make_initial(Recorder::default(), config),
            storage.clone(),
            transport,
            rx,
        );
        TestMember {
            member,
            storage,
            _rpc_tx: tx,
        }
    }

    fn follower(names: &[&str]) -> TestMember {
        bring_up(names, quiet_options())
    }

    fn append_request(
        term: u64,
        leader: &str,
        prev: (u64, u64),
        changes: &[u64],
        commit: u64,
    ) -> AppendEntriesRequest<Recorder> {
        AppendEntriesRequest {
            term: Term(term),
            leader_id: MemberId::new(leader),
            prev_log_index: LogIndex(prev.0),
            prev_log_term: Term(prev.1),
            entries: changes
                .iter()
                .map(|c| LogEntry::new(Term(term), EntryPayload::Change(*c)))
                .collect(),
            leader_commit: LogIndex(commit),
        }
    }

    #[tokio::test]
    async fn grants_vote_and_persists_before_reply() {
        let t = follower(&["m1", "m2", "m3"]);

        let reply = t
            .member
            .handle_request_vote(RequestVoteRequest {
                term: Term(5),
                candidate_id: MemberId::new("m2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .await;
        assert!(reply.granted);
        assert_eq!(reply.term, Term(5));

        let ps = t.storage.recover::<Recorder>().unwrap().unwrap();
        assert_eq!(ps.current_term, Term(5));
        assert_eq!(ps.voted_for, Some(MemberId::new("m2")));

        // A competing candidate in the same term is refused.
        let reply = t
            .member
            .handle_request_vote(RequestVoteRequest {
                term: Term(5),
                candidate_id: MemberId::new("m3"),
                last_log_index: LogIndex(10),
                last_log_term: Term(4),
            })
            .await;
        assert!(!reply.granted);

        t.member.shutdown().await;
    }

    #[tokio::test]
    async fn denies_vote_for_stale_term() {
        let t = follower(&["m1", "m2", "m3"]);

        t.member
            .handle_request_vote(RequestVoteRequest {
                term: Term(5),
                candidate_id: MemberId::new("m2"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .await;

        let reply = t
            .member
            .handle_request_vote(RequestVoteRequest {
                term: Term(3),
                candidate_id: MemberId::new("m3"),
                last_log_index: LogIndex(100),
                last_log_term: Term(3),
            })
            .await;
        assert!(!reply.granted);
        assert_eq!(reply.term, Term(5));

        t.member.shutdown().await;
    }

    #[tokio::test]
    async fn denies_vote_to_candidate_with_stale_log() {
        let t = follower(&["m1", "m2", "m3"]);

        let reply = t
            .member
            .handle_append_entries(append_request(1, "m2", (0, 0), &[7], 1))
            .await;
        assert_eq!(reply.outcome, AppendOutcome::Success);

        let reply = t
            .member
            .handle_request_vote(RequestVoteRequest {
                term: Term(2),
                candidate_id: MemberId::new("m3"),
                last_log_index: LogIndex::ZERO,
                last_log_term: Term::ZERO,
            })
            .await;
        assert!(!reply.granted);
        assert_eq!(reply.term, Term(2));

        t.member.shutdown().await;
    }

    #[tokio::test]
    async fn append_entries_applies_committed_prefix() {
        let t = follower(&["m1", "m2", "m3"]);

        let reply = t
            .member
            .handle_append_entries(append_request(1, "m2", (0, 0), &[7, 8], 2))
            .await;
        assert_eq!(reply.term, Term(1));
        assert_eq!(reply.outcome, AppendOutcome::Success);

        let committed = t.member.committed_state().borrow().clone();
        assert_eq!(committed.index, LogIndex(2));
        assert_eq!(committed.state.applied, vec![7, 8]);

        // Snapshot-on-apply folded the applied prefix into the durable image.
        let ps = t.storage.recover::<Recorder>().unwrap().unwrap();
        assert_eq!(ps.snapshot.applied, vec![7, 8]);
        assert_eq!(ps.log.prev_index(), LogIndex(2));

        t.member.shutdown().await;
    }

    #[tokio::test]
    async fn append_entries_refuses_unacceptable_change() {
        let t = follower(&["m1", "m2", "m3"]);

        // Zero is refused by the predicate while uncommitted...
        let reply = t
            .member
            .handle_append_entries(append_request(1, "m2", (0, 0), &[0], 0))
            .await;
        assert_eq!(reply.outcome, AppendOutcome::Rejected);
        assert_eq!(t.member.commit_index().await, LogIndex::ZERO);

        // ...but once the leader has committed it, it is taken as-is.
        let reply = t
            .member
            .handle_append_entries(append_request(1, "m2", (0, 0), &[0], 1))
            .await;
        assert_eq!(reply.outcome, AppendOutcome::Success);
        let committed = t.member.committed_state().borrow().clone();
        assert_eq!(committed.state.applied, vec![0]);

        t.member.shutdown().await;
    }

    #[tokio::test]
    async fn append_entries_asks_for_retry_on_gap() {
        let t = follower(&["m1", "m2", "m3"]);

        let reply = t
            .member
            .handle_append_entries(append_request(1, "m2", (5, 1), &[9], 0))
            .await;
        assert_eq!(reply.outcome, AppendOutcome::Retry);

        let reply = t
            .member
            .handle_append_entries(append_request(0, "m2", (0, 0), &[], 0))
            .await;
        assert_eq!(reply.outcome, AppendOutcome::Retry, "stale term must not be accepted");

        t.member.shutdown().await;
    }

    #[tokio::test]
    async fn propose_on_follower_redirects_to_leader() {
        let t = follower(&["m1", "m2", "m3"]);

        match t.member.propose_change(1).await {
            Err(RaftError::NotLeader { leader: None }) => {}
            other => panic!("expected NotLeader without a hint, got {:?}", other.map(|_| ())),
        }

        t.member
            .handle_append_entries(append_request(1, "m2", (0, 0), &[], 0))
            .await;
        match t.member.propose_change(1).await {
            Err(RaftError::NotLeader { leader: Some(l) }) => assert_eq!(l, MemberId::new("m2")),
            other => panic!("expected redirection to m2, got {:?}", other.map(|_| ())),
        }

        t.member.shutdown().await;
    }

    #[tokio::test]
    async fn install_snapshot_replaces_log_and_state() {
        let t = follower(&["m1", "m2", "m3"]);

        let config = JointConfig::single(ClusterConfig::new(
            ["m1", "m2", "m3"].iter().map(|m| MemberId::new(*m)),
        ));
        let reply = t
            .member
            .handle_install_snapshot(InstallSnapshotRequest {
                term: Term(1),
                leader_id: MemberId::new("m2"),
                last_included_index: LogIndex(10),
                last_included_term: Term(1),
                config: config.clone(),
                state: Recorder {
                    applied: vec![1, 2, 3],
                },
            })
            .await;
        assert_eq!(reply.term, Term(1));

        let committed = t.member.committed_state().borrow().clone();
        assert_eq!(committed.index, LogIndex(10));
        assert_eq!(committed.state.applied, vec![1, 2, 3]);
        assert_eq!(t.member.commit_index().await, LogIndex(10));

        // Replication continues normally from the snapshot point.
        let reply = t
            .member
            .handle_append_entries(append_request(1, "m2", (10, 1), &[4], 11))
            .await;
        assert_eq!(reply.outcome, AppendOutcome::Success);
        let committed = t.member.committed_state().borrow().clone();
        assert_eq!(committed.state.applied, vec![1, 2, 3, 4]);

        t.member.shutdown().await;
    }

    #[tokio::test]
    async fn single_member_cluster_elects_itself_and_commits() {
        let options = RaftOptions {
            heartbeat_interval: Duration::from_millis(20),
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            ..RaftOptions::default()
        };
        let t = bring_up(&["m1"], options);

        let mut ready = t.member.readiness_for_change();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !*ready.borrow() {
                ready.changed().await.unwrap();
            }
        })
        .await
        .expect("member never became ready");

        for c in 1..=5u64 {
            let token = t.member.propose_change(c).await.unwrap();
            assert_eq!(token.wait().await, ChangeOutcome::Committed);
        }
        let committed = t.member.committed_state().borrow().clone();
        assert_eq!(committed.state.applied, vec![1, 2, 3, 4, 5]);

        // A refused change never reaches the log.
        match t.member.propose_change(0).await {
            Err(RaftError::ProposalRejected) => {}
            other => panic!("expected rejection, got {:?}", other.map(|_| ())),
        }

        let image = t.member.get_state_for_init().await;
        assert_eq!(image.snapshot.applied, vec![1, 2, 3, 4, 5]);
        assert_eq!(image.log.latest_index(), image.log.prev_index());
        assert_eq!(image.voted_for, None);

        t.member.shutdown().await;
    }
}
