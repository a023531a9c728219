//! Log replication: the leader phase of the role driver.
//!
//! While leading, one task per peer pushes that peer's log forward. Each
//! task reads its marching orders under the member mutex, performs the RPC
//! with the mutex released, and folds the reply back in under the mutex.
//! When the member is demoted the leader loop pulses every task's
//! cancellation channel and joins them before the follower role resumes, so
//! no replication ever runs outside a leadership.

use crate::member::{ChangeOutcome, MemberInner};
use crate::state_machine::StateMachine;
use crate::types::*;
use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeadExit {
    Demoted,
    Shutdown,
}

struct PeerTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Hold the leader phase: keep one replication task per peer of every
/// active configuration, reconciling the set as config entries come and go,
/// until demotion or shutdown. All tasks are drained before returning.
pub(crate) async fn lead<S: StateMachine>(
    inner: &Arc<MemberInner<S>>,
    shutdown: &mut broadcast::Receiver<()>,
) -> LeadExit {
    let term = inner.state.lock().await.persistent.current_term;
    let mut peers: HashMap<MemberId, PeerTask> = HashMap::new();

    let exit = loop {
        let mut events = pin!(inner.leader_events.notified());
        events.as_mut().enable();

        let desired = {
            let mut st = inner.state.lock().await;
            if st.role != Role::Leader || st.persistent.current_term != term {
                break LeadExit::Demoted;
            }
            let mut members = st.election_members();
            members.remove(&inner.id);
            let latest = st.persistent.log.latest_index();
            if let Some(leader) = st.leader.as_mut() {
                for peer in &members {
                    leader
                        .next_index
                        .entry(peer.clone())
                        .or_insert_with(|| latest.next());
                    leader.match_index.entry(peer.clone()).or_insert(LogIndex::ZERO);
                }
                leader.next_index.retain(|p, _| members.contains(p));
                leader.match_index.retain(|p, _| members.contains(p));
            }
            members
        };

        for peer in &desired {
            if !peers.contains_key(peer) {
                let (cancel_tx, cancel_rx) = watch::channel(false);
                let handle = tokio::spawn(replicate_to_peer(
                    inner.clone(),
                    peer.clone(),
                    term,
                    cancel_rx,
                ));
                peers.insert(
                    peer.clone(),
                    PeerTask {
                        cancel: cancel_tx,
                        handle,
                    },
                );
            }
        }

        let stale: Vec<MemberId> = peers
            .keys()
            .filter(|p| !desired.contains(*p))
            .cloned()
            .collect();
        for peer in stale {
            if let Some(task) = peers.remove(&peer) {
                tracing::debug!(member = %inner.id, peer = %peer, "dropping replication to removed member");
                let _ = task.cancel.send(true);
                let _ = task.handle.await;
            }
        }

        tokio::select! {
            _ = events.as_mut() => {}
            _ = tokio::time::sleep(inner.options.heartbeat_interval) => {}
            _ = shutdown.recv() => break LeadExit::Shutdown,
        }
    };

    for task in peers.values() {
        let _ = task.cancel.send(true);
    }
    for (_, task) in peers.drain() {
        let _ = task.handle.await;
    }
    exit
}

/// Drive one peer's log forward for as long as this leadership lasts.
///
/// Sends AppendEntries batches from the peer's `next_index`, falling back to
/// InstallSnapshot once `next_index` drops below the snapshot boundary.
/// Heartbeats are just the idle case: an empty batch every heartbeat
/// interval.
async fn replicate_to_peer<S: StateMachine>(
    inner: Arc<MemberInner<S>>,
    peer: MemberId,
    term: Term,
    mut cancel: watch::Receiver<bool>,
) {
    enum Action<S: StateMachine> {
        Append {
            request: AppendEntriesRequest<S>,
            last_sent: LogIndex,
        },
        Snapshot {
            request: InstallSnapshotRequest<S>,
        },
    }

    let mut connected = inner.transport.connected_members();
    loop {
        if *cancel.borrow() {
            return;
        }
        let mut new_data = pin!(inner.replicate.notified());
        new_data.as_mut().enable();

        let action = {
            let st = inner.state.lock().await;
            if st.role != Role::Leader || st.persistent.current_term != term {
                return;
            }
            let Some(leader) = st.leader.as_ref() else {
                return;
            };
            let next = leader
                .next_index
                .get(&peer)
                .copied()
                .unwrap_or_else(|| st.persistent.log.latest_index().next());

            if next <= st.persistent.log.prev_index() {
                Action::Snapshot {
                    request: InstallSnapshotRequest {
                        term,
                        leader_id: inner.id.clone(),
                        last_included_index: st.persistent.log.prev_index(),
                        last_included_term: st.persistent.log.prev_term(),
                        config: st.persistent.snapshot_config.clone(),
                        state: st.persistent.snapshot.clone(),
                    },
                }
            } else {
                let prev = LogIndex(next.0 - 1);
                let upper = st
                    .persistent
                    .log
                    .latest_index()
                    .0
                    .min(next.0 + inner.options.append_batch_limit as u64 - 1);
                let mut entries = Vec::new();
                let mut i = next.0;
                while i <= upper {
                    entries.push(st.persistent.log.get(LogIndex(i)).clone());
                    i += 1;
                }
                Action::Append {
                    last_sent: LogIndex(upper.max(prev.0)),
                    request: AppendEntriesRequest {
                        term,
                        leader_id: inner.id.clone(),
                        prev_log_index: prev,
                        prev_log_term: st.persistent.log.entry_term(prev),
                        entries,
                        leader_commit: st.commit_index,
                    },
                }
            }
        };

        match action {
            Action::Append { request, last_sent } => {
                let sent_commit = request.leader_commit;
                let reply = tokio::select! {
                    r = inner.transport.send(&peer, RpcRequest::AppendEntries(request)) => r,
                    _ = cancel.changed() => return,
                };
                match reply {
                    Ok(RpcReply::AppendEntries(reply)) => {
                        let mut st = inner.state.lock().await;
                        if st.role != Role::Leader || st.persistent.current_term != term {
                            return;
                        }
                        if reply.term > term {
                            inner.bump_term_locked(&mut st, reply.term);
                            inner.persist_locked(&st).await;
                            return;
                        }
                        let Some(leader) = st.leader.as_mut() else {
                            return;
                        };
                        match reply.outcome {
                            AppendOutcome::Success => {
                                let matched =
                                    leader.match_index.entry(peer.clone()).or_insert(LogIndex::ZERO);
                                if last_sent > *matched {
                                    *matched = last_sent;
                                }
                                leader.next_index.insert(peer.clone(), last_sent.next());
                                if inner.advance_commit_locked(&mut st) {
                                    inner.persist_locked(&st).await;
                                }
                            }
                            AppendOutcome::Retry => {
                                let matched = leader
                                    .match_index
                                    .get(&peer)
                                    .copied()
                                    .unwrap_or(LogIndex::ZERO);
                                let next =
                                    leader.next_index.entry(peer.clone()).or_insert(LogIndex(1));
                                *next = LogIndex(next.0.saturating_sub(1).max(matched.0 + 1));
                                continue;
                            }
                            AppendOutcome::Rejected => {
                                tracing::debug!(member = %inner.id, peer = %peer, "batch refused by application predicate");
                                inner.fail_pending_in_range_locked(
                                    &mut st,
                                    sent_commit,
                                    last_sent,
                                    ChangeOutcome::Rejected,
                                );
                                drop(st);
                                tokio::select! {
                                    _ = cancel.changed() => return,
                                    _ = tokio::time::sleep(inner.options.heartbeat_interval) => {}
                                }
                                continue;
                            }
                        }
                    }
                    Ok(_) => {
                        tracing::warn!(member = %inner.id, peer = %peer, "mismatched rpc reply");
                    }
                    Err(_) => {
                        tokio::select! {
                            _ = cancel.changed() => return,
                            _ = tokio::time::sleep(inner.options.heartbeat_interval) => {}
                            _ = connected.changed() => {}
                        }
                        continue;
                    }
                }
            }
            Action::Snapshot { request } => {
                let last_included = request.last_included_index;
                tracing::debug!(member = %inner.id, peer = %peer, index = %last_included, "sending snapshot");
                let reply = tokio::select! {
                    r = inner.transport.send(&peer, RpcRequest::InstallSnapshot(request)) => r,
                    _ = cancel.changed() => return,
                };
                match reply {
                    Ok(RpcReply::InstallSnapshot(reply)) => {
                        let mut st = inner.state.lock().await;
                        if st.role != Role::Leader || st.persistent.current_term != term {
                            return;
                        }
                        if reply.term > term {
                            inner.bump_term_locked(&mut st, reply.term);
                            inner.persist_locked(&st).await;
                            return;
                        }
                        let Some(leader) = st.leader.as_mut() else {
                            return;
                        };
                        let matched =
                            leader.match_index.entry(peer.clone()).or_insert(LogIndex::ZERO);
                        if last_included > *matched {
                            *matched = last_included;
                        }
                        leader.next_index.insert(peer.clone(), last_included.next());
                        if inner.advance_commit_locked(&mut st) {
                            inner.persist_locked(&st).await;
                        }
                    }
                    Ok(_) => {
                        tracing::warn!(member = %inner.id, peer = %peer, "mismatched rpc reply");
                    }
                    Err(_) => {
                        tokio::select! {
                            _ = cancel.changed() => return,
                            _ = tokio::time::sleep(inner.options.heartbeat_interval) => {}
                            _ = connected.changed() => {}
                        }
                        continue;
                    }
                }
            }
        }

        // Pace: if the peer is caught up, wait for new data or the next
        // heartbeat tick.
        let idle = {
            let st = inner.state.lock().await;
            if st.role != Role::Leader || st.persistent.current_term != term {
                return;
            }
            match st.leader.as_ref() {
                Some(leader) => leader
                    .next_index
                    .get(&peer)
                    .map_or(true, |n| *n > st.persistent.log.latest_index()),
                None => return,
            }
        };
        if idle {
            tokio::select! {
                _ = new_data.as_mut() => {}
                _ = tokio::time::sleep(inner.options.heartbeat_interval) => {}
                _ = cancel.changed() => return,
            }
        }
    }
}
