//! The network seam: RPC delivery plus an observable peer directory.
//!
//! The member only ever names peers by `MemberId`; the transport resolves
//! them. Each peer entry carries a session id that changes whenever the
//! connection is re-established, so a driver can tell a fresh peer from one
//! it was already talking to.

use crate::error::{RaftError, Result};
use crate::state_machine::StateMachine;
use crate::types::{MemberId, RpcReply, RpcRequest};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Identifies one connection to a peer; bumped on every reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

/// Transport abstraction for Raft RPC delivery.
///
/// Implementations own connection management and (de)serialization; the
/// protocol only requires that a request round-trips to exactly one reply or
/// fails. In-flight sends are abandoned by dropping the future.
#[async_trait]
pub trait RaftTransport<S: StateMachine>: Send + Sync {
    /// Deliver `request` to `target` and wait for its reply.
    async fn send(&self, target: &MemberId, request: RpcRequest<S>) -> Result<RpcReply>;

    /// The live-peer directory: members currently reachable, each with its
    /// connection session.
    fn connected_members(&self) -> watch::Receiver<BTreeMap<MemberId, SessionId>>;
}

/// One inbound RPC: the request plus the channel its reply goes out on.
pub struct RpcMessage<S: StateMachine> {
    pub sender: MemberId,
    pub request: RpcRequest<S>,
    pub reply_tx: oneshot::Sender<RpcReply>,
}

pub type RpcSender<S> = mpsc::Sender<RpcMessage<S>>;
pub type RpcReceiver<S> = mpsc::Receiver<RpcMessage<S>>;

/// In-memory transport for tests: local channels, no network.
///
/// Cluster harnesses partition and heal members by adding and removing
/// peers; every `add_peer` issues a fresh session id.
pub struct InMemoryTransport<S: StateMachine> {
    local_id: MemberId,
    peers: RwLock<HashMap<MemberId, RpcSender<S>>>,
    connected_tx: watch::Sender<BTreeMap<MemberId, SessionId>>,
    next_session: AtomicU64,
}

impl<S: StateMachine> InMemoryTransport<S> {
    pub fn new(local_id: MemberId) -> Arc<Self> {
        let (connected_tx, _) = watch::channel(BTreeMap::new());
        Arc::new(Self {
            local_id,
            peers: RwLock::new(HashMap::new()),
            connected_tx,
            next_session: AtomicU64::new(1),
        })
    }

    pub fn local_id(&self) -> &MemberId {
        &self.local_id
    }

    /// Connect a peer. A new session id is issued even if the peer was
    /// already present.
    pub fn add_peer(&self, peer_id: MemberId, sender: RpcSender<S>) {
        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        self.peers.write().insert(peer_id.clone(), sender);
        self.connected_tx.send_modify(|m| {
            m.insert(peer_id, session);
        });
    }

    /// Disconnect a peer.
    pub fn remove_peer(&self, peer_id: &MemberId) {
        self.peers.write().remove(peer_id);
        self.connected_tx.send_modify(|m| {
            m.remove(peer_id);
        });
    }

    fn get_peer(&self, peer_id: &MemberId) -> Option<RpcSender<S>> {
        self.peers.read().get(peer_id).cloned()
    }
}

#[async_trait]
impl<S: StateMachine> RaftTransport<S> for InMemoryTransport<S> {
    async fn send(&self, target: &MemberId, request: RpcRequest<S>) -> Result<RpcReply> {
        let peer = self.get_peer(target).ok_or_else(|| RaftError::Unreachable {
            member: target.clone(),
        })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        peer.send(RpcMessage {
            sender: self.local_id.clone(),
            request,
            reply_tx,
        })
        .await
        .map_err(|_| RaftError::Unreachable {
            member: target.clone(),
        })?;

        reply_rx.await.map_err(|_| RaftError::Unreachable {
            member: target.clone(),
        })
    }

    fn connected_members(&self) -> watch::Receiver<BTreeMap<MemberId, SessionId>> {
        self.connected_tx.subscribe()
    }
}
