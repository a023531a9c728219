//! The durable-storage seam.
//!
//! The member hands over its whole `PersistentState` and the adapter must
//! not return until the image is durable; the member holds its state mutex
//! across the call so that "persisted before reply" is atomic with respect
//! to every other handler.

use crate::error::Result;
use crate::persist::PersistentState;
use crate::state_machine::StateMachine;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

/// Storage adapter for a member's persistent state.
///
/// The adapter is expected to retry transient failures internally; an error
/// returned here is unrecoverable and fatal to the member.
#[async_trait]
pub trait RaftStorage<S: StateMachine>: Send + Sync {
    /// Durably record `state`, replacing any previous image.
    async fn write_persistent_state(&self, state: &PersistentState<S>) -> Result<()>;
}

/// In-memory storage for tests.
///
/// Encodes the image with bincode so recovery exercises the same round-trip
/// a real adapter would, and yields once mid-write so the member's
/// mutex-across-await discipline is actually exercised.
#[derive(Default)]
pub struct InMemoryStorage {
    image: Mutex<Option<Bytes>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the most recently written image, if any.
    pub fn recover<S: StateMachine>(&self) -> Result<Option<PersistentState<S>>> {
        let image = self.image.lock().clone();
        match image {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<S: StateMachine> RaftStorage<S> for InMemoryStorage {
    async fn write_persistent_state(&self, state: &PersistentState<S>) -> Result<()> {
        let bytes = Bytes::from(bincode::serialize(state)?);
        tokio::task::yield_now().await;
        *self.image.lock() = Some(bytes);
        Ok(())
    }
}
