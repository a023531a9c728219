//! Member tuning options (timeouts, limits).

use std::time::Duration;

/// Raft member options.
///
/// Controls election and heartbeat timing, replication batching, and the
/// snapshot-on-apply compaction threshold.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    /// Leader → follower heartbeat interval.
    ///
    /// An empty AppendEntries is sent at this cadence whenever a peer has no
    /// pending data. Must be well below `election_timeout_min`.
    ///
    /// Default: 150ms
    pub heartbeat_interval: Duration,

    /// Minimum election timeout.
    ///
    /// A follower that hears nothing from a leader for a randomized duration
    /// in `[min, max]` starts an election.
    ///
    /// Default: 300ms
    pub election_timeout_min: Duration,

    /// Maximum election timeout.
    ///
    /// Default: 600ms (2× the minimum, which keeps split votes rare)
    pub election_timeout_max: Duration,

    /// Maximum number of entries per AppendEntries RPC.
    ///
    /// Default: 64
    pub append_batch_limit: usize,

    /// How many applied entries the log may retain before the applied prefix
    /// is folded into the snapshot and head-truncated.
    ///
    /// 0 compacts on every apply, so the persisted snapshot always equals the
    /// committed state and recovery restores the full committed projection.
    ///
    /// Default: 0
    pub snapshot_threshold: u64,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            append_batch_limit: 64,
            snapshot_threshold: 0,
        }
    }
}

impl RaftOptions {
    /// Validate the options (ensure the timing invariants hold).
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(format!(
                "heartbeat_interval ({:?}) must be < election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(format!(
                "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.append_batch_limit == 0 {
            return Err("append_batch_limit must be > 0".to_string());
        }

        Ok(())
    }

    /// A random duration in `[election_timeout_min, election_timeout_max]`.
    ///
    /// Each wait gets a fresh draw so that competing candidates rarely time
    /// out together.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let random_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(random_ms)
    }
}
