//! Consensus configuration.
//!
//! Timeouts follow the usual linear schedule: each waiting step allows
//! `base + delta * round`, so later rounds wait longer and the protocol
//! stays live under degraded networks. `timeout_commit` is the pause after
//! a commit that gives slow validators a chance to contribute precommits to
//! the next block's `last_commit`; `skip_timeout_commit` removes the pause.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a consensus state machine instance.
///
/// Injected per instance; there is no process-wide mutable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// How long to wait for a proposal in round 0
    pub timeout_propose: Duration,
    /// Added to `timeout_propose` for each later round
    pub timeout_propose_delta: Duration,
    /// How long to wait for remaining prevotes after 2/3 any in round 0
    pub timeout_prevote: Duration,
    /// Added to `timeout_prevote` for each later round
    pub timeout_prevote_delta: Duration,
    /// How long to wait for remaining precommits after 2/3 any in round 0
    pub timeout_precommit: Duration,
    /// Added to `timeout_precommit` for each later round
    pub timeout_precommit_delta: Duration,
    /// Pause between committing a block and starting the next height
    pub timeout_commit: Duration,
    /// Start the next height as soon as the commit is final
    pub skip_timeout_commit: bool,

    /// Size in bytes of a single block part
    pub block_part_size: usize,
    /// How long the gossip layer sleeps between peer send sweeps
    pub peer_gossip_sleep_duration: Duration,

    /// Whether the proposer may propose blocks with no payload
    pub create_empty_blocks: bool,
    /// With empty blocks disabled, propose an empty block anyway after this
    /// interval (zero = wait for payload indefinitely)
    pub create_empty_blocks_interval: Duration,

    /// Votes more than this many rounds ahead of the current round are dropped
    pub max_future_rounds: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            timeout_propose: Duration::from_millis(3000),
            timeout_propose_delta: Duration::from_millis(500),
            timeout_prevote: Duration::from_millis(1000),
            timeout_prevote_delta: Duration::from_millis(500),
            timeout_precommit: Duration::from_millis(1000),
            timeout_precommit_delta: Duration::from_millis(500),
            timeout_commit: Duration::from_millis(1000),
            skip_timeout_commit: false,
            block_part_size: 65536,
            peer_gossip_sleep_duration: Duration::from_millis(100),
            create_empty_blocks: true,
            create_empty_blocks_interval: Duration::ZERO,
            max_future_rounds: 64,
        }
    }
}

impl ConsensusConfig {
    /// A configuration with short timeouts for tests.
    pub fn test() -> Self {
        Self {
            timeout_propose: Duration::from_millis(100),
            timeout_propose_delta: Duration::from_millis(20),
            timeout_prevote: Duration::from_millis(40),
            timeout_prevote_delta: Duration::from_millis(10),
            timeout_precommit: Duration::from_millis(40),
            timeout_precommit_delta: Duration::from_millis(10),
            timeout_commit: Duration::from_millis(20),
            skip_timeout_commit: true,
            block_part_size: 4096,
            peer_gossip_sleep_duration: Duration::from_millis(5),
            create_empty_blocks: true,
            create_empty_blocks_interval: Duration::ZERO,
            max_future_rounds: 64,
        }
    }

    /// Propose-step timeout for the given round.
    pub fn propose(&self, round: u32) -> Duration {
        self.timeout_propose + self.timeout_propose_delta * round
    }

    /// Prevote-wait timeout for the given round.
    pub fn prevote(&self, round: u32) -> Duration {
        self.timeout_prevote + self.timeout_prevote_delta * round
    }

    /// Precommit-wait timeout for the given round.
    pub fn precommit(&self, round: u32) -> Duration {
        self.timeout_precommit + self.timeout_precommit_delta * round
    }

    /// Pause before the next height begins.
    pub fn commit(&self) -> Duration {
        self.timeout_commit
    }
}
