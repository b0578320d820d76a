//! # Meridian Consensus
//!
//! Byzantine-fault-tolerant consensus state machine for the Meridian
//! blockchain: a deterministic per-height agreement protocol in the
//! Tendermint lineage, run by a known validator set with weighted votes.
//!
//! ## Consensus Flow
//!
//! ```text
//! Round r, Height h:
//!
//! ┌──────────────┐
//! │   PROPOSE    │  proposer = priority accumulator over validator set
//! │              │  broadcast Proposal{h, r, block_id, pol_round}
//! └──────┬───────┘  + the block streamed as Merkle-committed parts
//!        │
//!        ▼
//! ┌──────────────┐
//! │   PREVOTE    │  IF locked: prevote locked block
//! │              │  ELSE IF proposal valid AND POL proven:
//! │              │      prevote proposal block
//! │              │  ELSE prevote nil
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │  PRECOMMIT   │  ON polka for a block we hold: lock it, precommit it
//! │              │  ON nil polka: unlock, precommit nil
//! │              │  ON no polka: precommit nil, keep the lock
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │    COMMIT    │  ON 2/3 precommits for a block (any round):
//! │              │      assemble, apply, persist, next height
//! └──────────────┘
//! ```
//!
//! ## Architecture
//!
//! One cooperative task owns the [`RoundState`] and serializes every
//! mutation; see [`ConsensusState`]. Around it:
//!
//! - [`HeightVoteSet`]/[`VoteSet`] tally votes and detect the 2/3 and 1/3
//!   thresholds, plus conflicting-vote evidence
//! - [`TimeoutScheduler`] delivers single-shot, supersedable timers keyed
//!   by `(height, round, step)`
//! - [`EventBus`] publishes typed transition events to subscribers
//! - [`ConsensusWal`] logs every input before it takes effect and replays
//!   the unfinished height after a crash
//! - the [`Signer`], [`BlockExecutor`] and [`BlockStore`] traits isolate
//!   keys, the application and storage from the core
//!
//! ## Safety Guarantees
//!
//! **Agreement**: no two honest validators commit different blocks at the
//! same height, tolerating up to ⌊(n-1)/3⌋ Byzantine voting power.
//!
//! **Liveness**: rounds are skipped as soon as 1/3+ of power is observed
//! ahead, and waiting steps time out on the `base + delta * round`
//! schedule, so progress resumes under partial synchrony.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod config;
pub mod events;
pub mod evidence;
pub mod executor;
pub mod reactor;
pub mod round_state;
pub mod signer;
pub mod state;
pub mod timeout;
pub mod types;
pub mod vote_set;
pub mod wal;

// Re-export main types at crate root for convenience
pub use config::ConsensusConfig;
pub use events::{Event, EventBus, EventKind};
pub use evidence::{DuplicateVoteEvidence, EvidenceError};
pub use executor::{BlockExecutor, BlockStore};
pub use reactor::{ConsensusHandle, OutboundMessage, StateInput, StateTaskClosed};
pub use round_state::{RoundState, RoundStateSnapshot};
pub use signer::{LocalSigner, Signer, SignerError};
pub use state::{ConsensusState, StateError};
pub use timeout::{TimeoutInfo, TimeoutScheduler};
pub use types::{
    domains, Height, PeerId, Proposal, Round, Step, Validator, ValidatorSet, Vote, VoteType,
};
pub use vote_set::{HeightVoteSet, VoteAdded, VoteSet, VoteSetError};
pub use wal::{ConsensusWal, WalConfig, WalEntry, WalEntryType, WalError, WalInput, WalResult};
