//! The message-passing surface of the consensus core.
//!
//! The gossip reactor (and tests, and WAL replay) talk to the single-writer
//! state task exclusively through [`StateInput`] messages sent over the
//! core's inbound channel. Outbound traffic - signed votes, the proposal
//! and its parts, detected evidence - leaves through the
//! [`OutboundMessage`] sink the reactor drains.

use meridian_types::{Block, Part};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::evidence::DuplicateVoteEvidence;
use crate::events::{Event, EventBus, EventKind};
use crate::round_state::RoundStateSnapshot;
use crate::timeout::TimeoutInfo;
use crate::types::{Height, PeerId, Proposal, Round, Vote};

/// Inbound messages accepted by the state machine task.
#[derive(Debug)]
pub enum StateInput {
    /// Begin (or jump to) a round. Sent once at node start; tests use it to
    /// begin at a later round.
    Start {
        /// Height to run
        height: Height,
        /// Round to enter
        round: Round,
    },
    /// A proposal received from the network
    Proposal {
        /// The proposal
        proposal: Proposal,
        /// Originating peer; `None` for loopback
        peer: Option<PeerId>,
    },
    /// A block part received from the network
    BlockPart {
        /// Height the part is for
        height: Height,
        /// Round the part is for
        round: Round,
        /// The part
        part: Part,
        /// Originating peer; `None` for loopback
        peer: Option<PeerId>,
    },
    /// A vote received from the network
    Vote {
        /// The vote
        vote: Vote,
        /// Originating peer; `None` for loopback
        peer: Option<PeerId>,
    },
    /// A timeout tick from the scheduler (or an injected one)
    Timeout(TimeoutInfo),
    /// A proposal delivered together with its full block, bypassing part
    /// gossip. Used by WAL replay and tests.
    SetProposalAndBlock {
        /// The proposal
        proposal: Proposal,
        /// The complete block
        block: Block,
        /// Originating peer
        peer: Option<PeerId>,
    },
    /// Request a deep-copy snapshot of the round state
    RoundState(oneshot::Sender<RoundStateSnapshot>),
    /// Flush the WAL, drop timers and stop the task
    Shutdown,
}

/// Messages the core emits for the reactor to gossip.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Our signed proposal
    Proposal(Proposal),
    /// A part of our proposed block
    BlockPart {
        /// Height of the block
        height: Height,
        /// Round of the proposal
        round: Round,
        /// The part
        part: Part,
    },
    /// Our signed vote
    Vote(Vote),
    /// Slashable evidence detected by the tallier
    Evidence(DuplicateVoteEvidence),
}

/// Error returned when the state task is gone.
#[derive(Debug, Error)]
#[error("consensus state task is not running")]
pub struct StateTaskClosed;

/// Cloneable handle to a running consensus state task.
#[derive(Clone)]
pub struct ConsensusHandle {
    tx: mpsc::Sender<StateInput>,
    bus: EventBus,
}

impl ConsensusHandle {
    pub(crate) fn new(tx: mpsc::Sender<StateInput>, bus: EventBus) -> Self {
        Self { tx, bus }
    }

    async fn send(&self, input: StateInput) -> Result<(), StateTaskClosed> {
        self.tx.send(input).await.map_err(|_| StateTaskClosed)
    }

    /// Begin consensus at `(height, round)`.
    pub async fn start(&self, height: Height, round: Round) -> Result<(), StateTaskClosed> {
        self.send(StateInput::Start { height, round }).await
    }

    /// Deliver a proposal from a peer.
    pub async fn proposal(
        &self,
        proposal: Proposal,
        peer: Option<PeerId>,
    ) -> Result<(), StateTaskClosed> {
        self.send(StateInput::Proposal { proposal, peer }).await
    }

    /// Deliver a block part from a peer.
    pub async fn block_part(
        &self,
        height: Height,
        round: Round,
        part: Part,
        peer: Option<PeerId>,
    ) -> Result<(), StateTaskClosed> {
        self.send(StateInput::BlockPart {
            height,
            round,
            part,
            peer,
        })
        .await
    }

    /// Deliver a vote from a peer.
    pub async fn vote(&self, vote: Vote, peer: Option<PeerId>) -> Result<(), StateTaskClosed> {
        self.send(StateInput::Vote { vote, peer }).await
    }

    /// Inject a timeout tick.
    pub async fn timeout(&self, info: TimeoutInfo) -> Result<(), StateTaskClosed> {
        self.send(StateInput::Timeout(info)).await
    }

    /// Deliver a proposal together with its complete block.
    pub async fn set_proposal_and_block(
        &self,
        proposal: Proposal,
        block: Block,
        peer: Option<PeerId>,
    ) -> Result<(), StateTaskClosed> {
        self.send(StateInput::SetProposalAndBlock {
            proposal,
            block,
            peer,
        })
        .await
    }

    /// Fetch a deep-copy snapshot of the current round state.
    pub async fn round_state(&self) -> Result<RoundStateSnapshot, StateTaskClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(StateInput::RoundState(tx)).await?;
        rx.await.map_err(|_| StateTaskClosed)
    }

    /// Subscribe to consensus events of one kind.
    pub fn subscribe(&self, kind: EventKind, capacity: usize) -> mpsc::Receiver<Event> {
        self.bus.subscribe(kind, capacity)
    }

    /// Ask the state task to flush and stop.
    pub async fn stop(&self) -> Result<(), StateTaskClosed> {
        self.send(StateInput::Shutdown).await
    }
}
