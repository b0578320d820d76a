//! The consensus state machine core.
//!
//! One cooperative task owns the [`RoundState`] and performs every
//! mutation. Inbound messages, timeout ticks and snapshot requests arrive
//! through a single serializing channel; each handler runs to completion
//! before the next message is taken, which makes every protocol invariant a
//! single-threaded postcondition.
//!
//! The transition functions mirror the protocol structure directly:
//! `enter_new_round`, `enter_propose`, `enter_prevote`,
//! `enter_prevote_wait`, `enter_precommit`, `enter_precommit_wait`,
//! `enter_commit`, `try_finalize_commit` and `enter_new_height`. Votes flow
//! in through `try_add_vote`, which also applies the lock, valid-block and
//! round-skip rules.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use meridian_types::{Block, BlockId, Part, PartSet};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ConsensusConfig;
use crate::events::{Event, EventBus};
use crate::executor::{BlockExecutor, BlockStore};
use crate::reactor::{ConsensusHandle, OutboundMessage, StateInput};
use crate::round_state::RoundState;
use crate::signer::Signer;
use crate::timeout::{TimeoutInfo, TimeoutScheduler};
use crate::types::{Height, PeerId, Proposal, Round, Step, ValidatorSet, Vote, VoteType};
use crate::vote_set::VoteAdded;
use crate::wal::{current_time_ms, ConsensusWal, WalEntryType, WalError, WalInput};

/// Fatal failures of the consensus core.
///
/// Everything else (bad votes, bad proposals, stale timeouts) is dropped
/// and logged; these end the run loop because consensus cannot continue on
/// an inconsistent log or application state.
#[derive(Debug, Error)]
pub enum StateError {
    /// The write-ahead log failed or is corrupted
    #[error("WAL failure: {0}")]
    Wal(#[from] WalError),

    /// The block executor failed to apply or validate a decided block
    #[error("executor failure: {0}")]
    Executor(String),

    /// The block store failed to persist a decided block
    #[error("block store failure: {0}")]
    Store(String),
}

type BoxedStep<'a> = Pin<Box<dyn Future<Output = Result<(), StateError>> + Send + 'a>>;

/// The single-writer consensus state machine.
pub struct ConsensusState {
    config: ConsensusConfig,
    chain_id: String,

    signer: Arc<dyn Signer>,
    executor: Arc<dyn BlockExecutor>,
    store: Arc<dyn BlockStore>,

    wal: ConsensusWal,
    bus: EventBus,
    scheduler: TimeoutScheduler,

    inbound_rx: mpsc::Receiver<StateInput>,
    outbound_tx: mpsc::Sender<OutboundMessage>,

    rs: RoundState,
    validators: ValidatorSet,
    last_validators: ValidatorSet,

    /// True while reapplying WAL entries: signing, broadcasting, event
    /// publication and persistence are suppressed.
    replay: bool,
}

impl ConsensusState {
    /// Build a state machine and the handle used to drive it.
    ///
    /// The task does not start consensus until it receives
    /// [`StateInput::Start`] (or recovers a height from the WAL).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConsensusConfig,
        chain_id: impl Into<String>,
        height: Height,
        validators: ValidatorSet,
        signer: Arc<dyn Signer>,
        executor: Arc<dyn BlockExecutor>,
        store: Arc<dyn BlockStore>,
        wal: ConsensusWal,
        outbound_tx: mpsc::Sender<OutboundMessage>,
    ) -> (Self, ConsensusHandle) {
        let chain_id = chain_id.into();
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let bus = EventBus::new();
        let handle = ConsensusHandle::new(inbound_tx.clone(), bus.clone());

        // Scheduler ticks are folded into the inbound channel so timer
        // firings serialize with every other mutation.
        let (tick_tx, mut tick_rx) = mpsc::channel::<TimeoutInfo>(16);
        let scheduler = TimeoutScheduler::spawn(tick_tx);
        tokio::spawn(async move {
            while let Some(tick) = tick_rx.recv().await {
                if inbound_tx.send(StateInput::Timeout(tick)).await.is_err() {
                    break;
                }
            }
        });

        let rs = RoundState::new(chain_id.clone(), height, current_time_ms(), None);
        let state = Self {
            config,
            chain_id,
            signer,
            executor,
            store,
            wal,
            bus,
            scheduler,
            inbound_rx,
            outbound_tx,
            rs,
            last_validators: validators.clone(),
            validators,
            replay: false,
        };
        (state, handle)
    }

    /// Run the state machine until shutdown or a fatal error.
    ///
    /// Replays the WAL first; live processing resumes at the log head.
    pub async fn run(mut self) -> Result<(), StateError> {
        self.catchup_replay().await?;

        while let Some(input) = self.inbound_rx.recv().await {
            match input {
                StateInput::Shutdown => {
                    info!(height = self.rs.height, "Consensus shutting down");
                    self.wal.flush()?;
                    self.bus.close();
                    break;
                }
                StateInput::RoundState(reply) => {
                    let _ = reply.send(self.rs.snapshot());
                }
                StateInput::Timeout(info) => {
                    self.wal.write_timeout(&info)?;
                    self.handle_timeout(info).await?;
                }
                other => {
                    if let Some(wal_input) = wal_input_of(&other) {
                        self.wal.write_input(&wal_input)?;
                    }
                    self.dispatch(other).await?;
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, input: StateInput) -> Result<(), StateError> {
        match input {
            StateInput::Start { height, round } => {
                if height < self.rs.height {
                    debug!(height, current = self.rs.height, "Ignoring stale start");
                    return Ok(());
                }
                self.enter_new_round(height, round).await
            }
            StateInput::Proposal { proposal, peer } => {
                self.set_proposal(proposal, peer);
                Ok(())
            }
            StateInput::BlockPart {
                height,
                round,
                part,
                peer,
            } => self.add_proposal_block_part(height, round, part, peer).await,
            StateInput::Vote { vote, peer } => self.try_add_vote(vote, peer).await,
            StateInput::SetProposalAndBlock {
                proposal,
                block,
                peer,
            } => {
                let round = proposal.round;
                let height = proposal.height;
                self.set_proposal(proposal, peer.clone());
                let parts = block.make_part_set(self.config.block_part_size);
                for index in 0..parts.total() {
                    let part = parts
                        .get_part(index)
                        .expect("freshly split set has every part")
                        .clone();
                    self.add_proposal_block_part(height, round, part, peer.clone())
                        .await?;
                }
                Ok(())
            }
            StateInput::Timeout(info) => self.handle_timeout(info).await,
            StateInput::Shutdown | StateInput::RoundState(_) => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // WAL replay
    // ------------------------------------------------------------------

    /// Reapply the unfinished height from the WAL, side effects suppressed.
    async fn catchup_replay(&mut self) -> Result<(), StateError> {
        let replay = self.wal.recover()?;
        if replay.last_height == 0 {
            self.wal.write_height_start(self.rs.height, self.rs.start_time_ms)?;
            return Ok(());
        }
        if replay.ended {
            // Crash landed between EndHeight and the next HeightStart.
            let next = replay.last_height + 1;
            info!(height = next, "WAL ends with a committed height, starting fresh");
            self.rs = RoundState::new(self.chain_id.clone(), next, current_time_ms(), None);
            self.wal.write_height_start(next, self.rs.start_time_ms)?;
            return self.enter_new_round(next, 0).await;
        }

        info!(
            height = replay.last_height,
            entries = replay.entries.len(),
            "Replaying WAL"
        );
        self.rs = RoundState::new(
            self.chain_id.clone(),
            replay.last_height,
            replay.start_time_ms,
            None,
        );
        self.replay = true;
        for entry in &replay.entries {
            match entry.entry_type {
                WalEntryType::Input => {
                    let input = entry.as_input()?;
                    self.dispatch(state_input_of(input)).await?;
                }
                WalEntryType::Timeout => {
                    let info = entry.as_timeout()?;
                    self.handle_timeout(info).await?;
                }
                // Step records are audit data; transitions re-derive them.
                _ => {}
            }
        }
        self.replay = false;
        info!(height = self.rs.height, round = self.rs.round, step = %self.rs.step, "WAL replay complete");

        // A recovered node parked in NewHeight has no timer to wake it.
        if self.rs.step == Step::NewHeight {
            let height = self.rs.height;
            self.enter_new_round(height, 0).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    async fn publish(&self, event: Event) {
        if !self.replay {
            self.bus.publish(event).await;
        }
    }

    async fn send_outbound(&self, message: OutboundMessage) {
        if self.replay {
            return;
        }
        if self.outbound_tx.send(message).await.is_err() {
            warn!("Outbound sink closed, dropping message");
        }
    }

    async fn update_step(&mut self, step: Step) -> Result<(), StateError> {
        self.rs.step = step;
        if !self.replay {
            self.wal.write_step(self.rs.height, self.rs.round, step)?;
        }
        self.publish(Event::NewRoundStep {
            height: self.rs.height,
            round: self.rs.round,
            step,
        })
        .await;
        Ok(())
    }

    async fn schedule_timeout(&self, duration: std::time::Duration, round: Round, step: Step) {
        if self.replay {
            return;
        }
        self.scheduler
            .schedule(TimeoutInfo {
                duration,
                height: self.rs.height,
                round,
                step,
            })
            .await;
    }

    fn is_proposal_complete(&self) -> bool {
        let Some(proposal) = &self.rs.proposal else {
            return false;
        };
        if self.rs.proposal_block.is_none() {
            return false;
        }
        if proposal.pol_round < 0 {
            return true;
        }
        self.rs.votes.has_polka_at(
            proposal.pol_round as Round,
            &proposal.block_id,
            &self.validators,
        )
    }

    fn is_our_proposal_turn(&self, round: Round) -> bool {
        self.validators.has_address(&self.signer.address())
            && self.validators.proposer_for_round(round).address == self.signer.address()
    }

    /// The decided commit for the previous height, embedded in proposals.
    fn decided_last_commit(&self) -> meridian_types::Commit {
        self.rs
            .last_commit
            .as_ref()
            .and_then(|set| set.make_commit(&self.last_validators))
            .unwrap_or_else(meridian_types::Commit::empty)
    }

    // ------------------------------------------------------------------
    // Round entry
    // ------------------------------------------------------------------

    /// Enter a new round. Clears per-round proposal state for rounds > 0,
    /// announces the proposer and moves on to the propose step.
    fn enter_new_round(&mut self, height: Height, round: Round) -> BoxedStep<'_> {
        Box::pin(async move {
            if self.rs.height != height
                || round < self.rs.round
                || (self.rs.round == round && self.rs.step != Step::NewHeight)
                || self.rs.step == Step::Commit
            {
                debug!(
                    height,
                    round,
                    current = %self.rs,
                    "Ignoring enter_new_round"
                );
                return Ok(());
            }

            info!(height, round, "Entering new round");

            self.rs.round = round;
            self.update_step(Step::NewRound).await?;
            if round != 0 {
                // A new round invalidates the previous round's proposal.
                self.rs.proposal = None;
                self.rs.proposal_block = None;
                self.rs.proposal_block_parts = None;
            }
            self.rs.votes.set_round(round);
            self.rs.triggered_timeout_precommit = false;

            let proposer = self.validators.proposer_for_round(round);
            self.publish(Event::NewRound {
                height,
                round,
                proposer: proposer.address,
            })
            .await;

            if self.config.create_empty_blocks
                && !self.config.create_empty_blocks_interval.is_zero()
            {
                // Give the application a window to fill the block.
                self.schedule_timeout(
                    self.config.create_empty_blocks_interval,
                    round,
                    Step::NewRound,
                )
                .await;
                return Ok(());
            }
            self.enter_propose(height, round).await
        })
    }

    async fn enter_propose(&mut self, height: Height, round: Round) -> Result<(), StateError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Propose)
        {
            debug!(height, round, current = %self.rs, "Ignoring enter_propose");
            return Ok(());
        }

        debug!(height, round, "Entering propose step");
        self.update_step(Step::Propose).await?;
        self.schedule_timeout(self.config.propose(round), round, Step::Propose)
            .await;

        if self.is_our_proposal_turn(round) {
            self.decide_proposal(height, round).await?;
        }

        if self.is_proposal_complete() {
            self.enter_prevote(height, round).await?;
        }
        Ok(())
    }

    /// Create, sign and broadcast our proposal, then feed it back through
    /// the normal handlers.
    async fn decide_proposal(&mut self, height: Height, round: Round) -> Result<(), StateError> {
        if self.replay {
            return Ok(());
        }

        let (block, parts) = if let (Some(block), Some(parts)) =
            (self.rs.valid_block.clone(), self.rs.valid_block_parts.clone())
        {
            // Re-propose the most recently polka'd block.
            (block, parts)
        } else {
            let last_commit = self.decided_last_commit();
            match self
                .executor
                .create_proposal_block(height, &last_commit)
                .await
            {
                Some(block) => {
                    let parts = block.make_part_set(self.config.block_part_size);
                    (block, parts)
                }
                None => {
                    debug!(height, round, "No block to propose yet");
                    return Ok(());
                }
            }
        };

        let block_id = BlockId::new(block.hash(), parts.header().clone());
        let mut proposal = Proposal::new(height, round, self.rs.valid_round, block_id.clone());
        proposal.timestamp_ms = current_time_ms();
        if let Err(e) = self.signer.sign_proposal(&self.chain_id, &mut proposal) {
            error!(height, round, error = %e, "Refusing to sign proposal");
            return Ok(());
        }

        info!(height, round, block_id = %block_id, "Proposing block");

        self.wal.write_input(&WalInput::Proposal {
            proposal: proposal.clone(),
            peer: None,
        })?;
        self.send_outbound(OutboundMessage::Proposal(proposal.clone()))
            .await;
        self.set_proposal(proposal, None);

        for index in 0..parts.total() {
            let part = parts
                .get_part(index)
                .expect("own part set is complete")
                .clone();
            self.wal.write_input(&WalInput::BlockPart {
                height,
                round,
                part: part.clone(),
                peer: None,
            })?;
            self.send_outbound(OutboundMessage::BlockPart {
                height,
                round,
                part: part.clone(),
            })
            .await;
            self.add_proposal_block_part(height, round, part, None).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Proposal intake
    // ------------------------------------------------------------------

    /// Accept or drop a proposal message.
    fn set_proposal(&mut self, proposal: Proposal, peer: Option<PeerId>) {
        if self.rs.proposal.is_some() {
            return;
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            debug!(
                proposal = %proposal,
                current = %self.rs,
                "Dropping proposal for another height/round"
            );
            return;
        }
        if proposal.pol_round < -1
            || (proposal.pol_round >= 0 && proposal.pol_round >= proposal.round as i64)
        {
            warn!(proposal = %proposal, "Dropping proposal with invalid POL round");
            return;
        }

        let proposer = self.validators.proposer_for_round(proposal.round);
        if !proposer.pub_key.verify(
            &proposal.signing_bytes(&self.chain_id),
            &proposal.signature,
        ) {
            warn!(
                proposal = %proposal,
                proposer = %proposer.address,
                "Dropping proposal with invalid signature"
            );
            return;
        }

        if self.rs.proposal_block_parts.is_none() {
            match PartSet::new_from_header(
                proposal.block_id.parts_header.clone(),
                self.config.block_part_size,
            ) {
                Ok(parts) => self.rs.proposal_block_parts = Some(parts),
                Err(e) => {
                    warn!(proposal = %proposal, error = %e, "Dropping proposal with oversized part set");
                    return;
                }
            }
        }

        info!(proposal = %proposal, peer = ?peer, "Received proposal");
        self.rs.proposal = Some(proposal);
    }

    /// Absorb a block part; on completion, decode the block and move the
    /// protocol along.
    async fn add_proposal_block_part(
        &mut self,
        height: Height,
        _round: Round,
        part: Part,
        peer: Option<PeerId>,
    ) -> Result<(), StateError> {
        if height != self.rs.height {
            debug!(height, current = self.rs.height, "Dropping part for another height");
            return Ok(());
        }
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            debug!(height, index = part.index, "Dropping part with no parts header");
            return Ok(());
        };

        match parts.add_part(part) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => {
                warn!(height, peer = ?peer, error = %e, "Dropping bad block part");
                return Ok(());
            }
        }
        if !parts.is_complete() {
            return Ok(());
        }

        let header = parts.header().clone();
        let assembled = parts
            .assemble()
            .map_err(|e| e.to_string())
            .and_then(|bytes| Block::decode(&bytes).map_err(|e| e.to_string()));
        let block = match assembled {
            Ok(block) => block,
            Err(e) => {
                // Root mismatch or undecodable payload: every part is
                // suspect. Discard and wait for re-gossip.
                warn!(height, error = %e, "Discarding block parts");
                self.rs.proposal_block_parts =
                    PartSet::new_from_header(header, self.config.block_part_size).ok();
                return Ok(());
            }
        };

        if let Some(proposal) = &self.rs.proposal {
            if proposal.block_id.hash != block.hash() {
                warn!(
                    height,
                    proposal = %proposal,
                    block_hash = %hex::encode(&block.hash()[..8]),
                    "Assembled block does not match the proposal, discarding parts"
                );
                self.rs.proposal_block_parts =
                    PartSet::new_from_header(header, self.config.block_part_size).ok();
                return Ok(());
            }
        }

        let block_id = BlockId::new(block.hash(), header);
        info!(height, block_id = %block_id, "Received complete proposal block");
        self.rs.proposal_block = Some(block);
        self.publish(Event::CompleteProposal {
            height,
            round: self.rs.round,
            block_id: block_id.clone(),
        })
        .await;

        // A polka may already be waiting for this block.
        let round = self.rs.round;
        let polka = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|set| set.two_thirds_majority(&self.validators));
        if let Some(polka_id) = polka {
            // Also fires when the polka round was recorded earlier with the
            // block still missing; its arrival completes the valid block.
            if !polka_id.is_nil()
                && (self.rs.valid_round < round as i64 || self.rs.valid_block.is_none())
                && self.rs.proposal_block_matches(&polka_id)
            {
                self.rs.valid_round = round as i64;
                self.rs.valid_block = self.rs.proposal_block.clone();
                self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                info!(height, round, block_id = %polka_id, "Updating valid block from waiting polka");
                self.publish(Event::ValidBlock {
                    height,
                    round,
                    block_id: polka_id,
                })
                .await;
            }
        }

        if self.rs.step <= Step::Propose && self.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round).await?;
        } else if self.rs.step == Step::Commit {
            self.try_finalize_commit(height).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Prevote
    // ------------------------------------------------------------------

    async fn enter_prevote(&mut self, height: Height, round: Round) -> Result<(), StateError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Prevote)
        {
            debug!(height, round, current = %self.rs, "Ignoring enter_prevote");
            return Ok(());
        }

        debug!(height, round, "Entering prevote step");
        self.update_step(Step::Prevote).await?;
        self.do_prevote(height, round).await
    }

    async fn do_prevote(&mut self, height: Height, round: Round) -> Result<(), StateError> {
        // Locked validators keep prevoting their lock until a polka
        // releases them.
        if let (Some(block), Some(parts)) =
            (&self.rs.locked_block, &self.rs.locked_block_parts)
        {
            debug!(height, round, "Prevoting locked block");
            let block_id = BlockId::new(block.hash(), parts.header().clone());
            return self.sign_and_add_vote(VoteType::Prevote, block_id).await;
        }

        let Some(block) = self.rs.proposal_block.clone() else {
            debug!(height, round, "No proposal block, prevoting nil");
            return self.sign_and_add_vote(VoteType::Prevote, BlockId::nil()).await;
        };

        if let Err(e) = block.validate_basic() {
            warn!(height, round, error = %e, "Invalid proposal block, prevoting nil");
            return self.sign_and_add_vote(VoteType::Prevote, BlockId::nil()).await;
        }
        if let Err(e) = self.executor.validate_block(&block).await {
            warn!(height, round, error = %e, "Proposal failed application validation, prevoting nil");
            return self.sign_and_add_vote(VoteType::Prevote, BlockId::nil()).await;
        }

        let Some(proposal) = self.rs.proposal.clone() else {
            debug!(height, round, "Block without proposal, prevoting nil");
            return self.sign_and_add_vote(VoteType::Prevote, BlockId::nil()).await;
        };
        if proposal.pol_round >= 0
            && !self.rs.votes.has_polka_at(
                proposal.pol_round as Round,
                &proposal.block_id,
                &self.validators,
            )
        {
            debug!(
                height,
                round,
                pol_round = proposal.pol_round,
                "Proposal cites an unproven POL, prevoting nil"
            );
            return self.sign_and_add_vote(VoteType::Prevote, BlockId::nil()).await;
        }

        debug!(height, round, block_id = %proposal.block_id, "Prevoting proposal block");
        self.sign_and_add_vote(VoteType::Prevote, proposal.block_id)
            .await
    }

    async fn enter_prevote_wait(&mut self, height: Height, round: Round) -> Result<(), StateError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::PrevoteWait)
        {
            debug!(height, round, current = %self.rs, "Ignoring enter_prevote_wait");
            return Ok(());
        }

        debug!(height, round, "Entering prevote wait");
        self.update_step(Step::PrevoteWait).await?;
        self.schedule_timeout(self.config.prevote(round), round, Step::PrevoteWait)
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Precommit
    // ------------------------------------------------------------------

    async fn enter_precommit(&mut self, height: Height, round: Round) -> Result<(), StateError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Precommit)
        {
            debug!(height, round, current = %self.rs, "Ignoring enter_precommit");
            return Ok(());
        }

        debug!(height, round, "Entering precommit step");
        self.update_step(Step::Precommit).await?;

        let polka = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|set| set.two_thirds_majority(&self.validators));

        let Some(block_id) = polka else {
            // No polka: precommit nil without touching the lock.
            debug!(height, round, "No polka, precommitting nil");
            return self
                .sign_and_add_vote(VoteType::Precommit, BlockId::nil())
                .await;
        };

        if block_id.is_nil() {
            // Nil polka: release any lock.
            if self.rs.locked_block.is_some() {
                info!(height, round, "Nil polka, unlocking");
                self.unlock().await;
            }
            return self
                .sign_and_add_vote(VoteType::Precommit, BlockId::nil())
                .await;
        }

        if self.rs.locked_block_matches(&block_id) {
            // Polka for the block we are locked on: refresh the lock round.
            self.rs.locked_round = round as i64;
            self.rs.valid_round = round as i64;
            self.rs.valid_block = self.rs.locked_block.clone();
            self.rs.valid_block_parts = self.rs.locked_block_parts.clone();
            info!(height, round, block_id = %block_id, "Relocking on polka block");
            self.publish(Event::Relock {
                height,
                round,
                block_id: block_id.clone(),
            })
            .await;
            return self.sign_and_add_vote(VoteType::Precommit, block_id).await;
        }

        if self.rs.proposal_block_matches(&block_id) {
            // Polka for the proposal block we hold: lock it.
            if let Err(e) = self
                .executor
                .validate_block(self.rs.proposal_block.as_ref().expect("matched above"))
                .await
            {
                return Err(StateError::Executor(format!(
                    "2/3 prevoted an invalid block at height {height} round {round}: {e}"
                )));
            }
            let was_locked = self.rs.locked_block.is_some();
            self.rs.locked_round = round as i64;
            self.rs.locked_block = self.rs.proposal_block.clone();
            self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
            self.rs.valid_round = round as i64;
            self.rs.valid_block = self.rs.proposal_block.clone();
            self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
            info!(height, round, block_id = %block_id, relock = was_locked, "Locking on polka block");
            let event = if was_locked {
                Event::Relock {
                    height,
                    round,
                    block_id: block_id.clone(),
                }
            } else {
                Event::Lock {
                    height,
                    round,
                    block_id: block_id.clone(),
                }
            };
            self.publish(event).await;
            return self.sign_and_add_vote(VoteType::Precommit, block_id).await;
        }

        // Polka for a block we do not have: release the lock, remember the
        // polka round and retarget part collection, but precommit nil.
        info!(height, round, block_id = %block_id, "Polka for missing block, precommitting nil");
        if self.rs.locked_block.is_some() {
            self.unlock().await;
        }
        self.rs.valid_round = round as i64;
        self.rs.valid_block = None;
        self.rs.proposal_block = None;
        let parts_match = self
            .rs
            .proposal_block_parts
            .as_ref()
            .map(|p| *p.header() == block_id.parts_header)
            .unwrap_or(false);
        if !parts_match {
            self.rs.proposal_block_parts = PartSet::new_from_header(
                block_id.parts_header.clone(),
                self.config.block_part_size,
            )
            .ok();
        }
        self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
        self.sign_and_add_vote(VoteType::Precommit, BlockId::nil())
            .await
    }

    async fn unlock(&mut self) {
        self.rs.locked_round = -1;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        self.publish(Event::Unlock {
            height: self.rs.height,
            round: self.rs.round,
        })
        .await;
    }

    async fn enter_precommit_wait(
        &mut self,
        height: Height,
        round: Round,
    ) -> Result<(), StateError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.triggered_timeout_precommit)
        {
            debug!(height, round, current = %self.rs, "Ignoring enter_precommit_wait");
            return Ok(());
        }

        debug!(height, round, "Entering precommit wait");
        self.rs.triggered_timeout_precommit = true;
        if self.rs.step < Step::PrecommitWait {
            self.update_step(Step::PrecommitWait).await?;
        }
        self.schedule_timeout(self.config.precommit(round), round, Step::PrecommitWait)
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    async fn enter_commit(&mut self, height: Height, commit_round: Round) -> Result<(), StateError> {
        if self.rs.height != height || self.rs.step >= Step::Commit {
            debug!(height, commit_round, current = %self.rs, "Ignoring enter_commit");
            return Ok(());
        }

        let Some(block_id) = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|set| set.two_thirds_majority(&self.validators))
            .filter(|id| !id.is_nil())
        else {
            warn!(height, commit_round, "enter_commit without a decided block id");
            return Ok(());
        };

        info!(height, commit_round, block_id = %block_id, "Entering commit step");

        if self.rs.locked_block_matches(&block_id) {
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }
        if !self.rs.proposal_block_matches(&block_id) {
            let parts_match = self
                .rs
                .proposal_block_parts
                .as_ref()
                .map(|p| *p.header() == block_id.parts_header)
                .unwrap_or(false);
            if !parts_match {
                // Decided block is not in hand: announce it and collect its
                // parts; the commit completes when assembly does.
                self.publish(Event::ValidBlock {
                    height,
                    round: commit_round,
                    block_id: block_id.clone(),
                })
                .await;
                self.rs.proposal_block = None;
                self.rs.proposal_block_parts = PartSet::new_from_header(
                    block_id.parts_header.clone(),
                    self.config.block_part_size,
                )
                .ok();
            }
        }

        self.rs.commit_round = Some(commit_round);
        self.update_step(Step::Commit).await?;
        self.try_finalize_commit(height).await
    }

    async fn try_finalize_commit(&mut self, height: Height) -> Result<(), StateError> {
        if self.rs.height != height || self.rs.step != Step::Commit {
            return Ok(());
        }
        let Some(commit_round) = self.rs.commit_round else {
            return Ok(());
        };
        let Some(block_id) = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|set| set.two_thirds_majority(&self.validators))
            .filter(|id| !id.is_nil())
        else {
            return Ok(());
        };
        if !self.rs.proposal_block_matches(&block_id) {
            debug!(height, commit_round, "Commit pending, block not yet assembled");
            return Ok(());
        }
        self.finalize_commit(height, commit_round, block_id).await
    }

    async fn finalize_commit(
        &mut self,
        height: Height,
        commit_round: Round,
        block_id: BlockId,
    ) -> Result<(), StateError> {
        let block = self
            .rs
            .proposal_block
            .clone()
            .expect("finalize requires the decided block");
        let parts = self
            .rs
            .proposal_block_parts
            .clone()
            .expect("finalize requires the decided parts");

        if let Err(e) = block.validate_basic() {
            return Err(StateError::Executor(format!(
                "decided block failed validation at height {height}: {e}"
            )));
        }
        if let Err(e) = self.executor.validate_block(&block).await {
            return Err(StateError::Executor(format!(
                "decided block rejected by the application at height {height}: {e}"
            )));
        }

        let commit = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|set| set.make_commit(&self.validators))
            .expect("2/3 precommits exist for the decided block");

        info!(
            height,
            commit_round,
            block_id = %block_id,
            "Finalizing commit"
        );

        if !self.replay {
            self.store
                .save_block(block.clone(), parts, commit.clone())
                .await
                .map_err(StateError::Store)?;
        }

        self.publish(Event::NewBlockHeader(block.header.clone())).await;
        self.publish(Event::NewBlock {
            block: block.clone(),
            commit_round,
        })
        .await;

        let next_validators = self
            .executor
            .apply_block(&block, &commit)
            .await
            .map_err(StateError::Executor)?;

        self.wal.write_end_height(height)?;

        // Rotate the validator set into the next height.
        self.last_validators = self.validators.clone();
        match next_validators {
            Some(next) => {
                let mut next = next;
                next.increment_proposer_priority(1);
                self.validators = next;
            }
            None => self.validators.increment_proposer_priority(1),
        }

        self.enter_new_height(height + 1, commit_round).await
    }

    async fn enter_new_height(
        &mut self,
        height: Height,
        commit_round: Round,
    ) -> Result<(), StateError> {
        let last_commit = self.rs.votes.precommits(commit_round).cloned();
        let start_time = current_time_ms() + self.config.commit().as_millis() as u64;
        self.rs = RoundState::new(self.chain_id.clone(), height, start_time, last_commit);
        self.wal.write_height_start(height, start_time)?;

        info!(height, "Starting new height");

        let have_all = self
            .rs
            .last_commit
            .as_ref()
            .map(|set| set.has_all())
            .unwrap_or(false);
        if self.config.skip_timeout_commit && have_all {
            self.enter_new_round(height, 0).await
        } else {
            self.schedule_timeout(self.config.commit(), 0, Step::NewHeight)
                .await;
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Votes
    // ------------------------------------------------------------------

    /// Sign our own vote, log it, broadcast it and tally it.
    async fn sign_and_add_vote(
        &mut self,
        vote_type: VoteType,
        block_id: BlockId,
    ) -> Result<(), StateError> {
        if self.replay {
            return Ok(());
        }
        let address = self.signer.address();
        let Some((index, _)) = self.validators.get_by_address(&address) else {
            debug!(height = self.rs.height, "Not a validator, observing only");
            return Ok(());
        };

        let mut vote = Vote::new(
            vote_type,
            self.rs.height,
            self.rs.round,
            block_id,
            address,
            index,
        );
        vote.timestamp_ms = current_time_ms();
        if let Err(e) = self.signer.sign_vote(&self.chain_id, &mut vote) {
            // The signer saw a conflicting vote at this position, most
            // likely signed before a crash. Never send a second one.
            error!(vote = %vote, error = %e, "Refusing to sign vote");
            return Ok(());
        }

        self.wal.write_input(&WalInput::Vote {
            vote: vote.clone(),
            peer: None,
        })?;
        self.send_outbound(OutboundMessage::Vote(vote.clone())).await;
        self.try_add_vote(vote, None).await
    }

    /// Tally a vote and drive every transition it enables.
    fn try_add_vote(&mut self, vote: Vote, peer: Option<PeerId>) -> BoxedStep<'_> {
        Box::pin(async move {
            // A precommit for the previous height belongs to last_commit.
            if vote.height + 1 == self.rs.height {
                if vote.vote_type != VoteType::Precommit || self.rs.step != Step::NewHeight {
                    debug!(vote = %vote, "Dropping stale previous-height vote");
                    return Ok(());
                }
                let Some(last_commit) = self.rs.last_commit.as_mut() else {
                    return Ok(());
                };
                match last_commit.add_vote(vote.clone(), &self.last_validators) {
                    Ok(VoteAdded { conflicting: None }) => {
                        debug!(vote = %vote, "Added vote to last commit");
                        self.publish(Event::Vote(vote)).await;
                        let have_all = self
                            .rs
                            .last_commit
                            .as_ref()
                            .map(|set| set.has_all())
                            .unwrap_or(false);
                        if self.config.skip_timeout_commit && have_all {
                            let height = self.rs.height;
                            self.enter_new_round(height, 0).await?;
                        }
                    }
                    Ok(VoteAdded {
                        conflicting: Some(evidence),
                    }) => {
                        self.publish(Event::Evidence(evidence.clone())).await;
                        self.send_outbound(OutboundMessage::Evidence(evidence)).await;
                    }
                    Err(e) => debug!(vote = %vote, error = %e, "Rejected last-commit vote"),
                }
                return Ok(());
            }

            if vote.height != self.rs.height {
                debug!(vote = %vote, current = self.rs.height, "Dropping vote for another height");
                return Ok(());
            }
            if vote.round > self.rs.round.saturating_add(self.config.max_future_rounds) {
                debug!(vote = %vote, "Dropping vote from the far future");
                return Ok(());
            }

            match self.rs.votes.add_vote(vote.clone(), &self.validators) {
                Ok(VoteAdded { conflicting: None }) => {}
                Ok(VoteAdded {
                    conflicting: Some(evidence),
                }) => {
                    // Equivocation: forward the proof, count nothing.
                    warn!(
                        vote = %vote,
                        validator = %evidence.validator_address,
                        "Conflicting vote, emitting evidence"
                    );
                    self.publish(Event::Evidence(evidence.clone())).await;
                    self.send_outbound(OutboundMessage::Evidence(evidence)).await;
                    return Ok(());
                }
                Err(e) => {
                    debug!(vote = %vote, peer = ?peer, error = %e, "Rejected vote");
                    return Ok(());
                }
            }

            self.publish(Event::Vote(vote.clone())).await;

            let height = self.rs.height;

            // Round skip: 1/3+ of power on any higher round means at least
            // one honest validator is there already.
            if vote.round > self.rs.round
                && self.rs.votes.one_third_any_at(vote.round, &self.validators)
            {
                info!(height, from = self.rs.round, to = vote.round, "Skipping to higher round");
                self.enter_new_round(height, vote.round).await?;
            }

            match vote.vote_type {
                VoteType::Prevote => self.on_prevote_added(height, &vote).await,
                VoteType::Precommit => self.on_precommit_added(height, &vote).await,
            }
        })
    }

    async fn on_prevote_added(&mut self, height: Height, vote: &Vote) -> Result<(), StateError> {
        let vote_round = vote.round;
        let (polka, two_thirds_any) = {
            let Some(prevotes) = self.rs.votes.prevotes(vote_round) else {
                return Ok(());
            };
            (
                prevotes.two_thirds_majority(&self.validators),
                prevotes.has_two_thirds_any(&self.validators),
            )
        };

        if let Some(block_id) = &polka {
            // Unlock rule: a polka between our locked round (exclusive) and
            // the current round (inclusive) on something other than our
            // lock releases it.
            if self.rs.locked_block.is_some()
                && self.rs.locked_round < vote_round as i64
                && vote_round <= self.rs.round
                && !self.rs.locked_block_matches(block_id)
            {
                info!(height, round = vote_round, "Polka past our lock, unlocking");
                self.unlock().await;
            }

            // Valid-block rule: a polka at the current round for a block we
            // hold becomes the valid block, even if we already precommitted
            // nil this round.
            if !block_id.is_nil()
                && self.rs.valid_round < vote_round as i64
                && vote_round == self.rs.round
            {
                if self.rs.proposal_block_matches(block_id) {
                    self.rs.valid_round = vote_round as i64;
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                    info!(height, round = vote_round, block_id = %block_id, "Updating valid block");
                    self.publish(Event::ValidBlock {
                        height,
                        round: vote_round,
                        block_id: block_id.clone(),
                    })
                    .await;
                } else {
                    // Polka'd block is missing: retarget part collection.
                    self.rs.proposal_block = None;
                    let parts_match = self
                        .rs
                        .proposal_block_parts
                        .as_ref()
                        .map(|p| *p.header() == block_id.parts_header)
                        .unwrap_or(false);
                    if !parts_match {
                        self.rs.proposal_block_parts = PartSet::new_from_header(
                            block_id.parts_header.clone(),
                            self.config.block_part_size,
                        )
                        .ok();
                    }
                }
            }
        }

        if self.rs.round < vote_round && two_thirds_any {
            // 2/3 of power is voting in a round ahead of us.
            self.enter_new_round(height, vote_round).await?;
        } else if self.rs.round == vote_round && self.rs.step >= Step::Prevote {
            match &polka {
                Some(block_id) if block_id.is_nil() || self.is_proposal_complete() => {
                    self.enter_precommit(height, vote_round).await?;
                }
                _ if two_thirds_any => {
                    self.enter_prevote_wait(height, vote_round).await?;
                }
                _ => {}
            }
        } else if let Some(proposal) = self.rs.proposal.clone() {
            // A late polka can complete a proposal that cites it.
            if proposal.pol_round == vote_round as i64 && self.is_proposal_complete() {
                let round = self.rs.round;
                self.enter_prevote(height, round).await?;
            }
        }
        Ok(())
    }

    async fn on_precommit_added(&mut self, height: Height, vote: &Vote) -> Result<(), StateError> {
        let vote_round = vote.round;
        let (majority, two_thirds_any, has_all) = {
            let Some(precommits) = self.rs.votes.precommits(vote_round) else {
                return Ok(());
            };
            (
                precommits.two_thirds_majority(&self.validators),
                precommits.has_two_thirds_any(&self.validators),
                precommits.has_all(),
            )
        };

        if let Some(block_id) = majority {
            self.enter_new_round(height, vote_round).await?;
            self.enter_precommit(height, vote_round).await?;
            if !block_id.is_nil() {
                self.enter_commit(height, vote_round).await?;
                if self.config.skip_timeout_commit && has_all {
                    // Everyone has spoken; no reason to linger in NewHeight.
                    let new_height = self.rs.height;
                    self.enter_new_round(new_height, 0).await?;
                }
            } else {
                self.enter_precommit_wait(height, vote_round).await?;
            }
        } else if self.rs.round <= vote_round && two_thirds_any {
            self.enter_new_round(height, vote_round).await?;
            self.enter_precommit_wait(height, vote_round).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    async fn handle_timeout(&mut self, info: TimeoutInfo) -> Result<(), StateError> {
        if info.height != self.rs.height
            || info.round < self.rs.round
            || (info.round == self.rs.round && info.step < self.rs.step)
        {
            debug!(timeout = %info, current = %self.rs, "Ignoring stale timeout");
            return Ok(());
        }

        debug!(timeout = %info, "Handling timeout");
        match info.step {
            Step::NewHeight => self.enter_new_round(info.height, 0).await,
            Step::NewRound => self.enter_propose(info.height, info.round).await,
            Step::Propose => {
                self.publish(Event::TimeoutPropose {
                    height: info.height,
                    round: info.round,
                })
                .await;
                self.enter_prevote(info.height, info.round).await
            }
            Step::PrevoteWait => {
                self.publish(Event::TimeoutWait {
                    height: info.height,
                    round: info.round,
                    step: info.step,
                })
                .await;
                self.enter_precommit(info.height, info.round).await
            }
            Step::PrecommitWait => {
                self.publish(Event::TimeoutWait {
                    height: info.height,
                    round: info.round,
                    step: info.step,
                })
                .await;
                self.enter_precommit(info.height, info.round).await?;
                self.enter_new_round(info.height, info.round + 1).await
            }
            _ => {
                debug!(timeout = %info, "No action for timeout step");
                Ok(())
            }
        }
    }
}

/// The serializable mirror of an inbound message, if it must be WAL-logged.
fn wal_input_of(input: &StateInput) -> Option<WalInput> {
    match input {
        StateInput::Start { height, round } => Some(WalInput::Start {
            height: *height,
            round: *round,
        }),
        StateInput::Proposal { proposal, peer } => Some(WalInput::Proposal {
            proposal: proposal.clone(),
            peer: peer.clone(),
        }),
        StateInput::BlockPart {
            height,
            round,
            part,
            peer,
        } => Some(WalInput::BlockPart {
            height: *height,
            round: *round,
            part: part.clone(),
            peer: peer.clone(),
        }),
        StateInput::Vote { vote, peer } => Some(WalInput::Vote {
            vote: vote.clone(),
            peer: peer.clone(),
        }),
        StateInput::SetProposalAndBlock {
            proposal,
            block,
            peer,
        } => Some(WalInput::SetProposalAndBlock {
            proposal: proposal.clone(),
            block: block.clone(),
            peer: peer.clone(),
        }),
        _ => None,
    }
}

/// Rebuild a live input from its WAL record.
fn state_input_of(input: WalInput) -> StateInput {
    match input {
        WalInput::Start { height, round } => StateInput::Start { height, round },
        WalInput::Proposal { proposal, peer } => StateInput::Proposal { proposal, peer },
        WalInput::BlockPart {
            height,
            round,
            part,
            peer,
        } => StateInput::BlockPart {
            height,
            round,
            part,
            peer,
        },
        WalInput::Vote { vote, peer } => StateInput::Vote { vote, peer },
        WalInput::SetProposalAndBlock {
            proposal,
            block,
            peer,
        } => StateInput::SetProposalAndBlock {
            proposal,
            block,
            peer,
        },
    }
}
