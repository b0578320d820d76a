//! Shared fixtures for consensus integration tests.
//!
//! Builds a running state-machine task with deterministic validator keys,
//! an in-memory application, a temp-dir WAL and a drained outbound sink,
//! plus the `ensure_*` helpers the scenario tests step through events with.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meridian_consensus::{
    BlockExecutor, BlockStore, ConsensusConfig, ConsensusHandle, ConsensusState, ConsensusWal,
    Event, EventKind, LocalSigner, OutboundMessage, PeerId, Proposal, RoundStateSnapshot,
    StateError, Validator, ValidatorSet, Vote, VoteType, WalConfig,
};
use meridian_crypto::{Hash, PrivateKey};
use meridian_types::{Block, BlockHeader, BlockId, Commit, PartSet, PartSetHeader};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use meridian_consensus::Step;

/// App hash marking a block the application rejects.
pub const INVALID_APP_HASH: Hash = [0xEE; 32];

pub const CHAIN_ID: &str = "meridian-test";
pub const POWER: u64 = 10;

/// One validator identity of the fixture.
pub struct Val {
    pub key: PrivateKey,
    pub index: u32,
}

impl Val {
    pub fn address(&self) -> meridian_crypto::Address {
        self.key.address()
    }

    /// Build and sign a vote from this validator.
    pub fn vote(&self, vote_type: VoteType, height: u64, round: u32, block_id: BlockId) -> Vote {
        let mut vote = Vote::new(vote_type, height, round, block_id, self.address(), self.index);
        vote.timestamp_ms = 1;
        vote.signature = self.key.sign(&vote.signing_bytes(CHAIN_ID));
        vote
    }

    /// Build and sign a proposal from this validator.
    pub fn proposal(&self, height: u64, round: u32, pol_round: i64, block_id: BlockId) -> Proposal {
        let mut proposal = Proposal::new(height, round, pol_round, block_id);
        proposal.timestamp_ms = 1;
        proposal.signature = self.key.sign(&proposal.signing_bytes(CHAIN_ID));
        proposal
    }
}

/// In-memory application and block store.
pub struct TestApp {
    part_size: usize,
    last_block_id: Mutex<BlockId>,
    /// Set to false to simulate a proposer with nothing to propose.
    pub propose_enabled: Mutex<bool>,
    pub applied_heights: Mutex<Vec<u64>>,
    pub saved_heights: Mutex<Vec<u64>>,
}

impl TestApp {
    pub fn new(part_size: usize) -> Self {
        Self {
            part_size,
            last_block_id: Mutex::new(BlockId::nil()),
            propose_enabled: Mutex::new(true),
            applied_heights: Mutex::new(Vec::new()),
            saved_heights: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BlockExecutor for TestApp {
    async fn create_proposal_block(&self, height: u64, last_commit: &Commit) -> Option<Block> {
        if !*self.propose_enabled.lock() {
            return None;
        }
        let header = BlockHeader {
            chain_id: CHAIN_ID.to_string(),
            height,
            timestamp_ms: height * 1000,
            last_block_id: self.last_block_id.lock().clone(),
            ..Default::default()
        };
        Some(Block::new(
            header,
            vec![format!("payload-{height}").into_bytes()],
            last_commit.clone(),
        ))
    }

    async fn validate_block(&self, block: &Block) -> Result<(), String> {
        if block.header.app_hash == INVALID_APP_HASH {
            return Err("application state hash mismatch".to_string());
        }
        Ok(())
    }

    async fn apply_block(
        &self,
        block: &Block,
        _commit: &Commit,
    ) -> Result<Option<ValidatorSet>, String> {
        *self.last_block_id.lock() = block.block_id(self.part_size);
        self.applied_heights.lock().push(block.header.height);
        Ok(None)
    }
}

#[async_trait]
impl BlockStore for TestApp {
    async fn save_block(
        &self,
        block: Block,
        _parts: PartSet,
        _commit: Commit,
    ) -> Result<(), String> {
        self.saved_heights.lock().push(block.header.height);
        Ok(())
    }
}

/// A running consensus node plus the fixture validators.
pub struct TestNode {
    pub handle: ConsensusHandle,
    /// All validators in validator-set (address) order. `vals[node_index]`
    /// is the node under test.
    pub vals: Vec<Val>,
    pub node_index: usize,
    pub config: ConsensusConfig,
    pub app: Arc<TestApp>,
    pub validator_set: ValidatorSet,
    wal_dir: Arc<TempDir>,
    task: Option<JoinHandle<Result<(), StateError>>>,
}

impl TestNode {
    /// The node's own validator identity.
    pub fn me(&self) -> &Val {
        &self.vals[self.node_index]
    }

    /// Peer validators (everyone but the node).
    pub fn peers(&self) -> Vec<&Val> {
        self.vals
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.node_index)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn subscribe(&self, kind: EventKind) -> mpsc::Receiver<Event> {
        self.handle.subscribe(kind, 64)
    }

    pub async fn start(&self, height: u64, round: u32) {
        self.handle.start(height, round).await.unwrap();
    }

    /// Sign votes from the given validator indices and feed them in.
    pub async fn add_votes(
        &self,
        indices: &[usize],
        vote_type: VoteType,
        height: u64,
        round: u32,
        block_id: BlockId,
    ) {
        for &i in indices {
            let vote = self.vals[i].vote(vote_type, height, round, block_id.clone());
            self.handle
                .vote(vote, Some(PeerId::from("test-peer")))
                .await
                .unwrap();
        }
    }

    pub async fn snapshot(&self) -> RoundStateSnapshot {
        self.handle.round_state().await.unwrap()
    }

    /// A deterministic block as proposer `tag` would build it.
    pub fn make_block(&self, height: u64, tag: &str) -> Block {
        let header = BlockHeader {
            chain_id: CHAIN_ID.to_string(),
            height,
            timestamp_ms: height * 1000,
            proposer_address: self.vals[0].address(),
            ..Default::default()
        };
        Block::new(
            header,
            vec![format!("{tag}-{height}").into_bytes()],
            Commit::empty(),
        )
    }

    /// The full identity of `block` under the configured part size.
    pub fn block_id(&self, block: &Block) -> BlockId {
        block.block_id(self.config.block_part_size)
    }

    /// A non-nil block id that matches no real block.
    pub fn opaque_block_id(&self, byte: u8) -> BlockId {
        BlockId::new([byte; 32], PartSetHeader::new(1, [byte; 32]))
    }

    /// Index of the proposer for a round of the current height's set.
    pub fn proposer_index(&self, round: u32) -> usize {
        let proposer = self.validator_set.proposer_for_round(round);
        self.vals
            .iter()
            .position(|v| v.address() == proposer.address)
            .expect("proposer is a fixture validator")
    }

    /// Deliver `block` with a proposal signed by the proposer of `round`.
    pub async fn deliver_proposal_and_block(&self, round: u32, block: &Block, pol_round: i64) {
        let proposer = &self.vals[self.proposer_index(round)];
        let proposal = proposer.proposal(
            block.header.height,
            round,
            pol_round,
            self.block_id(block),
        );
        self.handle
            .set_proposal_and_block(proposal, block.clone(), Some(PeerId::from("test-peer")))
            .await
            .unwrap();
    }

    /// Deliver every part of `block` through part gossip.
    pub async fn deliver_block_parts(&self, height: u64, round: u32, block: &Block) {
        let parts = block.make_part_set(self.config.block_part_size);
        for index in 0..parts.total() {
            let part = parts.get_part(index).unwrap().clone();
            self.handle
                .block_part(height, round, part, Some(PeerId::from("test-peer")))
                .await
                .unwrap();
        }
    }

    /// Stop the task and release the WAL directory handle for a restart.
    pub async fn shutdown(&mut self) {
        self.handle.stop().await.unwrap();
        if let Some(task) = self.task.take() {
            task.await.unwrap().unwrap();
        }
    }

    /// Restart the node against the same WAL directory.
    pub async fn restart(&mut self) {
        self.shutdown().await;
        let restarted = node_with_dir(
            self.vals.len(),
            self.node_index,
            self.config.clone(),
            self.wal_dir.clone(),
        );
        self.handle = restarted.handle;
        self.app = restarted.app;
        self.task = restarted.task;
    }
}

/// Build (but do not start) a node over `n` equal-power validators; the
/// node under test sits at `node_index` in address order.
pub fn node(n: usize, node_index: usize, config: ConsensusConfig) -> TestNode {
    node_with_dir(n, node_index, config, Arc::new(TempDir::new().unwrap()))
}

fn node_with_dir(
    n: usize,
    node_index: usize,
    config: ConsensusConfig,
    wal_dir: Arc<TempDir>,
) -> TestNode {
    let mut keys: Vec<PrivateKey> = (0..n)
        .map(|i| PrivateKey::from_seed([i as u8 + 1; 32]))
        .collect();
    keys.sort_by_key(|k| k.address());

    let vals: Vec<Val> = keys
        .into_iter()
        .enumerate()
        .map(|(i, key)| Val {
            key,
            index: i as u32,
        })
        .collect();
    let validator_set = ValidatorSet::new(
        vals.iter()
            .map(|v| Validator::new(v.key.public_key(), POWER))
            .collect(),
    );

    let app = Arc::new(TestApp::new(config.block_part_size));
    let signer = Arc::new(LocalSigner::new(vals[node_index].key.clone()));
    let wal = ConsensusWal::open(WalConfig {
        dir: wal_dir.path().to_path_buf(),
        sync_on_write: false,
        strict_recovery: false,
    })
    .unwrap();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(64);
    tokio::spawn(async move { while outbound_rx.recv().await.is_some() {} });

    let (state, handle) = ConsensusState::new(
        config.clone(),
        CHAIN_ID,
        1,
        validator_set.clone(),
        signer,
        app.clone(),
        app.clone(),
        wal,
        outbound_tx,
    );
    let task = tokio::spawn(state.run());

    TestNode {
        handle,
        vals,
        node_index,
        config,
        app,
        validator_set,
        wal_dir,
        task: Some(task),
    }
}

// ----------------------------------------------------------------------
// Event helpers
// ----------------------------------------------------------------------

pub async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

pub async fn ensure_new_round(rx: &mut mpsc::Receiver<Event>, height: u64, round: u32) {
    match next_event(rx).await {
        Event::NewRound {
            height: h,
            round: r,
            ..
        } => {
            assert_eq!((h, r), (height, round), "unexpected round");
        }
        other => panic!("expected NewRound, got {other:?}"),
    }
}

pub async fn ensure_new_round_proposer(
    rx: &mut mpsc::Receiver<Event>,
    height: u64,
    round: u32,
) -> meridian_crypto::Address {
    match next_event(rx).await {
        Event::NewRound {
            height: h,
            round: r,
            proposer,
        } => {
            assert_eq!((h, r), (height, round), "unexpected round");
            proposer
        }
        other => panic!("expected NewRound, got {other:?}"),
    }
}

pub async fn ensure_complete_proposal(rx: &mut mpsc::Receiver<Event>, height: u64) -> BlockId {
    match next_event(rx).await {
        Event::CompleteProposal {
            height: h,
            block_id,
            ..
        } => {
            assert_eq!(h, height, "unexpected proposal height");
            block_id
        }
        other => panic!("expected CompleteProposal, got {other:?}"),
    }
}

pub async fn ensure_vote(rx: &mut mpsc::Receiver<Event>) -> Vote {
    match next_event(rx).await {
        Event::Vote(vote) => vote,
        other => panic!("expected Vote, got {other:?}"),
    }
}

/// Wait for the node's own vote of the given type, skipping peer votes.
pub async fn ensure_own_vote(
    rx: &mut mpsc::Receiver<Event>,
    node: &TestNode,
    vote_type: VoteType,
) -> Vote {
    loop {
        let vote = ensure_vote(rx).await;
        if vote.validator_address == node.me().address() && vote.vote_type == vote_type {
            return vote;
        }
    }
}

pub async fn ensure_new_block(rx: &mut mpsc::Receiver<Event>, height: u64) -> Block {
    match next_event(rx).await {
        Event::NewBlock { block, .. } => {
            assert_eq!(block.header.height, height, "unexpected block height");
            block
        }
        other => panic!("expected NewBlock, got {other:?}"),
    }
}

pub async fn ensure_valid_block(rx: &mut mpsc::Receiver<Event>, height: u64) -> BlockId {
    match next_event(rx).await {
        Event::ValidBlock {
            height: h,
            block_id,
            ..
        } => {
            assert_eq!(h, height, "unexpected valid-block height");
            block_id
        }
        other => panic!("expected ValidBlock, got {other:?}"),
    }
}

pub async fn ensure_unlock(rx: &mut mpsc::Receiver<Event>, height: u64) {
    match next_event(rx).await {
        Event::Unlock { height: h, .. } => assert_eq!(h, height, "unexpected unlock height"),
        other => panic!("expected Unlock, got {other:?}"),
    }
}

pub fn assert_no_event(rx: &mut mpsc::Receiver<Event>) {
    match rx.try_recv() {
        Err(_) => {}
        Ok(event) => panic!("expected no event, got {event:?}"),
    }
}
