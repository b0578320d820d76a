//! Typed consensus events.
//!
//! The state machine publishes an [`Event`] for every externally visible
//! transition. Subscriptions are per event kind; publishing awaits channel
//! capacity, so a subscriber that keeps reading observes every matching
//! event in transition order and never misses one. A capacity-1
//! subscription gives the rendezvous-grade delivery the protocol tests
//! rely on.

use std::sync::Arc;

use meridian_types::{Block, BlockHeader, BlockId};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::evidence::DuplicateVoteEvidence;
use crate::types::{Height, Round, Step, Vote};
use meridian_crypto::Address;

/// A consensus state transition, published on the event bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// A round began
    NewRound {
        /// Height of the round
        height: Height,
        /// The round number
        round: Round,
        /// The proposer for this round
        proposer: Address,
    },
    /// The step within a round changed
    NewRoundStep {
        /// Height
        height: Height,
        /// Round
        round: Round,
        /// The step just entered
        step: Step,
    },
    /// The full proposal block for the current round was assembled
    CompleteProposal {
        /// Height
        height: Height,
        /// Round
        round: Round,
        /// Identity of the proposed block
        block_id: BlockId,
    },
    /// A vote was accepted into the tally (our own or a peer's)
    Vote(Vote),
    /// A polka'd block became the valid block
    ValidBlock {
        /// Height
        height: Height,
        /// Round of the polka
        round: Round,
        /// Identity of the valid block
        block_id: BlockId,
    },
    /// The node locked on a block with no previous lock
    Lock {
        /// Height
        height: Height,
        /// Locking round
        round: Round,
        /// Identity of the locked block
        block_id: BlockId,
    },
    /// The node moved its lock to a new round (same or different block)
    Relock {
        /// Height
        height: Height,
        /// New locking round
        round: Round,
        /// Identity of the locked block
        block_id: BlockId,
    },
    /// The node released its lock
    Unlock {
        /// Height
        height: Height,
        /// Round in which the lock was released
        round: Round,
    },
    /// The propose timeout fired without a complete proposal
    TimeoutPropose {
        /// Height
        height: Height,
        /// Round
        round: Round,
    },
    /// A prevote-wait or precommit-wait timeout fired
    TimeoutWait {
        /// Height
        height: Height,
        /// Round
        round: Round,
        /// The waiting step that expired
        step: Step,
    },
    /// A block was committed; header published before the full block
    NewBlockHeader(BlockHeader),
    /// A block was committed
    NewBlock {
        /// The committed block
        block: Block,
        /// The round whose precommits justified it
        commit_round: Round,
    },
    /// Slashable duplicate-vote evidence was detected
    Evidence(DuplicateVoteEvidence),
}

impl Event {
    /// The kind of this event, used for subscription routing.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NewRound { .. } => EventKind::NewRound,
            Event::NewRoundStep { .. } => EventKind::NewRoundStep,
            Event::CompleteProposal { .. } => EventKind::CompleteProposal,
            Event::Vote(_) => EventKind::Vote,
            Event::ValidBlock { .. } => EventKind::ValidBlock,
            Event::Lock { .. } => EventKind::Lock,
            Event::Relock { .. } => EventKind::Relock,
            Event::Unlock { .. } => EventKind::Unlock,
            Event::TimeoutPropose { .. } => EventKind::TimeoutPropose,
            Event::TimeoutWait { .. } => EventKind::TimeoutWait,
            Event::NewBlockHeader(_) => EventKind::NewBlockHeader,
            Event::NewBlock { .. } => EventKind::NewBlock,
            Event::Evidence(_) => EventKind::Evidence,
        }
    }
}

/// Discriminant of [`Event`], used as a subscription query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`Event::NewRound`]
    NewRound,
    /// See [`Event::NewRoundStep`]
    NewRoundStep,
    /// See [`Event::CompleteProposal`]
    CompleteProposal,
    /// See [`Event::Vote`]
    Vote,
    /// See [`Event::ValidBlock`]
    ValidBlock,
    /// See [`Event::Lock`]
    Lock,
    /// See [`Event::Relock`]
    Relock,
    /// See [`Event::Unlock`]
    Unlock,
    /// See [`Event::TimeoutPropose`]
    TimeoutPropose,
    /// See [`Event::TimeoutWait`]
    TimeoutWait,
    /// See [`Event::NewBlockHeader`]
    NewBlockHeader,
    /// See [`Event::NewBlock`]
    NewBlock,
    /// See [`Event::Evidence`]
    Evidence,
}

struct Subscription {
    kind: EventKind,
    tx: mpsc::Sender<Event>,
}

/// Pub/sub bus for consensus events.
///
/// Cloneable; all clones share the subscriber list. Closed receivers are
/// pruned on the next publish of their kind.
#[derive(Clone, Default)]
pub struct EventBus {
    subs: Arc<Mutex<Vec<Subscription>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind with the given channel capacity.
    ///
    /// Capacity 1 means the publisher waits for the subscriber to consume
    /// the previous event before the next transition completes.
    pub fn subscribe(&self, kind: EventKind, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subs.lock().push(Subscription { kind, tx });
        rx
    }

    /// Publish an event to every matching subscriber, in subscription order.
    pub async fn publish(&self, event: Event) {
        let kind = event.kind();
        let targets: Vec<mpsc::Sender<Event>> = self
            .subs
            .lock()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.tx.clone())
            .collect();

        let mut dropped = false;
        for tx in targets {
            if tx.send(event.clone()).await.is_err() {
                dropped = true;
            }
        }
        if dropped {
            self.subs
                .lock()
                .retain(|s| s.kind != kind || !s.tx.is_closed());
        }
    }

    /// Drop every subscription. Receivers observe channel closure.
    pub fn close(&self) {
        self.subs.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_sees_matching_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(EventKind::NewRound, 8);

        for round in 0..3 {
            bus.publish(Event::NewRound {
                height: 1,
                round,
                proposer: Address::default(),
            })
            .await;
            bus.publish(Event::NewRoundStep {
                height: 1,
                round,
                step: Step::Propose,
            })
            .await;
        }

        for expected in 0..3 {
            match rx.recv().await.unwrap() {
                Event::NewRound { round, .. } => assert_eq!(round, expected),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(EventKind::Unlock, 1);
        drop(rx);

        // Publishing must neither error nor block on the dead channel.
        bus.publish(Event::Unlock { height: 1, round: 0 }).await;
        bus.publish(Event::Unlock { height: 1, round: 1 }).await;
    }
}
