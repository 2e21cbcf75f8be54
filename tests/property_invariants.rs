use proptest::prelude::*;

use synclog::{
    core::state::{Outcome, SyncState, Update, UpdateContext, update},
    event::{Event, EventArgs},
    types::{ClientId, EventSequenceNumber},
};

const LOCAL: ClientId = 1;
const REMOTE: ClientId = 2;

#[derive(Debug, Clone)]
enum Action {
    LocalPush { count: u8 },
    StalePush,
    ServerAdvanceRemote,
    ServerAcceptLocal,
    ServerRebase { depth: u8, replacements: u8 },
    Trim { keep: u8 },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (1u8..4).prop_map(|count| Action::LocalPush { count }),
        Just(Action::StalePush),
        Just(Action::ServerAdvanceRemote),
        Just(Action::ServerAcceptLocal),
        (1u8..4, 0u8..3).prop_map(|(depth, replacements)| Action::ServerRebase {
            depth,
            replacements,
        }),
        (1u8..4).prop_map(|keep| Action::Trim { keep }),
    ]
}

struct Driver {
    state: SyncState,
    /// Everything ever applied and not yet rolled back, from genesis.
    applied: Vec<Event>,
    payload_counter: u64,
}

impl Driver {
    fn new() -> Self {
        Self {
            state: SyncState::new(),
            applied: Vec::new(),
            payload_counter: 0,
        }
    }

    fn fresh_event(&mut self, head: EventSequenceNumber, client: ClientId) -> Event {
        self.payload_counter += 1;
        Event::new_local(
            head,
            "op",
            EventArgs::from_bytes(self.payload_counter.to_be_bytes().to_vec()),
            client,
            1,
            false,
        )
    }

    fn run(&mut self, input: Update) -> Result<Outcome, TestCaseError> {
        let is_local = |e: &Event| e.client_id == LOCAL;
        let is_equal = |a: &Event, b: &Event| a.same_as(b);
        let rebase = |e: &Event, parent: EventSequenceNumber| e.rebased_onto(parent);
        let ctx = UpdateContext {
            is_local_event: &is_local,
            is_equal_event: &is_equal,
            rebase: &rebase,
        };
        match update(self.state.clone(), input, &ctx) {
            Ok(outcome) => Ok(outcome),
            Err(violation) => {
                prop_assert!(false, "unexpected violation: {violation:?}");
                unreachable!()
            }
        }
    }

    fn adopt(&mut self, outcome: Outcome) -> Result<(), TestCaseError> {
        match outcome {
            Outcome::Advance { state, new_events } => {
                self.state = state;
                self.applied.extend(new_events);
            }
            Outcome::Rebase {
                state,
                rollback,
                new_events,
            } => {
                // Rollback is newest first and must exactly match the tail
                // of what has been applied.
                prop_assert!(self.applied.len() >= rollback.len());
                for undone in &rollback {
                    let last = self.applied.pop().unwrap();
                    prop_assert_eq!(&last, undone);
                }

                // Unconfirmed local work is never lost: every rolled-back
                // pending event reappears rewritten with a higher generation.
                // (Confirmed events the server itself discarded stay gone.)
                let mut divergent: Vec<Event> = rollback
                    .iter()
                    .filter(|e| self.state.pending.iter().any(|p| p == *e))
                    .cloned()
                    .collect();
                for rewritten in new_events.iter().filter(|e| e.client_id == LOCAL) {
                    let idx = divergent
                        .iter()
                        .position(|e| e.args == rewritten.args && e.name == rewritten.name);
                    let original = idx.map(|i| divergent.remove(i));
                    prop_assert!(original.is_some(), "rewritten event without an original");
                    prop_assert!(
                        rewritten.seq.rebase_generation
                            > original.unwrap().seq.rebase_generation
                    );
                }
                prop_assert!(divergent.is_empty(), "pending events dropped by a rebase");

                self.state = state;
                self.applied.extend(new_events);
            }
            Outcome::Reject { .. } => {
                prop_assert!(false, "unexpected reject");
            }
        }
        Ok(())
    }

    fn check(&self) -> Result<(), TestCaseError> {
        prop_assert!(self.state.check_chain().is_ok());

        let mut parent = EventSequenceNumber::ROOT;
        for event in &self.applied {
            prop_assert_eq!(event.parent_seq, parent);
            prop_assert!(event.seq > parent);
            parent = event.seq;
        }

        let mut live: Vec<&Event> = self.state.rollback_tail.iter().collect();
        live.extend(self.state.pending.iter());
        prop_assert!(self.applied.len() >= live.len());
        let offset = self.applied.len() - live.len();
        for (stored, expected) in self.applied[offset..].iter().zip(live) {
            prop_assert_eq!(stored, expected);
        }

        for event in &self.state.pending {
            prop_assert_eq!(event.client_id, LOCAL);
        }
        Ok(())
    }
}

proptest! {
    #[test]
    fn random_update_sequences_preserve_chain_and_local_work(
        actions in prop::collection::vec(action_strategy(), 1..120)
    ) {
        let mut driver = Driver::new();

        for action in actions {
            match action {
                Action::LocalPush { count } => {
                    let mut head = driver.state.head();
                    let mut events = Vec::new();
                    for _ in 0..count {
                        let event = driver.fresh_event(head, LOCAL);
                        head = event.seq;
                        events.push(event);
                    }
                    let outcome = driver.run(Update::LocalPush { new_events: events })?;
                    driver.adopt(outcome)?;
                }
                Action::StalePush => {
                    if driver.state.head() == EventSequenceNumber::ROOT {
                        continue;
                    }
                    let stale = driver.fresh_event(EventSequenceNumber::ROOT, LOCAL);
                    let outcome = driver.run(Update::LocalPush {
                        new_events: vec![stale],
                    })?;
                    prop_assert!(
                        matches!(outcome, Outcome::Reject { .. }),
                        "expected Outcome::Reject, got {:?}",
                        outcome
                    );
                }
                Action::ServerAdvanceRemote => {
                    let event = driver.fresh_event(driver.state.upstream_head, REMOTE);
                    let outcome = driver.run(Update::UpstreamAdvance {
                        new_events: vec![event],
                    })?;
                    driver.adopt(outcome)?;
                }
                Action::ServerAcceptLocal => {
                    let Some(first) = driver.state.pending.first().cloned() else {
                        continue;
                    };
                    let outcome = driver.run(Update::UpstreamAdvance {
                        new_events: vec![first],
                    })?;
                    driver.adopt(outcome)?;
                }
                Action::ServerRebase { depth, replacements } => {
                    let tail = &driver.state.rollback_tail;
                    if tail.is_empty() {
                        continue;
                    }
                    let depth = usize::from(depth).min(tail.len());
                    let rollback_until = if depth == tail.len() {
                        tail[0].parent_seq
                    } else {
                        tail[tail.len() - depth - 1].seq
                    };
                    let mut head = rollback_until;
                    let mut events = Vec::new();
                    for _ in 0..replacements {
                        let event = driver.fresh_event(head, REMOTE);
                        head = event.seq;
                        events.push(event);
                    }
                    let outcome = driver.run(Update::UpstreamRebase {
                        rollback_until,
                        new_events: events,
                    })?;
                    driver.adopt(outcome)?;
                }
                Action::Trim { keep } => {
                    let tail = &driver.state.rollback_tail;
                    let keep = usize::from(keep);
                    if tail.len() <= keep {
                        continue;
                    }
                    let new_rollback_start = tail[tail.len() - keep].seq;
                    let outcome = driver.run(Update::TrimRollbackTail { new_rollback_start })?;
                    driver.adopt(outcome)?;
                }
            }

            driver.check()?;
        }
    }
}
