//! Pure event-ordering and rebase algorithm.
//!
//! [`update`] is the only way a [`SyncState`] advances. It performs no I/O
//! and never panics over its documented input domain: every outcome,
//! including invariant violations the caller must treat as fatal, is a value.

use crate::event::Event;
use crate::types::EventSequenceNumber;

/// Per-node reconciliation state.
///
/// `pending` holds events accepted downstream but not yet confirmed by the
/// tracked upstream; `rollback_tail` holds the suffix of upstream-confirmed,
/// already-applied events that remains revertible; `upstream_head` is the
/// last confirmed upstream position.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncState {
    /// Unconfirmed events, chained from `upstream_head`.
    pub pending: Vec<Event>,
    /// Revertible confirmed suffix, chained up to `upstream_head`.
    pub rollback_tail: Vec<Event>,
    /// Last upstream-confirmed position.
    pub upstream_head: EventSequenceNumber,
}

impl SyncState {
    /// Empty state rooted at [`EventSequenceNumber::ROOT`].
    pub fn new() -> Self {
        Self::default()
    }

    /// State rooted at an already-confirmed `upstream_head`.
    pub fn at_head(upstream_head: EventSequenceNumber) -> Self {
        Self {
            upstream_head,
            ..Self::default()
        }
    }

    /// Position new local events must chain onto.
    pub fn head(&self) -> EventSequenceNumber {
        self.pending
            .last()
            .map(|e| e.seq)
            .unwrap_or(self.upstream_head)
    }

    /// Validates the chaining invariant over both tails.
    pub fn check_chain(&self) -> Result<(), InvariantViolation> {
        if let Some(first) = self.rollback_tail.first() {
            let mut parent = first.parent_seq;
            validate_chain(&self.rollback_tail, &mut parent)?;
            if parent != self.upstream_head {
                return Err(InvariantViolation::BrokenChain {
                    expected: self.upstream_head,
                    found: parent,
                });
            }
        }
        let mut parent = self.upstream_head;
        validate_chain(&self.pending, &mut parent)
    }
}

/// Input to [`update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Events just created on this node.
    LocalPush {
        /// New local events, in creation order.
        new_events: Vec<Event>,
    },
    /// Upstream accepted some suffix, possibly including net-new events.
    UpstreamAdvance {
        /// Upstream events, in upstream order.
        new_events: Vec<Event>,
    },
    /// Upstream discarded everything after `rollback_until` and replaced it.
    UpstreamRebase {
        /// Last upstream position that survives.
        rollback_until: EventSequenceNumber,
        /// Replacement events chaining from `rollback_until`.
        new_events: Vec<Event>,
    },
    /// Housekeeping: forget the revertible prefix before `new_rollback_start`.
    TrimRollbackTail {
        /// First position that must stay revertible.
        new_rollback_start: EventSequenceNumber,
    },
}

/// Outcome of [`update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No applied or pending event was invalidated.
    Advance {
        /// Updated state.
        state: SyncState,
        /// Genuinely new events the caller must apply, in order.
        new_events: Vec<Event>,
    },
    /// Some applied events must be undone and replaced.
    Rebase {
        /// Updated state.
        state: SyncState,
        /// Events to undo, newest first (already in undo order).
        rollback: Vec<Event>,
        /// Replacement tail the caller must apply, in order: the new
        /// upstream-confirmed suffix followed by rewritten local events.
        new_events: Vec<Event>,
    },
    /// The input is stale; the caller must fail the triggering operation.
    Reject {
        /// Smallest sequence number a retried push may occupy.
        expected_min: EventSequenceNumber,
    },
}

/// Programmer-invariant violations; fatal for the owning node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// An event does not chain onto its expected parent.
    BrokenChain {
        /// Position the event was required to chain onto.
        expected: EventSequenceNumber,
        /// Position it actually chains onto.
        found: EventSequenceNumber,
    },
    /// Upstream input skips ahead of the confirmed head.
    AheadOfHead {
        /// Current confirmed head.
        head: EventSequenceNumber,
        /// Parent position the input claims.
        found: EventSequenceNumber,
    },
    /// Upstream contradicted an already-confirmed event without a rebase.
    ConfirmedHistoryContradicted {
        /// Position of the contradicted event.
        seq: EventSequenceNumber,
    },
    /// A divergent pending event was not authored by this node and can
    /// never be rewritten.
    NonLocalDivergence {
        /// Position of the non-local event.
        seq: EventSequenceNumber,
    },
    /// An upstream rebase reaches past the revertible tail.
    RollbackTooDeep {
        /// Requested rollback point.
        requested: EventSequenceNumber,
        /// Oldest revertible position.
        available: EventSequenceNumber,
    },
    /// The rebase callback produced an event that does not chain.
    BadRewrite {
        /// Parent the rewrite was issued for.
        parent: EventSequenceNumber,
    },
}

/// Caller-supplied hooks for [`update`].
///
/// The payload is opaque to the algorithm, so event equality and rewriting
/// are delegated to the owning component.
pub struct UpdateContext<'a> {
    /// True when the event was authored by this node and may be rewritten.
    pub is_local_event: &'a dyn Fn(&Event) -> bool,
    /// Identity-and-payload equality.
    pub is_equal_event: &'a dyn Fn(&Event, &Event) -> bool,
    /// Deterministically rewrites an event under a new parent, preserving
    /// payload and authorship and incrementing the rebase generation.
    pub rebase: &'a dyn Fn(&Event, EventSequenceNumber) -> Event,
}

/// Advances `state` by one input, yielding an advance, rebase, or reject.
///
/// Pure and side-effect free; the caller applies or undoes events against
/// storage according to the outcome.
pub fn update(
    state: SyncState,
    input: Update,
    ctx: &UpdateContext<'_>,
) -> Result<Outcome, InvariantViolation> {
    match input {
        Update::LocalPush { new_events } => local_push(state, new_events),
        Update::UpstreamAdvance { new_events } => upstream_advance(state, new_events, ctx),
        Update::UpstreamRebase {
            rollback_until,
            new_events,
        } => upstream_rebase(state, rollback_until, new_events, ctx),
        Update::TrimRollbackTail { new_rollback_start } => {
            Ok(trim_rollback_tail(state, new_rollback_start))
        }
    }
}

fn local_push(mut state: SyncState, new_events: Vec<Event>) -> Result<Outcome, InvariantViolation> {
    let Some(first) = new_events.first() else {
        return Ok(Outcome::Advance {
            state,
            new_events: Vec::new(),
        });
    };

    let head = state.head();
    if first.parent_seq < head {
        return Ok(Outcome::Reject {
            expected_min: head.next_local(),
        });
    }
    if first.parent_seq > head {
        return Err(InvariantViolation::BrokenChain {
            expected: head,
            found: first.parent_seq,
        });
    }

    let mut parent = head;
    validate_chain(&new_events, &mut parent)?;

    state.pending.extend(new_events.iter().cloned());
    Ok(Outcome::Advance { state, new_events })
}

fn upstream_advance(
    mut state: SyncState,
    new_events: Vec<Event>,
    ctx: &UpdateContext<'_>,
) -> Result<Outcome, InvariantViolation> {
    // Skip re-deliveries of already-confirmed history, verifying they match
    // what was applied where the revertible tail still remembers it.
    let mut j = 0;
    while j < new_events.len() && new_events[j].seq <= state.upstream_head {
        let incoming = &new_events[j];
        if let Some(known) = state.rollback_tail.iter().find(|e| e.seq == incoming.seq) {
            if !(ctx.is_equal_event)(known, incoming) {
                return Err(InvariantViolation::ConfirmedHistoryContradicted {
                    seq: incoming.seq,
                });
            }
        }
        j += 1;
    }

    if j == new_events.len() {
        return Ok(Outcome::Advance {
            state,
            new_events: Vec::new(),
        });
    }

    if new_events[j].parent_seq > state.upstream_head {
        return Err(InvariantViolation::AheadOfHead {
            head: state.upstream_head,
            found: new_events[j].parent_seq,
        });
    }
    if new_events[j].parent_seq < state.upstream_head {
        // A fresh event branching off below the confirmed head rewrites
        // history; only an upstream rebase may do that.
        return Err(InvariantViolation::ConfirmedHistoryContradicted {
            seq: new_events[j].seq,
        });
    }
    {
        let mut parent = new_events[j].parent_seq;
        validate_chain(&new_events[j..], &mut parent)?;
    }

    // Confirmation walk: equal heads move from pending to the revertible
    // tail; the first mismatch is the divergence point.
    let mut i = 0;
    while i < state.pending.len()
        && j < new_events.len()
        && (ctx.is_equal_event)(&state.pending[i], &new_events[j])
    {
        i += 1;
        j += 1;
    }

    if j == new_events.len() {
        // Pure confirmation of a pending prefix.
        let confirmed: Vec<Event> = state.pending.drain(..i).collect();
        if let Some(last) = confirmed.last() {
            state.upstream_head = last.seq;
        }
        state.rollback_tail.extend(confirmed);
        return Ok(Outcome::Advance {
            state,
            new_events: Vec::new(),
        });
    }

    if i == state.pending.len() {
        // Remaining upstream events are net new.
        let confirmed: Vec<Event> = state.pending.drain(..i).collect();
        state.rollback_tail.extend(confirmed);
        let fresh: Vec<Event> = new_events[j..].to_vec();
        state.upstream_head = fresh.last().map(|e| e.seq).unwrap_or(state.upstream_head);
        state.rollback_tail.extend(fresh.iter().cloned());
        return Ok(Outcome::Advance {
            state,
            new_events: fresh,
        });
    }

    // Divergence at pending[i] vs new_events[j].
    let confirmed: Vec<Event> = state.pending.drain(..i).collect();
    if let Some(last) = confirmed.last() {
        state.upstream_head = last.seq;
    }
    state.rollback_tail.extend(confirmed);

    let divergent: Vec<Event> = state.pending.drain(..).collect();
    let fresh: Vec<Event> = new_events[j..].to_vec();
    rebase_divergent(state, divergent, fresh, ctx)
}

fn upstream_rebase(
    mut state: SyncState,
    rollback_until: EventSequenceNumber,
    new_events: Vec<Event>,
    ctx: &UpdateContext<'_>,
) -> Result<Outcome, InvariantViolation> {
    if rollback_until > state.upstream_head {
        return Err(InvariantViolation::AheadOfHead {
            head: state.upstream_head,
            found: rollback_until,
        });
    }
    if rollback_until < state.upstream_head {
        let oldest = state
            .rollback_tail
            .first()
            .map(|e| e.parent_seq)
            .unwrap_or(state.upstream_head);
        if rollback_until < oldest {
            return Err(InvariantViolation::RollbackTooDeep {
                requested: rollback_until,
                available: oldest,
            });
        }
    }

    if let Some(first) = new_events.first() {
        if first.parent_seq != rollback_until {
            return Err(InvariantViolation::BrokenChain {
                expected: rollback_until,
                found: first.parent_seq,
            });
        }
        let mut parent = rollback_until;
        validate_chain(&new_events, &mut parent)?;
    }

    let keep_len = state
        .rollback_tail
        .iter()
        .take_while(|e| e.seq <= rollback_until)
        .count();
    let dropped_confirmed: Vec<Event> = state.rollback_tail.drain(keep_len..).collect();
    let divergent: Vec<Event> = state.pending.drain(..).collect();

    if dropped_confirmed.is_empty() && (divergent.is_empty() || new_events.is_empty()) {
        // Nothing previously applied is invalidated.
        state.pending = divergent;
        state.upstream_head = new_events.last().map(|e| e.seq).unwrap_or(rollback_until);
        state.rollback_tail.extend(new_events.iter().cloned());
        return Ok(Outcome::Advance { state, new_events });
    }

    state.upstream_head = new_events.last().map(|e| e.seq).unwrap_or(rollback_until);
    state.rollback_tail.extend(new_events.iter().cloned());

    let mut rollback: Vec<Event> = dropped_confirmed;
    rollback.extend(divergent.iter().cloned());
    rollback.reverse();

    let (state, rebased) = rewrite_locals(state, divergent, ctx)?;
    let mut emitted = new_events;
    emitted.extend(rebased);
    Ok(Outcome::Rebase {
        state,
        rollback,
        new_events: emitted,
    })
}

/// Shared tail of the advance-path divergence handling: `fresh` is the
/// upstream suffix not yet in the revertible tail, `divergent` the pending
/// events it invalidates.
fn rebase_divergent(
    mut state: SyncState,
    divergent: Vec<Event>,
    fresh: Vec<Event>,
    ctx: &UpdateContext<'_>,
) -> Result<Outcome, InvariantViolation> {
    let mut rollback: Vec<Event> = divergent.clone();
    rollback.reverse();

    state.upstream_head = fresh.last().map(|e| e.seq).unwrap_or(state.upstream_head);
    state.rollback_tail.extend(fresh.iter().cloned());

    let (state, rebased) = rewrite_locals(state, divergent, ctx)?;
    let mut emitted = fresh;
    emitted.extend(rebased);
    Ok(Outcome::Rebase {
        state,
        rollback,
        new_events: emitted,
    })
}

fn rewrite_locals(
    mut state: SyncState,
    divergent: Vec<Event>,
    ctx: &UpdateContext<'_>,
) -> Result<(SyncState, Vec<Event>), InvariantViolation> {
    let mut parent = state.upstream_head;
    let mut rebased = Vec::with_capacity(divergent.len());
    for event in &divergent {
        if !(ctx.is_local_event)(event) {
            return Err(InvariantViolation::NonLocalDivergence { seq: event.seq });
        }
        let rewritten = (ctx.rebase)(event, parent);
        if rewritten.parent_seq != parent || rewritten.seq <= parent {
            return Err(InvariantViolation::BadRewrite { parent });
        }
        parent = rewritten.seq;
        rebased.push(rewritten);
    }
    state.pending = rebased.clone();
    Ok((state, rebased))
}

fn trim_rollback_tail(mut state: SyncState, new_rollback_start: EventSequenceNumber) -> Outcome {
    state.rollback_tail.retain(|e| e.seq >= new_rollback_start);
    Outcome::Advance {
        state,
        new_events: Vec::new(),
    }
}

fn validate_chain(
    events: &[Event],
    parent: &mut EventSequenceNumber,
) -> Result<(), InvariantViolation> {
    for event in events {
        if event.parent_seq != *parent {
            return Err(InvariantViolation::BrokenChain {
                expected: *parent,
                found: event.parent_seq,
            });
        }
        if event.seq <= *parent {
            return Err(InvariantViolation::BrokenChain {
                expected: *parent,
                found: event.seq,
            });
        }
        *parent = event.seq;
    }
    Ok(())
}
