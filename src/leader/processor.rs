//! Single-writer leader actor plus its pull and push loops.
//!
//! All reconciliation state transitions happen on one task, so ordering needs
//! no lock: commands simply are not polled while an apply is in flight, pull
//! chunks are polled during a push-origin apply only (so they can interrupt
//! it), and never during a pull-origin apply. Storage work runs on
//! `spawn_blocking`; the log is moved into the blocking task and returned,
//! which makes the single-writer rule a matter of ownership.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Duration, sleep},
};

use crate::{
    backend::{Backend, PullError, PushError, UpstreamChunk},
    core::state::{self, Outcome, SyncState, Update, UpdateContext},
    event::{Event, SyncMetadata},
    materialize::MaterializerRegistry,
    store::{EventLog, StoreError, StoreResult},
    types::{ClientId, EventSequenceNumber},
};

use super::messages::{LeaderError, SessionMessage, StructuralDefect};

/// Leader tuning knobs.
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// Client identity of this device; pending events authored under it are
    /// the rebasable ones.
    pub client_id: ClientId,
    /// Maximum events per backend push call.
    pub push_batch_max: usize,
    /// Session fan-out channel capacity; lagging sessions drop oldest.
    pub session_queue_bound: usize,
    /// Pull chunk handoff capacity between the pull loop and the actor.
    pub pull_queue_bound: usize,
    /// Initial retry delay for transient backend errors.
    pub retry_base_ms: u64,
    /// Retry delay cap.
    pub retry_max_ms: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            client_id: 1,
            push_batch_max: 32,
            session_queue_bound: 1024,
            pull_queue_bound: 1,
            retry_base_ms: 50,
            retry_max_ms: 2_000,
        }
    }
}

/// Clonable handle to a spawned leader.
#[derive(Clone)]
pub struct LeaderHandle {
    cmd_tx: mpsc::Sender<Command>,
    sessions_tx: broadcast::Sender<SessionMessage>,
    ready_rx: watch::Receiver<bool>,
}

enum Command {
    Push {
        events: Vec<Event>,
        resp: oneshot::Sender<Result<(), LeaderError>>,
    },
    SyncState {
        resp: oneshot::Sender<SyncState>,
    },
    EventsSince {
        seq: EventSequenceNumber,
        resp: oneshot::Sender<Result<Vec<Event>, LeaderError>>,
    },
    TrimRollback {
        new_rollback_start: EventSequenceNumber,
        resp: oneshot::Sender<Result<(), LeaderError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), LeaderError>>,
    },
}

enum Internal {
    PushAcked {
        acks: Vec<(EventSequenceNumber, SyncMetadata)>,
    },
    PushFatal,
}

enum PushMsg {
    Enqueue { epoch: u64, events: Vec<Event> },
    Resume { epoch: u64 },
    Shutdown,
}

enum ApplyJob {
    Batch {
        events: Vec<Event>,
        new_head: Option<EventSequenceNumber>,
    },
    RollbackAndApply {
        rollback: Vec<EventSequenceNumber>,
        events: Vec<Event>,
        new_head: Option<EventSequenceNumber>,
    },
}

enum ApplyOrigin {
    Push {
        resp: oneshot::Sender<Result<(), LeaderError>>,
        events: Vec<Event>,
    },
    PullAdvance {
        new_events: Vec<Event>,
    },
    PullRebase {
        rollback_until: EventSequenceNumber,
        new_events: Vec<Event>,
    },
}

struct InFlightApply {
    join: JoinHandle<(Box<dyn EventLog>, StoreResult<()>)>,
    cancel: Arc<AtomicBool>,
    origin: ApplyOrigin,
    /// State to restore when the apply is interrupted and rolled back.
    prior: SyncState,
    /// State to adopt once the apply commits.
    next: SyncState,
}

/// Boots a leader from the durable log and spawns its actor and loops.
///
/// Reads the confirmed backend head, reconstructs `pending` as the events
/// after it, and starts in-sync. The returned handle is ready once
/// [`LeaderHandle::wait_ready`] resolves (immediately, boot reads are
/// synchronous).
pub fn spawn_leader<B: Backend>(
    log: Box<dyn EventLog>,
    registry: Arc<MaterializerRegistry>,
    backend: B,
    config: LeaderConfig,
) -> StoreResult<LeaderHandle> {
    let backend_head = log.backend_head()?;
    let pending = log.events_after(backend_head)?;
    let sync_state = SyncState {
        pending,
        rollback_tail: Vec::new(),
        upstream_head: backend_head,
    };

    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(256);
    let (sessions_tx, _) = broadcast::channel::<SessionMessage>(config.session_queue_bound.max(1));
    let (pull_tx, pull_rx) = mpsc::channel::<UpstreamChunk>(config.pull_queue_bound.max(1));
    let (push_tx, push_rx) = mpsc::unbounded_channel::<PushMsg>();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel::<Internal>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (ready_tx, ready_rx) = watch::channel(false);

    // Committed-but-unacknowledged events from before the restart still owe
    // the backend a push; acked rows and local-only events stay home.
    let unsent: Vec<Event> = sync_state
        .pending
        .iter()
        .filter(|e| e.sync_metadata.is_none() && !registry.is_local_only(&e.name))
        .cloned()
        .collect();
    if !unsent.is_empty() {
        let _ = push_tx.send(PushMsg::Enqueue {
            epoch: 0,
            events: unsent,
        });
    }

    tokio::spawn(pull_loop(
        backend.clone(),
        backend_head,
        pull_tx,
        shutdown_rx,
        config.retry_base_ms,
        config.retry_max_ms,
    ));
    tokio::spawn(push_loop(
        backend,
        push_rx,
        internal_tx,
        config.push_batch_max.max(1),
        config.retry_base_ms,
        config.retry_max_ms,
    ));

    let actor = Leader {
        cfg: config,
        registry,
        sync_state,
        log: Some(log),
        cmd_rx,
        requeue: VecDeque::new(),
        pull_rx,
        pull_closed: false,
        internal_rx,
        push_tx,
        sessions_tx: sessions_tx.clone(),
        push_epoch: 0,
        applying: None,
        shutdown_tx,
    };
    let _ = ready_tx.send(true);
    tokio::spawn(actor.run());

    Ok(LeaderHandle {
        cmd_tx,
        sessions_tx,
        ready_rx,
    })
}

impl LeaderHandle {
    /// Subscribes to the session fan-out stream.
    ///
    /// The channel is bounded; a session that falls behind observes
    /// [`broadcast::error::RecvError::Lagged`] and must catch up via
    /// [`LeaderHandle::events_since`]. Producers never block on slow
    /// sessions.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionMessage> {
        self.sessions_tx.subscribe()
    }

    /// Resolves once the leader has booted.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Commits locally created events.
    ///
    /// Completes only after the batch is durably materialized, so a
    /// returning call guarantees local visibility. A stale base yields
    /// [`LeaderError::LeaderAhead`]; refetch state and retry.
    pub async fn push(&self, events: Vec<Event>) -> Result<(), LeaderError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Push { events, resp: tx })
            .await
            .map_err(|_| LeaderError::ChannelClosed)?;
        rx.await.map_err(|_| LeaderError::ChannelClosed)?
    }

    /// Snapshot of the live reconciliation state, for observability.
    pub async fn current_sync_state(&self) -> Result<SyncState, LeaderError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SyncState { resp: tx })
            .await
            .map_err(|_| LeaderError::ChannelClosed)?;
        rx.await.map_err(|_| LeaderError::ChannelClosed)
    }

    /// Durable events strictly after `seq`; session catch-up read.
    pub async fn events_since(
        &self,
        seq: EventSequenceNumber,
    ) -> Result<Vec<Event>, LeaderError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::EventsSince { seq, resp: tx })
            .await
            .map_err(|_| LeaderError::ChannelClosed)?;
        rx.await.map_err(|_| LeaderError::ChannelClosed)?
    }

    /// Shrinks the revertible tail and prunes the stored changesets below
    /// `new_rollback_start`.
    pub async fn trim_rollback_tail(
        &self,
        new_rollback_start: EventSequenceNumber,
    ) -> Result<(), LeaderError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::TrimRollback {
                new_rollback_start,
                resp: tx,
            })
            .await
            .map_err(|_| LeaderError::ChannelClosed)?;
        rx.await.map_err(|_| LeaderError::ChannelClosed)?
    }

    /// Stops both loops, waits for any in-flight transaction to finish
    /// cleanly, and shuts the actor down.
    pub async fn shutdown(&self) -> Result<(), LeaderError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { resp: tx })
            .await
            .map_err(|_| LeaderError::ChannelClosed)?;
        rx.await.map_err(|_| LeaderError::ChannelClosed)?
    }
}

struct Leader {
    cfg: LeaderConfig,
    registry: Arc<MaterializerRegistry>,
    sync_state: SyncState,
    /// None exactly while an apply task owns the log.
    log: Option<Box<dyn EventLog>>,
    cmd_rx: mpsc::Receiver<Command>,
    /// Interrupted pushes re-enter here, ahead of channel commands.
    requeue: VecDeque<Command>,
    pull_rx: mpsc::Receiver<UpstreamChunk>,
    pull_closed: bool,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    push_tx: mpsc::UnboundedSender<PushMsg>,
    sessions_tx: broadcast::Sender<SessionMessage>,
    push_epoch: u64,
    applying: Option<InFlightApply>,
    shutdown_tx: watch::Sender<bool>,
}

impl Leader {
    async fn run(mut self) {
        loop {
            let stop = if self.applying.is_some() {
                self.step_applying().await
            } else {
                self.step_in_sync().await
            };
            if stop {
                break;
            }
        }

        // Leave no transaction dangling on the way out.
        if let Some(apply) = self.applying.take() {
            if let Ok((log, _)) = apply.join.await {
                self.log = Some(log);
            }
        }
        let _ = self.shutdown_tx.send(true);
        let _ = self.push_tx.send(PushMsg::Shutdown);
    }

    async fn step_in_sync(&mut self) -> bool {
        if let Some(cmd) = self.requeue.pop_front() {
            return self.handle_command(cmd);
        }
        tokio::select! {
            biased;
            Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
            chunk = self.pull_rx.recv(), if !self.pull_closed => match chunk {
                Some(chunk) => self.handle_chunk(chunk),
                None => {
                    self.pull_closed = true;
                    false
                }
            },
            cmd = self.cmd_rx.recv() => match cmd {
                Some(cmd) => self.handle_command(cmd),
                None => true,
            },
        }
    }

    async fn step_applying(&mut self) -> bool {
        let Some(mut apply) = self.applying.take() else {
            return false;
        };
        let interruptible =
            matches!(apply.origin, ApplyOrigin::Push { .. }) && !self.pull_closed;

        let mut pending_chunk: Option<Option<UpstreamChunk>> = None;
        let join_res = if interruptible {
            let mut joined = None;
            tokio::select! {
                biased;
                chunk = self.pull_rx.recv() => pending_chunk = Some(chunk),
                res = &mut apply.join => joined = Some(res),
            }
            joined
        } else {
            Some((&mut apply.join).await)
        };

        if let Some(joined) = join_res {
            return self.finish_apply(apply.origin, apply.next, joined);
        }

        // A pull chunk arrived mid push-apply: pulls win. Cancel, wait for
        // the rollback to land, restore the pre-push state, and requeue the
        // push behind the chunk.
        apply.cancel.store(true, Ordering::SeqCst);
        let joined = apply.join.await;
        let stop = match joined {
            Ok((log, res)) => {
                self.log = Some(log);
                match res {
                    Err(StoreError::Interrupted) => {
                        self.sync_state = apply.prior;
                        if let ApplyOrigin::Push { resp, events } = apply.origin {
                            self.requeue.push_front(Command::Push { events, resp });
                        }
                        false
                    }
                    // Commit raced the cancel and won; the apply stands.
                    Ok(()) => self.complete_success(apply.origin, apply.next),
                    Err(err) => self.fatal_apply(apply.origin, err),
                }
            }
            Err(err) => {
                log::error!("apply task failed to join: {err}");
                true
            }
        };
        if stop {
            return true;
        }

        match pending_chunk {
            Some(Some(chunk)) => self.handle_chunk(chunk),
            Some(None) => {
                self.pull_closed = true;
                false
            }
            None => false,
        }
    }

    fn finish_apply(
        &mut self,
        origin: ApplyOrigin,
        next: SyncState,
        joined: Result<(Box<dyn EventLog>, StoreResult<()>), tokio::task::JoinError>,
    ) -> bool {
        match joined {
            Ok((log, res)) => {
                self.log = Some(log);
                match res {
                    Ok(()) => self.complete_success(origin, next),
                    Err(err) => self.fatal_apply(origin, err),
                }
            }
            Err(err) => {
                log::error!("apply task failed to join: {err}");
                true
            }
        }
    }

    fn complete_success(&mut self, origin: ApplyOrigin, next: SyncState) -> bool {
        self.sync_state = next;
        match origin {
            ApplyOrigin::Push { resp, events } => {
                if !events.is_empty() {
                    let _ = self.sessions_tx.send(SessionMessage::UpstreamAdvance {
                        new_events: events.clone(),
                    });
                    self.enqueue_pushable(events);
                }
                let _ = resp.send(Ok(()));
            }
            ApplyOrigin::PullAdvance { new_events } => {
                if !new_events.is_empty() {
                    let _ = self
                        .sessions_tx
                        .send(SessionMessage::UpstreamAdvance { new_events });
                }
                let _ = self.push_tx.send(PushMsg::Resume {
                    epoch: self.push_epoch,
                });
            }
            ApplyOrigin::PullRebase {
                rollback_until,
                new_events,
            } => {
                let _ = self.sessions_tx.send(SessionMessage::UpstreamRebase {
                    rollback_until,
                    new_events,
                });
                // Rewritten local events still await backend confirmation.
                self.enqueue_pushable(self.sync_state.pending.clone());
                let _ = self.push_tx.send(PushMsg::Resume {
                    epoch: self.push_epoch,
                });
            }
        }
        false
    }

    fn fatal_apply(&mut self, origin: ApplyOrigin, err: StoreError) -> bool {
        log::error!("apply transaction failed, aborting leader: {err:?}");
        if let ApplyOrigin::Push { resp, .. } = origin {
            let _ = resp.send(Err(LeaderError::Fatal(StructuralDefect::ApplyFailed(err))));
        }
        true
    }

    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Push { events, resp } => self.handle_push(events, resp),
            Command::SyncState { resp } => {
                let _ = resp.send(self.sync_state.clone());
                false
            }
            Command::EventsSince { seq, resp } => {
                let out = match self.log.as_ref() {
                    Some(log) => log.events_after(seq).map_err(LeaderError::from),
                    None => Err(LeaderError::ChannelClosed),
                };
                let _ = resp.send(out);
                false
            }
            Command::TrimRollback {
                new_rollback_start,
                resp,
            } => {
                let outcome = self.run_update(Update::TrimRollbackTail { new_rollback_start });
                let out = match outcome {
                    Ok(Outcome::Advance { state, .. }) => {
                        self.sync_state = state;
                        match self.log.as_mut() {
                            Some(log) => log
                                .prune_changesets_before(new_rollback_start)
                                .map(|_| ())
                                .map_err(LeaderError::from),
                            None => Err(LeaderError::ChannelClosed),
                        }
                    }
                    _ => Err(LeaderError::Fatal(StructuralDefect::UnexpectedReject)),
                };
                let _ = resp.send(out);
                false
            }
            Command::Shutdown { resp } => {
                let _ = self.shutdown_tx.send(true);
                let _ = self.push_tx.send(PushMsg::Shutdown);
                let _ = resp.send(Ok(()));
                true
            }
        }
    }

    fn handle_push(
        &mut self,
        events: Vec<Event>,
        resp: oneshot::Sender<Result<(), LeaderError>>,
    ) -> bool {
        let outcome = self.run_update(Update::LocalPush { new_events: events });
        match outcome {
            Ok(Outcome::Advance { state, new_events }) => {
                if let Err(violation) = state.check_chain() {
                    let _ = resp.send(Err(LeaderError::Fatal(StructuralDefect::ChainInvariant(
                        violation,
                    ))));
                    return true;
                }
                self.spawn_apply(
                    ApplyJob::Batch {
                        events: new_events.clone(),
                        new_head: None,
                    },
                    ApplyOrigin::Push {
                        resp,
                        events: new_events,
                    },
                    state,
                );
                false
            }
            Ok(Outcome::Reject { expected_min }) => {
                let _ = resp.send(Err(LeaderError::LeaderAhead { expected_min }));
                false
            }
            Ok(Outcome::Rebase { .. }) => {
                // The leader is authoritative over its own pushes; a rebase
                // here means the log is inconsistent.
                log::error!("local push produced a rebase outcome, aborting leader");
                let _ = resp.send(Err(LeaderError::Fatal(StructuralDefect::LocalPushRebase)));
                true
            }
            Err(violation) => {
                // Malformed caller input, not leader state corruption.
                let _ = resp.send(Err(LeaderError::InvalidPush(violation)));
                false
            }
        }
    }

    fn handle_chunk(&mut self, chunk: UpstreamChunk) -> bool {
        let input = match chunk {
            UpstreamChunk::Advance { events, .. } => Update::UpstreamAdvance { new_events: events },
            UpstreamChunk::Rebase {
                rollback_until,
                events,
                ..
            } => Update::UpstreamRebase {
                rollback_until,
                new_events: events,
            },
        };
        let outcome = self.run_update(input);
        match outcome {
            Ok(Outcome::Advance { state, new_events }) => {
                if let Err(violation) = state.check_chain() {
                    return self.fatal_chain(violation);
                }
                let new_head = Some(state.upstream_head);
                self.spawn_apply(
                    ApplyJob::Batch {
                        events: new_events.clone(),
                        new_head,
                    },
                    ApplyOrigin::PullAdvance { new_events },
                    state,
                );
                false
            }
            Ok(Outcome::Rebase {
                state,
                rollback,
                new_events,
            }) => {
                if let Err(violation) = state.check_chain() {
                    return self.fatal_chain(violation);
                }
                // The queued pushes chain onto history that just went away.
                self.push_epoch += 1;
                let _ = self.push_tx.send(PushMsg::Enqueue {
                    epoch: self.push_epoch,
                    events: Vec::new(),
                });
                let rollback_until = rollback
                    .last()
                    .map(|e| e.parent_seq)
                    .unwrap_or(state.upstream_head);
                let rollback_seqs: Vec<EventSequenceNumber> =
                    rollback.iter().map(|e| e.seq).collect();
                let new_head = Some(state.upstream_head);
                self.spawn_apply(
                    ApplyJob::RollbackAndApply {
                        rollback: rollback_seqs,
                        events: new_events.clone(),
                        new_head,
                    },
                    ApplyOrigin::PullRebase {
                        rollback_until,
                        new_events,
                    },
                    state,
                );
                false
            }
            Ok(Outcome::Reject { .. }) => {
                log::error!("upstream input rejected, aborting leader");
                true
            }
            Err(violation) => self.fatal_chain(violation),
        }
    }

    fn handle_internal(&mut self, internal: Internal) -> bool {
        match internal {
            Internal::PushAcked { acks } => {
                // A rebase may have replaced the row at an acked position
                // with a different event; only stamp positions still held by
                // the exact events that were pushed.
                let state = &self.sync_state;
                let client_id = self.cfg.client_id;
                let acks: Vec<_> = acks
                    .into_iter()
                    .filter(|(seq, _)| {
                        state
                            .pending
                            .iter()
                            .chain(state.rollback_tail.iter())
                            .any(|e| {
                                e.seq == *seq
                                    && e.seq.rebase_generation == seq.rebase_generation
                                    && e.client_id == client_id
                            })
                    })
                    .collect();
                let Some(log) = self.log.as_mut() else {
                    return false;
                };
                if let Err(err) = log.attach_sync_metadata(&acks) {
                    log::error!("failed to stamp push acks: {err:?}");
                    return true;
                }
                false
            }
            Internal::PushFatal => {
                log::error!("backend id mismatch, aborting leader");
                true
            }
        }
    }

    fn spawn_apply(&mut self, job: ApplyJob, origin: ApplyOrigin, next: SyncState) {
        let Some(mut log) = self.log.take() else {
            // Single-writer invariant: never spawned while an apply holds
            // the log.
            log::error!("apply requested while the log is already borrowed");
            return;
        };
        let registry = Arc::clone(&self.registry);
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = Arc::clone(&cancel);
        let prior = self.sync_state.clone();
        let join = tokio::task::spawn_blocking(move || {
            let res = match job {
                ApplyJob::Batch { events, new_head } => {
                    log.apply_batch(&events, &registry, &cancel_flag, new_head)
                }
                ApplyJob::RollbackAndApply {
                    rollback,
                    events,
                    new_head,
                } => log.rollback_and_apply(&rollback, &events, &registry, new_head),
            };
            (log, res)
        });
        self.applying = Some(InFlightApply {
            join,
            cancel,
            origin,
            prior,
            next,
        });
    }

    fn enqueue_pushable(&self, events: Vec<Event>) {
        let pushable: Vec<Event> = events
            .into_iter()
            .filter(|e| !self.registry.is_local_only(&e.name))
            .collect();
        if !pushable.is_empty() {
            let _ = self.push_tx.send(PushMsg::Enqueue {
                epoch: self.push_epoch,
                events: pushable,
            });
        }
    }

    fn fatal_chain(&mut self, violation: state::InvariantViolation) -> bool {
        log::error!("chaining invariant violated, aborting leader: {violation:?}");
        true
    }

    fn run_update(&self, input: Update) -> Result<Outcome, state::InvariantViolation> {
        let client_id = self.cfg.client_id;
        let is_local = move |e: &Event| e.client_id == client_id;
        let is_equal = |a: &Event, b: &Event| a.same_as(b);
        let rebase = |e: &Event, parent: EventSequenceNumber| e.rebased_onto(parent);
        let ctx = UpdateContext {
            is_local_event: &is_local,
            is_equal_event: &is_equal,
            rebase: &rebase,
        };
        state::update(self.sync_state.clone(), input, &ctx)
    }
}

async fn pull_loop<B: Backend>(
    mut backend: B,
    mut cursor: EventSequenceNumber,
    tx: mpsc::Sender<UpstreamChunk>,
    mut shutdown: watch::Receiver<bool>,
    retry_base_ms: u64,
    retry_max_ms: u64,
) {
    let mut backoff = Duration::from_millis(retry_base_ms);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = backend.pull_next(cursor) => match res {
                Ok(chunk) => {
                    cursor = match &chunk {
                        UpstreamChunk::Advance { events, .. } => {
                            events.last().map(|e| e.seq).unwrap_or(cursor)
                        }
                        UpstreamChunk::Rebase {
                            rollback_until,
                            events,
                            ..
                        } => events.last().map(|e| e.seq).unwrap_or(*rollback_until),
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                    backoff = Duration::from_millis(retry_base_ms);
                }
                Err(PullError::Closed) => break,
                Err(PullError::Transport(err)) => {
                    log::warn!("pull transport error, retrying: {err}");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(retry_max_ms));
                }
            },
        }
    }
}

async fn push_loop<B: Backend>(
    mut backend: B,
    mut rx: mpsc::UnboundedReceiver<PushMsg>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    batch_max: usize,
    retry_base_ms: u64,
    retry_max_ms: u64,
) {
    let mut epoch = 0u64;
    let mut queue: VecDeque<Event> = VecDeque::new();
    let mut parked = false;
    let mut backoff = Duration::from_millis(retry_base_ms);

    loop {
        // Block for messages while idle or parked; otherwise only drain
        // whatever is already waiting before pushing the next batch.
        let msg = if parked || queue.is_empty() {
            match rx.recv().await {
                Some(msg) => Some(msg),
                None => break,
            }
        } else {
            match rx.try_recv() {
                Ok(msg) => Some(msg),
                Err(mpsc::error::TryRecvError::Empty) => None,
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        };

        if let Some(msg) = msg {
            match msg {
                PushMsg::Enqueue {
                    epoch: e,
                    events,
                } => {
                    if e > epoch {
                        // A rebase invalidated everything queued so far.
                        epoch = e;
                        queue.clear();
                    }
                    if e == epoch {
                        queue.extend(events);
                    }
                }
                PushMsg::Resume { epoch: e } => {
                    if e >= epoch && parked {
                        log::debug!("push loop resumed at epoch {e}");
                        parked = false;
                        backoff = Duration::from_millis(retry_base_ms);
                    }
                }
                PushMsg::Shutdown => break,
            }
            continue;
        }

        if parked || queue.is_empty() {
            continue;
        }

        backend.wait_connected().await;
        let batch: Vec<Event> = queue.iter().take(batch_max).cloned().collect();
        match backend.push(&batch).await {
            Ok(acks) => {
                if acks.len() != batch.len() {
                    // A short ack vector would leave rows silently
                    // unstamped; treat it like a transport fault and retry
                    // the whole batch.
                    log::warn!(
                        "backend returned {} acks for {} pushed events, retrying",
                        acks.len(),
                        batch.len()
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(retry_max_ms));
                    continue;
                }
                for _ in 0..batch.len() {
                    queue.pop_front();
                }
                let acks: Vec<(EventSequenceNumber, SyncMetadata)> =
                    batch.iter().map(|e| e.seq).zip(acks).collect();
                if internal_tx.send(Internal::PushAcked { acks }).is_err() {
                    break;
                }
                backoff = Duration::from_millis(retry_base_ms);
            }
            Err(PushError::ServerAhead) => {
                // Wait for the pull loop to advance past the conflict
                // instead of thrashing.
                log::debug!("push parked: server ahead at epoch {epoch}");
                parked = true;
            }
            Err(PushError::BackendIdMismatch) => {
                let _ = internal_tx.send(Internal::PushFatal);
                break;
            }
            Err(PushError::Transport(err)) => {
                log::warn!("push transport error, retrying: {err}");
                sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_millis(retry_max_ms));
            }
        }
    }
}
