//! HTTP transport and the single-writer session runtime.
//!
//! The runtime task owns the canonical [`Session`] snapshot. Remote calls run
//! in their own tasks against a snapshot clone and hand their diffs back, so
//! folds happen one at a time in arrival order.

mod http;

use std::{future::Future, sync::Arc};

pub use http::HttpTransport;
use roomsync_core::{
    RuntimeConfig, Session, SessionCommand, SessionError, SessionErrorCategory, SessionEvent,
    SessionStateMachine, SyncStatus, Transport, UpdateDiff, api, normalize_error,
    ratelimited_with, retry_task_with,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;
const INTERNAL_BUFFER: usize = 64;

/// Receiver side of the runtime's event broadcast.
pub type EventStream = broadcast::Receiver<SessionEvent>;

/// Caller side of a running session runtime.
#[derive(Clone, Debug)]
pub struct SessionRuntimeHandle {
    commands: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRuntimeHandle {
    /// Queue one command; fails once the runtime task has stopped.
    pub async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands.send(command).await.map_err(|_| {
            SessionError::new(
                SessionErrorCategory::Internal,
                "runtime_closed",
                "session runtime is no longer accepting commands",
            )
        })
    }

    /// Events emitted after this call; earlier ones are not replayed.
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }
}

/// Start a runtime owning `session`; it stops once every handle is dropped.
pub fn spawn_runtime(
    transport: Arc<dyn Transport>,
    session: Session,
    config: RuntimeConfig,
) -> SessionRuntimeHandle {
    let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let runtime = SessionRuntime::new(events.clone(), command_rx, transport, session, config);
    tokio::spawn(async move {
        runtime.run().await;
    });

    SessionRuntimeHandle { commands, events }
}

/// Broadcast to whoever is subscribed; no subscribers is not an error.
fn emit(events: &broadcast::Sender<SessionEvent>, event: SessionEvent) {
    let _ = events.send(event);
}

/// Messages from worker tasks back to the owner.
enum RuntimeMessage {
    Fold {
        diff: UpdateDiff,
        /// Receives the snapshot the diff produced.
        reply: Option<oneshot::Sender<Arc<Session>>>,
    },
    LoginFinished(Result<UpdateDiff, SessionError>),
    SyncStopped {
        generation: u64,
        error: SessionError,
    },
}

#[derive(Debug)]
struct RunningSyncTask {
    generation: u64,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct SessionRuntime {
    events: broadcast::Sender<SessionEvent>,
    command_rx: mpsc::Receiver<SessionCommand>,
    internal_tx: mpsc::Sender<RuntimeMessage>,
    internal_rx: mpsc::Receiver<RuntimeMessage>,
    state_machine: SessionStateMachine,
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    config: RuntimeConfig,
    sync_task: Option<RunningSyncTask>,
    /// Bumped per started sync loop so reports from stopped loops are ignored.
    sync_generation: u64,
}

impl SessionRuntime {
    fn new(
        events: broadcast::Sender<SessionEvent>,
        command_rx: mpsc::Receiver<SessionCommand>,
        transport: Arc<dyn Transport>,
        session: Session,
        config: RuntimeConfig,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_BUFFER);
        Self {
            events,
            command_rx,
            internal_tx,
            internal_rx,
            state_machine: SessionStateMachine::for_session(&session),
            transport,
            session: Arc::new(session),
            config,
            sync_task: None,
            sync_generation: 0,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    if let Err(err) = self.handle_command(command) {
                        self.emit(normalize_error(err));
                    }
                }
                Some(message) = self.internal_rx.recv() => self.handle_message(message),
            }
        }

        self.stop_sync_task();
        debug!("session runtime stopped");
    }

    fn emit(&self, event: SessionEvent) {
        emit(&self.events, event);
    }

    fn handle_command(&mut self, command: SessionCommand) -> Result<(), SessionError> {
        let (candidate, transition_events) = self.validate_transition(&command)?;
        match command {
            SessionCommand::NegotiateVersions => {
                self.spawn_call(|transport, session| async move {
                    api::negotiate_versions(transport.as_ref(), &session).await
                });
            }
            SessionCommand::Login => self.start_login(),
            SessionCommand::StartSync => self.start_sync_task(),
            SessionCommand::StopSync => self.stop_sync_task(),
            SessionCommand::FetchEvent { room_id, event_id } => {
                self.spawn_call(move |transport, session| {
                    let (room_id, event_id) = (room_id.clone(), event_id.clone());
                    async move {
                        api::fetch_event(transport.as_ref(), &session, &room_id, &event_id).await
                    }
                });
            }
            SessionCommand::Backfill { room_id } => {
                let limit = self.config.backfill_limit;
                self.spawn_call(move |transport, session| {
                    let room_id = room_id.clone();
                    async move { api::backfill(transport.as_ref(), &session, &room_id, limit).await }
                });
            }
        }
        self.commit_transition(candidate, transition_events);
        Ok(())
    }

    fn handle_message(&mut self, message: RuntimeMessage) {
        match message {
            RuntimeMessage::Fold { diff, reply } => {
                let snapshot = self.fold(diff);
                if let Some(reply) = reply {
                    let _ = reply.send(snapshot);
                }
            }
            RuntimeMessage::LoginFinished(Ok(diff)) => {
                self.fold(diff);
                self.finish_auth(true);
            }
            RuntimeMessage::LoginFinished(Err(err)) => {
                self.emit(normalize_error(err));
                self.finish_auth(false);
            }
            RuntimeMessage::SyncStopped { generation, error } => {
                self.sync_stopped(generation, error)
            }
        }
    }

    fn sync_stopped(&mut self, generation: u64, err: SessionError) {
        if self.sync_task.as_ref().map(|running| running.generation) != Some(generation) {
            debug!(generation, code = %err.code, "ignoring report from a replaced sync loop");
            return;
        }
        self.sync_task = None;

        let unrecoverable = matches!(
            err.category,
            SessionErrorCategory::Config
                | SessionErrorCategory::UnsupportedVersion
                | SessionErrorCategory::Internal
        );
        warn!(code = %err.code, unrecoverable, "sync loop ended");
        self.emit(normalize_error(err));
        if unrecoverable {
            let event = self.state_machine.on_fatal();
            self.emit(event);
        } else if let Some(event) = self.state_machine.on_sync_stopped() {
            self.emit(event);
        }
    }

    fn fold(&mut self, diff: UpdateDiff) -> Arc<Session> {
        let kind = diff.kind();
        Arc::make_mut(&mut self.session).update_in_place(diff);
        let next = Arc::clone(&self.session);
        debug!(kind, rooms = next.rooms().len(), "snapshot updated");
        self.emit(SessionEvent::SnapshotUpdated(Arc::clone(&next)));
        next
    }

    /// Run one resilient call on the current snapshot and fold its result.
    fn spawn_call<F, Fut>(&self, call: F)
    where
        F: Fn(Arc<dyn Transport>, Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UpdateDiff, SessionError>> + Send + 'static,
    {
        let transport = Arc::clone(&self.transport);
        let session = Arc::clone(&self.session);
        let config = self.config;
        let internal_tx = self.internal_tx.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result =
                resilient(&config, || call(Arc::clone(&transport), Arc::clone(&session))).await;
            match result {
                Ok(diff) => {
                    let _ = internal_tx.send(RuntimeMessage::Fold { diff, reply: None }).await;
                }
                Err(err) => emit(&events, normalize_error(err)),
            }
        });
    }

    fn start_login(&self) {
        let transport = Arc::clone(&self.transport);
        let session = Arc::clone(&self.session);
        let config = self.config;
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = resilient(&config, || api::login(transport.as_ref(), &session)).await;
            let _ = internal_tx.send(RuntimeMessage::LoginFinished(result)).await;
        });
    }

    fn finish_auth(&mut self, success: bool) {
        match self.state_machine.on_auth_result(success) {
            Ok(event) => self.emit(event),
            Err(err) => self.emit(normalize_error(err)),
        }
    }

    fn start_sync_task(&mut self) {
        self.sync_generation += 1;
        let generation = self.sync_generation;
        let stop = CancellationToken::new();
        let task = tokio::spawn(run_sync_loop(
            SyncLoop {
                generation,
                transport: Arc::clone(&self.transport),
                config: self.config,
                internal_tx: self.internal_tx.clone(),
                events: self.events.clone(),
            },
            Arc::clone(&self.session),
            stop.child_token(),
        ));
        self.sync_task = Some(RunningSyncTask {
            generation,
            stop,
            task,
        });
    }

    fn stop_sync_task(&mut self) {
        if let Some(running) = self.sync_task.take() {
            running.stop.cancel();
            debug!(
                generation = running.generation,
                finished = running.task.is_finished(),
                "sync loop cancelled"
            );
        }
    }

    fn validate_transition(
        &self,
        command: &SessionCommand,
    ) -> Result<(SessionStateMachine, Vec<SessionEvent>), SessionError> {
        let mut candidate = self.state_machine.clone();
        let events = candidate.apply(command)?;
        Ok((candidate, events))
    }

    fn commit_transition(&mut self, candidate: SessionStateMachine, events: Vec<SessionEvent>) {
        self.state_machine = candidate;
        for event in events {
            self.emit(event);
        }
    }
}

/// Bounded retry around rate-limit retry, so backoff for rate limits never
/// spends the bounded budget.
async fn resilient<F, Fut>(config: &RuntimeConfig, op: F) -> Result<UpdateDiff, SessionError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<UpdateDiff, SessionError>>,
{
    let op = &op;
    let limits = &config.rate_limit_policy;
    retry_task_with(&config.retry_policy, config.retry_limit, move || {
        ratelimited_with(limits, op)
    })
    .await
}

/// What one sync loop needs besides its starting snapshot.
struct SyncLoop {
    generation: u64,
    transport: Arc<dyn Transport>,
    config: RuntimeConfig,
    internal_tx: mpsc::Sender<RuntimeMessage>,
    events: broadcast::Sender<SessionEvent>,
}

async fn run_sync_loop(ctx: SyncLoop, mut session: Arc<Session>, stop: CancellationToken) {
    let mut rounds: u64 = 0;
    emit(
        &ctx.events,
        SessionEvent::SyncStatus(SyncStatus {
            running: true,
            rounds,
        }),
    );
    info!(
        generation = ctx.generation,
        since = session.sync_cursor().unwrap_or("<initial>"),
        "sync loop started"
    );

    loop {
        let attempt = {
            let transport: &dyn Transport = ctx.transport.as_ref();
            let snapshot: &Session = &session;
            resilient(&ctx.config, move || api::sync(transport, snapshot))
        };
        let result = tokio::select! {
            _ = stop.cancelled() => break,
            result = attempt => result,
        };

        let diff = match result {
            Ok(diff) => diff,
            Err(error) => {
                let stopped = RuntimeMessage::SyncStopped {
                    generation: ctx.generation,
                    error,
                };
                let _ = ctx.internal_tx.send(stopped).await;
                break;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let fold = RuntimeMessage::Fold {
            diff,
            reply: Some(reply_tx),
        };
        if ctx.internal_tx.send(fold).await.is_err() {
            break;
        }
        session = tokio::select! {
            _ = stop.cancelled() => break,
            reply = reply_rx => match reply {
                Ok(next) => next,
                Err(_) => break,
            },
        };

        rounds += 1;
        emit(
            &ctx.events,
            SessionEvent::SyncStatus(SyncStatus {
                running: true,
                rounds,
            }),
        );
    }

    emit(
        &ctx.events,
        SessionEvent::SyncStatus(SyncStatus {
            running: false,
            rounds,
        }),
    );
    debug!(generation = ctx.generation, rounds, "sync loop finished");
}
