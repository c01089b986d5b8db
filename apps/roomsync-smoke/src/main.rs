mod config;
mod logging;

use std::{process::ExitCode, sync::Arc};

use roomsync_core::{
    Session, SessionCommand, SessionError, SessionErrorCategory, SessionEvent,
    SessionLifecycleState,
};
use roomsync_http::{EventStream, HttpTransport, SessionRuntimeHandle, spawn_runtime};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::config::{Credentials, SmokeConfig};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(code = %err.code, message = %err.message, "smoke run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: SmokeConfig) -> Result<(), SessionError> {
    let transport = Arc::new(HttpTransport::new()?);
    let handle = spawn_runtime(transport, config.session(), config.runtime_config());
    let mut events = handle.subscribe();

    send(&handle, SessionCommand::NegotiateVersions).await?;
    let negotiated = wait_for(&mut events, |event| match event {
        SessionEvent::SnapshotUpdated(session) => Some(Ok(session)),
        SessionEvent::Error { code, message, .. } => Some(Err(SessionError::new(
            SessionErrorCategory::Network,
            code,
            message,
        ))),
        _ => None,
    })
    .await?;
    info!(versions = ?negotiated.context().versions, "versions negotiated");

    if matches!(config.credentials, Credentials::Password { .. }) {
        send(&handle, SessionCommand::Login).await?;
        wait_for(&mut events, |event| match event {
            SessionEvent::StateChanged {
                state: SessionLifecycleState::Ready,
            } => Some(Ok(())),
            SessionEvent::StateChanged {
                state: SessionLifecycleState::Unauthenticated,
            } => Some(Err(SessionError::new(
                SessionErrorCategory::Server,
                "login_failed",
                "homeserver rejected the credentials",
            ))),
            _ => None,
        })
        .await?;
        info!("logged in");
    }

    send(&handle, SessionCommand::StartSync).await?;
    let mut latest: Option<Arc<Session>> = None;
    let rounds = config.sync_rounds;
    wait_for(&mut events, |event| match event {
        SessionEvent::SnapshotUpdated(session) => {
            latest = Some(session);
            None
        }
        SessionEvent::SyncStatus(status) if status.rounds >= u64::from(rounds) => Some(Ok(())),
        SessionEvent::StateChanged {
            state: SessionLifecycleState::Ready | SessionLifecycleState::Fatal,
        } => Some(Err(SessionError::new(
            SessionErrorCategory::Network,
            "sync_stopped",
            "sync loop ended before the requested rounds",
        ))),
        _ => None,
    })
    .await?;
    send(&handle, SessionCommand::StopSync).await?;

    if let Some(session) = latest {
        log_summary(&session);
    }
    Ok(())
}

async fn send(handle: &SessionRuntimeHandle, command: SessionCommand) -> Result<(), SessionError> {
    debug!(?command, "sending command");
    handle.send(command).await
}

/// Drain events until `pick` returns an outcome. Error events are logged on
/// the way.
async fn wait_for<T, F>(events: &mut EventStream, mut pick: F) -> Result<T, SessionError>
where
    F: FnMut(SessionEvent) -> Option<Result<T, SessionError>>,
{
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged");
                continue;
            }
            Err(RecvError::Closed) => {
                return Err(SessionError::new(
                    SessionErrorCategory::Internal,
                    "runtime_closed",
                    "session runtime stopped",
                ));
            }
        };

        if let SessionEvent::Error {
            code,
            message,
            recoverable,
        } = &event
        {
            warn!(%code, %message, recoverable, "runtime reported an error");
        }
        if let Some(outcome) = pick(event) {
            return outcome;
        }
    }
}

fn log_summary(session: &Session) {
    info!(
        cursor = session.sync_cursor().unwrap_or("<none>"),
        rooms = session.rooms().len(),
        account_data = session.account_data().len(),
        "session summary"
    );
    for room in session.rooms() {
        let name = room
            .get_state_event("m.room.name", "")
            .and_then(|event| event.content.get("name"))
            .and_then(|name| name.as_str())
            .unwrap_or("<unnamed>");
        info!(
            room_id = room.room_id(),
            name,
            recent = room.most_recent_events().len(),
            has_gap = room.latest_gap().is_some(),
            "room summary"
        );
    }
}
