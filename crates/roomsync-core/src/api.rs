//! Remote calls. Each resolves its wire revision from the negotiated version
//! list, performs one request and turns the answer into an [`UpdateDiff`].
//!
//! Calls never touch the session they read from; fold the returned diff.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, trace};
use url::Url;
use uuid::Uuid;

use crate::{
    diff::UpdateDiff,
    error::{SessionError, SessionErrorCategory},
    normalization::{normalize_blind_event, normalize_room_event},
    session::Session,
    timeline::{Timeline, TimelineChunk},
    transport::{ApiRequest, Method, Transport, decode_response},
    types::Membership,
    version::Endpoint,
    wire::{
        EventIdResponse, JoinResponse, LoginResponse, MessagesResponse, RawEvent,
        RefreshResponse, SyncResponse, VersionsResponse,
    },
};

/// Long-poll hint sent with every sync request.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest page the homeserver is asked for during backfill.
const BACKFILL_SERVER_CAP: u16 = 100;

pub async fn negotiate_versions<T: Transport + ?Sized>(
    transport: &T,
    session: &Session,
) -> Result<UpdateDiff, SessionError> {
    let url = build_url(
        &session.context().base_url,
        &["_matrix", "client", "versions"],
        &[],
    )?;
    let response: VersionsResponse = call(transport, Method::Get, url, None, None).await?;
    debug!(versions = ?response.versions, "homeserver versions negotiated");
    Ok(UpdateDiff::VersionsUpdate {
        versions: response.versions,
    })
}

/// Password login with the session's pending credentials.
pub async fn login<T: Transport + ?Sized>(
    transport: &T,
    session: &Session,
) -> Result<UpdateDiff, SessionError> {
    let (username, password) = session.context().password_credentials()?;
    let url = endpoint_url(session, Endpoint::Login, &["login"], &[])?;
    let body = json!({
        "type": "m.login.password",
        "identifier": { "type": "m.id.user", "user": username },
        "password": password,
        "refresh_token": true,
    });
    let response: LoginResponse = call(transport, Method::Post, url, None, Some(body)).await?;
    Ok(UpdateDiff::LoginResult {
        access_token: response.access_token,
        user_id: response.user_id,
        device_id: response.device_id,
        refresh_token: response.refresh_token,
    })
}

pub async fn refresh_token<T: Transport + ?Sized>(
    transport: &T,
    session: &Session,
) -> Result<UpdateDiff, SessionError> {
    let refresh_token = session.context().refresh_token()?;
    let url = endpoint_url(session, Endpoint::Refresh, &["refresh"], &[])?;
    let body = json!({ "refresh_token": refresh_token });
    let response: RefreshResponse = call(transport, Method::Post, url, None, Some(body)).await?;
    Ok(UpdateDiff::TokenUpdate {
        access_token: response.access_token,
        refresh_token: response.refresh_token,
    })
}

/// Incremental sync from the session's cursor, or a full one without it.
pub async fn sync<T: Transport + ?Sized>(
    transport: &T,
    session: &Session,
) -> Result<UpdateDiff, SessionError> {
    let since = session.sync_cursor().map(ToOwned::to_owned);
    let timeout = SYNC_TIMEOUT.as_millis().to_string();
    let mut query = vec![("timeout", timeout.as_str())];
    if let Some(since) = &since {
        query.push(("since", since.as_str()));
    }
    let url = endpoint_url(session, Endpoint::Sync, &["sync"], &query)?;
    let token = session.context().access_token()?;

    let response: SyncResponse = call(transport, Method::Get, url, Some(token), None).await?;
    debug!(
        since = since.as_deref().unwrap_or("<initial>"),
        next_batch = %response.next_batch,
        joined = response.rooms.join.len(),
        "sync response received"
    );
    Ok(UpdateDiff::SyncUpdate { since, response })
}

pub async fn fetch_event<T: Transport + ?Sized>(
    transport: &T,
    session: &Session,
    room_id: &str,
    event_id: &str,
) -> Result<UpdateDiff, SessionError> {
    let url = endpoint_url(
        session,
        Endpoint::FetchEvent,
        &["rooms", room_id, "event", event_id],
        &[],
    )?;
    let token = session.context().access_token()?;
    let raw: RawEvent = call(transport, Method::Get, url, Some(token), None).await?;
    Ok(UpdateDiff::GetEventResult {
        room_id: room_id.to_owned(),
        event: normalize_blind_event(raw),
    })
}

/// Page backwards into the newest gap of `room_id`, or past the oldest
/// known event when the timeline has no gap.
pub async fn backfill<T: Transport + ?Sized>(
    transport: &T,
    session: &Session,
    room_id: &str,
    limit: u16,
) -> Result<UpdateDiff, SessionError> {
    let room = session.room(room_id);
    let (from, to) = match room.latest_gap() {
        Some(gap) => (gap.next_batch.clone(), Some(gap.prev_batch.clone())),
        None => {
            let from = room
                .timeline()
                .backward_cursor()
                .ok_or_else(|| SessionError::missing_context("backfill_token"))?;
            (from.to_owned(), None)
        }
    };

    let limit = Timeline::bounded_paginate_limit(limit, BACKFILL_SERVER_CAP).to_string();
    let mut query = vec![("dir", "b"), ("from", from.as_str()), ("limit", limit.as_str())];
    if let Some(to) = &to {
        query.push(("to", to.as_str()));
    }
    let url = endpoint_url(session, Endpoint::Backfill, &["rooms", room_id, "messages"], &query)?;
    let token = session.context().access_token()?;

    let response: MessagesResponse = call(transport, Method::Get, url, Some(token), None).await?;
    let state_delta = (!response.state.is_empty()).then(|| {
        response
            .state
            .into_iter()
            .map(|raw| normalize_room_event(room_id, raw))
            .collect()
    });
    let chunk = TimelineChunk {
        events: response
            .chunk
            .into_iter()
            .rev()
            .map(|raw| normalize_room_event(room_id, raw))
            .collect(),
        prev_batch: response.end,
        next_batch: Some(response.start),
        state_delta,
    };
    debug!(%room_id, events = chunk.events.len(), "backfill page received");
    Ok(UpdateDiff::BackfillResult {
        room_id: room_id.to_owned(),
        chunk,
    })
}

/// Send an `m.text` message under a fresh transaction id.
pub async fn send_message<T: Transport + ?Sized>(
    transport: &T,
    session: &Session,
    room_id: &str,
    body: &str,
) -> Result<UpdateDiff, SessionError> {
    let txn_id = new_txn_id();
    let url = endpoint_url(
        session,
        Endpoint::SendMessage,
        &["rooms", room_id, "send", "m.room.message", &txn_id],
        &[],
    )?;
    let token = session.context().access_token()?;
    let content = json!({ "msgtype": "m.text", "body": body });
    let response: EventIdResponse =
        call(transport, Method::Put, url, Some(token), Some(content)).await?;
    Ok(UpdateDiff::MessageSent {
        room_id: room_id.to_owned(),
        event_id: response.event_id,
        txn_id,
    })
}

pub async fn redact_event<T: Transport + ?Sized>(
    transport: &T,
    session: &Session,
    room_id: &str,
    event_id: &str,
    reason: Option<&str>,
) -> Result<UpdateDiff, SessionError> {
    let txn_id = new_txn_id();
    let url = endpoint_url(
        session,
        Endpoint::Redact,
        &["rooms", room_id, "redact", event_id, &txn_id],
        &[],
    )?;
    let token = session.context().access_token()?;
    let body = match reason {
        Some(reason) => json!({ "reason": reason }),
        None => json!({}),
    };
    let response: EventIdResponse =
        call(transport, Method::Put, url, Some(token), Some(body)).await?;
    Ok(UpdateDiff::RedactionAck {
        room_id: room_id.to_owned(),
        event_id: response.event_id,
    })
}

pub async fn send_state_event<T: Transport + ?Sized>(
    transport: &T,
    session: &Session,
    room_id: &str,
    event_type: &str,
    state_key: &str,
    content: Value,
) -> Result<UpdateDiff, SessionError> {
    let url = endpoint_url(
        session,
        Endpoint::SendState,
        &["rooms", room_id, "state", event_type, state_key],
        &[],
    )?;
    let token = session.context().access_token()?;
    let response: EventIdResponse =
        call(transport, Method::Put, url, Some(token), Some(content)).await?;
    Ok(UpdateDiff::StateChangeAck {
        room_id: room_id.to_owned(),
        event_id: response.event_id,
    })
}

pub async fn invite_user<T: Transport + ?Sized>(
    transport: &T,
    session: &Session,
    room_id: &str,
    user_id: &str,
) -> Result<UpdateDiff, SessionError> {
    let url = endpoint_url(session, Endpoint::Invite, &["rooms", room_id, "invite"], &[])?;
    let token = session.context().access_token()?;
    let _: Value = call(
        transport,
        Method::Post,
        url,
        Some(token),
        Some(json!({ "user_id": user_id })),
    )
    .await?;
    Ok(UpdateDiff::InviteAck {
        room_id: room_id.to_owned(),
        user_id: user_id.to_owned(),
    })
}

/// Join by room id or alias; the ack carries the resolved room id.
pub async fn join_room<T: Transport + ?Sized>(
    transport: &T,
    session: &Session,
    room_id_or_alias: &str,
) -> Result<UpdateDiff, SessionError> {
    let url = endpoint_url(session, Endpoint::Join, &["join", room_id_or_alias], &[])?;
    let token = session.context().access_token()?;
    let response: JoinResponse =
        call(transport, Method::Post, url, Some(token), Some(json!({}))).await?;
    Ok(UpdateDiff::MembershipAck {
        room_id: response.room_id,
        membership: Membership::Join,
    })
}

pub async fn leave_room<T: Transport + ?Sized>(
    transport: &T,
    session: &Session,
    room_id: &str,
) -> Result<UpdateDiff, SessionError> {
    let url = endpoint_url(session, Endpoint::Leave, &["rooms", room_id, "leave"], &[])?;
    let token = session.context().access_token()?;
    let _: Value = call(transport, Method::Post, url, Some(token), Some(json!({}))).await?;
    Ok(UpdateDiff::MembershipAck {
        room_id: room_id.to_owned(),
        membership: Membership::Leave,
    })
}

async fn call<R, T>(
    transport: &T,
    method: Method,
    url: Url,
    access_token: Option<&str>,
    body: Option<Value>,
) -> Result<R, SessionError>
where
    R: DeserializeOwned,
    T: Transport + ?Sized,
{
    trace!(?method, path = url.path(), "homeserver request");
    let response = transport
        .execute(ApiRequest {
            method,
            url,
            access_token: access_token.map(ToOwned::to_owned),
            body,
        })
        .await?;
    decode_response(&response)
}

/// Versioned client URL; fails before any I/O when no revision fits.
fn endpoint_url(
    session: &Session,
    endpoint: Endpoint,
    segments: &[&str],
    query: &[(&str, &str)],
) -> Result<Url, SessionError> {
    let revision = endpoint.resolve(&session.context().versions)?;
    let prefix = revision.path_prefix().split('/').filter(|s| !s.is_empty());
    let path: Vec<&str> = prefix.chain(segments.iter().copied()).collect();
    build_url(&session.context().base_url, &path, query)
}

fn build_url(base_url: &str, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, SessionError> {
    let mut url = Url::parse(base_url).map_err(|err| invalid_url(base_url, &err.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| invalid_url(base_url, "cannot be a base"))?
        .pop_if_empty()
        .extend(segments);
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

fn invalid_url(base_url: &str, reason: &str) -> SessionError {
    SessionError::new(
        SessionErrorCategory::Config,
        "invalid_url",
        format!("homeserver url '{base_url}' is unusable: {reason}"),
    )
}

fn new_txn_id() -> String {
    Uuid::new_v4().simple().to_string()
}
