use std::{borrow::Cow, collections::BTreeMap};

use serde_json::Value;
use tracing::{debug, trace};

use crate::{
    diff::UpdateDiff,
    error::SessionError,
    normalization::contextualize,
    room::Room,
    timeline::TimelineUpdate,
    wire::SyncResponse,
};

/// How the session authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    AccessToken(String),
    /// Pending until the first successful login call.
    Password { username: String, password: String },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccessToken(_) => f.write_str("AccessToken(<redacted>)"),
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Connection context shared by every remote call of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    /// Homeserver base URL, for example `https://matrix.example.org`.
    pub base_url: String,
    pub auth: Auth,
    /// Versions advertised by the homeserver, in its order.
    pub versions: Vec<String>,
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub refresh_token: Option<String>,
}

impl SessionContext {
    fn new(base_url: String, auth: Auth) -> Self {
        Self {
            base_url,
            auth,
            versions: Vec::new(),
            user_id: None,
            device_id: None,
            refresh_token: None,
        }
    }

    pub fn access_token(&self) -> Result<&str, SessionError> {
        match &self.auth {
            Auth::AccessToken(token) => Ok(token),
            Auth::Password { .. } => Err(SessionError::missing_context("access_token")),
        }
    }

    pub fn password_credentials(&self) -> Result<(&str, &str), SessionError> {
        match &self.auth {
            Auth::Password { username, password } => Ok((username, password)),
            Auth::AccessToken(_) => Err(SessionError::missing_context("credentials")),
        }
    }

    pub fn refresh_token(&self) -> Result<&str, SessionError> {
        self.refresh_token
            .as_deref()
            .ok_or_else(|| SessionError::missing_context("refresh_token"))
    }
}

/// Immutable snapshot of everything known about the account.
///
/// The only way to change a session is to fold an [`UpdateDiff`] into it,
/// which yields a new snapshot. Folding two diffs into the same ancestor and
/// keeping only one result loses the other, so one owner should fold in
/// arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    rooms: BTreeMap<String, Room>,
    sync_cursor: Option<String>,
    account_data: BTreeMap<String, Value>,
    context: SessionContext,
}

impl Session {
    /// Session for an already issued access token.
    pub fn with_access_token(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self::with_auth(base_url.into(), Auth::AccessToken(access_token.into()))
    }

    /// Session that logs in with a password before its first authenticated call.
    pub fn with_password(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::with_auth(
            base_url.into(),
            Auth::Password {
                username: username.into(),
                password: password.into(),
            },
        )
    }

    fn with_auth(base_url: String, auth: Auth) -> Self {
        Self {
            rooms: BTreeMap::new(),
            sync_cursor: None,
            account_data: BTreeMap::new(),
            context: SessionContext::new(base_url, auth),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn sync_cursor(&self) -> Option<&str> {
        self.sync_cursor.as_deref()
    }

    pub fn account_data(&self) -> &BTreeMap<String, Value> {
        &self.account_data
    }

    pub fn get_room_by_id(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    /// Known room, or a fresh empty one for an id never seen before.
    pub fn room(&self, room_id: &str) -> Cow<'_, Room> {
        match self.rooms.get(room_id) {
            Some(room) => Cow::Borrowed(room),
            None => Cow::Owned(Room::new(room_id)),
        }
    }

    /// Known rooms ordered by room id.
    pub fn rooms(&self) -> Vec<&Room> {
        self.rooms.values().collect()
    }

    /// Fold `diff` into a copy of this snapshot.
    pub fn apply_update(&self, diff: UpdateDiff) -> Session {
        self.clone().update_with(diff)
    }

    /// Fold `diff`, consuming this snapshot.
    pub fn update_with(mut self, diff: UpdateDiff) -> Session {
        self.fold(diff);
        self
    }

    /// Fold `diff` into a snapshot owned by the caller.
    ///
    /// Meant for `Arc::make_mut`, which clones only while the snapshot is
    /// still shared.
    pub fn update_in_place(&mut self, diff: UpdateDiff) {
        self.fold(diff);
    }

    fn fold(&mut self, diff: UpdateDiff) {
        trace!(kind = diff.kind(), "folding update diff");
        match diff {
            UpdateDiff::Batch(diffs) => {
                for diff in diffs {
                    self.fold(diff);
                }
            }
            UpdateDiff::SyncUpdate { since, response } => self.fold_sync(since, response),
            UpdateDiff::GetEventResult { room_id, event } => {
                let Some(room) = self.rooms.get_mut(&room_id) else {
                    debug!(%room_id, event_id = %event.event_id, "dropping event for unknown room");
                    return;
                };
                room.add_events(TimelineUpdate {
                    events: vec![contextualize(event, &room_id)],
                    ..Default::default()
                });
            }
            UpdateDiff::BackfillResult { room_id, chunk } => {
                self.rooms
                    .entry(room_id.clone())
                    .or_insert_with(|| Room::new(room_id))
                    .insert_events(chunk);
            }
            UpdateDiff::LoginResult {
                access_token,
                user_id,
                device_id,
                refresh_token,
            } => {
                self.context.auth = Auth::AccessToken(access_token);
                self.context.user_id = Some(user_id);
                self.context.device_id = device_id;
                self.context.refresh_token = refresh_token;
            }
            UpdateDiff::TokenUpdate {
                access_token,
                refresh_token,
            } => {
                self.context.auth = Auth::AccessToken(access_token);
                if refresh_token.is_some() {
                    self.context.refresh_token = refresh_token;
                }
            }
            UpdateDiff::VersionsUpdate { versions } => self.context.versions = versions,
            UpdateDiff::InviteAck { .. }
            | UpdateDiff::MembershipAck { .. }
            | UpdateDiff::MessageSent { .. }
            | UpdateDiff::RedactionAck { .. }
            | UpdateDiff::StateChangeAck { .. } => {}
        }
    }

    fn fold_sync(&mut self, since: Option<String>, response: SyncResponse) {
        let SyncResponse {
            next_batch,
            rooms,
            account_data,
        } = response;

        for (room_id, joined) in rooms.join {
            match self.rooms.get_mut(&room_id) {
                Some(room) => room.apply_joined(joined, since.as_deref(), &next_batch),
                None => {
                    let room = Room::from_joined(room_id.clone(), joined, &next_batch);
                    self.rooms.insert(room_id, room);
                }
            }
        }
        self.account_data.extend(
            account_data
                .events
                .into_iter()
                .map(|data| (data.event_type, data.content)),
        );

        debug!(
            since = since.as_deref().unwrap_or("<initial>"),
            next_batch = %next_batch,
            rooms = self.rooms.len(),
            "folded sync update"
        );
        self.sync_cursor = Some(next_batch);
    }
}
