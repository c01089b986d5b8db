use std::sync::LazyLock;

use crate::error::SessionError;

/// Wire revision of the client-server API an endpoint is spoken in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiRevision {
    R0,
    V3,
}

impl ApiRevision {
    pub fn path_prefix(self) -> &'static str {
        match self {
            Self::R0 => "/_matrix/client/r0",
            Self::V3 => "/_matrix/client/v3",
        }
    }
}

/// Remote operations that carry their own version table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Login,
    Refresh,
    Sync,
    FetchEvent,
    Backfill,
    SendMessage,
    Redact,
    SendState,
    Invite,
    Join,
    Leave,
}

impl Endpoint {
    pub fn name(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Refresh => "refresh",
            Self::Sync => "sync",
            Self::FetchEvent => "fetch_event",
            Self::Backfill => "backfill",
            Self::SendMessage => "send_message",
            Self::Redact => "redact",
            Self::SendState => "send_state",
            Self::Invite => "invite",
            Self::Join => "join",
            Self::Leave => "leave",
        }
    }

    /// Static table this endpoint resolves through.
    pub fn table(self) -> &'static VersionTable<ApiRevision> {
        match self {
            Self::Refresh => &REFRESH_TABLE,
            _ => &CLIENT_TABLE,
        }
    }

    /// Pick the revision to speak against a server advertising `versions`.
    pub fn resolve(self, versions: &[String]) -> Result<ApiRevision, SessionError> {
        self.table().resolve_for(self.name(), versions)
    }
}

/// Ascending list of protocol tags, each bound to an implementation.
///
/// Consecutive tags may share an implementation when nothing changed on the
/// wire between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTable<I> {
    entries: Vec<(&'static str, I)>,
}

impl<I: Copy> VersionTable<I> {
    /// `entries` must be ordered oldest tag first.
    pub fn new(entries: impl IntoIterator<Item = (&'static str, I)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(tag, _)| *tag)
    }

    /// Implementation bound to the highest tag both sides know.
    pub fn resolve(&self, server_versions: &[String]) -> Option<I> {
        self.entries
            .iter()
            .rev()
            .find(|(tag, _)| server_versions.iter().any(|version| version == tag))
            .map(|(_, implementation)| *implementation)
    }

    /// Like [`resolve`](Self::resolve), surfacing no overlap as an error.
    ///
    /// An empty `server_versions` means negotiation has not happened yet.
    pub fn resolve_for(&self, endpoint: &str, server_versions: &[String]) -> Result<I, SessionError> {
        if server_versions.is_empty() {
            return Err(SessionError::missing_context("versions"));
        }
        self.resolve(server_versions)
            .ok_or_else(|| SessionError::unsupported_version(endpoint, server_versions))
    }
}

static CLIENT_TABLE: LazyLock<VersionTable<ApiRevision>> = LazyLock::new(|| {
    VersionTable::new([
        ("r0.5.0", ApiRevision::R0),
        ("r0.6.0", ApiRevision::R0),
        ("r0.6.1", ApiRevision::R0),
        ("v1.1", ApiRevision::V3),
        ("v1.2", ApiRevision::V3),
        ("v1.3", ApiRevision::V3),
        ("v1.4", ApiRevision::V3),
        ("v1.5", ApiRevision::V3),
    ])
});

// Refresh tokens only exist from v1.3 on.
static REFRESH_TABLE: LazyLock<VersionTable<ApiRevision>> = LazyLock::new(|| {
    VersionTable::new([
        ("v1.3", ApiRevision::V3),
        ("v1.4", ApiRevision::V3),
        ("v1.5", ApiRevision::V3),
    ])
});
