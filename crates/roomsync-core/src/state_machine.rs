use crate::{
    error::SessionError,
    session::{Auth, Session},
    types::{SessionCommand, SessionEvent, SessionLifecycleState},
};

#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionLifecycleState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            state: SessionLifecycleState::Unauthenticated,
        }
    }
}

impl SessionStateMachine {
    /// Starting state for a runtime that owns `session`.
    pub fn for_session(session: &Session) -> Self {
        let state = match session.context().auth {
            Auth::AccessToken(_) => SessionLifecycleState::Ready,
            Auth::Password { .. } => SessionLifecycleState::Unauthenticated,
        };
        Self { state }
    }

    pub fn state(&self) -> SessionLifecycleState {
        self.state
    }

    pub fn apply(&mut self, command: &SessionCommand) -> Result<Vec<SessionEvent>, SessionError> {
        use SessionCommand::*;

        match command {
            NegotiateVersions => self.require_not_fatal("negotiate_versions"),
            Login => self.transition_from_state(
                SessionLifecycleState::Unauthenticated,
                SessionLifecycleState::Authenticating,
                "login",
            ),
            StartSync => self.transition_from_state(
                SessionLifecycleState::Ready,
                SessionLifecycleState::Syncing,
                "start_sync",
            ),
            StopSync => self.transition_from_state(
                SessionLifecycleState::Syncing,
                SessionLifecycleState::Ready,
                "stop_sync",
            ),
            FetchEvent { .. } | Backfill { .. } => {
                if self.is_authenticated_context() {
                    Ok(Vec::new())
                } else {
                    Err(SessionError::invalid_state(self.state, "room command"))
                }
            }
        }
    }

    pub fn on_auth_result(&mut self, success: bool) -> Result<SessionEvent, SessionError> {
        if self.state != SessionLifecycleState::Authenticating {
            return Err(SessionError::invalid_state(self.state, "on_auth_result"));
        }

        let next = if success {
            SessionLifecycleState::Ready
        } else {
            SessionLifecycleState::Unauthenticated
        };

        self.state = next;
        Ok(SessionEvent::StateChanged { state: next })
    }

    /// The sync loop ended on its own (retry budget spent).
    pub fn on_sync_stopped(&mut self) -> Option<SessionEvent> {
        if self.state != SessionLifecycleState::Syncing {
            return None;
        }
        self.state = SessionLifecycleState::Ready;
        Some(SessionEvent::StateChanged {
            state: SessionLifecycleState::Ready,
        })
    }

    pub fn on_fatal(&mut self) -> SessionEvent {
        self.state = SessionLifecycleState::Fatal;
        SessionEvent::StateChanged {
            state: SessionLifecycleState::Fatal,
        }
    }

    fn is_authenticated_context(&self) -> bool {
        matches!(
            self.state,
            SessionLifecycleState::Ready | SessionLifecycleState::Syncing
        )
    }

    fn require_not_fatal(&self, action: &str) -> Result<Vec<SessionEvent>, SessionError> {
        if self.state == SessionLifecycleState::Fatal {
            return Err(SessionError::invalid_state(self.state, action));
        }
        Ok(Vec::new())
    }

    fn transition_from_state(
        &mut self,
        expected: SessionLifecycleState,
        next: SessionLifecycleState,
        action: &str,
    ) -> Result<Vec<SessionEvent>, SessionError> {
        if self.state != expected {
            return Err(SessionError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![SessionEvent::StateChanged { state: next }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HS: &str = "https://matrix.example.org";

    #[test]
    fn runs_happy_path_state_transitions() {
        let mut sm = SessionStateMachine::for_session(&Session::with_password(HS, "alice", "pw"));
        assert_eq!(sm.state(), SessionLifecycleState::Unauthenticated);

        sm.apply(&SessionCommand::Login).expect("login must work");
        assert_eq!(sm.state(), SessionLifecycleState::Authenticating);

        sm.on_auth_result(true).expect("auth should resolve");
        assert_eq!(sm.state(), SessionLifecycleState::Ready);

        sm.apply(&SessionCommand::StartSync)
            .expect("start sync should work");
        assert_eq!(sm.state(), SessionLifecycleState::Syncing);

        sm.apply(&SessionCommand::StopSync)
            .expect("stop sync should work");
        assert_eq!(sm.state(), SessionLifecycleState::Ready);
    }

    #[test]
    fn token_sessions_start_ready() {
        let sm = SessionStateMachine::for_session(&Session::with_access_token(HS, "tok"));
        assert_eq!(sm.state(), SessionLifecycleState::Ready);
    }

    #[test]
    fn failed_login_returns_to_unauthenticated() {
        let mut sm = SessionStateMachine::default();
        sm.apply(&SessionCommand::Login).expect("login must work");

        let event = sm.on_auth_result(false).expect("auth should resolve");
        assert_eq!(
            event,
            SessionEvent::StateChanged {
                state: SessionLifecycleState::Unauthenticated
            }
        );
    }

    #[test]
    fn rejects_sync_without_auth() {
        let mut sm = SessionStateMachine::default();

        let err = sm
            .apply(&SessionCommand::StartSync)
            .expect_err("start sync should fail without auth");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn rejects_room_commands_outside_authenticated_context() {
        let mut sm = SessionStateMachine::default();

        let err = sm
            .apply(&SessionCommand::Backfill {
                room_id: "!abc:example.org".into(),
            })
            .expect_err("room command should fail when not authenticated");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn sync_loop_exit_falls_back_to_ready() {
        let mut sm = SessionStateMachine::for_session(&Session::with_access_token(HS, "tok"));
        sm.apply(&SessionCommand::StartSync).expect("start sync");

        assert!(sm.on_sync_stopped().is_some());
        assert_eq!(sm.state(), SessionLifecycleState::Ready);
        assert!(sm.on_sync_stopped().is_none());
    }

    #[test]
    fn fatal_blocks_negotiation() {
        let mut sm = SessionStateMachine::default();
        sm.on_fatal();

        assert!(sm.apply(&SessionCommand::NegotiateVersions).is_err());
    }
}
