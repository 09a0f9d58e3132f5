use serde::Serialize;
use strum_macros::{Display, EnumIter};
use tokio::sync::watch;
use tracing::debug;

use super::operation::OperationKind;
use crate::error::SessionError;

/// Lifecycle of one logical connection.
///
/// `Disconnected` is terminal: a session that reaches it is never reused.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[strum(to_string = "idle")]
    Idle,
    #[strum(to_string = "connecting")]
    Connecting,
    #[strum(to_string = "connected")]
    Connected,
    #[strum(to_string = "discovering")]
    Discovering,
    #[strum(to_string = "ready")]
    Ready,
    #[strum(to_string = "disconnecting")]
    Disconnecting,
    #[strum(to_string = "disconnected")]
    Disconnected,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Whether the physical link is up and link-level requests may be issued.
    #[must_use]
    pub fn has_link(self) -> bool {
        matches!(self, Self::Connected | Self::Discovering | Self::Ready)
    }
}

/// Caller-initiated transitions, named in `InvalidTransition` errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub enum SessionAction {
    #[strum(to_string = "connect")]
    Connect,
    #[strum(to_string = "discover services")]
    DiscoverServices,
    #[strum(to_string = "refresh the attribute cache")]
    Refresh,
    #[strum(to_string = "disconnect")]
    Disconnect,
}

/// What `disconnect` has to tear down.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum DisconnectStep {
    /// Nothing was ever connected; the session went straight to `Disconnected`.
    Immediate,
    /// A link exists or is being set up and must be released.
    TearDown,
    /// A previous disconnect is still in progress.
    InProgress,
}

/// Guards every state transition and publishes each new state.
#[derive(Debug)]
pub(crate) struct SessionStateMachine {
    state: SessionState,
    publisher: watch::Sender<SessionState>,
}

impl SessionStateMachine {
    pub(crate) fn new() -> (Self, watch::Receiver<SessionState>) {
        let (publisher, receiver) = watch::channel(SessionState::Idle);
        (
            Self {
                state: SessionState::Idle,
                publisher,
            },
            receiver,
        )
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    fn enter(&mut self, next: SessionState) {
        debug!(from = %self.state, to = %next, "session state transition");
        self.state = next;
        self.publisher.send_replace(next);
    }

    pub(crate) fn begin_connect(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => {
                self.enter(SessionState::Connecting);
                Ok(())
            }
            SessionState::Disconnected => Err(SessionError::InvalidTransition {
                action: SessionAction::Connect,
                state: self.state,
            }),
            state => Err(SessionError::AlreadyConnecting { state }),
        }
    }

    /// Returns `false` when the link came up outside `Connecting` and was ignored.
    pub(crate) fn link_connected(&mut self) -> bool {
        if self.state != SessionState::Connecting {
            return false;
        }
        self.enter(SessionState::Connected);
        true
    }

    pub(crate) fn begin_discovery(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Connected {
            return Err(SessionError::InvalidTransition {
                action: SessionAction::DiscoverServices,
                state: self.state,
            });
        }
        self.enter(SessionState::Discovering);
        Ok(())
    }

    /// Moves to `Ready` on success and to `Disconnected` on failure.
    ///
    /// Returns `false` when no discovery was in progress.
    pub(crate) fn discovery_finished(&mut self, success: bool) -> bool {
        if self.state != SessionState::Discovering {
            return false;
        }
        self.enter(if success {
            SessionState::Ready
        } else {
            SessionState::Disconnected
        });
        true
    }

    pub(crate) fn begin_refresh(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Ready => {
                self.enter(SessionState::Connected);
                Ok(())
            }
            SessionState::Connected => Ok(()),
            state => Err(SessionError::InvalidTransition {
                action: SessionAction::Refresh,
                state,
            }),
        }
    }

    pub(crate) fn begin_disconnect(&mut self) -> Result<DisconnectStep, SessionError> {
        match self.state {
            SessionState::Idle => {
                self.enter(SessionState::Disconnected);
                Ok(DisconnectStep::Immediate)
            }
            SessionState::Disconnecting => Ok(DisconnectStep::InProgress),
            SessionState::Disconnected => Err(SessionError::InvalidTransition {
                action: SessionAction::Disconnect,
                state: self.state,
            }),
            SessionState::Connecting
            | SessionState::Connected
            | SessionState::Discovering
            | SessionState::Ready => {
                self.enter(SessionState::Disconnecting);
                Ok(DisconnectStep::TearDown)
            }
        }
    }

    /// Returns `false` when the session was already terminal.
    pub(crate) fn link_lost(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.enter(SessionState::Disconnected);
        true
    }

    /// Checks whether a request of this kind may be queued in the current state.
    pub(crate) fn admit(&self, kind: OperationKind) -> Result<(), SessionError> {
        let (admitted, required) = if kind.is_link_level() {
            (self.state.has_link(), SessionState::Connected)
        } else {
            (self.state == SessionState::Ready, SessionState::Ready)
        };

        if admitted {
            Ok(())
        } else {
            Err(SessionError::NotReady {
                kind,
                state: self.state,
                required,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn machine_in(state: SessionState) -> SessionStateMachine {
        let (mut machine, _receiver) = SessionStateMachine::new();
        machine.state = state;
        machine
    }

    fn ready_machine() -> SessionStateMachine {
        let (mut machine, _receiver) = SessionStateMachine::new();
        machine.begin_connect().expect("idle session should connect");
        assert!(machine.link_connected());
        machine
            .begin_discovery()
            .expect("connected session should discover");
        assert!(machine.discovery_finished(true));
        machine
    }

    #[test]
    fn happy_path_reaches_ready_and_publishes_each_state() {
        let (mut machine, mut receiver) = SessionStateMachine::new();
        assert_eq!(SessionState::Idle, *receiver.borrow_and_update());

        machine.begin_connect().expect("idle session should connect");
        assert_eq!(SessionState::Connecting, *receiver.borrow_and_update());
        assert!(machine.link_connected());
        machine
            .begin_discovery()
            .expect("connected session should discover");
        assert!(machine.discovery_finished(true));

        assert_eq!(SessionState::Ready, machine.state());
        assert_eq!(SessionState::Ready, *receiver.borrow_and_update());
    }

    #[rstest]
    #[case(SessionState::Connecting)]
    #[case(SessionState::Connected)]
    #[case(SessionState::Discovering)]
    #[case(SessionState::Ready)]
    #[case(SessionState::Disconnecting)]
    fn connect_outside_idle_is_rejected_without_side_effect(#[case] state: SessionState) {
        let mut machine = machine_in(state);

        assert_matches!(
            machine.begin_connect(),
            Err(SessionError::AlreadyConnecting { state: reported }) if reported == state
        );
        assert_eq!(state, machine.state());
    }

    #[test]
    fn connect_after_terminal_disconnect_is_an_invalid_transition() {
        let mut machine = machine_in(SessionState::Disconnected);
        assert_matches!(
            machine.begin_connect(),
            Err(SessionError::InvalidTransition {
                action: SessionAction::Connect,
                ..
            })
        );
    }

    #[rstest]
    #[case(SessionState::Idle)]
    #[case(SessionState::Connecting)]
    #[case(SessionState::Discovering)]
    #[case(SessionState::Ready)]
    #[case(SessionState::Disconnected)]
    fn discovery_outside_connected_is_rejected(#[case] state: SessionState) {
        let mut machine = machine_in(state);

        assert_matches!(
            machine.begin_discovery(),
            Err(SessionError::InvalidTransition {
                action: SessionAction::DiscoverServices,
                ..
            })
        );
        assert_eq!(state, machine.state());
    }

    #[test]
    fn failed_discovery_is_terminal() {
        let (mut machine, _receiver) = SessionStateMachine::new();
        machine.begin_connect().expect("idle session should connect");
        machine.link_connected();
        machine
            .begin_discovery()
            .expect("connected session should discover");

        assert!(machine.discovery_finished(false));
        assert_eq!(SessionState::Disconnected, machine.state());
    }

    #[test]
    fn link_connected_outside_connecting_is_ignored() {
        let mut machine = machine_in(SessionState::Disconnecting);
        assert!(!machine.link_connected());
        assert_eq!(SessionState::Disconnecting, machine.state());
    }

    #[rstest]
    #[case(SessionState::Idle, Ok(DisconnectStep::Immediate), SessionState::Disconnected)]
    #[case(SessionState::Connecting, Ok(DisconnectStep::TearDown), SessionState::Disconnecting)]
    #[case(SessionState::Ready, Ok(DisconnectStep::TearDown), SessionState::Disconnecting)]
    #[case(
        SessionState::Disconnecting,
        Ok(DisconnectStep::InProgress),
        SessionState::Disconnecting
    )]
    fn disconnect_steps_follow_the_source_state(
        #[case] state: SessionState,
        #[case] expected: Result<DisconnectStep, ()>,
        #[case] expected_state: SessionState,
    ) {
        let mut machine = machine_in(state);
        let step = machine.begin_disconnect().map_err(|_error| ());

        assert_eq!(expected, step);
        assert_eq!(expected_state, machine.state());
    }

    #[test]
    fn disconnect_from_terminal_state_is_rejected() {
        let mut machine = machine_in(SessionState::Disconnected);
        assert_matches!(
            machine.begin_disconnect(),
            Err(SessionError::InvalidTransition {
                action: SessionAction::Disconnect,
                ..
            })
        );
    }

    #[test]
    fn link_lost_reaches_terminal_state_once() {
        let mut machine = ready_machine();
        assert!(machine.link_lost());
        assert!(!machine.link_lost());
        assert_eq!(SessionState::Disconnected, machine.state());
    }

    #[rstest]
    #[case(SessionState::Connecting, OperationKind::ReadCharacteristic, false)]
    #[case(SessionState::Connected, OperationKind::ReadCharacteristic, false)]
    #[case(SessionState::Ready, OperationKind::ReadCharacteristic, true)]
    #[case(SessionState::Connecting, OperationKind::ReadRssi, false)]
    #[case(SessionState::Connected, OperationKind::ReadRssi, true)]
    #[case(SessionState::Discovering, OperationKind::RequestMtu, true)]
    #[case(SessionState::Ready, OperationKind::RequestPriority, true)]
    #[case(SessionState::Disconnecting, OperationKind::RequestPriority, false)]
    fn admit_gates_on_state_and_kind(
        #[case] state: SessionState,
        #[case] kind: OperationKind,
        #[case] admitted: bool,
    ) {
        let machine = machine_in(state);
        assert_eq!(admitted, machine.admit(kind).is_ok());
    }

    #[test]
    fn refresh_from_ready_returns_to_connected() {
        let mut machine = ready_machine();
        machine.begin_refresh().expect("ready session should refresh");
        assert_eq!(SessionState::Connected, machine.state());
    }
}
