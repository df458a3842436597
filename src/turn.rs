//! # Turn Coordination
//!
//! Keeps the user's microphone from feeding the assistant's own voice back
//! into the conversation.
//!
//! ## States:
//! - **Idle**: no active session; capture paused
//! - **UserCapturing**: the microphone is live and frames go out
//! - **RemoteSpeaking**: the assistant is talking; capture paused
//! - **Suppressed**: the user muted themselves; capture paused
//!
//! The state is derived from three facts (session active, user muted, remote
//! speaking) rather than stored, so `UserCapturing` and `RemoteSpeaking` can
//! never hold together. After every input the capture pause flag is set to
//! match the derived state.

use crate::audio::PauseSwitch;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    UserCapturing,
    RemoteSpeaking,
    Suppressed,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::UserCapturing => "user_capturing",
            TurnState::RemoteSpeaking => "remote_speaking",
            TurnState::Suppressed => "suppressed",
        }
    }
}

/// Everything that can move the turn state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnInput {
    /// Session became active; `muted` is the initial mute preference
    Activate { muted: bool },
    RemoteStarted,
    RemoteEnded,
    Mute,
    Unmute,
    Deactivate,
}

#[derive(Debug)]
pub struct TurnCoordinator {
    active: bool,
    user_muted: bool,
    remote_speaking: bool,
    capture: PauseSwitch,
}

impl TurnCoordinator {
    /// Create an idle coordinator that drives `capture`.
    pub fn new(capture: PauseSwitch) -> Self {
        capture.pause();
        Self {
            active: false,
            user_muted: false,
            remote_speaking: false,
            capture,
        }
    }

    pub fn state(&self) -> TurnState {
        if !self.active {
            TurnState::Idle
        } else if self.user_muted {
            TurnState::Suppressed
        } else if self.remote_speaking {
            TurnState::RemoteSpeaking
        } else {
            TurnState::UserCapturing
        }
    }

    pub fn is_muted(&self) -> bool {
        self.user_muted
    }

    /// Whether outbound frames may be sent right now.
    pub fn capture_enabled(&self) -> bool {
        self.state() == TurnState::UserCapturing
    }

    /// Apply one input and return the resulting state.
    pub fn apply(&mut self, input: TurnInput) -> TurnState {
        let before = self.state();

        match input {
            TurnInput::Activate { muted } => {
                self.active = true;
                self.user_muted = muted;
                self.remote_speaking = false;
            }
            TurnInput::RemoteStarted => self.remote_speaking = true,
            TurnInput::RemoteEnded => self.remote_speaking = false,
            TurnInput::Mute => self.user_muted = true,
            TurnInput::Unmute => self.user_muted = false,
            TurnInput::Deactivate => {
                self.active = false;
                self.remote_speaking = false;
            }
        }

        let after = self.state();
        self.capture.set(after != TurnState::UserCapturing);

        if before != after {
            debug!(from = before.as_str(), to = after.as_str(), ?input, "Turn state changed");
        }
        after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn coordinator() -> (TurnCoordinator, PauseSwitch) {
        let switch = PauseSwitch::new(false);
        (TurnCoordinator::new(switch.clone()), switch)
    }

    #[test]
    fn test_starts_idle_and_paused() {
        let (turn, switch) = coordinator();
        assert_eq!(turn.state(), TurnState::Idle);
        assert!(switch.is_paused());
    }

    #[test]
    fn test_activation_respects_initial_mute() {
        let (mut turn, switch) = coordinator();
        assert_eq!(turn.apply(TurnInput::Activate { muted: false }), TurnState::UserCapturing);
        assert!(!switch.is_paused());

        let (mut turn, switch) = coordinator();
        assert_eq!(turn.apply(TurnInput::Activate { muted: true }), TurnState::Suppressed);
        assert!(switch.is_paused());
    }

    #[test]
    fn test_remote_speech_pauses_and_resumes() {
        let (mut turn, switch) = coordinator();
        turn.apply(TurnInput::Activate { muted: false });

        assert_eq!(turn.apply(TurnInput::RemoteStarted), TurnState::RemoteSpeaking);
        assert!(switch.is_paused());

        assert_eq!(turn.apply(TurnInput::RemoteEnded), TurnState::UserCapturing);
        assert!(!switch.is_paused());
    }

    #[test]
    fn test_mute_during_remote_speech_stays_suppressed() {
        let (mut turn, switch) = coordinator();
        turn.apply(TurnInput::Activate { muted: false });
        turn.apply(TurnInput::RemoteStarted);

        assert_eq!(turn.apply(TurnInput::Mute), TurnState::Suppressed);
        assert_eq!(turn.apply(TurnInput::RemoteEnded), TurnState::Suppressed);
        assert!(switch.is_paused());
    }

    #[test]
    fn test_unmute_during_remote_speech_waits_for_remote() {
        let (mut turn, switch) = coordinator();
        turn.apply(TurnInput::Activate { muted: true });
        turn.apply(TurnInput::RemoteStarted);

        assert_eq!(turn.apply(TurnInput::Unmute), TurnState::RemoteSpeaking);
        assert!(switch.is_paused());
        assert_eq!(turn.apply(TurnInput::RemoteEnded), TurnState::UserCapturing);
    }

    #[test]
    fn test_deactivate_returns_to_idle() {
        let (mut turn, switch) = coordinator();
        turn.apply(TurnInput::Activate { muted: false });
        turn.apply(TurnInput::RemoteStarted);
        assert_eq!(turn.apply(TurnInput::Deactivate), TurnState::Idle);
        assert!(switch.is_paused());
        // Remote events after teardown cannot revive capture
        assert_eq!(turn.apply(TurnInput::RemoteEnded), TurnState::Idle);
        assert!(switch.is_paused());
    }

    fn any_input() -> impl Strategy<Value = TurnInput> {
        prop_oneof![
            any::<bool>().prop_map(|muted| TurnInput::Activate { muted }),
            Just(TurnInput::RemoteStarted),
            Just(TurnInput::RemoteEnded),
            Just(TurnInput::Mute),
            Just(TurnInput::Unmute),
            Just(TurnInput::Deactivate),
        ]
    }

    proptest! {
        #[test]
        fn capture_is_live_only_while_user_capturing(
            inputs in proptest::collection::vec(any_input(), 0..64)
        ) {
            let (mut turn, switch) = coordinator();
            let mut remote_speaking = false;

            for input in inputs {
                match input {
                    TurnInput::RemoteStarted => remote_speaking = true,
                    TurnInput::RemoteEnded
                    | TurnInput::Deactivate
                    | TurnInput::Activate { .. } => remote_speaking = false,
                    _ => {}
                }

                let state = turn.apply(input);
                prop_assert_eq!(switch.is_paused(), state != TurnState::UserCapturing);
                // The assistant speaking and the microphone being live never overlap
                prop_assert!(!(remote_speaking && state == TurnState::UserCapturing));
            }
        }
    }
}
