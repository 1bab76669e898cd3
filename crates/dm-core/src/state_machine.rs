use crate::{error::BackendError, types::StoreState};

/// Inputs driving the message-store lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTransition {
    Open,
    OpenSucceeded,
    OpenFailed,
    BeginLoadOlder,
    OlderFinished,
    SubscriptionLost,
    Close,
}

#[derive(Debug, Clone)]
pub struct StoreStateMachine {
    state: StoreState,
}

impl Default for StoreStateMachine {
    fn default() -> Self {
        Self {
            state: StoreState::Empty,
        }
    }
}

impl StoreStateMachine {
    pub fn state(&self) -> StoreState {
        self.state
    }

    pub fn apply(&mut self, transition: StoreTransition) -> Result<StoreState, BackendError> {
        use StoreTransition::*;

        match transition {
            Open => self.transition_from_any_of(
                &[
                    StoreState::Empty,
                    StoreState::Loading,
                    StoreState::Loaded,
                    StoreState::LoadingOlder,
                    StoreState::Stale,
                ],
                StoreState::Loading,
                "open",
            ),
            OpenSucceeded => {
                if self.state == StoreState::Stale {
                    // Lost the subscription mid-load; the page is usable but may have gaps.
                    return Ok(self.state);
                }
                self.transition_from_state(StoreState::Loading, StoreState::Loaded, "open_succeeded")
            }
            OpenFailed => {
                self.transition_from_any_of(
                    &[StoreState::Loading, StoreState::Stale],
                    StoreState::Empty,
                    "open_failed",
                )
            }
            BeginLoadOlder => self.transition_from_state(
                StoreState::Loaded,
                StoreState::LoadingOlder,
                "load_older",
            ),
            OlderFinished => {
                if self.state == StoreState::Stale {
                    return Ok(self.state);
                }
                self.transition_from_state(
                    StoreState::LoadingOlder,
                    StoreState::Loaded,
                    "older_finished",
                )
            }
            SubscriptionLost => match self.state {
                StoreState::Empty | StoreState::Stale => Ok(self.state),
                _ => {
                    self.state = StoreState::Stale;
                    Ok(self.state)
                }
            },
            Close => {
                self.state = StoreState::Empty;
                Ok(self.state)
            }
        }
    }

    /// Whether live events may be applied to the loaded window.
    pub fn accepts_live_events(&self) -> bool {
        !matches!(self.state, StoreState::Empty)
    }

    fn transition_from_state(
        &mut self,
        expected: StoreState,
        next: StoreState,
        action: &str,
    ) -> Result<StoreState, BackendError> {
        if self.state != expected {
            return Err(BackendError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(next)
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[StoreState],
        next: StoreState,
        action: &str,
    ) -> Result<StoreState, BackendError> {
        if !expected.contains(&self.state) {
            return Err(BackendError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(next)
    }
}
