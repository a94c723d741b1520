//! Driver synchronization state machine.
//!
//! Transitions are a pure function of the current state, the version and an
//! [`Event`]; the store applies the resulting [`Action`] and feeds the outcome
//! back in.

use std::fmt;

/// Where a direct store stands with respect to its driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreState {
    /// The driver holds everything the local model has.
    Idle,
    /// A send is in flight.
    AwaitingResponse,
    /// The driver rejected a send; waiting for its newer model.
    AwaitingDriverModel,
    Closed,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreState::Idle => "idle",
            StoreState::AwaitingResponse => "awaiting-response",
            StoreState::AwaitingDriverModel => "awaiting-driver-model",
            StoreState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Input to one transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The local model changed in a way the driver has not seen.
    Changed { from_driver: bool },
    /// The driver answered the send issued by the previous transition.
    Sent { accepted: bool },
}

/// What the store must do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Move to `state` at `version` and take another step.
    Enter { state: StoreState, version: u64 },
    /// Send the local model at `version` and report the answer as [`Event::Sent`].
    Send { version: u64 },
    /// Move to `state` at `version` and stop.
    Settle { state: StoreState, version: u64 },
    /// Nothing to do.
    Stop,
}

/// One transition. `version` is the last version the driver acknowledged, or
/// the version in flight while awaiting a response.
pub fn next(state: StoreState, version: u64, event: Event) -> Action {
    match (state, event) {
        (StoreState::Closed, _) => Action::Stop,
        (StoreState::Idle, Event::Changed { .. }) => Action::Enter {
            state: StoreState::AwaitingResponse,
            version: version + 1,
        },
        (StoreState::AwaitingDriverModel, Event::Changed { from_driver: true }) => Action::Enter {
            state: StoreState::AwaitingResponse,
            version: version + 1,
        },
        // Local changes ride along with the send that follows the driver's model.
        (StoreState::AwaitingDriverModel, Event::Changed { from_driver: false }) => Action::Stop,
        (StoreState::AwaitingResponse, Event::Changed { .. }) => Action::Send { version },
        (StoreState::AwaitingResponse, Event::Sent { accepted: true }) => Action::Settle {
            state: StoreState::Idle,
            version,
        },
        (StoreState::AwaitingResponse, Event::Sent { accepted: false }) => Action::Settle {
            state: StoreState::AwaitingDriverModel,
            version: version.saturating_sub(1),
        },
        (StoreState::Idle | StoreState::AwaitingDriverModel, Event::Sent { .. }) => Action::Stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: Event = Event::Changed { from_driver: false };
    const DRIVER: Event = Event::Changed { from_driver: true };

    fn run(
        mut state: StoreState,
        mut version: u64,
        first: Event,
        answers: &[bool],
    ) -> (StoreState, u64, usize) {
        let mut event = first;
        let mut answers = answers.iter();
        for spins in 1..=16 {
            match next(state, version, event) {
                Action::Enter { state: s, version: v } => {
                    state = s;
                    version = v;
                    event = first;
                }
                Action::Send { .. } => {
                    event = Event::Sent {
                        accepted: *answers.next().expect("unexpected send"),
                    }
                }
                Action::Settle { state: s, version: v } => return (s, v, spins),
                Action::Stop => return (state, version, spins),
            }
        }
        panic!("state machine did not settle");
    }

    #[test]
    fn idle_change_sends_next_version() {
        assert_eq!(
            next(StoreState::Idle, 3, LOCAL),
            Action::Enter {
                state: StoreState::AwaitingResponse,
                version: 4
            }
        );
        assert_eq!(next(StoreState::AwaitingResponse, 4, LOCAL), Action::Send { version: 4 });
        assert_eq!(run(StoreState::Idle, 3, LOCAL, &[true]), (StoreState::Idle, 4, 3));
    }

    #[test]
    fn rejection_waits_for_driver_model() {
        let (state, version, _) = run(StoreState::Idle, 3, LOCAL, &[false]);
        assert_eq!((state, version), (StoreState::AwaitingDriverModel, 3));
        // A local change cannot resolve the wait.
        assert_eq!(next(state, version, LOCAL), Action::Stop);
        // The driver's model at version 5 can.
        assert_eq!(run(state, 5, DRIVER, &[true]), (StoreState::Idle, 6, 3));
    }

    #[test]
    fn closed_is_terminal() {
        for event in [LOCAL, DRIVER, Event::Sent { accepted: true }] {
            assert_eq!(next(StoreState::Closed, 1, event), Action::Stop);
        }
    }

    #[test]
    fn stray_send_result_is_ignored() {
        assert_eq!(next(StoreState::Idle, 1, Event::Sent { accepted: true }), Action::Stop);
    }
}
