//! Reusable lifecycle state machine for filter-managed objects.
//!
//! The transition table is fixed; unknown events and absent transitions are
//! errors and never change the current state. `Destroyed` is terminal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// States of a managed function object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Initial,
    Active,
    Inactive,
    Failed,
    Destroyed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Initial => "initial",
            State::Active => "active",
            State::Inactive => "inactive",
            State::Failed => "failed",
            State::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Events applied to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Create,
    Start,
    Stop,
    Update,
    Delete,
    Ready,
    Pending,
    Error,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Event::Create => "create",
            Event::Start => "start",
            Event::Stop => "stop",
            Event::Update => "update",
            Event::Delete => "delete",
            Event::Ready => "ready",
            Event::Pending => "pending",
            Event::Error => "error",
        };
        f.write_str(s)
    }
}

const TRANSITIONS: &[(State, Event, State)] = &[
    (State::Initial, Event::Update, State::Initial),
    (State::Initial, Event::Delete, State::Destroyed),
    (State::Initial, Event::Ready, State::Active),
    (State::Initial, Event::Pending, State::Initial),
    (State::Initial, Event::Error, State::Failed),
    (State::Active, Event::Stop, State::Inactive),
    (State::Active, Event::Error, State::Failed),
    (State::Active, Event::Ready, State::Active),
    (State::Active, Event::Pending, State::Failed),
    (State::Inactive, Event::Update, State::Initial),
    (State::Inactive, Event::Start, State::Inactive),
    (State::Inactive, Event::Delete, State::Destroyed),
    (State::Inactive, Event::Ready, State::Active),
    (State::Inactive, Event::Pending, State::Failed),
    (State::Inactive, Event::Error, State::Failed),
    (State::Failed, Event::Delete, State::Destroyed),
    (State::Failed, Event::Update, State::Initial),
    (State::Failed, Event::Ready, State::Initial),
    (State::Failed, Event::Pending, State::Failed),
    (State::Failed, Event::Error, State::Failed),
];

/// Finite state machine over the fixed transition table.
#[derive(Debug, Clone)]
pub struct Fsm {
    current: State,
}

impl Fsm {
    /// The state a freshly created object starts in.
    pub fn init_state() -> State {
        State::Initial
    }

    pub fn new(state: State) -> Self {
        Self { current: state }
    }

    /// Apply an event, advancing the state on a valid transition.
    pub fn next(&mut self, event: Event) -> Result<State> {
        for &(from, ev, to) in TRANSITIONS {
            if self.current == from && event == ev {
                self.current = to;
                return Ok(to);
            }
        }
        Err(Error::spec(format!(
            "invalid event {} in state {}",
            event, self.current
        )))
    }

    pub fn current(&self) -> State {
        self.current
    }
}
