//! Generic finite state machine shared by pipeline requests and sessions.
//!
//! Each state type declares its own transition table through [`Transitions`],
//! so every state is part of the table's domain by construction. A
//! [`StateMachine`] pairs the current state with a diagnostic label and only
//! moves through [`StateMachine::transition`] or [`StateMachine::try_transition`].
//!
//! # Example
//!
//! ```ignore
//! use swe_conductor::pipeline::PipelineStatus;
//! use swe_conductor::state_machine::StateMachine;
//!
//! let mut machine = StateMachine::new(PipelineStatus::Accepted, "pipeline:req-1");
//! machine.transition(PipelineStatus::Running)?;
//! assert!(!machine.try_transition(PipelineStatus::Accepted));
//! ```

use std::fmt;

use thiserror::Error;
use tracing::warn;

/// A state with a static transition table.
pub trait Transitions: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// States reachable from `self`. An empty slice marks a terminal state.
    fn targets(self) -> &'static [Self];

    /// Returns true when no transition leaves this state.
    fn is_terminal(self) -> bool {
        self.targets().is_empty()
    }
}

/// Raised by [`StateMachine::transition`] when the target is not reachable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid transition from '{from}' to '{to}' ({label})")]
pub struct TransitionError {
    /// State the machine was in.
    pub from: String,
    /// Rejected target state.
    pub to: String,
    /// Diagnostic label of the machine.
    pub label: String,
}

/// Single-threaded state machine over a [`Transitions`] state type.
///
/// Callers must not drive the same instance concurrently; owners keep it
/// behind their own lock.
#[derive(Debug, Clone)]
pub struct StateMachine<S: Transitions> {
    current: S,
    label: String,
}

impl<S: Transitions> StateMachine<S> {
    /// Creates a machine in `initial` state.
    pub fn new(initial: S, label: impl Into<String>) -> Self {
        Self {
            current: initial,
            label: label.into(),
        }
    }

    /// Current state.
    pub fn current(&self) -> S {
        self.current
    }

    /// Diagnostic label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the current state is terminal.
    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// Pure check: is `to` reachable from the current state?
    pub fn can_transition(&self, to: S) -> bool {
        self.current.targets().contains(&to)
    }

    /// Moves to `to`, or fails without changing state.
    pub fn transition(&mut self, to: S) -> Result<(), TransitionError> {
        if !self.can_transition(to) {
            return Err(TransitionError {
                from: self.current.to_string(),
                to: to.to_string(),
                label: self.label.clone(),
            });
        }
        self.current = to;
        Ok(())
    }

    /// Like [`transition`](Self::transition) but logs and returns `false`
    /// instead of failing.
    pub fn try_transition(&mut self, to: S) -> bool {
        match self.transition(to) {
            Ok(()) => true,
            Err(err) => {
                warn!(label = %err.label, from = %err.from, to = %err.to, "Rejected state transition");
                false
            }
        }
    }
}
