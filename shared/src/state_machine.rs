//! Execution State Machine
//!
//! Defines the valid lifecycle transitions of an execution record.

use crate::ExecutionState;

/// Events that drive an execution record through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionEvent {
    /// A worker dequeued the entry and resolved a binding
    Dequeued,
    /// The transport adapter accepted the command for delivery
    DeliveryAccepted,
    /// Positive acknowledgement or result from the robot
    Acknowledged,
    /// Execution fault, dispatch failure, or retries exhausted
    Faulted,
    /// No terminal response within the deadline
    DeadlineExpired,
    /// Attempt failed but will be retried
    Requeued,
    /// Explicit cancel or emergency preemption
    Cancelled,
}

/// Result of a transition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(ExecutionState),
    /// Transition was invalid from the current state
    Invalid {
        from: ExecutionState,
        event: ExecutionEvent,
    },
}

/// Get the next state for a given event, if the transition is valid
pub fn next_state(from: ExecutionState, event: ExecutionEvent) -> Option<ExecutionState> {
    use ExecutionEvent::*;
    use ExecutionState::*;

    match (from, event) {
        // Terminal states never move again
        (Succeeded | Failed | TimedOut | ExecutionState::Cancelled, _) => None,

        // Cancellation is reachable from every live state
        (_, ExecutionEvent::Cancelled) => Some(ExecutionState::Cancelled),

        (Queued, Dequeued) => Some(Dispatching),
        (Queued, DeadlineExpired) => Some(TimedOut),

        (Dispatching, DeliveryAccepted) => Some(InProgress),
        (Dispatching, Faulted) => Some(Failed),
        (Dispatching, DeadlineExpired) => Some(TimedOut),
        (Dispatching, Requeued) => Some(Queued),

        (InProgress, Acknowledged) => Some(Succeeded),
        (InProgress, Faulted) => Some(Failed),
        (InProgress, DeadlineExpired) => Some(TimedOut),
        (InProgress, Requeued) => Some(Queued),

        _ => None,
    }
}

/// Apply an event, reporting whether the transition was legal
pub fn apply(from: ExecutionState, event: ExecutionEvent) -> TransitionResult {
    match next_state(from, event) {
        Some(state) => TransitionResult::Success(state),
        None => TransitionResult::Invalid { from, event },
    }
}
