//! Operation state machine
//!
//! Every asynchronous operation is tracked by a small, pure state machine.
//! `transition()` is a lookup in a const table; `OpAction` is a function of
//! the current state alone. Feeding an event to a state that cannot legally
//! receive it is a protocol violation inside the engine itself, so it
//! aborts loudly instead of limping on with corrupt state.
//!
//! Happy path: `Spooled → Working → Complete → Terminal`.
//! Cancel before submission short-circuits `Spooled → Complete` (nothing is
//! in flight, there is nothing to wait for). Cancel during flight must go
//! through `CancelSpooled → CancelWorking` because a cancel request has to
//! be submitted to the backend and the original completion (or the cancel
//! acknowledgment) still arrives.

use core::fmt;

/// State of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpState {
    /// Queued locally, not yet handed to the backend
    Spooled = 0,

    /// Submitted, waiting for the backend to complete it
    Working = 1,

    /// Cancel requested while in flight; cancel not yet submitted
    CancelSpooled = 2,

    /// Cancel submitted; waiting for completion or cancel acknowledgment
    CancelWorking = 3,

    /// Result available, owner not yet notified
    Complete = 4,

    /// Notified; eligible for reaping
    Terminal = 5,

    /// Unreachable. Produced only by illegal (state, event) pairs.
    Invalid = 6,
}

impl OpState {
    /// Number of states (including Invalid)
    pub const COUNT: usize = 7;

    /// Check if this operation has finished its lifecycle
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, OpState::Terminal)
    }

    /// Check if the backend may still write into this operation's buffers
    #[inline]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, OpState::Working | OpState::CancelSpooled | OpState::CancelWorking)
    }
}

/// Event fed into the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpEvent {
    /// The operation (or its cancel request) was handed to the backend
    Submission = 0,

    /// The backend delivered a result
    Completion = 1,

    /// The owner was told about the result
    Notification = 2,

    /// Cancellation was requested
    Cancel = 3,
}

impl OpEvent {
    /// Number of events
    pub const COUNT: usize = 4;

    /// All events, for exhaustive table tests
    pub const ALL: [OpEvent; 4] = [
        OpEvent::Submission,
        OpEvent::Completion,
        OpEvent::Notification,
        OpEvent::Cancel,
    ];
}

/// Next required step for an operation, derived purely from its state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpAction {
    /// Nothing to do until the backend reports
    Wait = 0,

    /// Hand the operation (or its cancel) to the backend
    Submit = 1,

    /// Deliver the result to the owner
    Notify = 2,

    /// Reap the operation
    Remove = 3,

    /// Programming error; must abort
    Panic = 4,
}

/// Transition table: `TRANSITIONS[state][event]`.
///
/// Rows follow the OpState discriminants, columns the OpEvent ones.
const TRANSITIONS: [[OpState; OpEvent::COUNT]; OpState::COUNT] = {
    use OpState::*;
    [
        // Submission,   Completion, Notification, Cancel
        [Working,        Invalid,    Invalid,      Complete],      // Spooled
        [Invalid,        Complete,   Invalid,      CancelSpooled], // Working
        [CancelWorking,  Invalid,    Invalid,      Invalid],       // CancelSpooled
        [Invalid,        Complete,   Invalid,      Invalid],       // CancelWorking
        [Invalid,        Invalid,    Terminal,     Invalid],       // Complete
        [Invalid,        Invalid,    Invalid,      Invalid],       // Terminal
        [Invalid,        Invalid,    Invalid,      Invalid],       // Invalid
    ]
};

/// Action table: `ACTIONS[state]`.
const ACTIONS: [OpAction; OpState::COUNT] = [
    OpAction::Submit, // Spooled
    OpAction::Wait,   // Working
    OpAction::Submit, // CancelSpooled
    OpAction::Wait,   // CancelWorking
    OpAction::Notify, // Complete
    OpAction::Remove, // Terminal
    OpAction::Panic,  // Invalid
];

/// Pure transition lookup. Returns `Invalid` for illegal pairs; it is the
/// caller's job to treat that as fatal (see `OpStateMachine::handle_event`).
#[inline]
pub const fn transition(state: OpState, event: OpEvent) -> OpState {
    TRANSITIONS[state as usize][event as usize]
}

/// Pure action lookup.
#[inline]
pub const fn action_for(state: OpState) -> OpAction {
    ACTIONS[state as usize]
}

/// The per-operation state machine
///
/// Owns nothing but the current state. The reactor drives it and performs
/// whatever `action()` demands.
#[derive(Debug, Clone, Copy)]
pub struct OpStateMachine {
    state: OpState,
}

impl OpStateMachine {
    #[inline]
    pub const fn new() -> Self {
        Self { state: OpState::Spooled }
    }

    #[inline]
    pub const fn state(&self) -> OpState {
        self.state
    }

    /// Next required step for this operation.
    #[inline]
    pub const fn action(&self) -> OpAction {
        action_for(self.state)
    }

    /// Apply an event.
    ///
    /// Panics if the event is illegal for the current state. That means a
    /// core invariant was broken by the engine (e.g. a completion delivered
    /// twice), never a recoverable runtime condition.
    pub fn handle_event(&mut self, event: OpEvent) -> OpState {
        let next = transition(self.state, event);
        if matches!(next, OpState::Invalid) {
            panic!(
                "illegal operation event {:?} in state {:?}",
                event, self.state
            );
        }
        self.state = next;
        next
    }

    /// Return to Spooled for object-pool reuse.
    ///
    /// Only legal once Terminal; resetting a live operation would orphan
    /// an in-flight backend request.
    pub fn reset(&mut self) {
        assert!(
            self.state.is_terminal(),
            "reset of non-terminal operation ({:?})",
            self.state
        );
        self.state = OpState::Spooled;
    }
}

impl Default for OpStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpState::Spooled => "SPOOLED",
            OpState::Working => "WORKING",
            OpState::CancelSpooled => "CANCEL_SPOOLED",
            OpState::CancelWorking => "CANCEL_WORKING",
            OpState::Complete => "COMPLETE",
            OpState::Terminal => "TERMINAL",
            OpState::Invalid => "INVALID",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OpEvent::*;
    use OpState::*;

    /// The full table, enumerated pair by pair.
    #[test]
    fn test_transition_table_exhaustive() {
        let expect = [
            // (state, submission, completion, notification, cancel)
            (Spooled,       Working,       Invalid,  Invalid,  Complete),
            (Working,       Invalid,       Complete, Invalid,  CancelSpooled),
            (CancelSpooled, CancelWorking, Invalid,  Invalid,  Invalid),
            (CancelWorking, Invalid,       Complete, Invalid,  Invalid),
            (Complete,      Invalid,       Invalid,  Terminal, Invalid),
            (Terminal,      Invalid,       Invalid,  Invalid,  Invalid),
            (Invalid,       Invalid,       Invalid,  Invalid,  Invalid),
        ];
        for (state, on_sub, on_comp, on_note, on_cancel) in expect {
            assert_eq!(transition(state, Submission), on_sub, "{:?} x Submission", state);
            assert_eq!(transition(state, Completion), on_comp, "{:?} x Completion", state);
            assert_eq!(transition(state, Notification), on_note, "{:?} x Notification", state);
            assert_eq!(transition(state, Cancel), on_cancel, "{:?} x Cancel", state);
        }
    }

    #[test]
    fn test_actions() {
        assert_eq!(action_for(Spooled), OpAction::Submit);
        assert_eq!(action_for(Working), OpAction::Wait);
        assert_eq!(action_for(CancelSpooled), OpAction::Submit);
        assert_eq!(action_for(CancelWorking), OpAction::Wait);
        assert_eq!(action_for(Complete), OpAction::Notify);
        assert_eq!(action_for(Terminal), OpAction::Remove);
        assert_eq!(action_for(Invalid), OpAction::Panic);
    }

    #[test]
    fn test_happy_path() {
        let mut sm = OpStateMachine::new();
        assert_eq!(sm.state(), Spooled);
        sm.handle_event(Submission);
        assert_eq!(sm.state(), Working);
        sm.handle_event(Completion);
        assert_eq!(sm.state(), Complete);
        sm.handle_event(Notification);
        assert_eq!(sm.state(), Terminal);
        assert_eq!(sm.action(), OpAction::Remove);
    }

    #[test]
    fn test_cancel_before_submit_short_circuits() {
        let mut sm = OpStateMachine::new();
        sm.handle_event(Cancel);
        assert_eq!(sm.state(), Complete);
        sm.handle_event(Notification);
        assert_eq!(sm.state(), Terminal);
    }

    #[test]
    fn test_cancel_while_working() {
        let mut sm = OpStateMachine::new();
        sm.handle_event(Submission);
        sm.handle_event(Cancel);
        assert_eq!(sm.state(), CancelSpooled);
        assert_eq!(sm.action(), OpAction::Submit);
        sm.handle_event(Submission);
        assert_eq!(sm.state(), CancelWorking);
        sm.handle_event(Completion);
        assert_eq!(sm.state(), Complete);
    }

    #[test]
    #[should_panic(expected = "illegal operation event")]
    fn test_double_completion_panics() {
        let mut sm = OpStateMachine::new();
        sm.handle_event(Submission);
        sm.handle_event(Completion);
        sm.handle_event(Completion);
    }

    #[test]
    fn test_reset_for_reuse() {
        let mut sm = OpStateMachine::new();
        sm.handle_event(Submission);
        sm.handle_event(Completion);
        sm.handle_event(Notification);
        sm.reset();
        assert_eq!(sm.state(), Spooled);
    }

    #[test]
    #[should_panic(expected = "reset of non-terminal")]
    fn test_reset_live_operation_panics() {
        let mut sm = OpStateMachine::new();
        sm.handle_event(Submission);
        sm.reset();
    }
}
