//! Lifecycle state machines
//!
//! Defines valid transitions for a single listener and for the agent as a
//! whole. Both machines refuse invalid events instead of changing state.

use serde::Serialize;
use std::fmt;

/// State of one protocol listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ListenerState::Stopped => "stopped",
            ListenerState::Starting => "starting",
            ListenerState::Running => "running",
            ListenerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Events that drive a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerEvent {
    /// `start()` was called
    StartRequested,
    /// Network resource acquired, serving requests
    Bound,
    /// `stop()` was called
    StopRequested,
    /// Serve loop returned after a stop
    Drained,
    /// Serve loop failed
    Failed,
}

/// State of the agent process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentPhase::Initializing => "initializing",
            AgentPhase::Running => "running",
            AgentPhase::ShuttingDown => "shutting_down",
            AgentPhase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Events that drive the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    /// All listeners spawned
    ListenersStarted,
    /// Interrupt signal received
    ShutdownRequested,
    /// First fatal listener error
    ListenerFailed,
    /// Wiring failed before anything started
    InitFailed,
    /// Every listener finished within the shutdown budget
    Drained,
    /// Shutdown budget elapsed
    DrainTimedOut,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult<S, E> {
    /// Transition was valid and state changed
    Success(S),
    /// Transition was invalid from current state
    Invalid { from: S, event: E },
}

impl<S, E> TransitionResult<S, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, TransitionResult::Success(_))
    }
}

/// Lifecycle of one listener: Stopped -> Starting -> Running -> Stopping -> Stopped
#[derive(Debug)]
pub struct ListenerStateMachine {
    current_state: ListenerState,
}

impl Default for ListenerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerStateMachine {
    /// Create a new state machine in Stopped state
    pub fn new() -> Self {
        Self {
            current_state: ListenerState::Stopped,
        }
    }

    /// Get current state
    pub fn state(&self) -> ListenerState {
        self.current_state
    }

    /// Process an event and return the transition result
    pub fn process_event(
        &mut self,
        event: ListenerEvent,
    ) -> TransitionResult<ListenerState, ListenerEvent> {
        use ListenerEvent::*;
        use ListenerState::*;

        let next = match (self.current_state, event) {
            (Stopped, StartRequested) => Some(Starting),
            (Starting, Bound) => Some(Running),
            (Starting | Running, StopRequested) => Some(Stopping),
            (Stopping, Drained) => Some(Stopped),
            // A serve loop may also end on its own
            (Running, Drained) => Some(Stopped),
            (Starting | Running | Stopping, Failed) => Some(Stopped),
            _ => None,
        };

        match next {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }
}

/// Lifecycle of the agent: Initializing -> Running -> ShuttingDown -> Stopped
#[derive(Debug)]
pub struct AgentStateMachine {
    current_state: AgentPhase,
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentStateMachine {
    /// Create a new state machine in Initializing state
    pub fn new() -> Self {
        Self {
            current_state: AgentPhase::Initializing,
        }
    }

    /// Get current state
    pub fn state(&self) -> AgentPhase {
        self.current_state
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: AgentEvent) -> TransitionResult<AgentPhase, AgentEvent> {
        use AgentEvent::*;
        use AgentPhase::*;

        let next = match (self.current_state, event) {
            (Initializing, ListenersStarted) => Some(Running),
            (Initializing, InitFailed) => Some(Stopped),
            (Running, ShutdownRequested | ListenerFailed) => Some(ShuttingDown),
            (ShuttingDown, Drained | DrainTimedOut) => Some(Stopped),
            _ => None,
        };

        match next {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }
}
