//! Listener trait abstraction for pluggable transport front-ends

use crate::command::ListenerBoard;
use crate::error::AgentError;
use async_trait::async_trait;
use deskctl_shared::state_machine::{ListenerEvent, ListenerState, ListenerStateMachine, TransitionResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, warn};

/// A transport front-end that serves requests until stopped
#[async_trait]
pub trait Listener: Send + Sync {
    /// Human-readable name for this listener
    fn name(&self) -> &'static str;

    /// Current lifecycle state
    fn state(&self) -> ListenerState;

    /// Bind and serve. Resolves once the listener has drained after
    /// [`Listener::stop`], or with an error if binding or serving fails.
    async fn start(&self) -> Result<(), AgentError>;

    /// Ask the serve loop to stop accepting work and drain
    async fn stop(&self);
}

/// State machine plus stop signal shared by every listener implementation
pub struct ListenerControl {
    name: &'static str,
    machine: Mutex<ListenerStateMachine>,
    stop_tx: watch::Sender<bool>,
    board: Arc<ListenerBoard>,
}

impl ListenerControl {
    pub fn new(name: &'static str, board: Arc<ListenerBoard>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        board.set(name, ListenerState::Stopped);
        Self {
            name,
            machine: Mutex::new(ListenerStateMachine::new()),
            stop_tx,
            board,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.machine().state()
    }

    fn machine(&self) -> MutexGuard<'_, ListenerStateMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, machine: &mut ListenerStateMachine, event: ListenerEvent) -> bool {
        match machine.process_event(event) {
            TransitionResult::Success(state) => {
                debug!(listener = self.name, %state, "listener state changed");
                self.board.set(self.name, state);
                true
            }
            TransitionResult::Invalid { from, event } => {
                debug!(listener = self.name, %from, ?event, "ignored listener event");
                false
            }
        }
    }

    /// Enter `Starting`; fails if the listener is already active.
    ///
    /// The returned receiver flips to `true` when a stop is requested. A stop
    /// that arrived before `begin` is already visible on it, and the listener
    /// goes straight to `Stopping`.
    pub fn begin(&self) -> Result<watch::Receiver<bool>, AgentError> {
        let mut machine = self.machine();
        if !self.apply(&mut machine, ListenerEvent::StartRequested) {
            return Err(AgentError::ListenerStartFailed {
                listener: self.name,
                reason: format!("already {}", machine.state()),
            });
        }
        let stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            self.apply(&mut machine, ListenerEvent::StopRequested);
        }
        Ok(stop_rx)
    }

    /// Enter `Running` once the socket or session is up
    pub fn bound(&self) {
        let mut machine = self.machine();
        self.apply(&mut machine, ListenerEvent::Bound);
    }

    /// Enter `Stopping` and signal the serve loop
    ///
    /// On a stopped listener the request is kept and consumed by the next
    /// [`ListenerControl::begin`].
    pub fn request_stop(&self) {
        let mut machine = self.machine();
        if self.apply(&mut machine, ListenerEvent::StopRequested)
            || machine.state() == ListenerState::Stopped
        {
            self.stop_tx.send_replace(true);
        }
    }

    /// Record how the serve loop ended and pass the result through
    pub fn finish(&self, result: Result<(), AgentError>) -> Result<(), AgentError> {
        let mut machine = self.machine();
        self.stop_tx.send_replace(false);
        match &result {
            Ok(()) => {
                self.apply(&mut machine, ListenerEvent::Drained);
            }
            Err(e) => {
                warn!(listener = self.name, "listener failed: {}", e);
                self.apply(&mut machine, ListenerEvent::Failed);
            }
        }
        result
    }

    /// Build a start failure for this listener
    pub fn failure(&self, reason: impl std::fmt::Display) -> AgentError {
        AgentError::ListenerStartFailed {
            listener: self.name,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_updates_board() {
        let board = Arc::new(ListenerBoard::default());
        let control = ListenerControl::new("http", board.clone());
        assert_eq!(board.snapshot().get("http"), Some(&ListenerState::Stopped));

        let stop_rx = control.begin().unwrap();
        assert_eq!(control.state(), ListenerState::Starting);
        assert!(!*stop_rx.borrow());

        control.bound();
        assert_eq!(board.snapshot().get("http"), Some(&ListenerState::Running));

        control.request_stop();
        assert!(*stop_rx.borrow());
        assert_eq!(control.state(), ListenerState::Stopping);

        control.finish(Ok(())).unwrap();
        assert_eq!(board.snapshot().get("http"), Some(&ListenerState::Stopped));
    }

    #[test]
    fn test_begin_refuses_active_listener() {
        let control = ListenerControl::new("grpc", Arc::new(ListenerBoard::default()));
        control.begin().unwrap();
        assert!(matches!(
            control.begin(),
            Err(AgentError::ListenerStartFailed { listener: "grpc", .. })
        ));
    }

    #[test]
    fn test_failure_returns_to_stopped() {
        let control = ListenerControl::new("mqtt", Arc::new(ListenerBoard::default()));
        control.begin().unwrap();
        let err = control.finish(Err(control.failure("broker gone"))).unwrap_err();
        assert_eq!(err.to_string(), "mqtt listener failed: broker gone");
        assert_eq!(control.state(), ListenerState::Stopped);

        // Restartable after a failure
        assert!(control.begin().is_ok());
    }

    #[test]
    fn test_stop_before_start_is_remembered() {
        let control = ListenerControl::new("http", Arc::new(ListenerBoard::default()));
        control.request_stop();
        assert_eq!(control.state(), ListenerState::Stopped);

        let stop_rx = control.begin().unwrap();
        assert!(*stop_rx.borrow());
        assert_eq!(control.state(), ListenerState::Stopping);

        control.finish(Ok(())).unwrap();
        assert_eq!(control.state(), ListenerState::Stopped);

        // The stop was consumed by that run
        let stop_rx = control.begin().unwrap();
        assert!(!*stop_rx.borrow());
        assert_eq!(control.state(), ListenerState::Starting);
    }
}
