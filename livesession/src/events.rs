/// Session state tracking and progress notification
///
/// Every state change of a debug session goes through [`SessionEvents`],
/// which records it and hands a [`ProgressEvent`] to each registered
/// callback so a host UI can follow along.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

const MAX_HISTORY: usize = 1000;

/// Phase of a debug session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    TunnelPending,
    TerminalStarting,
    ProbingLiveness,
    Attaching,
    Debugging,
    Restarting,
    Detaching,
    /// Ended cleanly
    Terminated,
    /// Ended by a probe, attach or process error
    Failed,
    /// Ended by the user
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Terminated | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::TunnelPending => "waiting for tunnel",
            SessionState::TerminalStarting => "starting terminal",
            SessionState::ProbingLiveness => "waiting for debugger",
            SessionState::Attaching => "attaching",
            SessionState::Debugging => "debugging",
            SessionState::Restarting => "restarting",
            SessionState::Detaching => "detaching",
            SessionState::Terminated => "terminated",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One phase notification for the host UI
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub phase: SessionState,
    pub message: String,
    pub timestamp: SystemTime,
}

type ProgressCallback = Box<dyn Fn(&ProgressEvent) + Send + Sync>;

struct EventsInner {
    state: SessionState,
    history: Vec<ProgressEvent>,
}

/// Shared state holder; clones observe the same session
#[derive(Clone)]
pub struct SessionEvents {
    inner: Arc<Mutex<EventsInner>>,
    callbacks: Arc<Mutex<Vec<ProgressCallback>>>,
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEvents {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventsInner {
                state: SessionState::Idle,
                history: Vec::new(),
            })),
            callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a callback for every subsequent transition
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().push(Box::new(callback));
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn history(&self) -> Vec<ProgressEvent> {
        self.inner.lock().unwrap().history.clone()
    }

    /// Move to `next` unless the session already ended.
    ///
    /// Returns false when the transition was refused.
    pub fn transition(&self, next: SessionState, message: impl Into<String>) -> bool {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                log::debug!("Ignoring transition to {:?} after {:?}", next, inner.state);
                return false;
            }
            inner.state = next;
            let event = ProgressEvent {
                phase: next,
                message: message.into(),
                timestamp: SystemTime::now(),
            };
            inner.history.push(event.clone());
            if inner.history.len() > MAX_HISTORY {
                inner.history.remove(0);
            }
            event
        };

        log::info!("Session {}: {}", event.phase, event.message);
        for callback in self.callbacks.lock().unwrap().iter() {
            callback(&event);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_transitions_are_recorded_and_broadcast() {
        let events = SessionEvents::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.on_progress(move |event| sink.lock().unwrap().push(event.phase));

        assert_eq!(events.state(), SessionState::Idle);
        assert!(events.transition(SessionState::TunnelPending, "opening tunnel"));
        assert!(events.transition(SessionState::TerminalStarting, "starting"));

        assert_eq!(events.state(), SessionState::TerminalStarting);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![SessionState::TunnelPending, SessionState::TerminalStarting]
        );
        assert_eq!(events.history()[0].message, "opening tunnel");
    }

    #[test]
    fn test_terminal_state_is_final() {
        let events = SessionEvents::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        events.on_progress(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(events.transition(SessionState::Cancelled, "user stopped the session"));
        assert!(!events.transition(SessionState::Failed, "late failure"));
        assert!(!events.transition(SessionState::Debugging, "late probe success"));
        assert_eq!(events.state(), SessionState::Cancelled);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let events = SessionEvents::new();
        for i in 0..(MAX_HISTORY + 5) {
            events.transition(SessionState::Restarting, format!("restart {}", i));
        }
        let history = events.history();
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history[0].message, "restart 5");
    }
}
