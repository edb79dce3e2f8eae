//! Session state machine
//!
//! ```text
//! AwaitingStart --pty_ready--> Running --process_exited--> Exited
//!       |                         |                          |
//!       +-------- end_of_stream --+------------------------> Closed
//! ```
//!
//! `AwaitingStart --process_exited--> Exited` is also accepted: a worker may
//! report a status without ever attaching a terminal.

use thiserror::Error;

/// Lifecycle state of a session as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Channel exists, no PTY yet
    AwaitingStart,
    /// PTY delivered to the listener
    Running,
    /// Process exit reported; channel may still be open briefly
    Exited,
    /// Channel gone; nothing further is delivered
    Closed,
}

/// Something the worker side did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    PtyReady,
    ProcessExited,
    EndOfStream,
}

/// A message that does not fit the conversation.
///
/// Violations are reported and the offending message dropped; they never
/// tear down the channel by themselves.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("{event:?} is not valid in state {state:?}")]
    UnexpectedEvent {
        state: SessionState,
        event: SessionEvent,
    },

    #[error("{kind} is never sent in this direction")]
    WrongDirection { kind: &'static str },

    #[error("{kind} arrived with {count} descriptors")]
    DescriptorCount { kind: &'static str, count: usize },

    #[error("Malformed message: {0}")]
    Malformed(String),
}

impl SessionState {
    /// Compute the state after `event`, or the violation it represents
    pub fn on(self, event: SessionEvent) -> Result<SessionState, ProtocolViolation> {
        match (self, event) {
            (_, SessionEvent::EndOfStream) => Ok(SessionState::Closed),
            (SessionState::AwaitingStart, SessionEvent::PtyReady) => Ok(SessionState::Running),
            (SessionState::AwaitingStart | SessionState::Running, SessionEvent::ProcessExited) => {
                Ok(SessionState::Exited)
            }
            (state, event) => Err(ProtocolViolation::UnexpectedEvent { state, event }),
        }
    }

    /// True once the process has exited or the channel has closed
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Exited | SessionState::Closed)
    }
}
