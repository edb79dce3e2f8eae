//! Individual session
//!
//! A `Session` is the client side of one conversation with the agent worker:
//! send a single start request, then learn about the PTY, the exit status and
//! the end of the conversation through a `SessionListener`.
//!
//! The channel endpoint is owned by a per-session event task. The handle only
//! keeps a weak reference to it, so once the task sees end-of-stream the
//! descriptor is closed and deregistered no matter how many handles exist.

use std::collections::BTreeMap;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ProtocolViolation, SessionEvent, SessionListener, SessionState};
use crate::channel::{ChannelError, ControlChannel, Datagram};
use crate::protocol::{ControlMessage, ProtocolError, StartRequest, PAGER_COMMAND};

/// Errors that can occur during session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session is closed")]
    Closed,

    #[error("Invalid start request: {0}")]
    Invalid(#[from] ProtocolError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Failed to create pipe: {0}")]
    Pipe(#[from] nix::Error),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Client handle to one session
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    channel: Weak<ControlChannel>,
    state: Arc<Mutex<SessionState>>,
    started: AtomicBool,
    env: BTreeMap<String, String>,
}

impl Session {
    /// Wrap a connected channel endpoint and start its event task.
    ///
    /// `env` is sent with every start request built by this handle. Must be
    /// called from within a tokio runtime.
    pub fn new(
        channel: ControlChannel,
        listener: Weak<dyn SessionListener>,
        env: BTreeMap<String, String>,
    ) -> Self {
        let id = Uuid::new_v4();
        let channel = Arc::new(channel);
        let state = Arc::new(Mutex::new(SessionState::AwaitingStart));

        let events = SessionEvents {
            id,
            state: Arc::clone(&state),
            listener: Some(listener),
        };
        let weak = Arc::downgrade(&channel);
        tokio::spawn(events.run(channel));

        Self {
            id,
            channel: weak,
            state,
            started: AtomicBool::new(false),
            env,
        }
    }

    /// Session identifier used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Run `args` (or a login shell when empty) with the default environment.
    ///
    /// `fds` are handed to the command: the first one becomes stdin for
    /// `_PAGER`, the rest land at slots 3, 4, ... They are closed here once
    /// sent.
    pub fn start_command(
        &self,
        args: Vec<String>,
        cwd: Option<String>,
        fds: Vec<OwnedFd>,
    ) -> SessionResult<()> {
        let request = StartRequest::new(args)
            .with_cwd(cwd)
            .with_env(self.env.clone());
        self.start(request, fds)
    }

    /// Start a login shell
    pub fn start_shell(&self, cwd: Option<String>) -> SessionResult<()> {
        self.start_command(Vec::new(), cwd, Vec::new())
    }

    /// Send a caller-built start request. Allowed once per session.
    pub fn start(
        &self,
        request: StartRequest,
        fds: Vec<OwnedFd>,
    ) -> SessionResult<()> {
        request.validate()?;

        let channel = self.channel.upgrade().ok_or(SessionError::Closed)?;
        if self.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }

        let payload = ControlMessage::start(request).encode()?;
        let count = fds.len();
        if let Err(e) = channel.send(&payload, fds) {
            // Nothing reached the worker, so the session can still be started.
            self.started.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        debug!("Session {} start request sent with {} fds", self.id, count);
        Ok(())
    }

    /// Run the pager on a fresh pipe and return its write end.
    ///
    /// Whatever is written shows up in the session's terminal; dropping the
    /// file ends the pager's input.
    pub fn open_editor(&self) -> SessionResult<File> {
        let (reader, writer) = pipe2(OFlag::O_CLOEXEC)?;
        self.start_command(
            vec![PAGER_COMMAND.to_string(), "-".to_string()],
            None,
            vec![reader],
        )?;
        Ok(File::from(writer))
    }

    /// Shut the channel down. The listener then sees `session_closed`.
    pub fn close(&self) -> SessionResult<()> {
        if let Some(channel) = self.channel.upgrade() {
            channel.shutdown()?;
        }
        Ok(())
    }
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State owned by the event task
struct SessionEvents {
    id: Uuid,
    state: Arc<Mutex<SessionState>>,
    listener: Option<Weak<dyn SessionListener>>,
}

impl SessionEvents {
    async fn run(mut self, channel: Arc<ControlChannel>) {
        loop {
            match channel.recv().await {
                Ok(Some(datagram)) => self.dispatch(datagram),
                Ok(None) => {
                    debug!("Session {} reached end of stream", self.id);
                    break;
                }
                Err(e) => {
                    warn!("Session {} channel failed: {}", self.id, e);
                    break;
                }
            }
        }

        self.close();
        // Last strong reference: closes the endpoint and deregisters it.
        drop(channel);
    }

    fn dispatch(&self, datagram: Datagram) {
        let Datagram { payload, mut fds } = datagram;

        let message = match ControlMessage::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                self.violation(ProtocolViolation::Malformed(e.to_string()));
                return;
            }
        };

        if !message.descriptors().accepts(fds.len()) {
            self.violation(ProtocolViolation::DescriptorCount {
                kind: message.kind(),
                count: fds.len(),
            });
            if matches!(message, ControlMessage::PtyReady) {
                return;
            }
            // Still act on the message; the stray descriptors are closed.
            fds.clear();
        }

        match message {
            ControlMessage::PtyReady => {
                if !self.advance(SessionEvent::PtyReady) {
                    return;
                }
                let Some(pty) = fds.pop() else { return };
                match self.listener() {
                    Some(listener) => {
                        info!("Session {} attached to a terminal", self.id);
                        listener.session_created(pty);
                    }
                    None => debug!("Session {} listener is gone; closing pty", self.id),
                }
            }
            ControlMessage::ProcessExited(status) => {
                if !self.advance(SessionEvent::ProcessExited) {
                    return;
                }
                match self.listener() {
                    Some(listener) => {
                        info!("Session {} process exited with status {}", self.id, status);
                        listener.session_exited(status);
                    }
                    None => debug!("Session {} listener is gone; dropping exit", self.id),
                }
            }
            other => self.violation(ProtocolViolation::WrongDirection { kind: other.kind() }),
        }
    }

    fn advance(&self, event: SessionEvent) -> bool {
        let mut state = lock(&self.state);
        match state.on(event) {
            Ok(next) => {
                *state = next;
                true
            }
            Err(violation) => {
                drop(state);
                self.violation(violation);
                false
            }
        }
    }

    fn violation(&self, violation: ProtocolViolation) {
        warn!("Session {} ignoring message: {}", self.id, violation);
    }

    fn listener(&self) -> Option<Arc<dyn SessionListener>> {
        self.listener.as_ref().and_then(Weak::upgrade)
    }

    fn close(&mut self) {
        *lock(&self.state) = SessionState::Closed;
        match self.listener.take().and_then(|listener| listener.upgrade()) {
            Some(listener) => listener.session_closed(),
            None => debug!("Session {} closed with no listener", self.id),
        }
    }
}
