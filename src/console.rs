//! Console listener
//!
//! Mirrors a session's terminal on the current one for `boxi run`: the PTY is
//! copied to stdout, stdin is copied to the PTY, and the process status
//! becomes this program's exit code. When stdin is a terminal it is switched
//! to raw mode for the session and its window size follows ours.

use std::fmt;
use std::io::{self, IsTerminal};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent::SessionListener;
use crate::protocol::shell_exit_code;

/// How long to keep draining terminal output after the session closes
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Exit code when the session ends without reporting a status
pub const NO_STATUS_EXIT_CODE: u8 = 1;

/// Listener that attaches a session to this process's stdio
#[derive(Debug, Default)]
pub struct ConsoleListener {
    status: Mutex<Option<i32>>,
    output: Mutex<Option<JoinHandle<()>>>,
    raw_mode: Mutex<Option<RawMode>>,
    closed: Notify,
}

impl ConsoleListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the session to close and return the exit code to use
    pub async fn wait(&self) -> u8 {
        self.closed.notified().await;

        let output = self
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(output) = output {
            // A background job may keep the terminal open past the exit.
            if tokio::time::timeout(DRAIN_TIMEOUT, output).await.is_err() {
                debug!("Terminal still open after session closed");
            }
        }
        self.restore_terminal();

        let status = *self.status.lock().unwrap_or_else(PoisonError::into_inner);
        match status {
            Some(status) => shell_exit_code(status),
            None => {
                warn!("Session closed without reporting an exit status");
                NO_STATUS_EXIT_CODE
            }
        }
    }

    /// Put the local terminal back the way it was before the session
    pub fn restore_terminal(&self) {
        self.raw_mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl SessionListener for ConsoleListener {
    fn session_created(&self, pty: OwnedFd) {
        let stdin = io::stdin();
        if stdin.is_terminal() {
            match stdin
                .as_fd()
                .try_clone_to_owned()
                .and_then(RawMode::enter)
            {
                Ok(raw) => {
                    *self.raw_mode.lock().unwrap_or_else(PoisonError::into_inner) = Some(raw);
                }
                Err(e) => warn!("Cannot switch terminal to raw mode: {}", e),
            }
        }

        let handle = tokio::spawn(forward_terminal(pty));
        *self.output.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn session_exited(&self, status: i32) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
    }

    fn session_closed(&self) {
        self.closed.notify_one();
    }
}

/// Copy the PTY to stdout until it closes, feeding stdin in the background
async fn forward_terminal(pty: OwnedFd) {
    let master = std::fs::File::from(pty);
    let input = match master.try_clone() {
        Ok(input) => input,
        Err(e) => {
            warn!("Cannot duplicate terminal: {}", e);
            return;
        }
    };

    // Never joined: reading stdin blocks until the process exits.
    tokio::spawn(async move {
        let mut input = tokio::fs::File::from_std(input);
        if let Err(e) = tokio::io::copy(&mut tokio::io::stdin(), &mut input).await {
            debug!("Stopped forwarding input: {}", e);
        }
    });

    let resize = match master.try_clone() {
        Ok(sized) if io::stdin().is_terminal() => Some(tokio::spawn(follow_window_size(sized))),
        Ok(_) => None,
        Err(e) => {
            debug!("Window size not forwarded: {}", e);
            None
        }
    };

    let mut master = tokio::fs::File::from_std(master);
    let mut stdout = tokio::io::stdout();
    // The master reports EIO once every slave is closed.
    if let Err(e) = tokio::io::copy(&mut master, &mut stdout).await {
        debug!("Terminal closed: {}", e);
    }
    if let Err(e) = stdout.flush().await {
        debug!("Failed to flush stdout: {}", e);
    }
    if let Some(resize) = resize {
        resize.abort();
    }
}

/// Keep the session's terminal the size of ours
async fn follow_window_size(master: std::fs::File) {
    let mut changes = match signal(SignalKind::window_change()) {
        Ok(changes) => Some(changes),
        Err(e) => {
            warn!("Failed to install SIGWINCH handler: {}", e);
            None
        }
    };
    loop {
        if let Err(e) = copy_window_size(io::stdin().as_fd(), master.as_fd()) {
            debug!("Cannot copy window size: {}", e);
        }
        match changes.as_mut() {
            Some(changes) => {
                if changes.recv().await.is_none() {
                    return;
                }
            }
            None => return,
        }
    }
}

fn window_size(fd: BorrowedFd<'_>) -> io::Result<libc::winsize> {
    let mut size = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ only writes a winsize through the pointer.
    if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut size) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(size)
}

/// Give the terminal `to` the window size of the terminal `from`
fn copy_window_size(from: BorrowedFd<'_>, to: BorrowedFd<'_>) -> io::Result<()> {
    let size = window_size(from)?;
    // SAFETY: TIOCSWINSZ only reads a winsize through the pointer.
    if unsafe { libc::ioctl(to.as_raw_fd(), libc::TIOCSWINSZ, &size) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A terminal in raw mode; the saved settings come back on drop
struct RawMode {
    fd: OwnedFd,
    saved: Termios,
}

impl RawMode {
    fn enter(fd: OwnedFd) -> io::Result<Self> {
        let saved = tcgetattr(&fd)?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&fd, SetArg::TCSANOW, &raw)?;
        Ok(Self { fd, saved })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = tcsetattr(&self.fd, SetArg::TCSANOW, &self.saved) {
            warn!("Failed to restore terminal settings: {}", e);
        }
    }
}

impl fmt::Debug for RawMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMode").field("fd", &self.fd).finish_non_exhaustive()
    }
}
