//! PTY process spawning
//!
//! Starts a resolved launch on a fresh pseudo-terminal:
//! - The child is a new session leader with the slave as controlling terminal
//! - stdin/stdout/stderr are the slave, then the inheritance table is applied
//! - The caller keeps only the master

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::termios::Termios;
use tokio::process::{Child, Command};
use tracing::debug;

use super::{Launch, WorkerError, WorkerResult};
use crate::config::WorkerSettings;
use crate::process::RemapPlan;

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Convert to the kernel's window size record
    fn to_winsize(self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

impl From<&WorkerSettings> for TerminalSize {
    fn from(settings: &WorkerSettings) -> Self {
        Self::new(settings.cols, settings.rows)
    }
}

/// A process running on a PTY
#[derive(Debug)]
pub struct PtyChild {
    /// Master side of the terminal
    pub master: OwnedFd,
    /// Handle used to wait for the process
    pub child: Child,
}

/// Spawn `launch` on a new PTY.
///
/// The inherited descriptors in `launch` are closed in this process once the
/// child has them.
pub fn spawn_on_pty(launch: Launch, size: TerminalSize) -> WorkerResult<PtyChild> {
    let pair = openpty(Some(&size.to_winsize()), None::<&Termios>)
        .map_err(|e| WorkerError::OpenFailed(e.to_string()))?;
    set_cloexec(&pair.master)?;
    set_cloexec(&pair.slave)?;

    let Launch {
        program,
        args,
        arg0,
        cwd,
        env,
        inherit,
    } = launch;

    let stdio = |fd: &OwnedFd| -> WorkerResult<Stdio> {
        let copy = fd
            .try_clone()
            .map_err(|e| WorkerError::OpenFailed(e.to_string()))?;
        Ok(Stdio::from(copy))
    };

    let mut command = Command::new(&program);
    command
        .args(&args)
        .current_dir(&cwd)
        .env_clear()
        .envs(&env)
        .stdin(stdio(&pair.slave)?)
        .stdout(stdio(&pair.slave)?)
        .stderr(stdio(&pair.slave)?);
    if let Some(arg0) = &arg0 {
        command.arg0(arg0);
    }

    let slave = pair.slave.as_raw_fd();
    let mut remap = RemapPlan::new(&inherit).map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

    // SAFETY: only async-signal-safe calls run between fork and exec.
    unsafe {
        command.pre_exec(move || {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            remap.apply()
        });
    }

    let child = command
        .spawn()
        .map_err(|e| WorkerError::SpawnFailed(format!("{}: {}", program, e)))?;
    debug!(
        "Spawned {} (pid {:?}) in {} with {} inherited fds",
        program,
        child.id(),
        cwd.display(),
        inherit.len()
    );

    drop(pair.slave);
    drop(inherit);
    Ok(PtyChild {
        master: pair.master,
        child,
    })
}

/// Raw status reported to clients: the exit code, or `-signal`
pub fn exit_status(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}

fn set_cloexec(fd: &OwnedFd) -> WorkerResult<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| WorkerError::OpenFailed(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StartRequest;
    use crate::worker::HostEnv;
    use std::fs::File;
    use std::io::Read;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::time::timeout;

    fn launch(args: &[&str]) -> Launch {
        let request = StartRequest::new(args.iter().map(|s| s.to_string()).collect());
        Launch::resolve(request, Vec::new(), &WorkerSettings::default(), &HostEnv::current())
    }

    /// Read everything from a master until the slave side is gone
    fn drain(master: OwnedFd) -> String {
        let mut file = File::from(master);
        let mut output = Vec::new();
        let mut buffer = [0u8; 1024];
        loop {
            match file.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(n) => output.extend_from_slice(&buffer[..n]),
            }
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    #[test]
    fn test_terminal_size_default() {
        let size = TerminalSize::default();
        assert_eq!(size.cols, 80);
        assert_eq!(size.rows, 24);
    }

    #[test]
    fn test_terminal_size_from_settings() {
        let settings = WorkerSettings {
            cols: 120,
            rows: 40,
            ..WorkerSettings::default()
        };
        assert_eq!(TerminalSize::from(&settings), TerminalSize::new(120, 40));
    }

    #[tokio::test]
    async fn test_exit_code() {
        let mut pty = spawn_on_pty(launch(&["sh", "-c", "exit 3"]), TerminalSize::default()).unwrap();
        let status = timeout(Duration::from_secs(5), pty.child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit_status(status), 3);
    }

    #[tokio::test]
    async fn test_signal_status() {
        let mut pty =
            spawn_on_pty(launch(&["sh", "-c", "kill -TERM $$"]), TerminalSize::default()).unwrap();
        let status = timeout(Duration::from_secs(5), pty.child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit_status(status), -15);
    }

    #[tokio::test]
    async fn test_output_reaches_master() {
        let pty = spawn_on_pty(
            launch(&["sh", "-c", "test -t 0 && test -t 1 && printf hello"]),
            TerminalSize::default(),
        )
        .unwrap();
        let PtyChild { master, mut child } = pty;

        let reader = tokio::task::spawn_blocking(move || drain(master));
        let status = timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit_status(status), 0);

        let output = timeout(Duration::from_secs(5), reader).await.unwrap().unwrap();
        assert!(output.contains("hello"));
    }

    #[tokio::test]
    async fn test_controlling_terminal() {
        // /dev/tty only opens for a process with a controlling terminal.
        let pty = spawn_on_pty(
            launch(&["sh", "-c", "exec 3</dev/tty && printf ctty"]),
            TerminalSize::default(),
        )
        .unwrap();
        let PtyChild { master, mut child } = pty;

        let reader = tokio::task::spawn_blocking(move || drain(master));
        let status = timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit_status(status), 0);

        let output = timeout(Duration::from_secs(5), reader).await.unwrap().unwrap();
        assert!(output.contains("ctty"));
    }

    #[tokio::test]
    async fn test_terminal_size_applied() {
        let pty = spawn_on_pty(launch(&["stty", "size"]), TerminalSize::new(100, 30)).unwrap();
        let PtyChild { master, mut child } = pty;

        let reader = tokio::task::spawn_blocking(move || drain(master));
        timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        let output = timeout(Duration::from_secs(5), reader).await.unwrap().unwrap();
        assert!(output.contains("30 100"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let mut launch = launch(&["/nonexistent/program"]);
        launch.cwd = PathBuf::from("/");
        let result = spawn_on_pty(launch, TerminalSize::default());
        assert!(matches!(result, Err(WorkerError::SpawnFailed(_))));
    }
}
