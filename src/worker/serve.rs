//! Worker serve loop
//!
//! The agent channel only ever carries handoffs. Each handoff starts an
//! independent session task; a slow or broken session never holds up the
//! others or the agent channel.

use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::stat::fstat;
use tokio::process::Child;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{exit_status, spawn_on_pty, HostEnv, Launch, PtyChild, TerminalSize};
use super::{WorkerError, WorkerResult};
use crate::channel::{ControlChannel, Datagram};
use crate::config::WorkerSettings;
use crate::protocol::{ControlMessage, AGENT_CHANNEL_SLOT};

/// Adopt the control channel inherited at `AGENT_CHANNEL_SLOT`.
///
/// Fails unless the slot holds a socket. Call at most once, from within a
/// tokio runtime.
pub fn inherited_channel() -> WorkerResult<ControlChannel> {
    let stat = fstat(AGENT_CHANNEL_SLOT).map_err(|_| WorkerError::NotASocket(AGENT_CHANNEL_SLOT))?;
    if stat.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err(WorkerError::NotASocket(AGENT_CHANNEL_SLOT));
    }

    // SAFETY: the slot holds an open socket that nothing else in this process
    // has claimed.
    let fd = unsafe { OwnedFd::from_raw_fd(AGENT_CHANNEL_SLOT) };
    fcntl(AGENT_CHANNEL_SLOT, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| WorkerError::Channel(e.into()))?;
    Ok(ControlChannel::from_fd(fd)?)
}

/// Accept handoffs until the client closes the agent channel, then wait for
/// the sessions still running.
pub async fn serve(channel: ControlChannel, settings: Arc<WorkerSettings>) -> WorkerResult<()> {
    let mut sessions = JoinSet::new();
    let mut accepted: u64 = 0;

    loop {
        tokio::select! {
            received = channel.recv() => {
                let Some(datagram) = received? else {
                    break;
                };
                if let Some(endpoint) = accept(datagram) {
                    accepted += 1;
                    let id = accepted;
                    let settings = Arc::clone(&settings);
                    sessions.spawn(async move {
                        match run_session(endpoint, &settings, id).await {
                            Ok(()) => debug!("Session {} finished", id),
                            Err(e) => warn!("Session {} failed: {}", id, e),
                        }
                    });
                }
            }
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    warn!("Session task failed: {}", e);
                }
            }
        }
    }

    info!(
        "Client closed the agent channel after {} sessions; {} still running",
        accepted,
        sessions.len()
    );
    while let Some(joined) = sessions.join_next().await {
        if let Err(e) = joined {
            warn!("Session task failed: {}", e);
        }
    }
    Ok(())
}

/// Turn a handoff into a session channel; anything else is dropped
fn accept(datagram: Datagram) -> Option<ControlChannel> {
    let Datagram { payload, mut fds } = datagram;
    match ControlMessage::decode(&payload) {
        Ok(ControlMessage::SessionHandoff) if fds.len() == 1 => {
            let endpoint = fds.pop()?;
            match ControlChannel::from_fd(endpoint) {
                Ok(channel) => Some(channel),
                Err(e) => {
                    warn!("Cannot adopt session channel: {}", e);
                    None
                }
            }
        }
        Ok(other) => {
            warn!(
                "Ignoring {} with {} fds on the agent channel",
                other.kind(),
                fds.len()
            );
            None
        }
        Err(e) => {
            warn!("Ignoring malformed message on the agent channel: {}", e);
            None
        }
    }
}

/// One session: start request, PTY, exit status, close
async fn run_session(
    channel: ControlChannel,
    settings: &WorkerSettings,
    id: u64,
) -> WorkerResult<()> {
    let Some(datagram) = channel.recv().await? else {
        debug!("Session {} closed before starting", id);
        return Ok(());
    };

    let request = match ControlMessage::decode(&datagram.payload)? {
        ControlMessage::StartRequest(request) => request,
        other => return Err(WorkerError::NotStarted(other.kind())),
    };
    request.validate()?;

    let launch = Launch::resolve(request, datagram.fds, settings, &HostEnv::current());
    info!(
        "Session {} starting {} {:?} in {}",
        id,
        launch.program,
        launch.args,
        launch.cwd.display()
    );
    let PtyChild { master, mut child } = spawn_on_pty(launch, TerminalSize::from(settings))?;

    channel.send(&ControlMessage::PtyReady.encode()?, vec![master])?;

    let status = wait_for_exit(&channel, &mut child, id).await?;
    info!("Session {} process exited with status {}", id, status);
    channel.send(&ControlMessage::exited(status).encode()?, Vec::new())?;
    Ok(())
}

/// Wait for the child while draining the channel.
///
/// Nothing is expected from the client once the process runs; a closed client
/// does not stop the process.
async fn wait_for_exit(channel: &ControlChannel, child: &mut Child, id: u64) -> WorkerResult<i32> {
    let mut client_open = true;
    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(WorkerError::WaitFailed)?;
                return Ok(exit_status(status));
            }
            received = channel.recv(), if client_open => match received {
                Ok(Some(datagram)) => {
                    let kind = ControlMessage::decode(&datagram.payload)
                        .map(|message| message.kind())
                        .unwrap_or("malformed message");
                    warn!(
                        "Session {} ignoring {} with {} fds after start",
                        id,
                        kind,
                        datagram.fds.len()
                    );
                }
                Ok(None) => {
                    debug!("Session {} client went away; waiting for the process", id);
                    client_open = false;
                }
                Err(e) => {
                    warn!("Session {} channel failed: {}", id, e);
                    client_open = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{Recorded, RecordingListener};
    use crate::agent::{Agent, AgentTarget, SessionListener};
    use crate::config::Settings;
    use crate::process::{SpawnPlan, SpawnResult, WorkerSpawner};
    use crate::protocol::{ProtocolError, StartRequest, PROTOCOL_VERSION};
    use std::fs::File;
    use std::io::{Read, Write};
    use std::path::PathBuf;
    use std::sync::Weak;
    use std::time::Duration;

    /// Runs the real worker loop in this process
    struct InProcessSpawner {
        settings: Arc<WorkerSettings>,
    }

    impl WorkerSpawner for InProcessSpawner {
        fn spawn(&self, mut plan: SpawnPlan) -> SpawnResult<Option<u32>> {
            let mapping = plan.inherit.pop().unwrap();
            assert_eq!(mapping.slot, AGENT_CHANNEL_SLOT);
            let channel = ControlChannel::from_fd(mapping.fd).unwrap();
            tokio::spawn(serve(channel, Arc::clone(&self.settings)));
            Ok(None)
        }
    }

    fn agent(worker: WorkerSettings) -> Agent {
        let mut settings = Settings::default();
        settings.agent.program = Some(PathBuf::from("/usr/bin/boxi"));
        let spawner = InProcessSpawner {
            settings: Arc::new(worker),
        };
        Agent::spawn_with(AgentTarget::Host, &settings, &spawner).unwrap()
    }

    fn listen(listener: &Arc<RecordingListener>) -> Weak<dyn SessionListener> {
        Arc::downgrade(listener) as Weak<dyn SessionListener>
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// Read from a PTY master until `needle` shows up or the terminal closes
    async fn read_until(pty: OwnedFd, needle: &'static str) -> String {
        let reader = tokio::task::spawn_blocking(move || {
            let mut file = File::from(pty);
            let mut output = Vec::new();
            let mut buffer = [0u8; 1024];
            while !String::from_utf8_lossy(&output).contains(needle) {
                match file.read(&mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => output.extend_from_slice(&buffer[..n]),
                }
            }
            String::from_utf8_lossy(&output).into_owned()
        });
        tokio::time::timeout(Duration::from_secs(10), reader)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_command_exit_status() {
        let agent = agent(WorkerSettings::default());
        let listener = RecordingListener::new();
        let session = agent.create_session(listen(&listener)).unwrap();

        session
            .start_command(strings(&["sh", "-c", "exit 3"]), None, Vec::new())
            .unwrap();
        listener.wait_closed().await;

        assert_eq!(
            listener.events(),
            vec![Recorded::Created, Recorded::Exited(3), Recorded::Closed]
        );
        let pty = listener.take_pty().unwrap();
        assert!(nix::unistd::isatty(std::os::fd::AsRawFd::as_raw_fd(&pty)).unwrap());
    }

    #[tokio::test]
    async fn test_login_shell_in_directory() {
        let agent = agent(WorkerSettings {
            shell: Some("/bin/sh".to_string()),
            ..WorkerSettings::default()
        });
        let listener = RecordingListener::new();
        let session = agent.create_session(listen(&listener)).unwrap();
        session.start_shell(Some("/tmp".to_string())).unwrap();

        let pty = listener.wait_created().await;
        let mut input = File::from(pty.try_clone().unwrap());
        input.write_all(b"pwd; exit\n").unwrap();

        let output = read_until(pty, "/tmp").await;
        assert!(output.contains("/tmp"));

        listener.wait_closed().await;
        assert_eq!(
            listener.events(),
            vec![Recorded::Created, Recorded::Exited(0), Recorded::Closed]
        );
    }

    #[tokio::test]
    async fn test_signal_is_reported_negative() {
        let agent = agent(WorkerSettings::default());
        let listener = RecordingListener::new();
        let session = agent.create_session(listen(&listener)).unwrap();

        session
            .start_command(strings(&["sh", "-c", "kill -KILL $$"]), None, Vec::new())
            .unwrap();
        listener.wait_closed().await;
        assert_eq!(
            listener.events(),
            vec![Recorded::Created, Recorded::Exited(-9), Recorded::Closed]
        );
    }

    #[tokio::test]
    async fn test_missing_program_closes_without_pty() {
        let agent = agent(WorkerSettings::default());
        let listener = RecordingListener::new();
        let session = agent.create_session(listen(&listener)).unwrap();

        session
            .start_command(strings(&["/nonexistent/boxi-command"]), None, Vec::new())
            .unwrap();
        listener.wait_closed().await;
        assert_eq!(listener.events(), vec![Recorded::Closed]);
    }

    #[tokio::test]
    async fn test_unsupported_version_closes_without_pty() {
        let mut request = StartRequest::new(strings(&["true"]));
        request.version = PROTOCOL_VERSION + 1;

        let (client, worker) = ControlChannel::pair().unwrap();
        client
            .send(&ControlMessage::start(request).encode().unwrap(), Vec::new())
            .unwrap();

        let result = run_session(worker, &WorkerSettings::default(), 1).await;
        assert!(matches!(
            result,
            Err(WorkerError::Protocol(ProtocolError::UnsupportedVersion(2)))
        ));
        assert!(client.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_start_message_closes_session() {
        let (client, worker) = ControlChannel::pair().unwrap();
        client
            .send(&ControlMessage::exited(0).encode().unwrap(), Vec::new())
            .unwrap();

        let result = run_session(worker, &WorkerSettings::default(), 1).await;
        assert!(matches!(result, Err(WorkerError::NotStarted("process_exited"))));
        assert!(client.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pager_reads_from_pipe() {
        let agent = agent(WorkerSettings {
            pager: Some("cat".to_string()),
            ..WorkerSettings::default()
        });
        let listener = RecordingListener::new();
        let session = agent.create_session(listen(&listener)).unwrap();

        let mut stream = session.open_editor().unwrap();
        stream.write_all(b"hello from the pipe").unwrap();
        drop(stream);

        let pty = listener.wait_created().await;
        let output = read_until(pty, "hello from the pipe").await;
        assert!(output.contains("hello from the pipe"));

        listener.wait_closed().await;
        assert_eq!(
            listener.events(),
            vec![Recorded::Created, Recorded::Exited(0), Recorded::Closed]
        );
    }

    #[tokio::test]
    async fn test_aux_descriptor_at_slot_three() {
        let agent = agent(WorkerSettings::default());
        let listener = RecordingListener::new();
        let session = agent.create_session(listen(&listener)).unwrap();

        let (reader, writer) =
            nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
        session
            .start_command(
                strings(&["sh", "-c", "echo inherited >&3"]),
                None,
                vec![writer],
            )
            .unwrap();
        listener.wait_closed().await;

        let mut text = String::new();
        File::from(reader).read_to_string(&mut text).unwrap();
        assert_eq!(text, "inherited\n");
    }

    #[tokio::test]
    async fn test_concurrent_sessions() {
        let agent = agent(WorkerSettings::default());
        let slow = RecordingListener::new();
        let fast = RecordingListener::new();
        let slow_session = agent.create_session(listen(&slow)).unwrap();
        let fast_session = agent.create_session(listen(&fast)).unwrap();

        slow_session
            .start_command(strings(&["sh", "-c", "sleep 1; exit 4"]), None, Vec::new())
            .unwrap();
        fast_session
            .start_command(strings(&["sh", "-c", "exit 5"]), None, Vec::new())
            .unwrap();

        fast.wait_closed().await;
        assert!(!slow.events().contains(&Recorded::Closed));
        slow.wait_closed().await;

        assert!(fast.events().contains(&Recorded::Exited(5)));
        assert!(slow.events().contains(&Recorded::Exited(4)));
    }

    #[tokio::test]
    async fn test_serve_ignores_stray_messages() {
        let (client, worker) = ControlChannel::pair().unwrap();
        let server = tokio::spawn(serve(worker, Arc::new(WorkerSettings::default())));

        client.send(b"\"pty\"", Vec::new()).unwrap();
        client.send(b"{broken", Vec::new()).unwrap();
        client.send(b" ", Vec::new()).unwrap();
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
