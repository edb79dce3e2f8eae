//! Agent endpoint
//!
//! One `Agent` per target: it spawns the worker once, keeps the long-lived
//! control channel and hands a fresh channel endpoint to the worker for every
//! new session.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Weak;

use nix::unistd::getuid;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Session, SessionListener};
use crate::channel::{ChannelError, ControlChannel};
use crate::config::{AgentSettings, Settings};
use crate::process::{CommandSpawner, SpawnError, SpawnPlan, WorkerSpawner};
use crate::protocol::{ControlMessage, ProtocolError, AGENT_CHANNEL_SLOT};

/// Present inside a Flatpak sandbox
pub const FLATPAK_INFO: &str = "/.flatpak-info";

/// Where the host filesystem is mounted inside toolbox-style containers
pub const HOST_MOUNT: &str = "/run/host";

/// Label used for the host agent
pub const HOST_LABEL: &str = "host";

/// Errors that can occur while talking to an agent
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent worker: {0}")]
    SpawnFailed(#[from] SpawnError),

    #[error("Cannot locate the agent worker program: {0}")]
    ProgramNotFound(#[source] io::Error),

    #[error("Agent channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Where the worker runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentTarget {
    Host,
    Container(String),
}

impl AgentTarget {
    /// Host when no container name is given
    pub fn from_container(name: Option<String>) -> Self {
        match name {
            Some(name) => AgentTarget::Container(name),
            None => AgentTarget::Host,
        }
    }

    /// Label passed to the worker and used in logs
    pub fn label(&self) -> &str {
        match self {
            AgentTarget::Host => HOST_LABEL,
            AgentTarget::Container(name) => name,
        }
    }
}

/// A running agent worker
#[derive(Debug)]
pub struct Agent {
    id: Uuid,
    target: AgentTarget,
    argv: Vec<String>,
    pid: Option<u32>,
    channel: ControlChannel,
    session_env: BTreeMap<String, String>,
}

impl Agent {
    /// Spawn a worker process for `target`
    pub fn spawn(target: AgentTarget, settings: &Settings) -> AgentResult<Self> {
        Self::spawn_with(target, settings, &CommandSpawner)
    }

    /// Spawn a worker through `spawner`.
    ///
    /// The worker end of a fresh socket pair is inherited at
    /// `AGENT_CHANNEL_SLOT`. Must be called from within a tokio runtime.
    pub fn spawn_with(
        target: AgentTarget,
        settings: &Settings,
        spawner: &dyn WorkerSpawner,
    ) -> AgentResult<Self> {
        let id = Uuid::new_v4();
        let argv = worker_argv(&target, &settings.agent, is_sandboxed())?;
        info!("Spawning agent {} for {}: {}", id, target.label(), argv.join(" "));

        let (ours, theirs) = ControlChannel::socketpair()?;
        let plan = SpawnPlan::new(argv.clone()).with_fd(theirs, AGENT_CHANNEL_SLOT);
        let pid = spawner.spawn(plan)?;
        let channel = ControlChannel::from_fd(ours)?;

        info!("Agent {} started (pid {:?})", id, pid);
        Ok(Self {
            id,
            target,
            argv,
            pid,
            channel,
            session_env: settings.session.env.clone(),
        })
    }

    /// Agent identifier used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Where the worker runs
    pub fn target(&self) -> &AgentTarget {
        &self.target
    }

    /// Command line the worker was started with
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Worker pid, when the spawner knows it
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Open a new session on this agent.
    ///
    /// Returns as soon as the handoff is queued; the worker picks it up
    /// asynchronously. The agent only keeps a weak reference to `listener`.
    pub fn create_session(&self, listener: Weak<dyn SessionListener>) -> AgentResult<Session> {
        let (ours, theirs) = ControlChannel::socketpair()?;
        let handoff = ControlMessage::SessionHandoff.encode()?;
        self.channel.send(&handoff, vec![theirs])?;

        let session = Session::new(
            ControlChannel::from_fd(ours)?,
            listener,
            self.session_env.clone(),
        );
        debug!("Agent {} handed off session {}", self.id, session.id());
        Ok(session)
    }

    /// Resolves once the worker has gone away
    pub async fn closed(&self) {
        loop {
            match self.channel.recv().await {
                Ok(Some(datagram)) => {
                    // Dropping the datagram closes anything it carried.
                    warn!(
                        "Agent {} sent an unexpected message with {} fds",
                        self.id,
                        datagram.fds.len()
                    );
                }
                Ok(None) => {
                    info!("Agent {} for {} exited", self.id, self.target.label());
                    return;
                }
                Err(e) => {
                    warn!("Agent {} channel failed: {}", self.id, e);
                    return;
                }
            }
        }
    }
}

/// True inside a Flatpak sandbox
pub fn is_sandboxed() -> bool {
    Path::new(FLATPAK_INFO).exists()
}

/// Build the worker command line for `target`
pub fn worker_argv(
    target: &AgentTarget,
    settings: &AgentSettings,
    sandboxed: bool,
) -> AgentResult<Vec<String>> {
    let program = || match &settings.program {
        Some(program) => Ok(program.clone()),
        None => std::env::current_exe().map_err(AgentError::ProgramNotFound),
    };

    let mut argv = match target {
        AgentTarget::Host if sandboxed => vec![
            "flatpak-spawn".to_string(),
            "--host".to_string(),
            format!("--forward-fd={}", AGENT_CHANNEL_SLOT),
            settings.host_program.clone(),
        ],
        AgentTarget::Host => vec![program()?.display().to_string()],
        AgentTarget::Container(name) => {
            let inside = match &settings.container_program {
                Some(inside) => inside.clone(),
                None => host_path(&program()?),
            };
            vec![
                settings.container_runtime.clone(),
                "exec".to_string(),
                "--interactive".to_string(),
                "--user".to_string(),
                getuid().to_string(),
                // Keeps descriptor 3, counted from the first one after stderr.
                "--preserve-fds=1".to_string(),
                name.clone(),
                inside.display().to_string(),
            ]
        }
    };

    argv.extend([
        "agent".to_string(),
        "--label".to_string(),
        target.label().to_string(),
    ]);
    if let Some(config) = &settings.worker_config {
        let config = match target {
            AgentTarget::Host => config.clone(),
            AgentTarget::Container(_) => host_path(config),
        };
        argv.extend(["--config".to_string(), config.display().to_string()]);
    }
    if settings.worker_verbose {
        argv.push("--verbose".to_string());
    }
    Ok(argv)
}

/// Path of a host file as seen from inside a container
fn host_path(path: &Path) -> PathBuf {
    Path::new(HOST_MOUNT).join(path.strip_prefix("/").unwrap_or(path))
}
