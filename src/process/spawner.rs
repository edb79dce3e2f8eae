//! Worker spawner
//!
//! The agent never forks directly; it describes the child it wants as a
//! `SpawnPlan` and hands it to a `WorkerSpawner`. Tests substitute a spawner
//! that runs the worker in-process.

use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use super::{FdMapping, RemapPlan};

/// Errors that can occur while spawning a child
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Empty command line")]
    EmptyCommand,

    #[error("Descriptor slot {0} assigned twice")]
    DuplicateSlot(RawFd),

    #[error("Failed to spawn {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Result type for spawn operations
pub type SpawnResult<T> = Result<T, SpawnError>;

/// Everything needed to start a child process
#[derive(Debug)]
pub struct SpawnPlan {
    /// Program followed by its arguments
    pub argv: Vec<String>,
    /// Descriptors the child inherits, by slot
    pub inherit: Vec<FdMapping>,
}

impl SpawnPlan {
    /// Create a plan with no inherited descriptors
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            inherit: Vec::new(),
        }
    }

    /// Add a descriptor at a fixed slot
    pub fn with_fd(mut self, fd: OwnedFd, slot: RawFd) -> Self {
        self.inherit.push(FdMapping::new(fd, slot));
        self
    }

    /// Program name, if any
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

/// Launches agent worker processes
pub trait WorkerSpawner: Send + Sync {
    /// Start the child described by `plan`, returning its pid when known.
    ///
    /// Inherited descriptors are consumed: the parent's copies are closed once
    /// this returns.
    fn spawn(&self, plan: SpawnPlan) -> SpawnResult<Option<u32>>;
}

/// Spawns real child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, plan: SpawnPlan) -> SpawnResult<Option<u32>> {
        let SpawnPlan { argv, inherit } = plan;
        let (program, args) = argv.split_first().ok_or(SpawnError::EmptyCommand)?;
        let mut remap = RemapPlan::new(&inherit)?;

        let mut command = Command::new(program);
        command.args(args).stdin(Stdio::null());

        // SAFETY: `apply` only calls fcntl and dup2, both async-signal-safe.
        unsafe {
            command.pre_exec(move || remap.apply());
        }

        // The tokio runtime reaps the child once its handle is dropped.
        let child = command.spawn().map_err(|source| SpawnError::Io {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        debug!("Spawned {} (pid {:?}) with {} inherited fds", program, pid, inherit.len());

        drop(inherit);
        Ok(pid)
    }
}
