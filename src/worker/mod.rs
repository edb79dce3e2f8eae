//! Agent worker module
//!
//! The far side of the protocol, run as `boxi agent`: accepts session
//! handoffs on the inherited control channel and runs one command per session
//! on its own PTY.

#[allow(dead_code)]
mod launch;
#[allow(dead_code)]
mod pty;
mod serve;

pub use launch::*;
pub use pty::*;
pub use serve::*;

use std::os::fd::RawFd;
use thiserror::Error;

use crate::channel::ChannelError;
use crate::protocol::ProtocolError;

/// Errors that can occur in the worker
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Descriptor {0} is not a socket")]
    NotASocket(RawFd),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Expected a start request, got {0}")]
    NotStarted(&'static str),

    #[error("Failed to open PTY: {0}")]
    OpenFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to wait for process: {0}")]
    WaitFailed(#[source] std::io::Error),
}

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;
