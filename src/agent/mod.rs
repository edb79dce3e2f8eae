//! Agent and session module
//!
//! Client side of the protocol: spawn an agent worker for a target, open
//! sessions on it and surface each session's lifecycle to a listener.

#[allow(dead_code)]
mod endpoint;
mod listener;
#[allow(dead_code)]
mod session;
#[allow(dead_code)]
mod state;

pub use endpoint::*;
pub use listener::*;
pub use session::*;
pub use state::*;

#[cfg(test)]
pub(crate) use listener::testing;
