//! Control protocol module
//!
//! Message shapes exchanged between clients, the agent worker and its
//! per-session workers, with their wire encoding and validation rules.

#[allow(dead_code)]
mod message;

pub use message::*;
