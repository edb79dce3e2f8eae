//! Control channel module
//!
//! Local, ordered, message-oriented transport that carries a small payload plus
//! file descriptors in every message. Built on `AF_UNIX`/`SOCK_SEQPACKET`
//! socket pairs with `SCM_RIGHTS` ancillary data.

#[allow(dead_code)]
mod socket;

pub use socket::*;
