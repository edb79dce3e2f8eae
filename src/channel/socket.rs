//! Sequenced-packet socket endpoint
//!
//! Each `send` is one datagram: the kernel preserves message boundaries and
//! order, so no framing is layered on top. Descriptors ride along as
//! `SCM_RIGHTS` ancillary data and are always close-on-exec on arrival.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    recvmsg, sendmsg, shutdown, socketpair, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, Shutdown, SockFlag, SockType,
};
use thiserror::Error;
use tokio::io::unix::AsyncFd;

/// Largest payload accepted or received in one message
pub const MAX_PAYLOAD: usize = 10_000;

/// Largest number of descriptors carried by one message
pub const MAX_DESCRIPTORS: usize = 4;

/// Errors that can occur on a control channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Message was truncated in transit")]
    Truncated,

    #[error("Payload of {0} bytes exceeds the limit of {MAX_PAYLOAD} bytes")]
    PayloadTooLarge(usize),

    #[error("{0} descriptors exceed the limit of {MAX_DESCRIPTORS} per message")]
    TooManyDescriptors(usize),

    #[error("Empty payloads are reserved for end-of-stream")]
    EmptyPayload,
}

impl From<Errno> for ChannelError {
    fn from(errno: Errno) -> Self {
        ChannelError::Transport(errno.into())
    }
}

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// One received message: payload bytes plus the descriptors that came with it
#[derive(Debug)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

/// Raw outcome of a single `recvmsg`
struct Received {
    payload: Vec<u8>,
    fds: Vec<OwnedFd>,
    truncated: bool,
}

impl Received {
    fn into_datagram(self) -> ChannelResult<Option<Datagram>> {
        if self.truncated {
            // Dropping `self.fds` closes whatever did arrive.
            return Err(ChannelError::Truncated);
        }
        if self.payload.is_empty() && self.fds.is_empty() {
            return Ok(None);
        }
        Ok(Some(Datagram {
            payload: self.payload,
            fds: self.fds,
        }))
    }
}

/// One endpoint of a connected `SOCK_SEQPACKET` pair, registered with the
/// tokio reactor for readability
#[derive(Debug)]
pub struct ControlChannel {
    inner: AsyncFd<OwnedFd>,
}

impl ControlChannel {
    /// Create a connected, close-on-exec socket pair without registering it.
    ///
    /// Use this when one end is destined for another process: inherited by a
    /// spawned child or shipped inside a handoff message.
    pub fn socketpair() -> ChannelResult<(OwnedFd, OwnedFd)> {
        let pair = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        Ok(pair)
    }

    /// Create a connected pair with both ends registered locally
    pub fn pair() -> ChannelResult<(Self, Self)> {
        let (ours, theirs) = Self::socketpair()?;
        Ok((Self::from_fd(ours)?, Self::from_fd(theirs)?))
    }

    /// Adopt an existing socket endpoint.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_fd(fd: OwnedFd) -> ChannelResult<Self> {
        let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;

        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }

    /// Send one message, transferring ownership of `fds`.
    ///
    /// Never blocks: a full socket buffer is reported as a transport error.
    /// The descriptors are closed locally when this returns, whether or not the
    /// send succeeded.
    pub fn send(&self, payload: &[u8], fds: Vec<OwnedFd>) -> ChannelResult<()> {
        if payload.is_empty() {
            return Err(ChannelError::EmptyPayload);
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(ChannelError::PayloadTooLarge(payload.len()));
        }
        if fds.len() > MAX_DESCRIPTORS {
            return Err(ChannelError::TooManyDescriptors(fds.len()));
        }

        let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        let iov = [IoSlice::new(payload)];
        let rights = [ControlMessage::ScmRights(&raw)];
        let cmsgs: &[ControlMessage] = if raw.is_empty() { &[] } else { &rights };

        let sent = sendmsg::<()>(
            self.as_raw_fd(),
            &iov,
            cmsgs,
            MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
            None,
        )?;
        if sent != payload.len() {
            return Err(ChannelError::Truncated);
        }

        // The kernel holds its own references now.
        drop(fds);
        Ok(())
    }

    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` on orderly end-of-stream.
    pub async fn recv(&self) -> ChannelResult<Option<Datagram>> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| receive(inner.as_raw_fd())) {
                Ok(result) => return result?.into_datagram(),
                Err(_would_block) => continue,
            }
        }
    }

    /// Shut down both directions; both ends then observe end-of-stream
    pub fn shutdown(&self) -> ChannelResult<()> {
        match shutdown(self.as_raw_fd(), Shutdown::Both) {
            Ok(()) | Err(Errno::ENOTCONN) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsRawFd for ControlChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn receive(fd: RawFd) -> io::Result<Received> {
    let mut buffer = vec![0u8; MAX_PAYLOAD];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_DESCRIPTORS]);

    let (bytes, fds, truncated) = {
        let mut iov = [IoSliceMut::new(&mut buffer)];
        let msg = recvmsg::<()>(
            fd,
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )?;

        let mut truncated = msg
            .flags
            .intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC);
        let mut fds = Vec::new();
        match msg.cmsgs() {
            Ok(cmsgs) => {
                for cmsg in cmsgs {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        // SAFETY: SCM_RIGHTS hands us fresh descriptors that
                        // nothing else in this process owns.
                        fds.extend(
                            received
                                .into_iter()
                                .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) }),
                        );
                    }
                }
            }
            Err(_) => truncated = true,
        }

        (msg.bytes, fds, truncated)
    };

    buffer.truncate(bytes);
    Ok(Received {
        payload: buffer,
        fds,
        truncated,
    })
}
