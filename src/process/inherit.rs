//! Descriptor inheritance table
//!
//! A child gets exactly the descriptors listed in its table, each at the slot
//! the table names. Everything else the parent opens is close-on-exec.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use super::{SpawnError, SpawnResult};

/// One descriptor to hand to a child at a fixed slot
#[derive(Debug)]
pub struct FdMapping {
    /// Descriptor owned by the parent until the child is spawned
    pub fd: OwnedFd,
    /// Descriptor number it gets in the child
    pub slot: RawFd,
}

impl FdMapping {
    /// Create a new mapping
    pub fn new(fd: OwnedFd, slot: RawFd) -> Self {
        Self { fd, slot }
    }
}

/// Raw `(source, slot)` pairs captured before fork, applied in the child
#[derive(Debug, Clone)]
pub struct RemapPlan {
    pairs: Vec<(RawFd, RawFd)>,
    floor: RawFd,
}

impl RemapPlan {
    /// Capture a table. Slots must be unique.
    ///
    /// The `OwnedFd`s in `mappings` must stay open until the child has been
    /// spawned.
    pub fn new(mappings: &[FdMapping]) -> SpawnResult<Self> {
        let mut pairs: Vec<(RawFd, RawFd)> = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            if pairs.iter().any(|&(_, slot)| slot == mapping.slot) {
                return Err(SpawnError::DuplicateSlot(mapping.slot));
            }
            pairs.push((mapping.fd.as_raw_fd(), mapping.slot));
        }

        let floor = pairs
            .iter()
            .map(|&(source, slot)| source.max(slot))
            .max()
            .unwrap_or(2)
            + 1;

        Ok(Self { pairs, floor })
    }

    /// Number of mapped slots
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True when nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Move every source into its slot.
    ///
    /// Sources are first parked above every source and slot, so a mapping can
    /// never overwrite the source of a later one.
    ///
    /// # Safety
    ///
    /// Only call this between fork and exec: it rewrites the descriptor table of
    /// the calling process. It performs no allocation.
    pub unsafe fn apply(&mut self) -> io::Result<()> {
        for pair in self.pairs.iter_mut() {
            let parked = libc::fcntl(pair.0, libc::F_DUPFD_CLOEXEC, self.floor);
            if parked < 0 {
                return Err(io::Error::last_os_error());
            }
            pair.0 = parked;
        }

        // dup2 clears close-on-exec on the slot.
        for &(parked, slot) in self.pairs.iter() {
            if libc::dup2(parked, slot) < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(())
    }
}
