//! Session listener contract

use std::os::fd::OwnedFd;

/// Receives lifecycle events for one session.
///
/// Callbacks run on the session's event task and must not block. For a given
/// session the order is always: `session_created` at most once, then
/// `session_exited` at most once, then `session_closed` exactly once.
pub trait SessionListener: Send + Sync {
    /// The process is attached to a terminal; the listener now owns its master
    fn session_created(&self, pty: OwnedFd);

    /// The process finished with a raw status (negative for a signal)
    fn session_exited(&self, status: i32);

    /// The session is over. May come without any earlier event when the
    /// command could not be started.
    fn session_closed(&self);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// What a `RecordingListener` saw
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Recorded {
        Created,
        Exited(i32),
        Closed,
    }

    /// Listener that records every callback
    #[derive(Default)]
    pub struct RecordingListener {
        events: Mutex<Vec<Recorded>>,
        ptys: Mutex<Vec<OwnedFd>>,
        closed: Notify,
    }

    impl RecordingListener {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn events(&self) -> Vec<Recorded> {
            self.events.lock().unwrap().clone()
        }

        pub fn take_pty(&self) -> Option<OwnedFd> {
            self.ptys.lock().unwrap().pop()
        }

        pub async fn wait_closed(&self) {
            tokio::time::timeout(Duration::from_secs(10), self.closed.notified())
                .await
                .expect("session was not closed in time");
        }

        pub async fn wait_created(&self) -> OwnedFd {
            for _ in 0..1000 {
                if let Some(pty) = self.take_pty() {
                    return pty;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("session was not created in time");
        }
    }

    impl SessionListener for RecordingListener {
        fn session_created(&self, pty: OwnedFd) {
            self.events.lock().unwrap().push(Recorded::Created);
            self.ptys.lock().unwrap().push(pty);
        }

        fn session_exited(&self, status: i32) {
            self.events.lock().unwrap().push(Recorded::Exited(status));
        }

        fn session_closed(&self) {
            self.events.lock().unwrap().push(Recorded::Closed);
            self.closed.notify_one();
        }
    }
}
