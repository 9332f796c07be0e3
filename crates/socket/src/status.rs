//! Socket lifecycle state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::SocketError;

/// Lifecycle status of a socket.
///
/// ```text
/// CLOSED --start--> OPENING --> OPEN --close--> CLOSING --> CLOSED
///                                                             |
///                                  (client, pool released) -> UNUSABLE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Opening = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
    Unusable = 4,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Opening,
            1 => Self::Open,
            2 => Self::Closing,
            3 => Self::Closed,
            _ => Self::Unusable,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Opening => "OPENING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Unusable => "UNUSABLE",
        };
        f.write_str(name)
    }
}

/// Atomic status holder with a single-flight lifecycle guard.
#[derive(Debug)]
pub(crate) struct StatusCell {
    state: AtomicU8,
    busy: AtomicBool,
}

impl StatusCell {
    pub(crate) fn new(initial: Status) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(initial as u8),
            busy: AtomicBool::new(false),
        })
    }

    pub(crate) fn get(&self) -> Status {
        Status::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, status: Status) {
        self.state.store(status as u8, Ordering::Release);
    }

    /// Moves from `from` to `to` only if the current status is `from`.
    pub(crate) fn transition(&self, from: Status, to: Status) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claims the lifecycle slot. Fails immediately if another
    /// start/restart/close is still running.
    pub(crate) fn begin(self: &Arc<Self>) -> Result<LifecycleGuard, SocketError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SocketError::IllegalState(
                "another lifecycle operation is in progress".into(),
            ));
        }
        Ok(LifecycleGuard {
            cell: Arc::clone(self),
        })
    }
}

/// Releases the lifecycle slot on drop.
#[derive(Debug)]
pub(crate) struct LifecycleGuard {
    cell: Arc<StatusCell>,
}

impl Drop for LifecycleGuard {
    fn drop(&mut self) {
        self.cell.busy.store(false, Ordering::Release);
    }
}
