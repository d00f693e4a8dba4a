//! Desired I/O readiness and the status callback
//!
//! The engine never polls. It tells the host which descriptor to watch and
//! whether write readiness matters, and the host calls back into
//! [`AsyncEngine::process`](crate::engine::AsyncEngine::process) when the
//! descriptor is ready.

use std::fmt;
use std::os::fd::RawFd;
use tracing::debug;

/// Readiness the host should wait for on the watched descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// Only inbound data is expected
    ForRead,
    /// Outbound data is pending, a connect is in progress, or answers are
    /// ready for delivery
    ForReadWrite,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::ForRead => f.write_str("FOR_READ"),
            Status::ForReadWrite => f.write_str("FOR_RW"),
        }
    }
}

/// Payload of the status callback
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusChange {
    /// Descriptor reported by the previous notification
    pub old_fd: Option<RawFd>,
    /// Descriptor to watch from now on; `None` when there is no connection
    pub new_fd: Option<RawFd>,
    pub status: Status,
}

/// Status callback installed at initialization
pub type StatusCallback = Box<dyn FnMut(StatusChange)>;

/// Remembers what the host was last told and reports only changes
pub struct StatusNotifier {
    callback: StatusCallback,
    /// `None` until the first notification
    last: Option<(Option<RawFd>, Status)>,
}

impl StatusNotifier {
    pub fn new(callback: impl FnMut(StatusChange) + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            last: None,
        }
    }

    /// Report `(fd, status)` if it differs from the previous report
    ///
    /// The first call always reports. Returns whether the callback ran.
    pub fn update(&mut self, fd: Option<RawFd>, status: Status) -> bool {
        let old_fd = match self.last {
            Some(last) if last == (fd, status) => return false,
            Some((old_fd, _)) => old_fd,
            None => None,
        };
        self.last = Some((fd, status));
        debug!(?old_fd, ?fd, %status, "status changed");
        (self.callback)(StatusChange {
            old_fd,
            new_fd: fd,
            status,
        });
        true
    }

    /// Status most recently reported
    pub fn current(&self) -> Option<Status> {
        self.last.map(|(_, status)| status)
    }

    pub fn current_fd(&self) -> Option<RawFd> {
        self.last.and_then(|(fd, _)| fd)
    }
}

impl fmt::Debug for StatusNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusNotifier")
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recording() -> (StatusNotifier, Rc<RefCell<Vec<StatusChange>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let notifier = StatusNotifier::new(move |change| sink.borrow_mut().push(change));
        (notifier, seen)
    }

    #[test]
    fn test_first_update_always_reports() {
        let (mut notifier, seen) = recording();
        assert_eq!(notifier.current(), None);

        assert!(notifier.update(None, Status::ForRead));
        assert_eq!(
            seen.borrow().as_slice(),
            &[StatusChange {
                old_fd: None,
                new_fd: None,
                status: Status::ForRead
            }]
        );
    }

    #[test]
    fn test_repeated_status_is_suppressed() {
        let (mut notifier, seen) = recording();

        notifier.update(Some(5), Status::ForReadWrite);
        assert!(!notifier.update(Some(5), Status::ForReadWrite));
        assert!(notifier.update(Some(5), Status::ForRead));
        assert!(!notifier.update(Some(5), Status::ForRead));

        let statuses: Vec<_> = seen.borrow().iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![Status::ForReadWrite, Status::ForRead]);
    }

    #[test]
    fn test_descriptor_change_carries_old_fd() {
        let (mut notifier, seen) = recording();

        notifier.update(Some(5), Status::ForRead);
        notifier.update(None, Status::ForRead);
        notifier.update(Some(7), Status::ForReadWrite);

        let seen = seen.borrow();
        assert_eq!(seen[1].old_fd, Some(5));
        assert_eq!(seen[1].new_fd, None);
        assert_eq!(seen[2].old_fd, None);
        assert_eq!(seen[2].new_fd, Some(7));
        assert_eq!(notifier.current_fd(), Some(7));
        assert_eq!(notifier.current(), Some(Status::ForReadWrite));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::ForRead.to_string(), "FOR_READ");
        assert_eq!(Status::ForReadWrite.to_string(), "FOR_RW");
    }
}
