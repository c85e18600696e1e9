//! Single-threaded descriptor event dispatch
//!
//! A registration table plus one `poll(2)` wait per pass: block on the
//! union of registered descriptors, invoke each ready descriptor's callback
//! once, retry on EINTR, treat any other poll failure as fatal to the loop.

use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use bitflags::bitflags;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Descriptor {0} is already registered")]
    AlreadyRegistered(RawFd),

    #[error("Descriptor {0} is not registered")]
    NotRegistered(RawFd),

    #[error("Poll failed: {0}")]
    Poll(#[source] Errno),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

bitflags! {
    /// Conditions a registration wants to be woken for.
    ///
    /// Hangup is reported whenever the kernel observes it, whether or not
    /// it was requested.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const HANGUP = 1 << 2;
    }
}

/// Conditions observed on one descriptor during a dispatch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

/// Handle passed to callbacks during dispatch.
///
/// The dispatcher is mid-iteration while callbacks run, so mutations are
/// queued here and applied once the pass completes. A descriptor queued for
/// deregistration is not dispatched again within the same pass.
pub struct Control {
    deregister: Vec<RawFd>,
    stop: bool,
}

impl Control {
    /// Queue `fd` for removal at the end of the current pass.
    pub fn deregister(&mut self, fd: RawFd) {
        if !self.deregister.contains(&fd) {
            self.deregister.push(fd);
        }
    }

    /// Request that [`EventDispatcher::run`] return after this pass.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    fn is_deregistered(&self, fd: RawFd) -> bool {
        self.deregister.contains(&fd)
    }
}

pub type EventCallback = Box<dyn FnMut(&mut Control, Readiness)>;

struct Registration {
    fd: RawFd,
    interest: Interest,
    callback: EventCallback,
}

/// What one [`EventDispatcher::run_once`] pass observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// At least one callback was invoked.
    Dispatched,
    /// The bounded wait elapsed with nothing ready.
    TimedOut,
    /// The wait was interrupted by a signal; not an error.
    Interrupted,
}

/// Level-triggered readiness multiplexor over raw descriptors.
///
/// Single-threaded by construction: callbacks run on the calling thread and
/// nothing here is `Send`. Descriptor ownership stays with whoever
/// registered it; the dispatcher only borrows fds for the duration of each
/// poll call.
#[derive(Default)]
pub struct EventDispatcher {
    registrations: Vec<Registration>,
    stopped: bool,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            stopped: false,
        }
    }

    /// Add `fd` to the watch table.
    pub fn register(&mut self, fd: RawFd, interest: Interest, callback: EventCallback) -> Result<()> {
        if self.registrations.iter().any(|r| r.fd == fd) {
            return Err(DispatchError::AlreadyRegistered(fd));
        }
        trace!(fd, ?interest, "registered descriptor");
        self.registrations.push(Registration {
            fd,
            interest,
            callback,
        });
        Ok(())
    }

    /// Remove `fd` from the watch table.
    pub fn deregister(&mut self, fd: RawFd) -> Result<()> {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.fd != fd);
        if self.registrations.len() == before {
            return Err(DispatchError::NotRegistered(fd));
        }
        trace!(fd, "deregistered descriptor");
        Ok(())
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registrations.iter().any(|r| r.fd == fd)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// One wait-and-dispatch pass.
    ///
    /// `None` blocks until something is ready; `Some(d)` bounds the wait so
    /// the caller can interleave periodic work. EINTR surfaces as
    /// [`Wakeup::Interrupted`] rather than an error.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<Wakeup> {
        let mut pollfds: Vec<PollFd> = self
            .registrations
            .iter()
            .map(|r| {
                // Registration owners guarantee the fd outlives its entry.
                let fd = unsafe { BorrowedFd::borrow_raw(r.fd) };
                PollFd::new(fd, poll_flags(r.interest))
            })
            .collect();

        let poll_timeout = match timeout {
            Some(d) => PollTimeout::from(d.as_millis().min(u16::MAX as u128) as u16),
            None => PollTimeout::NONE,
        };

        let ready_count = match poll(&mut pollfds, poll_timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(Wakeup::Interrupted),
            Err(e) => return Err(DispatchError::Poll(e)),
        };
        if ready_count == 0 {
            return Ok(Wakeup::TimedOut);
        }

        // Snapshot ready descriptors before touching callbacks so the
        // pollfd borrows end here.
        let ready: Vec<(RawFd, Readiness)> = pollfds
            .iter()
            .zip(self.registrations.iter())
            .filter_map(|(pfd, reg)| {
                let revents = pfd.revents().unwrap_or(PollFlags::empty());
                let readiness = Readiness {
                    readable: revents.contains(PollFlags::POLLIN),
                    writable: revents.contains(PollFlags::POLLOUT),
                    hangup: revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR),
                };
                (readiness.readable || readiness.writable || readiness.hangup)
                    .then_some((reg.fd, readiness))
            })
            .collect();
        drop(pollfds);

        let mut control = Control {
            deregister: Vec::new(),
            stop: false,
        };
        let mut dispatched = false;
        for (fd, readiness) in ready {
            if control.is_deregistered(fd) {
                continue;
            }
            if let Some(reg) = self.registrations.iter_mut().find(|r| r.fd == fd) {
                (reg.callback)(&mut control, readiness);
                dispatched = true;
            }
        }

        for fd in control.deregister {
            self.registrations.retain(|r| r.fd != fd);
        }
        if control.stop {
            self.stopped = true;
        }

        if dispatched {
            Ok(Wakeup::Dispatched)
        } else {
            Ok(Wakeup::TimedOut)
        }
    }

    /// Dispatch events until a stop request takes effect.
    ///
    /// Only a poll failure other than EINTR returns early, as an error.
    #[allow(dead_code)]
    pub fn run(&mut self) -> Result<()> {
        self.stopped = false;
        while !self.stopped {
            self.run_once(None)?;
        }
        Ok(())
    }

    /// Make [`run`] return after the pass in flight, if any.
    ///
    /// From inside a callback use [`Control::stop`] instead; the dispatcher
    /// is mutably borrowed there.
    ///
    /// [`run`]: EventDispatcher::run
    #[allow(dead_code)]
    pub fn stop(&mut self) {
        self.stopped = true;
    }
}

fn poll_flags(interest: Interest) -> PollFlags {
    let mut flags = PollFlags::empty();
    if interest.contains(Interest::READABLE) {
        flags |= PollFlags::POLLIN;
    }
    if interest.contains(Interest::WRITABLE) {
        flags |= PollFlags::POLLOUT;
    }
    flags
}
