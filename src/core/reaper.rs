//! Child-exit watching and reaping
//!
//! Watches specific child pids and reports each exit exactly once. The
//! reaper deliberately never calls `waitpid(-1, ..)`: only pids explicitly
//! handed to [`ChildReaper::watch`] are reaped, so concurrent sessions (or
//! unrelated children of this process) cannot have their exit status
//! stolen.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ReapError {
    #[error("Pid {0} is already being watched")]
    AlreadyWatched(i32),

    #[error("waitpid for pid {pid} failed: {source}")]
    Wait {
        pid: i32,
        #[source]
        source: Errno,
    },
}

pub type Result<T> = std::result::Result<T, ReapError>;

/// Exit classification for a reaped child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with the given code.
    Exited(i32),
    /// Killed by the given signal.
    Signaled(Signal),
}

impl ExitStatus {
    #[allow(dead_code)]
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Process exit code to propagate for this classification, using the
    /// shell convention of 128 + signal number for signal deaths.
    pub fn as_exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(sig) => 128 + *sig as i32,
        }
    }
}

pub type ExitCallback = Box<dyn FnMut(ExitStatus)>;

struct Watch {
    pid: Pid,
    on_exit: ExitCallback,
}

/// Per-pid child-exit watcher.
#[derive(Default)]
pub struct ChildReaper {
    watches: Vec<Watch>,
}

impl ChildReaper {
    pub fn new() -> Self {
        Self {
            watches: Vec::new(),
        }
    }

    /// Register interest in `pid`.
    ///
    /// Valid even if the child already exited: the kernel keeps the zombie
    /// entry until it is reaped here, so the callback still fires on the
    /// next [`poll`].
    ///
    /// [`poll`]: ChildReaper::poll
    pub fn watch(&mut self, pid: Pid, on_exit: ExitCallback) -> Result<()> {
        if self.watches.iter().any(|w| w.pid == pid) {
            return Err(ReapError::AlreadyWatched(pid.as_raw()));
        }
        debug!(pid = pid.as_raw(), "watching child");
        self.watches.push(Watch { pid, on_exit });
        Ok(())
    }

    #[allow(dead_code)]
    pub fn is_watching(&self, pid: Pid) -> bool {
        self.watches.iter().any(|w| w.pid == pid)
    }

    /// Number of children still being watched.
    #[allow(dead_code)]
    pub fn pending(&self) -> usize {
        self.watches.len()
    }

    /// Non-blocking check of every watched pid.
    ///
    /// Fires and removes each entry whose child has terminated. A waitpid
    /// failure drops the entry and is reported, but never aborts the
    /// remaining checks; the caller logs and carries on.
    pub fn poll(&mut self) -> Result<()> {
        let mut failure = None;
        let mut idx = 0;
        while idx < self.watches.len() {
            let pid = self.watches[idx].pid;
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => idx += 1,
                Ok(WaitStatus::Exited(_, code)) => {
                    debug!(pid = pid.as_raw(), code, "child exited");
                    let mut watch = self.watches.remove(idx);
                    (watch.on_exit)(ExitStatus::Exited(code));
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    debug!(pid = pid.as_raw(), signal = ?sig, "child killed by signal");
                    let mut watch = self.watches.remove(idx);
                    (watch.on_exit)(ExitStatus::Signaled(sig));
                }
                // Stopped/continued are not exits; keep watching.
                Ok(_) => idx += 1,
                Err(e) => {
                    warn!(pid = pid.as_raw(), errno = %e, "waitpid failed for watched child");
                    self.watches.remove(idx);
                    failure = Some(ReapError::Wait {
                        pid: pid.as_raw(),
                        source: e,
                    });
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::process::Command;
    use std::rc::Rc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn spawn_sh(script: &str) -> Pid {
        let child = Command::new("/bin/sh")
            .args(["-c", script])
            .spawn()
            .expect("spawn /bin/sh");
        Pid::from_raw(child.id() as i32)
    }

    /// Poll until nothing is pending or the deadline passes.
    fn poll_until_done(reaper: &mut ChildReaper, deadline: Duration) {
        let end = Instant::now() + deadline;
        while reaper.pending() > 0 && Instant::now() < end {
            reaper.poll().expect("poll failed");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn exit_fires_exactly_once_with_code() {
        let pid = spawn_sh("exit 0");
        let mut reaper = ChildReaper::new();

        let seen: Rc<RefCell<Vec<ExitStatus>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_cb = Rc::clone(&seen);
        reaper
            .watch(pid, Box::new(move |status| seen_cb.borrow_mut().push(status)))
            .unwrap();
        assert!(reaper.is_watching(pid));

        poll_until_done(&mut reaper, Duration::from_secs(5));
        assert_eq!(*seen.borrow(), vec![ExitStatus::Exited(0)]);
        assert!(!reaper.is_watching(pid));

        // Further polls must not re-fire.
        reaper.poll().unwrap();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn nonzero_exit_code_is_classified() {
        let pid = spawn_sh("exit 3");
        let mut reaper = ChildReaper::new();

        let seen: Rc<RefCell<Vec<ExitStatus>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_cb = Rc::clone(&seen);
        reaper
            .watch(pid, Box::new(move |status| seen_cb.borrow_mut().push(status)))
            .unwrap();

        poll_until_done(&mut reaper, Duration::from_secs(5));
        assert_eq!(*seen.borrow(), vec![ExitStatus::Exited(3)]);
    }

    #[test]
    fn child_exited_before_watch_is_still_reported() {
        let pid = spawn_sh("exit 7");
        // Give the child time to become a zombie before anyone watches it.
        thread::sleep(Duration::from_millis(200));

        let mut reaper = ChildReaper::new();
        let seen: Rc<RefCell<Vec<ExitStatus>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_cb = Rc::clone(&seen);
        reaper
            .watch(pid, Box::new(move |status| seen_cb.borrow_mut().push(status)))
            .unwrap();

        poll_until_done(&mut reaper, Duration::from_secs(5));
        assert_eq!(*seen.borrow(), vec![ExitStatus::Exited(7)]);
    }

    #[test]
    fn signal_death_is_classified() {
        let pid = spawn_sh("kill -9 $$");
        let mut reaper = ChildReaper::new();

        let seen: Rc<RefCell<Vec<ExitStatus>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_cb = Rc::clone(&seen);
        reaper
            .watch(pid, Box::new(move |status| seen_cb.borrow_mut().push(status)))
            .unwrap();

        poll_until_done(&mut reaper, Duration::from_secs(5));
        assert_eq!(*seen.borrow(), vec![ExitStatus::Signaled(Signal::SIGKILL)]);
    }

    #[test]
    fn watching_a_pid_twice_is_rejected() {
        let pid = spawn_sh("exit 0");
        let mut reaper = ChildReaper::new();

        reaper.watch(pid, Box::new(|_| {})).unwrap();
        let dup = reaper.watch(pid, Box::new(|_| {}));
        assert!(matches!(dup, Err(ReapError::AlreadyWatched(p)) if p == pid.as_raw()));

        poll_until_done(&mut reaper, Duration::from_secs(5));
    }

    #[test]
    fn wait_failure_drops_the_entry_and_is_reported() {
        // Not a child of this process, so waitpid reports ECHILD.
        let bogus = Pid::from_raw(1);
        let mut reaper = ChildReaper::new();
        reaper.watch(bogus, Box::new(|_| {})).unwrap();

        let err = reaper.poll().unwrap_err();
        assert!(matches!(err, ReapError::Wait { pid: 1, .. }));
        assert_eq!(reaper.pending(), 0);

        // The reaper itself stays usable.
        reaper.poll().unwrap();
    }

    #[test]
    fn exit_code_mapping_follows_shell_convention() {
        assert_eq!(ExitStatus::Exited(0).as_exit_code(), 0);
        assert!(ExitStatus::Exited(0).success());
        assert_eq!(ExitStatus::Exited(3).as_exit_code(), 3);
        assert!(!ExitStatus::Exited(3).success());
        assert_eq!(ExitStatus::Signaled(Signal::SIGKILL).as_exit_code(), 137);
        assert_eq!(ExitStatus::Signaled(Signal::SIGTERM).as_exit_code(), 143);
    }
}
