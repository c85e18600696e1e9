//! POSIX pseudo-terminal sessions
//!
//! This module wraps allocation of a pty pair, spawning a child process
//! attached to the slave side, window-size updates, and non-blocking I/O
//! on the master side.

use std::collections::BTreeMap;
use std::env;
use std::ffi::{CStr, CString};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{self, execvpe, fork, getuid, setsid, ForkResult, Pid, User};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::buffer::Buffer;

/// Dimensions used when the caller supplies none (or zero) for a field.
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// Upper bound on bytes pulled out of the master per read call.
pub const READ_QUANTUM: usize = 4096;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to allocate pty pair: {0}")]
    Allocation(#[source] Errno),

    #[error("Failed to fork child process: {0}")]
    Spawn(#[source] Errno),

    #[error("Window size update rejected: {0}")]
    Resize(#[source] Errno),

    #[error("Pty I/O failed: {0}")]
    Io(#[source] Errno),

    #[error("Program, argument or environment entry contains a NUL byte")]
    BadArgument,

    #[error("Operation invalid in state {0:?}")]
    BadState(SessionState),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Lifecycle of a [`PtySession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Pty pair allocated, no child yet.
    Created,
    /// fork/exec succeeded, child is attached to the slave side.
    Spawned,
    /// Master fd is watched by the event loop.
    Running,
    /// Torn down; descriptors released.
    Exited,
    /// Spawn failed after the session stopped being retryable.
    Failed,
}

/// Outcome of one non-blocking read from the master side.
#[derive(Debug)]
pub enum ReadEvent {
    /// Bytes were available.
    Data(Buffer),
    /// Nothing to read right now; not an error.
    WouldBlock,
    /// End of stream: the slave side is fully closed.
    Eof,
}

/// One pseudo-terminal and the child process attached to it.
///
/// The master descriptor and child pid are owned exclusively by the session;
/// they leave only as opaque values for event-loop and reaper registration.
/// Descriptor release happens in exactly one place ([`terminate`], also run
/// on drop).
///
/// [`terminate`]: PtySession::terminate
pub struct PtySession {
    master: Option<OwnedFd>,
    slave: Option<OwnedFd>,
    child: Option<Pid>,
    rows: u16,
    cols: u16,
    state: SessionState,
    /// Numeric session id exported to the child as WINDOWID.
    window_id: u64,
    /// Terminal type exported to the child as TERM.
    term: String,
}

impl PtySession {
    /// Allocate a pty pair sized to the normalized dimensions.
    ///
    /// A zero row or column count falls back to the 24x80 default for that
    /// field. The master side is switched to non-blocking mode immediately.
    pub fn create(window_id: u64, term: &str, rows: u16, cols: u16) -> Result<Self> {
        let rows = if rows == 0 { DEFAULT_ROWS } else { rows };
        let cols = if cols == 0 { DEFAULT_COLS } else { cols };
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let pair = openpty(Some(&winsize), None).map_err(PtyError::Allocation)?;
        set_nonblocking(&pair.master)?;

        debug!(
            master = pair.master.as_raw_fd(),
            rows, cols, "allocated pty pair"
        );

        Ok(Self {
            master: Some(pair.master),
            slave: Some(pair.slave),
            child: None,
            rows,
            cols,
            state: SessionState::Created,
            window_id,
            term: term.to_string(),
        })
    }

    /// Fork and exec `program` attached to the slave side.
    ///
    /// The child becomes a session leader with the slave as its controlling
    /// terminal and stdin/stdout/stderr wired to it. Its environment is
    /// normalized the way terminal clients expect: stale `COLUMNS`, `LINES`
    /// and `TERMCAP` removed, `LOGNAME`/`USER` forced from the invoking
    /// user's passwd entry with `SHELL`/`HOME` defaulted from it, `WINDOWID`
    /// and `TERM` exported, then `env_overrides` applied last. If exec fails
    /// the child exits with status 127.
    ///
    /// A fork failure leaves the session in `Created`, so the call may be
    /// retried.
    pub fn spawn(
        &mut self,
        program: &str,
        args: &[String],
        env_overrides: &[(String, String)],
    ) -> Result<Pid> {
        if self.state != SessionState::Created {
            return Err(PtyError::BadState(self.state));
        }
        let master_fd = match &self.master {
            Some(fd) => fd.as_raw_fd(),
            None => return Err(PtyError::BadState(self.state)),
        };
        let slave_fd = match &self.slave {
            Some(fd) => fd.as_raw_fd(),
            None => return Err(PtyError::BadState(self.state)),
        };

        // All allocation happens before the fork; the child only touches
        // async-signal-safe calls.
        let program_c = match CString::new(program) {
            Ok(c) => c,
            Err(_) => {
                self.state = SessionState::Failed;
                return Err(PtyError::BadArgument);
            }
        };
        let mut argv = vec![program_c.clone()];
        for arg in args {
            match CString::new(arg.as_str()) {
                Ok(c) => argv.push(c),
                Err(_) => {
                    self.state = SessionState::Failed;
                    return Err(PtyError::BadArgument);
                }
            }
        }
        let envp = self.child_environment(env_overrides)?;

        match unsafe { fork() }.map_err(PtyError::Spawn)? {
            ForkResult::Child => child_exec(master_fd, slave_fd, &program_c, &argv, &envp),
            ForkResult::Parent { child } => {
                // The slave belongs to the child now.
                self.slave = None;
                self.child = Some(child);
                self.state = SessionState::Spawned;
                info!(pid = child.as_raw(), program, "spawned pty child");
                Ok(child)
            }
        }
    }

    /// Update the kernel's idea of the window size.
    ///
    /// A zero field is replaced with the last-known-good value for that
    /// field rather than being handed to the kernel. On success the line
    /// discipline delivers `SIGWINCH` to the foreground process group; on
    /// failure the recorded dimensions are unchanged and the session stays
    /// usable.
    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        let rows = if rows == 0 { self.rows } else { rows };
        let cols = if cols == 0 { self.cols } else { cols };

        let master = match &self.master {
            Some(fd) => fd,
            None => return Err(PtyError::BadState(self.state)),
        };
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
        if rc < 0 {
            let err = Errno::last();
            warn!(rows, cols, errno = %err, "TIOCSWINSZ rejected");
            return Err(PtyError::Resize(err));
        }

        self.rows = rows;
        self.cols = cols;
        debug!(rows, cols, "resized pty");
        Ok(())
    }

    /// One non-blocking read attempt against the master side.
    pub fn read(&mut self) -> Result<ReadEvent> {
        let master = match &self.master {
            Some(fd) => fd,
            None => return Err(PtyError::BadState(self.state)),
        };

        let mut scratch = [0u8; READ_QUANTUM];
        match unistd::read(master.as_raw_fd(), &mut scratch) {
            Ok(0) => Ok(ReadEvent::Eof),
            Ok(n) => Ok(ReadEvent::Data(Buffer::copy_from(&scratch[..n]))),
            Err(Errno::EAGAIN) => Ok(ReadEvent::WouldBlock),
            // A pty master reports EIO once the slave side is gone.
            Err(Errno::EIO) => Ok(ReadEvent::Eof),
            Err(e) => Err(PtyError::Io(e)),
        }
    }

    /// One non-blocking write of input bytes to the master side.
    ///
    /// Returns the number of bytes accepted; 0 when the kernel buffer is
    /// full right now.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let master = match &self.master {
            Some(fd) => fd,
            None => return Err(PtyError::BadState(self.state)),
        };

        match unistd::write(master, data) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => Ok(0),
            Err(e) => Err(PtyError::Io(e)),
        }
    }

    /// Release both descriptors. Safe to call any number of times.
    ///
    /// Does not signal the child; the caller decides whether and how.
    pub fn terminate(&mut self) {
        self.master = None;
        self.slave = None;
        if self.state != SessionState::Failed {
            self.state = SessionState::Exited;
        }
    }

    /// Note that the master fd is now watched by the event loop.
    pub fn mark_running(&mut self) {
        if self.state == SessionState::Spawned {
            self.state = SessionState::Running;
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn master_fd(&self) -> Option<RawFd> {
        self.master.as_ref().map(|fd| fd.as_raw_fd())
    }

    #[allow(dead_code)]
    pub fn child_pid(&self) -> Option<Pid> {
        self.child
    }

    /// Current (rows, cols), the last values accepted by the kernel.
    pub fn dimensions(&self) -> (u16, u16) {
        (self.rows, self.cols)
    }

    /// Build the child's environment as `KEY=VALUE` strings, pre-fork.
    fn child_environment(&self, overrides: &[(String, String)]) -> Result<Vec<CString>> {
        let mut vars: BTreeMap<String, String> = env::vars()
            .filter(|(k, _)| k != "COLUMNS" && k != "LINES" && k != "TERMCAP")
            .collect();

        // Account variables: the name always wins, shell and home only fill
        // gaps left by the parent environment.
        if let Ok(Some(user)) = User::from_uid(getuid()) {
            vars.insert("LOGNAME".to_string(), user.name.clone());
            vars.insert("USER".to_string(), user.name);
            vars.entry("SHELL".to_string())
                .or_insert_with(|| user.shell.to_string_lossy().into_owned());
            vars.entry("HOME".to_string())
                .or_insert_with(|| user.dir.to_string_lossy().into_owned());
        }

        vars.insert("WINDOWID".to_string(), self.window_id.to_string());
        vars.insert("TERM".to_string(), self.term.clone());

        for (key, value) in overrides {
            vars.insert(key.clone(), value.clone());
        }

        vars.into_iter()
            .map(|(k, v)| CString::new(format!("{k}={v}")).map_err(|_| PtyError::BadArgument))
            .collect()
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Child-side setup between fork and exec. Never returns.
///
/// Only async-signal-safe calls are allowed here; any failure ends the
/// child process with status 127 instead of returning into parent code.
fn child_exec(master: RawFd, slave: RawFd, program: &CStr, argv: &[CString], envp: &[CString]) -> ! {
    if setsid().is_err() {
        unsafe { libc::_exit(127) };
    }

    // The slave becomes the controlling terminal of the new session.
    if unsafe { libc::ioctl(slave, libc::TIOCSCTTY, 0) } < 0 {
        unsafe { libc::_exit(127) };
    }

    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(slave, fd) } < 0 {
            unsafe { libc::_exit(127) };
        }
    }

    if slave > libc::STDERR_FILENO {
        unsafe { libc::close(slave) };
    }
    unsafe { libc::close(master) };

    // The parent may have altered dispositions the child should not inherit.
    for sig in [
        Signal::SIGCHLD,
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTERM,
        Signal::SIGALRM,
    ] {
        let _ = unsafe { signal(sig, SigHandler::SigDfl) };
    }

    let _ = execvpe(program, argv, envp);
    unsafe { libc::_exit(127) }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(PtyError::Io)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(PtyError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Read until end of stream or the deadline, collecting everything.
    fn drain(session: &mut PtySession, deadline: Duration) -> Vec<u8> {
        let mut out = Vec::new();
        let end = Instant::now() + deadline;
        loop {
            match session.read().expect("read failed") {
                ReadEvent::Data(buf) => out.extend_from_slice(&buf),
                ReadEvent::WouldBlock => {
                    if Instant::now() > end {
                        break;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                ReadEvent::Eof => break,
            }
        }
        out
    }

    fn reap(pid: Pid) {
        let _ = nix::sys::wait::waitpid(pid, None);
    }

    #[test]
    fn create_defaults_zero_fields_to_24x80() {
        let session = PtySession::create(1, "linux", 0, 0).unwrap();
        assert_eq!(session.dimensions(), (24, 80));
        assert_eq!(session.state(), SessionState::Created);
        assert!(session.master_fd().is_some());
        assert!(session.child_pid().is_none());
    }

    #[test]
    fn sessions_get_distinct_master_descriptors() {
        let a = PtySession::create(1, "linux", 24, 80).unwrap();
        let b = PtySession::create(2, "linux", 24, 80).unwrap();
        assert_ne!(a.master_fd().unwrap(), b.master_fd().unwrap());
    }

    #[test]
    fn spawn_records_pid_and_transitions_state() {
        let mut session = PtySession::create(1, "linux", 24, 80).unwrap();
        let pid = session
            .spawn("/bin/sh", &["-c".into(), "exit 0".into()], &[])
            .unwrap();
        assert!(pid.as_raw() > 0);
        assert_eq!(session.state(), SessionState::Spawned);
        assert_eq!(session.child_pid(), Some(pid));
        reap(pid);
    }

    #[test]
    fn spawn_twice_is_rejected() {
        let mut session = PtySession::create(1, "linux", 24, 80).unwrap();
        let pid = session
            .spawn("/bin/sh", &["-c".into(), "exit 0".into()], &[])
            .unwrap();
        let again = session.spawn("/bin/sh", &["-c".into(), "exit 0".into()], &[]);
        assert!(matches!(again, Err(PtyError::BadState(_))));
        reap(pid);
    }

    #[test]
    fn resize_normalizes_each_field_independently() {
        let mut session = PtySession::create(1, "linux", 24, 80).unwrap();

        // Zero rows keeps the previous row count.
        session.resize(0, 5).unwrap();
        assert_eq!(session.dimensions(), (24, 5));

        // Both zero: nothing changes.
        session.resize(0, 0).unwrap();
        assert_eq!(session.dimensions(), (24, 5));

        session.resize(40, 132).unwrap();
        assert_eq!(session.dimensions(), (40, 132));
    }

    #[test]
    fn read_returns_exact_child_output() {
        let mut session = PtySession::create(1, "linux", 24, 80).unwrap();
        let pid = session
            .spawn("/bin/sh", &["-c".into(), "printf abc".into()], &[])
            .unwrap();
        let out = drain(&mut session, Duration::from_secs(5));
        assert_eq!(out, b"abc");
        reap(pid);
    }

    #[test]
    fn write_reaches_child_stdin() {
        let mut session = PtySession::create(1, "linux", 24, 80).unwrap();
        let pid = session.spawn("/bin/cat", &[], &[]).unwrap();

        let mut written = 0;
        while written < 5 {
            written += session.write(&b"ping\n"[written..]).unwrap();
        }

        // cat echoes the line back (plus the tty's own echo of the input).
        let mut out = Vec::new();
        let end = Instant::now() + Duration::from_secs(5);
        while !out.windows(4).any(|w| w == b"ping") && Instant::now() < end {
            match session.read().expect("read failed") {
                ReadEvent::Data(buf) => out.extend_from_slice(&buf),
                ReadEvent::WouldBlock => thread::sleep(Duration::from_millis(10)),
                ReadEvent::Eof => break,
            }
        }
        assert!(
            out.windows(4).any(|w| w == b"ping"),
            "no echo seen in {:?}",
            out
        );

        let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
        reap(pid);
    }

    #[test]
    fn child_sees_normalized_environment() {
        let mut session = PtySession::create(99, "linux", 24, 80).unwrap();
        let pid = session
            .spawn(
                "/bin/sh",
                &["-c".into(), r#"printf '%s:%s' "$TERM" "$WINDOWID""#.into()],
                &[],
            )
            .unwrap();
        let out = drain(&mut session, Duration::from_secs(5));
        assert_eq!(out, b"linux:99");
        reap(pid);
    }

    #[test]
    fn env_overrides_apply_last() {
        let mut session = PtySession::create(1, "linux", 24, 80).unwrap();
        let pid = session
            .spawn(
                "/bin/sh",
                &["-c".into(), r#"printf '%s' "$OXTERM_TEST""#.into()],
                &[("OXTERM_TEST".into(), "override".into())],
            )
            .unwrap();
        let out = drain(&mut session, Duration::from_secs(5));
        assert_eq!(out, b"override");
        reap(pid);
    }

    #[test]
    fn terminate_is_idempotent() {
        let mut session = PtySession::create(1, "linux", 24, 80).unwrap();
        session.terminate();
        assert_eq!(session.state(), SessionState::Exited);
        assert!(session.master_fd().is_none());

        session.terminate();
        assert_eq!(session.state(), SessionState::Exited);
        assert!(matches!(session.read(), Err(PtyError::BadState(_))));
        assert!(matches!(session.write(b"x"), Err(PtyError::BadState(_))));
    }
}
