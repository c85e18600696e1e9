//! Session composition root
//!
//! A [`Terminal`] wires one [`PtySession`], one [`EventDispatcher`] and one
//! [`ChildReaper`] together: pty output flows to the render sink, an
//! optional display descriptor drains input into the session, and the
//! child's exit ends the run loop.

use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::event::{Control, DispatchError, EventDispatcher, Interest, Readiness};
use super::pty::{PtyError, PtySession, ReadEvent};
use super::reaper::{ChildReaper, ExitStatus, ReapError};
use crate::render::RenderSink;

/// Bound on the dispatcher wait so the reaper runs even while the pty is
/// quiet.
const REAP_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Reap(#[from] ReapError),
}

pub type Result<T> = std::result::Result<T, TerminalError>;

type SharedSession = Rc<RefCell<PtySession>>;
type SharedSink = Rc<RefCell<dyn RenderSink>>;

/// One live terminal session.
///
/// Single-threaded: the session is shared with the dispatch callbacks
/// through `Rc<RefCell<_>>`, never across threads.
pub struct Terminal {
    session: SharedSession,
    sink: SharedSink,
    events: EventDispatcher,
    reaper: ChildReaper,
    master_fd: RawFd,
    display_fd: Option<RawFd>,
    exit: Rc<Cell<Option<ExitStatus>>>,
    closed: bool,
}

impl Terminal {
    /// Create a session, spawn the child and wire up output and exit
    /// tracking. Any setup failure propagates; the partially built session
    /// is torn down by drop.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        program: &str,
        args: &[String],
        rows: u16,
        cols: u16,
        window_id: u64,
        term: &str,
        sink: SharedSink,
    ) -> Result<Self> {
        let mut session = PtySession::create(window_id, term, rows, cols)?;
        let pid = session.spawn(program, args, &[])?;
        let master_fd = match session.master_fd() {
            Some(fd) => fd,
            None => return Err(TerminalError::Pty(PtyError::BadState(session.state()))),
        };

        let session = Rc::new(RefCell::new(session));
        let exit: Rc<Cell<Option<ExitStatus>>> = Rc::new(Cell::new(None));

        let mut events = EventDispatcher::new();
        {
            let session = Rc::clone(&session);
            let sink = Rc::clone(&sink);
            events.register(
                master_fd,
                Interest::READABLE | Interest::HANGUP,
                Box::new(move |ctl, readiness| {
                    pump_output(&session, &sink, ctl, master_fd, readiness);
                }),
            )?;
        }
        session.borrow_mut().mark_running();

        let mut reaper = ChildReaper::new();
        {
            let exit = Rc::clone(&exit);
            reaper.watch(pid, Box::new(move |status| exit.set(Some(status))))?;
        }

        info!(pid = pid.as_raw(), program, rows, cols, "terminal session open");

        Ok(Self {
            session,
            sink,
            events,
            reaper,
            master_fd,
            display_fd: None,
            exit,
            closed: false,
        })
    }

    /// Register the display/control collaborator's descriptor.
    ///
    /// Whenever it becomes readable, `drain` runs with access to the
    /// session; the core never interprets those bytes. A hangup on the
    /// display descriptor removes the registration.
    pub fn attach_display(
        &mut self,
        fd: RawFd,
        mut drain: Box<dyn FnMut(&mut PtySession)>,
    ) -> Result<()> {
        let session = Rc::clone(&self.session);
        self.events.register(
            fd,
            Interest::READABLE | Interest::HANGUP,
            Box::new(move |ctl, readiness| {
                if readiness.readable {
                    drain(&mut session.borrow_mut());
                }
                if readiness.hangup {
                    ctl.deregister(fd);
                }
            }),
        )?;
        self.display_fd = Some(fd);
        debug!(fd, "attached display descriptor");
        Ok(())
    }

    /// Drive the event loop until the child exits.
    ///
    /// Returns the exit classification after residual output has been
    /// drained, the sink notified, and the session torn down.
    pub fn run(&mut self) -> Result<ExitStatus> {
        loop {
            self.events.run_once(Some(REAP_INTERVAL))?;
            if let Err(e) = self.reaper.poll() {
                // Keep the loop alive; the session itself may still be fine.
                warn!(error = %e, "child reap attempt failed");
            }
            if let Some(status) = self.exit.get() {
                self.finish(status);
                return Ok(status);
            }
        }
    }

    /// Forward a window-size change to the session.
    #[allow(dead_code)]
    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        self.session.borrow_mut().resize(rows, cols)?;
        Ok(())
    }

    /// Feed input bytes to the child.
    #[allow(dead_code)]
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self.session.borrow_mut().write(data)?)
    }

    #[allow(dead_code)]
    pub fn dimensions(&self) -> (u16, u16) {
        self.session.borrow().dimensions()
    }

    /// Idempotent teardown without waiting for the child.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.drop_watches();
        self.session.borrow_mut().terminate();
        debug!("terminal closed");
    }

    /// Remove every remaining registration, ours and the display's.
    fn drop_watches(&mut self) {
        if self.events.is_registered(self.master_fd) {
            let _ = self.events.deregister(self.master_fd);
        }
        if let Some(fd) = self.display_fd.take() {
            if self.events.is_registered(fd) {
                let _ = self.events.deregister(fd);
            }
        }
    }

    /// Teardown after the exit notification: drain residual pty output so
    /// every data delivery lands before the end-of-session one, then
    /// release everything.
    fn finish(&mut self, status: ExitStatus) {
        if self.closed {
            return;
        }

        loop {
            let event = self.session.borrow_mut().read();
            match event {
                Ok(ReadEvent::Data(buf)) => {
                    if !buf.is_empty() {
                        self.sink.borrow_mut().on_data(buf);
                    }
                }
                _ => break,
            }
        }

        self.drop_watches();
        self.session.borrow_mut().terminate();
        self.closed = true;

        info!(?status, "session ended");
        self.sink.borrow_mut().on_session_ended(status);
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drain the master side on readability: forward every non-empty buffer in
/// order, stop at would-block, deregister on end of stream.
fn pump_output(
    session: &SharedSession,
    sink: &SharedSink,
    ctl: &mut Control,
    fd: RawFd,
    readiness: Readiness,
) {
    if readiness.readable {
        loop {
            let event = session.borrow_mut().read();
            match event {
                Ok(ReadEvent::Data(buf)) => {
                    if !buf.is_empty() {
                        sink.borrow_mut().on_data(buf);
                    }
                }
                Ok(ReadEvent::WouldBlock) => break,
                Ok(ReadEvent::Eof) => {
                    ctl.deregister(fd);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "pty read failed");
                    ctl.deregister(fd);
                    return;
                }
            }
        }
    }
    if readiness.hangup {
        // End of stream; the reaper reports the exit independently.
        ctl.deregister(fd);
    }
}
