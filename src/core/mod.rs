//! Core session machinery.
//!
//! This module contains the host side of a terminal session:
//!
//! - **buffer**: immutable refcounted chunks of session output
//! - **pty**: pseudo-terminal allocation and child process lifecycle
//! - **event**: poll-based single-threaded descriptor dispatch
//! - **reaper**: per-pid child-exit watching
//! - **terminal**: composition of the above into one live session
//!
//! # Architecture
//!
//! ```text
//! Terminal
//! ├── PtySession (master fd + child pid + window size)
//! ├── EventDispatcher (master fd, display fd)
//! └── ChildReaper (child pid)
//! ```

pub mod buffer;
pub mod event;
pub mod pty;
pub mod reaper;
pub mod terminal;
