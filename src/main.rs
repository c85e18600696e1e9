//! oxterm - a minimal pty session manager for POSIX terminals
//!
//! oxterm allocates a pseudo-terminal, runs a shell attached to its slave
//! side, and bridges the hosting terminal to it: keystrokes flow from stdin
//! into the pty master, session output flows to stdout, and the shell's own
//! exit status becomes the oxterm process exit status.
//!
//! # Quick Start
//!
//! ```text
//! oxterm                    # Run $SHELL (or /bin/sh) in a fresh pty
//! oxterm -s /bin/zsh        # Run a specific shell
//! oxterm -t xterm-256color  # Advertise a different TERM
//! ```
//!
//! Configuration lives in `~/.oxterm/config.toml`; command-line flags
//! override it. The log file is `~/.oxterm/oxterm.log`.

mod config;
mod core;
mod render;

use std::cell::RefCell;
use std::env;
use std::io;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use crossterm::terminal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::core::pty::PtySession;
use crate::core::reaper::ExitStatus;
use crate::core::terminal::Terminal;
use crate::render::{RenderSink, StdoutRenderer};

/// Command-line options
#[derive(Default)]
struct Options {
    /// Program to run (overrides config file and $SHELL)
    shell: Option<String>,
    /// TERM value advertised to the child
    term: Option<String>,
    /// Explicit window size (overrides host terminal detection)
    rows: Option<u16>,
    cols: Option<u16>,
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("oxterm {}", VERSION);
}

fn print_help() {
    eprintln!(
        "oxterm {} - A minimal pty session manager for POSIX terminals",
        VERSION
    );
    eprintln!();
    eprintln!("Usage: oxterm [OPTIONS]");
    eprintln!();
    eprintln!("Shell options:");
    eprintln!("  (default)             From config.toml, then $SHELL, then /bin/sh");
    eprintln!("  -s, --shell <CMD>     Program to run in the session");
    eprintln!();
    eprintln!("Terminal options:");
    eprintln!("  -t, --term <TYPE>     TERM value for the session (default: linux)");
    eprintln!("  --rows <N>            Session rows (default: host terminal height)");
    eprintln!("  --cols <N>            Session columns (default: host terminal width)");
    eprintln!();
    eprintln!("Other options:");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Configuration: ~/.oxterm/config.toml");
    eprintln!("Log file:      ~/.oxterm/oxterm.log");
    eprintln!();
    eprintln!("Exit: leave the shell (e.g. type 'exit'); oxterm exits with the");
    eprintln!("shell's own status, or 128+N if the shell was killed by signal N.");
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();
    let mut options = Options::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-s" | "--shell" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing shell argument".to_string());
                }
                options.shell = Some(args[i].clone());
            }
            "-t" | "--term" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing term argument".to_string());
                }
                options.term = Some(args[i].clone());
            }
            "--rows" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing rows argument".to_string());
                }
                let rows = args[i]
                    .parse::<u16>()
                    .map_err(|_| format!("Invalid row count: {}", args[i]))?;
                options.rows = Some(rows);
            }
            "--cols" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing cols argument".to_string());
                }
                let cols = args[i]
                    .parse::<u16>()
                    .map_err(|_| format!("Invalid column count: {}", args[i]))?;
                options.cols = Some(cols);
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(options)
}

/// Initialize logging to ~/.oxterm/oxterm.log (append mode, no ANSI).
fn init_logging() {
    let log_path = config::home_dir()
        .map(|h| h.join(".oxterm").join("oxterm.log"))
        .unwrap_or_else(|| std::path::PathBuf::from("oxterm.log"));

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() {
    let options = match parse_args() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    init_logging();
    info!("oxterm starting...");

    // Let child processes detect that they run under oxterm.
    env::set_var("OXTERM", "1");
    env::set_var("OXTERM_VERSION", VERSION);

    match run_terminal(options) {
        Ok(status) => {
            info!(?status, "oxterm exiting");
            std::process::exit(status.as_exit_code());
        }
        Err(e) => {
            error!("Fatal: {:#}", e);
            eprintln!("oxterm: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Run one session start to finish; returns the child's exit classification.
fn run_terminal(options: Options) -> anyhow::Result<ExitStatus> {
    let file_config = Config::load();

    // Merge: command line overrides config file, config file overrides
    // environment, /bin/sh is the last resort.
    let shell = options
        .shell
        .or(file_config.shell)
        .or_else(|| env::var("SHELL").ok())
        .unwrap_or_else(|| "/bin/sh".to_string());
    let term_type = options.term.unwrap_or(file_config.term);

    // Host terminal size, unless overridden per field.
    let (host_cols, host_rows) =
        terminal::size().unwrap_or((file_config.size.cols, file_config.size.rows));
    let rows = options.rows.unwrap_or(host_rows);
    let cols = options.cols.unwrap_or(host_cols);

    info!("Shell: {}", shell);
    info!("TERM: {}", term_type);
    info!("Session size: {}x{}", cols, rows);

    let sink: Rc<RefCell<dyn RenderSink>> = Rc::new(RefCell::new(StdoutRenderer::new()));
    let session_id = std::process::id() as u64;

    // The shell runs interactively, as a terminal would start it.
    let shell_args = vec!["-i".to_string()];
    let mut term = Terminal::open(&shell, &shell_args, rows, cols, session_id, &term_type, sink)?;

    // All registrations happen before the hosting terminal is touched, so
    // an error here leaves it in its original mode.
    term.attach_display(
        io::stdin().as_raw_fd(),
        Box::new(|session: &mut PtySession| {
            let mut buf = [0u8; 1024];
            if let Ok(n) = nix::unistd::read(io::stdin().as_raw_fd(), &mut buf) {
                if n > 0 {
                    let _ = session.write(&buf[..n]);
                }
            }
        }),
    )?;

    // Raw mode: keystrokes reach the session byte for byte; the child's
    // line discipline does the editing and echo.
    terminal::enable_raw_mode()?;

    let result = term.run();

    // Restore the hosting terminal before reporting anything.
    let _ = terminal::disable_raw_mode();

    let status = result?;
    info!(?status, "session finished");
    Ok(status)
}
