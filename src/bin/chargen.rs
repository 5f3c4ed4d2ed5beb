/* Character Generator Protocol (RFC 864) test producer.
 *
 * Copyright © 2026 The logfeed authors
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 * http://www.apache.org/licenses/LICENSE-2.0
 * There is NO WARRANTY.
 *
 *     chargen -n100 -b100000 -o out.log -p chargen.pid
 *
 * Emits 72-character lines of the printable-ASCII alphabet, the first
 * character advancing one position per line, exactly like the classic
 * chargen service.  It exists to exercise logfeed: pointed at a log file
 * and a pid file, it is a producer whose byte stream is easy to verify at
 * the sink (the concatenation across rotations must hash identically to an
 * unrotated run).
 *
 * Signals: SIGUSR1 reopens the stdout target (the log-rotation handshake),
 * SIGHUP resets the generator state, SIGTERM stops cleanly.
 */

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use time::macros::format_description;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const START_CHAR: u8 = 33;
const END_CHAR: u8 = 127; // exclusive
const ALPHABET: usize = (END_CHAR - START_CHAR) as usize;
const LINE_LENGTH: usize = 72;

static GOT_SIGUSR1: AtomicBool = AtomicBool::new(false);
static GOT_SIGHUP: AtomicBool = AtomicBool::new(false);
static GOT_SIGTERM: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigusr1(_: libc::c_int) {
    GOT_SIGUSR1.store(true, Ordering::Relaxed);
}
extern "C" fn on_sighup(_: libc::c_int) {
    GOT_SIGHUP.store(true, Ordering::Relaxed);
}
extern "C" fn on_sigterm(_: libc::c_int) {
    GOT_SIGTERM.store(true, Ordering::Relaxed);
}

#[derive(Parser, Debug)]
#[command(name = "chargen", version, about = "Chargen-pattern test producer")]
struct Args {
    /// Number of lines; default is unlimited
    #[arg(short = 'n', long = "lines", value_name = "N")]
    lines: Option<u64>,

    /// Microseconds to sleep between lines
    #[arg(short = 'b', long = "between-delay", value_name = "USEC", default_value_t = 100_000)]
    between_delay: u64,

    /// Line identification prefix
    #[arg(short = 'i', long = "id", value_name = "PREFIX")]
    id: Option<String>,

    /// File to write our pid to
    #[arg(short = 'p', long = "pid-file", value_name = "FILE")]
    pid_file: Option<PathBuf>,

    /// Character code the first line starts with (33..=126)
    #[arg(short = 'c', long = "start-char", value_name = "CODE", default_value_t = START_CHAR)]
    start_char: u8,

    /// Walk the alphabet backwards
    #[arg(short = 'r', long = "reverse-order")]
    reverse_order: bool,

    /// Redirect stdout here; the file is reopened upon SIGUSR1
    #[arg(short = 'o', long = "stdout-file", value_name = "FILE")]
    stdout_file: Option<PathBuf>,

    /// Truncate the output file instead of appending
    #[arg(short = 't', long = "truncate-file")]
    truncate: bool,
}

fn init_tracing() {
    let timer = UtcTime::new(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:5]"
    ));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_timer(timer)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn install_handlers() -> nix::Result<()> {
    for (sig, handler) in [
        (Signal::SIGUSR1, on_sigusr1 as extern "C" fn(libc::c_int)),
        (Signal::SIGHUP, on_sighup),
        (Signal::SIGTERM, on_sigterm),
    ] {
        let act = SigAction::new(SigHandler::Handler(handler), SaFlags::empty(), SigSet::empty());
        unsafe { sigaction(sig, &act)? };
    }
    Ok(())
}

/// Point fd 1 at `path`.  The first open honors `-t`; reopens after a
/// rotation always append to whatever fresh file is there.
fn open_stdout(path: &Path, truncate: bool) -> std::io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let mode = if truncate { libc::O_TRUNC } else { libc::O_APPEND };
    let fd = unsafe {
        libc::open(cpath.as_ptr(), libc::O_WRONLY | libc::O_CREAT | mode, 0o644)
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    unsafe {
        if libc::dup2(fd, libc::STDOUT_FILENO) < 0 {
            let e = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(e);
        }
        libc::close(fd);
    }
    Ok(())
}

fn write_line(buf: &[u8]) -> std::io::Result<()> {
    let mut rest = buf;
    while !rest.is_empty() {
        let n = unsafe {
            libc::write(
                libc::STDOUT_FILENO,
                rest.as_ptr() as *const libc::c_void,
                rest.len(),
            )
        };
        if n < 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "stdout write returned 0",
            ));
        }
        rest = &rest[n as usize..];
    }
    Ok(())
}

fn run(args: &Args) -> std::io::Result<()> {
    // Two copies of the alphabet back to back, so any line is one
    // contiguous slice.
    let mut doubled = [0u8; ALPHABET * 2];
    for (i, b) in doubled.iter_mut().enumerate() {
        *b = (i % ALPHABET) as u8 + START_CHAR;
    }

    let mut line = Vec::with_capacity(LINE_LENGTH + 80);
    let prefix_len = match &args.id {
        Some(id) => {
            line.extend_from_slice(id.as_bytes());
            line.push(b' ');
            line.len()
        }
        None => 0,
    };

    let start_index = (args.start_char - START_CHAR) as usize;
    let skip = if args.reverse_order { ALPHABET - 1 } else { 1 };
    let mut index = start_index;
    let mut remaining = args.lines;

    loop {
        if GOT_SIGTERM.swap(false, Ordering::Relaxed) {
            tracing::info!("got SIGTERM, stopping");
            break;
        }
        if GOT_SIGHUP.swap(false, Ordering::Relaxed) {
            tracing::info!("got SIGHUP, resetting");
            index = start_index;
        }
        if GOT_SIGUSR1.swap(false, Ordering::Relaxed) {
            if let Some(path) = &args.stdout_file {
                tracing::info!(path = ?path, "got SIGUSR1, re-opening");
                open_stdout(path, false)?;
            }
        }

        if let Some(0) = remaining {
            break;
        }

        line.truncate(prefix_len);
        line.extend_from_slice(&doubled[index..index + LINE_LENGTH]);
        line.push(b'\n');
        write_line(&line)?;

        index = (index + skip) % ALPHABET;
        if let Some(n) = &mut remaining {
            *n -= 1;
        }
        if args.between_delay > 0 {
            unsafe { libc::usleep(args.between_delay as libc::useconds_t) };
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            use clap::error::ErrorKind;
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    if args.start_char < START_CHAR || args.start_char >= END_CHAR {
        tracing::error!(
            "--start-char must be in {}..={}",
            START_CHAR,
            END_CHAR - 1
        );
        return ExitCode::from(1);
    }

    if let Err(e) = install_handlers() {
        tracing::error!(error = %e, "could not install signal handlers");
        return ExitCode::from(1);
    }

    if let Some(path) = &args.stdout_file {
        if let Err(e) = open_stdout(path, args.truncate) {
            tracing::error!(error = %e, path = ?path, "could not redirect stdout");
            return ExitCode::from(1);
        }
    }

    if let Some(path) = &args.pid_file {
        if let Err(e) = std::fs::write(path, format!("{}\n", std::process::id())) {
            tracing::error!(error = %e, path = ?path, "could not write pid file");
            return ExitCode::from(1);
        }
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "write failed");
            ExitCode::from(1)
        }
    }
}
