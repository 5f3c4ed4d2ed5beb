/* Feed a producer's log file to an svlogd-style sink, rotating it on the way.
 *
 * Copyright © 2026 The logfeed authors
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 * http://www.apache.org/licenses/LICENSE-2.0
 * There is NO WARRANTY.
 *
 *     logfeed -p producer.pid -l producer.log [-s svlogd] [-c BYTES] [-e]
 *
 * The producer keeps writing its log file wherever it always did; logfeed
 * tails that file and feeds the bytes to the sink program's stdin (the
 * sink is run as `SINK -ttt .`).  Every `-c` bytes the file is renamed to
 * `<log-file>.hanging`, an empty file takes its place, and the producer
 * gets a SIGUSR1 so it can reopen.  The rename's tail is drained before
 * any byte of the new file is accepted, so the sink sees the producer's
 * exact byte stream, in order, across any number of rotations.
 *
 * Closing logfeed's stdin asks for a clean shutdown: the tailers are
 * stopped, the queue is drained, and the program exits 0.  Fatal
 * conditions (the sink dying, a failed rename) exit 1.
 */

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use time::macros::format_description;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

use logfeed::{read_pid, Engine, FdTap, Sink};

#[derive(Parser, Debug)]
#[command(name = "logfeed", version, about = "Log-rotation intermediary feeding an svlogd-style sink")]
struct Args {
    /// Pid file of the producer to signal (SIGUSR1) so it reopens its log
    #[arg(short = 'p', long = "pid-file", value_name = "FILE")]
    pid_file: PathBuf,

    /// Log file the producer writes and we feed to the sink
    #[arg(short = 'l', long = "log-file", value_name = "FILE")]
    log_file: PathBuf,

    /// Sink program; run as `PATH -ttt .` with our feed on its stdin
    #[arg(short = 's', long = "svlogd", value_name = "PATH", default_value = "svlogd")]
    svlogd: String,

    /// Rotation threshold in bytes
    #[arg(
        short = 'c',
        long = "count-to-rotate",
        value_name = "BYTES",
        default_value_t = 0x0100_0000
    )]
    count_to_rotate: u64,

    /// Exit the loop on any bare timeout (useful for tests)
    #[arg(short = 'e', long = "exit-on-timeout")]
    exit_on_timeout: bool,
}

/// Diagnostics carry the svlogd `-ttt` timestamp resolution (10 µs) plus
/// the emitting file and line.
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

    if args.count_to_rotate == 0 {
        tracing::error!("--count-to-rotate must be positive");
        return ExitCode::from(1);
    }

    let producer_pid = match read_pid(&args.pid_file) {
        Ok(pid) => pid,
        Err(e) => {
            tracing::error!(error = %e, "invalid pid file");
            return ExitCode::from(1);
        }
    };
    tracing::info!(
        producer = producer_pid.as_raw(),
        log_file = ?args.log_file,
        threshold = args.count_to_rotate,
        sink = %args.svlogd,
        "starting"
    );

    let sink = match Sink::open(&[&args.svlogd, "-ttt", "."], true) {
        Ok(sink) => sink,
        Err(e) => {
            tracing::error!(error = %e, "could not start the sink");
            return ExitCode::from(1);
        }
    };

    let stdin_tap = match FdTap::open(libc::STDIN_FILENO) {
        Ok(tap) => tap,
        Err(e) => {
            tracing::error!(error = %e, "could not set up stdin");
            return ExitCode::from(1);
        }
    };

    let mut engine = match Engine::new(
        producer_pid,
        sink,
        stdin_tap,
        &args.log_file,
        args.count_to_rotate,
        args.exit_on_timeout,
    ) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "could not start the engine");
            return ExitCode::from(1);
        }
    };

    let outcome = engine.run();
    if let Err(e) = engine.close_sink() {
        tracing::warn!(error = %e, "closing the sink failed");
    }

    match outcome {
        Ok(()) => {
            tracing::info!("finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::from(1)
        }
    }
}
