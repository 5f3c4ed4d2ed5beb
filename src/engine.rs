//! The rotation/forwarding engine.
//!
//! One single-threaded select loop multiplexes the operator's stdin, the
//! tailer over the live log ("current"), the tailer draining the most
//! recently rotated file ("hanging"), and the SIGCHLD self-pipe; queued
//! records drain into the sink whenever its stdin is writable.  When the
//! current tailer has produced the threshold number of bytes the live log
//! is renamed aside, a fresh one is created, the producer is told to
//! reopen, and the slots flip.
//!
//! Bytes reach the sink as a strict concatenation: everything read from
//! the pre-rotation file, then the tail drained during the settle window,
//! then the post-rotation file.  The full flush at the rotation boundary
//! and the single-threaded enqueueing are what make that hold.

use std::io;
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::err::{map_io_err, Error, Result};
use crate::queue::{BufQueue, Source};
use crate::ready::{select, FdSet};
use crate::sink::Sink;
use crate::subprocess::{drain_selfpipe, selfpipe_read_fd};
use crate::tap::{CatTap, FdTap, TapRead};

/// Scratch buffer for tap reads.
const SCRATCH_SIZE: usize = 0x100000;

/// Stop reading taps while this many records are queued.
const QUEUE_HIGH_WATER: usize = 100;

/// A settle phase that enqueues this many records without an inactivity
/// gap is treated as resource exhaustion.
const SETTLE_LIMIT: usize = 100;

/// Inactivity window that ends a settle phase.
const SETTLE_MSEC: u64 = 100;

pub struct Engine {
    producer_pid: Pid,
    sink: Sink,
    stdin_tap: FdTap,
    log_path: PathBuf,
    hanging_path: PathBuf,
    rotate_bytes: u64,
    exit_on_timeout: bool,
    queue: BufQueue,
    /// Tailer following the live log.
    current: Option<CatTap>,
    /// Tailer draining the most recently rotated file.
    hanging: Option<CatTap>,
    producer_is_gone: bool,
    scratch: Vec<u8>,
}

impl Engine {
    /// Open the current-slot tailer (seeking to the end: bytes already in
    /// the file predate us) and derive the hanging path.
    pub fn new(
        producer_pid: Pid,
        sink: Sink,
        stdin_tap: FdTap,
        log_path: &Path,
        rotate_bytes: u64,
        exit_on_timeout: bool,
    ) -> Result<Engine> {
        assert!(rotate_bytes > 0);
        let current = CatTap::follow(log_path, true)?;

        let mut hanging_os = log_path.as_os_str().to_owned();
        hanging_os.push(".hanging");

        Ok(Engine {
            producer_pid,
            sink,
            stdin_tap,
            log_path: log_path.to_path_buf(),
            hanging_path: PathBuf::from(hanging_os),
            rotate_bytes,
            exit_on_timeout,
            queue: BufQueue::new(),
            current: Some(current),
            hanging: None,
            producer_is_gone: false,
            scratch: vec![0u8; SCRATCH_SIZE],
        })
    }

    pub fn hanging_path(&self) -> &Path {
        &self.hanging_path
    }

    /// Run until a clean stop (`Ok`) or a fatal condition (`Err`), then
    /// close the tailers either way.  The sink is left open for
    /// `close_sink`.
    pub fn run(&mut self) -> Result<()> {
        let r = self.run_loop();
        self.cleanup();
        r
    }

    /// Shut the sink down once forwarding is over.
    pub fn close_sink(&mut self) -> Result<()> {
        tracing::debug!(pid = self.sink.pid().as_raw(), "closing sink");
        self.sink.close()?;
        Ok(())
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            let selfpipe = selfpipe_read_fd();
            debug_assert!(selfpipe >= 0);

            if self.sink.is_gone() {
                tracing::warn!("sink has gone unexpectedly");
                self.sink.drain_stderr();
                return Err(Error::SinkGone);
            }

            // Backpressure: with too many records queued we stop reading
            // every tap (the followers then block on their pipes), but the
            // self-pipe always stays in the set.
            let backpressure = self.queue.len() >= QUEUE_HIGH_WATER;
            let mut rfds = FdSet::new();
            rfds.insert(selfpipe);
            if backpressure {
                tracing::debug!(records = self.queue.len(), "queue is full, suspending taps");
            } else {
                if let Some(fd) = self.stdin_tap.fd() {
                    rfds.insert(fd);
                }
                if let Some(fd) = self.current.as_ref().and_then(|t| t.fd()) {
                    rfds.insert(fd);
                }
                if let Some(fd) = self.hanging.as_ref().and_then(|t| t.fd()) {
                    rfds.insert(fd);
                }
            }

            let sink_fd = self.sink.fd();
            let want_write = !self.queue.is_empty() && sink_fd.is_some();
            let mut wfds = FdSet::new();
            if want_write {
                wfds.insert(sink_fd.unwrap());
            }

            // Once stdin closed or the producer died we are only draining;
            // poll faster so the exit is prompt.
            let timeout = if self.stdin_tap.got_eof() || self.producer_is_gone {
                Duration::from_secs(3)
            } else {
                Duration::from_secs(5)
            };

            let ready = match select(
                Some(&mut rfds),
                if want_write { Some(&mut wfds) } else { None },
                Some(timeout),
            ) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io_err(e, "select in engine loop")),
            };

            if ready == 0 {
                if self.stdin_tap.got_eof() {
                    tracing::warn!(
                        records = self.queue.len(),
                        "stdin closed but the sink did not drain in time"
                    );
                    return Ok(());
                }
                if self.producer_is_gone {
                    tracing::warn!(
                        records = self.queue.len(),
                        "producer gone but the sink did not drain in time"
                    );
                    return Ok(());
                }
                if self.exit_on_timeout {
                    tracing::info!("timeout, exiting as requested");
                    return Ok(());
                }
                tracing::trace!("timeout");
                continue;
            }

            let mut bytes_moved: u64 = 0;

            if rfds.contains(selfpipe) {
                drain_selfpipe()?;
            }
            if self.sink.is_gone() {
                tracing::warn!("sink has gone unexpectedly");
                self.sink.drain_stderr();
                return Err(Error::SinkGone);
            }

            if !backpressure {
                bytes_moved += self.read_taps(&rfds)?;
            }

            if want_write {
                if let Some(fd) = self.sink.fd() {
                    if wfds.contains(fd) {
                        let n = self.sink.write_queue(&mut self.queue)?;
                        tracing::trace!(bytes = n, records = self.queue.len(), "sink drained");
                        bytes_moved += n as u64;
                        if self.sink.got_eof() {
                            tracing::warn!("sink got EOF, something went wrong");
                            return Err(Error::SinkClosed);
                        }
                    }
                }
            }

            if bytes_moved == 0 {
                if self.stdin_tap.got_eof() {
                    tracing::info!("stdin closed and nothing pending, finishing");
                    return Ok(());
                }
                if self.producer_is_gone {
                    tracing::info!("producer gone and nothing pending, finishing");
                    return Ok(());
                }
            }
        }
    }

    /// Service whichever taps are readable, in stdin / hanging / current
    /// order, then check the rotation trigger.  Returns bytes enqueued.
    fn read_taps(&mut self, rfds: &FdSet) -> Result<u64> {
        let mut moved: u64 = 0;

        if let Some(fd) = self.stdin_tap.fd() {
            if rfds.contains(fd) {
                match self.stdin_tap.read(&mut self.scratch)? {
                    TapRead::Data(n) => {
                        self.queue.push(Source::Stdin, &self.scratch[..n]);
                        moved += n as u64;
                    }
                    TapRead::WouldBlock => {}
                    TapRead::Eof => {
                        // Stdin closing is the operator's end-of-input
                        // signal: stop tailing, drain, and leave.
                        tracing::info!("stdin got EOF, beginning clean shutdown");
                        self.stdin_tap.close();
                        if let Some(mut tap) = self.hanging.take() {
                            tap.close()?;
                            tap.log_exit();
                        }
                        if let Some(mut tap) = self.current.take() {
                            tap.close()?;
                            tap.log_exit();
                        }
                    }
                }
            }
        }

        if let Some(tap) = self.hanging.as_mut() {
            if let Some(fd) = tap.fd() {
                if rfds.contains(fd) {
                    match tap.read(&mut self.scratch)? {
                        TapRead::Data(n) => {
                            self.queue.push(Source::HangingNormal, &self.scratch[..n]);
                            moved += n as u64;
                        }
                        TapRead::WouldBlock => {}
                        TapRead::Eof => {
                            return Err(Error::TapEof { path: tap.path().to_path_buf() });
                        }
                    }
                }
            }
        }

        if let Some(tap) = self.current.as_mut() {
            if let Some(fd) = tap.fd() {
                if rfds.contains(fd) {
                    match tap.read(&mut self.scratch)? {
                        TapRead::Data(n) => {
                            self.queue.push(Source::Current, &self.scratch[..n]);
                            moved += n as u64;
                        }
                        TapRead::WouldBlock => {}
                        TapRead::Eof => {
                            return Err(Error::TapEof { path: tap.path().to_path_buf() });
                        }
                    }
                }
            }
        }

        if self
            .current
            .as_ref()
            .map_or(false, |t| t.bytes_read() >= self.rotate_bytes)
        {
            self.rotate()?;
        }

        Ok(moved)
    }

    /// The rotation sequence.  Order matters: the rename happens first so
    /// no producer byte can land in a file we are not following, and the
    /// flush precedes the slot flip so the sink sees the old file's bytes
    /// before any byte of the new one.
    fn rotate(&mut self) -> Result<()> {
        let current = self.current.as_mut().expect("rotation without a current tap");
        tracing::info!(
            bytes = current.bytes_read(),
            threshold = self.rotate_bytes,
            path = ?self.log_path,
            "rotating"
        );

        std::fs::rename(&self.log_path, &self.hanging_path).map_err(|e| Error::Rotate {
            cause: e,
            path: self.hanging_path.clone(),
        })?;

        // Recreate the live log immediately; the producer keeps writing
        // through its old descriptor until it handles SIGUSR1.
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o644)
            .open(&self.log_path)
            .map_err(|e| Error::Rotate { cause: e, path: self.log_path.clone() })?;

        // The follower's descriptor survived the rename; it is now the
        // hanging file's tailer in everything but slot position.
        current.relabel(&self.hanging_path);

        if let Some(mut old) = self.hanging.take() {
            tracing::debug!(path = ?old.path(), "previous hanging file is done");
            old.close()?;
            old.log_exit();
        }

        self.hanging = Some(CatTap::follow(&self.log_path, false)?);

        match kill(self.producer_pid, Signal::SIGUSR1) {
            Ok(()) => {
                tracing::debug!(pid = self.producer_pid.as_raw(), "sent SIGUSR1 to producer");
            }
            Err(e) => {
                tracing::warn!(
                    pid = self.producer_pid.as_raw(),
                    error = %e,
                    "could not signal producer, treating it as gone"
                );
                self.producer_is_gone = true;
            }
        }

        // Flush everything buffered from the old file; this also gives the
        // producer time to reopen and the new hanging tap time to settle.
        let flushed = self.sink.flush_all(&mut self.queue)?;
        if self.sink.got_eof() {
            tracing::warn!(bytes = flushed, "sink got EOF during the rotation flush");
            return Err(Error::SinkClosed);
        }
        tracing::debug!(bytes = flushed, "flushed all records at the rotation boundary");

        mem::swap(&mut self.current, &mut self.hanging);

        self.settle()
    }

    /// Drain the tail of the rotated file until it stays quiet for a full
    /// settle window, preserving byte order across the boundary.
    fn settle(&mut self) -> Result<()> {
        let tap = self.hanging.as_mut().expect("settle without a hanging tap");
        let before = self.queue.len();
        let mut bytes_read: u64 = 0;
        loop {
            let fd = tap.fd().expect("settle on a closed tap");
            let mut rfds = FdSet::new();
            rfds.insert(fd);
            match select(Some(&mut rfds), None, Some(Duration::from_millis(SETTLE_MSEC))) {
                Ok(0) => {
                    tracing::debug!(
                        bytes = bytes_read,
                        records = self.queue.len(),
                        "rotated file settled"
                    );
                    return Ok(());
                }
                Ok(_) => match tap.read(&mut self.scratch)? {
                    TapRead::Data(n) => {
                        self.queue.push(Source::HangingSettle, &self.scratch[..n]);
                        bytes_read += n as u64;
                        let chunks = self.queue.len() - before;
                        if chunks >= SETTLE_LIMIT {
                            tracing::warn!(chunks, "rotated file is not settling");
                            return Err(Error::SettleOverflow { chunks });
                        }
                    }
                    TapRead::WouldBlock => continue,
                    TapRead::Eof => {
                        return Err(Error::TapEof { path: tap.path().to_path_buf() });
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io_err(e, "select in settle")),
            }
        }
    }

    fn cleanup(&mut self) {
        for slot in [&mut self.current, &mut self.hanging] {
            if let Some(mut tap) = slot.take() {
                tracing::debug!(pid = tap.pid().as_raw(), path = ?tap.path(), "closing tailer");
                if let Err(e) = tap.close() {
                    tracing::warn!(error = %e, "closing tailer failed");
                }
                tap.log_exit();
            }
        }
        self.stdin_tap.close();
    }
}
