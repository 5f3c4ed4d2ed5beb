//! The downstream log consumer.
//!
//! The sink is a forked child (svlogd, typically) fed on its stdin with
//! non-blocking writes.  Partial writes advance the record's cursor; EPIPE
//! and zero-length writes mean the consumer is gone for good.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::sys::wait::WaitStatus;

use crate::err::{map_nix_err, Error, Result};
use crate::queue::{BufQueue, Record};
use crate::ready::{wait_til_ready, Interest};
use crate::subprocess::{spawn, Subprocess};

/// Outcome of one non-blocking sink write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkWrite {
    Wrote(usize),
    WouldBlock,
    Eof,
}

#[derive(Debug)]
pub struct Sink {
    proc: Subprocess,
    got_eof: bool,
}

impl Sink {
    /// Fork and exec the consumer program.  Its stdin becomes the feed.
    pub fn open(argv: &[&str], search_path: bool) -> Result<Sink> {
        let proc = spawn(argv, search_path, None)?;
        tracing::debug!(pid = proc.pid().as_raw(), argv = ?argv, "sink started");
        Ok(Sink { proc, got_eof: false })
    }

    /// The fd to include in write-readiness sets; `None` once closed.
    pub fn fd(&self) -> Option<RawFd> {
        self.proc.stdin_fd()
    }

    pub fn got_eof(&self) -> bool {
        self.got_eof
    }

    /// Whether the consumer process exited, per the SIGCHLD self-pipe.
    pub fn is_gone(&self) -> bool {
        self.proc.is_gone()
    }

    pub fn pid(&self) -> nix::unistd::Pid {
        self.proc.pid()
    }

    /// Write the unconsumed tail of `record`, advancing its cursor.
    /// `EPIPE` means the sink is unrecoverable and surfaces as
    /// `Error::SinkClosed` after a best-effort stderr drain.
    pub fn write(&mut self, record: &mut Record) -> Result<SinkWrite> {
        let fd = self.proc.stdin_fd().expect("writing a closed sink");
        let rem = record.remaining();
        let n = unsafe { libc::write(fd, rem.as_ptr() as *const libc::c_void, rem.len()) };
        if n < 0 {
            return match Errno::last() {
                Errno::EAGAIN | Errno::EINTR => Ok(SinkWrite::WouldBlock),
                Errno::EPIPE => {
                    tracing::warn!(pid = self.proc.pid().as_raw(), "sink got EPIPE");
                    self.drain_stderr();
                    Err(Error::SinkClosed)
                }
                e => Err(map_nix_err(e, "writing to sink")),
            };
        }
        if n == 0 {
            debug_assert!(!self.got_eof);
            self.got_eof = true;
            return Ok(SinkWrite::Eof);
        }
        record.advance(n as usize);
        Ok(SinkWrite::Wrote(n as usize))
    }

    /// Feed queued records until the sink stops accepting.  A record the
    /// sink did not fully take is returned to the queue head, so no byte
    /// is ever lost or reordered.  Returns the bytes moved; EOF is left
    /// for the caller to observe via `got_eof`.
    pub fn write_queue(&mut self, q: &mut BufQueue) -> Result<usize> {
        let mut total = 0;
        while let Some(mut record) = q.pop() {
            match self.write(&mut record) {
                Ok(SinkWrite::Wrote(n)) => {
                    total += n;
                    if !record.is_consumed() {
                        tracing::trace!(
                            taken = n,
                            left = record.remaining().len(),
                            "sink took a partial record"
                        );
                        q.push_front(record);
                        break;
                    }
                }
                Ok(SinkWrite::WouldBlock) => {
                    q.push_front(record);
                    break;
                }
                Ok(SinkWrite::Eof) => {
                    q.push_front(record);
                    break;
                }
                Err(e) => {
                    q.push_front(record);
                    return Err(e);
                }
            }
        }
        Ok(total)
    }

    /// Quiesce: drive `write_queue` with write-readiness waits until the
    /// queue is empty or the sink ends.  Used at rotation boundaries so
    /// every byte of the old file reaches the sink before the new file's
    /// bytes are accepted.
    pub fn flush_all(&mut self, q: &mut BufQueue) -> Result<usize> {
        let mut total = 0;
        tracing::debug!(records = q.len(), "flushing all queued records");
        while !q.is_empty() {
            total += self.write_queue(q)?;
            if self.got_eof || q.is_empty() {
                break;
            }
            let fd = self.proc.stdin_fd().expect("flushing a closed sink");
            if !wait_til_ready(fd, 5000, Interest::Write)? {
                return Err(Error::Timeout {
                    detail: "waiting for the sink to accept writes".into(),
                });
            }
        }
        Ok(total)
    }

    /// Best-effort pull of whatever the sink said on stderr, for the log.
    pub fn drain_stderr(&self) {
        if let Some(fd) = self.proc.stderr_fd() {
            let mut buf = [0u8; 4096];
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n > 0 {
                tracing::warn!(
                    stderr = %String::from_utf8_lossy(&buf[..n as usize]),
                    "sink stderr"
                );
            }
        }
    }

    /// Stop feeding and shut the consumer down.
    pub fn close(&mut self) -> Result<WaitStatus> {
        self.proc.close_stdin();
        self.proc.terminate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Source;
    use crate::ready::{wait_til_ready, Interest};

    fn read_all_available(fd: RawFd, expect: usize) -> Vec<u8> {
        let mut got = Vec::new();
        while got.len() < expect {
            assert!(wait_til_ready(fd, 5000, Interest::Read).unwrap());
            let mut buf = [0u8; 4096];
            let n = unsafe {
                libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n > 0 {
                got.extend_from_slice(&buf[..n as usize]);
            }
        }
        got
    }

    #[test]
    fn queue_flows_through_a_real_consumer() {
        let mut sink = Sink::open(&["cat"], true).unwrap();
        let mut q = BufQueue::new();
        q.push(Source::Current, b"one ");
        q.push(Source::HangingNormal, b"two ");
        q.push(Source::Stdin, b"three");

        let n = sink.flush_all(&mut q).unwrap();
        assert_eq!(n, 13);
        assert!(q.is_empty());

        // cat echoes the feed onto its stdout pipe.
        let echoed = read_all_available(sink.proc.stdout_fd().unwrap(), 13);
        assert_eq!(echoed, b"one two three");
        assert!(!sink.got_eof());
        sink.close().unwrap();
    }

    #[test]
    fn partial_record_returns_to_queue_head() {
        let mut sink = Sink::open(&["cat"], true).unwrap();
        let mut q = BufQueue::new();
        // Larger than a pipe buffer, so the first pass cannot take it all
        // while nothing reads the other side.
        let big = vec![b'x'; 1 << 20];
        q.push(Source::Current, &big);
        let n = sink.write_queue(&mut q).unwrap();
        assert!(n > 0 && n < big.len());
        assert_eq!(q.len(), 1);
        assert_eq!(q.get(0).unwrap().remaining().len(), big.len() - n);
        sink.close().unwrap();
    }

    #[test]
    fn dead_sink_is_unrecoverable() {
        let mut sink = Sink::open(&["false"], true).unwrap();
        assert!(sink.proc.wait(5000).unwrap().is_some());
        let mut q = BufQueue::new();
        // Overflow the pipe buffer so the write hits EPIPE rather than
        // parking bytes nobody will read.
        q.push(Source::Current, &vec![b'x'; 1 << 20]);
        let mut saw_closed = false;
        for _ in 0..4 {
            match sink.write_queue(&mut q) {
                Err(Error::SinkClosed) => {
                    saw_closed = true;
                    break;
                }
                Ok(_) => continue,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(saw_closed);
        // The unwritten record is still queued for the caller to inspect.
        assert_eq!(q.len(), 1);
        sink.close().unwrap();
    }
}
