//! Readiness waits built on `select(2)`.
//!
//! Everything here is bounded: a deadline is recomputed after every
//! `EINTR`, and redriving gives up after a small number of interrupts
//! rather than spinning forever.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::{Duration, Instant};

use crate::err::{map_io_err, Result};

const MAX_WAIT_EINTR_COUNT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Thin owner of a `fd_set`, tracking the highest inserted descriptor.
pub(crate) struct FdSet {
    raw: libc::fd_set,
    highest: RawFd,
}

impl FdSet {
    pub fn new() -> FdSet {
        let mut raw = unsafe { mem::zeroed::<libc::fd_set>() };
        unsafe { libc::FD_ZERO(&mut raw) };
        FdSet { raw, highest: -1 }
    }

    pub fn insert(&mut self, fd: RawFd) {
        debug_assert!(fd >= 0 && fd < libc::FD_SETSIZE as RawFd);
        unsafe { libc::FD_SET(fd, &mut self.raw) };
        self.highest = self.highest.max(fd);
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        unsafe { libc::FD_ISSET(fd, &self.raw) }
    }

    pub fn highest(&self) -> RawFd {
        self.highest
    }
}

fn to_timeval(d: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: d.as_secs() as libc::time_t,
        tv_usec: d.subsec_micros() as libc::suseconds_t,
    }
}

/// `select(2)` over optional read/write sets.  `EINTR` is surfaced as an
/// `io::Error` of kind `Interrupted`; redriving is the caller's decision.
pub(crate) fn select(
    rfds: Option<&mut FdSet>,
    wfds: Option<&mut FdSet>,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let mut highest = -1;
    let rp = match rfds {
        Some(s) => {
            highest = highest.max(s.highest());
            &mut s.raw as *mut libc::fd_set
        }
        None => ptr::null_mut(),
    };
    let wp = match wfds {
        Some(s) => {
            highest = highest.max(s.highest());
            &mut s.raw as *mut libc::fd_set
        }
        None => ptr::null_mut(),
    };
    let mut tv;
    let tp = match timeout {
        Some(d) => {
            tv = to_timeval(d);
            &mut tv as *mut libc::timeval
        }
        None => ptr::null_mut(),
    };
    let n = unsafe { libc::select(highest + 1, rp, wp, ptr::null_mut(), tp) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Wait until `fd` is ready for the given interest, for at most `msec`
/// milliseconds (0 polls).  Returns `false` on timeout.
pub fn wait_til_ready(fd: RawFd, msec: u64, interest: Interest) -> Result<bool> {
    let start = Instant::now();
    let budget = Duration::from_millis(msec);
    let mut eintr_count = 0;

    loop {
        // msec == 0 degenerates to a single poll.
        let elapsed = start.elapsed();
        if msec > 0 && elapsed > budget {
            return Ok(false);
        }
        let remaining = budget.saturating_sub(elapsed);


        let mut fds = FdSet::new();
        fds.insert(fd);
        let (rp, wp) = match interest {
            Interest::Read => (Some(&mut fds), None),
            Interest::Write => (None, Some(&mut fds)),
        };
        match select(rp, wp, Some(remaining)) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                eintr_count += 1;
                if eintr_count == MAX_WAIT_EINTR_COUNT {
                    return Err(map_io_err(e, format!("waiting on fd {}", fd)));
                }
            }
            Err(e) => return Err(map_io_err(e, format!("select on fd {}", fd))),
        }
    }
}

/// Sleep for `msec` milliseconds, resuming across signal interruptions.
pub fn sleep_ms(msec: u64) {
    let start = Instant::now();
    let budget = Duration::from_millis(msec);
    loop {
        let elapsed = start.elapsed();
        if elapsed >= budget {
            return;
        }
        match select(None, None, Some(budget - elapsed)) {
            Ok(_) => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // Nothing else can fail with empty sets; treat it as slept.
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn read_readiness_follows_data() {
        let (rd, wr) = pipe_pair();
        assert!(!wait_til_ready(rd, 10, Interest::Read).unwrap());
        assert_eq!(
            unsafe { libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1) },
            1
        );
        assert!(wait_til_ready(rd, 1000, Interest::Read).unwrap());
        // An empty pipe is immediately writable.
        assert!(wait_til_ready(wr, 10, Interest::Write).unwrap());
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn sleep_elapses() {
        let start = Instant::now();
        sleep_ms(30);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn fdset_tracks_membership() {
        let (rd, wr) = pipe_pair();
        let mut s = FdSet::new();
        assert!(!s.contains(rd));
        s.insert(rd);
        s.insert(wr);
        assert!(s.contains(rd) && s.contains(wr));
        assert_eq!(s.highest(), rd.max(wr));
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
