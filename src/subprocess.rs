//! Subprocess management.
//!
//! Children are forked with all three standard streams on pipes whose
//! parent ends are non-blocking.  Exits are observed through a process-wide
//! SIGCHLD self-pipe: the handler writes the exiting pid into the write
//! end, and `drain_selfpipe` turns that into `is_gone` flags on the
//! affected child records.  The process table maps pid to that shared flag
//! and is only ever touched outside the handler.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{
    kill, sigaction, signal, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow,
    Signal,
};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::err::{map_io_err, map_nix_err, Error, Result};
use crate::ready::{select, FdSet};

const MAX_WAIT_SUBPROCESS_EINTR_COUNT: u32 = 25;

const PID_SIZE: usize = mem::size_of::<libc::pid_t>();

static SELFPIPE_RD: AtomicI32 = AtomicI32::new(-1);
static SELFPIPE_WR: AtomicI32 = AtomicI32::new(-1);
static GOT_SIGCHLD: AtomicBool = AtomicBool::new(false);
static SELFPIPE_INIT: Once = Once::new();
static SIGCHLD_SET: OnceLock<SigSet> = OnceLock::new();

/// Every outstanding child, keyed by pid.  The value is the `is_gone` flag
/// shared with the owning `Subprocess`.
static CHILDREN: Mutex<BTreeMap<libc::pid_t, Arc<AtomicBool>>> = Mutex::new(BTreeMap::new());

pub(crate) fn make_fd_non_blocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(Error::last_os(format!("fcntl(F_GETFL) on fd {}", fd)));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(Error::last_os(format!("fcntl(F_SETFL) on fd {}", fd)));
    }
    Ok(())
}

pub(crate) fn close_fd(slot: &mut Option<RawFd>) {
    if let Some(fd) = slot.take() {
        unsafe { libc::close(fd) };
    }
}

/// Right-align a decimal rendering of `v` into `buf[end-11..end]`,
/// space-padded.  Async-signal-safe (no allocation, no formatting
/// machinery).
fn backfill_dec(buf: &mut [u8], end: usize, v: i64) {
    let mut i = end;
    if v == 0 {
        i -= 1;
        buf[i] = b'0';
    } else {
        let neg = v < 0;
        let mut x = v.unsigned_abs();
        while x > 0 && i > end - 11 {
            i -= 1;
            buf[i] = b'0' + (x % 10) as u8;
            x /= 10;
        }
        if neg && i > end - 11 {
            i -= 1;
            buf[i] = b'-';
        }
    }
    while i > end - 11 {
        i -= 1;
        buf[i] = b' ';
    }
}

/// The SIGCHLD handler.  Only async-signal-safe operations: one write of
/// the raw pid, and, if the pipe is full, a drain of the read end plus a
/// hand-formatted diagnostic on stderr.
extern "C" fn handle_sigchld(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let wr = SELFPIPE_WR.load(Ordering::Relaxed);
    if wr != -1 && !info.is_null() {
        let pid: libc::pid_t = unsafe { (*info).si_pid() };
        let r = unsafe {
            libc::write(
                wr,
                &pid as *const libc::pid_t as *const libc::c_void,
                PID_SIZE,
            )
        };
        if r == -1 && Errno::last() == Errno::EAGAIN {
            let rd = SELFPIPE_RD.load(Ordering::Relaxed);
            let mut scratch = [0u8; 4096];
            let drained = unsafe {
                libc::read(rd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len())
            };
            let mut msg = *b"SIGCHLD handler: self-pipe full, drained -1234567890 bytes\n";
            let end = msg.len() - b" bytes\n".len();
            backfill_dec(&mut msg, end, drained as i64);
            unsafe {
                libc::write(
                    libc::STDERR_FILENO,
                    msg.as_ptr() as *const libc::c_void,
                    msg.len(),
                )
            };
        }
    }
    GOT_SIGCHLD.store(true, Ordering::Release);
}

fn selfpipe_setup() {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        panic!("pipe(selfpipe): {}", io::Error::last_os_error());
    }
    make_fd_non_blocking(fds[0]).expect("self-pipe read end");
    make_fd_non_blocking(fds[1]).expect("self-pipe write end");
    SELFPIPE_RD.store(fds[0], Ordering::Relaxed);
    SELFPIPE_WR.store(fds[1], Ordering::Relaxed);

    let act = SigAction::new(
        SigHandler::SigAction(handle_sigchld),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &act) }.expect("sigaction(SIGCHLD)");

    // A broken sink must surface as EPIPE on write, not kill the process.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.expect("signal(SIGPIPE)");

    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    let _ = SIGCHLD_SET.set(set);
}

fn sigchld_set() -> &'static SigSet {
    SIGCHLD_SET.get().expect("self-pipe not initialized")
}

/// The read end of the SIGCHLD self-pipe, for inclusion in select sets.
/// -1 until the first fork.
pub fn selfpipe_read_fd() -> RawFd {
    SELFPIPE_RD.load(Ordering::Relaxed)
}

fn drain_selfpipe0() -> Result<()> {
    let rd = SELFPIPE_RD.load(Ordering::Relaxed);
    loop {
        // Maybe read ten pids at a time.
        let mut buf = [0u8; 10 * PID_SIZE];
        let n =
            unsafe { libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            match Errno::last() {
                Errno::EAGAIN | Errno::EINTR => break,
                e => return Err(map_nix_err(e, "reading self-pipe")),
            }
        }
        let n = n as usize;
        if n == 0 {
            break;
        }
        debug_assert_eq!(n % PID_SIZE, 0);
        let mut table = CHILDREN.lock().unwrap();
        for chunk in buf[..n].chunks_exact(PID_SIZE) {
            let pid = libc::pid_t::from_ne_bytes(chunk.try_into().unwrap());
            if let Some(flag) = table.remove(&pid) {
                flag.store(true, Ordering::Release);
            }
        }
        if n < buf.len() {
            break;
        }
    }
    Ok(())
}

/// Process SIGCHLD notifications, marking the affected children gone and
/// dropping them from the process table.  A no-op when no signal arrived
/// since the last drain.
pub fn drain_selfpipe() -> Result<()> {
    if !GOT_SIGCHLD.load(Ordering::Acquire) {
        return Ok(());
    }
    // Bracket the flag clear so a signal landing in between is not lost.
    let set = sigchld_set();
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(set), None)
        .map_err(|e| map_nix_err(e, "blocking SIGCHLD"))?;
    GOT_SIGCHLD.store(false, Ordering::Release);
    sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(set), None)
        .map_err(|e| map_nix_err(e, "unblocking SIGCHLD"))?;
    drain_selfpipe0()
}

/// Result of `fork_with_pipes`: the parent gets the child record, the
/// child continues with fds 0/1/2 wired to the parent's pipes.
pub enum Forked {
    Parent(Subprocess),
    Child,
}

/// A supervised child process.
#[derive(Debug)]
pub struct Subprocess {
    pid: Pid,
    child_fdin: Option<RawFd>,
    child_fdout: Option<RawFd>,
    child_fderr: Option<RawFd>,
    is_gone: Arc<AtomicBool>,
    status: Option<WaitStatus>,
}

/// Fork a child with its standard streams on fresh pipes.  In the parent,
/// the three returned descriptors are non-blocking and the child is
/// registered in the process table; in the child, fds 0/1/2 point at the
/// pipes and everything else is untouched.
pub fn fork_with_pipes() -> Result<Forked> {
    SELFPIPE_INIT.call_once(selfpipe_setup);

    let mut child_stdin = [0 as RawFd; 2];
    let mut child_stdout = [0 as RawFd; 2];
    let mut child_stderr = [0 as RawFd; 2];
    for fds in [&mut child_stdin, &mut child_stdout, &mut child_stderr] {
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Error::last_os("pipe for child streams"));
        }
    }

    match unsafe { fork() }.map_err(|e| map_nix_err(e, "fork"))? {
        ForkResult::Child => {
            // Read end of stdin, write ends of stdout/stderr; everything
            // here must stay async-signal-safe.
            unsafe {
                if libc::dup2(child_stdin[0], libc::STDIN_FILENO) < 0
                    || libc::dup2(child_stdout[1], libc::STDOUT_FILENO) < 0
                    || libc::dup2(child_stderr[1], libc::STDERR_FILENO) < 0
                {
                    libc::_exit(127);
                }
                libc::close(child_stdin[1]);
                libc::close(child_stdout[0]);
                libc::close(child_stderr[0]);
                libc::close(child_stdin[0]);
                libc::close(child_stdout[1]);
                libc::close(child_stderr[1]);
            }
            Ok(Forked::Child)
        }
        ForkResult::Parent { child } => {
            unsafe {
                libc::close(child_stdin[0]);
                libc::close(child_stdout[1]);
                libc::close(child_stderr[1]);
            }
            let mut fdin = Some(child_stdin[1]);
            let mut fdout = Some(child_stdout[0]);
            let mut fderr = Some(child_stderr[0]);
            for fd in [child_stdin[1], child_stdout[0], child_stderr[0]] {
                if let Err(e) = make_fd_non_blocking(fd) {
                    close_fd(&mut fdin);
                    close_fd(&mut fdout);
                    close_fd(&mut fderr);
                    return Err(e);
                }
            }

            let is_gone = Arc::new(AtomicBool::new(false));
            CHILDREN
                .lock()
                .unwrap()
                .insert(child.as_raw(), Arc::clone(&is_gone));

            Ok(Forked::Parent(Subprocess {
                pid: child,
                child_fdin: fdin,
                child_fdout: fdout,
                child_fderr: fderr,
                is_gone,
                status: None,
            }))
        }
    }
}

/// Fork-and-exec.  `search_path` selects `execvp`; an explicit environment
/// selects `execve`; plain `execv` otherwise.  Requesting both the PATH
/// search and an environment is an error.
pub fn spawn(
    argv: &[&str],
    search_path: bool,
    env: Option<&[(&str, &str)]>,
) -> Result<Subprocess> {
    if argv.is_empty() {
        return Err(Error::Child { detail: "empty argv".into() });
    }
    if env.is_some() && search_path {
        return Err(Error::Child {
            detail: "PATH search cannot be combined with an explicit environment".into(),
        });
    }

    // All allocation happens before the fork; the child may only exec.
    let c_argv: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(*a))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::Child { detail: format!("argv contains NUL: {:?}", argv) })?;
    let c_env: Option<Vec<CString>> = match env {
        Some(kvs) => Some(
            kvs.iter()
                .map(|(k, v)| CString::new(format!("{}={}", k, v)))
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| Error::Child { detail: "environment contains NUL".into() })?,
        ),
        None => None,
    };
    let mut argv_ptrs: Vec<*const libc::c_char> = c_argv.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    let env_ptrs: Option<Vec<*const libc::c_char>> = c_env.as_ref().map(|e| {
        let mut v: Vec<*const libc::c_char> = e.iter().map(|kv| kv.as_ptr()).collect();
        v.push(std::ptr::null());
        v
    });

    match fork_with_pipes()? {
        Forked::Parent(sp) => Ok(sp),
        Forked::Child => {
            unsafe {
                match (&env_ptrs, search_path) {
                    (Some(e), _) => {
                        libc::execve(c_argv[0].as_ptr(), argv_ptrs.as_ptr(), e.as_ptr());
                    }
                    (None, true) => {
                        libc::execvp(c_argv[0].as_ptr(), argv_ptrs.as_ptr());
                    }
                    (None, false) => {
                        libc::execv(c_argv[0].as_ptr(), argv_ptrs.as_ptr());
                    }
                }
            }
            // Exec failed; the parent sees the exit through the self-pipe.
            let msg = b"exec failed\n";
            unsafe {
                libc::write(
                    libc::STDERR_FILENO,
                    msg.as_ptr() as *const libc::c_void,
                    msg.len(),
                );
                libc::_exit(127)
            }
        }
    }
}

impl Subprocess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Parent-side write end of the child's stdin.
    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.child_fdin
    }

    /// Parent-side read end of the child's stdout.
    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.child_fdout
    }

    /// Parent-side read end of the child's stderr.
    pub fn stderr_fd(&self) -> Option<RawFd> {
        self.child_fderr
    }

    /// Set once a SIGCHLD for this child has been drained (or once
    /// `terminate` reaped it).
    pub fn is_gone(&self) -> bool {
        self.is_gone.load(Ordering::Acquire)
    }

    /// Exit status, available after `terminate`.
    pub fn status(&self) -> Option<WaitStatus> {
        self.status
    }

    pub fn close_stdin(&mut self) {
        close_fd(&mut self.child_fdin);
    }

    pub fn close_stdout(&mut self) {
        close_fd(&mut self.child_fdout);
    }

    pub fn close_stderr(&mut self) {
        close_fd(&mut self.child_fderr);
    }

    /// Wait up to `msec` milliseconds for this child to exit, driving the
    /// self-pipe.  Returns the pid once gone, `None` on timeout.  `EINTR`
    /// is redriven a bounded number of times and then treated as a
    /// timeout.
    pub fn wait(&mut self, msec: u64) -> Result<Option<Pid>> {
        debug_assert!(self.status.is_none(), "waiting on a terminated child");
        if self.is_gone() {
            return Ok(Some(self.pid));
        }

        let selfpipe = selfpipe_read_fd();
        let start = Instant::now();
        let budget = Duration::from_millis(msec);
        let mut eintr_count = 0;

        loop {
            // Another caller may drain the pipe and set our flag while we
            // sleep, so wait in slices and re-check the flag each time.
            if self.is_gone() {
                return Ok(Some(self.pid));
            }
            let elapsed = start.elapsed();
            if msec > 0 && elapsed > budget {
                return Ok(None);
            }
            let remaining = budget
                .saturating_sub(elapsed)
                .min(Duration::from_millis(50));

            let mut rfds = FdSet::new();
            rfds.insert(selfpipe);
            match select(Some(&mut rfds), None, Some(remaining)) {
                Ok(0) => {
                    if msec == 0 {
                        return Ok(None);
                    }
                }
                Ok(_) => {
                    eintr_count = 0;
                    drain_selfpipe()?;
                    if self.is_gone() {
                        return Ok(Some(self.pid));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    eintr_count += 1;
                    if eintr_count == MAX_WAIT_SUBPROCESS_EINTR_COUNT {
                        tracing::warn!("too much EINTR, giving up select");
                        return Ok(None);
                    }
                }
                Err(e) => return Err(map_io_err(e, "select on self-pipe")),
            }
        }
    }

    /// Synchronous shutdown: close the child's streams, then escalate from
    /// a polite wait through SIGTERM to a SIGKILL loop until the child is
    /// reaped.  Never returns with the child still outstanding.
    pub fn terminate(&mut self) -> Result<WaitStatus> {
        debug_assert!(self.status.is_none(), "terminating a terminated child");
        drain_selfpipe()?;

        // Closing stdin tells the child we are done producing; closing the
        // read ends gets it a SIGPIPE on its next write.
        self.close_stdin();
        self.close_stdout();
        self.close_stderr();

        let status = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))
            .map_err(|e| map_nix_err(e, format!("waitpid({})", self.pid)))?
        {
            WaitStatus::StillAlive => {
                if self.wait(5000)?.is_none() {
                    tracing::debug!(pid = self.pid.as_raw(), "sending SIGTERM");
                    kill(self.pid, Signal::SIGTERM)
                        .map_err(|e| map_nix_err(e, format!("kill({}, SIGTERM)", self.pid)))?;
                    if self.wait(5000)?.is_none() {
                        // Last resort: an immortal child would pile up, so
                        // retry SIGKILL indefinitely.
                        loop {
                            kill(self.pid, Signal::SIGKILL).map_err(|e| {
                                map_nix_err(e, format!("kill({}, SIGKILL)", self.pid))
                            })?;
                            if self.wait(10000)?.is_some() {
                                break;
                            }
                            tracing::warn!(
                                pid = self.pid.as_raw(),
                                "still alive after SIGKILL, retrying"
                            );
                        }
                    }
                }
                waitpid(self.pid, Some(WaitPidFlag::WNOHANG))
                    .map_err(|e| map_nix_err(e, format!("waitpid({})", self.pid)))?
            }
            reaped => reaped,
        };
        self.status = Some(status);

        // When many children exit at once a SIGCHLD can coalesce away;
        // clean the table by hand if the self-pipe missed this pid.
        if !self.is_gone() {
            tracing::debug!(pid = self.pid.as_raw(), "self-pipe missed this exit");
            CHILDREN.lock().unwrap().remove(&self.pid.as_raw());
            self.is_gone.store(true, Ordering::Release);
        }

        Ok(status)
    }

    /// Log how the child went away.  Only meaningful after `terminate`.
    pub fn log_exit(&self) {
        match self.status {
            Some(WaitStatus::Exited(pid, 0)) => {
                tracing::debug!(pid = pid.as_raw(), "child exited cleanly");
            }
            Some(WaitStatus::Exited(pid, code)) => {
                tracing::info!(pid = pid.as_raw(), code, "child exited with error");
            }
            Some(WaitStatus::Signaled(pid, sig, _)) => {
                tracing::info!(pid = pid.as_raw(), signal = ?sig, "child was killed");
            }
            Some(other) => {
                tracing::debug!(?other, "child status");
            }
            None => {}
        }
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        // Children are shut down explicitly via terminate; this only stops
        // descriptor leaks on error paths.
        self.close_stdin();
        self.close_stdout();
        self.close_stderr();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ready::{wait_til_ready, Interest};

    fn read_some(fd: RawFd, timeout_ms: u64) -> Vec<u8> {
        assert!(wait_til_ready(fd, timeout_ms, Interest::Read).unwrap());
        let mut buf = [0u8; 4096];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert!(n >= 0);
        buf[..n as usize].to_vec()
    }

    #[test]
    fn cat_roundtrip_and_terminate() {
        let mut sp = spawn(&["cat"], true, None).unwrap();
        let fdin = sp.stdin_fd().unwrap();
        let payload = b"through the child\n";
        let n = unsafe {
            libc::write(fdin, payload.as_ptr() as *const libc::c_void, payload.len())
        };
        assert_eq!(n as usize, payload.len());
        let echoed = read_some(sp.stdout_fd().unwrap(), 5000);
        assert_eq!(echoed, payload);

        // terminate closes stdin first, so cat exits on its own.
        let status = sp.terminate().unwrap();
        assert!(matches!(status, WaitStatus::Exited(_, 0)));
        assert!(sp.is_gone());
    }

    #[test]
    fn env_and_search_path_conflict() {
        let err = spawn(&["cat"], true, Some(&[("X", "1")])).unwrap_err();
        assert!(matches!(err, Error::Child { .. }));
    }

    #[test]
    fn exec_failure_is_reported_as_exit() {
        let mut sp = spawn(&["/nonexistent/no-such-program"], false, None).unwrap();
        assert!(sp.wait(5000).unwrap().is_some());
        let status = sp.terminate().unwrap();
        assert!(matches!(status, WaitStatus::Exited(_, 127)));
    }

    #[test]
    fn wait_times_out_on_living_child() {
        let mut sp = spawn(&["cat"], true, None).unwrap();
        assert!(sp.wait(50).unwrap().is_none());
        sp.terminate().unwrap();
    }

    #[test]
    fn drain_is_idempotent() {
        let mut sp = spawn(&["cat"], true, None).unwrap();
        sp.terminate().unwrap();
        // Both drains must succeed; the second is a no-op.
        drain_selfpipe().unwrap();
        drain_selfpipe().unwrap();
    }
}
