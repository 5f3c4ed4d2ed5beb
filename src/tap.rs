//! Read-side byte sources: an inherited descriptor, an opened file, or a
//! forked tail-follower over a path.
//!
//! Every tap reports how many bytes it has produced (`bytes_read`, which
//! drives rotation for the tailer over the live log) and latches EOF.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};

use crate::err::{map_nix_err, Error, Result};
use crate::subprocess::{close_fd, fork_with_pipes, make_fd_non_blocking, Forked, Subprocess};

/// Size of the tail-follower's read buffer.
const TAIL_BUF_SIZE: usize = 0x100000;

/// Outcome of one non-blocking tap read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapRead {
    Data(usize),
    /// `EAGAIN`/`EINTR`; try again after the next readiness wait.
    WouldBlock,
    Eof,
}

fn read_tap_fd(
    fd: RawFd,
    buf: &mut [u8],
    bytes_read: &mut u64,
    got_eof: &mut bool,
    what: &str,
) -> Result<TapRead> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return match Errno::last() {
            Errno::EAGAIN | Errno::EINTR => Ok(TapRead::WouldBlock),
            e => Err(map_nix_err(e, format!("reading {}", what))),
        };
    }
    if n == 0 {
        debug_assert!(!*got_eof);
        *got_eof = true;
        return Ok(TapRead::Eof);
    }
    *bytes_read += n as u64;
    Ok(TapRead::Data(n as usize))
}

/// A tap over a descriptor we inherited (the operator's stdin).
#[derive(Debug)]
pub struct FdTap {
    fd: Option<RawFd>,
    bytes_read: u64,
    got_eof: bool,
}

impl FdTap {
    /// Take over `fd`, marking it non-blocking.
    pub fn open(fd: RawFd) -> Result<FdTap> {
        make_fd_non_blocking(fd)?;
        Ok(FdTap { fd: Some(fd), bytes_read: 0, got_eof: false })
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn got_eof(&self) -> bool {
        self.got_eof
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<TapRead> {
        let fd = self.fd.expect("reading a closed tap");
        read_tap_fd(fd, buf, &mut self.bytes_read, &mut self.got_eof, "fd tap")
    }

    pub fn close(&mut self) {
        close_fd(&mut self.fd);
    }
}

/// A tap over a file we opened ourselves.  The engine does not use this
/// one; it exists so the read semantics can be exercised without a fork.
#[derive(Debug)]
pub struct FileTap {
    path: PathBuf,
    fd: Option<RawFd>,
    bytes_read: u64,
    got_eof: bool,
}

impl FileTap {
    pub fn open(path: &Path) -> Result<FileTap> {
        let cpath = path_to_cstring(path)?;
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY) };
        if fd < 0 {
            return Err(Error::last_os(format!("open({:?})", path)));
        }
        if let Err(e) = make_fd_non_blocking(fd) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Ok(FileTap {
            path: path.to_path_buf(),
            fd: Some(fd),
            bytes_read: 0,
            got_eof: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn got_eof(&self) -> bool {
        self.got_eof
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<TapRead> {
        let fd = self.fd.expect("reading a closed tap");
        read_tap_fd(fd, buf, &mut self.bytes_read, &mut self.got_eof, "file tap")
    }

    pub fn close(&mut self) {
        close_fd(&mut self.fd);
    }
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Child { detail: format!("path contains NUL: {:?}", path) })
}

fn write_exact_fd(fd: RawFd, mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n <= 0 {
            return false;
        }
        buf = &buf[n as usize..];
    }
    true
}

/// The follower child: read the file forever, copying to stdout, backing
/// off while the file yields EOF.  Runs post-fork, so libc only; the read
/// buffer was allocated by the parent and inherited.
fn tail_loop(path: &CStr, seek_end: bool, buf: &mut [u8]) -> ! {
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_RDONLY);
        if fd < 0 {
            libc::_exit(1);
        }
        if seek_end && libc::lseek(fd, 0, libc::SEEK_END) < 0 {
            libc::_exit(1);
        }
        let mut eof_count: u32 = 0;
        loop {
            let n = libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
            if n < 0 {
                libc::_exit(1);
            } else if n > 0 {
                if !write_exact_fd(libc::STDOUT_FILENO, &buf[..n as usize]) {
                    libc::_exit(1);
                }
                eof_count = 0;
            } else {
                // At the end of the file for now; ease off while the
                // producer is quiet.
                eof_count += 1;
                let msec = if eof_count >= 100 {
                    250
                } else if eof_count >= 20 {
                    100
                } else {
                    eof_count * 5
                };
                libc::usleep(msec * 1000);
            }
        }
    }
}

/// A tap fed by a forked tail-follower: the child follows `path` and
/// writes to its stdout, whose parent end is our read side.
#[derive(Debug)]
pub struct CatTap {
    path: PathBuf,
    proc: Subprocess,
    bytes_read: u64,
    got_eof: bool,
}

impl CatTap {
    /// Fork a follower over `path`.  With `seek_end` the follower skips
    /// whatever the file already holds and reports only new bytes.
    pub fn follow(path: &Path, seek_end: bool) -> Result<CatTap> {
        let cpath = path_to_cstring(path)?;
        // Allocated before the fork; the child must not touch the heap.
        let mut tail_buf = vec![0u8; TAIL_BUF_SIZE];

        match fork_with_pipes()? {
            Forked::Parent(proc) => {
                tracing::debug!(path = ?path, pid = proc.pid().as_raw(), seek_end, "follower started");
                Ok(CatTap {
                    path: path.to_path_buf(),
                    proc,
                    bytes_read: 0,
                    got_eof: false,
                })
            }
            Forked::Child => {
                // Drop every inherited descriptor beyond the standard
                // three; the follower must not hold other pipes open.
                unsafe {
                    let max_fd = libc::sysconf(libc::_SC_OPEN_MAX).clamp(0, 65536) as RawFd;
                    for fd in 3..max_fd {
                        libc::close(fd);
                    }
                }
                tail_loop(&cpath, seek_end, &mut tail_buf)
            }
        }
    }

    /// The path this tap believes it is following.  Rotation renames the
    /// file underneath the follower and then relabels the tap.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn relabel(&mut self, path: &Path) {
        self.path = path.to_path_buf();
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.proc.stdout_fd()
    }

    pub fn pid(&self) -> nix::unistd::Pid {
        self.proc.pid()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn got_eof(&self) -> bool {
        self.got_eof
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<TapRead> {
        let fd = self.proc.stdout_fd().expect("reading a closed tap");
        read_tap_fd(fd, buf, &mut self.bytes_read, &mut self.got_eof, "cat tap")
    }

    /// Stop the follower: drop interest in its output, SIGTERM it, then
    /// run the full terminate escalation.
    pub fn close(&mut self) -> Result<()> {
        self.proc.close_stdout();
        self.proc.close_stderr();
        tracing::debug!(pid = self.proc.pid().as_raw(), "stopping follower");
        match kill(self.proc.pid(), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                return Err(map_nix_err(
                    e,
                    format!("kill({}, SIGTERM)", self.proc.pid()),
                ))
            }
        }
        self.proc.terminate()?;
        Ok(())
    }

    /// Whether the follower has been reaped.
    pub fn is_terminated(&self) -> bool {
        self.proc.status().is_some()
    }

    pub fn log_exit(&self) {
        self.proc.log_exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ready::{wait_til_ready, Interest};
    use std::io::Write;

    fn temp_path(stem: &str) -> PathBuf {
        std::env::temp_dir().join(format!("logfeed-{}-{}", stem, std::process::id()))
    }

    #[test]
    fn fd_tap_reads_and_latches_eof() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut tap = FdTap::open(fds[0]).unwrap();
        let mut buf = [0u8; 64];

        assert_eq!(tap.read(&mut buf).unwrap(), TapRead::WouldBlock);
        unsafe { libc::write(fds[1], b"abc".as_ptr() as *const libc::c_void, 3) };
        assert_eq!(tap.read(&mut buf).unwrap(), TapRead::Data(3));
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(tap.bytes_read(), 3);

        unsafe { libc::close(fds[1]) };
        assert_eq!(tap.read(&mut buf).unwrap(), TapRead::Eof);
        assert!(tap.got_eof());
        tap.close();
        assert!(!tap.is_open());
    }

    #[test]
    fn file_tap_reads_whole_file() {
        let path = temp_path("filetap");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"0123456789")
            .unwrap();

        let mut tap = FileTap::open(&path).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(tap.read(&mut buf).unwrap(), TapRead::Data(4));
        assert_eq!(tap.read(&mut buf).unwrap(), TapRead::Data(4));
        assert_eq!(tap.read(&mut buf).unwrap(), TapRead::Data(2));
        assert_eq!(tap.read(&mut buf).unwrap(), TapRead::Eof);
        assert_eq!(tap.bytes_read(), 10);
        tap.close();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn cat_tap_follows_appends() {
        let path = temp_path("cattap");
        std::fs::write(&path, b"first|").unwrap();

        let mut tap = CatTap::follow(&path, false).unwrap();
        let fd = tap.fd().unwrap();
        let mut buf = [0u8; 4096];

        assert!(wait_til_ready(fd, 5000, Interest::Read).unwrap());
        let mut got = Vec::new();
        if let TapRead::Data(n) = tap.read(&mut buf).unwrap() {
            got.extend_from_slice(&buf[..n]);
        }

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"second").unwrap();
        drop(f);

        while got.len() < b"first|second".len() {
            assert!(wait_til_ready(fd, 5000, Interest::Read).unwrap());
            match tap.read(&mut buf).unwrap() {
                TapRead::Data(n) => got.extend_from_slice(&buf[..n]),
                TapRead::WouldBlock => continue,
                TapRead::Eof => panic!("follower pipe closed early"),
            }
        }
        assert_eq!(got, b"first|second");
        assert_eq!(tap.bytes_read(), got.len() as u64);

        tap.close().unwrap();
        assert!(tap.is_terminated());
        std::fs::remove_file(&path).unwrap();
    }
}
