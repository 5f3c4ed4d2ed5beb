//! Producer pid lookup.
//!
//! The producer writes its pid file on startup; we may race it, so a
//! missing file is retried a few times before giving up.

use std::io;
use std::path::Path;

use nix::unistd::Pid;

use crate::err::{map_io_err, Error, Result};
use crate::ready::sleep_ms;

const NUMBER_OF_OPEN_TRIES: u32 = 10;
const RETRY_MSEC: u64 = 100;

/// Read an ASCII decimal pid (optional trailing whitespace) from `path`.
pub fn read_pid(path: &Path) -> Result<Pid> {
    let mut attempt = 1;
    let contents = loop {
        match std::fs::read_to_string(path) {
            Ok(s) => break s,
            Err(e) if e.kind() == io::ErrorKind::NotFound && attempt < NUMBER_OF_OPEN_TRIES => {
                tracing::debug!(
                    path = ?path,
                    attempt,
                    of = NUMBER_OF_OPEN_TRIES,
                    "pid file does not exist yet, retrying"
                );
                sleep_ms(RETRY_MSEC);
                attempt += 1;
            }
            Err(e) => return Err(map_io_err(e, format!("opening pid file {:?}", path))),
        }
    };

    let trimmed = contents.trim();
    let pid: i32 = trimmed.parse().map_err(|_| Error::PidFile {
        detail: format!("unparseable contents of {:?}: {:?}", path, trimmed),
    })?;
    if pid <= 0 {
        return Err(Error::PidFile {
            detail: format!("non-positive pid {} in {:?}", pid, path),
        });
    }
    Ok(Pid::from_raw(pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(stem: &str) -> PathBuf {
        std::env::temp_dir().join(format!("logfeed-{}-{}", stem, std::process::id()))
    }

    #[test]
    fn parses_pid_with_trailing_newline() {
        let path = temp_path("pidfile-ok");
        std::fs::write(&path, b"12345\n").unwrap();
        assert_eq!(read_pid(&path).unwrap(), Pid::from_raw(12345));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn rejects_garbage() {
        let path = temp_path("pidfile-bad");
        std::fs::write(&path, b"not-a-pid\n").unwrap();
        assert!(matches!(read_pid(&path).unwrap_err(), Error::PidFile { .. }));
        std::fs::write(&path, b"-4\n").unwrap();
        assert!(matches!(read_pid(&path).unwrap_err(), Error::PidFile { .. }));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn waits_for_a_late_pid_file() {
        let path = temp_path("pidfile-late");
        let _ = std::fs::remove_file(&path);
        let writer = {
            let path = path.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(250));
                std::fs::write(&path, b"777").unwrap();
            })
        };
        assert_eq!(read_pid(&path).unwrap(), Pid::from_raw(777));
        writer.join().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn gives_up_when_the_file_never_appears() {
        let path = temp_path("pidfile-never");
        let _ = std::fs::remove_file(&path);
        assert!(matches!(read_pid(&path).unwrap_err(), Error::Io { .. }));
    }
}
