//! End-to-end forwarding and rotation, with real forked children.
//!
//! The producer stand-in is a `cat` child (it only needs a pid to receive
//! SIGUSR1); the sink is a shell `cat > file`, so everything the engine
//! feeds it lands in a file we can compare byte for byte.

use std::fs;
use std::io::Write;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::sys::wait::WaitStatus;

use logfeed::{spawn, Engine, Error, FdTap, Sink};

struct TestDir {
    root: PathBuf,
}

impl TestDir {
    fn new(stem: &str) -> TestDir {
        let root = std::env::temp_dir().join(format!(
            "logfeed-{}-{}",
            stem,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        TestDir { root }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn close_raw(fd: RawFd) {
    unsafe { libc::close(fd) };
}

/// A sink whose stdin is copied verbatim into `out`.
fn file_sink(out: &PathBuf) -> Sink {
    Sink::open(
        &["/bin/sh", "-c", "exec cat > \"$0\"", out.to_str().unwrap()],
        false,
    )
    .unwrap()
}

fn wait_until(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > timeout {
            panic!("timed out waiting for {}", what);
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn bytes_survive_a_rotation() {
    let dir = TestDir::new("rotation");
    let log = dir.path("producer.log");
    let out = dir.path("sink.out");
    fs::write(&log, b"").unwrap();

    let mut producer = spawn(&["cat"], true, None).unwrap();
    let sink = file_sink(&out);
    let (stdin_rd, stdin_wr) = pipe_pair();
    let stdin_tap = FdTap::open(stdin_rd).unwrap();

    // Small threshold so ~100 kB of input forces exactly one rotation.
    let threshold: u64 = 64_000;
    let mut engine =
        Engine::new(producer.pid(), sink, stdin_tap, &log, threshold, false).unwrap();
    let hanging = engine.hanging_path().to_path_buf();

    let worker = std::thread::spawn(move || {
        let outcome = engine.run();
        (outcome, engine)
    });

    // Let the follower open the file and seek to its end before the
    // producer starts writing.
    std::thread::sleep(Duration::from_millis(500));

    let mut written: Vec<u8> = Vec::new();
    for chunk_no in 0..10 {
        let mut chunk = Vec::new();
        for line_no in 0..200 {
            chunk
                .extend_from_slice(format!("chunk {:02} line {:04} {}\n", chunk_no, line_no, "x".repeat(30)).as_bytes());
        }
        // Reopen per chunk, the way a producer that honors SIGUSR1 would
        // land in the fresh file after a rotation.
        let mut f = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log)
            .unwrap();
        f.write_all(&chunk).unwrap();
        drop(f);
        written.extend_from_slice(&chunk);
        std::thread::sleep(Duration::from_millis(60));
    }

    wait_until("the sink to receive every byte", Duration::from_secs(30), || {
        fs::metadata(&out).map(|m| m.len()).unwrap_or(0) == written.len() as u64
    });

    // The rotation left its mark: a hanging file, and one SIGUSR1 at the
    // producer.
    assert!(hanging.exists(), "no {:?} after crossing the threshold", hanging);

    // Clean shutdown: closing our end of stdin asks the engine to stop.
    close_raw(stdin_wr);
    let (outcome, mut engine) = worker.join().unwrap();
    outcome.unwrap();
    engine.close_sink().unwrap();

    let received = fs::read(&out).unwrap();
    assert_eq!(received.len(), written.len());
    assert_eq!(received, written, "sink stream differs from producer stream");

    // `cat` has the default disposition, so the rotation signal is also
    // proof of delivery.
    let status = producer.terminate().unwrap();
    assert!(
        matches!(status, WaitStatus::Signaled(_, nix::sys::signal::Signal::SIGUSR1, _)),
        "producer was not signalled: {:?}",
        status
    );
}

#[test]
fn stdin_eof_is_a_clean_exit() {
    let dir = TestDir::new("stdin-eof");
    let log = dir.path("producer.log");
    let out = dir.path("sink.out");
    fs::write(&log, b"preexisting bytes are skipped\n").unwrap();

    let mut producer = spawn(&["cat"], true, None).unwrap();
    let sink = file_sink(&out);
    let (stdin_rd, stdin_wr) = pipe_pair();
    let stdin_tap = FdTap::open(stdin_rd).unwrap();

    let mut engine = Engine::new(
        producer.pid(),
        sink,
        stdin_tap,
        &log,
        1 << 24,
        false,
    )
    .unwrap();

    let worker = std::thread::spawn(move || {
        let outcome = engine.run();
        (outcome, engine)
    });

    std::thread::sleep(Duration::from_millis(300));
    close_raw(stdin_wr);

    let (outcome, mut engine) = worker.join().unwrap();
    outcome.unwrap();
    engine.close_sink().unwrap();

    // Nothing was produced after startup, and the preexisting bytes
    // predate the tap (it seeks to the end).
    assert_eq!(fs::metadata(&out).unwrap().len(), 0);

    producer.terminate().unwrap();
}

#[test]
fn stdin_bytes_reach_the_sink_too() {
    let dir = TestDir::new("stdin-tap");
    let log = dir.path("producer.log");
    let out = dir.path("sink.out");
    fs::write(&log, b"").unwrap();

    let mut producer = spawn(&["cat"], true, None).unwrap();
    let sink = file_sink(&out);
    let (stdin_rd, stdin_wr) = pipe_pair();
    let stdin_tap = FdTap::open(stdin_rd).unwrap();

    let mut engine =
        Engine::new(producer.pid(), sink, stdin_tap, &log, 1 << 24, false).unwrap();

    let worker = std::thread::spawn(move || {
        let outcome = engine.run();
        (outcome, engine)
    });

    std::thread::sleep(Duration::from_millis(300));
    let note = b"operator note\n";
    assert_eq!(
        unsafe { libc::write(stdin_wr, note.as_ptr() as *const libc::c_void, note.len()) },
        note.len() as isize
    );
    wait_until("the note to reach the sink", Duration::from_secs(10), || {
        fs::metadata(&out).map(|m| m.len()).unwrap_or(0) == note.len() as u64
    });
    close_raw(stdin_wr);

    let (outcome, mut engine) = worker.join().unwrap();
    outcome.unwrap();
    engine.close_sink().unwrap();

    assert_eq!(fs::read(&out).unwrap(), note);
    producer.terminate().unwrap();
}

#[test]
fn dead_sink_is_fatal() {
    let dir = TestDir::new("dead-sink");
    let log = dir.path("producer.log");
    fs::write(&log, b"").unwrap();

    let mut producer = spawn(&["cat"], true, None).unwrap();
    // Exits immediately, without ever reading its stdin.
    let sink = Sink::open(&["false"], true).unwrap();
    let (stdin_rd, stdin_wr) = pipe_pair();
    let stdin_tap = FdTap::open(stdin_rd).unwrap();

    let mut engine =
        Engine::new(producer.pid(), sink, stdin_tap, &log, 1 << 24, false).unwrap();

    let worker = std::thread::spawn(move || {
        let outcome = engine.run();
        (outcome, engine)
    });

    let (outcome, mut engine) = worker.join().unwrap();
    match outcome {
        Err(Error::SinkGone) | Err(Error::SinkClosed) => {}
        other => panic!("expected a sink failure, got {:?}", other.err()),
    }
    engine.close_sink().unwrap();

    close_raw(stdin_wr);
    producer.terminate().unwrap();
}
