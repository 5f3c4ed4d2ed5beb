//! Building blocks for the `logfeed` log-rotation intermediary.
//!
//! `logfeed` sits between a producer process that writes a log file and an
//! svlogd-style consumer: it tails the file, feeds the bytes to the
//! consumer's stdin, and every `count-to-rotate` bytes renames the file
//! aside and signals the producer to reopen it.

#![cfg(unix)]

mod err;
pub use err::*;

mod bytes;
pub use bytes::*;

mod queue;
pub use queue::*;

mod ready;
pub use ready::*;

mod subprocess;
pub use subprocess::*;

mod tap;
pub use tap::*;

mod sink;
pub use sink::*;

mod engine;
pub use engine::*;

mod pidfile;
pub use pidfile::*;
