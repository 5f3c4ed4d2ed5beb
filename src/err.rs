//! Error type and helper functions.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{detail}: {cause}")]
    Io { cause: io::Error, detail: String },

    #[error("{detail}: {cause}")]
    Sys { cause: nix::Error, detail: String },

    #[error("child process: {detail}")]
    Child { detail: String },

    /// The sink closed its standard input (EPIPE or a zero-length write).
    #[error("sink closed its input")]
    SinkClosed,

    /// The sink process exited; reported through the SIGCHLD self-pipe.
    #[error("sink process is gone")]
    SinkGone,

    /// A tailer reached end of file, which only happens when its pipe was
    /// torn down underneath us.
    #[error("tap on {path:?} reached end of file unexpectedly")]
    TapEof { path: PathBuf },

    #[error("rotating {path:?}: {cause}")]
    Rotate { cause: io::Error, path: PathBuf },

    /// A rotated file kept producing data through an entire settle window.
    #[error("rotated file would not settle ({chunks} chunks buffered)")]
    SettleOverflow { chunks: usize },

    #[error("timed out {detail}")]
    Timeout { detail: String },

    #[error("pid file: {detail}")]
    PidFile { detail: String },
}

pub fn map_io_err(cause: io::Error, detail: impl Into<String>) -> Error {
    Error::Io { cause, detail: detail.into() }
}

pub fn map_nix_err(cause: nix::Error, detail: impl Into<String>) -> Error {
    Error::Sys { cause, detail: detail.into() }
}

impl Error {
    /// Shorthand for wrapping the calling thread's errno.
    pub fn last_os(detail: impl Into<String>) -> Error {
        map_io_err(io::Error::last_os_error(), detail)
    }
}
