//! Growable owned byte strings.
//!
//! Payload chunks, paths under construction, and small formatted outputs
//! all pass through `ByteString`.  It is deliberately dumber than `String`:
//! no encoding is assumed, and every operation is byte-oriented.

use std::ffi::CString;
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::path::Path;

use crate::err::{map_io_err, Result};

/// Extra capacity taken on growth: an eighth again plus a small constant,
/// so repeated appends stay amortised-linear.
fn grown_capacity(needed: usize) -> usize {
    needed + (needed >> 3) + 30
}

#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteString {
    v: Vec<u8>,
}

impl ByteString {
    pub fn new() -> ByteString {
        ByteString { v: Vec::new() }
    }

    pub fn with_capacity(n: usize) -> ByteString {
        ByteString { v: Vec::with_capacity(n) }
    }

    pub fn from_slice(s: &[u8]) -> ByteString {
        let mut r = ByteString::new();
        r.append_slice(s);
        r
    }

    /// Load a file's whole contents.
    pub fn from_file(path: &Path) -> Result<ByteString> {
        let v = std::fs::read(path)
            .map_err(|e| map_io_err(e, format!("reading {:?}", path)))?;
        Ok(ByteString { v })
    }

    pub fn len(&self) -> usize {
        self.v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }

    /// Truncate to empty without releasing the allocation.
    pub fn clear(&mut self) {
        self.v.clear();
    }

    fn reserve_to(&mut self, needed: usize) {
        if needed > self.v.capacity() {
            let target = grown_capacity(needed);
            self.v.reserve_exact(target - self.v.len());
        }
    }

    pub fn append_slice(&mut self, s: &[u8]) {
        self.reserve_to(self.v.len() + s.len());
        self.v.extend_from_slice(s);
    }

    pub fn append(&mut self, other: &ByteString) {
        self.append_slice(&other.v);
    }

    pub fn append_str(&mut self, s: &str) {
        self.append_slice(s.as_bytes());
    }

    pub fn append_byte(&mut self, b: u8) {
        self.reserve_to(self.v.len() + 1);
        self.v.push(b);
    }

    pub fn copy_from_slice(&mut self, s: &[u8]) {
        self.clear();
        self.append_slice(s);
    }

    pub fn copy_from(&mut self, other: &ByteString) {
        self.clear();
        self.append(other);
    }

    pub fn copy_from_str(&mut self, s: &str) {
        self.clear();
        self.append_str(s);
    }

    pub fn copy_from_byte(&mut self, b: u8) {
        self.clear();
        self.append_byte(b);
    }

    /// Formatted append; `copy_fmt` is the truncating variant.  Use through
    /// `format_args!`:
    ///
    /// ```ignore
    /// buf.append_fmt(format_args!("{} bytes", n));
    /// ```
    pub fn append_fmt(&mut self, args: fmt::Arguments) {
        fmt::Write::write_fmt(self, args).expect("infallible write");
    }

    pub fn copy_fmt(&mut self, args: fmt::Arguments) {
        self.clear();
        self.append_fmt(args);
    }

    /// Append `when` (seconds since the epoch, rendered in UTC) under an
    /// strftime-style format.  A format that expands past 256 bytes or
    /// contains a NUL appends nothing.
    pub fn append_time(&mut self, fmt: &str, when: i64) {
        let cfmt = match CString::new(fmt) {
            Ok(f) => f,
            Err(_) => return,
        };
        let t = when as libc::time_t;
        let mut tm: libc::tm = unsafe { mem::zeroed() };
        let mut out = [0u8; 256];
        let n = unsafe {
            if libc::gmtime_r(&t, &mut tm).is_null() {
                return;
            }
            libc::strftime(
                out.as_mut_ptr() as *mut libc::c_char,
                out.len(),
                cfmt.as_ptr(),
                &tm,
            )
        };
        self.append_slice(&out[..n]);
    }

    pub fn copy_time(&mut self, fmt: &str, when: i64) {
        self.clear();
        self.append_time(fmt, when);
    }

    pub fn make_upper(&mut self) {
        self.v.make_ascii_uppercase();
    }

    pub fn make_lower(&mut self) {
        self.v.make_ascii_lowercase();
    }

    /// Shift the window `[start, end)` right by `n`, dropping the bytes
    /// that fall off its right edge and filling the vacated left edge with
    /// `pad`.  Out-of-range windows are clamped to the current length.
    pub fn shift_right(&mut self, start: usize, end: usize, n: usize, pad: u8) {
        let end = end.min(self.v.len());
        let start = start.min(end);
        let n = n.min(end - start);
        self.v.copy_within(start..end - n, start + n);
        self.v[start..start + n].fill(pad);
    }

    /// Shift the window `[start, end)` left by `n`, dropping the bytes that
    /// fall off its left edge and filling the vacated right edge with `pad`.
    pub fn shift_left(&mut self, start: usize, end: usize, n: usize, pad: u8) {
        let end = end.min(self.v.len());
        let start = start.min(end);
        let n = n.min(end - start);
        self.v.copy_within(start + n..end, start);
        self.v[end - n..end].fill(pad);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.v
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.v
    }
}

impl Deref for ByteString {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.v
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(v: Vec<u8>) -> ByteString {
        ByteString { v }
    }
}

impl fmt::Write for ByteString {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append_str(s);
        Ok(())
    }
}
