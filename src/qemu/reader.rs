//! Pattern-matching reader for the guest console.
//!
//! `read_until()` accumulates console bytes into a text buffer and returns as
//! soon as one of the caller's patterns matches, the stream ends, or the
//! deadline passes. The buffer is append-only within a wait and every append
//! re-scans the whole buffer, so a pattern split across read chunks is still
//! found once fully buffered.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use regex::Regex;

use super::patterns::Tag;

/// Per-iteration poll slice. Keeps every wait responsive to the overall
/// deadline and to external interruption.
const POLL_SLICE_MS: u16 = 200;
const READ_CHUNK: usize = 4096;

/// Ordered list of (tag, pattern) pairs.
///
/// List order is priority order: when several patterns match the same buffer
/// state, the first entry wins. Callers put fatal patterns (panic) first.
pub struct PatternSet {
    entries: Vec<(Tag, Regex)>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a pattern with the tag to report when it matches.
    pub fn with(mut self, tag: Tag, pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern)
            .with_context(|| format!("invalid console pattern {:?}", pattern))?;
        self.entries.push((tag, re));
        Ok(self)
    }

    /// First matching entry in list order, if any.
    pub fn first_match(&self, buffer: &str) -> Option<Tag> {
        self.entries
            .iter()
            .find(|(_, re)| re.is_match(buffer))
            .map(|(tag, _)| *tag)
    }
}

impl Default for PatternSet {
    fn default() -> Self {
        Self::new()
    }
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A pattern matched; the tag says which one.
    Matched(Tag),
    /// The channel reported end-of-stream before any pattern matched.
    Eof,
    /// The deadline elapsed with no match and no end-of-stream.
    TimedOut,
}

/// Result of a single wait: everything read so far plus how it ended.
#[derive(Debug)]
pub struct Wait {
    pub buffer: String,
    pub outcome: WaitOutcome,
}

impl Wait {
    pub fn matched(&self) -> Option<Tag> {
        match self.outcome {
            WaitOutcome::Matched(tag) => Some(tag),
            _ => None,
        }
    }
}

/// Read from `fd` until a pattern matches, the stream ends, or `timeout`
/// elapses. Never blocks longer than one poll slice at a time and never
/// fails on undecodable bytes (they are replaced, not rejected).
pub fn read_until(fd: BorrowedFd<'_>, patterns: &PatternSet, timeout: Duration) -> Wait {
    let mut buffer = String::new();
    let deadline = Instant::now() + timeout;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Wait {
                buffer,
                outcome: WaitOutcome::TimedOut,
            };
        }

        let slice = (deadline - now).min(Duration::from_millis(u64::from(POLL_SLICE_MS)));
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(slice.as_millis() as u16)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(_) => {
                return Wait {
                    buffer,
                    outcome: WaitOutcome::Eof,
                }
            }
        }

        let mut chunk = [0u8; READ_CHUNK];
        match nix::unistd::read(fd.as_raw_fd(), &mut chunk) {
            Ok(0) => {
                return Wait {
                    buffer,
                    outcome: WaitOutcome::Eof,
                }
            }
            Ok(n) => {
                buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
                if let Some(tag) = patterns.first_match(&buffer) {
                    return Wait {
                        buffer,
                        outcome: WaitOutcome::Matched(tag),
                    };
                }
            }
            Err(Errno::EINTR) => continue,
            // A pty master raises EIO once the slave side is gone; treat it
            // the same as a zero-length read.
            Err(_) => {
                return Wait {
                    buffer,
                    outcome: WaitOutcome::Eof,
                }
            }
        }
    }
}
