//! Final run classification and bounded diagnostic logging.

use colored::Colorize;
use regex::Regex;

use crate::qemu::patterns::SUMMARY;

/// Default tail limit for non-pass diagnostics.
pub const TAIL_LIMIT: usize = 2000;
/// Larger limit for panic and probe dumps.
pub const PANIC_TAIL_LIMIT: usize = 4000;

/// Terminal classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    Skip,
    /// The run aborted before any classification could be made.
    Error,
}

impl Verdict {
    pub fn exit_code(self) -> i32 {
        match self {
            Verdict::Pass => 0,
            Verdict::Fail | Verdict::Error => 1,
            Verdict::Skip => 2,
        }
    }
}

/// Print the terminal `PASS:`/`FAIL:`/`SKIP:` line.
pub fn announce(verdict: Verdict, reason: &str) {
    match verdict {
        Verdict::Pass => println!("{} {}", "PASS:".green().bold(), reason),
        Verdict::Fail | Verdict::Error => println!("{} {}", "FAIL:".red().bold(), reason),
        Verdict::Skip => println!("{} {}", "SKIP:".yellow().bold(), reason),
    }
}

/// Log the last `limit` characters of `buffer` under a label.
pub fn log_tail(buffer: &str, label: &str, limit: usize) {
    let mut start = buffer.len().saturating_sub(limit);
    while start < buffer.len() && !buffer.is_char_boundary(start) {
        start += 1;
    }
    println!("{} output tail:\n{}", label, &buffer[start..]);
}

/// Parsed in-guest test summary line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl Summary {
    /// Find and parse the `Summary: pass=P fail=F skip=S` marker.
    pub fn parse(buffer: &str) -> Option<Self> {
        let re = Regex::new(SUMMARY).ok()?;
        let caps = re.captures(buffer)?;
        Some(Self {
            passed: caps.get(1)?.as_str().parse().ok()?,
            failed: caps.get(2)?.as_str().parse().ok()?,
            skipped: caps.get(3)?.as_str().parse().ok()?,
        })
    }

    /// Any failure fails the run; nothing passed but something skipped is a
    /// skip; everything else passes.
    pub fn verdict(self) -> Verdict {
        if self.failed > 0 {
            Verdict::Fail
        } else if self.passed == 0 && self.skipped > 0 {
            Verdict::Skip
        } else {
            Verdict::Pass
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_map_pass_fail_skip() {
        assert_eq!(Verdict::Pass.exit_code(), 0);
        assert_eq!(Verdict::Fail.exit_code(), 1);
        assert_eq!(Verdict::Error.exit_code(), 1);
        assert_eq!(Verdict::Skip.exit_code(), 2);
    }

    #[test]
    fn summary_parses_from_noisy_buffer() {
        let buffer = "running...\nSummary: pass=2 fail=0 skip=1\n# ";
        assert_eq!(
            Summary::parse(buffer),
            Some(Summary {
                passed: 2,
                failed: 0,
                skipped: 1
            })
        );
        assert_eq!(Summary::parse("no summary here"), None);
    }

    #[test]
    fn summary_classification() {
        let v = |p, f, s| {
            Summary {
                passed: p,
                failed: f,
                skipped: s,
            }
            .verdict()
        };
        assert_eq!(v(0, 0, 3), Verdict::Skip);
        assert_eq!(v(2, 0, 0), Verdict::Pass);
        assert_eq!(v(1, 1, 0), Verdict::Fail);
        assert_eq!(v(0, 0, 0), Verdict::Pass);
    }

    #[test]
    fn log_tail_bounds_output() {
        // No panic on short buffers or multi-byte boundaries.
        log_tail("short", "label", 2000);
        log_tail("héllo wörld", "label", 4);
    }
}
