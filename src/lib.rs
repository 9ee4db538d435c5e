//! QEMU boot + virtio-blk-mmio I/O smoke test library.
//!
//! Boots a MINIX/riscv64 guest through a QEMU wrapper script, drives its
//! serial console (login, driver start, test execution) with pattern-matched
//! waits, and classifies the outcome into pass/fail/skip.
//!
//! - `qemu` - launcher command, console channel (pty with pipe fallback),
//!   pattern-matching reader
//! - `session` - the state machine over the console dialogue
//! - `fallback` - dd/cmp copy-compare check for guests without the test binary
//! - `verdict` - outcome classification and exit-code mapping

pub mod fallback;
pub mod qemu;
pub mod session;
pub mod verdict;

pub use qemu::{Console, DiskImage, LaunchBuilder, PatternSet, Wait, WaitOutcome};
pub use session::{Session, SessionConfig};
pub use verdict::{Summary, Verdict};
