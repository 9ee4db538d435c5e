//! QEMU process plumbing: launch command, console channel, pattern reader.

mod channel;
mod launcher;
pub mod patterns;
mod reader;

pub use channel::Console;
pub use launcher::{create_disk, DiskImage, LaunchBuilder};
pub use reader::{read_until, PatternSet, Wait, WaitOutcome};
