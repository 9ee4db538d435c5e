//! Copy-then-compare fallback for guests without the purpose-built test
//! binary.
//!
//! Planning is pure: safety gates (block-write opt-in, 512-byte alignment,
//! transfer cap) are enforced before any command is sent to the guest. The
//! shell pipelines only use baseline utilities and guard each one with a
//! `__DD_SKIP__` escape so a missing tool skips instead of failing.

use crate::qemu::patterns::{
    capture_rc, FALLBACK_DONE, FALLBACK_OK_MARKER, FALLBACK_SKIP_MARKER,
};
use crate::verdict::Verdict;

/// Minimum transfer unit for raw device targets.
pub const SECTOR: u64 = 512;
/// Cap on transferred sectors, to keep the write bounded and quick.
pub const MAX_SECTORS: u64 = 8;

/// What the fallback step should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Do not touch the guest; skip with this reason.
    Skip(&'static str),
    /// Send this shell command, then collect `__DD_DONE__:$?`.
    Run(String),
}

/// Decide the fallback action for the target. Pure; no I/O.
pub fn plan(device: &str, offset: u64, size: u64, allow_block: bool) -> Plan {
    let file_mode = !device.starts_with("/dev/");

    if file_mode {
        return Plan::Run(file_copy_command(device));
    }
    if !allow_block {
        return Plan::Skip("dd fallback unsafe for block devices");
    }
    if offset % SECTOR != 0 || size % SECTOR != 0 {
        return Plan::Skip("dd fallback requires 512-byte alignment");
    }
    let count = (size / SECTOR).min(MAX_SECTORS);
    if count == 0 {
        return Plan::Skip("dd fallback size too small");
    }
    Plan::Run(device_copy_command(device, offset / SECTOR, count))
}

/// Classify the buffer captured after the fallback pipeline ran.
///
/// Panic handling happens in the session before this is consulted.
pub fn classify(buffer: &str) -> Verdict {
    let Some(rc) = capture_rc(FALLBACK_DONE, buffer) else {
        return Verdict::Fail;
    };
    if rc == 0 && buffer.contains(FALLBACK_OK_MARKER) {
        return Verdict::Pass;
    }
    if rc == 2 || buffer.contains(FALLBACK_SKIP_MARKER) {
        return Verdict::Skip;
    }
    Verdict::Fail
}

/// POSIX single-quote escaping for a path interpolated into `sh -c`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

/// Write a short fixed payload to a scratch file, copy it onto the target
/// path, and byte-compare the two.
fn file_copy_command(device: &str) -> String {
    format!(
        "sh -c '\
         test -x /bin/cat || {{ echo __DD_SKIP__; exit 2; }}; \
         test -x /usr/bin/cmp || {{ echo __DD_SKIP__; exit 2; }}; \
         echo __DD_STEP1__; \
         mkdir -p /usr/tmp >/dev/null 2>&1; \
         echo minix > /usr/tmp/vb.src 2>/dev/null || exit 1; \
         echo __DD_STEP2__; \
         /bin/cat /usr/tmp/vb.src > \"$1\" 2>/dev/null || exit 1; \
         echo __DD_STEP3__; \
         /usr/bin/cmp /usr/tmp/vb.src \"$1\" >/dev/null 2>&1 || exit 1; \
         echo __DD_OK__\
         ' sh {}",
        shell_quote(device)
    )
}

/// Generate a deterministic source block, write it at the requested offset
/// with a non-truncating dd, read it back from the same offset, and compare.
fn device_copy_command(device: &str, seek_sectors: u64, count: u64) -> String {
    format!(
        "sh -c '\
         test -x /bin/dd || {{ echo __DD_SKIP__; exit 2; }}; \
         test -x /usr/bin/cmp || {{ echo __DD_SKIP__; exit 2; }}; \
         mkdir -p /usr/tmp >/dev/null 2>&1; \
         dd if=/bin/sh of=/usr/tmp/vb.src bs=512 count={count} 2>/dev/null || exit 1; \
         dd if=/usr/tmp/vb.src of=\"$1\" bs=512 seek={seek} conv=notrunc 2>/dev/null || exit 1; \
         dd if=\"$1\" of=/usr/tmp/vb.dst bs=512 skip={seek} count={count} 2>/dev/null || exit 1; \
         cmp /usr/tmp/vb.src /usr/tmp/vb.dst >/dev/null 2>&1 || exit 1; \
         echo __DD_OK__\
         ' sh {device}",
        count = count,
        seek = seek_sectors,
        device = shell_quote(device)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_device_without_opt_in_skips_before_sending() {
        assert_eq!(
            plan("/dev/c0d0", 0, 4096, false),
            Plan::Skip("dd fallback unsafe for block devices")
        );
    }

    #[test]
    fn misaligned_offset_skips() {
        assert_eq!(
            plan("/dev/c0d0", 100, 512, true),
            Plan::Skip("dd fallback requires 512-byte alignment")
        );
    }

    #[test]
    fn zero_sized_transfer_skips() {
        assert_eq!(
            plan("/dev/c0d0", 0, 0, true),
            Plan::Skip("dd fallback size too small")
        );
    }

    #[test]
    fn sector_count_is_capped() {
        let Plan::Run(cmd) = plan("/dev/c0d0", 1024 * 1024, 64 * 512, true) else {
            panic!("expected a runnable plan");
        };
        assert!(cmd.contains("count=8"));
        assert!(cmd.contains("seek=2048"));
        assert!(cmd.contains("conv=notrunc"));
    }

    #[test]
    fn file_target_uses_cat_and_cmp() {
        let Plan::Run(cmd) = plan("/usr/tmp/target.bin", 100, 17, false) else {
            panic!("expected a runnable plan");
        };
        assert!(cmd.contains("/bin/cat"));
        assert!(cmd.contains("/usr/bin/cmp"));
        assert!(cmd.contains("'/usr/tmp/target.bin'"));
    }

    #[test]
    fn classify_handles_all_marker_shapes() {
        assert_eq!(classify("__DD_OK__\n__DD_DONE__:0\n"), Verdict::Pass);
        assert_eq!(classify("__DD_DONE__:2\n"), Verdict::Skip);
        assert_eq!(classify("__DD_SKIP__\n__DD_DONE__:1\n"), Verdict::Skip);
        assert_eq!(classify("__DD_DONE__:1\n"), Verdict::Fail);
        // rc 0 without the success marker is still a failure.
        assert_eq!(classify("__DD_DONE__:0\n"), Verdict::Fail);
        // No completion marker at all.
        assert_eq!(classify("half-finished output"), Verdict::Fail);
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/dev/c0d0"), "'/dev/c0d0'");
        assert_eq!(shell_quote("a'b"), r#"'a'\''b'"#);
    }
}
