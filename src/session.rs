//! Session automaton: the scripted console dialogue with the booted guest.
//!
//! One method per state, driven by a `run()` dispatch loop. Each state sends
//! at most one command, waits on an ordered pattern set, and either names the
//! next state or finishes with a verdict. A detected kernel panic is fatal in
//! every state: the full accumulated buffer is checked for the panic pattern
//! before any other classification.

use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;

use crate::fallback::{self, Plan};
use crate::qemu::patterns::{self, capture_rc, Tag};
use crate::qemu::{read_until, Console, PatternSet, Wait};
use crate::verdict::{announce, log_tail, Verdict, PANIC_TAIL_LIMIT, TAIL_LIMIT};

/// Username sent at the login prompt; the guest image has a passwordless
/// root account, so the password step sends an empty credential.
const LOGIN_USER: &str = "root";

/// Exit code 127 from the shell means the command was not found.
const SHELL_NOT_FOUND_RC: u32 = 127;

const DRIVER_OK_RC: u32 = 0;
/// minix-service exits 16 when the service is already running. This is
/// environment-specific magic inherited from the guest's service manager,
/// not a general contract.
const DRIVER_ALREADY_RUNNING_RC: u32 = 16;

/// Everything the automaton needs to know about the run.
pub struct SessionConfig {
    /// Target device or plain-file path inside the guest.
    pub device: String,
    /// Byte offset of the I/O window.
    pub offset: u64,
    /// Transfer length in bytes.
    pub size: u64,
    /// Per-step timeout.
    pub timeout: Duration,
    /// In-guest path of the test binary; `None` when it is absent on the host.
    pub guest_test_path: Option<String>,
    /// Attempt the dd/cmp fallback when the test binary is unavailable.
    pub dd_fallback: bool,
    /// Explicit opt-in for fallback writes to a raw block device.
    pub allow_block_writes: bool,
    /// Pass `-c` (create target file) to the in-guest test.
    pub allow_create: bool,
    /// Pass `-b` (require a block device) to the in-guest test.
    pub require_block: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitLoginOrPrompt,
    AwaitPasswordOrPrompt,
    HavePrompt,
    EnsureDriver,
    Execute,
    Fallback,
}

enum Flow {
    Goto(State),
    Finish(Verdict),
}

/// Live interaction context for one guest boot.
pub struct Session<'a> {
    console: &'a mut Console,
    config: &'a SessionConfig,
    prompt_re: Regex,
    panic_re: Regex,
    /// Buffer captured by the most recent wait; the read window for guards
    /// like the shell-prompt re-check.
    last_buffer: String,
}

impl<'a> Session<'a> {
    pub fn new(console: &'a mut Console, config: &'a SessionConfig) -> Result<Self> {
        Ok(Self {
            console,
            config,
            prompt_re: Regex::new(patterns::SHELL_PROMPT).context("shell prompt pattern")?,
            panic_re: Regex::new(patterns::PANIC).context("panic pattern")?,
            last_buffer: String::new(),
        })
    }

    /// Drive the automaton to a verdict.
    pub fn run(&mut self) -> Result<Verdict> {
        let mut state = State::AwaitLoginOrPrompt;
        loop {
            let flow = match state {
                State::AwaitLoginOrPrompt => self.await_login_or_prompt()?,
                State::AwaitPasswordOrPrompt => self.await_password_or_prompt()?,
                State::HavePrompt => self.have_prompt(),
                State::EnsureDriver => self.ensure_driver()?,
                State::Execute => self.execute()?,
                State::Fallback => self.fallback()?,
            };
            match flow {
                Flow::Goto(next) => state = next,
                Flow::Finish(verdict) => return Ok(verdict),
            }
        }
    }

    fn wait(&mut self, set: &PatternSet) -> Wait {
        let wait = read_until(self.console.read_fd(), set, self.config.timeout);
        self.last_buffer = wait.buffer.clone();
        wait
    }

    /// Panic check against the whole accumulated buffer. Runs before any
    /// other classification so a panic beats a success marker that landed in
    /// the same buffer.
    fn check_panic(&self, wait: &Wait, label: &str) -> Option<Verdict> {
        if self.panic_re.is_match(&wait.buffer) {
            log_tail(&wait.buffer, label, PANIC_TAIL_LIMIT);
            announce(Verdict::Fail, "kernel panic detected");
            Some(Verdict::Fail)
        } else {
            None
        }
    }

    fn await_login_or_prompt(&mut self) -> Result<Flow> {
        let set = PatternSet::new()
            .with(Tag::Panic, patterns::PANIC)?
            .with(Tag::LoginPrompt, patterns::LOGIN_PROMPT)?
            .with(Tag::ShellPrompt, patterns::SHELL_PROMPT)?;
        let wait = self.wait(&set);

        if let Some(verdict) = self.check_panic(&wait, "Kernel panic") {
            return Ok(Flow::Finish(verdict));
        }
        if wait.matched() == Some(Tag::LoginPrompt) {
            self.console.send(&format!("{}\n", LOGIN_USER))?;
            return Ok(Flow::Goto(State::AwaitPasswordOrPrompt));
        }
        // Shell prompt, timeout, or eof: HavePrompt re-verifies the buffer.
        Ok(Flow::Goto(State::HavePrompt))
    }

    fn await_password_or_prompt(&mut self) -> Result<Flow> {
        let set = PatternSet::new()
            .with(Tag::Panic, patterns::PANIC)?
            .with(Tag::PasswordPrompt, patterns::PASSWORD_PROMPT)?
            .with(Tag::ShellPrompt, patterns::SHELL_PROMPT)?;
        let wait = self.wait(&set);

        if let Some(verdict) = self.check_panic(&wait, "Kernel panic") {
            return Ok(Flow::Finish(verdict));
        }
        if wait.matched() == Some(Tag::PasswordPrompt) {
            // Empty credential: the test account has no password.
            self.console.send("\n")?;
            let set = PatternSet::new()
                .with(Tag::Panic, patterns::PANIC)?
                .with(Tag::ShellPrompt, patterns::SHELL_PROMPT)?;
            let wait = self.wait(&set);
            if let Some(verdict) = self.check_panic(&wait, "Kernel panic") {
                return Ok(Flow::Finish(verdict));
            }
        }
        Ok(Flow::Goto(State::HavePrompt))
    }

    fn have_prompt(&mut self) -> Flow {
        if !self.prompt_re.is_match(&self.last_buffer) {
            log_tail(&self.last_buffer, "Shell prompt not detected", TAIL_LIMIT);
            announce(Verdict::Skip, "shell prompt not detected");
            return Flow::Finish(Verdict::Skip);
        }
        if self.config.device.starts_with("/dev/") {
            Flow::Goto(State::EnsureDriver)
        } else {
            // File-backed target: no driver involvement needed.
            Flow::Goto(State::Execute)
        }
    }

    fn ensure_driver(&mut self) -> Result<Flow> {
        let cmd = format!(
            "PATH=/sbin:/bin:/usr/bin; \
             if /sbin/minix-service sysctl srv_status 2>/dev/null | /bin/grep -q virtio_blk_mmio; then \
             echo __DRV_UP__; \
             else \
             /sbin/minix-service -c up /service/virtio_blk_mmio -dev {}; \
             echo __DRV_UP_RC__:$?; \
             fi\n",
            self.config.device
        );
        self.console.send(&cmd)?;

        let set = PatternSet::new()
            .with(Tag::Panic, patterns::PANIC)?
            .with(Tag::DriverUp, patterns::DRIVER_UP)?
            .with(Tag::DriverRc, patterns::DRIVER_START_RC)?;
        let wait = self.wait(&set);

        if let Some(verdict) = self.check_panic(&wait, "VirtIO blk driver start panic") {
            return Ok(Flow::Finish(verdict));
        }
        if driver_start_ok(&wait.buffer) {
            return Ok(Flow::Goto(State::Execute));
        }

        log_tail(&wait.buffer, "VirtIO blk driver start failed", PANIC_TAIL_LIMIT);
        self.probe()?;
        announce(Verdict::Fail, "virtio_blk_mmio driver unavailable");
        Ok(Flow::Finish(Verdict::Fail))
    }

    /// Best-effort diagnostic dump: service status, process list, artifact
    /// presence. Purely informational; the outcome is ignored.
    fn probe(&mut self) -> Result<()> {
        let cmd = format!(
            "PATH=/sbin:/bin:/usr/bin; \
             echo {start}; \
             sysenv arch 2>&1; \
             /sbin/minix-service sysctl srv_status 2>&1 | /bin/grep virtio 2>&1; \
             /bin/ps 2>&1 | /bin/grep virtio 2>&1; \
             ls -l /bin/test_virtio_blk_mmio /service/virtio_blk_mmio /dev/c0d0 2>&1; \
             echo {end}\n",
            start = patterns::PROBE_START_MARKER,
            end = patterns::PROBE_END_MARKER,
        );
        self.console.send(&cmd)?;

        let set = PatternSet::new().with(Tag::ShellPrompt, patterns::SHELL_PROMPT)?;
        let wait = self.wait(&set);
        log_tail(probe_window(&wait.buffer), "VirtIO blk probe", PANIC_TAIL_LIMIT);
        Ok(())
    }

    fn execute(&mut self) -> Result<Flow> {
        let Some(guest_path) = self.config.guest_test_path.clone() else {
            if self.config.dd_fallback {
                self.probe()?;
                return Ok(Flow::Goto(State::Fallback));
            }
            announce(Verdict::Skip, "test binary not found in destdir");
            return Ok(Flow::Finish(Verdict::Skip));
        };

        let mut cmd = format!(
            "{} -p {} -o {} -s {}",
            guest_path, self.config.device, self.config.offset, self.config.size
        );
        if self.config.allow_create {
            cmd.push_str(" -c");
        }
        if self.config.require_block {
            cmd.push_str(" -b");
        }
        cmd.push('\n');
        self.console.send(&cmd)?;
        self.console.send("echo __TEST_RC__:$?\n")?;

        let set = PatternSet::new()
            .with(Tag::Panic, patterns::PANIC)?
            .with(Tag::TestRc, patterns::TEST_RC)?;
        let wait = self.wait(&set);

        if let Some(verdict) = self.check_panic(&wait, "Kernel panic") {
            return Ok(Flow::Finish(verdict));
        }
        // Past boot, a missing result marker is a failure, not a skip: the
        // environment was healthy enough to take the command.
        let Some(rc) = capture_rc(patterns::TEST_RC, &wait.buffer) else {
            log_tail(&wait.buffer, "Test did not complete", TAIL_LIMIT);
            announce(Verdict::Fail, "test did not complete");
            return Ok(Flow::Finish(Verdict::Fail));
        };

        let not_found = format!("{}: not found", guest_path);
        if rc == SHELL_NOT_FOUND_RC || wait.buffer.contains(&not_found) {
            log_tail(&wait.buffer, "Test binary not found", TAIL_LIMIT);
            if self.config.dd_fallback {
                self.probe()?;
                return Ok(Flow::Goto(State::Fallback));
            }
            announce(Verdict::Skip, "test binary not found in guest");
            return Ok(Flow::Finish(Verdict::Skip));
        }

        let Some(summary) = crate::verdict::Summary::parse(&wait.buffer) else {
            log_tail(&wait.buffer, "Test summary not found", TAIL_LIMIT);
            announce(Verdict::Fail, "test summary not found");
            return Ok(Flow::Finish(Verdict::Fail));
        };

        let verdict = summary.verdict();
        match verdict {
            Verdict::Fail => {
                log_tail(&wait.buffer, "Test output", TAIL_LIMIT);
                announce(Verdict::Fail, "test reported failures");
            }
            Verdict::Skip => announce(Verdict::Skip, "test skipped in guest"),
            _ => announce(Verdict::Pass, "virtio-blk-mmio I/O smoke test"),
        }
        Ok(Flow::Finish(verdict))
    }

    fn fallback(&mut self) -> Result<Flow> {
        let plan = fallback::plan(
            &self.config.device,
            self.config.offset,
            self.config.size,
            self.config.allow_block_writes,
        );
        let command = match plan {
            Plan::Skip(reason) => {
                announce(Verdict::Skip, reason);
                return Ok(Flow::Finish(Verdict::Skip));
            }
            Plan::Run(command) => command,
        };

        self.console.send(&format!("{}\n", command))?;
        self.console.send("echo __DD_DONE__:$?\n")?;

        let set = PatternSet::new()
            .with(Tag::Panic, patterns::PANIC)?
            .with(Tag::FallbackDone, patterns::FALLBACK_DONE)?;
        let wait = self.wait(&set);

        if let Some(verdict) = self.check_panic(&wait, "Kernel panic") {
            return Ok(Flow::Finish(verdict));
        }

        let verdict = fallback::classify(&wait.buffer);
        match verdict {
            Verdict::Pass => announce(Verdict::Pass, "dd/cmp fallback"),
            Verdict::Skip => {
                log_tail(&wait.buffer, "DD fallback skipped", TAIL_LIMIT);
                announce(Verdict::Skip, "dd fallback skipped in guest");
            }
            _ => {
                let label = if wait.buffer.contains("__DD_DONE__") {
                    "DD fallback failed"
                } else {
                    "DD fallback did not complete"
                };
                log_tail(&wait.buffer, label, TAIL_LIMIT);
                announce(Verdict::Fail, "dd fallback failed");
            }
        }
        Ok(Flow::Finish(verdict))
    }
}

/// Driver ensure/start succeeded: already-up marker, clean start, or the
/// already-running sentinel.
fn driver_start_ok(buffer: &str) -> bool {
    if buffer.contains(patterns::DRIVER_UP) {
        return true;
    }
    match capture_rc(patterns::DRIVER_START_RC, buffer) {
        Some(rc) => rc == DRIVER_OK_RC || rc == DRIVER_ALREADY_RUNNING_RC,
        None => false,
    }
}

/// Slice the buffer down to the most recent probe marker window, falling back
/// to the whole buffer when the markers did not both appear.
fn probe_window(buffer: &str) -> &str {
    let (Some(start), Some(end)) = (
        buffer.rfind(patterns::PROBE_START_MARKER),
        buffer.rfind(patterns::PROBE_END_MARKER),
    ) else {
        return buffer;
    };
    if end > start {
        &buffer[start..end + patterns::PROBE_END_MARKER.len()]
    } else {
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn config(device: &str, guest_test_path: Option<&str>, timeout: Duration) -> SessionConfig {
        SessionConfig {
            device: device.to_string(),
            offset: 1024 * 1024,
            size: 4096,
            timeout,
            guest_test_path: guest_test_path.map(str::to_string),
            dd_fallback: false,
            allow_block_writes: false,
            allow_create: false,
            require_block: false,
        }
    }

    /// Fake guest: a shell printing a prompt, then a result burst every
    /// second so the execute-state wait always sees one.
    fn fake_guest(bursts: &str) -> Command {
        let script = format!(
            "printf '\\n# '; i=0; while [ $i -lt 20 ]; do sleep 1; printf '{}'; i=$((i+1)); done",
            bursts
        );
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn clean_summary_passes() {
        let mut guest = fake_guest("__TEST_RC__:0\\nSummary: pass=2 fail=0 skip=0\\n");
        let mut console = Console::spawn(&mut guest).unwrap();
        let config = config("/usr/tmp/t.bin", Some("/bin/test_virtio_blk_mmio"), Duration::from_secs(30));
        let verdict = Session::new(&mut console, &config).unwrap().run().unwrap();
        assert_eq!(verdict, Verdict::Pass);
    }

    #[test]
    fn panic_beats_success_markers_in_the_same_buffer() {
        let mut guest = fake_guest("panic __TEST_RC__:0 Summary: pass=1 fail=0 skip=0\\n");
        let mut console = Console::spawn(&mut guest).unwrap();
        let config = config("/usr/tmp/t.bin", Some("/bin/test_virtio_blk_mmio"), Duration::from_secs(30));
        let verdict = Session::new(&mut console, &config).unwrap().run().unwrap();
        assert_eq!(verdict, Verdict::Fail);
    }

    #[test]
    fn silent_guest_skips_as_unbootable() {
        let mut guest = Command::new("sleep");
        guest.arg("30");
        let mut console = Console::spawn(&mut guest).unwrap();
        let config = config("/dev/c0d0", Some("/bin/test_virtio_blk_mmio"), Duration::from_secs(1));
        let verdict = Session::new(&mut console, &config).unwrap().run().unwrap();
        assert_eq!(verdict, Verdict::Skip);
    }

    #[test]
    fn driver_up_marker_is_success() {
        assert!(driver_start_ok("some output\n__DRV_UP__\n# "));
    }

    #[test]
    fn driver_start_rc_zero_and_sentinel_are_success() {
        assert!(driver_start_ok("__DRV_UP_RC__:0\n"));
        // Exit code 16 means "already running" for the guest service manager.
        assert!(driver_start_ok("__DRV_UP_RC__:16\n"));
    }

    #[test]
    fn other_driver_start_codes_are_failure() {
        assert!(!driver_start_ok("__DRV_UP_RC__:1\n"));
        assert!(!driver_start_ok("no markers at all"));
    }

    #[test]
    fn probe_window_slices_between_markers() {
        let buffer = "echo noise __PROBE_START__\narch riscv64\n__PROBE_END__\n# ";
        let window = probe_window(buffer);
        assert!(window.starts_with("__PROBE_START__"));
        assert!(window.ends_with("__PROBE_END__"));

        // Missing markers fall back to the whole buffer.
        assert_eq!(probe_window("just output"), "just output");
    }
}
