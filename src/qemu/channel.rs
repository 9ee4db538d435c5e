//! Duplex console channel to the spawned guest process.
//!
//! The guest launcher is spawned with its standard streams on the slave side
//! of a pseudo-terminal so getty sees an interactive terminal. When pty
//! allocation fails we fall back to plain pipes with stderr merged into
//! stdout. Either way the parent holds exactly one read fd and one write fd.
//!
//! Teardown is idempotent and wired into `Drop`, so the guest process is
//! signaled and reaped exactly once on every exit path.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::pty::openpty;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Grace period between SIGTERM and SIGKILL during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Ctrl-A x: asks the QEMU stdio console mux to quit the emulator.
const CONSOLE_QUIT: &[u8] = b"\x01x";

/// A spawned guest process plus the duplex byte channel to its console.
pub struct Console {
    child: Child,
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    shut_down: bool,
}

impl Console {
    /// Spawn `cmd` with its console attached to this channel.
    pub fn spawn(cmd: &mut Command) -> Result<Self> {
        match openpty(None, None) {
            Ok(pty) => {
                let stdin = pty.slave.try_clone().context("dup pty slave for stdin")?;
                let stdout = pty.slave.try_clone().context("dup pty slave for stdout")?;
                cmd.stdin(Stdio::from(stdin))
                    .stdout(Stdio::from(stdout))
                    .stderr(Stdio::from(pty.slave));
                let child = cmd.spawn().context("failed to spawn guest launcher")?;
                // The slave fds were consumed by the child's stdio; only the
                // master remains open in the parent, so reads see EOF/EIO
                // once the child exits instead of hanging.
                let write_fd = pty.master.try_clone().context("dup pty master")?;
                Ok(Self {
                    child,
                    read_fd: pty.master,
                    write_fd,
                    shut_down: false,
                })
            }
            Err(_) => {
                // No pty available (e.g. restricted CI environment). Merge
                // stderr into the output pipe like the serial console would.
                let (out_read, out_write) =
                    nix::unistd::pipe().context("allocating output pipe")?;
                let (in_read, in_write) = nix::unistd::pipe().context("allocating input pipe")?;
                let err_write = out_write.try_clone().context("dup output pipe for stderr")?;
                cmd.stdin(Stdio::from(in_read))
                    .stdout(Stdio::from(out_write))
                    .stderr(Stdio::from(err_write));
                let child = cmd.spawn().context("failed to spawn guest launcher")?;
                Ok(Self {
                    child,
                    read_fd: out_read,
                    write_fd: in_write,
                    shut_down: false,
                })
            }
        }
    }

    /// Read side of the channel, for `read_until()`.
    pub fn read_fd(&self) -> BorrowedFd<'_> {
        self.read_fd.as_fd()
    }

    /// Write `text` to the guest console. Synchronous; does not wait for any
    /// response.
    pub fn send(&mut self, text: &str) -> Result<()> {
        let mut bytes = text.as_bytes();
        while !bytes.is_empty() {
            match nix::unistd::write(self.write_fd.as_fd(), bytes) {
                Ok(n) => bytes = &bytes[n..],
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("write to guest console failed"),
            }
        }
        Ok(())
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Tear the guest down: console quit escape, SIGTERM, bounded grace
    /// period, SIGKILL. Safe to call more than once; only the first call
    /// acts. Errors are ignored since the run's verdict is already decided.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        let _ = nix::unistd::write(self.write_fd.as_fd(), CONSOLE_QUIT);
        let pid = Pid::from_raw(self.child.id() as i32);
        let _ = kill(pid, Signal::SIGTERM);

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                Err(_) => break,
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qemu::patterns::{self, Tag};
    use crate::qemu::reader::{read_until, PatternSet};

    #[test]
    fn shutdown_reaps_child_and_is_idempotent() {
        let mut console = Console::spawn(&mut Command::new("cat")).unwrap();
        let pid = Pid::from_raw(console.pid() as i32);

        console.shutdown();
        // The child must be gone (signal 0 probe fails with ESRCH).
        assert_eq!(kill(pid, None), Err(Errno::ESRCH));

        // Second call is a no-op, not a double kill/wait.
        console.shutdown();
    }

    #[test]
    fn drop_tears_down_the_child() {
        let pid;
        {
            let console = Console::spawn(&mut Command::new("cat")).unwrap();
            pid = Pid::from_raw(console.pid() as i32);
        }
        assert_eq!(kill(pid, None), Err(Errno::ESRCH));
    }

    #[test]
    fn send_round_trips_through_the_child() {
        // cat echoes whatever we type; the pattern reader must see it back.
        let mut console = Console::spawn(&mut Command::new("cat")).unwrap();
        console.send("echo __TEST_RC__:0\n").unwrap();

        let set = PatternSet::new()
            .with(Tag::TestRc, patterns::TEST_RC)
            .unwrap();
        let wait = read_until(console.read_fd(), &set, Duration::from_secs(10));
        assert_eq!(wait.matched(), Some(Tag::TestRc));

        console.shutdown();
    }
}
