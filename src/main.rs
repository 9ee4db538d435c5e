//! io-smoke - QEMU boot + virtio-blk-mmio I/O smoke test.
//!
//! Boots the guest, logs in on the serial console, makes sure the virtio
//! block driver is up, runs the in-guest I/O test (or the dd/cmp fallback),
//! and exits 0 for pass, 1 for fail, 2 for skip.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use io_smoke_tests::qemu::{Console, DiskImage, LaunchBuilder};
use io_smoke_tests::session::{Session, SessionConfig};
use io_smoke_tests::verdict::{announce, Verdict};

/// Device the guest exposes the virtio disk as.
const DEFAULT_DEVICE: &str = "/dev/c0d0";
/// Plain-file target used when --file-fallback is set and no device given.
const FILE_FALLBACK_TARGET: &str = "/usr/tmp/virtio_blk_mmio_test.bin";

#[derive(Parser)]
#[command(name = "io-smoke")]
#[command(about = "QEMU boot + virtio-blk-mmio I/O smoke test")]
struct Cli {
    /// QEMU wrapper script exposing the guest console on stdio
    #[arg(long)]
    qemu_script: PathBuf,

    /// Kernel image to boot
    #[arg(long)]
    kernel: PathBuf,

    /// Host directory shared into the guest
    #[arg(long)]
    destdir: PathBuf,

    /// Compiled in-guest test binary (host path, usually under --destdir)
    #[arg(long)]
    test_bin: PathBuf,

    /// Target device or file path inside the guest
    #[arg(long)]
    device: Option<String>,

    /// Byte offset of the I/O window
    #[arg(long, default_value_t = 1024 * 1024)]
    offset: u64,

    /// Transfer length in bytes
    #[arg(long, default_value_t = 4096)]
    size: u64,

    /// Backing disk image (a temporary one is created when omitted)
    #[arg(long)]
    disk: Option<PathBuf>,

    /// Size in bytes for a temporary disk image
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    disk_size: u64,

    /// Pass -b to the in-guest test (require a block device)
    #[arg(long)]
    require_block: bool,

    /// Target a plain guest file when no --device is given
    #[arg(long)]
    file_fallback: bool,

    /// Run the dd/cmp fallback when the test binary is unavailable
    #[arg(long)]
    dd_fallback: bool,

    /// Allow the dd fallback to write to a real block device
    #[arg(long)]
    dd_unsafe: bool,

    /// Per-step timeout in seconds
    #[arg(long, default_value_t = 90)]
    timeout: u64,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let verdict = match run(&cli) {
        Ok(verdict) => verdict,
        Err(err) => {
            // A run that aborts early still surfaces an explicit verdict line.
            announce(Verdict::Error, &format!("{err:#}"));
            Verdict::Error
        }
    };
    ExitCode::from(verdict.exit_code() as u8)
}

fn run(cli: &Cli) -> Result<Verdict> {
    // Environment-missing conditions skip before any process is spawned.
    if !cli.qemu_script.exists() {
        announce(Verdict::Skip, "qemu script not found");
        return Ok(Verdict::Skip);
    }
    if !cli.kernel.exists() {
        announce(Verdict::Skip, "kernel not found");
        return Ok(Verdict::Skip);
    }
    if !cli.destdir.is_dir() {
        announce(Verdict::Skip, "destdir not found");
        return Ok(Verdict::Skip);
    }
    let test_bin_present = cli.test_bin.exists();
    if !test_bin_present && !cli.dd_fallback {
        announce(Verdict::Skip, "test binary not found in destdir");
        return Ok(Verdict::Skip);
    }

    let disk = match &cli.disk {
        Some(path) => DiskImage::supplied(path),
        None => DiskImage::temporary(cli.disk_size)?,
    };

    let (device, allow_create, require_block) = resolve_target(cli);
    let config = SessionConfig {
        device,
        offset: cli.offset,
        size: cli.size,
        timeout: Duration::from_secs(cli.timeout),
        guest_test_path: test_bin_present.then(|| guest_path(&cli.test_bin, &cli.destdir)),
        dd_fallback: cli.dd_fallback,
        // A throwaway disk is safe to scribble on even without --dd-unsafe.
        allow_block_writes: cli.dd_unsafe || disk.is_temporary(),
        allow_create,
        require_block,
    };

    let mut cmd = LaunchBuilder::new(&cli.qemu_script)
        .kernel(&cli.kernel)
        .share_dir(&cli.destdir)
        .disk(disk.path())
        .build();

    println!("{}", "Starting QEMU smoke test...".cyan());
    let mut console = Console::spawn(&mut cmd)?;
    let verdict = Session::new(&mut console, &config)?.run();
    // Console::drop also shuts down, covering error paths; this is the
    // normal-path teardown. The temp disk goes when `disk` drops.
    console.shutdown();
    verdict
}

/// Pick the target path plus the create/require-block flags for the guest
/// test invocation.
fn resolve_target(cli: &Cli) -> (String, bool, bool) {
    if cli.device.is_none() && cli.file_fallback {
        return (FILE_FALLBACK_TARGET.to_string(), true, false);
    }
    let device = cli
        .device
        .clone()
        .unwrap_or_else(|| DEFAULT_DEVICE.to_string());
    (device, false, cli.require_block)
}

/// Map the host path of the test binary to where it appears inside the guest
/// (the shared directory is the guest's root).
fn guest_path(test_bin: &Path, destdir: &Path) -> String {
    match test_bin.strip_prefix(destdir) {
        Ok(rel) => format!("/{}", rel.display()),
        Err(_) => test_bin.display().to_string(),
    }
}
