//! Launch command builder and backing disk image handling.
//!
//! The guest is started through a wrapper script that takes the kernel, the
//! shared host directory, and the backing disk image, and exposes the serial
//! console on its standard streams.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

/// Builder for the guest launcher command line.
#[derive(Default)]
pub struct LaunchBuilder {
    script: PathBuf,
    kernel: Option<PathBuf>,
    share_dir: Option<PathBuf>,
    disk: Option<PathBuf>,
}

impl LaunchBuilder {
    pub fn new(script: &Path) -> Self {
        Self {
            script: script.to_path_buf(),
            ..Default::default()
        }
    }

    /// Kernel image to boot (`-k`).
    pub fn kernel(mut self, path: &Path) -> Self {
        self.kernel = Some(path.to_path_buf());
        self
    }

    /// Host directory shared into the guest (`-B`).
    pub fn share_dir(mut self, path: &Path) -> Self {
        self.share_dir = Some(path.to_path_buf());
        self
    }

    /// Backing disk image exposed as the virtio block device (`-i`).
    pub fn disk(mut self, path: &Path) -> Self {
        self.disk = Some(path.to_path_buf());
        self
    }

    pub fn build(self) -> Command {
        let mut cmd = Command::new(&self.script);
        // -s puts the guest serial console on the script's stdio.
        cmd.arg("-s");
        if let Some(kernel) = &self.kernel {
            cmd.arg("-k").arg(kernel);
        }
        if let Some(share_dir) = &self.share_dir {
            cmd.arg("-B").arg(share_dir);
        }
        if let Some(disk) = &self.disk {
            cmd.arg("-i").arg(disk);
        }
        cmd
    }
}

/// Create a sparse disk image of exactly `size` bytes.
pub fn create_disk(path: &Path, size: u64) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create disk image {}", path.display()))?;
    file.set_len(size)
        .with_context(|| format!("failed to size disk image {}", path.display()))?;
    Ok(())
}

/// Backing disk image for a run.
///
/// A temporary image (created because the caller supplied none) is deleted
/// when the handle drops; a caller-supplied image is never touched.
pub struct DiskImage {
    path: PathBuf,
    temporary: bool,
}

impl DiskImage {
    /// Wrap a caller-owned image. Never deleted by this tool.
    pub fn supplied(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            temporary: false,
        }
    }

    /// Create a temporary image in the system temp directory.
    pub fn temporary(size: u64) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("io-smoke-{}.img", std::process::id()));
        create_disk(&path, size)?;
        Ok(Self {
            path,
            temporary: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }
}

impl Drop for DiskImage {
    fn drop(&mut self) {
        if self.temporary {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn build_passes_launcher_flags_in_order() {
        let cmd = LaunchBuilder::new(Path::new("/tools/qemu.sh"))
            .kernel(Path::new("/boot/kernel"))
            .share_dir(Path::new("/destdir"))
            .disk(Path::new("/tmp/disk.img"))
            .build();

        let args: Vec<&OsStr> = cmd.get_args().collect();
        assert_eq!(cmd.get_program(), "/tools/qemu.sh");
        assert_eq!(
            args,
            [
                "-s",
                "-k",
                "/boot/kernel",
                "-B",
                "/destdir",
                "-i",
                "/tmp/disk.img"
            ]
            .map(OsStr::new)
        );
    }

    #[test]
    fn temporary_image_is_removed_on_drop() {
        let path;
        {
            let disk = DiskImage::temporary(4096).unwrap();
            path = disk.path().to_path_buf();
            assert!(path.exists());
            assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
            assert!(disk.is_temporary());
        }
        assert!(!path.exists());
    }

    #[test]
    fn supplied_image_survives_drop() {
        let path = std::env::temp_dir().join("io-smoke-supplied-test.img");
        create_disk(&path, 512).unwrap();
        {
            let disk = DiskImage::supplied(&path);
            assert!(!disk.is_temporary());
        }
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();
    }
}
