/// Filesystem discipline shared by keystore and persona mutations.
///
/// Multi-file writes go through a private staging directory that is renamed
/// into its final name, so readers never observe a half-constructed persona
/// or kex directory. All files are created 0600, directories 0700.
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, StoreError};

pub(crate) const FILE_MODE: u32 = 0o600;
pub(crate) const DIR_MODE: u32 = 0o700;

/// Private scratch directory, renamed into its final name on publish and
/// cleaned up on every other path.
pub(crate) struct Staging {
    dir: PathBuf,
    files: Vec<PathBuf>,
    published: bool,
}

impl Staging {
    pub fn new(parent: &Path) -> Result<Self> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let name = format!(
            "{:x}.{:x}.{}",
            now.as_secs(),
            now.subsec_micros(),
            std::process::id()
        );
        let dir = parent.join(name);
        DirBuilder::new()
            .mode(DIR_MODE)
            .create(&dir)
            .map_err(|e| StoreError::io(format!("mkdir {}", dir.display()), e))?;
        Ok(Self {
            dir,
            files: Vec::new(),
            published: false,
        })
    }

    /// Write a file inside the staging directory, exclusive-create, 0600.
    pub fn write(&mut self, name: &str, contents: &[u8]) -> Result<()> {
        let path = self.dir.join(name);
        write_excl(&path, contents)?;
        self.files.push(path);
        Ok(())
    }

    /// Best-effort write; a failure leaves no file behind and is reported
    /// through the return value instead of an error.
    pub fn write_optional(&mut self, name: &str, contents: &[u8]) -> bool {
        let path = self.dir.join(name);
        if write_trunc(&path, contents).is_ok() {
            self.files.push(path);
            true
        } else {
            let _ = fs::remove_file(&path);
            false
        }
    }

    /// Atomically publish the staged directory as `dest`.
    pub fn publish(mut self, dest: &Path) -> Result<()> {
        if let Err(e) = fs::rename(&self.dir, dest) {
            // drop cleans up the staged files
            return Err(StoreError::Conflict(format!(
                "cannot publish {}: {e}",
                dest.display()
            )));
        }
        self.published = true;
        Ok(())
    }

    /// Publish, treating an already existing destination as a conflict.
    pub fn publish_if_absent(self, dest: &Path) -> Result<()> {
        if dest.symlink_metadata().is_ok() {
            return Err(StoreError::Conflict(format!(
                "{} already exists",
                dest.display()
            )));
        }
        self.publish(dest)
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        for f in &self.files {
            let _ = fs::remove_file(f);
        }
        let _ = fs::remove_dir(&self.dir);
    }
}

/// O_CREAT|O_EXCL write with mode 0600. Short writes are failures.
pub(crate) fn write_excl(path: &Path, contents: &[u8]) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(FILE_MODE)
        .open(path)
        .map_err(|e| StoreError::io(format!("create {}", path.display()), e))?;
    f.write_all(contents)
        .map_err(|e| StoreError::io(format!("write {}", path.display()), e))
}

/// O_CREAT|O_TRUNC write with mode 0600.
pub(crate) fn write_trunc(path: &Path, contents: &[u8]) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)
        .map_err(|e| StoreError::io(format!("open {}", path.display()), e))?;
    f.write_all(contents)
        .map_err(|e| StoreError::io(format!("write {}", path.display()), e))
}

/// Create an empty marker file, exclusive, 0600. Existing markers are kept.
pub(crate) fn touch_excl(path: &Path) {
    let _ = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(FILE_MODE)
        .open(path);
}

/// First line of a file with the trailing newline trimmed, if readable.
pub(crate) fn first_line(path: &Path) -> Option<String> {
    let data = fs::read_to_string(path).ok()?;
    Some(data.split('\n').next().unwrap_or_default().to_string())
}

/// Overwrite a secret file with zeros in 512-byte blocks, syncing after
/// each block, then unlink it.
///
/// On copy-on-write or journaling filesystems old extents may survive the
/// in-place overwrite.
pub(crate) fn shred(path: &Path) -> Result<()> {
    let len = fs::metadata(path)
        .map_err(|e| StoreError::io(format!("stat {}", path.display()), e))?
        .len();
    let mut f = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| StoreError::io(format!("open {} for shredding", path.display()), e))?;
    let zeros = [0u8; 512];
    let mut written = 0u64;
    while written < len {
        f.write_all(&zeros)
            .map_err(|e| StoreError::io(format!("shred {}", path.display()), e))?;
        f.sync_data()
            .map_err(|e| StoreError::io(format!("sync {}", path.display()), e))?;
        written += zeros.len() as u64;
    }
    drop(f);
    fs::remove_file(path).map_err(|e| StoreError::io(format!("unlink {}", path.display()), e))
}
