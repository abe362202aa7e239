//! The on-disk tier: one raw pixel file per key in a single cache directory.
//!
//! Files are named `cached_image_<escaped key>.raw`.  Everything this store creates, temporary files included, starts
//! with [FILE_PREFIX], which is how [DiskStore::purge] tells its own files apart from anything else in the directory.
use std::fmt::Write as _;
use std::fs::{self, File, Metadata};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::*;

pub const FILE_PREFIX: &str = "cached_image_";
pub const FILE_SUFFIX: &str = ".raw";
const TEMP_SUFFIX: &str = ".tmp";

/// Escape a key so that it is a single, safe path component.
///
/// Lower-case ASCII letters, digits, `-`, `_` and `.` pass through; every other byte, upper-case letters included,
/// becomes `%XX` with upper-case hex.  Since `%` itself is escaped, distinct keys always produce distinct names, and
/// they stay distinct on case-insensitive filesystems too.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(b as char),
            _ => {
                // Writing to a String can't fail.
                let _ = write!(out, "%{:02X}", b);
            }
        }
    }
    out
}

/// Whether two metadata snapshots describe the same file, rather than two files that were at the same path.
#[cfg(unix)]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(a: &Metadata, b: &Metadata) -> bool {
    a.len() == b.len() && a.modified().ok() == b.modified().ok()
}

#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    /// Open a store over `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<DiskStore> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(DiskStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", FILE_PREFIX, escape_key(key), FILE_SUFFIX))
    }

    /// Read the image for `key`.
    ///
    /// A missing file, an unreadable file, and a corrupt file are all just a miss.  Corrupt files are removed so the
    /// next write starts clean.
    pub fn read(&self, key: &str) -> Option<DecodedImage> {
        let path = self.path_for(key);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unable to open cache file");
                return None;
            }
        };

        match codec::decode(&file) {
            Ok(img) => Some(img),
            Err(CodecError::Io(e)) => {
                warn!(path = %path.display(), error = %e, "unable to map cache file");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding corrupt cache file");
                self.discard_if_current(key, &file);
                None
            }
        }
    }

    /// Write `image` for `key`, replacing any existing file.
    ///
    /// The data goes to a temporary file which is then renamed over the final path.  Readers that already mapped the
    /// old file keep seeing it intact.
    pub fn write_sync(&self, key: &str, image: &DecodedImage) -> Result<(), CodecError> {
        let tmp = tempfile::Builder::new()
            .prefix(FILE_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            codec::encode(image, &mut writer)?;
            writer.flush()?;
        }
        let path = self.path_for(key);
        tmp.persist(&path).map_err(|e| e.error)?;
        debug!(path = %path.display(), bytes = image.pixels().len(), "wrote cache file");
        Ok(())
    }

    /// Remove `key`'s file, but only if it is still the file `opened` refers to.
    ///
    /// The writer may have renamed a fresh file into place since `opened` was opened, and that one must survive.
    fn discard_if_current(&self, key: &str, opened: &File) -> bool {
        let path = self.path_for(key);
        let current = match (opened.metadata(), fs::metadata(&path)) {
            (Ok(o), Ok(c)) => same_file(&o, &c),
            _ => false,
        };
        if !current {
            debug!(path = %path.display(), "cache file was replaced, leaving it alone");
            return false;
        }

        match self.remove(key) {
            Ok(()) => true,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "unable to remove corrupt cache file");
                false
            }
        }
    }

    /// Remove the file for one key.  A file that was never there is not an error.
    pub fn remove(&self, key: &str) -> std::io::Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Delete every file in the directory that this store owns, skipping any that fail.  Returns how many were removed.
    pub fn purge(&self) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(x) => x,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "unable to list cache directory");
                return 0;
            }
        };

        let mut removed = 0;
        let mut failed = 0;
        for entry in entries.flatten() {
            let owned = entry
                .file_name()
                .to_str()
                .map_or(false, |n| n.starts_with(FILE_PREFIX));
            if !owned {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => {
                    failed += 1;
                    debug!(path = %entry.path().display(), error = %e, "skipping cache file during purge");
                }
            }
        }

        info!(dir = %self.dir.display(), removed, failed, "purged disk cache");
        removed
    }
}
