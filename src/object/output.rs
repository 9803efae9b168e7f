//! Memory-mapped output file.
//!
//! The file is created at its final path, sized up front and written through a mapping. It is
//! deleted again when the [`Output`] is dropped without having been finalized, so a failed
//! write or a failed verification never leaves a truncated artifact behind.

use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

/// A memory-mapped file under construction.
pub struct Output {
    mmap: MmapMut,
    target_path: PathBuf,
    finalized: bool,
}

impl Output {
    /// Create (or truncate) the file at `target_path` with `size` zero bytes and map it.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the file cannot be created, sized or mapped.
    pub fn create<P: AsRef<Path>>(target_path: P, size: u64) -> Result<Self> {
        let target_path = target_path.as_ref().to_path_buf();

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target_path)?;

        if let Err(error) = file.set_len(size) {
            let _ = std::fs::remove_file(&target_path);
            return Err(Error::FileError(error));
        }

        // the mapping is private to this value and the file is not shared while it is alive
        let mmap = match unsafe { MmapOptions::new().map_mut(&file) } {
            Ok(mmap) => mmap,
            Err(error) => {
                let _ = std::fs::remove_file(&target_path);
                return Err(Error::FileError(error));
            }
        };

        Ok(Self {
            mmap,
            target_path,
            finalized: false,
        })
    }

    /// Copy `data` to `offset`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if the write would run past the end of the file.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = usize::try_from(offset).map_err(|_| Error::OutOfBounds)?;
        let end = start.checked_add(data.len()).ok_or(Error::OutOfBounds)?;
        if end > self.mmap.len() {
            return Err(Error::OutOfBounds);
        }

        self.mmap[start..end].copy_from_slice(data);
        Ok(())
    }

    /// The mapped contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Size of the file in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Where the file lives.
    #[must_use]
    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    /// Flush the mapping and keep the file.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the flush fails; the file is deleted in that case.
    pub fn finalize(mut self) -> Result<()> {
        self.mmap.flush()?;
        self.finalized = true;
        Ok(())
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = self.mmap.flush();
            let _ = std::fs::remove_file(&self.target_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn finalized_file_keeps_its_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.o");

        let mut output = Output::create(&path, 8).unwrap();
        output.write_at(2, &[0xAA, 0xBB]).unwrap();
        assert!(output.write_at(7, &[1, 2]).is_err());
        assert_eq!(output.size(), 8);
        assert_eq!(output.target_path(), path.as_path());
        output.finalize().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![0, 0, 0xAA, 0xBB, 0, 0, 0, 0]);
    }

    #[test]
    fn unfinalized_file_is_deleted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.o");
        {
            let mut output = Output::create(&path, 4).unwrap();
            output.write_at(0, b"\x7fELF").unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
