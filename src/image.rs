use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that can happen while loading a firmware image.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ImageError {
    #[error("failed to read firmware file {}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("firmware file {} is empty", path.display())]
    Empty { path: PathBuf },
}

/// An owned firmware image, read in full from disk. The contents are opaque
/// to this tool; the device validates them.
///
/// Invariant: `bytes` is non-empty. A zero-length read is a load failure,
/// never an empty firmware.
#[derive(Clone, Debug)]
pub struct FirmwareImage {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl FirmwareImage {
    /// Read the whole image at `path`. Any read failure discards everything
    /// read so far; a partially-filled buffer is never returned.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let mut bytes = vec![];

        std::fs::File::open(path)
            .and_then(|mut file| file.read_to_end(&mut bytes))
            .map_err(|source| ImageError::Io {
                path: path.to_owned(),
                source,
            })?;

        if bytes.is_empty() {
            return Err(ImageError::Empty {
                path: path.to_owned(),
            });
        }

        Ok(Self {
            path: path.to_owned(),
            bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; a successful load never produces an empty image.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_full_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x00\x01firmware\xff").unwrap();

        let image = FirmwareImage::load(file.path()).unwrap();
        assert_eq!(image.bytes(), b"\x00\x01firmware\xff");
        assert_eq!(image.len(), 11);
        assert_eq!(image.path(), file.path());
    }

    #[test]
    fn empty_file_is_a_load_failure() {
        let file = tempfile::NamedTempFile::new().unwrap();
        match FirmwareImage::load(file.path()) {
            Err(ImageError::Empty { path }) => assert_eq!(path, file.path()),
            other => panic!("expected Empty, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_a_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        match FirmwareImage::load(dir.path().join("no-such.bin")) {
            Err(ImageError::Io { .. }) => (),
            other => panic!("expected Io, got {other:?}"),
        }
    }
}
