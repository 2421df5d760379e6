use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::WildError;

/// Directory of downloaded observation images, named by dedup key.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: Utf8PathBuf,
}

impl ImageStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn image_path(&self, filename: &str) -> Utf8PathBuf {
        self.root.join(filename)
    }

    pub fn ensure_root(&self) -> Result<(), WildError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| WildError::Filesystem(err.to_string()))
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.image_path(filename).as_std_path().exists()
    }

    /// Writes through a temp file so a killed worker never leaves a truncated image.
    pub fn write_image(&self, filename: &str, content: &[u8]) -> Result<Utf8PathBuf, WildError> {
        let path = self.image_path(filename);
        write_bytes_atomic(&path, content)?;
        Ok(path)
    }
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), WildError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| WildError::Filesystem(err.to_string()))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(tmp_path.as_std_path(), content)
        .map_err(|err| WildError::Filesystem(err.to_string()))?;
    fs::rename(tmp_path.as_std_path(), path.as_std_path())
        .map_err(|err| WildError::Filesystem(err.to_string()))?;
    Ok(())
}
