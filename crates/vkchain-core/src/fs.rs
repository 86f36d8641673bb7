//! Filesystem access used by settings and manifest discovery.

use std::path::{Path, PathBuf};

use crate::error::CoreError;

pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn read_to_string(&self, path: &Path) -> Result<String, CoreError>;

    /// `*.json` files directly inside `dir`, sorted by file name. A missing
    /// directory yields an empty list.
    fn json_files(&self, dir: &Path) -> Vec<PathBuf>;

    /// Path of the running executable, matched against settings `app_keys`.
    fn executable_path(&self) -> Option<PathBuf>;
}

#[derive(Debug, Clone, Default)]
pub struct OsFileSystem {
    executable: Option<PathBuf>,
}

impl OsFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `path` as the executable instead of the real one.
    pub fn with_executable(path: impl Into<PathBuf>) -> Self {
        OsFileSystem {
            executable: Some(path.into()),
        }
    }
}

impl FileSystem for OsFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_to_string(&self, path: &Path) -> Result<String, CoreError> {
        Ok(std::fs::read_to_string(path)?)
    }

    fn json_files(&self, dir: &Path) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        files
    }

    fn executable_path(&self) -> Option<PathBuf> {
        self.executable
            .clone()
            .or_else(vkchain_common::platform::executable_path)
    }
}
