use std::path::{Path, PathBuf};

use crate::crypto::MIN_KDF_ITERATIONS;

const IN_MEMORY: &str = ":memory:";

/// Where the store lives and how hard key derivation works.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// PBKDF2 rounds; never below [`MIN_KDF_ITERATIONS`].
    pub kdf_iterations: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kdf_iterations: MIN_KDF_ITERATIONS,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(IN_MEMORY)
    }

    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = iterations;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == Path::new(IN_MEMORY)
    }

    pub fn default_path() -> PathBuf {
        // XDG data directory, or the working directory as a fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobvault") {
            proj_dirs.data_dir().join("jobvault.db")
        } else {
            PathBuf::from("jobvault.db")
        }
    }
}
