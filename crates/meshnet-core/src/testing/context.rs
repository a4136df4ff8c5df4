//! TestContext - temporary directory owned by one test

use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Temporary directory removed when the context is dropped
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a context with a fresh temporary directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        std::fs::create_dir_all(temp_dir.path()).expect("Failed to create test directory");
        Self { temp_dir }
    }

    /// Root of the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Path of a named subdirectory, created on demand
    pub fn subdir(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&path).expect("Failed to create test subdirectory");
        path
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
