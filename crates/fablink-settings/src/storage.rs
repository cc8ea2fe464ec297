//! Storage location for staged uploads and exported machine logs.

use crate::config::StorageSettings;
use std::path::{Path, PathBuf};

/// Directory the connection layer stages files in
#[derive(Debug, Clone)]
pub struct StorageLocation {
    tmp_dir: PathBuf,
}

impl StorageLocation {
    /// Use an explicit directory
    pub fn new(tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
        }
    }

    /// Resolve from settings, defaulting to `<system temp>/fablink`
    pub fn from_settings(settings: &StorageSettings) -> Self {
        match &settings.tmp_dir {
            Some(dir) => Self::new(dir),
            None => Self::new(std::env::temp_dir().join("fablink")),
        }
    }

    /// Absolute path of `name` inside the staging directory
    pub fn path(&self, name: &str) -> PathBuf {
        self.tmp_dir.join(name)
    }

    /// Whether `name` exists inside the staging directory
    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    /// The staging directory itself
    pub fn dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Create the staging directory if needed
    pub fn ensure_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.tmp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_and_exists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageLocation::new(dir.path());
        assert!(!storage.exists("job.gcode"));

        std::fs::write(storage.path("job.gcode"), b"G28\n").expect("write");
        assert!(storage.exists("job.gcode"));
        assert_eq!(storage.path("job.gcode"), dir.path().join("job.gcode"));
    }

    #[test]
    fn test_default_dir_under_system_temp() {
        let storage = StorageLocation::from_settings(&StorageSettings::default());
        assert!(storage.dir().starts_with(std::env::temp_dir()));
    }
}
