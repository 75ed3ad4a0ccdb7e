//! File system locations used by the harvester.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Directory name under the home directory.
const BASE_DIR_NAME: &str = ".video-harvest";

/// Resolves every on-disk location from a single base directory.
#[derive(Debug, Clone)]
pub struct Paths {
    base_dir: PathBuf,
}

impl Paths {
    /// Use `~/.video-harvest`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or(CoreError::NoHomeDirectory)?;

        Ok(Self {
            base_dir: home.join(BASE_DIR_NAME),
        })
    }

    /// Use a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Base directory.
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// `<base>/config.json`.
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// `<base>/harvest.sqlite`, the durable backup store.
    pub fn store_file(&self) -> PathBuf {
        self.base_dir.join("harvest.sqlite")
    }

    /// `<base>/session.json`, the crash-detection flag store.
    pub fn session_flag_file(&self) -> PathBuf {
        self.base_dir.join("session.json")
    }

    /// `<base>/token.json`, the last issued data token.
    pub fn token_file(&self) -> PathBuf {
        self.base_dir.join("token.json")
    }

    /// `<base>/logs`.
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// `<base>/logs/harvest.jsonl`.
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("harvest.jsonl")
    }

    /// Create the base and log directories.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
