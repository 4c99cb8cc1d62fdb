//! Shadowing packed entries with files on disk.
//!
//! During development it's handy to edit an asset and see the change
//! without repacking. Point a container at an [`OverrideDir`]
//! and reads of `name` will first try `<dir>/name`,
//! falling back to the packed data if that file can't be read.

use std::env;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use log::*;

/// The environment variable [`OverrideDir::from_env()`] reads.
pub const OVERRIDE_VAR: &str = "DATAPACK_OVERRIDE";

/// An optional directory whose files take precedence over packed entries.
///
/// Disabled by default.
/// Share one between containers by wrapping it in an `Arc`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideDir {
    dir: Option<Utf8PathBuf>,
}

impl OverrideDir {
    /// Overrides packed entries with files from `dir`, or disables overriding if `None`.
    ///
    /// A trailing slash is dropped.
    /// An empty path overrides from the current working directory.
    pub fn new<P: AsRef<Utf8Path>>(dir: Option<P>) -> Self {
        let dir = dir.map(|d| {
            let d = d.as_ref().as_str();
            match d.strip_suffix('/') {
                Some(stripped) if !stripped.is_empty() => Utf8PathBuf::from(stripped),
                _ => Utf8PathBuf::from(d),
            }
        });
        Self { dir }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Reads the override directory from `DATAPACK_OVERRIDE`.
    pub fn from_env() -> Self {
        Self::from_env_var(OVERRIDE_VAR)
    }

    /// Reads the override directory from the given environment variable.
    ///
    /// Overriding is disabled if it's unset or not UTF-8.
    pub fn from_env_var(var: &str) -> Self {
        match env::var(var) {
            Ok(dir) => Self::new(Some(dir)),
            Err(env::VarError::NotUnicode(_)) => {
                warn!("${var} isn't valid UTF-8; not overriding packed files");
                Self::disabled()
            }
            Err(env::VarError::NotPresent) => Self::disabled(),
        }
    }

    /// Returns the override directory, if any.
    pub fn dir(&self) -> Option<&Utf8Path> {
        self.dir.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Where the override for `filename` would live.
    ///
    /// `None` if overriding is disabled or the name can't be a UTF-8 path.
    pub fn local_path(&self, filename: &[u8]) -> Option<Utf8PathBuf> {
        let dir = self.dir.as_ref()?;
        match std::str::from_utf8(filename) {
            Ok(name) => Some(dir.join(name)),
            Err(_) => {
                debug!(
                    "{} isn't UTF-8; can't override it",
                    String::from_utf8_lossy(filename)
                );
                None
            }
        }
    }

    /// Reads the override for `filename` to its end.
    ///
    /// Any failure is `None`: the caller should use the packed data instead.
    pub fn read(&self, filename: &[u8]) -> Option<Vec<u8>> {
        let path = self.local_path(filename)?;
        match fs::read(&path) {
            Ok(contents) => {
                debug!("Overriding {} with {}", String::from_utf8_lossy(filename), path);
                Some(contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!("No override at {path}");
                None
            }
            Err(e) => {
                warn!("Couldn't read override {path}, using packed data: {e}");
                None
            }
        }
    }
}
