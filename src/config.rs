//! Configuration for symbol generation and patch runs.
//!
//! All of the knobs live in [`PatchConfig`], which can be built in code
//! (starting from [`PatchConfig::default`]) or read from a YAML file.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::region::RegionId;

/// The overlay that freshly compiled code is placed into by default.
pub const DEFAULT_EXTRA_OVERLAY: RegionId = RegionId::Overlay(36);

/// What to do when a symbol name is defined twice by the same source tier.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Log a warning and keep the first definition.
    #[default]
    Warn,
    /// Fail with an error.
    Deny,
}

/// Configuration flags for generating symbol artifacts and applying patches.
///
/// Read the field descriptions for more details.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatchConfig {
    /// The overlay reserved for freshly compiled code.
    ///
    /// This overlay never appears in generated symbol artifacts,
    /// and every symbol from the fresh symbol dump is attributed to it.
    ///
    /// By default, this is overlay 36.
    pub extra_overlay: RegionId,

    /// The address the extra overlay is expected to be loaded at.
    ///
    /// If set, a patch run fails when the loaded extra overlay has a different base address
    /// (which means the overlay was not prepared for custom code).
    ///
    /// By default, this is `None` (not checked).
    pub extra_base: Option<u32>,

    /// How duplicate symbol definitions are handled, both when loading the
    /// symbol database and when reading a symbol artifact.
    ///
    /// By default, this is [`DuplicatePolicy::Warn`].
    pub duplicate_policy: DuplicatePolicy,

    /// How many worker threads assemble patch scripts.
    ///
    /// With `1` (or `0`), scripts are assembled on the calling thread.
    ///
    /// By default, this is `1`.
    pub jobs: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            extra_overlay: DEFAULT_EXTRA_OVERLAY,
            extra_base: None,
            duplicate_policy: DuplicatePolicy::Warn,
            jobs: 1,
        }
    }
}

/// Error from reading a configuration file.
#[derive(Debug)]
pub struct ConfigErr {
    /// The configuration file.
    pub path: PathBuf,
    /// What went wrong.
    pub kind: ConfigErrKind,
}
/// Kinds of errors from reading a configuration file.
#[derive(Debug)]
pub enum ConfigErrKind {
    /// The file could not be read.
    Io(std::io::Error),
    /// The file is not a valid configuration.
    Yaml(serde_yaml::Error),
}
impl std::fmt::Display for ConfigErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ConfigErrKind::Io(_)   => write!(f, "could not read config {}", self.path.display()),
            ConfigErrKind::Yaml(_) => write!(f, "invalid config {}", self.path.display()),
        }
    }
}
impl std::error::Error for ConfigErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConfigErrKind::Io(e)   => Some(e),
            ConfigErrKind::Yaml(e) => Some(e),
        }
    }
}
impl crate::err::Error for ConfigErr {
    fn help(&self) -> Option<Cow<'_, str>> {
        match self.kind {
            ConfigErrKind::Io(_)   => None,
            ConfigErrKind::Yaml(_) => Some("valid keys are extra_overlay, extra_base, duplicate_policy and jobs".into()),
        }
    }
}

impl PatchConfig {
    /// Parses a configuration from YAML text. Missing keys take their default values.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Reads a configuration from a YAML file.
    pub fn read(path: &Path) -> Result<Self, ConfigErr> {
        let err = |kind| ConfigErr { path: path.to_path_buf(), kind };

        let text = std::fs::read_to_string(path).map_err(|e| err(ConfigErrKind::Io(e)))?;
        Self::from_yaml(&text).map_err(|e| err(ConfigErrKind::Yaml(e)))
    }
}
