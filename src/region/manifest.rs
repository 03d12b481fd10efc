//! Loading and saving a [`RegionStore`] from a directory of raw binaries.
//!
//! A region manifest is a YAML list naming each region, the address it is loaded at,
//! and the file (relative to a binaries directory) holding its contents:
//!
//! ```yaml
//! - region: arm9
//!   base: 0x02000000
//!   file: arm9.bin
//! - region: overlay36
//!   base: 0x023A7080
//!   file: overlay36.bin
//! ```
//!
//! Extracting these files from (and packing them back into) a ROM image is done by other tools.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{Region, RegionErr, RegionId, RegionStore};

/// One region listed in a [`RegionManifest`].
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct ManifestEntry {
    /// The region's name.
    pub region: RegionId,
    /// The address the region is loaded at.
    pub base: u32,
    /// The file holding the region's bytes, relative to the binaries directory.
    pub file: PathBuf,
}

/// Errors from reading or writing a region manifest and its binaries.
#[derive(Debug)]
pub enum ManifestErr {
    /// A file could not be read or written.
    Io {
        /// The file accessed.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
    /// The manifest is not valid YAML or has the wrong shape.
    Yaml(serde_yaml::Error),
    /// The regions are inconsistent (e.g., a region listed twice).
    Region(RegionErr),
}
impl std::fmt::Display for ManifestErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestErr::Io { path, .. } => write!(f, "could not access {}", path.display()),
            ManifestErr::Yaml(_)         => f.write_str("invalid region manifest"),
            ManifestErr::Region(e)       => e.fmt(f),
        }
    }
}
impl std::error::Error for ManifestErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ManifestErr::Io { source, .. } => Some(source),
            ManifestErr::Yaml(e)           => Some(e),
            ManifestErr::Region(_)         => None,
        }
    }
}
impl crate::err::Error for ManifestErr {
    fn help(&self) -> Option<Cow<'_, str>> {
        match self {
            ManifestErr::Io { .. } => Some("the binaries directory must contain every file named in the manifest".into()),
            ManifestErr::Yaml(_)   => Some("each manifest entry needs a `region`, a `base` and a `file`".into()),
            ManifestErr::Region(e) => crate::err::Error::help(e),
        }
    }
}
impl From<RegionErr> for ManifestErr {
    fn from(value: RegionErr) -> Self {
        ManifestErr::Region(value)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ManifestErr + '_ {
    move |source| ManifestErr::Io { path: path.to_path_buf(), source }
}

/// The list of regions making up a patch run's binaries.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
#[serde(transparent)]
pub struct RegionManifest {
    entries: Vec<ManifestEntry>,
}
impl RegionManifest {
    /// Parses a manifest from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ManifestErr> {
        serde_yaml::from_str(text).map_err(ManifestErr::Yaml)
    }

    /// Reads a manifest from a YAML file.
    pub fn read(path: &Path) -> Result<Self, ManifestErr> {
        let text = fs::read_to_string(path).map_err(io_err(path))?;
        Self::from_yaml(&text)
    }

    /// The regions listed in the manifest.
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Loads every listed region from the binaries directory.
    pub fn load_store(&self, dir: &Path) -> Result<RegionStore, ManifestErr> {
        let mut store = RegionStore::new();
        for entry in &self.entries {
            let path = dir.join(&entry.file);
            let data = fs::read(&path).map_err(io_err(&path))?;
            tracing::debug!("loaded {} ({} bytes at 0x{:08X}) from {}", entry.region, data.len(), entry.base, path.display());
            store.insert(Region::new(entry.region, entry.base, data))?;
        }
        Ok(store)
    }

    /// Writes every listed region from the store into the output directory.
    pub fn save_store(&self, store: &RegionStore, dir: &Path) -> Result<(), ManifestErr> {
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        for entry in &self.entries {
            let region = store.get(entry.region).ok_or(RegionErr::UnknownRegion(entry.region))?;
            let path = dir.join(&entry.file);
            fs::write(&path, region.data()).map_err(io_err(&path))?;
        }
        Ok(())
    }
}
