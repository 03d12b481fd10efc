//! Memory regions that patches are written into.
//!
//! This module consists of:
//! - [`RegionId`]: The name of a region (the ARM9 binary or a numbered overlay).
//! - [`Region`]: One independently based byte buffer.
//! - [`RegionStore`]: The set of regions a patch run mutates.
//! - [`manifest`]: Loading and saving a store from a directory of raw binaries.
//!
//! Every region keeps the base address it is loaded at, so the store can translate
//! an absolute address into an offset within that region's buffer.
//! Regions are never resized once they are in a store.

pub mod manifest;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ops::Range;
use std::str::FromStr;

use serde::Deserialize;

/// The name of a memory region.
///
/// The text form is `arm9` for the main binary and `overlayN` for an overlay
/// (leading zeros are accepted when parsing, so `overlay05` is `overlay5`).
///
/// ## Example
/// ```
/// use cot_patcher::region::RegionId;
///
/// assert_eq!("arm9".parse(), Ok(RegionId::Arm9));
/// assert_eq!("overlay05".parse(), Ok(RegionId::Overlay(5)));
/// assert_eq!(RegionId::Overlay(36).to_string(), "overlay36");
/// ```
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Deserialize)]
#[serde(try_from = "String")]
pub enum RegionId {
    /// The main ARM9 binary.
    Arm9,
    /// A numbered ARM9 overlay.
    Overlay(u32),
}
impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionId::Arm9       => f.write_str("arm9"),
            RegionId::Overlay(n) => write!(f, "overlay{n}"),
        }
    }
}

/// Error from parsing a [`RegionId`] from a string.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ParseRegionIdErr(String);
impl std::fmt::Display for ParseRegionIdErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown region name '{}' (expected 'arm9' or 'overlayN')", self.0)
    }
}
impl std::error::Error for ParseRegionIdErr {}

impl FromStr for RegionId {
    type Err = ParseRegionIdErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if lower == "arm9" {
            return Ok(RegionId::Arm9);
        }

        lower.strip_prefix("overlay")
            .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|n| n.parse::<u32>().ok())
            .map(RegionId::Overlay)
            .ok_or_else(|| ParseRegionIdErr(s.to_string()))
    }
}
impl TryFrom<String> for RegionId {
    type Error = ParseRegionIdErr;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Errors from accessing a [`RegionStore`].
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RegionErr {
    /// The region is not present in the store.
    UnknownRegion(RegionId),
    /// A region with this name was inserted twice.
    DuplicateRegion(RegionId),
    /// An access fell (partly) outside of the region.
    OutOfBounds {
        /// The region accessed.
        region: RegionId,
        /// The absolute address of the first byte accessed.
        address: u64,
        /// How many bytes were accessed.
        len: usize,
        /// The address range the region covers.
        span: Range<u64>,
    },
}
impl std::fmt::Display for RegionErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionErr::UnknownRegion(id)   => write!(f, "region {id} is not loaded"),
            RegionErr::DuplicateRegion(id) => write!(f, "region {id} was loaded more than once"),
            RegionErr::OutOfBounds { region, address, len, span } => write!(f,
                "{len} byte(s) at 0x{address:08X} fall outside of {region} (0x{:08X}..0x{:08X})",
                span.start, span.end
            ),
        }
    }
}
impl std::error::Error for RegionErr {}
impl crate::err::Error for RegionErr {
    fn help(&self) -> Option<Cow<'_, str>> {
        match self {
            RegionErr::UnknownRegion(_)    => Some("check the region manifest lists this region".into()),
            RegionErr::DuplicateRegion(_)  => Some("each region may only appear once in the region manifest".into()),
            RegionErr::OutOfBounds { .. }  => Some("check the anchor symbol and offset point inside the region being patched".into()),
        }
    }
}

/// A named block of binary memory loaded at a fixed base address.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Region {
    id: RegionId,
    base: u32,
    data: Vec<u8>,
}
impl Region {
    /// Creates a new region from its contents.
    pub fn new(id: RegionId, base: u32, data: Vec<u8>) -> Self {
        Self { id, base, data }
    }

    /// The name of this region.
    pub fn id(&self) -> RegionId {
        self.id
    }
    /// The address the first byte of this region is loaded at.
    pub fn base(&self) -> u32 {
        self.base
    }
    /// The size of the region in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
    /// The contents of the region.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The range of absolute addresses covered by this region.
    ///
    /// This is computed in 64 bits, as a region can end exactly at the top of the 32-bit address space.
    pub fn span(&self) -> Range<u64> {
        let start = u64::from(self.base);
        start .. start + self.data.len() as u64
    }

    /// Gets the offset of an absolute address within this region (if it lies in it).
    pub fn offset_of(&self, addr: u32) -> Option<usize> {
        self.span().contains(&u64::from(addr))
            .then(|| (addr - self.base) as usize)
    }

    fn out_of_bounds(&self, offset: usize, len: usize) -> RegionErr {
        RegionErr::OutOfBounds {
            region: self.id,
            address: u64::from(self.base).saturating_add(offset as u64),
            len,
            span: self.span(),
        }
    }

    /// Checks `offset .. offset + len` lies inside of this region.
    fn check_span(&self, offset: usize, len: usize) -> Result<Range<usize>, RegionErr> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(offset..end),
            _ => Err(self.out_of_bounds(offset, len)),
        }
    }
}

/// The set of regions mutated by a patch run.
///
/// # Example
/// ```
/// use cot_patcher::region::{Region, RegionId, RegionStore};
///
/// let mut store = RegionStore::from_regions([
///     Region::new(RegionId::Overlay(5), 0x0210_0000, vec![0; 0x400]),
/// ]).unwrap();
///
/// let offset = store.translate(RegionId::Overlay(5), 0x0210_0004).unwrap();
/// assert_eq!(offset, 4);
///
/// store.write(RegionId::Overlay(5), offset, &[0xFE, 0xFF, 0xFF, 0xEA]).unwrap();
/// assert_eq!(store.read(RegionId::Overlay(5), 4, 4).unwrap(), &[0xFE, 0xFF, 0xFF, 0xEA]);
///
/// // Writes past the end of a region fail:
/// assert!(store.write(RegionId::Overlay(5), 0x3FF, &[0; 4]).is_err());
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct RegionStore {
    regions: BTreeMap<RegionId, Region>,
}
impl RegionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store from a list of regions, failing if a region appears twice.
    pub fn from_regions(regions: impl IntoIterator<Item=Region>) -> Result<Self, RegionErr> {
        let mut store = Self::new();
        for region in regions {
            store.insert(region)?;
        }
        Ok(store)
    }

    /// Adds a region to the store, failing if a region of the same name is already present.
    pub fn insert(&mut self, region: Region) -> Result<(), RegionErr> {
        use std::collections::btree_map::Entry;

        match self.regions.entry(region.id) {
            Entry::Occupied(e) => Err(RegionErr::DuplicateRegion(*e.key())),
            Entry::Vacant(e) => {
                e.insert(region);
                Ok(())
            }
        }
    }

    /// Gets a region by name.
    pub fn get(&self, id: RegionId) -> Option<&Region> {
        self.regions.get(&id)
    }
    /// Checks if a region is loaded.
    pub fn contains(&self, id: RegionId) -> bool {
        self.regions.contains_key(&id)
    }
    /// Iterates over all regions, ordered by name.
    pub fn iter(&self) -> impl Iterator<Item=&Region> + '_ {
        self.regions.values()
    }
    /// The number of regions in the store.
    pub fn len(&self) -> usize {
        self.regions.len()
    }
    /// Whether the store has no regions.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
    /// Takes all of the regions out of the store.
    pub fn into_regions(self) -> impl Iterator<Item=Region> {
        self.regions.into_values()
    }

    fn region(&self, id: RegionId) -> Result<&Region, RegionErr> {
        self.regions.get(&id).ok_or(RegionErr::UnknownRegion(id))
    }

    /// Translates an absolute address to an offset within the given region.
    ///
    /// This fails if the region is not loaded or if the address falls outside of it.
    pub fn translate(&self, id: RegionId, addr: u32) -> Result<usize, RegionErr> {
        let region = self.region(id)?;
        region.offset_of(addr)
            .ok_or_else(|| RegionErr::OutOfBounds { region: id, address: u64::from(addr), len: 1, span: region.span() })
    }

    /// Checks that `len` bytes starting at `offset` can be written to the region,
    /// without writing anything.
    pub fn check_span(&self, id: RegionId, offset: usize, len: usize) -> Result<(), RegionErr> {
        self.region(id)?.check_span(offset, len).map(|_| ())
    }

    /// Reads `len` bytes starting at `offset` of the given region.
    pub fn read(&self, id: RegionId, offset: usize, len: usize) -> Result<&[u8], RegionErr> {
        let region = self.region(id)?;
        let range = region.check_span(offset, len)?;
        Ok(&region.data[range])
    }

    /// Writes bytes at `offset` of the given region.
    ///
    /// If the write would extend past the end of the region, nothing is written.
    pub fn write(&mut self, id: RegionId, offset: usize, bytes: &[u8]) -> Result<(), RegionErr> {
        let region = self.regions.get_mut(&id).ok_or(RegionErr::UnknownRegion(id))?;
        let range = region.check_span(offset, bytes.len())?;
        region.data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Writes bytes at an absolute address of the given region, returning the offset written to.
    pub fn write_at(&mut self, id: RegionId, addr: u32, bytes: &[u8]) -> Result<usize, RegionErr> {
        let offset = self.translate(id, addr)?;
        self.write(id, offset, bytes)?;
        Ok(offset)
    }
}
