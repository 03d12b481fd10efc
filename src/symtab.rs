//! The merged symbol table used while patching.
//!
//! The table is built from three tiers of symbols, each shadowing the ones before it:
//! 1. [`SymbolTier::Artifact`]: symbols of the generated artifact, attributed to regions by its `!file` markers
//! 2. [`SymbolTier::Fresh`]: symbols dumped from freshly compiled code, all in the extra overlay
//! 3. [`SymbolTier::Override`]: symbols added manually, and the bounds of every loaded region
//!    (`arm9_start`, `overlay29_end`, ...)
//!
//! A table is built once per patch run with [`SymbolTableBuilder`] (or [`build`])
//! and only read after that.

use std::borrow::Cow;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::config::DuplicatePolicy;
use crate::region::{RegionId, RegionStore};
use crate::symdb::linkerscript::{ArtifactLine, LinkerScript};

/// Where a symbol came from.
///
/// Tiers are ordered by precedence: a symbol from a later tier shadows a symbol of the same name from an earlier one.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub enum SymbolTier {
    /// The generated symbol artifact.
    Artifact,
    /// The symbol dump of freshly compiled code.
    Fresh,
    /// A manual override.
    Override,
}

/// A symbol in the table.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SymbolEntry {
    /// The symbol name.
    pub name: String,
    /// The absolute address of the symbol.
    pub address: u32,
    /// The region the symbol lives in.
    pub region: RegionId,
    /// The tier the symbol came from.
    pub tier: SymbolTier,
}

/// Kinds of errors that can occur from building a symbol table.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum SymtabErrKind {
    /// The artifact has symbols for the overlay reserved for fresh code.
    ReservedRegion(RegionId),
    /// The artifact defines a symbol twice (under [`DuplicatePolicy::Deny`]).
    DuplicateSymbol(String),
}
impl std::fmt::Display for SymtabErrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReservedRegion(id)    => write!(f, "symbol artifact declares symbols for reserved region {id}"),
            Self::DuplicateSymbol(name) => write!(f, "symbol '{name}' is defined more than once in the symbol artifact"),
        }
    }
}

/// Error from building a symbol table.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SymtabErr {
    /// The kind of error.
    pub kind: SymtabErrKind,
    /// The artifact line the error occurred on (if known).
    pub line: Option<usize>,
}
impl std::fmt::Display for SymtabErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind.fmt(f)
    }
}
impl std::error::Error for SymtabErr {}
impl crate::err::Error for SymtabErr {
    fn location(&self) -> Option<crate::err::SrcLoc> {
        self.line.map(|line| crate::err::SrcLoc::new(None, line))
    }

    fn help(&self) -> Option<Cow<'_, str>> {
        match &self.kind {
            SymtabErrKind::ReservedRegion(_)  => Some("regenerate the symbol artifact; the overlay for custom code must not appear in it".into()),
            SymtabErrKind::DuplicateSymbol(_) => Some("regenerate the symbol artifact, or allow duplicates with the `warn` policy".into()),
        }
    }
}

/// The merged symbol table.
///
/// # Example
/// ```
/// use cot_patcher::config::DuplicatePolicy;
/// use cot_patcher::region::RegionId;
/// use cot_patcher::symtab;
///
/// let artifact = "
///     /* !file overlay5 */
///     MyFunc = 0x2100000;
/// ";
/// let fresh = [("OtherFunc".to_string(), 0x23D8000)];
///
/// let table = symtab::build(artifact, fresh, RegionId::Overlay(36), DuplicatePolicy::Warn).unwrap();
/// assert_eq!(table.resolve("MyFunc"), Some((0x2100000, RegionId::Overlay(5))));
/// assert_eq!(table.resolve("OtherFunc"), Some((0x23D8000, RegionId::Overlay(36))));
/// assert_eq!(table.resolve("Missing"), None);
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct SymbolTable {
    map: HashMap<String, SymbolEntry>,
}
impl SymbolTable {
    /// Gets the address and region of a symbol (if it exists).
    pub fn resolve(&self, name: &str) -> Option<(u32, RegionId)> {
        self.map.get(name).map(|e| (e.address, e.region))
    }
    /// Gets a symbol's full entry (if it exists).
    pub fn get(&self, name: &str) -> Option<&SymbolEntry> {
        self.map.get(name)
    }
    /// The number of symbols in the table.
    pub fn len(&self) -> usize {
        self.map.len()
    }
    /// Whether the table has no symbols.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
    /// Iterates over every symbol (in arbitrary order).
    pub fn iter(&self) -> impl Iterator<Item=&SymbolEntry> + '_ {
        self.map.values()
    }
}

/// Builds a [`SymbolTable`] one tier at a time.
///
/// Tiers can be added in any order; precedence is decided by [`SymbolTier`], not insertion order.
#[derive(Debug, Clone)]
pub struct SymbolTableBuilder {
    extra: RegionId,
    policy: DuplicatePolicy,
    map: HashMap<String, SymbolEntry>,
    artifact_names: HashSet<String>,
}
impl SymbolTableBuilder {
    /// Creates a new builder.
    ///
    /// `extra` is the overlay reserved for fresh code,
    /// and `policy` says how to handle symbols defined twice in the artifact.
    pub fn new(extra: RegionId, policy: DuplicatePolicy) -> Self {
        Self { extra, policy, map: HashMap::new(), artifact_names: HashSet::new() }
    }

    fn insert(&mut self, entry: SymbolEntry) {
        match self.map.entry(entry.name.clone()) {
            Entry::Occupied(mut e) => if e.get().tier <= entry.tier {
                e.insert(entry);
            },
            Entry::Vacant(e) => {
                e.insert(entry);
            }
        }
    }

    /// Adds every symbol of a parsed artifact to the artifact tier.
    ///
    /// Each assignment is attributed to the region named by the latest `!file` marker.
    /// Assignments under a marker which is not a region (or before any marker) are skipped.
    pub fn add_artifact(&mut self, script: &LinkerScript) -> Result<&mut Self, SymtabErr> {
        let mut region = None;

        for line in script.lines() {
            match line {
                ArtifactLine::Source(_) => region = None,
                ArtifactLine::File { name, line } => match name.parse::<RegionId>() {
                    Ok(id) if id == self.extra => return Err(SymtabErr { kind: SymtabErrKind::ReservedRegion(id), line: Some(*line) }),
                    Ok(id) => region = Some(id),
                    Err(_) => {
                        tracing::debug!("skipping symbols of non-region file {name}");
                        region = None;
                    }
                },
                ArtifactLine::Assign { name, address, line } => {
                    let Some(region) = region else {
                        tracing::trace!("skipping {name} (line {line}): not in a region");
                        continue;
                    };

                    if !self.artifact_names.insert(name.clone()) {
                        match self.policy {
                            DuplicatePolicy::Warn => {
                                tracing::warn!("duplicate symbol '{name}' in symbol artifact (line {line}), keeping the first definition");
                                continue;
                            },
                            DuplicatePolicy::Deny => return Err(SymtabErr {
                                kind: SymtabErrKind::DuplicateSymbol(name.clone()),
                                line: Some(*line)
                            }),
                        }
                    }

                    self.insert(SymbolEntry { name: name.clone(), address: *address, region, tier: SymbolTier::Artifact });
                }
            }
        }

        Ok(self)
    }

    /// Adds the symbols dumped from fresh code to the fresh tier,
    /// attributing all of them to the extra overlay.
    pub fn add_fresh(&mut self, dump: impl IntoIterator<Item=(String, u32)>) -> &mut Self {
        let region = self.extra;
        for (name, address) in dump {
            self.insert(SymbolEntry { name, address, region, tier: SymbolTier::Fresh });
        }
        self
    }

    /// Adds a symbol to the override tier.
    pub fn add_override(&mut self, name: impl Into<String>, address: u32, region: RegionId) -> &mut Self {
        self.insert(SymbolEntry { name: name.into(), address, region, tier: SymbolTier::Override });
        self
    }

    /// Adds `<region>_start` and `<region>_end` to the override tier for every region in the store,
    /// except the extra overlay.
    ///
    /// `_end` is the address one past the last byte of the region,
    /// and is left out for a region which ends at the top of the address space.
    pub fn add_region_bounds(&mut self, store: &RegionStore) -> &mut Self {
        let extra = self.extra;
        for region in store.iter().filter(|r| r.id() != extra) {
            let id = region.id();
            self.add_override(format!("{id}_start"), region.base(), id);

            match u32::try_from(region.span().end) {
                Ok(end) => { self.add_override(format!("{id}_end"), end, id); },
                Err(_)  => tracing::debug!("{id} ends at the top of memory, so it has no {id}_end"),
            }
        }
        self
    }

    /// Finishes building the table.
    pub fn build(self) -> SymbolTable {
        tracing::debug!("built symbol table with {} symbols", self.map.len());
        SymbolTable { map: self.map }
    }
}

/// Builds a symbol table from artifact text and a fresh symbol dump.
pub fn build(
    artifact: &str,
    fresh: impl IntoIterator<Item=(String, u32)>,
    extra: RegionId,
    policy: DuplicatePolicy
) -> Result<SymbolTable, SymtabErr> {
    let mut builder = SymbolTableBuilder::new(extra, policy);
    builder.add_artifact(&LinkerScript::parse(artifact))?
        .add_fresh(fresh);
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use crate::config::DuplicatePolicy;
    use crate::region::{Region, RegionId, RegionStore};
    use crate::symdb::linkerscript::LinkerScript;

    use super::{build, SymbolTableBuilder, SymbolTier, SymtabErr, SymtabErrKind};

    const EXTRA: RegionId = RegionId::Overlay(36);

    const ARTIFACT: &str = "
        /* THIS FILE IS AUTO-GENERATED. DO NOT MODIFY! */

        /* --- symbols/arm9.yml --- */

        /* !file arm9 */
        ARM9_LOAD_ADDR = 0x2000000;
        SharedName = 0x2001000;

        /* --- symbols/overlay29.yml --- */

        /* !file overlay29 */
        OVERLAY29_LOAD_ADDR = 0x22dc240;
        DungeonFunc = 0x22dea5c;

        /* !file ram */
        SomeRamThing = 0x2300000;
    ";

    fn table() -> super::SymbolTable {
        let fresh = [("SharedName".to_string(), 0x23D8010), ("CustomFunc".to_string(), 0x23D8000)];
        build(ARTIFACT, fresh, EXTRA, DuplicatePolicy::Warn).unwrap()
    }

    #[test]
    fn test_region_attribution() {
        let table = table();
        assert_eq!(table.resolve("ARM9_LOAD_ADDR"), Some((0x2000000, RegionId::Arm9)));
        assert_eq!(table.resolve("DungeonFunc"), Some((0x22DEA5C, RegionId::Overlay(29))));
        assert_eq!(table.resolve("CustomFunc"), Some((0x23D8000, EXTRA)));

        // Symbols under non-region markers are skipped:
        assert_eq!(table.resolve("SomeRamThing"), None);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_precedence() {
        let table = table();
        let entry = table.get("SharedName").unwrap();
        assert_eq!(entry.tier, SymbolTier::Fresh);
        assert_eq!((entry.address, entry.region), (0x23D8010, EXTRA));

        let mut builder = SymbolTableBuilder::new(EXTRA, DuplicatePolicy::Warn);
        builder.add_override("DungeonFunc", 0x22DEB00, RegionId::Overlay(29))
            .add_fresh([("DungeonFunc".to_string(), 0x23D8020)]);
        builder.add_artifact(&LinkerScript::parse(ARTIFACT)).unwrap();
        let table = builder.build();

        // The override wins, even though it was added first:
        assert_eq!(table.resolve("DungeonFunc"), Some((0x22DEB00, RegionId::Overlay(29))));
        assert_eq!(table.get("DungeonFunc").unwrap().tier, SymbolTier::Override);
    }

    #[test]
    fn test_resolve_idempotent() {
        let table = table();
        let first = table.resolve("DungeonFunc");
        for _ in 0..4 {
            assert_eq!(table.resolve("DungeonFunc"), first);
        }
        assert_eq!(table, self::table());
    }

    #[test]
    fn test_reserved_region() {
        let artifact = "/* !file arm9 */\n/* !file overlay36 */\nOops = 0x23A7080;\n";
        let err = build(artifact, [], EXTRA, DuplicatePolicy::Warn).unwrap_err();
        assert_eq!(err, SymtabErr { kind: SymtabErrKind::ReservedRegion(EXTRA), line: Some(2) });
        assert_eq!(crate::err::Error::location(&err).map(|l| l.line), Some(2));

        // A different extra overlay makes overlay 36 an ordinary region:
        let table = build(artifact, [], RegionId::Overlay(40), DuplicatePolicy::Warn).unwrap();
        assert_eq!(table.resolve("Oops"), Some((0x23A7080, RegionId::Overlay(36))));
    }

    #[test]
    fn test_artifact_duplicates() {
        let artifact = "
            /* !file arm9 */
            Dup = 0x2000010;
            /* !file overlay10 */
            Dup = 0x22BCA80;
        ";
        let table = build(artifact, [], EXTRA, DuplicatePolicy::Warn).unwrap();
        assert_eq!(table.resolve("Dup"), Some((0x2000010, RegionId::Arm9)));

        let err = build(artifact, [], EXTRA, DuplicatePolicy::Deny).unwrap_err();
        assert_eq!(err.kind, SymtabErrKind::DuplicateSymbol("Dup".to_string()));
        assert_eq!(err.line, Some(5));
    }

    #[test]
    fn test_region_bounds() {
        let store = RegionStore::from_regions([
            Region::new(RegionId::Arm9, 0x0200_0000, vec![0; 0x100]),
            Region::new(RegionId::Overlay(29), 0x022D_C240, vec![0; 0x80]),
            Region::new(RegionId::Overlay(40), 0xFFFF_FF00, vec![0; 0x100]),
            Region::new(EXTRA, 0x023A_7080, vec![0; 0x40]),
        ]).unwrap();

        let mut builder = SymbolTableBuilder::new(EXTRA, DuplicatePolicy::Warn);
        builder.add_artifact(&LinkerScript::parse("/* !file arm9 */\narm9_start = 0x1234;\n")).unwrap();
        builder.add_region_bounds(&store);
        let table = builder.build();

        assert_eq!(table.resolve("arm9_start"), Some((0x0200_0000, RegionId::Arm9)));
        assert_eq!(table.get("arm9_start").unwrap().tier, SymbolTier::Override);
        assert_eq!(table.resolve("arm9_end"), Some((0x0200_0100, RegionId::Arm9)));
        assert_eq!(table.resolve("overlay29_start"), Some((0x022D_C240, RegionId::Overlay(29))));
        assert_eq!(table.resolve("overlay29_end"), Some((0x022D_C2C0, RegionId::Overlay(29))));
        assert_eq!(table.resolve("overlay40_start"), Some((0xFFFF_FF00, RegionId::Overlay(40))));
        assert_eq!(table.resolve("overlay40_end"), None);

        // The extra overlay is for fresh code and gets none:
        assert_eq!(table.resolve("overlay36_start"), None);
        assert_eq!(table.resolve("overlay36_end"), None);
    }
}
