//! Loading the hierarchical YAML symbol database.
//!
//! The database is a directory tree of YAML documents. Each document maps a logical file name
//! (`arm9`, `overlay12`, ...) to a block describing where that file is loaded and which
//! functions and data it holds, per game version:
//!
//! ```yaml
//! overlay12:
//!   address:
//!     NA: 0x238A140
//!   functions:
//!     - name: SomeFunction
//!       address:
//!         NA: 0x238A1C8
//!         EU: [0x238AB08, 0x238AB10]
//! ```
//!
//! [`SymbolDatabase::resolve`] flattens the database into the symbols of one [`RegionTag`],
//! keeping the document and file nesting so [`linkerscript`] can write its markers.

pub mod linkerscript;

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::{DuplicatePolicy, PatchConfig};
use crate::region::RegionId;

/// A game version key in the symbol database (e.g. `NA`, `EU`, `JP`).
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct RegionTag(String);
impl RegionTag {
    /// Creates a region tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
    /// The tag's text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
    /// The tag for code relocated into ITCM at runtime (`NA-ITCM` for `NA`),
    /// which takes precedence over the plain tag.
    pub fn itcm(&self) -> RegionTag {
        RegionTag(format!("{}-ITCM", self.0))
    }
}
impl std::fmt::Display for RegionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An address field: either one address or a list of them (the first of which is used).
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
#[serde(untagged)]
pub enum AddrField {
    /// A single address.
    One(u32),
    /// A list of addresses.
    Many(Vec<u32>),
}
impl AddrField {
    /// The authoritative address, or `None` for an empty list.
    pub fn first(&self) -> Option<u32> {
        match self {
            AddrField::One(a)  => Some(*a),
            AddrField::Many(v) => v.first().copied(),
        }
    }
}

/// A function or data symbol definition.
///
/// Any other keys (descriptions, aliases, lengths) are ignored.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct SymbolDef {
    /// The symbol name.
    pub name: String,
    /// The symbol's address per region tag.
    #[serde(default)]
    pub address: BTreeMap<String, AddrField>,
}

/// The definition of one logical file.
#[derive(Debug, PartialEq, Eq, Clone, Default, Deserialize)]
pub struct FileBlock {
    /// The file's load address per region tag.
    #[serde(default)]
    pub address: Option<BTreeMap<String, AddrField>>,
    /// Function symbols.
    #[serde(default)]
    pub functions: Option<Vec<SymbolDef>>,
    /// Data symbols.
    #[serde(default)]
    pub data: Option<Vec<SymbolDef>>,
}

/// Resolves an address map for a tag, preferring the tag's ITCM variant.
fn tag_address<'a>(map: &'a BTreeMap<String, AddrField>, tag: &RegionTag) -> Option<&'a AddrField> {
    map.get(tag.itcm().as_str())
        .or_else(|| map.get(tag.as_str()))
}

/// Errors from loading the symbol database.
#[derive(Debug)]
pub enum DbErr {
    /// A file or directory could not be read.
    Io {
        /// The path accessed.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
    /// A document is not valid YAML or has the wrong shape.
    Yaml {
        /// The document.
        path: PathBuf,
        /// The underlying error.
        source: serde_yaml::Error,
    },
    /// A symbol was defined more than once (under [`DuplicatePolicy::Deny`]).
    DuplicateSymbol {
        /// The symbol name.
        name: String,
        /// The document with the second definition.
        path: PathBuf,
    },
}
impl std::fmt::Display for DbErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbErr::Io { path, .. }   => write!(f, "could not read {}", path.display()),
            DbErr::Yaml { path, .. } => write!(f, "invalid symbol document {}", path.display()),
            DbErr::DuplicateSymbol { name, path } => write!(f, "duplicate symbol '{name}' in {}", path.display()),
        }
    }
}
impl std::error::Error for DbErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DbErr::Io { source, .. }   => Some(source),
            DbErr::Yaml { source, .. } => Some(source),
            DbErr::DuplicateSymbol { .. } => None,
        }
    }
}
impl crate::err::Error for DbErr {
    fn help(&self) -> Option<Cow<'_, str>> {
        match self {
            DbErr::Io { .. }   => None,
            DbErr::Yaml { .. } => Some("each top-level key should be a file with optional `address`, `functions` and `data`".into()),
            DbErr::DuplicateSymbol { .. } => Some("rename one of the definitions, or allow duplicates with the `warn` policy".into()),
        }
    }
}

/// One YAML document of the symbol database.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DbDocument {
    /// The path of the document.
    pub path: PathBuf,
    /// The file blocks of the document, in document order.
    pub files: Vec<(String, FileBlock)>,
}
impl DbDocument {
    /// Parses a document from its text.
    pub fn parse(path: impl Into<PathBuf>, text: &str) -> Result<Self, DbErr> {
        let path = path.into();
        if text.trim().is_empty() {
            return Ok(Self { path, files: vec![] });
        }

        let yaml_err = |source| DbErr::Yaml { path: path.clone(), source };
        // A mapping keeps document order, which the artifact reproduces.
        let mapping: serde_yaml::Mapping = serde_yaml::from_str(text).map_err(yaml_err)?;

        let mut files = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let name = match key {
                serde_yaml::Value::String(s) => s,
                k => serde_yaml::to_string(&k).map_err(yaml_err)?.trim().to_string(),
            };
            let block = match value {
                serde_yaml::Value::Null => FileBlock::default(),
                v => serde_yaml::from_value(v).map_err(yaml_err)?,
            };
            files.push((name, block));
        }

        Ok(Self { path, files })
    }
}

/// A symbol with its resolved address.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Symbol {
    /// The symbol name.
    pub name: String,
    /// The address of the symbol for the resolved tag.
    pub address: u32,
}

/// The resolved symbols of one file block.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FileSymbols {
    /// The file's name.
    pub name: String,
    /// The file's symbols, in order (load address first, then functions, then data).
    pub symbols: Vec<Symbol>,
}

/// The resolved symbols of one document.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SymbolSource {
    /// The path of the document.
    pub path: PathBuf,
    /// The document's files, in order.
    pub files: Vec<FileSymbols>,
}

/// A symbol definition dropped because its name was already defined.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Duplicate {
    /// The symbol name.
    pub name: String,
    /// The address of the dropped definition.
    pub address: u32,
    /// The document of the dropped definition.
    pub path: PathBuf,
}

/// The symbol database resolved for one region tag.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct ResolvedDatabase {
    /// Resolved symbols, by document.
    pub sources: Vec<SymbolSource>,
    /// Function and data definitions dropped as duplicates.
    pub duplicates: Vec<Duplicate>,
}
impl ResolvedDatabase {
    /// Iterates over every resolved symbol, in order.
    pub fn symbols(&self) -> impl Iterator<Item=&Symbol> + '_ {
        self.sources.iter()
            .flat_map(|s| &s.files)
            .flat_map(|f| &f.symbols)
    }

    /// The flat mapping of symbol name to address.
    pub fn to_map(&self) -> BTreeMap<String, u32> {
        self.symbols()
            .map(|s| (s.name.clone(), s.address))
            .collect()
    }
}

/// A loaded symbol database.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct SymbolDatabase {
    documents: Vec<DbDocument>,
}
impl SymbolDatabase {
    /// Creates a database from already parsed documents, in the order given.
    pub fn from_documents(documents: Vec<DbDocument>) -> Self {
        Self { documents }
    }

    /// Reads every `.yml` and `.yaml` document under a directory (recursively),
    /// in sorted path order.
    pub fn from_dir(root: &Path) -> Result<Self, DbErr> {
        let mut paths = vec![];
        collect_documents(root, &mut paths)?;
        paths.sort();

        let documents = paths.into_iter()
            .map(|path| {
                let text = fs::read_to_string(&path)
                    .map_err(|source| DbErr::Io { path: path.clone(), source })?;
                DbDocument::parse(path, &text)
            })
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!("read {} symbol documents from {}", documents.len(), root.display());

        Ok(Self { documents })
    }

    /// The documents of this database.
    pub fn documents(&self) -> &[DbDocument] {
        &self.documents
    }

    /// Resolves the database into the symbols of one region tag.
    ///
    /// - A file with an address for the tag gets a `<FILE>_LOAD_ADDR` symbol
    ///   (only the first one of each name is kept; later ones are dropped silently).
    /// - Functions, then data, are resolved with ITCM precedence.
    ///   Symbols with no address for the tag, or an empty address list, are skipped.
    /// - A function or data name defined twice is handled per [`PatchConfig::duplicate_policy`].
    /// - The file block of [`PatchConfig::extra_overlay`] is skipped.
    pub fn resolve(&self, tag: &RegionTag, config: &PatchConfig) -> Result<ResolvedDatabase, DbErr> {
        let mut seen = HashSet::new();
        let mut duplicates = vec![];
        let mut sources = Vec::with_capacity(self.documents.len());

        for doc in &self.documents {
            let mut files = vec![];

            for (file_name, block) in &doc.files {
                if file_name.parse::<RegionId>().is_ok_and(|id| id == config.extra_overlay) {
                    tracing::debug!("skipping reserved file block {file_name} in {}", doc.path.display());
                    continue;
                }

                let mut symbols = vec![];

                let load_addr = block.address.as_ref()
                    .and_then(|m| m.get(tag.as_str()))
                    .and_then(AddrField::first);
                if let Some(address) = load_addr {
                    let name = format!("{}_LOAD_ADDR", file_name.to_uppercase());
                    if seen.insert(name.clone()) {
                        symbols.push(Symbol { name, address });
                    }
                }

                let defs = block.functions.iter().flatten()
                    .chain(block.data.iter().flatten());
                for def in defs {
                    let Some(address) = tag_address(&def.address, tag).and_then(AddrField::first) else {
                        continue;
                    };

                    if seen.insert(def.name.clone()) {
                        symbols.push(Symbol { name: def.name.clone(), address });
                        continue;
                    }
                    match config.duplicate_policy {
                        DuplicatePolicy::Warn => {
                            tracing::warn!("duplicate symbol '{}' in {} (keeping the first definition)", def.name, doc.path.display());
                            duplicates.push(Duplicate { name: def.name.clone(), address, path: doc.path.clone() });
                        },
                        DuplicatePolicy::Deny => return Err(DbErr::DuplicateSymbol { name: def.name.clone(), path: doc.path.clone() }),
                    }
                }

                files.push(FileSymbols { name: file_name.clone(), symbols });
            }

            sources.push(SymbolSource { path: doc.path.clone(), files });
        }

        Ok(ResolvedDatabase { sources, duplicates })
    }
}

fn collect_documents(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), DbErr> {
    let io_err = |source| DbErr::Io { path: dir.to_path_buf(), source };

    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_dir() {
            collect_documents(&path, out)?;
        } else if is_yaml_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_yaml_file(path: &Path) -> bool {
    let ext = path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    matches!(&*ext, "yml" | "yaml")
}

/// Loads the symbol database under `root` into a flat mapping for one region tag.
///
/// See [`SymbolDatabase::resolve`] for the resolution rules.
pub fn load(root: &Path, tag: &RegionTag, policy: DuplicatePolicy) -> Result<BTreeMap<String, u32>, DbErr> {
    let config = PatchConfig { duplicate_policy: policy, ..Default::default() };
    let resolved = SymbolDatabase::from_dir(root)?.resolve(tag, &config)?;
    Ok(resolved.to_map())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::config::{DuplicatePolicy, PatchConfig};

    use super::{load, DbDocument, DbErr, RegionTag, SymbolDatabase};

    fn db(docs: &[(&str, &str)]) -> SymbolDatabase {
        let docs = docs.iter()
            .map(|(path, text)| DbDocument::parse(*path, text).unwrap())
            .collect();
        SymbolDatabase::from_documents(docs)
    }
    fn na() -> RegionTag {
        RegionTag::new("NA")
    }

    const OV12_A: &str = "
        overlay12:
          address:
            NA: 0x238A140
            EU: 0x238B6A0
          functions:
            - name: Ov12Init
              address:
                NA: 0x238A1C8
    ";
    const OV12_B: &str = "
        overlay12:
          address:
            NA: 0x9999999
          data:
            - name: OV12_TABLE
              address:
                NA: 0x238C000
    ";
    const OV12_C: &str = "
        overlay12:
          address:
            NA: 0x8888888
    ";

    #[test]
    fn test_load_addr_dedup() {
        let db = db(&[("a.yml", OV12_A), ("b.yml", OV12_B), ("c.yml", OV12_C)]);
        let resolved = db.resolve(&na(), &PatchConfig::default()).unwrap();

        let load_addrs: Vec<_> = resolved.symbols()
            .filter(|s| s.name == "OVERLAY12_LOAD_ADDR")
            .collect();
        assert_eq!(load_addrs.len(), 1);
        assert_eq!(load_addrs[0].address, 0x238A140);

        // Load address duplicates are not reported:
        assert!(resolved.duplicates.is_empty());

        let map = resolved.to_map();
        assert_eq!(map["Ov12Init"], 0x238A1C8);
        assert_eq!(map["OV12_TABLE"], 0x238C000);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_itcm_precedence() {
        let db = db(&[("arm9.yml", "
            arm9:
              functions:
                - name: ItcmFunc
                  address:
                    NA: 0x2001000
                    NA-ITCM: 0x1FF8000
                - name: PlainFunc
                  address:
                    NA: 0x2002000
                - name: EuOnly
                  address:
                    EU: 0x2003000
                - name: ListFunc
                  address:
                    NA: [0x2004000, 0x2005000]
                - name: EmptyFunc
                  address:
                    NA: []
        ")]);
        let map = db.resolve(&na(), &PatchConfig::default()).unwrap().to_map();
        assert_eq!(map.get("ItcmFunc"), Some(&0x1FF8000));
        assert_eq!(map.get("PlainFunc"), Some(&0x2002000));
        assert_eq!(map.get("ListFunc"), Some(&0x2004000));
        assert_eq!(map.get("EuOnly"), None);
        assert_eq!(map.get("EmptyFunc"), None);
    }

    #[test]
    fn test_duplicates() {
        let docs = [
            ("a.yml", "arm9:\n  functions:\n    - name: Dup\n      address:\n        NA: 0x2000010\n"),
            ("b.yml", "arm9:\n  data:\n    - name: Dup\n      address:\n        NA: 0x2000020\n"),
        ];

        let resolved = db(&docs).resolve(&na(), &PatchConfig::default()).unwrap();
        assert_eq!(resolved.to_map()["Dup"], 0x2000010);
        assert_eq!(resolved.duplicates.len(), 1);
        assert_eq!(resolved.duplicates[0].address, 0x2000020);
        assert_eq!(resolved.duplicates[0].path, PathBuf::from("b.yml"));

        let deny = PatchConfig { duplicate_policy: DuplicatePolicy::Deny, ..Default::default() };
        let err = db(&docs).resolve(&na(), &deny).unwrap_err();
        assert!(matches!(err, DbErr::DuplicateSymbol { name, .. } if name == "Dup"));
    }

    #[test]
    fn test_document_order_and_extra_overlay() {
        let db = db(&[("ov.yml", "
            overlay36:
              address:
                NA: 0x23A7080
              functions:
                - name: ReservedFunc
                  address:
                    NA: 0x23A7100
            overlay29:
              address:
                NA: 0x22DC240
            arm9:
        ")]);
        let resolved = db.resolve(&na(), &PatchConfig::default()).unwrap();
        let files: Vec<_> = resolved.sources[0].files.iter().map(|f| &*f.name).collect();
        assert_eq!(files, ["overlay29", "arm9"]);
        assert!(!resolved.to_map().contains_key("ReservedFunc"));
    }

    #[test]
    fn test_bad_document() {
        assert!(matches!(DbDocument::parse("x.yml", "arm9: [1, 2"), Err(DbErr::Yaml { .. })));
        assert!(matches!(DbDocument::parse("x.yml", "arm9:\n  functions: 3\n"), Err(DbErr::Yaml { .. })));
        assert_eq!(DbDocument::parse("x.yml", "\n").unwrap().files.len(), 0);
    }

    #[test]
    fn test_load_from_dir() {
        let dir = std::env::temp_dir().join(format!("cot-patcher-symdb-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("b")).unwrap();
        std::fs::write(dir.join("b/ov.yml"), OV12_B).unwrap();
        std::fs::write(dir.join("a.yml"), OV12_A).unwrap();
        std::fs::write(dir.join("notes.txt"), "not: yaml symbols").unwrap();

        // a.yml sorts before b/ov.yml, so its load address wins:
        let map = load(&dir, &na(), DuplicatePolicy::Warn).unwrap();
        assert_eq!(map["OVERLAY12_LOAD_ADDR"], 0x238A140);
        assert_eq!(map.len(), 3);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
