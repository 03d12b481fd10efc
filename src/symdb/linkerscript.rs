//! Writing and reading the generated symbol artifact.
//!
//! The artifact is a linker script listing every resolved symbol as an assignment.
//! Its comment lines are markers which record where each assignment came from:
//!
//! ```text
//! /* THIS FILE IS AUTO-GENERATED. DO NOT MODIFY! */
//!
//! /* --- symbols/overlay29.yml --- */
//!
//! /* !file overlay29 */
//! OVERLAY29_LOAD_ADDR = 0x22dc240;
//! DungeonAlloc = 0x22dea5c;
//! ```
//!
//! The `!file` markers are load-bearing: the symbol table uses them to
//! decide which region each following symbol belongs to.

use std::path::Path;

use logos::Logos;

use crate::config::PatchConfig;
use crate::parse::lex::parse_int;

use super::{DbErr, RegionTag, ResolvedDatabase, SymbolDatabase};

/// The first line of every generated artifact.
pub const HEADER: &str = "/* THIS FILE IS AUTO-GENERATED. DO NOT MODIFY! */";

/// Serializes a resolved database into artifact text.
///
/// # Example
/// ```
/// use cot_patcher::config::PatchConfig;
/// use cot_patcher::symdb::{DbDocument, RegionTag, SymbolDatabase};
/// use cot_patcher::symdb::linkerscript::generate;
///
/// let doc = DbDocument::parse("arm9.yml", "
/// arm9:
///   functions:
///     - name: InitMemAllocTable
///       address:
///         NA: 0x2000EC8
/// ").unwrap();
/// let resolved = SymbolDatabase::from_documents(vec![doc])
///     .resolve(&RegionTag::new("NA"), &PatchConfig::default())
///     .unwrap();
///
/// assert!(generate(&resolved).ends_with("/* !file arm9 */\nInitMemAllocTable = 0x2000ec8;\n"));
/// ```
pub fn generate(resolved: &ResolvedDatabase) -> String {
    let mut out = String::from(HEADER);
    out.push('\n');

    for source in &resolved.sources {
        out.push_str(&format!("\n/* --- {} --- */\n", source.path.display()));

        for file in &source.files {
            out.push_str(&format!("\n/* !file {} */\n", file.name));
            for sym in &file.symbols {
                out.push_str(&format!("{} = {:#x};\n", sym.name, sym.address));
            }
        }
    }

    out
}

/// Loads the symbol database under `root` and serializes it for one region tag.
pub fn generate_from_dir(root: &Path, tag: &RegionTag, config: &PatchConfig) -> Result<String, DbErr> {
    let resolved = SymbolDatabase::from_dir(root)?.resolve(tag, config)?;
    tracing::info!(
        "generated {} symbols for {tag} ({} duplicates dropped)",
        resolved.symbols().count(),
        resolved.duplicates.len()
    );
    Ok(generate(&resolved))
}

/// A meaningful line of an artifact.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ArtifactLine {
    /// A `/* --- path --- */` marker, starting the symbols of a database document.
    Source(String),
    /// A `/* !file name */` marker, starting the symbols of a file block.
    File {
        /// The file block's name.
        name: String,
        /// The 1-based line of the marker.
        line: usize,
    },
    /// A `NAME = address;` assignment.
    Assign {
        /// The symbol name.
        name: String,
        /// The symbol address.
        address: u32,
        /// The 1-based line of the assignment.
        line: usize,
    },
}

#[derive(Debug, Logos, PartialEq, Eq)]
#[logos(skip r"[ \t]+")]
enum AssignToken<'s> {
    #[regex(r"[A-Za-z_.$][\w.$@]*", |lx| lx.slice())]
    Ident(&'s str),
    #[regex(r"\d\w*", |lx| lx.slice())]
    Number(&'s str),
    #[token("=")]
    Eq,
    #[token(";")]
    Semi,
}

fn parse_marker(comment: &str, line: usize) -> Option<ArtifactLine> {
    if let Some(path) = comment.strip_prefix("---").and_then(|c| c.strip_suffix("---")) {
        return Some(ArtifactLine::Source(path.trim().to_string()));
    }
    comment.strip_prefix("!file")
        .map(|name| ArtifactLine::File { name: name.trim().to_string(), line })
}

fn parse_assign(text: &str, line: usize) -> Option<ArtifactLine> {
    let tokens = AssignToken::lexer(text).collect::<Result<Vec<_>, _>>().ok()?;

    match &*tokens {
        [AssignToken::Ident(name), AssignToken::Eq, AssignToken::Number(n), AssignToken::Semi] => {
            let address = parse_int(n).ok()?;
            Some(ArtifactLine::Assign { name: name.to_string(), address, line })
        },
        _ => None
    }
}

/// A parsed artifact.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct LinkerScript {
    lines: Vec<ArtifactLine>,
}
impl LinkerScript {
    /// Parses artifact text.
    ///
    /// Blank lines and comments other than markers are ignored,
    /// and any line which is neither a marker nor an assignment is skipped.
    pub fn parse(text: &str) -> Self {
        let mut lines = vec![];

        for (i, raw) in text.lines().enumerate() {
            let line = i + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }

            let parsed = match trimmed.strip_prefix("/*").and_then(|t| t.strip_suffix("*/")) {
                Some(comment) => parse_marker(comment.trim(), line),
                None => {
                    let parsed = parse_assign(trimmed, line);
                    if parsed.is_none() {
                        tracing::trace!("skipping artifact line {line}: {trimmed}");
                    }
                    parsed
                }
            };
            lines.extend(parsed);
        }

        Self { lines }
    }

    /// The meaningful lines of the artifact, in order.
    pub fn lines(&self) -> &[ArtifactLine] {
        &self.lines
    }
}

#[cfg(test)]
mod tests {
    use crate::config::PatchConfig;
    use crate::symdb::{DbDocument, RegionTag, SymbolDatabase};

    use super::{generate, ArtifactLine, LinkerScript};

    fn file(name: &str, line: usize) -> ArtifactLine {
        ArtifactLine::File { name: name.to_string(), line }
    }
    fn assign(name: &str, address: u32, line: usize) -> ArtifactLine {
        ArtifactLine::Assign { name: name.to_string(), address, line }
    }

    #[test]
    fn test_generate() {
        let docs = vec![
            DbDocument::parse("symbols/arm9.yml", "
                arm9:
                  address:
                    NA: 0x2000000
                  functions:
                    - name: Func
                      address:
                        NA: 0x2000EC8
                  data:
                    - name: DATA
                      address:
                        NA: 0x20A0000
            ").unwrap(),
            DbDocument::parse("symbols/overlay11.yml", "
                overlay11:
                  address:
                    EU: 0x22DCB80
            ").unwrap(),
        ];
        let resolved = SymbolDatabase::from_documents(docs)
            .resolve(&RegionTag::new("NA"), &PatchConfig::default())
            .unwrap();

        let expected = "\
/* THIS FILE IS AUTO-GENERATED. DO NOT MODIFY! */

/* --- symbols/arm9.yml --- */

/* !file arm9 */
ARM9_LOAD_ADDR = 0x2000000;
Func = 0x2000ec8;
DATA = 0x20a0000;

/* --- symbols/overlay11.yml --- */

/* !file overlay11 */
";
        assert_eq!(generate(&resolved), expected);
    }

    #[test]
    fn test_parse() {
        let script = LinkerScript::parse("
            /* THIS FILE IS AUTO-GENERATED. DO NOT MODIFY! */
            /* --- symbols/ov29.yml --- */
            /* !file overlay29 */
            OVERLAY29_LOAD_ADDR = 0x22dc240;
            DungeonAlloc=0x22DEA5C;
            /* an ordinary comment */
            SECTIONS { }
            Broken = 0xZZ;
            Decimal = 100;
        ");

        assert_eq!(script.lines(), [
            ArtifactLine::Source("symbols/ov29.yml".to_string()),
            file("overlay29", 4),
            assign("OVERLAY29_LOAD_ADDR", 0x22DC240, 5),
            assign("DungeonAlloc", 0x22DEA5C, 6),
            assign("Decimal", 100, 10),
        ]);
    }

    #[test]
    fn test_generated_reparses() {
        let doc = DbDocument::parse("a.yml", "
            overlay5:
              functions:
                - name: Ov5Func
                  address:
                    NA: 0x2100000
        ").unwrap();
        let resolved = SymbolDatabase::from_documents(vec![doc])
            .resolve(&RegionTag::new("NA"), &PatchConfig::default())
            .unwrap();

        let script = LinkerScript::parse(&generate(&resolved));
        assert_eq!(script.lines(), [
            ArtifactLine::Source("a.yml".to_string()),
            file("overlay5", 5),
            assign("Ov5Func", 0x2100000, 6),
        ]);
    }
}
