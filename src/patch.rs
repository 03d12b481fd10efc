//! Applying patch scripts to regions.
//!
//! A script is applied in two steps:
//! 1. [`Patcher::plan`] walks the script's directives, resolves every symbol,
//!    assembles every instruction, and checks every write lies inside its region.
//!    This produces a [`PatchPlan`] and mutates nothing.
//! 2. [`PatchPlan::apply`] writes the planned bytes into a [`RegionStore`].
//!
//! Branches to symbols (`bl OtherFunc`) are rewritten into branches by displacement
//! (`bl 0x1fc`) before they are assembled, because the assembler only sees the
//! address it is assembling at and not where the target symbol lives.
//!
//! [`batch`] plans and applies many scripts at once.

pub mod batch;

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use crate::err::SrcLoc;
use crate::parse::{parse_script, Directive, Instr, OperandKind, ParseErr, ParseErrKind};
use crate::region::{RegionErr, RegionId, RegionStore};
use crate::service::{Assembler, ServiceErr};
use crate::symtab::SymbolTable;

/// Kinds of errors that can occur from applying a patch script.
#[derive(Debug)]
pub enum PatchErrKind {
    /// The script could not be parsed.
    Parse(ParseErrKind),
    /// An anchor or operand refers to a symbol not in the symbol table.
    UnresolvedSymbol(String),
    /// An instruction appeared before any anchor.
    NoActiveAnchor,
    /// The assembler rejected an instruction.
    Assembly {
        /// The text given to the assembler.
        text: String,
        /// The assembler's error.
        source: ServiceErr,
    },
    /// A write fell outside of its region.
    Region(RegionErr),
    /// An anchor offset or write moved the cursor past the end of the address space.
    AddressOverflow,
}
impl std::fmt::Display for PatchErrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e)              => e.fmt(f),
            Self::UnresolvedSymbol(s)   => write!(f, "symbol could not be resolved: {s}"),
            Self::NoActiveAnchor        => f.write_str("instruction has no anchor to be written at"),
            Self::Assembly { text, .. } => write!(f, "could not assemble `{text}`"),
            Self::Region(e)             => e.fmt(f),
            Self::AddressOverflow       => f.write_str("address overflowed the 32-bit address space"),
        }
    }
}

/// Error from applying a patch script.
#[derive(Debug)]
pub struct PatchErr {
    /// The kind of error.
    pub kind: PatchErrKind,
    /// Where in the script the error occurred.
    pub loc: SrcLoc,
}
impl PatchErr {
    /// Creates a new [`PatchErr`].
    pub fn new(kind: PatchErrKind, loc: SrcLoc) -> Self {
        Self { kind, loc }
    }
}
impl std::fmt::Display for PatchErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind.fmt(f)
    }
}
impl std::error::Error for PatchErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PatchErrKind::Assembly { source, .. } => Some(source),
            _ => None
        }
    }
}
impl crate::err::Error for PatchErr {
    fn location(&self) -> Option<SrcLoc> {
        Some(self.loc.clone())
    }

    fn help(&self) -> Option<Cow<'_, str>> {
        match &self.kind {
            PatchErrKind::Parse(ParseErrKind::MalformedAnchor) => Some("anchors have the form `Symbol+Offset:`, with the offset in hex".into()),
            PatchErrKind::Parse(ParseErrKind::Lex(e)) => crate::err::Error::help(e),
            PatchErrKind::UnresolvedSymbol(_)   => Some("check the symbol name against the generated symbol artifact and the custom code".into()),
            PatchErrKind::NoActiveAnchor        => Some("add an anchor (`Symbol+Offset:`) before this instruction".into()),
            PatchErrKind::Assembly { source, .. } => crate::err::Error::help(source),
            PatchErrKind::Region(e)             => crate::err::Error::help(e),
            PatchErrKind::AddressOverflow       => None,
        }
    }
}

/// Formats a displacement as a signed hex literal (`0x1fc`, `-0x10`).
///
/// ```
/// use cot_patcher::patch::format_displacement;
///
/// assert_eq!(format_displacement(0x1FC), "0x1fc");
/// assert_eq!(format_displacement(-0x10), "-0x10");
/// assert_eq!(format_displacement(0), "0x0");
/// ```
pub fn format_displacement(disp: i64) -> String {
    match disp < 0 {
        true  => format!("-{:#x}", disp.unsigned_abs()),
        false => format!("{disp:#x}"),
    }
}

/// One write of a [`PatchPlan`].
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PatchWrite {
    /// The region written to.
    pub region: RegionId,
    /// The absolute address of the first byte written.
    pub address: u32,
    /// The offset of the first byte written within the region.
    pub offset: usize,
    /// The bytes to write.
    pub bytes: Vec<u8>,
    /// The script line these bytes were assembled from.
    pub line: usize,
}

/// The writes of one patch script, ready to be applied.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct PatchPlan {
    /// The script's path (if it came from a file).
    pub script: Option<PathBuf>,
    /// The planned writes, in script order.
    pub writes: Vec<PatchWrite>,
}
impl PatchPlan {
    /// The total number of bytes written by this plan.
    pub fn byte_len(&self) -> usize {
        self.writes.iter().map(|w| w.bytes.len()).sum()
    }

    /// Writes every planned write into the store, in order.
    ///
    /// Writes are not rolled back if one fails partway through;
    /// [`batch::commit`] applies plans to a copy of the store for that reason.
    pub fn apply(&self, store: &mut RegionStore) -> Result<(), PatchErr> {
        for w in &self.writes {
            store.write(w.region, w.offset, &w.bytes)
                .map_err(|e| PatchErr::new(PatchErrKind::Region(e), SrcLoc::new(self.script.as_deref(), w.line)))?;
        }
        Ok(())
    }
}

/// Plans patch scripts against a symbol table and a set of regions.
///
/// # Example
/// ```
/// use cot_patcher::config::DuplicatePolicy;
/// use cot_patcher::patch::Patcher;
/// use cot_patcher::region::{Region, RegionId, RegionStore};
/// use cot_patcher::service::ServiceErr;
/// use cot_patcher::symtab;
///
/// let symbols = symtab::build("
///     /* !file overlay5 */
///     MyFunc = 0x2100000;
///     OtherFunc = 0x2100200;
/// ", [], RegionId::Overlay(36), DuplicatePolicy::Warn).unwrap();
///
/// let mut regions = RegionStore::from_regions([
///     Region::new(RegionId::Overlay(5), 0x0210_0000, vec![0; 0x400]),
/// ]).unwrap();
///
/// // A stand-in for a real assembler:
/// let assembler = |text: &str, _addr: u32| match text {
///     "bl 0x1fc" => Ok(vec![0x7D, 0x00, 0x00, 0xEB]),
///     _ => Err(ServiceErr::Rejected(text.to_string())),
/// };
///
/// let patcher = Patcher::new(&symbols, &regions, &assembler);
/// let plan = patcher.plan(None, "MyFunc+0x4:\n    bl OtherFunc\n").unwrap();
/// plan.apply(&mut regions).unwrap();
///
/// assert_eq!(regions.read(RegionId::Overlay(5), 4, 4).unwrap(), &[0x7D, 0x00, 0x00, 0xEB]);
/// ```
pub struct Patcher<'a, A: ?Sized> {
    symbols: &'a SymbolTable,
    regions: &'a RegionStore,
    assembler: &'a A,
}
impl<'a, A: Assembler + ?Sized> Patcher<'a, A> {
    /// Creates a new patcher.
    pub fn new(symbols: &'a SymbolTable, regions: &'a RegionStore, assembler: &'a A) -> Self {
        Self { symbols, regions, assembler }
    }

    fn resolve(&self, name: &str) -> Result<(u32, RegionId), PatchErrKind> {
        self.symbols.resolve(name)
            .ok_or_else(|| PatchErrKind::UnresolvedSymbol(name.to_string()))
    }

    /// Gets the text to assemble for an instruction placed at `address`,
    /// rewriting its symbolic operand (if it has one).
    fn instr_text<'i>(&self, instr: &'i Instr, address: u32) -> Result<Cow<'i, str>, PatchErrKind> {
        let Some(operand) = &instr.operand else {
            return Ok(Cow::Borrowed(&instr.text));
        };

        let (target, _) = self.resolve(&operand.symbol)?;
        let value = match operand.kind {
            OperandKind::Branch => format_displacement(i64::from(target) - i64::from(address)),
            OperandKind::Word   => format!("{target:#x}"),
        };
        Ok(Cow::Owned(instr.with_operand(&value).into_owned()))
    }

    /// Plans a patch script.
    ///
    /// `path` is only used to report where errors occurred.
    pub fn plan(&self, path: Option<&Path>, src: &str) -> Result<PatchPlan, PatchErr> {
        struct Cursor {
            // The address of the next write.
            address: u32,
            // The region being written to.
            region: RegionId,
        }

        let stmts = parse_script(src)
            .map_err(|ParseErr { kind, line }| PatchErr::new(PatchErrKind::Parse(kind), SrcLoc::new(path, line)))?;

        let mut cursor: Option<Cursor> = None;
        let mut writes = vec![];

        for stmt in stmts {
            let err = |kind| PatchErr::new(kind, SrcLoc::new(path, stmt.line));

            match &stmt.directive {
                Directive::Anchor { symbol, offset } => {
                    let (base, region) = self.resolve(symbol).map_err(err)?;
                    let address = base.checked_add(*offset)
                        .ok_or_else(|| err(PatchErrKind::AddressOverflow))?;

                    tracing::trace!("anchored at {symbol}+{offset:#x} ({region} 0x{address:08X})");
                    cursor.replace(Cursor { address, region });
                },
                Directive::Instr(instr) => {
                    let Some(cur) = cursor.as_mut() else {
                        return Err(err(PatchErrKind::NoActiveAnchor));
                    };

                    let text = self.instr_text(instr, cur.address).map_err(err)?;
                    let bytes = self.assembler.assemble(&text, cur.address)
                        .map_err(|source| err(PatchErrKind::Assembly { text: text.to_string(), source }))?;

                    let offset = self.regions.translate(cur.region, cur.address)
                        .and_then(|off| self.regions.check_span(cur.region, off, bytes.len()).map(|_| off))
                        .map_err(|e| err(PatchErrKind::Region(e)))?;

                    let address = cur.address;
                    cur.address = u32::try_from(bytes.len()).ok()
                        .and_then(|n| address.checked_add(n))
                        .ok_or_else(|| err(PatchErrKind::AddressOverflow))?;

                    writes.push(PatchWrite { region: cur.region, address, offset, bytes, line: stmt.line });
                }
            }
        }

        Ok(PatchPlan { script: path.map(Path::to_path_buf), writes })
    }
}
