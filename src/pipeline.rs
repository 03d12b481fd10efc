//! A full patch run.
//!
//! [`run`] ties everything together:
//! 1. checks the overlay reserved for fresh code is loaded (and where it is expected to be)
//! 2. builds the merged symbol table from the artifact, the fresh symbol dump,
//!    and the bounds of every loaded region
//! 3. plans every patch script
//! 4. commits every plan into the region store
//!
//! Nothing is written into the store unless every step succeeds.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

use crate::config::PatchConfig;
use crate::patch::batch::{commit, plan_batch, PatchScript};
use crate::patch::{PatchErr, Patcher};
use crate::region::{RegionId, RegionStore};
use crate::service::{Assembler, ServiceErr, SymbolDumper};
use crate::symdb::linkerscript::LinkerScript;
use crate::symtab::{SymbolTableBuilder, SymtabErr};

/// Errors that can abort a patch run.
#[derive(Debug)]
pub enum RunErr {
    /// The overlay reserved for fresh code is not loaded.
    MissingExtraRegion(RegionId),
    /// The overlay reserved for fresh code is not loaded at the configured address.
    ExtraBaseMismatch {
        /// The overlay.
        region: RegionId,
        /// The configured address.
        expected: u32,
        /// The address it is loaded at.
        found: u32,
    },
    /// The symbol table could not be built.
    Symtab(SymtabErr),
    /// The fresh symbols could not be dumped.
    Service(ServiceErr),
    /// A patch script could not be applied.
    Patch(PatchErr),
}
impl std::fmt::Display for RunErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunErr::MissingExtraRegion(id) => write!(f, "no {id} found for custom code"),
            RunErr::ExtraBaseMismatch { region, expected, found } => write!(f,
                "{region} is loaded at 0x{found:08X}, expected 0x{expected:08X}"
            ),
            RunErr::Symtab(e)  => e.fmt(f),
            RunErr::Service(e) => e.fmt(f),
            RunErr::Patch(e)   => e.fmt(f),
        }
    }
}
impl std::error::Error for RunErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunErr::Symtab(e)  => std::error::Error::source(e),
            RunErr::Service(e) => std::error::Error::source(e),
            RunErr::Patch(e)   => std::error::Error::source(e),
            _ => None
        }
    }
}
impl crate::err::Error for RunErr {
    fn location(&self) -> Option<crate::err::SrcLoc> {
        match self {
            RunErr::Symtab(e) => crate::err::Error::location(e),
            RunErr::Patch(e)  => crate::err::Error::location(e),
            _ => None
        }
    }

    fn help(&self) -> Option<Cow<'_, str>> {
        match self {
            RunErr::MissingExtraRegion(_) => Some("apply the ExtraSpace patch to the ROM first, and list the overlay in the region manifest".into()),
            RunErr::ExtraBaseMismatch { .. } => Some("check the ExtraSpace patch was applied to this ROM".into()),
            RunErr::Symtab(e)  => crate::err::Error::help(e),
            RunErr::Service(e) => crate::err::Error::help(e),
            RunErr::Patch(e)   => crate::err::Error::help(e),
        }
    }
}
macro_rules! impl_from_err {
    ($($t:ty => $variant:ident),*) => {$(
        impl From<$t> for RunErr {
            fn from(value: $t) -> Self {
                RunErr::$variant(value)
            }
        }
    )*}
}
impl_from_err! {
    SymtabErr  => Symtab,
    ServiceErr => Service,
    PatchErr   => Patch
}

/// What a successful run did.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct RunSummary {
    /// The number of symbols in the merged symbol table.
    pub symbols: usize,
    /// The number of scripts applied.
    pub scripts: usize,
    /// The number of bytes written.
    pub bytes: usize,
}

fn check_extra_region(config: &PatchConfig, store: &RegionStore) -> Result<(), RunErr> {
    let id = config.extra_overlay;
    let region = store.get(id).ok_or(RunErr::MissingExtraRegion(id))?;

    match config.extra_base {
        Some(expected) if expected != region.base() => Err(RunErr::ExtraBaseMismatch { region: id, expected, found: region.base() }),
        _ => Ok(())
    }
}

/// Applies every script to the store.
///
/// `artifact` is the text of the generated symbol artifact,
/// and `fresh` is the symbol dump of the fresh code in the extra overlay.
///
/// If anything fails, the store is left untouched.
pub fn run<A>(
    config: &PatchConfig,
    store: &mut RegionStore,
    artifact: &str,
    fresh: HashMap<String, u32>,
    scripts: &[PatchScript],
    assembler: &A
) -> Result<RunSummary, RunErr>
    where A: Assembler + Sync + ?Sized
{
    check_extra_region(config, store)?;

    let mut builder = SymbolTableBuilder::new(config.extra_overlay, config.duplicate_policy);
    builder.add_artifact(&LinkerScript::parse(artifact))?
        .add_fresh(fresh)
        .add_region_bounds(store);
    let symbols = builder.build();

    let plans = plan_batch(&Patcher::new(&symbols, store, assembler), scripts, config.jobs)?;
    commit(store, &plans)?;

    let summary = RunSummary {
        symbols: symbols.len(),
        scripts: plans.len(),
        bytes: plans.iter().map(|p| p.byte_len()).sum(),
    };
    tracing::info!("applied {} patches ({} bytes)", summary.scripts, summary.bytes);
    Ok(summary)
}

/// Applies every script to the store, reading the fresh symbols from a compiled image.
///
/// See [`run`].
pub fn run_with_dumper<A, D>(
    config: &PatchConfig,
    store: &mut RegionStore,
    artifact: &str,
    image: &Path,
    dumper: &D,
    scripts: &[PatchScript],
    assembler: &A
) -> Result<RunSummary, RunErr>
    where A: Assembler + Sync + ?Sized,
          D: SymbolDumper + ?Sized
{
    let fresh = dumper.read_symbols(image)?;
    run(config, store, artifact, fresh, scripts, assembler)
}
