//! Planning and committing many patch scripts at once.
//!
//! Scripts are independent of each other while planned, so planning can be spread out
//! over worker threads ([`plan_batch`]). The plans are then written in script order by [`commit`],
//! which only replaces the store once every plan has been written.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

use crossbeam_channel as cbc;

use crate::region::RegionStore;
use crate::service::Assembler;

use super::{PatchErr, PatchPlan, Patcher};

/// The file extension of patch scripts.
pub const SCRIPT_EXTENSION: &str = "asm";

/// A patch script and its source text.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PatchScript {
    /// The script's path.
    pub path: PathBuf,
    /// The script's text.
    pub source: String,
}

/// Error from reading patch scripts.
#[derive(Debug)]
pub struct ScriptIoErr {
    /// The file or directory that could not be read.
    pub path: PathBuf,
    /// The underlying error.
    pub source: std::io::Error,
}
impl std::fmt::Display for ScriptIoErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "could not read patch scripts from {}", self.path.display())
    }
}
impl std::error::Error for ScriptIoErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
impl crate::err::Error for ScriptIoErr {
    fn help(&self) -> Option<Cow<'_, str>> {
        None
    }
}

impl PatchScript {
    /// Creates a script from its path and text.
    pub fn new(path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        Self { path: path.into(), source: source.into() }
    }

    /// Reads a script from a file.
    pub fn read(path: &Path) -> Result<Self, ScriptIoErr> {
        let source = fs::read_to_string(path)
            .map_err(|source| ScriptIoErr { path: path.to_path_buf(), source })?;
        Ok(Self::new(path, source))
    }

    /// Reads every script (`*.asm`) in a directory, sorted by path.
    pub fn discover(dir: &Path) -> Result<Vec<Self>, ScriptIoErr> {
        let io_err = |source| ScriptIoErr { path: dir.to_path_buf(), source };

        let mut paths = fs::read_dir(dir).map_err(io_err)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err)?;
        paths.retain(|p| p.is_file() && p.extension().is_some_and(|e| e == SCRIPT_EXTENSION));
        paths.sort();

        paths.iter()
            .map(|p| Self::read(p))
            .collect()
    }
}

/// Plans every script, returning the plans in script order.
///
/// With more than one job, scripts are planned on that many worker threads.
/// Either way, if any scripts fail, the error of the first failing script (in script order) is returned.
pub fn plan_batch<A>(patcher: &Patcher<'_, A>, scripts: &[PatchScript], jobs: usize) -> Result<Vec<PatchPlan>, PatchErr>
    where A: Assembler + Sync + ?Sized
{
    let plan_one = |script: &PatchScript| {
        let result = patcher.plan(Some(&script.path), &script.source);
        if let Ok(plan) = &result {
            tracing::debug!("planned {} ({} writes, {} bytes)", script.path.display(), plan.writes.len(), plan.byte_len());
        }
        result
    };

    let workers = jobs.min(scripts.len());
    if workers <= 1 {
        return scripts.iter().map(plan_one).collect();
    }

    let (job_tx, job_rx) = cbc::unbounded();
    let (result_tx, result_rx) = cbc::unbounded();
    for job in scripts.iter().enumerate() {
        // The receiver is alive, so this cannot fail.
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx: cbc::Receiver<(usize, &PatchScript)> = job_rx.clone();
            let result_tx = result_tx.clone();
            let plan_one = &plan_one;

            scope.spawn(move || {
                for (i, script) in job_rx {
                    if result_tx.send((i, plan_one(script))).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut results: Vec<_> = result_rx.into_iter().collect();
    results.sort_by_key(|&(i, _)| i);
    results.into_iter()
        .map(|(_, r)| r)
        .collect()
}

/// Writes every plan into the store, in order.
///
/// The plans are written into a copy of the store, which replaces the store only if every plan was written.
/// If any write fails, the store is left untouched.
pub fn commit(store: &mut RegionStore, plans: &[PatchPlan]) -> Result<(), PatchErr> {
    let mut staged = store.clone();
    for plan in plans {
        plan.apply(&mut staged)?;
        if let Some(path) = &plan.script {
            tracing::info!("applied patch {}", path.display());
        }
    }

    *store = staged;
    Ok(())
}
