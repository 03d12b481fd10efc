//! Error interface for this crate.
//!
//! Every error produced by the loader, the symbol table builder, and the patch
//! interpreter implements [`Error`], which extends [`std::error::Error`] with:
//! - [`Error::location`]: where in a text input (a patch script or artifact) the error originated
//! - [`Error::help`]: a short hint on how to fix it
//!
//! The [`report`] function renders both for the command line.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub use crate::parse::lex::LexErr;

/// A line inside a text input.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct SrcLoc {
    /// The file the text came from, if it came from a file.
    pub path: Option<PathBuf>,
    /// The 1-based line number.
    pub line: usize,
}
impl SrcLoc {
    /// Creates a new source location.
    pub fn new(path: Option<&Path>, line: usize) -> Self {
        Self { path: path.map(Path::to_path_buf), line }
    }
}
impl std::fmt::Display for SrcLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{}:{}", p.display(), self.line),
            None    => write!(f, "line {}", self.line),
        }
    }
}

/// Error interface for this crate.
pub trait Error: std::error::Error {
    /// The location in a text input which caused this error (if any).
    fn location(&self) -> Option<SrcLoc> {
        None
    }

    /// A help message describing how the error could be fixed.
    fn help(&self) -> Option<Cow<'_, str>>;
}

/// Renders an error, its location, its help, and its chain of causes.
///
/// ```text
/// error: symbol could not be resolved: OtherFunc
///   --> patches/hook.cotpatch:2
///   = help: check the symbol name against the generated symbol artifact
/// ```
pub fn report(e: &dyn Error) -> String {
    let mut buf = format!("error: {e}");

    let mut cause = std::error::Error::source(e);
    while let Some(c) = cause {
        let _ = write!(buf, ": {c}");
        cause = c.source();
    }
    if let Some(loc) = e.location() {
        let _ = write!(buf, "\n  --> {loc}");
    }
    if let Some(help) = e.help() {
        let _ = write!(buf, "\n  = help: {help}");
    }
    buf
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::SrcLoc;

    #[test]
    fn test_loc_display() {
        assert_eq!(SrcLoc::new(Some(Path::new("a.cotpatch")), 3).to_string(), "a.cotpatch:3");
        assert_eq!(SrcLoc::new(None, 12).to_string(), "line 12");
    }
}
