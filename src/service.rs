//! External services used during a patch run.
//!
//! Assembling instruction text and dumping the symbols of compiled code
//! are done by external tools. They are reached through two traits:
//! - [`Assembler`]: Assembles one line of instruction text at an address.
//! - [`SymbolDumper`]: Lists the symbols of a compiled image.
//!
//! This module also includes implementations of both that run command line tools:
//! - [`KstoolAssembler`]: An `Assembler` which runs Keystone's `kstool`.
//! - [`NmDumper`]: A `SymbolDumper` which runs `nm` (e.g. `arm-none-eabi-nm`).
//!
//! Closures also implement both traits, which is how tests provide in-memory fakes.
//!
//! Patch scripts write branch operands as displacements from the branch (`bl 0x1fc`),
//! while `kstool` reads a branch operand as an absolute target. [`KstoolAssembler`] converts
//! one into the other before assembling, so both agree on where the branch lands.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::parse::{is_branch_mnemonic, numeric_operand};

/// Errors raised by an external service.
#[derive(Debug)]
pub enum ServiceErr {
    /// The tool could not be started.
    Spawn {
        /// The tool.
        program: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
    /// The tool exited unsuccessfully.
    Failed {
        /// The tool.
        program: PathBuf,
        /// The exit code (if it exited normally).
        code: Option<i32>,
        /// Whatever the tool wrote to stderr.
        stderr: String,
    },
    /// The tool ran, but did not accept the input.
    Rejected(String),
}
impl std::fmt::Display for ServiceErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceErr::Spawn { program, .. } => write!(f, "could not run {}", program.display()),
            ServiceErr::Failed { program, code: Some(c), stderr } => write!(f, "{} failed with code {c}: {}", program.display(), stderr.trim()),
            ServiceErr::Failed { program, code: None, stderr }    => write!(f, "{} was terminated: {}", program.display(), stderr.trim()),
            ServiceErr::Rejected(msg) => f.write_str(msg),
        }
    }
}
impl std::error::Error for ServiceErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceErr::Spawn { source, .. } => Some(source),
            _ => None
        }
    }
}
impl crate::err::Error for ServiceErr {
    fn help(&self) -> Option<Cow<'_, str>> {
        match self {
            ServiceErr::Spawn { .. } => Some("check the tool is installed, or pass its path explicitly".into()),
            ServiceErr::Failed { .. } => None,
            ServiceErr::Rejected(_) => Some("check the instruction is valid ARM assembly".into()),
        }
    }
}

/// Something which can assemble instruction text.
pub trait Assembler {
    /// Assembles one line of instruction text, as though it was placed at `address`.
    fn assemble(&self, text: &str, address: u32) -> Result<Vec<u8>, ServiceErr>;
}
impl<F: Fn(&str, u32) -> Result<Vec<u8>, ServiceErr>> Assembler for F {
    fn assemble(&self, text: &str, address: u32) -> Result<Vec<u8>, ServiceErr> {
        self(text, address)
    }
}

/// Something which can list the symbols of a compiled image.
pub trait SymbolDumper {
    /// Reads every symbol's name and address out of the image.
    fn read_symbols(&self, image: &Path) -> Result<HashMap<String, u32>, ServiceErr>;
}
impl<F: Fn(&Path) -> Result<HashMap<String, u32>, ServiceErr>> SymbolDumper for F {
    fn read_symbols(&self, image: &Path) -> Result<HashMap<String, u32>, ServiceErr> {
        self(image)
    }
}

fn run(program: &Path, cmd: &mut Command) -> Result<String, ServiceErr> {
    let output = cmd.output()
        .map_err(|source| ServiceErr::Spawn { program: program.to_path_buf(), source })?;

    if !output.status.success() {
        return Err(ServiceErr::Failed {
            program: program.to_path_buf(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Reads the bytes out of `kstool`'s output.
///
/// `kstool` prints the assembled bytes as a bracketed list of hex pairs after the echoed input.
///
/// # Example
/// ```
/// use cot_patcher::service::parse_kstool_output;
///
/// let bytes = parse_kstool_output("bl 0x1fc = [ 7d 00 00 eb ]\n").unwrap();
/// assert_eq!(bytes, [0x7D, 0x00, 0x00, 0xEB]);
///
/// assert!(parse_kstool_output("ERROR: failed on ks_asm() with count = 0, error = 'Invalid mnemonic (KS_ERR_ASM_MNEMONICFAIL)' (code = 514)").is_err());
/// ```
pub fn parse_kstool_output(stdout: &str) -> Result<Vec<u8>, ServiceErr> {
    let rejected = || ServiceErr::Rejected(stdout.trim().to_string());

    let (_, list) = stdout.rsplit_once("= [").ok_or_else(rejected)?;
    let (list, _) = list.split_once(']').ok_or_else(rejected)?;

    let bytes = list.split_whitespace()
        .map(|b| u8::from_str_radix(b, 16).map_err(|_| rejected()))
        .collect::<Result<Vec<_>, _>>()?;

    match bytes.is_empty() {
        true  => Err(rejected()),
        false => Ok(bytes),
    }
}

/// Reads the symbols out of `nm`'s output.
///
/// Lines with at least three fields are read as `ADDRESS TYPE NAME`, with a hex address.
/// Any other lines (e.g. undefined symbols, which have no address) are ignored.
///
/// If a name appears more than once, the last one is kept.
pub fn parse_nm_output(stdout: &str) -> HashMap<String, u32> {
    stdout.lines()
        .filter_map(|line| {
            let fields: Vec<_> = line.split_whitespace().collect();
            let [addr, _kind, name, ..] = &*fields else { return None };

            match u32::from_str_radix(addr, 16) {
                Ok(addr) => Some((name.to_string(), addr)),
                Err(_) => {
                    tracing::trace!("skipping nm line: {line}");
                    None
                }
            }
        })
        .collect()
}

/// An [`Assembler`] which runs Keystone's `kstool` once per instruction.
#[derive(Debug, Clone)]
pub struct KstoolAssembler {
    /// The path to `kstool`.
    pub program: PathBuf,
    /// The architecture and mode passed to `kstool` (e.g. `arm`, `thumb`).
    pub arch: String,
}
impl Default for KstoolAssembler {
    fn default() -> Self {
        Self { program: PathBuf::from("kstool"), arch: String::from("arm") }
    }
}
impl Assembler for KstoolAssembler {
    fn assemble(&self, text: &str, address: u32) -> Result<Vec<u8>, ServiceErr> {
        let text = kstool_text(text, address)?;
        let stdout = run(&self.program, Command::new(&self.program)
            .arg(&self.arch)
            .arg(&*text)
            .arg(format!("{address:x}"))
        )?;
        parse_kstool_output(&stdout)
    }
}

/// Gets the text `kstool` assembles for an instruction placed at `address`.
///
/// A branch by displacement (`bl 0x1fc`) becomes a branch to its absolute target (`bl 0x2100200`).
/// Anything else is kept as-is.
///
/// # Example
/// ```
/// use cot_patcher::service::kstool_text;
///
/// assert_eq!(kstool_text("bl 0x1fc", 0x0210_0004).unwrap(), "bl 0x2100200");
/// assert_eq!(kstool_text("b -0x10", 0x0210_0010).unwrap(), "b 0x2100000");
/// assert_eq!(kstool_text("mov r0, #4", 0x0210_0010).unwrap(), "mov r0, #4");
/// ```
pub fn kstool_text(text: &str, address: u32) -> Result<Cow<'_, str>, ServiceErr> {
    let mut words = text.split_whitespace();
    let (Some(mnemonic), Some(op), None) = (words.next(), words.next(), words.next()) else {
        return Ok(Cow::Borrowed(text));
    };
    let Some(disp) = numeric_operand(op).filter(|_| is_branch_mnemonic(mnemonic)) else {
        return Ok(Cow::Borrowed(text));
    };

    let target = u32::try_from(i64::from(address) + disp)
        .map_err(|_| ServiceErr::Rejected(format!("`{text}` at 0x{address:08X} branches outside of the address space")))?;
    Ok(Cow::Owned(format!("{mnemonic} {target:#x}")))
}

/// A [`SymbolDumper`] which runs `nm` on an ELF image.
#[derive(Debug, Clone)]
pub struct NmDumper {
    /// The path to `nm`.
    pub program: PathBuf,
}
impl Default for NmDumper {
    fn default() -> Self {
        Self { program: PathBuf::from("arm-none-eabi-nm") }
    }
}
impl SymbolDumper for NmDumper {
    fn read_symbols(&self, image: &Path) -> Result<HashMap<String, u32>, ServiceErr> {
        let stdout = run(&self.program, Command::new(&self.program).arg(image))?;
        let symbols = parse_nm_output(&stdout);
        tracing::debug!("read {} symbols from {}", symbols.len(), image.display());
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use super::{kstool_text, parse_kstool_output, parse_nm_output, Assembler, ServiceErr, SymbolDumper};

    #[test]
    fn test_kstool_output() {
        assert_eq!(parse_kstool_output("nop = [ 00 00 a0 e1 ]").unwrap(), [0x00, 0x00, 0xA0, 0xE1]);
        assert_eq!(
            parse_kstool_output("mov r0, #1; bx lr = [ 01 00 a0 e3 1e ff 2f e1 ]\n").unwrap(),
            [0x01, 0x00, 0xA0, 0xE3, 0x1E, 0xFF, 0x2F, 0xE1]
        );

        assert!(matches!(parse_kstool_output(""), Err(ServiceErr::Rejected(_))));
        assert!(matches!(parse_kstool_output("x = [ ]"), Err(ServiceErr::Rejected(_))));
        assert!(matches!(parse_kstool_output("x = [ zz ]"), Err(ServiceErr::Rejected(_))));
    }

    #[test]
    fn test_nm_output() {
        let symbols = parse_nm_output("
023d8000 T CustomGetMovePower
023d8100 t $a
         U memcpy
023e0000 D __init_array_start
garbage line here
");
        assert_eq!(symbols.len(), 3);
        assert_eq!(symbols["CustomGetMovePower"], 0x023D_8000);
        assert_eq!(symbols["$a"], 0x023D_8100);
        assert_eq!(symbols["__init_array_start"], 0x023E_0000);
    }

    #[test]
    fn test_closures() {
        let asm = |text: &str, _addr: u32| match text {
            "nop" => Ok(vec![0x00, 0x00, 0xA0, 0xE1]),
            _ => Err(ServiceErr::Rejected(format!("unknown: {text}"))),
        };
        assert_eq!(asm.assemble("nop", 0).unwrap().len(), 4);
        assert!(asm.assemble("bad", 0).is_err());

        let dumper = |_: &Path| -> Result<HashMap<String, u32>, ServiceErr> {
            Ok(HashMap::from([("Sym".to_string(), 4)]))
        };
        assert_eq!(dumper.read_symbols(Path::new("x.elf")).unwrap()["Sym"], 4);
    }

    #[test]
    fn test_kstool_branch_targets() {
        // The displacement is from the branch itself:
        assert_eq!(kstool_text("bl 0x1fc", 0x0210_0004).unwrap(), "bl 0x2100200");
        assert_eq!(kstool_text("BNE #-0x214", 0x0210_0214).unwrap(), "BNE 0x2100000");
        assert_eq!(kstool_text("bl 0", 0x023D_7FF0).unwrap(), "bl 0x23d7ff0");

        // Anything which is not a branch by displacement is untouched:
        assert_eq!(kstool_text("nop", 0x0210_0000).unwrap(), "nop");
        assert_eq!(kstool_text("blx r3", 0x0210_0000).unwrap(), "blx r3");
        assert_eq!(kstool_text(".word 0x2000100", 0x0210_0000).unwrap(), ".word 0x2000100");
        assert_eq!(kstool_text("ldr r0, [r1, #4]", 0x0210_0000).unwrap(), "ldr r0, [r1, #4]");

        assert!(matches!(kstool_text("b -0x10", 0x8), Err(ServiceErr::Rejected(_))));
        assert!(matches!(kstool_text("b 0x10", 0xFFFF_FFF8), Err(ServiceErr::Rejected(_))));
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, name: &str, script: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    // Every test which runs a process is kept in this one test,
    // so no other thread forks while a fake tool is open for writing.
    #[cfg(unix)]
    #[test]
    fn test_command_line_tools() {
        use super::{KstoolAssembler, NmDumper};

        let dir = std::env::temp_dir().join(format!("cot-patcher-service-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let kstool = fake_tool(&dir, "kstool", r#"#!/bin/sh
printf '%s\n' "$@" > "$0.args"
case "$2" in
    bad*) echo "ERROR: failed on ks_asm() with count = 0, error = 'Invalid mnemonic (KS_ERR_ASM_MNEMONICFAIL)' (code = 514)" ;;
    crash*) echo "out of memory" >&2; exit 3 ;;
    *) echo "$2 = [ 7d 00 00 eb ]" ;;
esac
"#);
        let args = |tool: &Path| std::fs::read_to_string(tool.with_extension("args")).unwrap();

        let asm = KstoolAssembler { program: kstool.clone(), arch: String::from("arm") };
        assert_eq!(asm.assemble("bl 0x1fc", 0x0210_0004).unwrap(), [0x7D, 0x00, 0x00, 0xEB]);
        assert_eq!(args(&kstool), "arm\nbl 0x2100200\n2100004\n");

        assert_eq!(asm.assemble("mov r0, #1", 0x0210_0008).unwrap().len(), 4);
        assert_eq!(args(&kstool), "arm\nmov r0, #1\n2100008\n");

        assert!(matches!(asm.assemble("bad r0", 0), Err(ServiceErr::Rejected(_))));
        assert!(matches!(
            asm.assemble("crash", 0),
            Err(ServiceErr::Failed { code: Some(3), stderr, .. }) if stderr.trim() == "out of memory"
        ));

        let nm = fake_tool(&dir, "nm", r#"#!/bin/sh
[ "$1" = "cot.elf" ] || { echo "nm: '$1': No such file" >&2; exit 1; }
echo "023d7ff0 T CustomGetMovePower"
echo "         U memcpy"
"#);
        let dumper = NmDumper { program: nm };
        let symbols = dumper.read_symbols(Path::new("cot.elf")).unwrap();
        assert_eq!(symbols, HashMap::from([("CustomGetMovePower".to_string(), 0x023D_7FF0)]));
        assert!(matches!(dumper.read_symbols(Path::new("other.elf")), Err(ServiceErr::Failed { code: Some(1), .. })));

        let missing = KstoolAssembler { program: dir.join("no-such-kstool"), arch: String::from("arm") };
        assert!(matches!(missing.assemble("nop", 0), Err(ServiceErr::Spawn { .. })));
        let missing = NmDumper { program: dir.join("no-such-nm") };
        assert!(matches!(missing.read_symbols(Path::new("cot.elf")), Err(ServiceErr::Spawn { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
