use std::borrow::Cow;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use cot_patcher::config::{DuplicatePolicy, PatchConfig};
use cot_patcher::err::{self, Error};
use cot_patcher::patch::batch::PatchScript;
use cot_patcher::pipeline;
use cot_patcher::region::manifest::RegionManifest;
use cot_patcher::region::RegionId;
use cot_patcher::service::{KstoolAssembler, NmDumper};
use cot_patcher::symdb::linkerscript::generate_from_dir;
use cot_patcher::symdb::RegionTag;
use tracing::Level;

#[derive(Parser)]
#[command(name = "cot-patch", version, about = "Generates symbol artifacts and applies binary patches to NDS overlays")]
struct Cli {
    /// One of `TRACE`, `DEBUG`, `INFO`, `WARN`, or `ERROR`
    #[arg(short, long, global = true, default_value_t = Level::INFO)]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generates the symbol artifact for one game version from the symbol database.
    Symbols {
        /// Directory holding the YAML symbol database
        db_root: PathBuf,

        /// The game version to generate symbols for (e.g. `NA`, `EU`, `JP`)
        tag: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// The overlay reserved for custom code, which is left out of the artifact
        #[arg(long, value_name = "N")]
        extra_overlay: Option<u32>,

        /// Fail on duplicate symbol names instead of warning
        #[arg(long)]
        deny_duplicates: bool,
    },
    /// Applies every patch script to the binaries listed in a region manifest.
    Patch {
        /// Region manifest (YAML list of `region`, `base`, `file`)
        #[arg(long)]
        regions: PathBuf,

        /// Directory holding the binaries named in the region manifest
        #[arg(long)]
        bin_dir: PathBuf,

        /// The generated symbol artifact
        #[arg(long)]
        artifact: PathBuf,

        /// The compiled custom code, whose symbols are dumped with `nm`
        #[arg(long)]
        elf: PathBuf,

        /// Directory holding the patch scripts (`*.asm`)
        #[arg(long)]
        scripts: PathBuf,

        /// Directory the patched binaries are written to
        #[arg(long)]
        out_dir: PathBuf,

        /// Number of worker threads assembling patch scripts (overrides the config file)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Path to Keystone's `kstool`
        #[arg(long, default_value = "kstool")]
        kstool: PathBuf,

        /// Path to `nm`
        #[arg(long, default_value = "arm-none-eabi-nm")]
        nm: PathBuf,

        /// Architecture passed to `kstool`
        #[arg(long, default_value = "arm")]
        arch: String,

        /// YAML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Error from reading or writing one of the command's files.
#[derive(Debug)]
struct FileErr {
    path: PathBuf,
    source: io::Error,
}
impl std::fmt::Display for FileErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "could not access {}", self.path.display())
    }
}
impl std::error::Error for FileErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
impl Error for FileErr {
    fn help(&self) -> Option<Cow<'_, str>> {
        None
    }
}
fn file_err(path: &Path) -> impl FnOnce(io::Error) -> Box<dyn Error> + '_ {
    move |source| -> Box<dyn Error> { Box::new(FileErr { path: path.to_path_buf(), source }) }
}

fn boxed<E: Error + 'static>(e: E) -> Box<dyn Error> {
    Box::new(e)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(io::stderr)
        .init();

    match main_real(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", err::report(&*e));
            ExitCode::FAILURE
        }
    }
}

fn main_real(command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Symbols { db_root, tag, output, extra_overlay, deny_duplicates } => {
            let mut config = PatchConfig::default();
            if let Some(n) = extra_overlay {
                config.extra_overlay = RegionId::Overlay(n);
            }
            if deny_duplicates {
                config.duplicate_policy = DuplicatePolicy::Deny;
            }

            let artifact = generate_from_dir(&db_root, &RegionTag::new(tag), &config).map_err(boxed)?;
            match output {
                Some(path) => fs::write(&path, artifact).map_err(file_err(&path))?,
                None => print!("{artifact}"),
            }
        },
        Command::Patch { regions, bin_dir, artifact, elf, scripts, out_dir, jobs, kstool, nm, arch, config } => {
            let mut config = match config {
                Some(path) => PatchConfig::read(&path).map_err(boxed)?,
                None => PatchConfig::default(),
            };
            if let Some(jobs) = jobs {
                config.jobs = jobs;
            }

            let manifest = RegionManifest::read(&regions).map_err(boxed)?;
            let mut store = manifest.load_store(&bin_dir).map_err(boxed)?;
            let artifact_text = fs::read_to_string(&artifact).map_err(file_err(&artifact))?;
            let scripts = PatchScript::discover(&scripts).map_err(boxed)?;
            tracing::info!("found {} patch scripts", scripts.len());

            let assembler = KstoolAssembler { program: kstool, arch };
            let dumper = NmDumper { program: nm };
            let summary = pipeline::run_with_dumper(&config, &mut store, &artifact_text, &elf, &dumper, &scripts, &assembler)
                .map_err(boxed)?;

            manifest.save_store(&store, &out_dir).map_err(boxed)?;
            tracing::info!("wrote {} regions to {} ({} symbols, {} bytes patched)", manifest.entries().len(), out_dir.display(), summary.symbols, summary.bytes);
        },
    }

    Ok(())
}
