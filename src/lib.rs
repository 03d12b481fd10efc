//! A symbol table generator and binary patch engine for NDS overlay modding.
//!
//! Patching happens in two stages.
//!
//! Offline, the hierarchical YAML symbol database is flattened for one game version
//! and written out as a linker script artifact (see [`symdb`]):
//! ```
//! use cot_patcher::config::PatchConfig;
//! use cot_patcher::symdb::{DbDocument, RegionTag, SymbolDatabase};
//! use cot_patcher::symdb::linkerscript::generate;
//!
//! let doc = DbDocument::parse("symbols/overlay29.yml", "
//! overlay29:
//!   address:
//!     NA: 0x22DC240
//!   functions:
//!     - name: GetMovePower
//!       address:
//!         NA: 0x22E8A94
//! ").unwrap();
//!
//! let db = SymbolDatabase::from_documents(vec![doc]);
//! let resolved = db.resolve(&RegionTag::new("NA"), &PatchConfig::default()).unwrap();
//! let artifact = generate(&resolved);
//! assert!(artifact.contains("GetMovePower = 0x22e8a94;"));
//! ```
//!
//! At patch time, the artifact is merged with the symbols of freshly compiled code into a
//! [`symtab::SymbolTable`], and patch scripts are planned and written into the regions:
//! ```
//! use std::collections::HashMap;
//!
//! use cot_patcher::config::PatchConfig;
//! use cot_patcher::patch::batch::PatchScript;
//! use cot_patcher::pipeline;
//! use cot_patcher::region::{Region, RegionId, RegionStore};
//! use cot_patcher::service::ServiceErr;
//!
//! let artifact = "
//! /* !file overlay29 */
//! GetMovePower = 0x22e8a94;
//! ";
//! let fresh = HashMap::from([("CustomGetMovePower".to_string(), 0x023D_7FF0)]);
//!
//! let mut store = RegionStore::from_regions([
//!     Region::new(RegionId::Overlay(29), 0x022D_C240, vec![0; 0x80000]),
//!     Region::new(RegionId::Overlay(36), 0x023A_7080, vec![0; 0x38F80]),
//! ]).unwrap();
//!
//! let script = PatchScript::new("patches/move_power.asm", "
//!     GetMovePower+0x1C:
//!         bl CustomGetMovePower
//! ");
//!
//! // The assembler is external; here, a stand-in which checks the rewritten branch:
//! let assembler = |text: &str, _addr: u32| match text {
//!     "bl 0xef540" => Ok(vec![0x50, 0xBD, 0x03, 0xEB]),
//!     _ => Err(ServiceErr::Rejected(text.to_string())),
//! };
//!
//! pipeline::run(&PatchConfig::default(), &mut store, artifact, fresh, &[script], &assembler).unwrap();
//! assert_eq!(
//!     store.read(RegionId::Overlay(29), 0xC870, 4).unwrap(),
//!     &[0x50, 0xBD, 0x03, 0xEB]
//! );
//! ```
//!
//! The `cot-patch` binary wraps both stages, using `kstool` to assemble and `nm` to dump symbols
//! (see [`service`]).
#![warn(missing_docs)]

pub mod config;
pub mod err;
pub mod parse;
pub mod patch;
pub mod pipeline;
pub mod region;
pub mod service;
pub mod symdb;
pub mod symtab;
