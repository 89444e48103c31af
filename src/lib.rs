//! Distributed PhoSim visit pipeline.
//!
//! A visit is preprocessed once ([`stage::PreprocessStage`]), split into
//! (chip, exposure) units ([`partition`]), raytraced unit by unit on exec
//! nodes ([`stage::RaytraceStage`]) and checked against its [`manifest`]
//! ([`verify`]). Every file name and seed comes from [`identifier`], shared
//! by producers and verifiers.

pub mod archive;
pub mod backend;
pub mod config;
pub mod errors;
pub mod focalplane;
pub mod identifier;
pub mod logging;
pub mod manifest;
pub mod observation;
pub mod partition;
pub mod process;
pub mod stage;
pub mod verify;
