//! The Kiln compilation pipeline: layered variable composition, policy
//! enforcement, and build-plan emission behind one `Compiler` entry point.

pub mod compiler;
pub mod defaults;
pub mod listing;

pub use compiler::{
    CompileRequest, CompileResult, Compiler, DISTRO_DIR, INCLUDE_SUFFIX, MODES_DIR, TARGETS_DIR,
};
pub use listing::{list_include_items, IncludeItem};

use kiln_manifest::{LoadError, MergeError, ResolveError};
use kiln_policy::{PolicyError, ValidationError};
use thiserror::Error;

/// Everything a compilation can fail with, aggregated for the CLI.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("Policy validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("Invalid value passed to {option}: '{value}': should be key=value")]
    InvalidDefine { option: String, value: String },
}

impl CompileError {
    /// Whether this failure is a policy decision rather than a broken input.
    pub fn is_policy_failure(&self) -> bool {
        matches!(self, Self::Policy(_) | Self::Validation(_))
    }
}
