//! Layered manifest model for the Kiln image-build compiler.
//!
//! This crate defines the data layer: the universal `VariableValue` tree,
//! configuration `Layer`s with override/extend/remove merge operations, the
//! merge fold (`merge_layers`), computed-variable resolution (`resolve`),
//! manifest document loading (`load_manifest`), and build-plan emission
//! (`emit_plan`).

pub mod layer;
pub mod manifest;
pub mod merge;
pub mod plan;
pub mod value;
pub mod vars;

pub use layer::{Layer, LayerValue, LoadError, MergeOp};
pub use manifest::{load_manifest, ManifestDocument, ManifestKind, SimpleManifest};
pub use merge::{merge_layers, MergeError, MergedVars};
pub use plan::{emit_plan, BuildPlan};
pub use value::{ValueError, VariableValue};
pub use vars::{resolve, ResolveError, ResolvedVariableSet};

/// Well-known variable names shared between the built-in defaults layer and
/// policy validation.
pub mod names {
    /// Resolved rpm set installed into the image rootfs.
    pub const ROOTFS_RPMS: &str = "rootfs_rpms";
    /// Kernel modules enabled in the image.
    pub const KERNEL_MODULES: &str = "kernel_modules";
    /// Rpms that must not appear in the rootfs.
    pub const DENYLIST_RPMS: &str = "denylist_rpms";
    /// Kernel modules that must not be enabled.
    pub const DENYLIST_MODULES: &str = "denylist_modules";
}
