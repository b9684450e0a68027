//! Policy resolution and validation for the Kiln image-build compiler.
//!
//! A policy document (`*.aibp.yml`) restricts what a build may contain:
//! mode/target/distro allow-lists, forced and forbidden variables, rpm and
//! kernel-module denylists, forced sysctl/SELinux settings, and structural
//! restrictions on the emitted build plan. Policies are found through a
//! fixed search order (`find_policy`), loaded once per invocation
//! (`load_policy_file`), and applied by the validator (`validate`).

pub mod document;
pub mod search;
pub mod validate;

pub use document::{load_policy_file, parse_policy_str, PolicyDocument, PolicyError};
pub use search::{find_policy, PolicyLocation, PolicySearchResult, SearchConfig, POLICY_SUFFIX};
pub use validate::{
    apply_plan_policies, apply_policy, check_denylists, BuildSelection, ValidationError,
};
