use crate::document::PolicyError;
use std::path::PathBuf;
use tracing::debug;

/// Extension every installed policy document carries.
pub const POLICY_SUFFIX: &str = ".aibp.yml";

/// The ordered set of roots a policy reference is resolved against. Passed
/// explicitly through every lookup; never read from process-wide state.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Working directory for `*.aibp.yml` references.
    pub local_dir: PathBuf,
    /// System-wide overrides, e.g. `/etc/kiln/policies`.
    pub system_dir: PathBuf,
    /// Policies shipped with the tool's data directory.
    pub package_dir: PathBuf,
}

impl SearchConfig {
    pub fn new(
        local_dir: impl Into<PathBuf>,
        system_dir: impl Into<PathBuf>,
        package_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            local_dir: local_dir.into(),
            system_dir: system_dir.into(),
            package_dir: package_dir.into(),
        }
    }
}

/// Which search location satisfied a policy reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyLocation {
    Explicit,
    Local,
    System,
    Package,
}

#[derive(Debug, Clone)]
pub struct PolicySearchResult {
    pub path: PathBuf,
    pub location: PolicyLocation,
}

/// Resolve a policy reference to a concrete file.
///
/// A reference containing a path separator is taken as an explicit path. A
/// bare name (no `.aibp.yml` suffix) is looked up only in the installed
/// locations, system before package. A `*.aibp.yml` filename is looked up
/// in the working directory first, then the installed locations, so a local
/// file of the same name always shadows an installed one.
pub fn find_policy(
    reference: &str,
    config: &SearchConfig,
) -> Result<PolicySearchResult, PolicyError> {
    let candidates: Vec<(PolicyLocation, PathBuf)> = if reference.contains(std::path::MAIN_SEPARATOR)
        || reference.contains('/')
    {
        vec![(PolicyLocation::Explicit, PathBuf::from(reference))]
    } else if reference.ends_with(POLICY_SUFFIX) {
        vec![
            (PolicyLocation::Local, config.local_dir.join(reference)),
            (PolicyLocation::System, config.system_dir.join(reference)),
            (PolicyLocation::Package, config.package_dir.join(reference)),
        ]
    } else {
        let file_name = format!("{reference}{POLICY_SUFFIX}");
        vec![
            (PolicyLocation::System, config.system_dir.join(&file_name)),
            (PolicyLocation::Package, config.package_dir.join(&file_name)),
        ]
    };

    for (location, path) in &candidates {
        if path.is_file() {
            debug!("policy '{reference}' resolved at {:?}: {}", location, path.display());
            return Ok(PolicySearchResult {
                path: path.clone(),
                location: *location,
            });
        }
    }

    Err(PolicyError::NotFound {
        reference: reference.to_owned(),
        searched: candidates
            .iter()
            .map(|(_, p)| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}
