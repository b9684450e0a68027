use kiln_manifest::VariableValue;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Policy file not found: {reference}; searched: {searched}")]
    NotFound { reference: String, searched: String },
    #[error("failed to read policy {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid policy document {origin}: {source}")]
    Parse {
        origin: String,
        source: serde_yaml::Error,
    },
    #[error("policy restriction '{section}' cannot have both 'allow' and 'disallow'")]
    AllowDisallowConflict { section: String },
    #[error("policy restriction '{section}' has conflicting scoped key '{key}'")]
    BadScopedKey { section: String, key: String },
}

/// A loaded policy with target-scoped restriction blocks already unioned
/// into the global blocks for the selected target. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct PolicyDocument {
    pub name: String,
    pub description: String,
    pub allowed_modes: Option<Vec<String>>,
    pub disallowed_modes: Vec<String>,
    pub allowed_targets: Option<Vec<String>>,
    pub disallowed_targets: Vec<String>,
    pub allowed_distros: Option<Vec<String>>,
    pub disallowed_distros: Vec<String>,
    pub forced_variables: BTreeMap<String, VariableValue>,
    pub forbidden_variables: BTreeMap<String, Vec<VariableValue>>,
    pub denied_rpms: Vec<String>,
    pub denied_kernel_modules: Vec<String>,
    pub forced_sysctl: BTreeMap<String, VariableValue>,
    pub forced_selinux_booleans: BTreeMap<String, bool>,
    pub forbidden_properties: Vec<String>,
    pub forbidden_values: BTreeMap<String, Vec<VariableValue>>,
    pub require_simple_manifest: bool,
}

#[derive(Debug, Deserialize)]
struct RawPolicy {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    restrictions: RawRestrictions,
}

#[derive(Debug, Default, Deserialize)]
struct RawRestrictions {
    #[serde(default)]
    modes: Option<RawAllowSection>,
    #[serde(default)]
    targets: Option<RawAllowSection>,
    #[serde(default)]
    distros: Option<RawAllowSection>,
    #[serde(default)]
    variables: RawVariableSection,
    #[serde(default)]
    rpms: RawDenySection,
    #[serde(default)]
    kernel_modules: RawDenySection,
    #[serde(default)]
    sysctl: RawForceSection,
    #[serde(default)]
    selinux_booleans: RawSelinuxSection,
    #[serde(default)]
    manifest: RawManifestSection,
    #[serde(default)]
    require_simple_manifest: bool,
}

/// Allow-list section. `allow@<target>` keys land in `scoped` and are
/// unioned with the global list when the key's target is selected.
#[derive(Debug, Default, Deserialize)]
struct RawAllowSection {
    #[serde(default)]
    allow: Option<Vec<String>>,
    #[serde(default)]
    disallow: Option<Vec<String>>,
    #[serde(flatten)]
    scoped: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDenySection {
    #[serde(default)]
    disallow: Vec<String>,
    #[serde(flatten)]
    scoped: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawVariableSection {
    #[serde(default)]
    force: BTreeMap<String, VariableValue>,
    #[serde(default)]
    forbid: BTreeMap<String, Vec<VariableValue>>,
    #[serde(flatten)]
    scoped: BTreeMap<String, BTreeMap<String, VariableValue>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawForceSection {
    #[serde(default)]
    force: BTreeMap<String, VariableValue>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSelinuxSection {
    #[serde(default)]
    force: BTreeMap<String, bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawManifestSection {
    #[serde(default)]
    forbidden_properties: Vec<String>,
    #[serde(default)]
    forbidden_values: BTreeMap<String, Vec<VariableValue>>,
}

/// Parse a policy document and process its restrictions for the selected
/// target: `@<target>` scoped entries matching it are unioned into the
/// global blocks, entries for other targets are dropped.
pub fn parse_policy_str(
    input: &str,
    origin: &str,
    target: &str,
) -> Result<PolicyDocument, PolicyError> {
    let raw: RawPolicy = serde_yaml::from_str(input).map_err(|source| PolicyError::Parse {
        origin: origin.to_owned(),
        source,
    })?;
    let r = raw.restrictions;

    let (allowed_modes, disallowed_modes) = process_allow_section(r.modes, "modes", target)?;
    let (allowed_targets, disallowed_targets) =
        process_allow_section(r.targets, "targets", target)?;
    let (allowed_distros, disallowed_distros) =
        process_allow_section(r.distros, "distros", target)?;

    let denied_rpms = process_deny_section(r.rpms, "rpms", target)?;
    let denied_kernel_modules = process_deny_section(r.kernel_modules, "kernel_modules", target)?;

    let mut forced_variables = r.variables.force;
    for (key, values) in r.variables.scoped {
        let Some(("force", scoped_target)) = key.split_once('@') else {
            return Err(PolicyError::BadScopedKey {
                section: "variables".to_owned(),
                key,
            });
        };
        if scoped_target == target {
            forced_variables.extend(values);
        }
    }

    debug!("loaded policy '{}' for target '{target}'", raw.name);
    Ok(PolicyDocument {
        name: raw.name,
        description: raw.description,
        allowed_modes,
        disallowed_modes,
        allowed_targets,
        disallowed_targets,
        allowed_distros,
        disallowed_distros,
        forced_variables,
        forbidden_variables: r.variables.forbid,
        denied_rpms,
        denied_kernel_modules,
        forced_sysctl: r.sysctl.force,
        forced_selinux_booleans: r.selinux_booleans.force,
        forbidden_properties: r.manifest.forbidden_properties,
        forbidden_values: r.manifest.forbidden_values,
        require_simple_manifest: r.require_simple_manifest,
    })
}

pub fn load_policy_file(path: &Path, target: &str) -> Result<PolicyDocument, PolicyError> {
    let content = fs::read_to_string(path).map_err(|source| PolicyError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_policy_str(&content, &path.display().to_string(), target)
}

#[allow(clippy::type_complexity)]
fn process_allow_section(
    section: Option<RawAllowSection>,
    name: &str,
    target: &str,
) -> Result<(Option<Vec<String>>, Vec<String>), PolicyError> {
    let Some(section) = section else {
        return Ok((None, Vec::new()));
    };
    if section.allow.is_some() && section.disallow.is_some() {
        return Err(PolicyError::AllowDisallowConflict {
            section: name.to_owned(),
        });
    }

    let allow_style = section.allow.is_some();
    let disallow_style = section.disallow.is_some();
    let mut allow = section.allow;
    let mut disallow = section.disallow.unwrap_or_default();
    for (key, entries) in section.scoped {
        let Some((kind, scoped_target)) = key.split_once('@') else {
            return Err(PolicyError::BadScopedKey {
                section: name.to_owned(),
                key,
            });
        };
        // A section is either allow-style or disallow-style; scoped keys
        // must match the global style.
        match kind {
            "allow" if !disallow_style => {
                if scoped_target == target {
                    allow.get_or_insert_with(Vec::new).extend(entries);
                }
            }
            "disallow" if !allow_style => {
                if scoped_target == target {
                    disallow.extend(entries);
                }
            }
            _ => {
                return Err(PolicyError::BadScopedKey {
                    section: name.to_owned(),
                    key,
                });
            }
        }
    }
    Ok((allow, disallow))
}

fn process_deny_section(
    section: RawDenySection,
    name: &str,
    target: &str,
) -> Result<Vec<String>, PolicyError> {
    let mut denied = section.disallow;
    for (key, entries) in section.scoped {
        let Some(("disallow", scoped_target)) = key.split_once('@') else {
            return Err(PolicyError::BadScopedKey {
                section: name.to_owned(),
                key,
            });
        };
        if scoped_target == target {
            denied.extend(entries);
        }
    }
    Ok(denied)
}
