use crate::document::PolicyDocument;
use kiln_manifest::{names, BuildPlan, ManifestKind, ResolvedVariableSet, VariableValue};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Stage type that receives forced sysctl settings.
const SYSCTL_STAGE: &str = "org.osbuild.sysctl";
/// Stage type that receives forced SELinux booleans.
const SELINUX_STAGE: &str = "org.osbuild.selinux";
/// Pipeline policy-forced stages are injected into.
const ROOTFS_PIPELINE: &str = "rootfs";

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Policy '{policy}' requires using a simple manifest (.aib.yml), but a low-level manifest (.mpp.yml) was provided")]
    ManifestKindNotAllowed { policy: String },
    #[error("Policy '{policy}': mode '{value}' is not in allowed list: [{}]", allowed.join(", "))]
    ModeNotAllowed {
        policy: String,
        value: String,
        allowed: Vec<String>,
    },
    #[error("Policy '{policy}': target '{value}' is not in allowed list: [{}]", allowed.join(", "))]
    TargetNotAllowed {
        policy: String,
        value: String,
        allowed: Vec<String>,
    },
    #[error("Policy '{policy}': distro '{value}' is not in allowed list: [{}]", allowed.join(", "))]
    DistroNotAllowed {
        policy: String,
        value: String,
        allowed: Vec<String>,
    },
    #[error("Policy '{policy}': {kind} '{value}' is in disallowed list")]
    SelectionDisallowed {
        policy: String,
        kind: &'static str,
        value: String,
    },
    #[error("Policy '{policy}': variable '{name}' has forbidden value '{value}'")]
    VariableForbidden {
        policy: String,
        name: String,
        value: String,
    },
    #[error("Rootfs contains denied rpms: {}", rpms.join(", "))]
    RpmDenied { rpms: Vec<String> },
    #[error("Rootfs contains denied kernel modules: {}", modules.join(", "))]
    KernelModuleDenied { modules: Vec<String> },
    #[error("Policy '{policy}': forbidden property '{path}' found in manifest")]
    ManifestForbiddenProperty { policy: String, path: String },
    #[error("Policy '{policy}': property '{path}' has forbidden value '{value}'")]
    ManifestForbiddenValue {
        policy: String,
        path: String,
        value: String,
    },
}

/// The mode/target/distro selection of one build invocation.
#[derive(Debug, Clone, Copy)]
pub struct BuildSelection<'a> {
    pub mode: &'a str,
    pub target: &'a str,
    pub distro: &'a str,
}

/// Run the pre-emission policy checks and apply forced values.
///
/// Checks run in a fixed order and short-circuit on the first failure:
/// manifest kind, mode/target/distro allow-lists, forbidden variables, then
/// forced variables. The forced-variable write (including the denylist
/// contribution) is the only mutation policy validation performs on the
/// variable set, and it happens regardless of what the manifest or command
/// line supplied.
pub fn apply_policy(
    policy: &PolicyDocument,
    selection: BuildSelection<'_>,
    kind: ManifestKind,
    vars: &mut ResolvedVariableSet,
) -> Result<(), ValidationError> {
    if policy.require_simple_manifest && kind == ManifestKind::LowLevel {
        return Err(ValidationError::ManifestKindNotAllowed {
            policy: policy.name.clone(),
        });
    }

    check_selection(
        &policy.name,
        "mode",
        selection.mode,
        policy.allowed_modes.as_deref(),
        &policy.disallowed_modes,
    )?;
    check_selection(
        &policy.name,
        "target",
        selection.target,
        policy.allowed_targets.as_deref(),
        &policy.disallowed_targets,
    )?;
    check_selection(
        &policy.name,
        "distro",
        selection.distro,
        policy.allowed_distros.as_deref(),
        &policy.disallowed_distros,
    )?;

    for (name, forbidden) in &policy.forbidden_variables {
        if let Some(value) = vars.get(name) {
            if forbidden.contains(value) {
                return Err(ValidationError::VariableForbidden {
                    policy: policy.name.clone(),
                    name: name.clone(),
                    value: value.to_string(),
                });
            }
        }
    }

    for (name, value) in &policy.forced_variables {
        debug!("policy '{}' forces variable '{name}'", policy.name);
        vars.force(name.clone(), value.clone());
    }
    vars.extend_sequence(
        names::DENYLIST_RPMS,
        policy
            .denied_rpms
            .iter()
            .map(|s| VariableValue::from(s.clone()))
            .collect(),
    );
    vars.extend_sequence(
        names::DENYLIST_MODULES,
        policy
            .denied_kernel_modules
            .iter()
            .map(|s| VariableValue::from(s.clone()))
            .collect(),
    );

    info!("policy '{}' selection checks passed", policy.name);
    Ok(())
}

fn check_selection(
    policy: &str,
    kind: &'static str,
    value: &str,
    allowed: Option<&[String]>,
    disallowed: &[String],
) -> Result<(), ValidationError> {
    if let Some(allowed) = allowed {
        if !allowed.iter().any(|a| a == value) {
            let err = match kind {
                "mode" => ValidationError::ModeNotAllowed {
                    policy: policy.to_owned(),
                    value: value.to_owned(),
                    allowed: allowed.to_vec(),
                },
                "target" => ValidationError::TargetNotAllowed {
                    policy: policy.to_owned(),
                    value: value.to_owned(),
                    allowed: allowed.to_vec(),
                },
                _ => ValidationError::DistroNotAllowed {
                    policy: policy.to_owned(),
                    value: value.to_owned(),
                    allowed: allowed.to_vec(),
                },
            };
            return Err(err);
        }
    } else if disallowed.iter().any(|d| d == value) {
        return Err(ValidationError::SelectionDisallowed {
            policy: policy.to_owned(),
            kind,
            value: value.to_owned(),
        });
    }
    Ok(())
}

/// Check the resolved package and kernel-module lists against the denylist
/// variables. Runs with or without a policy: the denylists are ordinary
/// variables layers may extend, and a policy merely contributes to them.
pub fn check_denylists(vars: &ResolvedVariableSet) -> Result<(), ValidationError> {
    let denied = denied_entries(vars, names::ROOTFS_RPMS, names::DENYLIST_RPMS);
    if !denied.is_empty() {
        return Err(ValidationError::RpmDenied { rpms: denied });
    }
    let denied = denied_entries(vars, names::KERNEL_MODULES, names::DENYLIST_MODULES);
    if !denied.is_empty() {
        return Err(ValidationError::KernelModuleDenied { modules: denied });
    }
    Ok(())
}

fn denied_entries(vars: &ResolvedVariableSet, content: &str, denylist: &str) -> Vec<String> {
    let Some(content) = vars.get(content).and_then(VariableValue::as_sequence) else {
        return Vec::new();
    };
    let Some(denylist) = vars.get(denylist).and_then(VariableValue::as_sequence) else {
        return Vec::new();
    };
    content
        .iter()
        .filter(|&item| denylist.contains(item))
        .map(ToString::to_string)
        .collect()
}

/// Apply post-emission policy effects to the composed build plan: inject
/// forced sysctl/SELinux stages, then run the structural manifest checks.
pub fn apply_plan_policies(
    policy: &PolicyDocument,
    plan: &mut BuildPlan,
) -> Result<(), ValidationError> {
    if !policy.forced_sysctl.is_empty() {
        let options = plan.stage_options_mut(ROOTFS_PIPELINE, SYSCTL_STAGE);
        inject_sysctl(options, &policy.forced_sysctl);
    }
    if !policy.forced_selinux_booleans.is_empty() {
        let options = plan.stage_options_mut(ROOTFS_PIPELINE, SELINUX_STAGE);
        inject_selinux(options, &policy.forced_selinux_booleans);
    }

    let root = VariableValue::Mapping(plan.root().clone());
    for pattern in &policy.forbidden_properties {
        if !find_matches(&root, pattern).is_empty() {
            return Err(ValidationError::ManifestForbiddenProperty {
                policy: policy.name.clone(),
                path: pattern.clone(),
            });
        }
    }
    for (pattern, literals) in &policy.forbidden_values {
        for matched in find_matches(&root, pattern) {
            if literals.contains(matched) {
                return Err(ValidationError::ManifestForbiddenValue {
                    policy: policy.name.clone(),
                    path: pattern.clone(),
                    value: matched.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn inject_sysctl(
    options: &mut BTreeMap<String, VariableValue>,
    forced: &BTreeMap<String, VariableValue>,
) {
    let items = options
        .entry("items".to_owned())
        .or_insert_with(|| VariableValue::Sequence(Vec::new()));
    if items.as_sequence().is_none() {
        *items = VariableValue::Sequence(Vec::new());
    }
    let Some(items) = items.as_sequence_mut() else {
        return;
    };
    for (key, value) in forced {
        let existing = items.iter_mut().find(|item| {
            item.as_mapping()
                .and_then(|m| m.get("key"))
                .and_then(VariableValue::as_str)
                == Some(key.as_str())
        });
        match existing.and_then(VariableValue::as_mapping_mut) {
            Some(item) => {
                item.insert("value".to_owned(), value.clone());
            }
            None => {
                let mut item = BTreeMap::new();
                item.insert("key".to_owned(), VariableValue::from(key.clone()));
                item.insert("value".to_owned(), value.clone());
                items.push(VariableValue::Mapping(item));
            }
        }
    }
}

fn inject_selinux(
    options: &mut BTreeMap<String, VariableValue>,
    forced: &BTreeMap<String, bool>,
) {
    let booleans = options
        .entry("booleans".to_owned())
        .or_insert_with(|| VariableValue::Mapping(BTreeMap::new()));
    if booleans.as_mapping().is_none() {
        *booleans = VariableValue::Mapping(BTreeMap::new());
    }
    let Some(booleans) = booleans.as_mapping_mut() else {
        return;
    };
    for (name, value) in forced {
        booleans.insert(name.clone(), VariableValue::Bool(*value));
    }
}

/// One segment of a structural path pattern: a mapping key (or `*`
/// wildcard), optionally traversing each element of a sequence (`seg[]`).
struct PatternSeg {
    key: String,
    each: bool,
}

fn parse_pattern(pattern: &str) -> Vec<PatternSeg> {
    pattern
        .split('.')
        .map(|seg| {
            let (key, each) = match seg.strip_suffix("[]") {
                Some(key) => (key, true),
                None => (seg, false),
            };
            PatternSeg {
                key: key.to_owned(),
                each,
            }
        })
        .collect()
}

/// Find all values matched by a path pattern, starting the match at the
/// root and at every nested mapping ("present anywhere").
fn find_matches<'a>(root: &'a VariableValue, pattern: &str) -> Vec<&'a VariableValue> {
    let segs = parse_pattern(pattern);
    let mut starts = Vec::new();
    collect_mappings(root, &mut starts);
    let mut out = Vec::new();
    for start in starts {
        match_segs(start, &segs, &mut out);
    }
    out
}

fn collect_mappings<'a>(value: &'a VariableValue, out: &mut Vec<&'a VariableValue>) {
    match value {
        VariableValue::Mapping(map) => {
            out.push(value);
            for child in map.values() {
                collect_mappings(child, out);
            }
        }
        VariableValue::Sequence(seq) => {
            for child in seq {
                collect_mappings(child, out);
            }
        }
        _ => {}
    }
}

fn match_segs<'a>(node: &'a VariableValue, segs: &[PatternSeg], out: &mut Vec<&'a VariableValue>) {
    let Some((seg, rest)) = segs.split_first() else {
        out.push(node);
        return;
    };
    match node {
        VariableValue::Mapping(map) => {
            let children: Vec<&VariableValue> = if seg.key == "*" {
                map.values().collect()
            } else {
                map.get(&seg.key).into_iter().collect()
            };
            for child in children {
                if seg.each {
                    if let VariableValue::Sequence(seq) = child {
                        for element in seq {
                            match_segs(element, rest, out);
                        }
                    }
                } else {
                    match_segs(child, rest, out);
                }
            }
        }
        VariableValue::Sequence(seq) if seg.key == "*" && !seg.each => {
            for element in seq {
                match_segs(element, rest, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_policy_str;
    use kiln_manifest::{emit_plan, merge_layers, resolve, Layer};

    fn vars_from(doc: &str) -> ResolvedVariableSet {
        let layer = Layer::from_yaml_str("test", doc).unwrap();
        resolve(merge_layers(std::slice::from_ref(&layer)).unwrap()).unwrap()
    }

    fn plan_from(doc: &str, vars: &ResolvedVariableSet) -> BuildPlan {
        let value: serde_yaml::Value = serde_yaml::from_str(doc).unwrap();
        let body = VariableValue::from_yaml(value)
            .unwrap()
            .as_mapping()
            .unwrap()
            .clone();
        emit_plan(&body, vars).unwrap()
    }

    fn selection<'a>() -> BuildSelection<'a> {
        BuildSelection {
            mode: "image",
            target: "ebbr",
            distro: "cs9",
        }
    }

    const POLICY: &str = r#"
name: hardened
restrictions:
  modes:
    allow: [image]
  variables:
    force:
      disable_ipv6: true
    forbid:
      use_legacy_boot: [true]
  rpms:
    disallow: [telnet]
  kernel_modules:
    disallow: [bluetooth]
    disallow@ebbr: [soundcore]
  sysctl:
    force:
      kernel.dmesg_restrict: "1"
  selinux_booleans:
    force:
      secure_mode: true
  manifest:
    forbidden_properties: [experimental]
    forbidden_values:
      network.firewall: [disabled]
"#;

    fn policy_for(target: &str) -> PolicyDocument {
        parse_policy_str(POLICY, "test", target).unwrap()
    }

    #[test]
    fn mode_not_in_allow_list_is_rejected() {
        let policy = policy_for("ebbr");
        let mut vars = vars_from("a: 1\n");
        let err = apply_policy(
            &policy,
            BuildSelection {
                mode: "package",
                target: "ebbr",
                distro: "cs9",
            },
            ManifestKind::Simple,
            &mut vars,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("mode 'package' is not in allowed list"), "{msg}");
    }

    #[test]
    fn forced_value_overrides_user_define() {
        let policy = policy_for("ebbr");
        let mut vars = vars_from("disable_ipv6: false\n");
        apply_policy(&policy, selection(), ManifestKind::Simple, &mut vars).unwrap();
        assert_eq!(vars.get("disable_ipv6"), Some(&VariableValue::Bool(true)));
    }

    #[test]
    fn forbidden_variable_value_is_rejected() {
        let policy = policy_for("ebbr");
        let mut vars = vars_from("use_legacy_boot: true\n");
        let err = apply_policy(&policy, selection(), ManifestKind::Simple, &mut vars)
            .unwrap_err();
        assert!(matches!(err, ValidationError::VariableForbidden { name, .. } if name == "use_legacy_boot"));
    }

    #[test]
    fn require_simple_manifest_names_both_kinds() {
        let policy = parse_policy_str(
            "name: strict\nrestrictions:\n  require_simple_manifest: true\n",
            "test",
            "ebbr",
        )
        .unwrap();
        let mut vars = vars_from("a: 1\n");
        let err = apply_policy(&policy, selection(), ManifestKind::LowLevel, &mut vars)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("simple manifest (.aib.yml)"), "{msg}");
        assert!(msg.contains("low-level manifest (.mpp.yml)"), "{msg}");
    }

    #[test]
    fn denylist_union_is_target_scoped() {
        // Selected target ebbr: both bluetooth and soundcore denied.
        let policy = policy_for("ebbr");
        let mut vars = vars_from("kernel_modules: [soundcore]\nrootfs_rpms: []\n");
        apply_policy(&policy, selection(), ManifestKind::Simple, &mut vars).unwrap();
        let err = check_denylists(&vars).unwrap_err();
        assert!(matches!(err, ValidationError::KernelModuleDenied { ref modules } if modules == &["soundcore"]));

        // Other target: soundcore is fine, bluetooth still denied.
        let policy = policy_for("ridesx4");
        let mut vars = vars_from("kernel_modules: [soundcore]\nrootfs_rpms: []\n");
        apply_policy(
            &policy,
            BuildSelection {
                mode: "image",
                target: "ridesx4",
                distro: "cs9",
            },
            ManifestKind::Simple,
            &mut vars,
        )
        .unwrap();
        check_denylists(&vars).unwrap();

        let mut vars = vars_from("kernel_modules: [bluetooth]\nrootfs_rpms: []\n");
        apply_policy(
            &policy,
            BuildSelection {
                mode: "image",
                target: "ridesx4",
                distro: "cs9",
            },
            ManifestKind::Simple,
            &mut vars,
        )
        .unwrap();
        assert!(check_denylists(&vars).is_err());
    }

    #[test]
    fn denylist_check_runs_without_policy() {
        let vars = vars_from("rootfs_rpms: [vim, strace]\ndenylist_rpms: [strace]\n");
        let err = check_denylists(&vars).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Rootfs contains denied rpms"), "{msg}");
        assert!(msg.contains("strace"), "{msg}");
    }

    #[test]
    fn sysctl_force_injects_into_existing_stage() {
        let policy = policy_for("ebbr");
        let vars = vars_from("a: 1\n");
        let mut plan = plan_from(
            "pipelines:\n  - name: rootfs\n    stages:\n      - type: org.osbuild.sysctl\n        options:\n          items:\n            - key: vm.swappiness\n              value: \"10\"\n",
            &vars,
        );
        apply_plan_policies(&policy, &mut plan).unwrap();
        let json = plan.to_json_pretty().unwrap();
        assert!(json.contains("kernel.dmesg_restrict"), "{json}");
        assert!(json.contains("vm.swappiness"), "{json}");
    }

    #[test]
    fn selinux_force_materializes_stage() {
        let policy = policy_for("ebbr");
        let vars = vars_from("a: 1\n");
        let mut plan = plan_from("pipelines: []\n", &vars);
        apply_plan_policies(&policy, &mut plan).unwrap();
        let json = plan.to_json_pretty().unwrap();
        assert!(json.contains("org.osbuild.selinux"), "{json}");
        assert!(json.contains("secure_mode"), "{json}");
    }

    #[test]
    fn forbidden_property_is_rejected_anywhere() {
        let policy = policy_for("ebbr");
        let vars = vars_from("a: 1\n");
        let mut plan = plan_from(
            "pipelines: []\nmetadata:\n  experimental: true\n",
            &vars,
        );
        let err = apply_plan_policies(&policy, &mut plan).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("forbidden property 'experimental'"), "{msg}");
    }

    #[test]
    fn forbidden_value_is_rejected_at_matching_path() {
        let policy = policy_for("ebbr");
        let vars = vars_from("a: 1\n");
        let mut plan = plan_from(
            "pipelines: []\nnetwork:\n  firewall: disabled\n",
            &vars,
        );
        let err = apply_plan_policies(&policy, &mut plan).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("forbidden value 'disabled'"), "{msg}");
    }

    #[test]
    fn matching_value_not_in_forbidden_list_passes() {
        let policy = policy_for("ebbr");
        let vars = vars_from("a: 1\n");
        let mut plan = plan_from(
            "pipelines: []\nnetwork:\n  firewall: strict\n",
            &vars,
        );
        apply_plan_policies(&policy, &mut plan).unwrap();
    }

    #[test]
    fn pattern_traverses_sequences_and_wildcards() {
        let root: serde_yaml::Value = serde_yaml::from_str(
            "content:\n  images:\n    - transport: registry\n    - transport: dir\n",
        )
        .unwrap();
        let root = VariableValue::from_yaml(root).unwrap();
        let matches = find_matches(&root, "content.images[].transport");
        assert_eq!(matches.len(), 2);
        let matches = find_matches(&root, "content.*");
        assert!(!matches.is_empty());
    }
}
