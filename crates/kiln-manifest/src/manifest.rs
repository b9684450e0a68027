use crate::layer::{Layer, LoadError, MergeOp};
use crate::value::VariableValue;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// The two accepted manifest input kinds, distinguished by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Simple,
    LowLevel,
}

impl ManifestKind {
    pub fn from_path(path: &Path) -> Result<Self, LoadError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.ends_with(".aib.yml") {
            Ok(Self::Simple)
        } else if name.ends_with(".mpp.yml") {
            Ok(Self::LowLevel)
        } else {
            Err(LoadError::UnknownManifestKind(path.display().to_string()))
        }
    }

    /// Human-readable kind name used in policy diagnostics.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Simple => "simple manifest (.aib.yml)",
            Self::LowLevel => "low-level manifest (.mpp.yml)",
        }
    }
}

/// A loaded user manifest: its variable layer plus the plan body the build
/// plan is emitted from.
#[derive(Debug)]
pub struct ManifestDocument {
    pub kind: ManifestKind,
    pub vars: Layer,
    pub body: BTreeMap<String, VariableValue>,
}

/// Typed view of a simple (`*.aib.yml`) manifest. Unknown sections are not
/// rejected here; they are carried into the plan body where structural
/// policy checks can see them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimpleManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub content: ContentSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub systemd: SystemdSection,
    #[serde(default)]
    pub kernel: KernelSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentSection {
    #[serde(default)]
    pub rpms: Vec<String>,
    #[serde(default)]
    pub enabled_repos: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSection {
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemdSection {
    #[serde(default)]
    pub enabled_services: Vec<String>,
    #[serde(default)]
    pub disabled_services: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KernelSection {
    #[serde(default)]
    pub cmdline: Option<String>,
    #[serde(default)]
    pub modules: Vec<String>,
}

/// Top-level sections the simple lowering consumes; anything else is carried
/// into the plan body verbatim.
const SIMPLE_SECTIONS: &[&str] = &["name", "version", "content", "network", "systemd", "kernel"];

/// Plan skeleton a simple manifest is lowered onto. Stage options reference
/// the variables the lowered layer (and the built-in defaults) provide.
const SIMPLE_PLAN_SKELETON: &str = r#"
version: "2"
pipelines:
  - name: rootfs
    stages:
      - type: org.osbuild.rpm
        options:
          packages: "${rootfs_rpms}"
      - type: org.osbuild.kernel-cmdline
        options:
          kernel_opts: "${kernel_cmdline}"
      - type: org.osbuild.kernel-modules
        options:
          modules: "${kernel_modules}"
      - type: org.osbuild.systemd
        options:
          enabled_services: "${systemd_enabled_services}"
          disabled_services: "${systemd_disabled_services}"
      - type: org.osbuild.hostname
        options:
          hostname: "${hostname}"
"#;

/// Strip the double extension of a manifest file name: `foo.aib.yml` → `foo`.
pub fn manifest_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.trim_end_matches(".yml")
        .trim_end_matches(".aib")
        .trim_end_matches(".mpp")
        .to_owned()
}

/// Load a user manifest of either kind.
///
/// Low-level manifests split into an `mpp-vars` layer and a plan body that
/// must contain `pipelines`; `mpp-embed` paths are made absolute and must
/// stay under the manifest directory or an include directory. Simple
/// manifests are lowered onto the built-in pipeline skeleton.
pub fn load_manifest(path: &Path, include_dirs: &[PathBuf]) -> Result<ManifestDocument, LoadError> {
    let kind = ManifestKind::from_path(path)?;
    let origin = path.display().to_string();
    let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: origin.clone(),
        source,
    })?;
    let doc: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|source| LoadError::Parse {
            origin: origin.clone(),
            source,
        })?;
    let serde_yaml::Value::Mapping(mapping) = doc else {
        return Err(LoadError::NotAMapping { origin });
    };

    match kind {
        ManifestKind::LowLevel => load_low_level(path, &origin, mapping, include_dirs),
        ManifestKind::Simple => load_simple(&origin, &mapping),
    }
}

fn load_low_level(
    path: &Path,
    origin: &str,
    mut mapping: serde_yaml::Mapping,
    include_dirs: &[PathBuf],
) -> Result<ManifestDocument, LoadError> {
    let vars = match mapping.remove("mpp-vars") {
        Some(serde_yaml::Value::Mapping(vars)) => Layer::from_yaml_mapping("manifest", vars)?,
        Some(_) => {
            return Err(LoadError::NotAMapping {
                origin: format!("{origin} (mpp-vars)"),
            })
        }
        None => Layer::new("manifest"),
    };

    let mut body = BTreeMap::new();
    for (k, v) in mapping {
        let serde_yaml::Value::String(key) = k else {
            return Err(LoadError::Value {
                origin: origin.to_owned(),
                source: crate::value::ValueError::NonStringKey(format!("{k:?}")),
            });
        };
        let value = VariableValue::from_yaml(v).map_err(|source| LoadError::Value {
            origin: origin.to_owned(),
            source,
        })?;
        body.insert(key, value);
    }

    if !matches!(body.get("pipelines"), Some(VariableValue::Sequence(_))) {
        return Err(LoadError::MissingSection("pipelines".to_owned()));
    }

    let manifest_dir = absolute_path(path.parent().unwrap_or_else(|| Path::new(".")));
    let mut roots = vec![manifest_dir.clone()];
    roots.extend(include_dirs.iter().map(|d| absolute_path(d)));
    for value in body.values_mut() {
        rewrite_embed_paths(value, &manifest_dir, &roots)?;
    }

    debug!("loaded low-level manifest {origin}");
    Ok(ManifestDocument {
        kind: ManifestKind::LowLevel,
        vars,
        body,
    })
}

fn load_simple(origin: &str, mapping: &serde_yaml::Mapping) -> Result<ManifestDocument, LoadError> {
    let simple: SimpleManifest =
        serde_yaml::from_value(serde_yaml::Value::Mapping(mapping.clone())).map_err(|source| {
            LoadError::Parse {
                origin: origin.to_owned(),
                source,
            }
        })?;

    let mut vars = Layer::new("manifest");
    if let Some(name) = &simple.name {
        vars.push("name", MergeOp::Override, VariableValue::from(name.clone()));
    }
    vars.push(
        "rootfs_rpms",
        MergeOp::Extend,
        string_sequence(&simple.content.rpms),
    );
    if !simple.content.enabled_repos.is_empty() {
        vars.push(
            "enabled_repos",
            MergeOp::Extend,
            string_sequence(&simple.content.enabled_repos),
        );
    }
    vars.push(
        "kernel_modules",
        MergeOp::Extend,
        string_sequence(&simple.kernel.modules),
    );
    if let Some(cmdline) = &simple.kernel.cmdline {
        vars.push(
            "kernel_cmdline",
            MergeOp::Override,
            VariableValue::from(cmdline.clone()),
        );
    }
    if let Some(hostname) = &simple.network.hostname {
        vars.push(
            "hostname",
            MergeOp::Override,
            VariableValue::from(hostname.clone()),
        );
    }
    vars.push(
        "systemd_enabled_services",
        MergeOp::Extend,
        string_sequence(&simple.systemd.enabled_services),
    );
    vars.push(
        "systemd_disabled_services",
        MergeOp::Extend,
        string_sequence(&simple.systemd.disabled_services),
    );

    let skeleton: serde_yaml::Value = serde_yaml::from_str(SIMPLE_PLAN_SKELETON)
        .map_err(|source| LoadError::Parse {
            origin: "simple plan skeleton".to_owned(),
            source,
        })?;
    let skeleton = VariableValue::from_yaml(skeleton).map_err(|source| LoadError::Value {
        origin: "simple plan skeleton".to_owned(),
        source,
    })?;
    let mut body = skeleton
        .as_mapping()
        .cloned()
        .unwrap_or_default();

    // Sections the lowering does not understand surface in the plan body so
    // structural policy checks can reject them.
    for (k, v) in mapping {
        let serde_yaml::Value::String(key) = k else {
            continue;
        };
        if SIMPLE_SECTIONS.contains(&key.as_str()) {
            continue;
        }
        let value = VariableValue::from_yaml(v.clone()).map_err(|source| LoadError::Value {
            origin: origin.to_owned(),
            source,
        })?;
        body.insert(key.clone(), value);
    }

    debug!("loaded simple manifest {origin}");
    Ok(ManifestDocument {
        kind: ManifestKind::Simple,
        vars,
        body,
    })
}

fn string_sequence(items: &[String]) -> VariableValue {
    VariableValue::Sequence(
        items
            .iter()
            .map(|s| VariableValue::from(s.clone()))
            .collect(),
    )
}

/// Lexical absolutization: prefix the current directory and fold out `.` and
/// `..` components without touching the filesystem.
fn absolute_path(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn rewrite_embed_paths(
    value: &mut VariableValue,
    manifest_dir: &Path,
    roots: &[PathBuf],
) -> Result<(), LoadError> {
    match value {
        VariableValue::Mapping(map) => {
            for (key, child) in map.iter_mut() {
                if key == "mpp-embed" {
                    if let Some(embed) = child.as_mapping_mut() {
                        rewrite_one_embed(embed, manifest_dir, roots)?;
                        continue;
                    }
                }
                rewrite_embed_paths(child, manifest_dir, roots)?;
            }
        }
        VariableValue::Sequence(seq) => {
            for item in seq {
                rewrite_embed_paths(item, manifest_dir, roots)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn rewrite_one_embed(
    embed: &mut BTreeMap<String, VariableValue>,
    manifest_dir: &Path,
    roots: &[PathBuf],
) -> Result<(), LoadError> {
    let Some(VariableValue::String(raw)) = embed.get("path") else {
        return Ok(());
    };
    let resolved = absolute_path(&manifest_dir.join(raw));
    if !roots.iter().any(|root| resolved.starts_with(root)) {
        return Err(LoadError::PathNotAllowed {
            path: raw.clone(),
            context: "mpp-embed".to_owned(),
        });
    }
    embed.insert(
        "path".to_owned(),
        VariableValue::String(resolved.display().to_string()),
    );
    Ok(())
}
