use crate::defaults::BUILTIN_DEFAULTS;
use crate::CompileError;
use kiln_manifest::{
    emit_plan, load_manifest, manifest::manifest_stem, merge_layers, resolve, BuildPlan, Layer,
    LoadError, MergeOp, ResolvedVariableSet, VariableValue,
};
use kiln_policy::{
    apply_plan_policies, apply_policy, check_denylists, find_policy, load_policy_file,
    BuildSelection, PolicyDocument, SearchConfig,
};
use std::path::PathBuf;
use tracing::{debug, info};

/// Extension of distro/target/mode include documents.
pub const INCLUDE_SUFFIX: &str = ".ipp.yml";

/// Include subdirectory holding distro layers.
pub const DISTRO_DIR: &str = "distro";
/// Include subdirectory holding target layers.
pub const TARGETS_DIR: &str = "targets";
/// Include subdirectory holding mode layers.
pub const MODES_DIR: &str = "modes";

/// One compilation request: the manifest plus everything selected on the
/// command line.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub manifest: PathBuf,
    pub distro: String,
    pub target: String,
    pub mode: String,
    pub arch: String,
    pub policy: Option<String>,
    /// `key=value` overrides, highest-precedence layer.
    pub defines: Vec<String>,
    /// `key=value` sequence extensions in the same layer.
    pub extend_defines: Vec<String>,
    /// Extra layer documents merged between the manifest and the defines.
    pub define_files: Vec<PathBuf>,
}

/// A finished compilation: the composed plan plus the resolved variables it
/// was emitted from.
#[derive(Debug)]
pub struct CompileResult {
    pub plan: BuildPlan,
    pub variables: ResolvedVariableSet,
    /// Name of the policy that validated the build, when one was selected.
    pub policy: Option<String>,
}

/// The compilation pipeline. Holds the include search roots and the policy
/// search configuration; one instance serves any number of requests.
#[derive(Debug)]
pub struct Compiler {
    include_dirs: Vec<PathBuf>,
    search: SearchConfig,
}

impl Compiler {
    pub fn new(include_dirs: Vec<PathBuf>, search: SearchConfig) -> Self {
        Self {
            include_dirs,
            search,
        }
    }

    pub fn include_dirs(&self) -> &[PathBuf] {
        &self.include_dirs
    }

    /// Run one compilation end to end: load, layer, merge, resolve,
    /// validate, emit, validate the emitted plan.
    pub fn compile(&self, request: &CompileRequest) -> Result<CompileResult, CompileError> {
        let manifest = load_manifest(&request.manifest, &self.include_dirs)?;
        info!(
            "compiling {} for {}/{}/{}",
            request.manifest.display(),
            request.distro,
            request.target,
            request.mode
        );

        let mut layers = Vec::new();
        layers.push(self.builtin_layer(request)?);
        layers.push(self.load_include(DISTRO_DIR, "distro", &request.distro)?);
        layers.push(self.load_include(TARGETS_DIR, "target", &request.target)?);
        layers.push(self.load_include(MODES_DIR, "mode", &request.mode)?);
        layers.push(manifest.vars);
        for path in &request.define_files {
            layers.push(Layer::from_file(
                format!("define-file/{}", path.display()),
                path,
            )?);
        }
        layers.push(cli_layer(&request.defines, &request.extend_defines)?);

        let merged = merge_layers(&layers)?;
        let mut variables = resolve(merged)?;
        debug!("resolved {} variables", variables.len());

        let policy = match &request.policy {
            Some(reference) => {
                let found = find_policy(reference, &self.search)?;
                Some(load_policy_file(&found.path, &request.target)?)
            }
            None => None,
        };

        let selection = BuildSelection {
            mode: &request.mode,
            target: &request.target,
            distro: &request.distro,
        };
        if let Some(policy) = &policy {
            apply_policy(policy, selection, manifest.kind, &mut variables)?;
        }
        check_denylists(&variables)?;

        let mut plan = emit_plan(&manifest.body, &variables)?;
        if let Some(policy) = &policy {
            apply_plan_policies(policy, &mut plan)?;
        }

        Ok(CompileResult {
            plan,
            variables,
            policy: policy.map(|p: PolicyDocument| p.name),
        })
    }

    /// The lowest-precedence layer: shipped defaults plus the identity
    /// variables of this invocation.
    fn builtin_layer(&self, request: &CompileRequest) -> Result<Layer, CompileError> {
        let mut layer = Layer::from_yaml_str("builtin", BUILTIN_DEFAULTS)?;
        layer.push(
            "name",
            MergeOp::Override,
            VariableValue::from(manifest_stem(&request.manifest)),
        );
        layer.push(
            "arch",
            MergeOp::Override,
            VariableValue::from(request.arch.clone()),
        );
        layer.push(
            "target",
            MergeOp::Override,
            VariableValue::from(request.target.clone()),
        );
        layer.push(
            "distro_name",
            MergeOp::Override,
            VariableValue::from(request.distro.clone()),
        );
        layer.push(
            "image_mode",
            MergeOp::Override,
            VariableValue::from(request.mode.clone()),
        );
        Ok(layer)
    }

    /// Find `<dir>/<name>.ipp.yml` in the include roots, first root wins.
    fn load_include(&self, dir: &str, kind: &str, name: &str) -> Result<Layer, CompileError> {
        let file_name = format!("{name}{INCLUDE_SUFFIX}");
        let mut searched = Vec::new();
        for root in &self.include_dirs {
            let candidate = root.join(dir).join(&file_name);
            if candidate.is_file() {
                debug!("{kind} '{name}' resolved to {}", candidate.display());
                return Ok(Layer::from_file(format!("{kind}/{name}"), &candidate)?);
            }
            searched.push(candidate.display().to_string());
        }
        Err(LoadError::IncludeNotFound {
            kind: kind.to_owned(),
            name: name.to_owned(),
            searched: searched.join(", "),
        }
        .into())
    }
}

/// Build the highest-precedence layer from `--define` and `--extend-define`
/// arguments. Values parse as YAML scalars; anything that does not parse is
/// taken as a plain string.
fn cli_layer(defines: &[String], extend_defines: &[String]) -> Result<Layer, CompileError> {
    let mut layer = Layer::new("cli");
    for raw in defines {
        let (key, value) = parse_define("--define", raw)?;
        layer.push(key, MergeOp::Override, value);
    }
    for raw in extend_defines {
        let (key, value) = parse_define("--extend-define", raw)?;
        let value = match value {
            VariableValue::Sequence(_) => value,
            scalar => VariableValue::Sequence(vec![scalar]),
        };
        layer.push(key, MergeOp::Extend, value);
    }
    Ok(layer)
}

fn parse_define(option: &str, raw: &str) -> Result<(String, VariableValue), CompileError> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(CompileError::InvalidDefine {
            option: option.to_owned(),
            value: raw.to_owned(),
        });
    };
    if key.is_empty() {
        return Err(CompileError::InvalidDefine {
            option: option.to_owned(),
            value: raw.to_owned(),
        });
    }
    let parsed = serde_yaml::from_str::<serde_yaml::Value>(value)
        .ok()
        .and_then(|v| VariableValue::from_yaml(v).ok())
        .unwrap_or_else(|| VariableValue::from(value));
    Ok((key.to_owned(), parsed))
}
