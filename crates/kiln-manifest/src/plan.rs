use crate::value::VariableValue;
use crate::vars::{interpolate, parse_segments, ResolveError, ResolvedVariableSet, Segment};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// The resolved tree of build stages handed to the external build engine.
///
/// Structurally a `VariableValue` mapping of pipelines, each with a list of
/// stages (`type` + `options`). The policy validator walks this tree for
/// structural checks and injects forced sysctl/SELinux stages into it; the
/// compiler never interprets stage semantics beyond that.
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct BuildPlan {
    root: BTreeMap<String, VariableValue>,
}

impl BuildPlan {
    pub fn root(&self) -> &BTreeMap<String, VariableValue> {
        &self.root
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.root)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.root)
    }

    /// Mutable access to the options mapping of the named stage in the named
    /// pipeline, materializing the pipeline, the stage, or the options
    /// mapping if absent. Existing unrelated stages are never touched.
    pub fn stage_options_mut(
        &mut self,
        pipeline: &str,
        stage_type: &str,
    ) -> &mut BTreeMap<String, VariableValue> {
        let pipelines = coerce_sequence(
            self.root
                .entry("pipelines".to_owned())
                .or_insert_with(|| VariableValue::Sequence(Vec::new())),
        );

        let pipeline_idx = pipelines
            .iter()
            .position(|p| {
                p.as_mapping()
                    .and_then(|m| m.get("name"))
                    .and_then(VariableValue::as_str)
                    == Some(pipeline)
            })
            .unwrap_or_else(|| {
                debug!("materializing pipeline '{pipeline}' for stage injection");
                let mut map = BTreeMap::new();
                map.insert("name".to_owned(), VariableValue::from(pipeline));
                map.insert("stages".to_owned(), VariableValue::Sequence(Vec::new()));
                pipelines.push(VariableValue::Mapping(map));
                pipelines.len() - 1
            });

        let pipeline_map = coerce_mapping(&mut pipelines[pipeline_idx]);
        let stages = coerce_sequence(
            pipeline_map
                .entry("stages".to_owned())
                .or_insert_with(|| VariableValue::Sequence(Vec::new())),
        );

        let stage_idx = stages
            .iter()
            .position(|s| {
                s.as_mapping()
                    .and_then(|m| m.get("type"))
                    .and_then(VariableValue::as_str)
                    == Some(stage_type)
            })
            .unwrap_or_else(|| {
                debug!("materializing stage '{stage_type}' in pipeline '{pipeline}'");
                let mut map = BTreeMap::new();
                map.insert("type".to_owned(), VariableValue::from(stage_type));
                map.insert(
                    "options".to_owned(),
                    VariableValue::Mapping(BTreeMap::new()),
                );
                stages.push(VariableValue::Mapping(map));
                stages.len() - 1
            });

        let stage_map = coerce_mapping(&mut stages[stage_idx]);
        coerce_mapping(
            stage_map
                .entry("options".to_owned())
                .or_insert_with(|| VariableValue::Mapping(BTreeMap::new())),
        )
    }
}

fn coerce_sequence(value: &mut VariableValue) -> &mut Vec<VariableValue> {
    if !matches!(value, VariableValue::Sequence(_)) {
        *value = VariableValue::Sequence(Vec::new());
    }
    match value {
        VariableValue::Sequence(seq) => seq,
        _ => unreachable!(),
    }
}

fn coerce_mapping(value: &mut VariableValue) -> &mut BTreeMap<String, VariableValue> {
    if !matches!(value, VariableValue::Mapping(_)) {
        *value = VariableValue::Mapping(BTreeMap::new());
    }
    match value {
        VariableValue::Mapping(map) => map,
        _ => unreachable!(),
    }
}

/// Walk the manifest plan body substituting `${var}` references from the
/// resolved variable set, producing the final build plan.
///
/// A string that is exactly one reference is replaced by the referenced
/// value with its type preserved (so sequence-valued variables can populate
/// stage options); any other reference-bearing string interpolates scalars.
pub fn emit_plan(
    body: &BTreeMap<String, VariableValue>,
    vars: &ResolvedVariableSet,
) -> Result<BuildPlan, ResolveError> {
    let mut root = BTreeMap::new();
    for (key, value) in body {
        root.insert(key.clone(), substitute(value, vars)?);
    }
    debug!("emitted build plan with {} top-level keys", root.len());
    Ok(BuildPlan { root })
}

fn substitute(
    value: &VariableValue,
    vars: &ResolvedVariableSet,
) -> Result<VariableValue, ResolveError> {
    match value {
        VariableValue::String(s) => {
            let segments = parse_segments(s)?;
            if segments.iter().any(|seg| matches!(seg, Segment::Ref(_))) {
                interpolate(&segments, |n| vars.get(n), "build plan")
            } else {
                Ok(value.clone())
            }
        }
        VariableValue::Sequence(seq) => {
            let mut out = Vec::with_capacity(seq.len());
            for item in seq {
                out.push(substitute(item, vars)?);
            }
            Ok(VariableValue::Sequence(out))
        }
        VariableValue::Mapping(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, vars)?);
            }
            Ok(VariableValue::Mapping(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Layer;
    use crate::merge::merge_layers;
    use crate::vars::resolve;

    fn vars_from(doc: &str) -> ResolvedVariableSet {
        let layer = Layer::from_yaml_str("test", doc).unwrap();
        resolve(merge_layers(std::slice::from_ref(&layer)).unwrap()).unwrap()
    }

    fn body_from(doc: &str) -> BTreeMap<String, VariableValue> {
        let value: serde_yaml::Value = serde_yaml::from_str(doc).unwrap();
        VariableValue::from_yaml(value)
            .unwrap()
            .as_mapping()
            .unwrap()
            .clone()
    }

    #[test]
    fn substitutes_whole_value_references() {
        let vars = vars_from("rootfs_rpms: [vim, git]\n");
        let body = body_from(
            "pipelines:\n  - name: rootfs\n    stages:\n      - type: org.osbuild.rpm\n        options:\n          packages: \"${rootfs_rpms}\"\n",
        );
        let plan = emit_plan(&body, &vars).unwrap();
        let json = plan.to_json_pretty().unwrap();
        assert!(json.contains("\"vim\""));
        assert!(json.contains("\"git\""));
    }

    #[test]
    fn interpolates_inside_strings() {
        let vars = vars_from("name: cs9\narch: aarch64\n");
        let body = body_from("label: \"${name}-${arch}\"\npipelines: []\n");
        let plan = emit_plan(&body, &vars).unwrap();
        assert_eq!(
            plan.root()["label"].as_str(),
            Some("cs9-aarch64")
        );
    }

    #[test]
    fn undefined_plan_reference_fails() {
        let vars = vars_from("a: 1\n");
        let body = body_from("label: \"${missing}\"\n");
        assert!(matches!(
            emit_plan(&body, &vars),
            Err(ResolveError::Undefined { name, .. }) if name == "missing"
        ));
    }

    #[test]
    fn stage_injection_reuses_existing_stage() {
        let vars = vars_from("a: 1\n");
        let body = body_from(
            "pipelines:\n  - name: rootfs\n    stages:\n      - type: org.osbuild.sysctl\n        options:\n          items: []\n",
        );
        let mut plan = emit_plan(&body, &vars).unwrap();
        let options = plan.stage_options_mut("rootfs", "org.osbuild.sysctl");
        assert!(options.contains_key("items"));

        // No duplicate stage was created.
        let pipelines = plan.root()["pipelines"].as_sequence().unwrap();
        let stages = pipelines[0].as_mapping().unwrap()["stages"]
            .as_sequence()
            .unwrap();
        assert_eq!(stages.len(), 1);
    }

    #[test]
    fn stage_injection_materializes_missing_stage_and_pipeline() {
        let vars = vars_from("a: 1\n");
        let body = body_from("pipelines: []\n");
        let mut plan = emit_plan(&body, &vars).unwrap();
        plan.stage_options_mut("rootfs", "org.osbuild.selinux")
            .insert("booleans".to_owned(), VariableValue::Mapping(BTreeMap::new()));

        let pipelines = plan.root()["pipelines"].as_sequence().unwrap();
        assert_eq!(pipelines.len(), 1);
        let pipeline = pipelines[0].as_mapping().unwrap();
        assert_eq!(pipeline["name"].as_str(), Some("rootfs"));
        let stages = pipeline["stages"].as_sequence().unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(
            stages[0].as_mapping().unwrap()["type"].as_str(),
            Some("org.osbuild.selinux")
        );
    }
}
