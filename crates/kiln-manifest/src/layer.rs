use crate::value::{ValueError, VariableValue};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {origin}: {source}")]
    Parse {
        origin: String,
        source: serde_yaml::Error,
    },
    #[error("{origin}: top level must be a mapping")]
    NotAMapping { origin: String },
    #[error("{origin}: unknown merge tag '!{tag}' on key '{key}'")]
    UnknownTag {
        origin: String,
        key: String,
        tag: String,
    },
    #[error("{origin}: key '{key}': computed variable expression must be a string")]
    BadComputedExpression { origin: String, key: String },
    #[error("{origin}: {source}")]
    Value { origin: String, source: ValueError },
    #[error("No {0} section in manifest")]
    MissingSection(String),
    #[error("unsupported manifest extension for '{0}': expected .aib.yml or .mpp.yml")]
    UnknownManifestKind(String),
    #[error("Path '{path}' is not allowed for {context}. Files must be under the manifest directory or an include directory")]
    PathNotAllowed { path: String, context: String },
    #[error("{kind} '{name}' not found; searched: {searched}")]
    IncludeNotFound {
        kind: String,
        name: String,
        searched: String,
    },
}

/// How a layer value combines with the state inherited from lower-precedence
/// layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeOp {
    #[default]
    Override,
    Extend,
    Remove,
}

impl fmt::Display for MergeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Override => "override",
            Self::Extend => "extend",
            Self::Remove => "remove",
        })
    }
}

/// A layer value: either a literal tree or an unevaluated computed-variable
/// expression (`!format "...${ref}..."`).
#[derive(Debug, Clone, PartialEq)]
pub enum LayerValue {
    Literal(VariableValue),
    Computed(String),
}

/// One configuration document, loaded at a fixed precedence. Entries keep
/// document order; the layer is immutable once loaded.
#[derive(Debug, Clone)]
pub struct Layer {
    name: String,
    entries: Vec<(String, MergeOp, LayerValue)>,
}

impl Layer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Provenance name used in merge diagnostics, e.g. `distro/autosd`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entries(&self) -> &[(String, MergeOp, LayerValue)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, key: impl Into<String>, op: MergeOp, value: VariableValue) {
        self.entries.push((key.into(), op, LayerValue::Literal(value)));
    }

    pub fn push_computed(&mut self, key: impl Into<String>, expr: impl Into<String>) {
        self.entries
            .push((key.into(), MergeOp::Override, LayerValue::Computed(expr.into())));
    }

    /// Parse a layer document. Merge intent is carried as a YAML tag on the
    /// value: `!extend`, `!remove`, or `!format` for computed variables; an
    /// untagged value is a plain override.
    pub fn from_yaml_str(name: impl Into<String>, input: &str) -> Result<Self, LoadError> {
        let name = name.into();
        let doc: serde_yaml::Value =
            serde_yaml::from_str(input).map_err(|source| LoadError::Parse {
                origin: name.clone(),
                source,
            })?;
        let serde_yaml::Value::Mapping(mapping) = doc else {
            return Err(LoadError::NotAMapping { origin: name });
        };
        Self::from_yaml_mapping(name, mapping)
    }

    pub fn from_yaml_mapping(
        name: impl Into<String>,
        mapping: serde_yaml::Mapping,
    ) -> Result<Self, LoadError> {
        let name = name.into();
        let mut layer = Self::new(name.clone());
        for (k, v) in mapping {
            let serde_yaml::Value::String(key) = k else {
                return Err(LoadError::Value {
                    origin: name,
                    source: ValueError::NonStringKey(format!("{k:?}")),
                });
            };
            match v {
                serde_yaml::Value::Tagged(tagged) => {
                    let tag = tagged.tag.to_string();
                    let tag = tag.trim_start_matches('!');
                    match tag {
                        "extend" | "remove" => {
                            let op = if tag == "extend" {
                                MergeOp::Extend
                            } else {
                                MergeOp::Remove
                            };
                            let value = VariableValue::from_yaml(tagged.value).map_err(
                                |source| LoadError::Value {
                                    origin: name.clone(),
                                    source,
                                },
                            )?;
                            layer.push(key, op, value);
                        }
                        "format" => {
                            let serde_yaml::Value::String(expr) = tagged.value else {
                                return Err(LoadError::BadComputedExpression {
                                    origin: name,
                                    key,
                                });
                            };
                            layer.push_computed(key, expr);
                        }
                        other => {
                            return Err(LoadError::UnknownTag {
                                origin: name,
                                key,
                                tag: other.to_owned(),
                            });
                        }
                    }
                }
                plain => {
                    let value =
                        VariableValue::from_yaml(plain).map_err(|source| LoadError::Value {
                            origin: name.clone(),
                            source,
                        })?;
                    layer.push(key, MergeOp::Override, value);
                }
            }
        }
        Ok(layer)
    }

    pub fn from_file(name: impl Into<String>, path: &Path) -> Result<Self, LoadError> {
        let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(name, &content)
    }
}
