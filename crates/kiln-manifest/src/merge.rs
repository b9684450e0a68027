use crate::layer::{Layer, LayerValue, MergeOp};
use crate::value::VariableValue;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("cannot {op} key '{key}' from layer '{layer}': incoming value is {found}, expected a sequence")]
    OperandNotSequence {
        key: String,
        layer: String,
        op: MergeOp,
        found: &'static str,
    },
    #[error("cannot {op} key '{key}' from layer '{layer}': existing value is {found}, not a sequence")]
    TargetNotSequence {
        key: String,
        layer: String,
        op: MergeOp,
        found: &'static str,
    },
    #[error("cannot {op} key '{key}' from layer '{layer}': existing value is an unevaluated computed variable")]
    TargetComputed {
        key: String,
        layer: String,
        op: MergeOp,
    },
}

/// Output of the merge fold: literal variables plus still-unevaluated
/// computed-variable expressions, keyed by name.
#[derive(Debug, Default)]
pub struct MergedVars {
    pub literals: BTreeMap<String, VariableValue>,
    pub computed: BTreeMap<String, String>,
}

/// Fold an ordered sequence of layers (lowest to highest precedence) into a
/// single variable map.
///
/// This is a plain left-to-right fold; later layers always win ties, and
/// that ordering is the sole precedence rule. `override` replaces any
/// existing value, `extend` appends to a sequence (creating one if absent),
/// `remove` deletes all equal occurrences of each listed element. A literal
/// assignment shadows an earlier computed declaration of the same name and
/// vice versa.
pub fn merge_layers(layers: &[Layer]) -> Result<MergedVars, MergeError> {
    let mut merged = MergedVars::default();

    for layer in layers {
        for (key, op, value) in layer.entries() {
            match (op, value) {
                (MergeOp::Override, LayerValue::Literal(v)) => {
                    merged.computed.remove(key);
                    merged.literals.insert(key.clone(), v.clone());
                }
                (MergeOp::Override, LayerValue::Computed(expr)) => {
                    merged.literals.remove(key);
                    merged.computed.insert(key.clone(), expr.clone());
                }
                (MergeOp::Extend, LayerValue::Literal(v)) => {
                    let incoming = v.as_sequence().ok_or_else(|| {
                        MergeError::OperandNotSequence {
                            key: key.clone(),
                            layer: layer.name().to_owned(),
                            op: *op,
                            found: v.kind(),
                        }
                    })?;
                    if merged.computed.contains_key(key) {
                        return Err(MergeError::TargetComputed {
                            key: key.clone(),
                            layer: layer.name().to_owned(),
                            op: *op,
                        });
                    }
                    let target = merged
                        .literals
                        .entry(key.clone())
                        .or_insert_with(|| VariableValue::Sequence(Vec::new()));
                    let found = target.kind();
                    let Some(seq) = target.as_sequence_mut() else {
                        return Err(MergeError::TargetNotSequence {
                            key: key.clone(),
                            layer: layer.name().to_owned(),
                            op: *op,
                            found,
                        });
                    };
                    seq.extend(incoming.iter().cloned());
                }
                (MergeOp::Remove, LayerValue::Literal(v)) => {
                    let removals = v.as_sequence().ok_or_else(|| {
                        MergeError::OperandNotSequence {
                            key: key.clone(),
                            layer: layer.name().to_owned(),
                            op: *op,
                            found: v.kind(),
                        }
                    })?;
                    if merged.computed.contains_key(key) {
                        return Err(MergeError::TargetComputed {
                            key: key.clone(),
                            layer: layer.name().to_owned(),
                            op: *op,
                        });
                    }
                    // Removing from an absent key is a no-op.
                    let Some(target) = merged.literals.get_mut(key) else {
                        continue;
                    };
                    let found = target.kind();
                    let Some(seq) = target.as_sequence_mut() else {
                        return Err(MergeError::TargetNotSequence {
                            key: key.clone(),
                            layer: layer.name().to_owned(),
                            op: *op,
                            found,
                        });
                    };
                    seq.retain(|item| !removals.contains(item));
                }
                (MergeOp::Extend | MergeOp::Remove, LayerValue::Computed(_)) => {
                    // The layer parser only attaches one tag per value, so a
                    // computed entry is always an override.
                    unreachable!("computed layer entries carry MergeOp::Override");
                }
            }
        }
    }

    Ok(merged)
}
