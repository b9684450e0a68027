use crate::merge::MergedVars;
use crate::value::VariableValue;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("computed variable cycle: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },
    #[error("'{referenced_by}' references undefined variable '{name}'")]
    Undefined {
        name: String,
        referenced_by: String,
    },
    #[error("cannot interpolate {kind} value of '{name}' into '{referenced_by}'")]
    NotInterpolable {
        name: String,
        kind: &'static str,
        referenced_by: String,
    },
    #[error("unterminated '${{' reference in '{0}'")]
    Unterminated(String),
}

/// The fully concrete variable set: every computed variable expanded.
///
/// Immutable after resolution except for policy-forced writes, which are the
/// only mutation validation performs.
#[derive(Debug, Default, Serialize)]
#[serde(transparent)]
pub struct ResolvedVariableSet {
    vars: BTreeMap<String, VariableValue>,
}

impl ResolvedVariableSet {
    pub fn get(&self, name: &str) -> Option<&VariableValue> {
        self.vars.get(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VariableValue)> {
        self.vars.iter()
    }

    /// Unconditionally write a policy-forced value, overriding anything
    /// supplied by manifest or command line.
    pub fn force(&mut self, name: impl Into<String>, value: VariableValue) {
        self.vars.insert(name.into(), value);
    }

    /// Append policy-supplied entries to a sequence variable, creating it if
    /// absent. Used for the denylist variables a policy contributes to.
    pub fn extend_sequence(&mut self, name: &str, values: Vec<VariableValue>) {
        match self
            .vars
            .entry(name.to_owned())
            .or_insert_with(|| VariableValue::Sequence(Vec::new()))
            .as_sequence_mut()
        {
            Some(seq) => seq.extend(values),
            None => {
                self.vars
                    .insert(name.to_owned(), VariableValue::Sequence(values));
            }
        }
    }
}

/// One piece of a computed-variable expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Text(String),
    Ref(String),
}

/// Split a format expression into literal text and `${name}` references.
pub(crate) fn parse_segments(expr: &str) -> Result<Vec<Segment>, ResolveError> {
    let mut segments = Vec::new();
    let mut rest = expr;
    while let Some(start) = rest.find("${") {
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_owned()));
        }
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(ResolveError::Unterminated(expr.to_owned()));
        };
        segments.push(Segment::Ref(after[..end].trim().to_owned()));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_owned()));
    }
    Ok(segments)
}

/// Evaluate parsed segments against a variable lookup.
///
/// A degenerate expression consisting of a single reference passes the
/// referenced value through with its type preserved; anything else renders
/// scalars into one string.
pub(crate) fn interpolate<'a, F>(
    segments: &[Segment],
    lookup: F,
    referenced_by: &str,
) -> Result<VariableValue, ResolveError>
where
    F: Fn(&str) -> Option<&'a VariableValue>,
{
    if let [Segment::Ref(name)] = segments {
        return lookup(name)
            .cloned()
            .ok_or_else(|| ResolveError::Undefined {
                name: name.clone(),
                referenced_by: referenced_by.to_owned(),
            });
    }

    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Ref(name) => {
                let value = lookup(name).ok_or_else(|| ResolveError::Undefined {
                    name: name.clone(),
                    referenced_by: referenced_by.to_owned(),
                })?;
                let rendered =
                    value
                        .render_scalar()
                        .ok_or_else(|| ResolveError::NotInterpolable {
                            name: name.clone(),
                            kind: value.kind(),
                            referenced_by: referenced_by.to_owned(),
                        })?;
                out.push_str(&rendered);
            }
        }
    }
    Ok(VariableValue::String(out))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    InProgress,
    Done,
}

/// Expand all computed variables over the merged literal map.
///
/// Evaluation is a depth-first topological walk; a variable that depends
/// directly or transitively on itself fails with the full cycle, and the
/// walk order only affects determinism, not results.
pub fn resolve(merged: MergedVars) -> Result<ResolvedVariableSet, ResolveError> {
    let MergedVars {
        mut literals,
        computed,
    } = merged;

    let mut exprs: BTreeMap<String, Vec<Segment>> = BTreeMap::new();
    for (name, expr) in &computed {
        exprs.insert(name.clone(), parse_segments(expr)?);
    }

    let mut state: BTreeMap<String, VisitState> = BTreeMap::new();
    let mut stack: Vec<String> = Vec::new();

    // BTreeMap iteration keeps the evaluation order deterministic.
    let names: Vec<String> = exprs.keys().cloned().collect();
    for name in names {
        evaluate(&name, &exprs, &mut literals, &mut state, &mut stack)?;
    }

    Ok(ResolvedVariableSet { vars: literals })
}

fn evaluate(
    name: &str,
    exprs: &BTreeMap<String, Vec<Segment>>,
    literals: &mut BTreeMap<String, VariableValue>,
    state: &mut BTreeMap<String, VisitState>,
    stack: &mut Vec<String>,
) -> Result<(), ResolveError> {
    match state.get(name) {
        Some(VisitState::Done) => return Ok(()),
        Some(VisitState::InProgress) => {
            let start = stack.iter().position(|n| n == name).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..].to_vec();
            cycle.push(name.to_owned());
            return Err(ResolveError::Cycle { cycle });
        }
        None => {}
    }
    state.insert(name.to_owned(), VisitState::InProgress);
    stack.push(name.to_owned());

    let segments = &exprs[name];
    for segment in segments {
        if let Segment::Ref(dep) = segment {
            if literals.contains_key(dep) {
                continue;
            }
            if exprs.contains_key(dep) {
                evaluate(dep, exprs, literals, state, stack)?;
            } else {
                return Err(ResolveError::Undefined {
                    name: dep.clone(),
                    referenced_by: name.to_owned(),
                });
            }
        }
    }

    let value = interpolate(segments, |n| literals.get(n), name)?;
    literals.insert(name.to_owned(), value);

    stack.pop();
    state.insert(name.to_owned(), VisitState::Done);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Layer;
    use crate::merge::merge_layers;

    fn resolve_doc(doc: &str) -> Result<ResolvedVariableSet, ResolveError> {
        let layer = Layer::from_yaml_str("test", doc).unwrap();
        resolve(merge_layers(std::slice::from_ref(&layer)).unwrap())
    }

    #[test]
    fn interpolates_scalars() {
        let vars = resolve_doc(
            "name: cs9\narch: aarch64\nimage: !format \"${name}-${arch}.img\"\n",
        )
        .unwrap();
        assert_eq!(vars.get("image").unwrap().as_str(), Some("cs9-aarch64.img"));
    }

    #[test]
    fn whole_reference_preserves_type() {
        let vars = resolve_doc("pkgs: [vim, git]\nalias: !format \"${pkgs}\"\n").unwrap();
        assert_eq!(vars.get("alias"), vars.get("pkgs"));
    }

    #[test]
    fn computed_may_depend_on_computed() {
        let vars = resolve_doc(
            "a: base\nb: !format \"${a}-1\"\nc: !format \"${b}-2\"\n",
        )
        .unwrap();
        assert_eq!(vars.get("c").unwrap().as_str(), Some("base-1-2"));
    }

    #[test]
    fn direct_cycle_names_both_variables() {
        let err = resolve_doc("x: !format \"${y}\"\ny: !format \"${x}\"\n").unwrap_err();
        let ResolveError::Cycle { cycle } = err else {
            panic!("expected cycle error");
        };
        assert!(cycle.contains(&"x".to_owned()));
        assert!(cycle.contains(&"y".to_owned()));
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn self_cycle_is_detected() {
        let err = resolve_doc("x: !format \"pre-${x}\"\n").unwrap_err();
        assert!(matches!(err, ResolveError::Cycle { .. }));
    }

    #[test]
    fn undefined_reference_is_an_error() {
        let err = resolve_doc("a: !format \"${nope}\"\n").unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Undefined { name, referenced_by } if name == "nope" && referenced_by == "a"
        ));
    }

    #[test]
    fn sequence_in_string_context_is_an_error() {
        let err = resolve_doc("pkgs: [vim]\na: !format \"list=${pkgs}\"\n").unwrap_err();
        assert!(matches!(err, ResolveError::NotInterpolable { kind, .. } if kind == "sequence"));
    }

    #[test]
    fn unterminated_reference_is_an_error() {
        let err = resolve_doc("a: !format \"${open\"\n").unwrap_err();
        assert!(matches!(err, ResolveError::Unterminated(_)));
    }

    #[test]
    fn bools_render_lowercase() {
        let vars = resolve_doc("flag: true\nline: !format \"ipv6=${flag}\"\n").unwrap();
        assert_eq!(vars.get("line").unwrap().as_str(), Some("ipv6=true"));
    }

    #[test]
    fn resolution_is_deterministic() {
        let doc = "a: 1\nb: !format \"${a}-${c}\"\nc: !format \"${a}\"\n";
        let first = serde_yaml::to_string(&resolve_doc(doc).unwrap()).unwrap();
        for _ in 0..10 {
            let again = serde_yaml::to_string(&resolve_doc(doc).unwrap()).unwrap();
            assert_eq!(again, first);
        }
    }
}
