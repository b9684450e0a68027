use super::{json_pretty, EXIT_SUCCESS};
use kiln_core::{CompileError, CompileRequest, Compiler};
use std::fs;
use std::path::Path;

pub struct ComposeOutput<'a> {
    /// Where the plan goes; stdout when absent.
    pub out: Option<&'a Path>,
    /// Print the resolved variable set instead of the plan.
    pub dump_vars: bool,
    pub json: bool,
}

pub fn run(
    compiler: &Compiler,
    request: &CompileRequest,
    output: &ComposeOutput<'_>,
) -> Result<u8, String> {
    let result = compiler.compile(request).map_err(|e| match e {
        CompileError::InvalidDefine { .. } => e.to_string(),
        _ if e.is_policy_failure() => format!("policy error: {e}"),
        _ => format!("manifest error: {e}"),
    })?;

    if output.dump_vars {
        let rendered = if output.json {
            json_pretty(&result.variables)?
        } else {
            serde_yaml::to_string(&result.variables)
                .map_err(|e| format!("variable serialization failed: {e}"))?
        };
        print!("{rendered}");
        return Ok(EXIT_SUCCESS);
    }

    let plan = result
        .plan
        .to_json_pretty()
        .map_err(|e| format!("plan serialization failed: {e}"))?;
    match output.out {
        Some(path) => {
            fs::write(path, format!("{plan}\n"))
                .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
            if let Some(policy) = &result.policy {
                eprintln!("validated against policy '{policy}'");
            }
            eprintln!("wrote {}", path.display());
        }
        None => println!("{plan}"),
    }
    Ok(EXIT_SUCCESS)
}
