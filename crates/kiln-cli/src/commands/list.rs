use super::{json_pretty, EXIT_SUCCESS};
use console::Style;
use kiln_core::list_include_items;
use std::path::PathBuf;

pub fn run(include_dirs: &[PathBuf], dir: &str, kind: &str, json: bool) -> Result<u8, String> {
    let items = list_include_items(include_dirs, dir);
    if json {
        let payload: Vec<_> = items
            .iter()
            .map(|item| {
                serde_json::json!({
                    "name": item.name,
                    "description": item.description,
                })
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else if items.is_empty() {
        println!("no {kind} definitions found");
    } else {
        let bold = Style::new().bold();
        for item in &items {
            if item.description.is_empty() {
                println!("{}", bold.apply_to(&item.name));
            } else {
                println!("{:<24} {}", bold.apply_to(&item.name), item.description);
            }
        }
    }
    Ok(EXIT_SUCCESS)
}
