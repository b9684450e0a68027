use crate::compiler::INCLUDE_SUFFIX;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// One installed include document, named for `list-distros` and friends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeItem {
    pub name: String,
    /// Leading comment header of the document, if it has one.
    pub description: String,
}

/// List the include documents of one kind across the include roots.
///
/// Walks `<root>/<dir>` in every include root, collects `*.ipp.yml` entries,
/// and keeps the first occurrence of each name so earlier roots shadow later
/// ones, matching the lookup order compilation uses. Missing or unreadable
/// directories are skipped; listing never fails a build.
pub fn list_include_items(include_dirs: &[impl AsRef<Path>], dir: &str) -> Vec<IncludeItem> {
    let mut items: BTreeMap<String, IncludeItem> = BTreeMap::new();
    for root in include_dirs {
        let dir_path = root.as_ref().join(dir);
        let Ok(entries) = fs::read_dir(&dir_path) else {
            debug!("no {dir} directory under {}", root.as_ref().display());
            continue;
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(name) = file_name.strip_suffix(INCLUDE_SUFFIX) else {
                continue;
            };
            if items.contains_key(name) {
                continue;
            }
            let description = fs::read_to_string(entry.path())
                .map(|content| comment_header(&content))
                .unwrap_or_default();
            items.insert(
                name.to_owned(),
                IncludeItem {
                    name: name.to_owned(),
                    description,
                },
            );
        }
    }
    items.into_values().collect()
}

/// Extract the leading block of `#` comment lines as a single description
/// string. Stops at the first non-comment line.
fn comment_header(content: &str) -> String {
    let mut lines = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix('#') else {
            break;
        };
        lines.push(rest.trim());
    }
    lines.join(" ").trim().to_owned()
}
