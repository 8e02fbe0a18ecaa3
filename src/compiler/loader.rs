use anyhow::{Result, Context as AnyhowContext};
use std::fs;
use std::path::Path;
use crate::dsl::NetDefinition;

/// Reads a net definition from YAML (JSON is valid YAML too).
pub fn load_net_from_yaml(file_path: &str) -> Result<NetDefinition> {
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path))?;

    let definition: NetDefinition = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize YAML content from {}", file_path))?;

    Ok(definition)
}

/// Loads every `.yaml`/`.yml`/`.json` definition in a directory, sorted by file name.
pub fn load_nets_from_dir(dir: &Path) -> Result<Vec<NetDefinition>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read directory {}", dir.display()))? {
        let path = entry?.path();
        if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
            if ext == "yaml" || ext == "yml" || ext == "json" {
                paths.push(path);
            }
        }
    }
    paths.sort();

    paths
        .iter()
        .map(|p| load_net_from_yaml(&p.to_string_lossy()))
        .collect()
}
