pub mod scenario;

pub use scenario::{
    parse_scenario, strip_jsonc_comments, validate_scenario, Scenario, ScenarioError,
    ScenarioFormat,
};

use std::path::Path;
use thiserror::Error;

/// Errors for file I/O operations (separate from pure parsing errors)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Scenario error: {0}")]
    ScenarioError(#[from] ScenarioError),
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load, parse and validate a scenario file from disk.
/// This is the I/O boundary - it reads the file and delegates to pure parsing functions.
/// `.yaml`/`.yml` files are read as YAML, everything else as JSONC.
pub fn load_scenario_file(path: &Path) -> Result<Scenario, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let format = ScenarioFormat::from_extension(path.extension().and_then(|e| e.to_str()));
    let scenario = Scenario::from_str(&content, format)?;
    Ok(scenario)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_jsonc_file() {
        let content = r#"{
            // nothing to allocate yet
            "nodes": [{"metadata": {"name": "worker-1"}}]
        }"#;

        let file = create_temp_file(".jsonc", content);
        let scenario = load_scenario_file(file.path()).unwrap();
        assert_eq!(scenario.nodes.len(), 1);
    }

    #[test]
    fn test_load_yaml_file() {
        let content = "nodes:\n  - metadata:\n      name: worker-1\n      labels: {zone: a}\n";

        let file = create_temp_file(".yaml", content);
        let scenario = load_scenario_file(file.path()).unwrap();
        assert_eq!(scenario.nodes[0].metadata.labels["zone"], "a");
    }

    #[test]
    fn test_load_invalid_file() {
        let file = create_temp_file(".json", r#"{"nodes": [{"metadata": {"name": "a"}}, {"metadata": {"name": "a"}}]}"#);
        let result = load_scenario_file(file.path());
        assert!(matches!(
            result,
            Err(ConfigError::ScenarioError(ScenarioError::DuplicateNode(_)))
        ));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_scenario_file(Path::new("/nonexistent/file.json"));
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_loaded_scenario_builds_allocator() {
        let scenario = Scenario::default();
        let allocator = scenario
            .allocator(std::sync::Arc::new(crate::selector::SelectorCache::default()))
            .unwrap();
        assert!(allocator.claims().is_empty());
    }
}
