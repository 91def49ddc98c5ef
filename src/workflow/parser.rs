//! Workflow Parser
//!
//! Loads and saves workflow definitions as YAML or JSON files. JSON is
//! what the visual builder exports; YAML is friendlier to write by hand.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::{Workflow, WorkflowDefinition};
use super::planner::ExecutionPlan;
use super::validator::validate_definition;
use crate::error::EngineError;

/// Parses a workflow definition from YAML or JSON text.
pub fn parse_workflow(content: &str) -> Result<WorkflowDefinition, EngineError> {
    let trimmed = content.trim_start();
    let definition = if trimmed.starts_with('{') {
        serde_json::from_str(trimmed)?
    } else {
        serde_yaml::from_str(content)?
    };
    Ok(definition)
}

/// Loads a workflow definition from a file.
///
/// # Example
///
/// ```rust,no_run
/// use leadflow::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_workflow("leads.yaml")?;
///     println!("Loaded {} blocks", definition.blocks.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowDefinition, EngineError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    info!("Loading workflow from: {}", display);

    let content = fs::read_to_string(path).map_err(|source| EngineError::WorkflowFile {
        path: display.clone(),
        source,
    })?;
    debug!("Workflow content loaded ({} bytes)", content.len());

    let definition = parse_workflow(&content).map_err(|e| EngineError::WorkflowParse {
        path: display.clone(),
        message: e.to_string(),
    })?;

    info!(
        "Parsed workflow '{}': {} blocks, {} connections",
        definition.name,
        definition.blocks.len(),
        definition.connections.len()
    );
    Ok(definition)
}

/// Loads a workflow file, decodes it and plans its execution.
pub fn load_and_plan(path: impl AsRef<Path>) -> Result<(WorkflowDefinition, Workflow, ExecutionPlan), EngineError> {
    let definition = load_workflow(path)?;
    let (workflow, plan) = validate_definition(&definition)?;
    Ok((definition, workflow, plan))
}

/// Saves a workflow definition. Files ending in `.json` are written as
/// JSON, anything else as YAML.
pub fn save_workflow(definition: &WorkflowDefinition, path: impl AsRef<Path>) -> Result<(), EngineError> {
    let path = path.as_ref();
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let content = if is_json {
        serde_json::to_string_pretty(definition)?
    } else {
        serde_yaml::to_string(definition)?
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    info!("Workflow saved to: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::BlockDefinition;
    use tempfile::tempdir;

    const YAML: &str = r#"
name: Acme leads
blocks:
  - id: load
    type: read_csv
    parameters:
      file_path: leads.csv
  - id: only_acme
    type: filter
    parameters:
      condition: company contains "Acme"
  - id: save
    type: save_csv
connections:
  - source: load
    target: only_acme
  - source: only_acme
    target: save
"#;

    #[test]
    fn test_parse_yaml() {
        let definition = parse_workflow(YAML).unwrap();
        assert_eq!(definition.name, "Acme leads");
        assert_eq!(definition.blocks.len(), 3);
        assert_eq!(definition.blocks[1].parameters["condition"], "company contains \"Acme\"");
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"name": "json", "blocks": [{"id": "load", "type": "read_csv",
            "parameters": {"file_path": "a.csv"}}], "connections": []}"#;
        let definition = parse_workflow(json).unwrap();
        assert_eq!(definition.blocks[0].id, "load");
    }

    #[test]
    fn test_load_workflow_file_not_found() {
        let result = load_workflow("/nonexistent/path/workflow.yaml");
        assert!(matches!(result, Err(EngineError::WorkflowFile { .. })));
    }

    #[test]
    fn test_load_workflow_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "this is not valid yaml: [[[").unwrap();

        let result = load_workflow(&path);
        assert!(matches!(result, Err(EngineError::WorkflowParse { .. })));
    }

    #[test]
    fn test_load_and_plan() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("acme.yaml");
        fs::write(&path, YAML).unwrap();

        let (definition, workflow, plan) = load_and_plan(&path).unwrap();
        assert_eq!(definition.blocks.len(), workflow.len());
        assert_eq!(plan.block_ids(), vec!["load", "only_acme", "save"]);
    }

    #[test]
    fn test_load_and_plan_rejects_invalid_graph() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("orphan.yaml");
        fs::write(
            &path,
            "name: orphan\nblocks:\n  - id: save\n    type: save_csv\n",
        )
        .unwrap();

        let result = load_and_plan(&path);
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = tempdir().unwrap();
        let definition = WorkflowDefinition::new("saved")
            .with_block(BlockDefinition::new("load", "load_table").with_param("file_path", "x.csv"));

        for name in ["nested/saved.yaml", "saved.json"] {
            let path = temp_dir.path().join(name);
            save_workflow(&definition, &path).unwrap();
            let loaded = load_workflow(&path).unwrap();
            assert_eq!(loaded, definition);
        }
    }
}
