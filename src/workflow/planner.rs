//! Execution Planning
//!
//! The validated, ordered list of steps a job walks. Each step knows the
//! block whose table it reads and the blocks that will read its own
//! output, which the table store uses to decide when a table may go.

use colored::*;

use super::model::Block;

/// One block in execution order with its data edges resolved.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub block: Block,
    /// Block whose table this step reads, if any
    pub input: Option<String>,
    /// Blocks reading this step's table, in connection order
    pub consumers: Vec<String>,
}

impl PlannedStep {
    pub fn id(&self) -> &str {
        &self.block.id
    }
}

/// Steps of a workflow in topological order.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub workflow_id: String,
    pub workflow_name: String,
    steps: Vec<PlannedStep>,
}

impl ExecutionPlan {
    pub fn new(workflow_id: &str, workflow_name: &str, steps: Vec<PlannedStep>) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            workflow_name: workflow_name.to_string(),
            steps,
        }
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    /// Gets the planned step for a block.
    pub fn step(&self, block_id: &str) -> Option<&PlannedStep> {
        self.steps.iter().find(|s| s.block.id == block_id)
    }

    /// Block ids in execution order.
    pub fn block_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.block.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Renders the plan as human-readable lines, one per step.
    pub fn describe(&self) -> Vec<String> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let input = match &step.input {
                    Some(id) => format!(" <- {}", id),
                    None => String::new(),
                };
                let label = if step.block.name != step.block.id {
                    format!("{} ({})", step.block.id.bold(), step.block.name)
                } else {
                    step.block.id.bold().to_string()
                };
                format!(
                    "{:>3}. {} [{}]{}",
                    i + 1,
                    label,
                    step.block.kind().as_str().cyan(),
                    input.dimmed()
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::workflow::model::{BlockDefinition, WorkflowDefinition};
    use crate::workflow::validator::validate_definition;

    fn plan() -> super::ExecutionPlan {
        let definition = WorkflowDefinition::new("Plan test")
            .with_id("wf-plan")
            .with_block(BlockDefinition::new("load", "read_csv").with_param("file_path", "in.csv"))
            .with_block(BlockDefinition::new("save", "save_csv").with_name("Save results"))
            .connect("load", "save");
        validate_definition(&definition).unwrap().1
    }

    #[test]
    fn test_plan_accessors() {
        let plan = plan();
        assert_eq!(plan.workflow_id, "wf-plan");
        assert_eq!(plan.workflow_name, "Plan test");
        assert_eq!(plan.len(), 2);
        assert!(!plan.is_empty());
        assert_eq!(plan.steps()[1].id(), "save");
        assert!(plan.step("missing").is_none());
    }

    #[test]
    fn test_describe_lists_every_step() {
        colored::control::set_override(false);
        let lines = plan().describe();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "  1. load [load_table]");
        assert_eq!(lines[1], "  2. save (Save results) [persist_table] <- load");
    }
}
