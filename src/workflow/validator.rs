//! Workflow Validation
//!
//! Checks a decoded workflow before anything runs:
//! - Connection references, self-loops and duplicates
//! - Dependency graph acyclicity
//! - Data shape compatibility between connected blocks
//! - Deterministic topological ordering (Kahn's algorithm)
//!
//! A successful validation yields the [`ExecutionPlan`] the scheduler walks.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use log::{debug, info};
use thiserror::Error;

use super::model::{DataShape, Workflow, WorkflowDefinition};
use super::planner::{ExecutionPlan, PlannedStep};

/// Reasons a workflow is rejected before execution.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Workflow has no blocks")]
    EmptyWorkflow,

    #[error("A block has an empty or whitespace-only id")]
    EmptyBlockId,

    #[error("Duplicate block id: '{0}'")]
    DuplicateBlockId(String),

    #[error("Block '{block}' has unknown type '{kind}'")]
    UnknownBlockKind { block: String, kind: String },

    #[error("Block '{block}' is missing required parameter '{key}'")]
    MissingConfig { block: String, key: String },

    #[error("Block '{block}' has invalid parameters: {message}")]
    InvalidConfig { block: String, message: String },

    #[error("Block '{block}' has an invalid filter condition: {message}")]
    InvalidPredicate { block: String, message: String },

    #[error("Connection {from_block} -> {to_block} references unknown block '{missing}'")]
    UnknownBlock {
        from_block: String,
        to_block: String,
        missing: String,
    },

    #[error("Block '{0}' is connected to itself")]
    SelfConnection(String),

    #[error("Connection {from_block} -> {to_block} is declared more than once")]
    DuplicateConnection { from_block: String, to_block: String },

    #[error("Workflow contains a cycle: {}", format_cycle(.blocks))]
    GraphCycle { blocks: Vec<String> },

    #[error("Block '{to_block}' expects {expected} as input but '{from_block}' produces {actual}")]
    IncompatibleBlockChain {
        from_block: String,
        to_block: String,
        expected: DataShape,
        actual: DataShape,
    },

    #[error("Block '{0}' needs an input connection")]
    MissingInput(String),

    #[error("Block '{block}' has {} inputs ({}) but accepts one", .sources.len(), .sources.join(", "))]
    MultipleInputs { block: String, sources: Vec<String> },
}

fn format_cycle(blocks: &[String]) -> String {
    match blocks.first() {
        Some(first) => format!("{} -> {}", blocks.join(" -> "), first),
        None => String::new(),
    }
}

/// Validates the graph of a decoded workflow and plans its execution order.
///
/// Checks, in order:
/// 1. Every connection references existing blocks
/// 2. No block is connected to itself
/// 3. No connection is declared twice
/// 4. The graph is acyclic
/// 5. Connected blocks agree on the data they exchange
/// 6. Every table-consuming block has exactly one input
///
/// Blocks with no ordering constraint between them run in insertion order.
pub fn validate_workflow(workflow: &Workflow) -> Result<ExecutionPlan, ValidationError> {
    info!(
        "Validating workflow '{}' with {} blocks",
        workflow.name,
        workflow.blocks.len()
    );

    if workflow.blocks.is_empty() {
        return Err(ValidationError::EmptyWorkflow);
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, block) in workflow.blocks.iter().enumerate() {
        if block.id.trim().is_empty() {
            return Err(ValidationError::EmptyBlockId);
        }
        if index.insert(block.id.as_str(), i).is_some() {
            return Err(ValidationError::DuplicateBlockId(block.id.clone()));
        }
    }

    // Edges as (source index, target index), in declaration order
    let mut edges: Vec<(usize, usize)> = Vec::with_capacity(workflow.connections.len());
    let mut seen: HashSet<(usize, usize)> = HashSet::new();

    for connection in &workflow.connections {
        let lookup = |id: &str| {
            index.get(id).copied().ok_or_else(|| ValidationError::UnknownBlock {
                from_block: connection.source.clone(),
                to_block: connection.target.clone(),
                missing: id.to_string(),
            })
        };
        let from = lookup(connection.source.as_str())?;
        let to = lookup(connection.target.as_str())?;

        if from == to {
            return Err(ValidationError::SelfConnection(connection.source.clone()));
        }
        if !seen.insert((from, to)) {
            return Err(ValidationError::DuplicateConnection {
                from_block: connection.source.clone(),
                to_block: connection.target.clone(),
            });
        }
        edges.push((from, to));
    }

    let order = topological_order(workflow, &edges)?;

    check_shapes(workflow, &edges, &order)?;

    let steps = order
        .iter()
        .map(|&i| {
            let block = &workflow.blocks[i];
            let input = edges
                .iter()
                .find(|(_, to)| *to == i)
                .map(|(from, _)| workflow.blocks[*from].id.clone());
            let consumers = edges
                .iter()
                .filter(|(from, _)| *from == i)
                .map(|(_, to)| workflow.blocks[*to].id.clone())
                .collect();
            PlannedStep {
                block: block.clone(),
                input,
                consumers,
            }
        })
        .collect();

    let plan = ExecutionPlan::new(&workflow.id, &workflow.name, steps);
    info!("Workflow validated: {} steps", plan.len());
    debug!("Execution order: {:?}", plan.block_ids());

    Ok(plan)
}

/// Kahn's algorithm with ties broken by insertion order.
fn topological_order(workflow: &Workflow, edges: &[(usize, usize)]) -> Result<Vec<usize>, ValidationError> {
    let n = workflow.blocks.len();
    let mut in_degree = vec![0usize; n];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for &(from, to) in edges {
        in_degree[to] += 1;
        successors[from].push(to);
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n).filter(|&i| in_degree[i] == 0).map(Reverse).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(Reverse(current)) = ready.pop() {
        order.push(current);
        for &next in &successors[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    let remaining: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();
    Err(ValidationError::GraphCycle {
        blocks: find_cycle(workflow, edges, &remaining),
    })
}

/// Extracts one cycle among the blocks Kahn's algorithm could not order.
///
/// Every such block has an unordered predecessor, so walking predecessors
/// from any of them must revisit a block. The walk is reversed to report
/// the cycle in edge direction.
fn find_cycle(workflow: &Workflow, edges: &[(usize, usize)], remaining: &[bool]) -> Vec<String> {
    let Some(start) = remaining.iter().position(|&r| r) else {
        return Vec::new();
    };

    let predecessor = |node: usize| {
        edges
            .iter()
            .filter(|(from, to)| *to == node && remaining[*from])
            .map(|(from, _)| *from)
            .min()
    };

    let mut path = vec![start];
    let mut current = start;
    while let Some(prev) = predecessor(current) {
        if let Some(pos) = path.iter().position(|&p| p == prev) {
            let mut cycle: Vec<usize> = path[pos..].to_vec();
            cycle.reverse();
            // Start the report at the earliest inserted block
            if let Some(min_pos) = cycle.iter().enumerate().min_by_key(|&(_, b)| *b).map(|(i, _)| i) {
                cycle.rotate_left(min_pos);
            }
            return cycle.into_iter().map(|i| workflow.blocks[i].id.clone()).collect();
        }
        path.push(prev);
        current = prev;
    }

    Vec::new()
}

fn check_shapes(workflow: &Workflow, edges: &[(usize, usize)], order: &[usize]) -> Result<(), ValidationError> {
    for &(from, to) in edges {
        let source = &workflow.blocks[from];
        let target = &workflow.blocks[to];
        let expected = target.kind().input_shape();
        let actual = source.kind().output_shape();
        if expected != actual {
            return Err(ValidationError::IncompatibleBlockChain {
                from_block: source.id.clone(),
                to_block: target.id.clone(),
                expected,
                actual,
            });
        }
    }

    for &i in order {
        let block = &workflow.blocks[i];
        if block.kind().input_shape() == DataShape::Nothing {
            debug!("Block '{}' is a source block", block.id);
            continue;
        }

        let sources: Vec<String> = edges
            .iter()
            .filter(|(_, to)| *to == i)
            .map(|(from, _)| workflow.blocks[*from].id.clone())
            .collect();

        match sources.len() {
            0 => return Err(ValidationError::MissingInput(block.id.clone())),
            1 => {}
            _ => {
                return Err(ValidationError::MultipleInputs {
                    block: block.id.clone(),
                    sources,
                })
            }
        }
    }

    Ok(())
}

/// Decodes and validates a persisted definition in one go.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(Workflow, ExecutionPlan), ValidationError> {
    let workflow = Workflow::decode(definition)?;
    let plan = validate_workflow(&workflow)?;
    Ok((workflow, plan))
}

/// Quick validation that returns every problem found as a message.
///
/// Block-level problems are collected for all blocks; graph checks run
/// only once every block decodes. Useful for editor feedback.
pub fn quick_validate(definition: &WorkflowDefinition) -> Vec<String> {
    if definition.blocks.is_empty() {
        return vec![ValidationError::EmptyWorkflow.to_string()];
    }

    let mut errors = Vec::new();
    let mut ids = HashSet::new();
    for block in &definition.blocks {
        match block.decode() {
            Ok(decoded) => {
                if !ids.insert(decoded.id.clone()) {
                    errors.push(ValidationError::DuplicateBlockId(decoded.id).to_string());
                }
            }
            Err(e) => errors.push(e.to_string()),
        }
    }

    if errors.is_empty() {
        if let Err(e) = validate_definition(definition) {
            errors.push(e.to_string());
        }
    }

    errors
}
