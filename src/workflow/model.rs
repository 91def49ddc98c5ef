//! Workflow Data Model
//!
//! Two views of the same workflow:
//!
//! - [`WorkflowDefinition`]: the persisted form, as saved by the visual
//!   builder. Block configuration is a generic parameter map.
//! - [`Workflow`]: the typed snapshot decoded for one execution. Every
//!   block carries a [`BlockConfig`] checked for required keys.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: Acme leads
//! blocks:
//!   - id: load
//!     type: read_csv
//!     parameters:
//!       file_path: leads.csv
//!
//!   - id: only_acme
//!     type: filter
//!     parameters:
//!       condition: company contains "Acme"
//!
//!   - id: save
//!     type: save_csv
//! connections:
//!   - source: load
//!     target: only_acme
//!   - source: only_acme
//!     target: save
//! ```

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::params::BlockConfig;
use super::validator::ValidationError;

/// What a block consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataShape {
    Nothing,
    Table,
}

impl fmt::Display for DataShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataShape::Nothing => write!(f, "nothing"),
            DataShape::Table => write!(f, "table"),
        }
    }
}

/// The kinds of block a workflow can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    LoadTable,
    Filter,
    EnrichRecord,
    FindContact,
    PersistTable,
}

impl BlockKind {
    /// Resolves a kind name, accepting the legacy builder names.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "load_table" | "read_csv" => Some(BlockKind::LoadTable),
            "filter" => Some(BlockKind::Filter),
            "enrich_record" | "enrich_lead" => Some(BlockKind::EnrichRecord),
            "find_contact" | "find_email" => Some(BlockKind::FindContact),
            "persist_table" | "save_csv" => Some(BlockKind::PersistTable),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::LoadTable => "load_table",
            BlockKind::Filter => "filter",
            BlockKind::EnrichRecord => "enrich_record",
            BlockKind::FindContact => "find_contact",
            BlockKind::PersistTable => "persist_table",
        }
    }

    pub fn input_shape(&self) -> DataShape {
        match self {
            BlockKind::LoadTable => DataShape::Nothing,
            _ => DataShape::Table,
        }
    }

    pub fn output_shape(&self) -> DataShape {
        match self {
            BlockKind::PersistTable => DataShape::Nothing,
            _ => DataShape::Table,
        }
    }

    /// Whether the block calls the external enrichment service.
    pub fn uses_enrichment(&self) -> bool {
        matches!(self, BlockKind::EnrichRecord | BlockKind::FindContact)
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canvas position of a block. Not used by execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A directed edge from the block producing data to the block reading it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    #[serde(alias = "source_block_id")]
    pub source: String,
    #[serde(alias = "target_block_id")]
    pub target: String,
}

impl Connection {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// A block as persisted, with untyped parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDefinition {
    #[serde(alias = "block_id")]
    pub id: String,

    /// Kind name, e.g. `filter` or `read_csv`
    #[serde(rename = "type", alias = "kind", alias = "block_type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, alias = "config")]
    pub parameters: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl BlockDefinition {
    /// Creates a block definition with no parameters.
    ///
    /// ```
    /// use leadflow::workflow::BlockDefinition;
    ///
    /// let block = BlockDefinition::new("only_acme", "filter")
    ///     .with_name("Only Acme")
    ///     .with_param("condition", "company contains \"Acme\"");
    /// assert_eq!(block.parameters["condition"], "company contains \"Acme\"");
    /// ```
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            name: None,
            description: None,
            parameters: Map::new(),
            position: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets one configuration parameter.
    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Decodes the block into its typed form.
    pub fn decode(&self) -> Result<Block, ValidationError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ValidationError::EmptyBlockId);
        }

        let kind = BlockKind::from_name(&self.kind).ok_or_else(|| ValidationError::UnknownBlockKind {
            block: id.to_string(),
            kind: self.kind.clone(),
        })?;

        let config = BlockConfig::decode(id, kind, &self.parameters)?;

        Ok(Block {
            id: id.to_string(),
            name: self
                .name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| id.to_string()),
            config,
            position: self.position,
        })
    }
}

/// A workflow as persisted by the builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "new_id", alias = "workflow_id")]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub blocks: Vec<BlockDefinition>,

    #[serde(default)]
    pub connections: Vec<Connection>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl WorkflowDefinition {
    /// Creates an empty workflow definition with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            description: None,
            blocks: Vec::new(),
            connections: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_block(mut self, block: BlockDefinition) -> Self {
        self.blocks.push(block);
        self
    }

    /// Adds a connection from `source` to `target`.
    pub fn connect(mut self, source: &str, target: &str) -> Self {
        self.connections.push(Connection::new(source, target));
        self
    }

    /// Marks the definition as modified now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A decoded block ready for execution.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: String,
    /// Display name (defaults to the id)
    pub name: String,
    pub config: BlockConfig,
    pub position: Option<Position>,
}

impl Block {
    pub fn kind(&self) -> BlockKind {
        self.config.kind()
    }
}

/// Typed snapshot of a workflow taken for one execution.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Blocks in insertion order
    pub blocks: Vec<Block>,
    pub connections: Vec<Connection>,
}

impl Workflow {
    /// Decodes a persisted definition, checking ids, kinds and required
    /// configuration. Graph checks are done by the validator.
    pub fn decode(definition: &WorkflowDefinition) -> Result<Self, ValidationError> {
        if definition.blocks.is_empty() {
            return Err(ValidationError::EmptyWorkflow);
        }

        let mut seen = HashSet::new();
        let mut blocks = Vec::with_capacity(definition.blocks.len());
        for block in &definition.blocks {
            let decoded = block.decode()?;
            if !seen.insert(decoded.id.clone()) {
                return Err(ValidationError::DuplicateBlockId(decoded.id));
            }
            blocks.push(decoded);
        }

        let connections = definition
            .connections
            .iter()
            .map(|c| Connection::new(c.source.trim(), c.target.trim()))
            .collect();

        Ok(Self {
            id: definition.id.clone(),
            name: if definition.name.trim().is_empty() {
                definition.id.clone()
            } else {
                definition.name.clone()
            },
            description: definition.description.clone(),
            blocks,
            connections,
        })
    }

    /// Gets a block by id.
    pub fn get_block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Position of a block in insertion order.
    pub fn block_index(&self, id: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl TryFrom<&WorkflowDefinition> for Workflow {
    type Error = ValidationError;

    fn try_from(definition: &WorkflowDefinition) -> Result<Self, Self::Error> {
        Workflow::decode(definition)
    }
}
