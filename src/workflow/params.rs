//! Block Configuration
//!
//! Typed configuration for each block kind, decoded from the generic
//! parameter map of a [`BlockDefinition`](super::model::BlockDefinition).
//! Required keys are checked up front so a missing key is reported as a
//! validation error naming the block and key.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::model::BlockKind;
use super::validator::ValidationError;
use crate::execution::predicate::Predicate;

const DEFAULT_BATCH_SIZE: usize = 10;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// Single-byte field delimiter for tabular files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Delimiter(u8);

impl Delimiter {
    pub fn byte(&self) -> u8 {
        self.0
    }
}

impl Default for Delimiter {
    fn default() -> Self {
        Delimiter(b',')
    }
}

impl TryFrom<String> for Delimiter {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let normalized = match value.as_str() {
            "\\t" | "tab" => "\t",
            other => other,
        };
        let mut chars = normalized.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii() && c != '"' && c != '\n' && c != '\r' => Ok(Delimiter(c as u8)),
            _ => Err(format!("delimiter must be a single ASCII character, got '{}'", value)),
        }
    }
}

impl From<Delimiter> for String {
    fn from(delimiter: Delimiter) -> Self {
        (delimiter.0 as char).to_string()
    }
}

/// Text encoding of a tabular file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TextEncoding {
    #[default]
    Utf8,
    Latin1,
}

impl TryFrom<String> for TextEncoding {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(TextEncoding::Latin1),
            _ => Err(format!("unsupported encoding '{}'", value)),
        }
    }
}

impl From<TextEncoding> for String {
    fn from(encoding: TextEncoding) -> Self {
        encoding.to_string()
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextEncoding::Utf8 => write!(f, "utf-8"),
            TextEncoding::Latin1 => write!(f, "latin-1"),
        }
    }
}

/// Ordered target fields requested from the enrichment service, each with
/// a short description the service uses as guidance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "SchemaRepr")]
pub struct FieldSchema {
    fields: Vec<(String, String)>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SchemaRepr {
    Described(Map<String, Value>),
    Names(Vec<String>),
}

impl TryFrom<SchemaRepr> for FieldSchema {
    type Error = String;

    fn try_from(repr: SchemaRepr) -> Result<Self, Self::Error> {
        let fields: Vec<(String, String)> = match repr {
            SchemaRepr::Described(map) => map
                .into_iter()
                .map(|(name, description)| {
                    let description = match description {
                        Value::String(s) => s,
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    (name, description)
                })
                .collect(),
            SchemaRepr::Names(names) => names.into_iter().map(|n| (n, String::new())).collect(),
        };

        if fields.is_empty() {
            return Err("field schema is empty".to_string());
        }
        if let Some((name, _)) = fields.iter().find(|(name, _)| name.trim().is_empty()) {
            return Err(format!("field schema has a blank field name '{}'", name));
        }
        Ok(FieldSchema { fields })
    }
}

impl FieldSchema {
    pub fn new<I, N, D>(fields: I) -> Self
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(|(n, d)| (n.into(), d.into())).collect(),
        }
    }

    /// Schema requested by contact lookups.
    pub fn contact() -> Self {
        Self::new([
            ("email", "Professional email address of the person"),
            ("confidence", "Confidence that the email is correct, 0 to 100"),
            ("source", "Where the email was found"),
        ])
    }

    /// Field names in request order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Renders the schema as the `struct` object sent to the service.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(name, description)| (name.clone(), Value::String(description.clone())))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoadTableConfig {
    pub file_path: String,
    #[serde(default)]
    pub delimiter: Delimiter,
    #[serde(default)]
    pub encoding: TextEncoding,
    /// Lines skipped before the header
    #[serde(default)]
    pub skip_rows: usize,
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub condition: String,
    pub predicate: Predicate,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnrichConfig {
    #[serde(rename = "struct", alias = "fields")]
    pub fields: FieldSchema,
    /// Columns sent to the service; all columns when absent
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Per-call timeout in seconds, overriding the client default
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FindContactConfig {
    #[serde(default)]
    pub aggressive: bool,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PersistTableConfig {
    /// Output path; generated from the block id and time when absent
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub delimiter: Delimiter,
    #[serde(default)]
    pub encoding: TextEncoding,
    /// Prepend a 0-based row index column
    #[serde(default)]
    pub index: bool,
}

/// Kind-specific block configuration.
#[derive(Debug, Clone)]
pub enum BlockConfig {
    LoadTable(LoadTableConfig),
    Filter(FilterConfig),
    EnrichRecord(EnrichConfig),
    FindContact(FindContactConfig),
    PersistTable(PersistTableConfig),
}

impl BlockConfig {
    /// Decodes the parameters of block `block_id` as configuration for `kind`.
    pub fn decode(block_id: &str, kind: BlockKind, params: &Map<String, Value>) -> Result<Self, ValidationError> {
        let config = match kind {
            BlockKind::LoadTable => {
                require(block_id, params, &["file_path"])?;
                BlockConfig::LoadTable(from_params(block_id, params)?)
            }
            BlockKind::Filter => {
                require(block_id, params, &["condition"])?;
                let condition = match params.get("condition") {
                    Some(Value::String(s)) => s.trim().to_string(),
                    other => {
                        return Err(ValidationError::InvalidConfig {
                            block: block_id.to_string(),
                            message: format!("condition must be a string, got {}", other.unwrap_or(&Value::Null)),
                        })
                    }
                };
                let predicate = Predicate::parse(&condition).map_err(|e| ValidationError::InvalidPredicate {
                    block: block_id.to_string(),
                    message: e.to_string(),
                })?;
                BlockConfig::Filter(FilterConfig { condition, predicate })
            }
            BlockKind::EnrichRecord => {
                require(block_id, params, &["struct", "fields"])?;
                let config: EnrichConfig = from_params(block_id, params)?;
                check_batch_size(block_id, config.batch_size)?;
                BlockConfig::EnrichRecord(config)
            }
            BlockKind::FindContact => {
                let config: FindContactConfig = from_params(block_id, params)?;
                check_batch_size(block_id, config.batch_size)?;
                BlockConfig::FindContact(config)
            }
            BlockKind::PersistTable => BlockConfig::PersistTable(from_params(block_id, params)?),
        };
        Ok(config)
    }

    pub fn kind(&self) -> BlockKind {
        match self {
            BlockConfig::LoadTable(_) => BlockKind::LoadTable,
            BlockConfig::Filter(_) => BlockKind::Filter,
            BlockConfig::EnrichRecord(_) => BlockKind::EnrichRecord,
            BlockConfig::FindContact(_) => BlockKind::FindContact,
            BlockConfig::PersistTable(_) => BlockKind::PersistTable,
        }
    }
}

/// Checks that one of `keys` is present with a non-blank value.
fn require(block_id: &str, params: &Map<String, Value>, keys: &[&str]) -> Result<(), ValidationError> {
    let present = keys.iter().any(|key| match params.get(*key) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    });

    if present {
        Ok(())
    } else {
        Err(ValidationError::MissingConfig {
            block: block_id.to_string(),
            key: keys[0].to_string(),
        })
    }
}

fn from_params<T>(block_id: &str, params: &Map<String, Value>) -> Result<T, ValidationError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(Value::Object(params.clone())).map_err(|e| ValidationError::InvalidConfig {
        block: block_id.to_string(),
        message: e.to_string(),
    })
}

fn check_batch_size(block_id: &str, batch_size: usize) -> Result<(), ValidationError> {
    if batch_size == 0 {
        return Err(ValidationError::InvalidConfig {
            block: block_id.to_string(),
            message: "batch_size must be at least 1".to_string(),
        });
    }
    Ok(())
}
