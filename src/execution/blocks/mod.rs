//! Block Implementations
//!
//! One executor per block kind:
//! - [`load`]: reads a delimited file into a table
//! - [`filter`]: keeps rows matching a predicate
//! - [`enrich`]: record and contact enrichment through the service
//! - [`persist`]: writes a table to a delimited file

pub mod enrich;
pub mod filter;
pub mod load;
pub mod persist;

use crate::workflow::{Block, BlockConfig};

use super::step::BlockExecutor;

pub use enrich::EnrichBlock;
pub use filter::FilterBlock;
pub use load::LoadTableBlock;
pub use persist::PersistTableBlock;

/// Builds the executor for a decoded block.
pub fn executor_for(block: &Block) -> Box<dyn BlockExecutor> {
    match &block.config {
        BlockConfig::LoadTable(config) => Box::new(LoadTableBlock::new(config.clone())),
        BlockConfig::Filter(config) => Box::new(FilterBlock::new(config.clone())),
        BlockConfig::EnrichRecord(config) => Box::new(EnrichBlock::lead(config.clone())),
        BlockConfig::FindContact(config) => Box::new(EnrichBlock::contact(config.clone())),
        BlockConfig::PersistTable(config) => Box::new(PersistTableBlock::new(config.clone())),
    }
}
