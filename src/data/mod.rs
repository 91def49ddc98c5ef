//! Intermediate Data Module
//!
//! Tables passed between blocks and the per-job store that owns them.
//!
//! - [`table`]: Typed tables with per-row error wrappers
//! - [`store`]: Budgeted table storage keyed by producing block

pub mod store;
pub mod table;

pub use store::{StoreError, TableStore};
pub use table::{Cell, Row, RowError, Table, TableError, ERROR_COLUMN};
