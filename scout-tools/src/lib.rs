//! Read-only database inspection operations.
//!
//! The catalog is a closed set: every operation the model may invoke is a
//! variant of [`InspectionOp`], dispatched through [`OpRegistry`]. Dispatch
//! never returns an error; every failure becomes a `{"error": ...}` payload
//! the model can read and react to.

mod catalog;
mod connector;
mod error;
mod plan;
mod safety;

pub use catalog::{InspectionOp, OpRegistry};
pub use connector::{SqlConnector, SqlParam};
pub use error::{Result, ToolError};
pub use plan::summarize_plan;
pub use safety::check_read_only;
