pub mod registry;
pub mod schema;
pub mod typed;

pub use registry::ToolRegistry;
pub use schema::{decode_arguments, validate_against_schema};
pub use typed::{schema_of, FnTool};
