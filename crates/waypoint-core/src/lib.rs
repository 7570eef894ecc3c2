pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod payload;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, WaypointError};
pub use event::{EventKind, EventMeta, EventPipeline, EventRecord, Feature, LifecycleEvent};
pub use execution::{ExecutionInfo, ExecutionPath};
pub use payload::Payload;
pub use types::*;
