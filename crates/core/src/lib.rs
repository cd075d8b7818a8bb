// Core of the ruleflow workflow engine: rule evaluation, DAG extension,
// node scheduling and persistence

pub mod backend;
pub mod engine;
pub mod error;
pub mod events;
pub mod locks;
pub mod storage;
pub mod template;
pub mod types;
pub mod workflow;

pub use engine::{EngineConfig, WorkflowEngine, WorkflowStats};
pub use error::{EngineError, EngineResult, Rejection};
pub use types::*;
