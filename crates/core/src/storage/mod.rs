pub mod event_log;
pub mod memory;
pub mod workdir;
pub mod workflow_store;

pub use event_log::JsonlEventLog;
pub use memory::MemoryWorkflowStore;
pub use workdir::{FileEntry, FileKind, WorkDirectory};
pub use workflow_store::{RedbWorkflowStore, WorkflowStore};
