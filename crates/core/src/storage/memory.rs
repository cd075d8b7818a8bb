use crate::error::{EngineError, EngineResult};
use crate::storage::WorkflowStore;
use crate::types::{Workflow, WorkflowDescriptor, WorkflowId, WorkflowStatus};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Workflow store kept in process memory
#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: RwLock<HashMap<WorkflowId, Workflow>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<WorkflowId, Workflow>> {
        self.workflows.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<WorkflowId, Workflow>> {
        self.workflows.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WorkflowStore for MemoryWorkflowStore {
    fn create(&self, workflow: &Workflow) -> EngineResult<()> {
        let mut workflows = self.write();
        if workflows.contains_key(&workflow.id) {
            return Err(EngineError::Conflict(workflow.id));
        }
        workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    fn load(&self, id: &WorkflowId) -> EngineResult<Option<Workflow>> {
        Ok(self.read().get(id).cloned())
    }

    fn store(&self, workflow: &Workflow) -> EngineResult<u64> {
        let mut workflows = self.write();
        let stored = workflows
            .get_mut(&workflow.id)
            .ok_or(EngineError::WorkflowNotFound(workflow.id))?;
        if stored.revision != workflow.revision {
            return Err(EngineError::Conflict(workflow.id));
        }
        *stored = workflow.clone();
        stored.revision += 1;
        Ok(stored.revision)
    }

    fn delete(&self, id: &WorkflowId) -> EngineResult<bool> {
        Ok(self.write().remove(id).is_some())
    }

    fn list(&self, status: Option<WorkflowStatus>) -> EngineResult<Vec<WorkflowDescriptor>> {
        let mut descriptors: Vec<WorkflowDescriptor> = self
            .read()
            .values()
            .filter(|w| status.map_or(true, |s| s == w.status))
            .map(Workflow::descriptor)
            .collect();
        descriptors.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::workflow_store::tests::exercise_store;

    #[test]
    fn test_memory_workflow_store() {
        exercise_store(&MemoryWorkflowStore::new());
    }
}
