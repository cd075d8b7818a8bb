use crate::error::{EngineError, EngineResult};
use crate::types::{Workflow, WorkflowDescriptor, WorkflowId, WorkflowStatus};
use anyhow::Context;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const WORKFLOWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");
const DESCRIPTORS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflow_descriptors");

/// Whole-state persistence for workflows
pub trait WorkflowStore: Send + Sync {
    /// Insert a new workflow; Conflict when the id is taken
    fn create(&self, workflow: &Workflow) -> EngineResult<()>;

    fn load(&self, id: &WorkflowId) -> EngineResult<Option<Workflow>>;

    /// Replace a stored workflow and return its new revision.
    ///
    /// Fails with Conflict unless the stored revision equals `workflow.revision`.
    fn store(&self, workflow: &Workflow) -> EngineResult<u64>;

    /// Returns false when nothing was stored under `id`
    fn delete(&self, id: &WorkflowId) -> EngineResult<bool>;

    /// Descriptors, most recent first
    fn list(&self, status: Option<WorkflowStatus>) -> EngineResult<Vec<WorkflowDescriptor>>;
}

/// Workflow store backed by redb
#[derive(Clone)]
pub struct RedbWorkflowStore {
    db: Arc<Database>,
}

impl RedbWorkflowStore {
    pub fn new(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _workflows = write_txn
                .open_table(WORKFLOWS_TABLE)
                .context("Failed to open workflows table")?;
            let _descriptors = write_txn
                .open_table(DESCRIPTORS_TABLE)
                .context("Failed to open descriptors table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn write_record(txn: &redb::WriteTransaction, workflow: &Workflow) -> anyhow::Result<()> {
        let key = workflow.id.to_string();
        let value = serde_json::to_vec(workflow).context("Failed to serialize workflow")?;
        let descriptor =
            serde_json::to_vec(&workflow.descriptor()).context("Failed to serialize descriptor")?;

        let mut table = txn.open_table(WORKFLOWS_TABLE).context("Failed to open table")?;
        table
            .insert(key.as_str(), value.as_slice())
            .context("Failed to insert workflow")?;

        let mut table = txn.open_table(DESCRIPTORS_TABLE).context("Failed to open table")?;
        table
            .insert(key.as_str(), descriptor.as_slice())
            .context("Failed to insert descriptor")?;
        Ok(())
    }

    fn stored_revision(txn: &redb::WriteTransaction, id: &WorkflowId) -> anyhow::Result<Option<u64>> {
        let table = txn.open_table(WORKFLOWS_TABLE).context("Failed to open table")?;
        let key = id.to_string();
        let value = table.get(key.as_str()).context("Failed to get workflow")?;

        match value {
            Some(guard) => {
                let stored: Workflow =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize workflow")?;
                Ok(Some(stored.revision))
            }
            None => Ok(None),
        }
    }
}

impl WorkflowStore for RedbWorkflowStore {
    fn create(&self, workflow: &Workflow) -> EngineResult<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        if Self::stored_revision(&write_txn, &workflow.id)?.is_some() {
            return Err(EngineError::Conflict(workflow.id));
        }
        Self::write_record(&write_txn, workflow)?;
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn load(&self, id: &WorkflowId) -> EngineResult<Option<Workflow>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(WORKFLOWS_TABLE).context("Failed to open table")?;

        let key = id.to_string();
        let value = table.get(key.as_str()).context("Failed to get workflow")?;

        match value {
            Some(guard) => {
                let workflow: Workflow =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize workflow")?;
                Ok(Some(workflow))
            }
            None => Ok(None),
        }
    }

    fn store(&self, workflow: &Workflow) -> EngineResult<u64> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        match Self::stored_revision(&write_txn, &workflow.id)? {
            None => return Err(EngineError::WorkflowNotFound(workflow.id)),
            Some(revision) if revision != workflow.revision => {
                return Err(EngineError::Conflict(workflow.id));
            }
            Some(_) => {}
        }

        let mut next = workflow.clone();
        next.revision += 1;
        Self::write_record(&write_txn, &next)?;
        write_txn.commit().context("Failed to commit")?;
        Ok(next.revision)
    }

    fn delete(&self, id: &WorkflowId) -> EngineResult<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let key = id.to_string();
        let removed = {
            let mut table = write_txn.open_table(WORKFLOWS_TABLE).context("Failed to open table")?;
            let removed = table.remove(key.as_str()).context("Failed to delete workflow")?;
            removed.is_some()
        };
        {
            let mut table = write_txn
                .open_table(DESCRIPTORS_TABLE)
                .context("Failed to open table")?;
            table.remove(key.as_str()).context("Failed to delete descriptor")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(removed)
    }

    fn list(&self, status: Option<WorkflowStatus>) -> EngineResult<Vec<WorkflowDescriptor>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(DESCRIPTORS_TABLE)
            .context("Failed to open table")?;

        let mut descriptors = Vec::new();
        for item in table.iter().context("Failed to iterate workflows")? {
            let (_key, value) = item.context("Failed to read item")?;
            let descriptor: WorkflowDescriptor =
                serde_json::from_slice(value.value()).context("Failed to deserialize descriptor")?;
            if status.map_or(true, |s| s == descriptor.status) {
                descriptors.push(descriptor);
            }
        }

        descriptors.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(descriptors)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::Dag;
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    pub(crate) fn sample_workflow(name: &str) -> Workflow {
        Workflow {
            id: WorkflowId::new(),
            name: name.to_string(),
            created_at: Utc::now(),
            status: WorkflowStatus::Idle,
            dag: Dag::default(),
            context: Default::default(),
            rules: vec![],
            applied: vec![],
            applicable: vec![],
            revision: 0,
        }
    }

    /// Behaviour every store implementation shares
    pub(crate) fn exercise_store(store: &dyn WorkflowStore) {
        let mut wf = sample_workflow("first");
        store.create(&wf).unwrap();
        assert!(matches!(store.create(&wf), Err(EngineError::Conflict(_))));
        assert_eq!(store.load(&wf.id).unwrap().unwrap(), wf);

        wf.status = WorkflowStatus::Running;
        let revision = store.store(&wf).unwrap();
        assert_eq!(revision, 1);

        // A writer holding the old revision loses
        assert!(matches!(store.store(&wf), Err(EngineError::Conflict(_))));

        wf.revision = revision;
        assert_eq!(store.store(&wf).unwrap(), 2);

        let mut older = sample_workflow("older");
        older.created_at = Utc::now() - Duration::hours(1);
        store.create(&older).unwrap();

        let all = store.list(None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "first");

        let running = store.list(Some(WorkflowStatus::Running)).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, wf.id);

        assert!(store.delete(&wf.id).unwrap());
        assert!(!store.delete(&wf.id).unwrap());
        assert!(store.load(&wf.id).unwrap().is_none());
        assert!(matches!(store.store(&wf), Err(EngineError::WorkflowNotFound(_))));
        assert_eq!(store.list(None).unwrap().len(), 1);
    }

    #[test]
    fn test_redb_workflow_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = RedbWorkflowStore::new(temp_dir.path().join("index").join("ruleflow.redb")).unwrap();
        exercise_store(&store);
    }

    #[test]
    fn test_redb_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ruleflow.redb");
        let wf = sample_workflow("durable");
        {
            let store = RedbWorkflowStore::new(path.clone()).unwrap();
            store.create(&wf).unwrap();
        }
        let store = RedbWorkflowStore::new(path).unwrap();
        assert_eq!(store.load(&wf.id).unwrap().unwrap().name, "durable");
    }
}
