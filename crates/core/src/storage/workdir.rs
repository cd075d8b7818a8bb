use crate::error::{EngineError, EngineResult, Rejection};
use crate::types::WorkflowId;
use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
}

/// Entry of a workflow working directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the workflow directory, `/`-separated
    pub path: String,
    pub kind: FileKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Per-workflow working directories under one base path
#[derive(Clone)]
pub struct WorkDirectory {
    base_path: PathBuf,
}

impl WorkDirectory {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create work directory")?;
        Ok(Self { base_path })
    }

    pub fn path(&self, id: &WorkflowId) -> PathBuf {
        self.base_path.join(id.to_string())
    }

    pub fn create(&self, id: &WorkflowId) -> Result<PathBuf> {
        let path = self.path(id);
        std::fs::create_dir_all(&path).context("Failed to create workflow directory")?;
        Ok(path)
    }

    pub fn remove(&self, id: &WorkflowId) -> Result<()> {
        let path = self.path(id);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove workflow directory"),
        }
    }

    /// Every file and directory below the workflow directory, sorted by path
    pub fn list(&self, id: &WorkflowId) -> Result<Vec<FileEntry>> {
        let root = self.path(id);
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
            let entry = entry.context("Failed to walk workflow directory")?;
            let relative = entry
                .path()
                .strip_prefix(&root)
                .context("Walked outside the workflow directory")?;
            let path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let file_type = entry.file_type();
            let (kind, size) = if file_type.is_dir() {
                (FileKind::Directory, None)
            } else {
                let metadata = entry.metadata().context("Failed to read file metadata")?;
                (FileKind::File, Some(metadata.len()))
            };
            entries.push(FileEntry { path, kind, size });
        }
        Ok(entries)
    }

    /// Map a client-supplied relative path onto an existing file
    pub fn resolve(&self, id: &WorkflowId, relative: &str) -> EngineResult<PathBuf> {
        let relative_path = Path::new(relative);
        let safe = !relative.is_empty()
            && relative_path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(Rejection::InvalidPath(relative.to_string()).into());
        }

        let path = self.path(id).join(relative_path);
        if !path.is_file() {
            return Err(EngineError::FileNotFound(relative.to_string()));
        }
        Ok(path)
    }

    pub async fn read(&self, id: &WorkflowId, relative: &str) -> EngineResult<Bytes> {
        let path = self.resolve(id, relative)?;
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Bytes::from(data))
    }
}
