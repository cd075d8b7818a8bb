// Hypermedia links attached to every exposed entity

use ruleflow_core::{NodeId, WorkflowId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

impl Link {
    pub fn new(rel: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            rel: rel.into(),
            href: href.into(),
        }
    }
}

/// Builds absolute URLs for API resources
#[derive(Debug, Clone)]
pub struct UrlFactory {
    base: String,
}

impl UrlFactory {
    pub fn new(base_url: &str, path_prefix: &str) -> Self {
        Self {
            base: format!("{}{}", base_url.trim_end_matches('/'), path_prefix),
        }
    }

    pub fn root(&self) -> String {
        self.base.clone()
    }

    pub fn workflows(&self) -> String {
        format!("{}/workflows", self.base)
    }

    pub fn workflow_stats(&self) -> String {
        format!("{}/workflows/stats", self.base)
    }

    pub fn workflow(&self, id: &WorkflowId) -> String {
        format!("{}/workflows/{}", self.base, id)
    }

    pub fn apply(&self, id: &WorkflowId) -> String {
        format!("{}/apply", self.workflow(id))
    }

    pub fn submit(&self, id: &WorkflowId) -> String {
        format!("{}/submit", self.workflow(id))
    }

    pub fn files(&self, id: &WorkflowId) -> String {
        format!("{}/files", self.workflow(id))
    }

    pub fn events(&self, id: &WorkflowId) -> String {
        format!("{}/events", self.workflow(id))
    }

    pub fn node_result(&self, id: &WorkflowId, node: &NodeId) -> String {
        format!("{}/nodes/{}/result", self.workflow(id), node)
    }

    pub fn file(&self, id: &WorkflowId, path: &str) -> String {
        format!("{}/files/{}/{}", self.base, id, path)
    }

    pub fn root_links(&self) -> Vec<Link> {
        vec![
            Link::new("self", self.root()),
            Link::new("workflows", self.workflows()),
            Link::new("workflow-stats", self.workflow_stats()),
        ]
    }

    pub fn workflow_summary_links(&self, id: &WorkflowId) -> Vec<Link> {
        vec![Link::new("self", self.workflow(id))]
    }

    pub fn workflow_links(&self, id: &WorkflowId) -> Vec<Link> {
        vec![
            Link::new("self", self.workflow(id)),
            Link::new("apply", self.apply(id)),
            Link::new("submit", self.submit(id)),
            Link::new("files", self.files(id)),
            Link::new("events", self.events(id)),
            Link::new("workflows", self.workflows()),
        ]
    }

    pub fn node_links(&self, id: &WorkflowId, node: &NodeId) -> Vec<Link> {
        vec![Link::new("result", self.node_result(id, node))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_join_base_and_prefix() {
        let urls = UrlFactory::new("http://localhost:8080/", "/api/v1");
        let id = WorkflowId::new();

        assert_eq!(urls.root(), "http://localhost:8080/api/v1");
        assert_eq!(urls.workflows(), "http://localhost:8080/api/v1/workflows");
        assert_eq!(urls.apply(&id), format!("http://localhost:8080/api/v1/workflows/{}/apply", id));
        assert_eq!(
            urls.file(&id, "n1/stdout.log"),
            format!("http://localhost:8080/api/v1/files/{}/n1/stdout.log", id)
        );
    }

    #[test]
    fn test_workflow_links_have_self_first() {
        let urls = UrlFactory::new("http://h", "");
        let id = WorkflowId::new();
        let links = urls.workflow_links(&id);
        assert_eq!(links[0], Link::new("self", format!("http://h/workflows/{}", id)));
        assert!(links.iter().any(|l| l.rel == "submit"));
    }
}
