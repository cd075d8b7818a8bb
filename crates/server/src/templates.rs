// Template resolution over HTTP and routing between resolvers

use async_trait::async_trait;
use ruleflow_core::template::{
    DirectoryTemplateResolver, ResolvedTemplate, TemplateResolver, WorkflowTemplate,
};
use ruleflow_core::{Context, EngineError, EngineResult};
use std::time::Duration;

/// Fetches template JSON from `http(s)://` references
pub struct HttpTemplateResolver {
    client: reqwest::Client,
}

impl HttpTemplateResolver {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn fetch(&self, url: &str) -> EngineResult<WorkflowTemplate> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow::Error::new(e).context(format!("Failed to fetch template {}", url)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::TemplateNotFound(url.to_string()));
        }
        let response = response
            .error_for_status()
            .map_err(|e| anyhow::Error::new(e).context(format!("Template server refused {}", url)))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| anyhow::Error::new(e).context("Failed to read template body"))?;
        serde_json::from_slice(&body).map_err(|e| EngineError::InvalidTemplate(format!("{}: {}", url, e)))
    }
}

impl Default for HttpTemplateResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TemplateResolver for HttpTemplateResolver {
    async fn resolve(&self, reference: &str, parameters: &Context) -> EngineResult<ResolvedTemplate> {
        let template = self.fetch(reference).await?;
        tracing::debug!(template = %reference, "Resolved template over HTTP");
        template.instantiate(parameters)
    }
}

/// URLs go to the HTTP resolver, everything else to the template directory
pub struct RoutingTemplateResolver {
    directory: DirectoryTemplateResolver,
    http: HttpTemplateResolver,
}

impl RoutingTemplateResolver {
    pub fn new(directory: DirectoryTemplateResolver, http: HttpTemplateResolver) -> Self {
        Self { directory, http }
    }

    fn is_remote(reference: &str) -> bool {
        reference.starts_with("http://") || reference.starts_with("https://")
    }
}

#[async_trait]
impl TemplateResolver for RoutingTemplateResolver {
    async fn resolve(&self, reference: &str, parameters: &Context) -> EngineResult<ResolvedTemplate> {
        let reference = reference.trim();
        if Self::is_remote(reference) {
            self.http.resolve(reference, parameters).await
        } else {
            self.directory.resolve(reference, parameters).await
        }
    }
}
