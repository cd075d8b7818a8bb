// Workflow templates: parameter binding, placeholder rendering and resolution

use crate::error::{EngineError, EngineResult};
use crate::types::{Context, Rule};
use crate::workflow::evaluator::check_rule;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Reusable workflow definition with typed parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<TemplateParameter>,
    #[serde(default)]
    pub context: Context,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateParameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    /// Element type for array parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<ParameterType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    #[default]
    String,
    Int,
    Float,
    Bool,
    Array,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterType::String => "string",
            ParameterType::Int => "int",
            ParameterType::Float => "float",
            ParameterType::Bool => "bool",
            ParameterType::Array => "array",
        };
        f.write_str(name)
    }
}

/// Output of template resolution: the initial rules and context of a workflow
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTemplate {
    pub name: String,
    pub rules: Vec<Rule>,
    pub context: Context,
}

/// Locates a template by reference and instantiates it
#[async_trait]
pub trait TemplateResolver: Send + Sync {
    async fn resolve(&self, reference: &str, parameters: &Context) -> EngineResult<ResolvedTemplate>;
}

impl WorkflowTemplate {
    /// Bind parameters and produce the initial workflow context
    pub fn instantiate(&self, parameters: &Context) -> EngineResult<ResolvedTemplate> {
        for rule in &self.rules {
            check_rule(rule).map_err(|reason| {
                EngineError::InvalidTemplate(format!(
                    "template '{}', rule '{}': {}",
                    self.name, rule.name, reason
                ))
            })?;
        }

        let mut context = self.context.clone();
        for param in &self.parameters {
            let value = parameters
                .get(&param.name)
                .or(param.default.as_ref())
                .ok_or_else(|| EngineError::InvalidParameter {
                    name: param.name.clone(),
                    reason: "not provided and has no default".to_string(),
                })?;

            let converted = TemplateProcessor::convert_parameter(param, value).map_err(|reason| {
                EngineError::InvalidParameter {
                    name: param.name.clone(),
                    reason,
                }
            })?;
            context.insert(param.name.clone(), converted);
        }

        Ok(ResolvedTemplate {
            name: self.name.clone(),
            rules: self.rules.clone(),
            context,
        })
    }
}

/// Placeholder rendering and parameter conversion
pub struct TemplateProcessor;

impl TemplateProcessor {
    /// Convert a raw parameter value to the declared type
    pub fn convert_parameter(param: &TemplateParameter, value: &Value) -> Result<Value, String> {
        if param.param_type != ParameterType::Array {
            return Self::convert_scalar(param.param_type, value);
        }

        let items = param.items.unwrap_or(ParameterType::String);
        let raw: Vec<Value> = match value {
            Value::Array(values) => values.clone(),
            Value::String(s) if s.trim().is_empty() => Vec::new(),
            Value::String(s) => s.split(',').map(|v| Value::String(v.trim().to_string())).collect(),
            other => vec![other.clone()],
        };

        raw.iter()
            .map(|v| Self::convert_scalar(items, v))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array)
    }

    fn convert_scalar(ty: ParameterType, value: &Value) -> Result<Value, String> {
        match (ty, value) {
            (ParameterType::String, Value::String(_)) => Ok(value.clone()),
            (ParameterType::String, Value::Array(_) | Value::Object(_)) => {
                Err("expected a string value".to_string())
            }
            (ParameterType::String, other) => Ok(Value::String(other.to_string())),
            (ParameterType::Int, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            (ParameterType::Int, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("'{}' is not an integer", s)),
            (ParameterType::Float, Value::Number(n)) => n
                .as_f64()
                .map(Value::from)
                .ok_or_else(|| "expected a float value".to_string()),
            (ParameterType::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| format!("'{}' is not a number", s)),
            (ParameterType::Bool, Value::Bool(_)) => Ok(value.clone()),
            (ParameterType::Bool, Value::String(s)) => s
                .trim()
                .parse::<bool>()
                .map(Value::from)
                .map_err(|_| format!("'{}' must be true or false", s)),
            (ParameterType::Array, _) => Err("nested arrays are not supported".to_string()),
            (ty, other) => Err(format!("expected {} value, got {}", ty, other)),
        }
    }

    /// Render every string inside `value`.
    ///
    /// A string consisting of exactly one known placeholder is replaced by the
    /// scope value itself, keeping its JSON type.
    pub fn render_value(value: &Value, scope: &Context) -> Value {
        match value {
            Value::String(text) => match Self::sole_placeholder(text).and_then(|name| scope.get(name)) {
                Some(v) => v.clone(),
                None => Value::String(Self::render_str(text, scope)),
            },
            Value::Array(items) => Value::Array(items.iter().map(|v| Self::render_value(v, scope)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::render_value(v, scope)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Replace `{{name}}` placeholders; unknown names are left as written
    pub fn render_str(text: &str, scope: &Context) -> String {
        let mut result = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            let end = start + 2 + len;
            let name = rest[start + 2..end].trim();

            result.push_str(&rest[..start]);
            match scope.get(name) {
                Some(Value::String(s)) => result.push_str(s),
                Some(other) => result.push_str(&other.to_string()),
                None => result.push_str(&rest[start..end + 2]),
            }
            rest = &rest[end + 2..];
        }

        result.push_str(rest);
        result
    }

    /// Extract placeholder names from a template string
    pub fn extract_parameters(text: &str) -> Vec<String> {
        let mut params = Vec::new();
        let mut rest = text;
        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            let name = rest[start + 2..start + 2 + len].trim();
            if !name.is_empty() {
                params.push(name.to_string());
            }
            rest = &rest[start + 2 + len + 2..];
        }

        params.sort();
        params.dedup();
        params
    }

    fn sole_placeholder(text: &str) -> Option<&str> {
        let inner = text.trim().strip_prefix("{{")?.strip_suffix("}}")?;
        if inner.contains("{{") || inner.contains("}}") {
            return None;
        }
        Some(inner.trim())
    }
}

/// Resolves `<dir>/<reference>.json` template files
pub struct DirectoryTemplateResolver {
    dir: PathBuf,
}

impl DirectoryTemplateResolver {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub async fn load(&self, reference: &str) -> EngineResult<WorkflowTemplate> {
        let reference = reference.trim();
        if reference.is_empty()
            || reference.contains(['/', '\\'])
            || reference.starts_with('.')
        {
            return Err(EngineError::TemplateNotFound(reference.to_string()));
        }

        let file_name = if reference.ends_with(".json") {
            reference.to_string()
        } else {
            format!("{}.json", reference)
        };
        let path = self.dir.join(file_name);

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::TemplateNotFound(reference.to_string()));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to read template {}", path.display()))
                    .into())
            }
        };

        serde_json::from_str(&content)
            .map_err(|e| EngineError::InvalidTemplate(format!("{}: {}", reference, e)))
    }
}

#[async_trait]
impl TemplateResolver for DirectoryTemplateResolver {
    async fn resolve(&self, reference: &str, parameters: &Context) -> EngineResult<ResolvedTemplate> {
        let template = self.load(reference).await?;
        tracing::debug!(template = %reference, dir = %self.dir.display(), "Resolved template from directory");
        template.instantiate(parameters)
    }
}

/// Resolver over templates registered in memory
#[derive(Default)]
pub struct StaticTemplateResolver {
    templates: HashMap<String, WorkflowTemplate>,
}

impl StaticTemplateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, reference: impl Into<String>, template: WorkflowTemplate) -> Self {
        self.templates.insert(reference.into(), template);
        self
    }
}

#[async_trait]
impl TemplateResolver for StaticTemplateResolver {
    async fn resolve(&self, reference: &str, parameters: &Context) -> EngineResult<ResolvedTemplate> {
        self.templates
            .get(reference)
            .ok_or_else(|| EngineError::TemplateNotFound(reference.to_string()))?
            .instantiate(parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(value: Value) -> Context {
        match value {
            Value::Object(map) => map,
            _ => panic!("scope must be an object"),
        }
    }

    fn template() -> WorkflowTemplate {
        serde_json::from_value(json!({
            "name": "montecarlo",
            "parameters": [
                { "name": "nevents", "type": "int", "default": 100 },
                { "name": "seeds", "type": "array", "items": "int" },
                { "name": "label", "type": "string", "default": "run" }
            ],
            "context": { "label": "from-template", "region": "eu" },
            "rules": [{
                "name": "generate",
                "type": "init",
                "info": {
                    "scheduler_type": { "type": "single_step" },
                    "step": { "name": "generate", "task": {} }
                }
            }]
        }))
        .unwrap()
    }

    #[test]
    fn test_extract_parameters() {
        let params = TemplateProcessor::extract_parameters("run {{ seed }} into {{out}} and {{seed}}");
        assert_eq!(params, vec!["out", "seed"]);
    }

    #[test]
    fn test_render_str_leaves_unknown_placeholders() {
        let scope = scope(json!({ "seed": 7, "out": "data.root" }));
        assert_eq!(
            TemplateProcessor::render_str("gen --seed {{seed}} -o {{ out }} {{missing}}", &scope),
            "gen --seed 7 -o data.root {{missing}}"
        );
        assert_eq!(TemplateProcessor::render_str("unterminated {{seed", &scope), "unterminated {{seed");
    }

    #[test]
    fn test_render_value_keeps_json_types() {
        let scope = scope(json!({ "inputs": ["a", "b"], "n": 3 }));
        let task = json!({ "files": "{{inputs}}", "args": ["-n", "{{n}}", "x{{n}}"] });
        assert_eq!(
            TemplateProcessor::render_value(&task, &scope),
            json!({ "files": ["a", "b"], "args": ["-n", 3, "x3"] })
        );
    }

    #[test]
    fn test_instantiate_binds_and_converts() {
        let params = scope(json!({ "nevents": "50", "seeds": "1, 2,3" }));
        let resolved = template().instantiate(&params).unwrap();

        assert_eq!(resolved.name, "montecarlo");
        assert_eq!(resolved.context["nevents"], json!(50));
        assert_eq!(resolved.context["seeds"], json!([1, 2, 3]));
        assert_eq!(resolved.context["label"], json!("run"));
        assert_eq!(resolved.context["region"], json!("eu"));
    }

    #[test]
    fn test_statically_malformed_rule_is_invalid_template() {
        let mut bad = template();
        bad.rules[0].dependencies = vec![serde_json::from_value(json!({
            "type": "exists",
            "expressions": [{ "match": "rule", "rule": "other" }]
        }))
        .unwrap()];

        let params = scope(json!({ "seeds": [1] }));
        let err = bad.instantiate(&params).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTemplate(ref reason) if reason.contains("init rules")));
    }

    #[test]
    fn test_template_without_rules_is_accepted() {
        let mut empty = template();
        empty.rules.clear();
        let resolved = empty.instantiate(&scope(json!({ "seeds": [1] }))).unwrap();
        assert!(resolved.rules.is_empty());
    }

    #[test]
    fn test_missing_parameter_without_default() {
        let err = template().instantiate(&Context::new()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter { ref name, .. } if name == "seeds"));
    }

    #[test]
    fn test_parameter_type_validation() {
        let params = scope(json!({ "nevents": "many", "seeds": [1] }));
        let err = template().instantiate(&params).unwrap_err();
        assert!(err.to_string().contains("not an integer"));
    }

    #[tokio::test]
    async fn test_directory_resolver() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("mc.json"),
            serde_json::to_vec(&template()).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{ not json").unwrap();

        let resolver = DirectoryTemplateResolver::new(dir.path().to_path_buf());
        let params = scope(json!({ "seeds": [4] }));

        let resolved = resolver.resolve("mc", &params).await.unwrap();
        assert_eq!(resolved.rules.len(), 1);

        assert!(matches!(
            resolver.resolve("missing", &params).await,
            Err(EngineError::TemplateNotFound(_))
        ));
        assert!(matches!(
            resolver.resolve("../mc", &params).await,
            Err(EngineError::TemplateNotFound(_))
        ));
        assert!(matches!(
            resolver.resolve("broken", &params).await,
            Err(EngineError::InvalidTemplate(_))
        ));
    }
}
