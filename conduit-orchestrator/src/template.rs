//! Template catalog and resolver
//!
//! Templates are published once and never change; resolving one against
//! caller parameters is a pure function, so it runs on the request path
//! before any execution record exists.

use conduit_core::domain::template::{PipelineConfig, Template};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{OrchestratorError, Result};

/// In-memory catalog of published templates
#[derive(Default)]
pub struct TemplateCatalog {
    templates: RwLock<HashMap<String, Arc<Template>>>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog from a list of templates, rejecting duplicate IDs
    pub fn from_templates(templates: impl IntoIterator<Item = Template>) -> Result<Self> {
        let catalog = Self::new();
        for template in templates {
            catalog.publish(template)?;
        }
        Ok(catalog)
    }

    /// Publishes a template
    ///
    /// Templates are immutable: a new version must be published under a new ID.
    pub fn publish(&self, template: Template) -> Result<()> {
        if template.id.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "Template id cannot be empty".to_string(),
            ));
        }

        let mut templates = self
            .templates
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if templates.contains_key(&template.id) {
            return Err(OrchestratorError::Validation(format!(
                "Template {} is already published",
                template.id
            )));
        }

        tracing::info!(
            "Template published: {} ({} v{})",
            template.id,
            template.name,
            template.version
        );
        templates.insert(template.id.clone(), Arc::new(template));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Template>> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All published templates, sorted by ID
    pub fn list(&self) -> Vec<Arc<Template>> {
        let mut templates: Vec<_> = self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        templates
    }

    /// Resolves a template and caller parameters into a pipeline configuration
    ///
    /// # Arguments
    /// * `template_id` - ID of a published, enabled template
    /// * `parameters` - caller-supplied values; keys not in the schema are passed through
    pub fn resolve(
        &self,
        template_id: &str,
        parameters: &HashMap<String, Value>,
    ) -> Result<PipelineConfig> {
        let template = self
            .get(template_id)
            .filter(|template| template.enabled)
            .ok_or_else(|| OrchestratorError::TemplateNotFound(template_id.to_string()))?;

        resolve_template(&template, parameters)
    }
}

/// Pure resolution of one template against caller parameters
///
/// Fills defaults, checks required keys, types and allowed values, then
/// substitutes `${name}` placeholders in the template's string settings.
/// Every violation is reported at once.
pub fn resolve_template(
    template: &Template,
    parameters: &HashMap<String, Value>,
) -> Result<PipelineConfig> {
    let mut variables = parameters.clone();
    let mut problems = Vec::new();

    for (name, spec) in &template.parameters {
        let value = match parameters.get(name) {
            Some(value) => value,
            None => match &spec.default {
                Some(default) => {
                    variables.insert(name.clone(), default.clone());
                    continue;
                }
                None if spec.required => {
                    problems.push(format!("missing required parameter '{}'", name));
                    continue;
                }
                None => continue,
            },
        };

        if !spec.param_type.matches(value) {
            problems.push(format!(
                "parameter '{}' must be of type {}",
                name,
                spec.param_type.as_str()
            ));
            continue;
        }

        if let Some(options) = &spec.options {
            if !options.contains(value) {
                problems.push(format!(
                    "parameter '{}' must be one of {}",
                    name,
                    Value::Array(options.clone())
                ));
            }
        }
    }

    if !problems.is_empty() {
        return Err(OrchestratorError::ParameterValidation(problems.join("; ")));
    }

    Ok(PipelineConfig {
        pipeline_type: template.pipeline_type.clone(),
        stages: template.stages.clone(),
        settings: substitute(&template.settings, &variables),
        variables,
        timeout_seconds: template.timeout_seconds,
        template_id: Some(template.id.clone()),
        template_version: Some(template.version),
    })
}

fn substitute(value: &Value, variables: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(text) => Value::String(interpolate(text, variables)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute(item, variables))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, item)| (key.clone(), substitute(item, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Replaces `${name}` with the variable's value; unknown names are left as-is
fn interpolate(text: &str, variables: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let name = &after[..end];
        match variables.get(name) {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}
