//! Template and secret resolution interface
//!
//! Definitions may reference runtime configuration with `{{ key }}`
//! placeholders. Resolution happens in the pre-run hook.

use crate::error::{EngineError, Result};
use std::collections::BTreeMap;

/// Outcome of resolving one raw value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub value: String,

    /// Objects the value was read from
    pub object_dependencies: Vec<String>,
}

pub trait TemplateResolver: Send + Sync {
    fn parse(&self, key: &str, raw: &str, runtime: &BTreeMap<String, String>) -> Result<Resolved>;
}

/// Substitutes `{{ key }}` from the runtime configuration.
///
/// Unknown keys are an error so a half-rendered value never reaches the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderResolver;

impl TemplateResolver for PlaceholderResolver {
    fn parse(&self, key: &str, raw: &str, runtime: &BTreeMap<String, String>) -> Result<Resolved> {
        let mut value = String::with_capacity(raw.len());
        let mut object_dependencies = Vec::new();
        let mut rest = raw;

        while let Some(open) = rest.find("{{") {
            value.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let close = after.find("}}").ok_or_else(|| EngineError::Template {
                key: key.to_string(),
                reason: "unterminated placeholder".to_string(),
            })?;

            let name = after[..close].trim();
            let resolved = runtime.get(name).ok_or_else(|| EngineError::Template {
                key: key.to_string(),
                reason: format!("unknown key {name}"),
            })?;
            value.push_str(resolved);
            if !object_dependencies.iter().any(|d| d == name) {
                object_dependencies.push(name.to_string());
            }

            rest = &after[close + 2..];
        }
        value.push_str(rest);

        Ok(Resolved {
            value,
            object_dependencies,
        })
    }
}
