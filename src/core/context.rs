//! Shared workspace context and per-step deltas

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Key-value workspace owned by a pipeline run
///
/// Executors only read it; their writes come back as a [`ContextDelta`]
/// that the coordinator merges once the stage has resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceContext {
    values: BTreeMap<String, String>,
}

/// Writes produced by one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextDelta {
    pub set: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

impl ContextDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

impl WorkspaceContext {
    /// Create a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_variables(variables: &HashMap<String, String>) -> Self {
        Self {
            values: variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }

    /// Apply a delta; removals first, then sets
    pub fn apply(&mut self, delta: &ContextDelta) {
        for key in &delta.remove {
            self.values.remove(key);
        }
        for (key, value) in &delta.set {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Substitute `{{ key }}` placeholders with workspace values
    pub fn render(&self, template: &str) -> String {
        let mut rendered = template.to_string();
        for (key, value) in &self.values {
            let placeholder = format!("{{{{ {} }}}}", key);
            rendered = rendered.replace(&placeholder, value);
        }
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_delta() {
        let mut ctx = WorkspaceContext::new();
        ctx.set("keep", "1");
        ctx.set("drop", "2");

        let mut delta = ContextDelta::new().with("added", "3");
        delta.remove.push("drop".to_string());
        ctx.apply(&delta);

        assert_eq!(ctx.get("keep"), Some("1"));
        assert_eq!(ctx.get("drop"), None);
        assert_eq!(ctx.get("added"), Some("3"));
    }

    #[test]
    fn test_later_delta_wins() {
        let mut ctx = WorkspaceContext::new();
        ctx.apply(&ContextDelta::new().with("k", "first"));
        ctx.apply(&ContextDelta::new().with("k", "second"));
        assert_eq!(ctx.get("k"), Some("second"));
    }

    #[test]
    fn test_render() {
        let mut ctx = WorkspaceContext::new();
        ctx.set("ENV", "staging");
        assert_eq!(ctx.render("deploy to {{ ENV }}"), "deploy to staging");
        assert_eq!(ctx.render("{{ MISSING }}"), "{{ MISSING }}");
    }
}
