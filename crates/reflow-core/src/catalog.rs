//! Workflow catalog
//!
//! Maps workflow names (optionally versioned) to workflow programs. The
//! catalog is a registration API: binaries register the workflows they
//! embed, and lookups during `run` resolve the latest version unless a
//! specific one is requested.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use parking_lot::RwLock;

use crate::errors::EngineError;
use crate::workflow::Workflow;

/// Registry of workflows by name and version
#[derive(Default)]
pub struct WorkflowCatalog {
    entries: RwLock<HashMap<String, BTreeMap<u32, Workflow>>>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow under its own name and version. Re-registering
    /// the same (name, version) replaces the previous program.
    pub fn register(&self, workflow: Workflow) {
        let mut entries = self.entries.write();
        entries
            .entry(workflow.name().to_string())
            .or_default()
            .insert(workflow.version(), workflow);
    }

    /// Latest version of a workflow
    pub fn get(&self, name: &str) -> Result<Workflow, EngineError> {
        let entries = self.entries.read();
        entries
            .get(name)
            .and_then(|versions| versions.values().next_back().cloned())
            .ok_or_else(|| EngineError::WorkflowNotFound(name.to_string()))
    }

    /// Specific version of a workflow
    pub fn get_version(&self, name: &str, version: u32) -> Result<Workflow, EngineError> {
        let entries = self.entries.read();
        entries
            .get(name)
            .and_then(|versions| versions.get(&version).cloned())
            .ok_or_else(|| EngineError::WorkflowNotFound(format!("{name}@{version}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// All registered workflow names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl fmt::Debug for WorkflowCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowCatalog")
            .field("workflows", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn workflow(name: &str, version: u32) -> Workflow {
        Workflow::builder(name)
            .version(version)
            .build(move |_ctx| async move { Ok(Value::Null) })
    }

    #[test]
    fn test_register_and_get() {
        let catalog = WorkflowCatalog::new();
        catalog.register(workflow("hello_world", 1));

        assert!(catalog.contains("hello_world"));
        assert!(!catalog.contains("unknown"));
        assert_eq!(catalog.get("hello_world").unwrap().name(), "hello_world");
    }

    #[test]
    fn test_unknown_workflow() {
        let catalog = WorkflowCatalog::new();
        let result = catalog.get("unknown");
        assert!(matches!(result, Err(EngineError::WorkflowNotFound(_))));
    }

    #[test]
    fn test_latest_version_wins() {
        let catalog = WorkflowCatalog::new();
        catalog.register(workflow("w", 1));
        catalog.register(workflow("w", 3));
        catalog.register(workflow("w", 2));

        assert_eq!(catalog.get("w").unwrap().version(), 3);
        assert_eq!(catalog.get_version("w", 1).unwrap().version(), 1);
        assert!(catalog.get_version("w", 4).is_err());
    }

    #[test]
    fn test_names_sorted() {
        let catalog = WorkflowCatalog::new();
        catalog.register(workflow("b", 1));
        catalog.register(workflow("a", 1));

        assert_eq!(catalog.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_reregister_replaces() {
        let catalog = WorkflowCatalog::new();
        catalog.register(Workflow::new("w", |_ctx| async { Ok(json!(1)) }));
        catalog.register(Workflow::new("w", |_ctx| async { Ok(json!(2)) }));
        assert_eq!(catalog.len(), 1);
    }
}
