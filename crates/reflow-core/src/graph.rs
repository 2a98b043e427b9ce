//! Task graphs
//!
//! A small builder for wiring tasks into a directed graph with optional
//! conditional edges. The graph is driven by an ordinary loop: each node's
//! output becomes the input of the next node along the first matching edge,
//! until the finish point runs. Conditional edges must eventually reach the
//! finish point; the engine does not terminate cycles.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::EngineError;
use crate::scheduler::WorkflowCtx;
use crate::task::{Task, TaskArgs};

type EdgePredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

struct Edge {
    from: String,
    to: String,
    condition: Option<EdgePredicate>,
}

/// A named graph of tasks
pub struct TaskGraph {
    name: String,
    nodes: HashMap<String, Task>,
    edges: Vec<Edge>,
    entry_point: Option<String>,
    finish_point: Option<String>,
}

/// Start building a graph
pub fn graph(name: impl Into<String>) -> TaskGraph {
    TaskGraph {
        name: name.into(),
        nodes: HashMap::new(),
        edges: Vec::new(),
        entry_point: None,
        finish_point: None,
    }
}

impl TaskGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_node(mut self, id: impl Into<String>, task: Task) -> Self {
        self.nodes.insert(id.into(), task);
        self
    }

    /// Unconditional edge: always taken when `from` completes
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: None,
        });
        self
    }

    /// Edge taken only when the predicate accepts the node's output.
    /// Edges are evaluated in insertion order; the first match wins.
    pub fn add_conditional_edge<F>(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: F,
    ) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: Some(Arc::new(condition)),
        });
        self
    }

    pub fn set_entry_point(mut self, id: impl Into<String>) -> Self {
        self.entry_point = Some(id.into());
        self
    }

    pub fn set_finish_point(mut self, id: impl Into<String>) -> Self {
        self.finish_point = Some(id.into());
        self
    }

    fn validate(&self) -> Result<(&str, &str), EngineError> {
        let entry = self
            .entry_point
            .as_deref()
            .ok_or_else(|| EngineError::Execution(format!("graph {}: no entry point", self.name)))?;
        let finish = self
            .finish_point
            .as_deref()
            .ok_or_else(|| EngineError::Execution(format!("graph {}: no finish point", self.name)))?;

        for id in [entry, finish] {
            if !self.nodes.contains_key(id) {
                return Err(EngineError::Execution(format!(
                    "graph {}: unknown node '{id}'",
                    self.name
                )));
            }
        }
        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.from) || !self.nodes.contains_key(&edge.to) {
                return Err(EngineError::Execution(format!(
                    "graph {}: edge {} -> {} references unknown node",
                    self.name, edge.from, edge.to
                )));
            }
        }
        Ok((entry, finish))
    }

    /// Drive the graph from entry to finish, threading each node's output
    /// into the next node
    pub async fn run(&self, ctx: &WorkflowCtx, input: Value) -> Result<Value, EngineError> {
        let (entry, finish) = self.validate()?;

        let mut current = entry.to_string();
        let mut value = input;

        loop {
            let task = &self.nodes[&current];
            value = ctx.task(task, TaskArgs::positional([value])).await?;

            if current == finish {
                return Ok(value);
            }

            let next = self
                .edges
                .iter()
                .filter(|e| e.from == current)
                .find(|e| match &e.condition {
                    Some(condition) => condition(&value),
                    None => true,
                })
                .map(|e| e.to.clone())
                .ok_or_else(|| {
                    EngineError::Execution(format!(
                        "graph {}: no edge out of '{current}' matched",
                        self.name
                    ))
                })?;
            current = next;
        }
    }
}
