//! The execution primitive. Every phenotype (and the data-period filter)
//! is a [`ComputeNode`]: a named, hashable unit of computation producing a
//! single table from the mapping of input tables.

use crate::{
    connector::{canonical_name as canonical, Connector, NodeStateStore},
    serialize, ArcStr, Error, Result, Table, TableMap,
};
use serde_json::Value as Json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{event, Level};

/// A unit of computation.
///
/// Implementors declare their dependencies through [`children`]; the
/// engine guarantees every child's output is present in the table mapping
/// (under the child's canonical name) before [`execute_plan`] runs.
/// `execute_plan` must be pure: its output may depend only on `tables` and
/// the node's own parameters, all of which are captured by [`to_dict`] —
/// that dictionary is the node's identity for hashing and lazy execution.
///
/// [`children`]: ComputeNode::children
/// [`execute_plan`]: ComputeNode::execute_plan
/// [`to_dict`]: ComputeNode::to_dict
pub trait ComputeNode: Send + Sync {
    /// Unique (case-insensitively) within any workflow this node joins.
    fn name(&self) -> &str;

    /// Nodes that must execute before this one.
    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        Vec::new()
    }

    /// Structural serialisation: `{"class_name": …, parameters…}`,
    /// recursing into child nodes and filters. Excludes any output table.
    fn to_dict(&self) -> Json;

    /// The computation itself.
    fn execute_plan(&self, tables: &TableMap) -> Result<Table>;

    /// The node's qualifying *source rows* before column projection and
    /// temporal reduction, for consumers that need source columns (e.g.
    /// encounter ids). Nodes without a meaningful row source return their
    /// ordinary output.
    fn execute_rows(&self, tables: &TableMap) -> Result<Table> {
        self.execute_plan(tables)
    }
}

/// Upper-cased node name; also the name the node materialises under.
pub fn canonical_name(node: &dyn ComputeNode) -> ArcStr {
    canonical(node.name())
}

/// MD5 over the canonical JSON (sorted keys, stable date encoding) of the
/// node's dictionary. The sole cache key for lazy execution.
pub fn node_hash(node: &dyn ComputeNode) -> String {
    serialize::hash_dict(&node.to_dict())
}

/// Everything `execute` needs besides the input tables. Replaces global
/// state: the connector, the node-state store and the scheduling options
/// travel together.
#[derive(Clone)]
pub struct ExecutionContext {
    pub connector: Option<Arc<dyn Connector>>,
    pub meta_store: Arc<NodeStateStore>,
    pub overwrite: bool,
    pub lazy: bool,
    /// Worker count for workflow execution; 1 means sequential.
    pub n_threads: usize,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        ExecutionContext {
            connector: None,
            meta_store: Arc::new(NodeStateStore::new()),
            overwrite: false,
            lazy: false,
            n_threads: 4,
        }
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }

    /// Enable hash-keyed lazy re-execution. Requires a connector and
    /// overwrite; validated before any node runs.
    pub fn with_lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads.max(1);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.lazy && !self.overwrite {
            return Err(Error::config("lazy execution requires overwrite"));
        }
        if self.lazy && self.connector.is_none() {
            return Err(Error::config(
                "lazy execution requires a connector to cache materialised tables",
            ));
        }
        Ok(())
    }
}

/// Execute a node and (recursively, children first) everything it depends
/// on. Child outputs are added to the table mapping under their canonical
/// names before the parent runs.
pub fn execute(node: &dyn ComputeNode, tables: &TableMap, ctx: &ExecutionContext) -> Result<Table> {
    ctx.validate()?;
    let mut tables = tables.clone();
    execute_recursive(node, &mut tables, ctx)
}

fn execute_recursive(
    node: &dyn ComputeNode,
    tables: &mut TableMap,
    ctx: &ExecutionContext,
) -> Result<Table> {
    check_children(node)?;
    for child in node.children() {
        let key = canonical_name(&*child);
        if tables.contains_key(&key) {
            continue;
        }
        let output = execute_recursive(&*child, tables, ctx)?;
        tables.insert(key, output);
    }
    let output = execute_single(node, tables, ctx)?;
    tables.insert(canonical_name(node), output.clone());
    Ok(output)
}

/// Run one node whose children have already been executed (their outputs
/// present in `tables`), honouring lazy execution and materialisation.
pub(crate) fn execute_single(
    node: &dyn ComputeNode,
    tables: &TableMap,
    ctx: &ExecutionContext,
) -> Result<Table> {
    let name = canonical_name(node);
    if ctx.lazy {
        let connector = ctx
            .connector
            .as_ref()
            .expect("validated: lazy execution has a connector");
        let current = node_hash(node);
        let cached = ctx.meta_store.last_hash(&name);
        if cached.as_deref() == Some(&*current) && connector.list_tables().contains(&name.to_string())
        {
            event!(Level::INFO, node = %name, "unchanged since last computation, skipping");
            return connector.get_dest_table(&name);
        }
        event!(Level::INFO, node = %name, "not yet computed or changed, recomputing");
        let output = node.execute_plan(tables).map_err(|e| e.in_node(&name))?;
        connector.create_table(&output, &name, ctx.overwrite)?;
        let params = serialize::canonical_json(&node.to_dict());
        ctx.meta_store.update(&name, &current, &params)?;
        Ok(output)
    } else {
        event!(Level::DEBUG, node = %name, "executing");
        let output = node.execute_plan(tables).map_err(|e| e.in_node(&name))?;
        if let Some(connector) = &ctx.connector {
            connector.create_table(&output, &name, ctx.overwrite)?;
        }
        Ok(output)
    }
}

/// The child constraints: every child distinct by canonical name, and none
/// sharing the node's own name.
pub(crate) fn check_children(node: &dyn ComputeNode) -> Result<()> {
    let own = canonical_name(node);
    let mut seen = BTreeSet::new();
    for child in node.children() {
        let name = canonical_name(&*child);
        if name == own {
            return Err(Error::config(format!(
                "node '{own}' has a child with its own name"
            )));
        }
        if !seen.insert(name.clone()) {
            return Err(Error::config(format!(
                "duplicate node name found: '{name}' appears twice among children of '{own}'"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{connector::MemoryConnector, Datum};
    use parking_lot::Mutex;
    use serde_json::json;

    /// A node returning a constant table, counting its executions.
    pub(crate) struct ConstantNode {
        pub name: String,
        pub value: i64,
        pub children: Vec<Arc<dyn ComputeNode>>,
        pub executions: Mutex<usize>,
    }

    impl ConstantNode {
        pub(crate) fn new(name: &str, value: i64) -> Self {
            ConstantNode {
                name: name.to_string(),
                value,
                children: Vec::new(),
                executions: Mutex::new(0),
            }
        }

        pub(crate) fn with_children(mut self, children: Vec<Arc<dyn ComputeNode>>) -> Self {
            self.children = children;
            self
        }
    }

    impl ComputeNode for ConstantNode {
        fn name(&self) -> &str {
            &self.name
        }

        fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
            self.children.clone()
        }

        fn to_dict(&self) -> Json {
            json!({
                "class_name": "ConstantNode",
                "name": &self.name,
                "value": self.value,
                "children": self.children.iter().map(|c| c.to_dict()).collect::<Vec<_>>(),
            })
        }

        fn execute_plan(&self, _tables: &TableMap) -> Result<Table> {
            *self.executions.lock() += 1;
            Table::builder(["PERSON_ID", "VALUE"])
                .row([Datum::from("P1"), Datum::from(self.value)])
                .build()
        }
    }

    #[test]
    fn hash_is_stable_and_parameter_sensitive() {
        let a = ConstantNode::new("a", 1);
        let a2 = ConstantNode::new("a", 1);
        let b = ConstantNode::new("a", 2);
        assert_eq!(node_hash(&a), node_hash(&a2));
        assert_ne!(node_hash(&a), node_hash(&b));
    }

    #[test]
    fn lazy_without_overwrite_or_connector_is_configuration_error() {
        let node = ConstantNode::new("a", 1);
        let tables = TableMap::new();
        let ctx = ExecutionContext::new().with_lazy();
        assert!(matches!(
            execute(&node, &tables, &ctx).unwrap_err(),
            Error::Configuration(_)
        ));
        let ctx = ExecutionContext::new().with_lazy().with_overwrite();
        assert!(matches!(
            execute(&node, &tables, &ctx).unwrap_err(),
            Error::Configuration(_)
        ));
    }

    #[test]
    fn lazy_skips_unchanged_nodes() {
        let node = ConstantNode::new("a", 1);
        let tables = TableMap::new();
        let ctx = ExecutionContext::new()
            .with_connector(Arc::new(MemoryConnector::new()))
            .with_overwrite()
            .with_lazy();
        execute(&node, &tables, &ctx).unwrap();
        assert_eq!(*node.executions.lock(), 1);
        execute(&node, &tables, &ctx).unwrap();
        assert_eq!(*node.executions.lock(), 1); // adopted the cached table
    }

    #[test]
    fn children_execute_first_and_feed_parents() {
        struct ReadsChild {
            child: Arc<dyn ComputeNode>,
        }
        impl ComputeNode for ReadsChild {
            fn name(&self) -> &str {
                "parent"
            }
            fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
                vec![self.child.clone()]
            }
            fn to_dict(&self) -> Json {
                json!({"class_name": "ReadsChild", "name": "parent", "child": self.child.to_dict()})
            }
            fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
                // child output must be present under its canonical name
                Ok(tables.get("CHILD").expect("child executed first").clone())
            }
        }
        let node = ReadsChild {
            child: Arc::new(ConstantNode::new("child", 7)),
        };
        let out = execute(&node, &TableMap::new(), &ExecutionContext::new()).unwrap();
        assert_eq!(out.rows()[0][1], Datum::Int(7));
    }

    #[test]
    fn duplicate_child_names_are_rejected() {
        let node = ConstantNode::new("p", 0).with_children(vec![
            Arc::new(ConstantNode::new("x", 1)),
            Arc::new(ConstantNode::new("X", 2)),
        ]);
        assert!(matches!(
            execute(&node, &TableMap::new(), &ExecutionContext::new()).unwrap_err(),
            Error::Configuration(_)
        ));
    }
}
