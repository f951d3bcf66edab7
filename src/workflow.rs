//! Scheduling of compute nodes in dependency order: topological sort with
//! cycle detection, and a worker pool dispatching from a ready queue as
//! in-degrees reach zero. A sequential mode (one thread) executes in
//! topological order and yields identical results.

use crate::{
    node::{self, canonical_name, node_hash, ComputeNode, ExecutionContext},
    ArcStr, Error, Result, Table, TableMap,
};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{event, Level};

/// A set of compute nodes executed together. Nodes are keyed by canonical
/// name; dependency edges run from each node to the children that are
/// present in the graph.
pub struct Workflow {
    nodes: BTreeMap<ArcStr, Arc<dyn ComputeNode>>,
    dependency_graph: BTreeMap<ArcStr, BTreeSet<ArcStr>>,
    reverse_graph: BTreeMap<ArcStr, BTreeSet<ArcStr>>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("dependency_graph", &self.dependency_graph)
            .field("reverse_graph", &self.reverse_graph)
            .finish()
    }
}

impl Workflow {
    /// Build from an explicit node list. References to nodes outside the
    /// list are reported by [`Workflow::validate`] (and by `execute`), not
    /// resolved automatically.
    pub fn new(nodes: Vec<Arc<dyn ComputeNode>>) -> Result<Self> {
        let mut map: BTreeMap<ArcStr, Arc<dyn ComputeNode>> = BTreeMap::new();
        for node in nodes {
            insert_node(&mut map, node)?;
        }
        Ok(Self::from_map(map))
    }

    /// Build from root nodes, pulling in every transitive child.
    pub fn with_dependencies(roots: Vec<Arc<dyn ComputeNode>>) -> Result<Self> {
        let mut map: BTreeMap<ArcStr, Arc<dyn ComputeNode>> = BTreeMap::new();
        let mut queue: VecDeque<Arc<dyn ComputeNode>> = roots.into();
        while let Some(node) = queue.pop_front() {
            let name = canonical_name(&*node);
            let known = map.contains_key(&name);
            insert_node(&mut map, node.clone())?;
            if !known {
                for child in node.children() {
                    queue.push_back(child);
                }
            }
        }
        Ok(Self::from_map(map))
    }

    fn from_map(map: BTreeMap<ArcStr, Arc<dyn ComputeNode>>) -> Self {
        let mut dependency_graph: BTreeMap<ArcStr, BTreeSet<ArcStr>> = BTreeMap::new();
        let mut reverse_graph: BTreeMap<ArcStr, BTreeSet<ArcStr>> = BTreeMap::new();
        for (name, node) in &map {
            let deps: BTreeSet<ArcStr> = node
                .children()
                .iter()
                .map(|c| canonical_name(&**c))
                .filter(|c| map.contains_key(c))
                .collect();
            for dep in &deps {
                reverse_graph.entry(dep.clone()).or_default().insert(name.clone());
            }
            dependency_graph.insert(name.clone(), deps);
        }
        Workflow {
            nodes: map,
            dependency_graph,
            reverse_graph,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, name: &str) -> Option<&Arc<dyn ComputeNode>> {
        self.nodes.get(&canonical_name_str(name))
    }

    /// Every referenced child must be present in the graph, and each
    /// node's own child list must be well formed.
    pub fn validate(&self) -> Result<()> {
        for (name, node) in &self.nodes {
            node::check_children(&**node)?;
            for child in node.children() {
                let child_name = canonical_name(&*child);
                if !self.nodes.contains_key(&child_name) {
                    return Err(Error::Lookup {
                        parent: name.to_string(),
                        child: child_name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Dependency order (children before parents), deterministic given the
    /// graph: ready nodes are consumed in insertion order.
    pub fn execution_plan(&self) -> Result<Vec<ArcStr>> {
        let mut in_degree: BTreeMap<&ArcStr, usize> = BTreeMap::new();
        for (name, deps) in &self.dependency_graph {
            in_degree.insert(name, deps.len());
        }
        let mut queue: VecDeque<&ArcStr> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(current) = queue.pop_front() {
            order.push(current.clone());
            if let Some(parents) = self.reverse_graph.get(current) {
                for parent in parents {
                    let degree = in_degree.get_mut(parent).expect("all nodes in in_degree");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(parent);
                    }
                }
            }
        }
        if order.len() != self.nodes.len() {
            let stuck: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(n, _)| n.to_string())
                .collect();
            return Err(Error::Cycle(stuck));
        }
        Ok(order)
    }

    /// Execute every node, children before parents. Nodes whose canonical
    /// name already appears in `tables` are adopted as completed with that
    /// table as their output (this is how a cohort feeds the entry
    /// criterion's result to the later stages).
    ///
    /// Returns the output of every node, keyed by canonical name.
    pub fn execute(
        &self,
        tables: &TableMap,
        ctx: &ExecutionContext,
    ) -> Result<BTreeMap<ArcStr, Table>> {
        ctx.validate()?;
        self.validate()?;
        let plan = self.execution_plan()?;
        if ctx.n_threads <= 1 {
            self.execute_sequential(&plan, tables, ctx)
        } else {
            self.execute_parallel(tables, ctx)
        }
    }

    fn execute_sequential(
        &self,
        plan: &[ArcStr],
        tables: &TableMap,
        ctx: &ExecutionContext,
    ) -> Result<BTreeMap<ArcStr, Table>> {
        let mut tables = tables.clone();
        let mut results = BTreeMap::new();
        for name in plan {
            if let Some(preset) = tables.get(name) {
                event!(Level::DEBUG, node = %name, "using preset table");
                results.insert(name.clone(), preset.clone());
                continue;
            }
            let node = &self.nodes[name];
            event!(Level::INFO, node = %name, "sequential execution");
            let output = node::execute_single(&**node, &tables, ctx)?;
            tables.insert(name.clone(), output.clone());
            results.insert(name.clone(), output);
        }
        Ok(results)
    }

    fn execute_parallel(
        &self,
        tables: &TableMap,
        ctx: &ExecutionContext,
    ) -> Result<BTreeMap<ArcStr, Table>> {
        struct State {
            in_degree: BTreeMap<ArcStr, usize>,
            ready: VecDeque<ArcStr>,
            completed: BTreeSet<ArcStr>,
            results: BTreeMap<ArcStr, Table>,
            tables: TableMap,
            finished: usize,
            error: Option<Error>,
        }

        let total = self.nodes.len();
        let mut state = State {
            in_degree: self
                .dependency_graph
                .iter()
                .map(|(n, deps)| (n.clone(), deps.len()))
                .collect(),
            ready: VecDeque::new(),
            completed: BTreeSet::new(),
            results: BTreeMap::new(),
            tables: tables.clone(),
            finished: 0,
            error: None,
        };

        // Nodes with a preset table are completed up front.
        let preset: Vec<ArcStr> = self
            .nodes
            .keys()
            .filter(|n| tables.contains_key(*n))
            .cloned()
            .collect();
        for name in preset {
            state.completed.insert(name.clone());
            state.results.insert(name.clone(), tables[&name].clone());
            state.finished += 1;
            self.release_parents(&name, &mut state.in_degree, &state.completed, &mut state.ready);
        }
        for (name, degree) in state.in_degree.clone() {
            if degree == 0 && !state.completed.contains(&name) && !state.ready.contains(&name) {
                state.ready.push_back(name);
            }
        }

        let shared = Mutex::new(state);
        let work_available = Condvar::new();
        let workers = ctx.n_threads.min(total).max(1);

        std::thread::scope(|scope| {
            for worker in 0..workers {
                let shared = &shared;
                let work_available = &work_available;
                let this = &*self;
                scope.spawn(move || loop {
                    let (name, local_tables) = {
                        let mut state = shared.lock();
                        loop {
                            if state.error.is_some() || state.finished >= total {
                                return;
                            }
                            if let Some(name) = state.ready.pop_front() {
                                break (name, state.tables.clone());
                            }
                            work_available.wait(&mut state);
                        }
                    };
                    event!(Level::INFO, node = %name, worker, "executing node");
                    let node = &this.nodes[&name];
                    let outcome = node::execute_single(&**node, &local_tables, ctx);
                    let mut guard = shared.lock();
                    let state = &mut *guard;
                    state.finished += 1;
                    match outcome {
                        Ok(output) => {
                            state.completed.insert(name.clone());
                            state.results.insert(name.clone(), output.clone());
                            state.tables.insert(name.clone(), output);
                            this.release_parents(
                                &name,
                                &mut state.in_degree,
                                &state.completed,
                                &mut state.ready,
                            );
                        }
                        Err(error) => {
                            event!(Level::ERROR, node = %name, %error, "node failed");
                            // first failure wins; in-flight nodes finish,
                            // nothing new is dispatched
                            if state.error.is_none() {
                                state.error = Some(error);
                            }
                        }
                    }
                    drop(guard);
                    work_available.notify_all();
                });
            }
        });

        let state = shared.into_inner();
        match state.error {
            Some(error) => Err(error),
            None => Ok(state.results),
        }
    }

    fn release_parents(
        &self,
        name: &ArcStr,
        in_degree: &mut BTreeMap<ArcStr, usize>,
        completed: &BTreeSet<ArcStr>,
        ready: &mut VecDeque<ArcStr>,
    ) {
        let Some(parents) = self.reverse_graph.get(name) else {
            return;
        };
        for parent in parents {
            let degree = in_degree.get_mut(parent).expect("all nodes have a degree");
            *degree = degree.saturating_sub(1);
            if *degree == 0 {
                let deps_done = self.dependency_graph[parent]
                    .iter()
                    .all(|d| completed.contains(d));
                if deps_done {
                    ready.push_back(parent.clone());
                }
            }
        }
    }
}

fn canonical_name_str(name: &str) -> ArcStr {
    crate::connector::canonical_name(name)
}

fn insert_node(
    map: &mut BTreeMap<ArcStr, Arc<dyn ComputeNode>>,
    node: Arc<dyn ComputeNode>,
) -> Result<()> {
    let name = canonical_name(&*node);
    if let Some(existing) = map.get(&name) {
        if node_hash(&**existing) != node_hash(&*node) {
            return Err(Error::config(format!(
                "duplicate node name found: two different nodes are both called '{name}'"
            )));
        }
        return Ok(());
    }
    map.insert(name, node);
    Ok(())
}
