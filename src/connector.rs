//! The materialisation seam between the engine and a storage backend.
//!
//! The engine only ever touches a backend through [`Connector`]; operations
//! are assumed synchronous and atomic at the statement level. Node outputs
//! materialise under the node's canonical (upper-cased) name, and the
//! engine guarantees distinct names, so a backend only has to make writes
//! to *distinct* tables safe under concurrency.

use crate::{relational::Table, ArcStr, Datum, Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

pub trait Connector: Send + Sync {
    /// Write a table under `name`. Refuses to replace an existing table
    /// unless `overwrite` is set. Returns the stored table.
    fn create_table(&self, table: &Table, name: &str, overwrite: bool) -> Result<Table>;

    fn get_dest_table(&self, name: &str) -> Result<Table>;

    fn list_tables(&self) -> Vec<String>;

    fn drop_table(&self, name: &str) -> Result<()>;
}

/// The in-process backend: a named map of materialised tables.
///
/// Also serves as the dedicated lightweight backend for the node-state
/// store used by lazy execution.
#[derive(Default)]
pub struct MemoryConnector {
    tables: Mutex<BTreeMap<String, Table>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connector for MemoryConnector {
    fn create_table(&self, table: &Table, name: &str, overwrite: bool) -> Result<Table> {
        let mut tables = self.tables.lock();
        if tables.contains_key(name) && !overwrite {
            return Err(Error::config(format!(
                "table '{name}' already exists (pass overwrite to replace it)"
            )));
        }
        tables.insert(name.to_string(), table.clone());
        Ok(table.clone())
    }

    fn get_dest_table(&self, name: &str) -> Result<Table> {
        self.tables
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::config(format!("no table named '{name}' in backend")))
    }

    fn list_tables(&self) -> Vec<String> {
        self.tables.lock().keys().cloned().collect()
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        match self.tables.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::config(format!("no table named '{name}' to drop"))),
        }
    }
}

/// Name of the table holding per-node execution state.
pub const NODE_STATES_TABLE_NAME: &str = "__COHORT_META__NODE_STATES";

const NODE_NAME: &str = "NODE_NAME";
const LAST_HASH: &str = "LAST_HASH";
const NODE_PARAMS: &str = "NODE_PARAMS";

/// Stores `(node name, hash of last successful run, serialised parameters)`
/// in a single small table on a dedicated backend. Consulted by lazy
/// execution: a node whose current hash equals its stored hash adopts the
/// materialised table instead of recomputing.
///
/// Access is single-process; nothing coordinates multiple processes against
/// the same store.
pub struct NodeStateStore {
    backend: Arc<dyn Connector>,
}

impl NodeStateStore {
    pub fn new() -> Self {
        Self::with_backend(Arc::new(MemoryConnector::new()))
    }

    pub fn with_backend(backend: Arc<dyn Connector>) -> Self {
        NodeStateStore { backend }
    }

    fn table(&self) -> Option<Table> {
        self.backend.get_dest_table(NODE_STATES_TABLE_NAME).ok()
    }

    /// Hash recorded for the node's last successful run, if any.
    pub fn last_hash(&self, node_name: &str) -> Option<String> {
        let table = self.table()?;
        let name_idx = table.column_index(NODE_NAME)?;
        let hash_idx = table.column_index(LAST_HASH)?;
        table.rows().iter().find_map(|row| {
            (row[name_idx].as_str() == Some(node_name))
                .then(|| row[hash_idx].as_str().map(str::to_string))
                .flatten()
        })
    }

    /// Record the hash and parameters of a successful run, replacing any
    /// previous row for the node.
    pub fn update(&self, node_name: &str, hash: &str, params_json: &str) -> Result<()> {
        let mut builder = Table::builder([NODE_NAME, LAST_HASH, NODE_PARAMS]);
        if let Some(existing) = self.table() {
            let name_idx = existing.require_column(NODE_NAME, "node state store")?;
            for row in existing.rows() {
                if row[name_idx].as_str() != Some(node_name) {
                    builder.push(row.clone());
                }
            }
        }
        builder.push([
            Datum::from(node_name),
            Datum::from(hash),
            Datum::from(params_json),
        ]);
        self.backend
            .create_table(&builder.build()?, NODE_STATES_TABLE_NAME, true)?;
        Ok(())
    }
}

impl Default for NodeStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Upper-cased node name; doubles as the materialised table name.
pub fn canonical_name(name: &str) -> ArcStr {
    name.to_uppercase().into()
}
