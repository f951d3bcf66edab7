use super::select_phenotype_columns;
use crate::{node::ComputeNode, ArcStr, Error, Result, Table, TableMap};
use serde_json::{json, Value as Json};
use std::sync::Arc;

type PhenotypeFn = dyn Fn(&TableMap) -> Result<Table> + Send + Sync;

/// Escape hatch: the host supplies a pure function from the table mapping
/// to a phenotype table.
///
/// The function itself cannot be serialised; its identity for hashing is
/// the declared `(name, version)` pair — bump the version whenever the
/// function's behaviour changes, or lazy execution will keep serving the
/// old output.
pub struct UserDefinedPhenotype {
    name: ArcStr,
    version: u64,
    function: Arc<PhenotypeFn>,
}

impl UserDefinedPhenotype {
    pub fn new<F>(name: impl Into<ArcStr>, version: u64, function: F) -> Self
    where
        F: Fn(&TableMap) -> Result<Table> + Send + Sync + 'static,
    {
        UserDefinedPhenotype {
            name: name.into(),
            version,
            function: Arc::new(function),
        }
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "UserDefinedPhenotype")?;
        Err(Error::config(format!(
            "user-defined phenotype '{name}' cannot be reconstructed from a dictionary; \
             re-register its function with the host"
        )))
    }
}

impl ComputeNode for UserDefinedPhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "UserDefinedPhenotype",
            "name": &*self.name,
            "function": { "name": &*self.name, "version": self.version },
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let out = (self.function)(tables)?;
        select_phenotype_columns(&out)
    }
}
