use thiserror::Error;

/// Every failure mode the engine can surface.
///
/// All variants are fatal to the operation that raised them; there are no
/// engine-level retries. Lazy execution re-runs a node only when its hash
/// changes, never in response to an error.
#[derive(Debug, Error)]
pub enum Error {
    /// A required column is absent from a table at filter time.
    #[error("schema error: column '{column}' missing ({context})")]
    Schema { column: String, context: String },

    /// Invalid combination of execution options or node parameters.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The dependency graph contains a cycle.
    #[error("circular dependency detected in the compute graph (unresolved nodes: {0:?})")]
    Cycle(Vec<String>),

    /// A codelist file reference could not be resolved.
    #[error("could not resolve codelist '{name}': {reason}")]
    CodelistResolution { name: String, reason: String },

    /// A node's computation failed; carries the node name.
    #[error("error executing node '{node}': {source}")]
    Computation {
        node: String,
        #[source]
        source: Box<Error>,
    },

    /// A referenced node (e.g. an anchor phenotype) is not in the workflow.
    #[error("node '{parent}' depends on '{child}' which is not in the graph")]
    Lookup { parent: String, child: String },
}

impl Error {
    pub fn schema(column: impl Into<String>, context: impl Into<String>) -> Self {
        Error::Schema {
            column: column.into(),
            context: context.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    /// Wrap an error with the name of the node it surfaced from. Already
    /// attributed errors pass through unchanged so the innermost node wins.
    pub fn in_node(self, node: &str) -> Self {
        match self {
            already @ Error::Computation { .. } => already,
            source => Error::Computation {
                node: node.to_string(),
                source: Box::new(source),
            },
        }
    }
}
