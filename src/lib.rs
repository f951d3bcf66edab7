//! A computation engine for phenotypes and cohorts over relational
//! healthcare data.
//!
//! A *phenotype* is a parameterised query which, given a mapping of domain
//! tables, produces a per-subject result: who qualifies, on what date, with
//! what value. A [`Cohort`] composes phenotypes (entry criterion,
//! inclusions, exclusions, baseline characteristics, outcomes) into a
//! reproducible patient-selection pipeline with attrition accounting.
//!
//! The engine is backend-agnostic: it computes against the in-memory
//! [`Table`](relational::Table) representation and materialises through the
//! [`Connector`](connector::Connector) seam. Every phenotype is a
//! [`ComputeNode`](node::ComputeNode); a [`Workflow`](workflow::Workflow)
//! schedules nodes over a worker pool in dependency order, with hash-based
//! lazy re-execution when a connector is available.

pub mod aggregators;
pub mod codelist;
pub mod cohort;
pub mod connector;
pub mod data_period;
mod error;
pub mod filters;
pub mod node;
pub mod phenotypes;
pub mod relational;
pub mod serialize;
pub mod workflow;

use std::sync::Arc;

pub use crate::{
    codelist::Codelist,
    cohort::Cohort,
    connector::{Connector, MemoryConnector},
    error::Error,
    node::{ComputeNode, ExecutionContext},
    relational::{Datum, Table},
    workflow::Workflow,
};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Canonical column names recognised by the engine.
///
/// Host applications project their source schemas onto these names before
/// handing tables to the engine; the engine never guesses from substrings.
pub mod columns {
    pub const PERSON_ID: &str = "PERSON_ID";
    pub const BOOLEAN: &str = "BOOLEAN";
    pub const EVENT_DATE: &str = "EVENT_DATE";
    pub const VALUE: &str = "VALUE";
    pub const CODE: &str = "CODE";
    pub const CODE_TYPE: &str = "CODE_TYPE";
    pub const START_DATE: &str = "START_DATE";
    pub const END_DATE: &str = "END_DATE";
    pub const INDEX_DATE: &str = "INDEX_DATE";
    pub const DATE_OF_BIRTH: &str = "DATE_OF_BIRTH";
    pub const YEAR_OF_BIRTH: &str = "YEAR_OF_BIRTH";
    pub const MONTH_OF_BIRTH: &str = "MONTH_OF_BIRTH";
    pub const DAY_OF_BIRTH: &str = "DAY_OF_BIRTH";
    pub const DATE_OF_DEATH: &str = "DATE_OF_DEATH";
    pub const SEX: &str = "SEX";

    /// The four columns every phenotype output carries, in order.
    pub const PHENOTYPE_COLUMNS: [&str; 4] = [PERSON_ID, BOOLEAN, EVENT_DATE, VALUE];
}

/// The full set of tables visible to a node: input domains plus the outputs
/// of already-executed nodes under their canonical (upper-cased) names.
pub type TableMap = std::collections::BTreeMap<ArcStr, Table>;
