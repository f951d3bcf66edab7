//! The phenotype catalogue. Every phenotype is a compute node producing a
//! `PhenotypeTable`: `PERSON_ID`, `BOOLEAN` (always true — a subject's
//! absence encodes false), `EVENT_DATE` and `VALUE`.

mod age;
mod arithmetic;
mod bin;
mod categorical;
mod codelist_phenotype;
mod coverage;
mod encounter;
mod event_count;
mod logic;
mod measurement;
mod time_range;
mod time_shift;
mod user_defined;

pub use age::AgePhenotype;
pub use arithmetic::{
    arith_add, arith_div, arith_mul, arith_pow, arith_sub, score_sum, ArithmeticExpr,
    ArithmeticPhenotype, ScorePhenotype,
};
pub use bin::{BinPhenotype, MappingTarget};
pub use categorical::{CategoricalPhenotype, SexPhenotype};
pub use codelist_phenotype::CodelistPhenotype;
pub use coverage::ContinuousCoveragePhenotype;
pub use encounter::WithinSameEncounterPhenotype;
pub use event_count::{ComponentDateSelect, EventCountPhenotype};
pub use logic::{logic_and, logic_not, logic_or, LogicExpr, LogicPhenotype, LogicReturnDate};
pub use measurement::MeasurementPhenotype;
pub use time_range::{
    TimeRangeCountPhenotype, TimeRangeDayCountPhenotype, TimeRangeDaysToNextRange,
    TimeRangePhenotype,
};
pub use time_shift::TimeShiftPhenotype;
pub use user_defined::UserDefinedPhenotype;

use crate::{
    aggregators::DateAggregator,
    columns,
    filters::RelativeTimeRangeFilter,
    node::{canonical_name, ComputeNode},
    relational::{col, lit, Datum, Join, Table},
    Error, Result, TableMap,
};
use std::sync::Arc;

/// Temporal reduction applied to a phenotype's qualifying rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnDate {
    #[default]
    First,
    Last,
    Nearest,
    All,
}

impl ReturnDate {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnDate::First => "first",
            ReturnDate::Last => "last",
            ReturnDate::Nearest => "nearest",
            ReturnDate::All => "all",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "first" => ReturnDate::First,
            "last" => ReturnDate::Last,
            "nearest" => ReturnDate::Nearest,
            "all" => ReturnDate::All,
            other => return Err(Error::config(format!("unknown return_date '{other}'"))),
        })
    }
}

/// Look up a domain's input table.
pub(crate) fn domain_table<'a>(tables: &'a TableMap, domain: &str) -> Result<&'a Table> {
    tables
        .get(domain)
        .ok_or_else(|| Error::config(format!("no input table for domain '{domain}'")))
}

/// The anchor phenotype's output table out of the table mapping, when the
/// filter names one.
pub(crate) fn anchor_output<'a>(
    rtr: &RelativeTimeRangeFilter,
    tables: &'a TableMap,
) -> Result<Option<&'a Table>> {
    match &rtr.anchor_phenotype {
        None => Ok(None),
        Some(anchor) => {
            let name = canonical_name(&**anchor);
            tables.get(&name).map(Some).ok_or(Error::Lookup {
                parent: "relative time range filter".into(),
                child: name.to_string(),
            })
        }
    }
}

/// Project to the canonical phenotype columns, setting `BOOLEAN` true on
/// every row and adding null `EVENT_DATE`/`VALUE` when absent.
pub(crate) fn select_phenotype_columns(table: &Table) -> Result<Table> {
    let mut table = table.clone();
    for column in [columns::EVENT_DATE, columns::VALUE] {
        if !table.has_column(column) {
            table = table.mutate(column, &lit(Datum::Null))?;
        }
    }
    table = table.mutate(columns::BOOLEAN, &lit(true))?;
    table.select(&columns::PHENOTYPE_COLUMNS)
}

/// Reduce qualifying rows per subject according to `return_date`.
///
/// `keep_value` preserves the `VALUE` of the selected row (measurements);
/// otherwise the reduction nulls it. `Nearest` needs a per-row anchor:
/// either the supplied anchor table or an `INDEX_DATE` column — with
/// neither, the return date is ambiguous and refused.
pub(crate) fn reduce_dates(
    table: &Table,
    return_date: ReturnDate,
    keep_value: bool,
    anchor_table: Option<&Table>,
) -> Result<Table> {
    let aggregator = match return_date {
        ReturnDate::All => return Ok(table.clone()),
        ReturnDate::First => DateAggregator::first(),
        ReturnDate::Last => DateAggregator::last(),
        ReturnDate::Nearest => {
            let (table, anchor_col) = match anchor_table {
                Some(anchor) => {
                    let anchor = anchor
                        .select(&[columns::PERSON_ID, columns::EVENT_DATE])?
                        .rename(columns::EVENT_DATE, "__NEAREST_ANCHOR")?
                        .distinct();
                    (
                        table.join(&anchor, &[columns::PERSON_ID], Join::Inner)?,
                        "__NEAREST_ANCHOR",
                    )
                }
                None if table.has_column(columns::INDEX_DATE) => {
                    (table.clone(), columns::INDEX_DATE)
                }
                None => {
                    return Err(Error::config(
                        "return_date 'nearest' is ambiguous without an anchor",
                    ))
                }
            };
            let aggregator = if keep_value {
                DateAggregator::nearest(anchor_col)
            } else {
                DateAggregator::nearest(anchor_col).with_reduce()
            };
            let out = aggregator.aggregate(&table)?;
            return if out.has_column("__NEAREST_ANCHOR") {
                out.drop_columns(&["__NEAREST_ANCHOR"])
            } else {
                Ok(out)
            };
        }
    };
    let aggregator = if keep_value {
        aggregator
    } else {
        aggregator.with_reduce()
    };
    aggregator.aggregate(table)
}

/// The anchors referenced by a list of relative time range filters, for a
/// phenotype's child list (one entry per distinct name).
pub(crate) fn anchor_children(
    filters: &[RelativeTimeRangeFilter],
) -> Vec<Arc<dyn ComputeNode>> {
    let mut out: Vec<Arc<dyn ComputeNode>> = Vec::new();
    for rtr in filters {
        if let Some(anchor) = &rtr.anchor_phenotype {
            let name = canonical_name(&**anchor);
            if !out.iter().any(|c| canonical_name(&**c) == name) {
                out.push(anchor.clone());
            }
        }
    }
    out
}

/// Distinct `(PERSON_ID, EVENT_DATE)` pairs of a phenotype output, with
/// boolean-true rows only.
pub(crate) fn person_dates(table: &Table) -> Result<Table> {
    Ok(table
        .filter(&col(columns::BOOLEAN).eq(lit(true)))?
        .select(&[columns::PERSON_ID, columns::EVENT_DATE])?
        .distinct())
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use chrono::NaiveDate;

    pub(crate) fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Sorted person ids of a phenotype table.
    pub(crate) fn persons(table: &Table) -> Vec<String> {
        let mut out: Vec<String> = table
            .column_values(columns::PERSON_ID)
            .unwrap()
            .into_iter()
            .map(|d| d.to_string())
            .collect();
        out.sort();
        out
    }

    /// Execute a node against input tables with default options.
    pub(crate) fn run(node: &dyn ComputeNode, tables: &TableMap) -> Table {
        crate::node::execute(node, tables, &crate::node::ExecutionContext::new()).unwrap()
    }
}
