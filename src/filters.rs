//! Filter primitives: stateless, pure table→table transforms parameterised
//! by thresholds, codelists, column names or an anchor phenotype. Every
//! filter is total and idempotent; re-applying one is a no-op.

mod categorical_filter;
mod codelist_filter;
mod date_filter;
mod relative_time_range;
mod value;
mod value_filter;

pub use categorical_filter::{filter_and, filter_not, filter_or, CategoricalFilter};
pub use codelist_filter::CodelistFilter;
pub use date_filter::DateFilter;
pub use relative_time_range::{RelativeTimeRangeFilter, When};
pub use value::{Op, Value};
pub use value_filter::ValueFilter;

use crate::{
    relational::{col, Table},
    Result,
};

/// Apply optional lower/upper bounds to one column, preserving the input
/// schema. Shared by the date and value filters.
pub(crate) fn apply_bounds(
    table: &Table,
    column: &str,
    min: Option<&Value>,
    max: Option<&Value>,
    context: &str,
) -> Result<Table> {
    table.require_column(column, context)?;
    let mut out = table.clone();
    if let Some(min) = min {
        out = out.filter(&min.to_expr(col(column)))?;
    }
    if let Some(max) = max {
        out = out.filter(&max.to_expr(col(column)))?;
    }
    Ok(out)
}
