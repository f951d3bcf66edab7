use super::{domain_table, reduce_dates, select_phenotype_columns, ReturnDate};
use crate::{
    columns,
    filters::CategoricalFilter,
    node::ComputeNode,
    relational::{col, Table},
    ArcStr, Result, TableMap,
};
use serde_json::{json, Value as Json};
use std::sync::Arc;

/// Row-level categorical selection. `VALUE` carries the category (from
/// `value_column`); `EVENT_DATE` is the row's event date when the domain
/// has one, else null.
pub struct CategoricalPhenotype {
    name: ArcStr,
    domain: ArcStr,
    categorical_filter: CategoricalFilter,
    /// Which column's category lands in `VALUE`; defaults to the filter's
    /// first referenced column.
    value_column: ArcStr,
    return_date: ReturnDate,
}

impl CategoricalPhenotype {
    pub fn new(
        name: impl Into<ArcStr>,
        domain: impl Into<ArcStr>,
        categorical_filter: CategoricalFilter,
    ) -> Self {
        let value_column = categorical_filter
            .columns()
            .first()
            .cloned()
            .unwrap_or_else(|| columns::VALUE.into());
        CategoricalPhenotype {
            name: name.into(),
            domain: domain.into(),
            categorical_filter,
            value_column,
            return_date: ReturnDate::All,
        }
    }

    pub fn with_value_column(mut self, column: impl Into<ArcStr>) -> Self {
        self.value_column = column.into();
        self
    }

    pub fn with_return_date(mut self, return_date: ReturnDate) -> Self {
        self.return_date = return_date;
        self
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "CategoricalPhenotype")?;
        let domain = crate::serialize::get_str(value, "domain", "CategoricalPhenotype")?;
        let filter = CategoricalFilter::from_dict(value.get("categorical_filter").ok_or_else(
            || crate::Error::config("CategoricalPhenotype missing 'categorical_filter'"),
        )?)?;
        let value_column =
            crate::serialize::get_str(value, "value_column", "CategoricalPhenotype")?;
        let return_date = ReturnDate::from_str(crate::serialize::get_str(
            value,
            "return_date",
            "CategoricalPhenotype",
        )?)?;
        Ok(Arc::new(
            CategoricalPhenotype::new(name, domain, filter)
                .with_value_column(value_column)
                .with_return_date(return_date),
        ))
    }
}

impl ComputeNode for CategoricalPhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "CategoricalPhenotype",
            "name": &*self.name,
            "domain": &*self.domain,
            "categorical_filter": self.categorical_filter.to_dict(),
            "value_column": &*self.value_column,
            "return_date": self.return_date.as_str(),
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let table = domain_table(tables, &self.domain)?;
        let filtered = self.categorical_filter.filter(table)?;
        let with_value = filtered.mutate(columns::VALUE, &col(self.value_column.clone()))?;
        let reduced = if with_value.has_column(columns::EVENT_DATE) {
            reduce_dates(&with_value, self.return_date, true, None)?
        } else {
            // a dateless domain (e.g. the person table) has nothing to
            // reduce over
            with_value
        };
        select_phenotype_columns(&reduced)
    }

    fn execute_rows(&self, tables: &TableMap) -> Result<Table> {
        self.categorical_filter
            .filter(domain_table(tables, &self.domain)?)
    }
}

/// The subject's sex as a characteristic: `VALUE` is the `SEX` column of
/// the person domain, optionally restricted to given categories.
pub struct SexPhenotype {
    inner: CategoricalPhenotype,
    allowed_values: Vec<ArcStr>,
}

impl SexPhenotype {
    /// All sexes, as a baseline characteristic.
    pub fn new() -> Self {
        Self::restricted_to(Vec::<&str>::new())
    }

    /// Only subjects whose sex is among `allowed` (e.g. a female-only
    /// inclusion criterion).
    pub fn restricted_to<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
    {
        let allowed_values: Vec<ArcStr> = allowed.into_iter().map(Into::into).collect();
        let filter = if allowed_values.is_empty() {
            // match any non-null sex
            CategoricalFilter::Not(Box::new(CategoricalFilter::is_in(
                columns::SEX,
                Vec::<&str>::new(),
            )))
        } else {
            CategoricalFilter::is_in(columns::SEX, allowed_values.iter().cloned())
        };
        SexPhenotype {
            inner: CategoricalPhenotype::new("sex", "PERSON", filter)
                .with_value_column(columns::SEX),
            allowed_values,
        }
    }

    pub fn with_name(mut self, name: impl Into<ArcStr>) -> Self {
        self.inner.name = name.into();
        self
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "SexPhenotype")?;
        let allowed = match value.get("allowed_values") {
            None | Some(Json::Null) => Vec::new(),
            Some(v) => v
                .as_array()
                .ok_or_else(|| crate::Error::config("'allowed_values' must be a list"))?
                .iter()
                .filter_map(Json::as_str)
                .map(ArcStr::from)
                .collect(),
        };
        Ok(Arc::new(SexPhenotype::restricted_to(allowed).with_name(name)))
    }
}

impl Default for SexPhenotype {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeNode for SexPhenotype {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "SexPhenotype",
            "name": self.inner.name(),
            "allowed_values": self.allowed_values.iter().map(|v| &**v).collect::<Vec<_>>(),
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        self.inner.execute_plan(tables)
    }

    fn execute_rows(&self, tables: &TableMap) -> Result<Table> {
        self.inner.execute_rows(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phenotypes::test_util::{persons, run};
    use crate::Datum;

    fn person() -> TableMap {
        let table = Table::builder(["PERSON_ID", "SEX", "ETHNICITY"])
            .row([Datum::from("P1"), Datum::from("F"), Datum::from("a")])
            .row([Datum::from("P2"), Datum::from("M"), Datum::from("b")])
            .row([Datum::from("P3"), Datum::Null, Datum::from("a")])
            .build()
            .unwrap();
        let mut tables = TableMap::new();
        tables.insert("PERSON".into(), table);
        tables
    }

    #[test]
    fn sex_as_characteristic_carries_category() {
        let out = run(&SexPhenotype::new(), &person());
        assert_eq!(persons(&out), vec!["P1", "P2"]);
        let p1 = out
            .rows()
            .iter()
            .find(|r| r[0] == Datum::from("P1"))
            .unwrap();
        assert_eq!(p1[3], Datum::from("F"));
        assert!(p1[2].is_null()); // no event date on the person table
    }

    #[test]
    fn sex_as_inclusion_restricts() {
        let out = run(&SexPhenotype::restricted_to(["F"]), &person());
        assert_eq!(persons(&out), vec!["P1"]);
    }

    #[test]
    fn categorical_selection_on_any_column() {
        let pt = CategoricalPhenotype::new(
            "ethnicity_a",
            "PERSON",
            CategoricalFilter::is_in("ETHNICITY", ["a"]),
        );
        let out = run(&pt, &person());
        assert_eq!(persons(&out), vec!["P1", "P3"]);
        assert_eq!(out.rows()[0][3], Datum::from("a"));
    }
}
