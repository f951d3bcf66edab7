use super::{
    anchor_children, anchor_output, domain_table, reduce_dates, select_phenotype_columns,
    ReturnDate,
};
use crate::{
    codelist::Codelist,
    columns,
    filters::{CodelistFilter, DateFilter, RelativeTimeRangeFilter},
    node::ComputeNode,
    relational::{col, Table},
    ArcStr, Result, TableMap,
};
use serde_json::{json, Value as Json};
use std::sync::Arc;

/// Subjects with at least one event matching a codelist, optionally
/// restricted by an absolute date range and by relative time ranges, then
/// temporally reduced.
///
/// With `code_as_value` the matching row's `CODE` is carried into `VALUE`
/// (feeding discrete binning); otherwise `VALUE` is null.
pub struct CodelistPhenotype {
    name: ArcStr,
    domain: ArcStr,
    codelist_filter: CodelistFilter,
    date_range: Option<DateFilter>,
    relative_time_ranges: Vec<RelativeTimeRangeFilter>,
    return_date: ReturnDate,
    code_as_value: bool,
}

impl CodelistPhenotype {
    /// Named after the codelist unless overridden with
    /// [`CodelistPhenotype::with_name`].
    pub fn new(domain: impl Into<ArcStr>, codelist: Codelist) -> Self {
        CodelistPhenotype {
            name: codelist.name().into(),
            domain: domain.into(),
            codelist_filter: CodelistFilter::new(codelist),
            date_range: None,
            relative_time_ranges: Vec::new(),
            return_date: ReturnDate::First,
            code_as_value: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<ArcStr>) -> Self {
        self.name = name.into();
        self
    }

    pub fn ignoring_code_type(mut self) -> Self {
        self.codelist_filter.use_code_type = false;
        self
    }

    pub fn with_date_range(mut self, date_range: DateFilter) -> Self {
        self.date_range = Some(date_range);
        self
    }

    pub fn with_relative_time_range(mut self, filter: RelativeTimeRangeFilter) -> Self {
        self.relative_time_ranges.push(filter);
        self
    }

    pub fn with_return_date(mut self, return_date: ReturnDate) -> Self {
        self.return_date = return_date;
        self
    }

    pub fn with_code_as_value(mut self) -> Self {
        self.code_as_value = true;
        self
    }

    pub fn codelist(&self) -> &Codelist {
        &self.codelist_filter.codelist
    }

    /// All filters applied, source columns kept.
    fn filtered_rows(&self, tables: &TableMap) -> Result<Table> {
        let mut table = self.codelist_filter.filter(domain_table(tables, &self.domain)?)?;
        if let Some(date_range) = &self.date_range {
            table = date_range.filter(&table)?;
        }
        for rtr in &self.relative_time_ranges {
            table = rtr.filter(&table, anchor_output(rtr, tables)?)?;
        }
        Ok(table)
    }

    fn nearest_anchor<'a>(&self, tables: &'a TableMap) -> Result<Option<&'a Table>> {
        for rtr in &self.relative_time_ranges {
            if let Some(anchor) = anchor_output(rtr, tables)? {
                return Ok(Some(anchor));
            }
        }
        Ok(None)
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "CodelistPhenotype")?;
        let domain = crate::serialize::get_str(value, "domain", "CodelistPhenotype")?;
        let codelist_filter = CodelistFilter::from_dict(
            value
                .get("codelist_filter")
                .ok_or_else(|| crate::Error::config("CodelistPhenotype missing 'codelist_filter'"))?,
        )?;
        let date_range = match value.get("date_range") {
            None | Some(Json::Null) => None,
            Some(v) => Some(DateFilter::from_dict(v)?),
        };
        let relative_time_ranges = match value.get("relative_time_ranges") {
            None | Some(Json::Null) => Vec::new(),
            Some(v) => v
                .as_array()
                .ok_or_else(|| crate::Error::config("'relative_time_ranges' must be a list"))?
                .iter()
                .map(RelativeTimeRangeFilter::from_dict)
                .collect::<Result<Vec<_>>>()?,
        };
        let return_date =
            ReturnDate::from_str(crate::serialize::get_str(value, "return_date", "CodelistPhenotype")?)?;
        let code_as_value = value
            .get("code_as_value")
            .and_then(Json::as_bool)
            .unwrap_or(false);
        Ok(Arc::new(CodelistPhenotype {
            name: name.into(),
            domain: domain.into(),
            codelist_filter,
            date_range,
            relative_time_ranges,
            return_date,
            code_as_value,
        }))
    }
}

impl ComputeNode for CodelistPhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        anchor_children(&self.relative_time_ranges)
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "CodelistPhenotype",
            "name": &*self.name,
            "domain": &*self.domain,
            "codelist_filter": self.codelist_filter.to_dict(),
            "date_range": self.date_range.as_ref().map(DateFilter::to_dict),
            "relative_time_ranges": self
                .relative_time_ranges
                .iter()
                .map(RelativeTimeRangeFilter::to_dict)
                .collect::<Vec<_>>(),
            "return_date": self.return_date.as_str(),
            "code_as_value": self.code_as_value,
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let mut rows = self.filtered_rows(tables)?;
        if self.code_as_value {
            rows = rows.mutate(columns::VALUE, &col(columns::CODE))?;
        }
        let reduced = reduce_dates(
            &rows,
            self.return_date,
            self.code_as_value,
            self.nearest_anchor(tables)?,
        )?;
        select_phenotype_columns(&reduced)
    }

    fn execute_rows(&self, tables: &TableMap) -> Result<Table> {
        self.filtered_rows(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::Value;
    use crate::phenotypes::test_util::{date, persons, run};
    use crate::Datum;

    fn conditions() -> TableMap {
        let table = Table::builder(["PERSON_ID", "CODE", "CODE_TYPE", "EVENT_DATE", "INDEX_DATE"])
            .row([
                Datum::from("P1"),
                Datum::from("I48"),
                Datum::from("ICD-10"),
                Datum::from(date(2020, 5, 10)),
                Datum::from(date(2021, 1, 1)),
            ])
            .row([
                Datum::from("P1"),
                Datum::from("I48"),
                Datum::from("ICD-10"),
                Datum::from(date(2020, 7, 1)),
                Datum::from(date(2021, 1, 1)),
            ])
            .row([
                Datum::from("P2"),
                Datum::from("E11"),
                Datum::from("ICD-10"),
                Datum::from(date(2020, 6, 1)),
                Datum::from(date(2021, 1, 1)),
            ])
            .build()
            .unwrap();
        let mut tables = TableMap::new();
        tables.insert("CONDITION_OCCURRENCE".into(), table);
        tables
    }

    #[test]
    fn first_event_per_subject() {
        let pt = CodelistPhenotype::new("CONDITION_OCCURRENCE", Codelist::from_codes("af", ["I48"]));
        let out = run(&pt, &conditions());
        assert_eq!(persons(&out), vec!["P1"]);
        assert_eq!(out.len(), 1);
        let row = &out.rows()[0];
        assert_eq!(row[1], Datum::Bool(true));
        assert_eq!(row[2], Datum::from(date(2020, 5, 10)));
        assert!(row[3].is_null());
    }

    #[test]
    fn return_all_keeps_every_event() {
        let pt = CodelistPhenotype::new("CONDITION_OCCURRENCE", Codelist::from_codes("af", ["I48"]))
            .with_return_date(ReturnDate::All);
        let out = run(&pt, &conditions());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn date_range_restricts_events() {
        let pt = CodelistPhenotype::new("CONDITION_OCCURRENCE", Codelist::from_codes("af", ["I48"]))
            .with_date_range(DateFilter::new(Some(Value::after(date(2020, 6, 1))), None));
        let out = run(&pt, &conditions());
        assert_eq!(out.rows()[0][2], Datum::from(date(2020, 7, 1)));
    }

    #[test]
    fn relative_time_range_uses_index_date() {
        let pt = CodelistPhenotype::new("CONDITION_OCCURRENCE", Codelist::from_codes("af", ["I48"]))
            .with_relative_time_range(
                RelativeTimeRangeFilter::before()
                    .with_min_days(Value::greater_than_or_equal_to(200)),
            );
        let out = run(&pt, &conditions());
        // only the May event is ≥200 days before index
        assert_eq!(out.len(), 1);
        assert_eq!(out.rows()[0][2], Datum::from(date(2020, 5, 10)));
    }

    #[test]
    fn code_as_value_carries_the_code() {
        let pt = CodelistPhenotype::new("CONDITION_OCCURRENCE", Codelist::from_codes("af", ["I48"]))
            .with_code_as_value()
            .with_return_date(ReturnDate::All);
        let out = run(&pt, &conditions());
        assert_eq!(out.rows()[0][3], Datum::from("I48"));
    }

    #[test]
    fn dict_round_trip_preserves_structure() {
        let pt = CodelistPhenotype::new("CONDITION_OCCURRENCE", Codelist::from_codes("af", ["I48"]))
            .with_return_date(ReturnDate::Last);
        let restored = CodelistPhenotype::from_dict_node(&pt.to_dict()).unwrap();
        assert_eq!(
            crate::serialize::canonical_json(&pt.to_dict()),
            crate::serialize::canonical_json(&restored.to_dict()),
        );
        assert_eq!(crate::node::node_hash(&pt), crate::node::node_hash(&*restored));
    }
}
