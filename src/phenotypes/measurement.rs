use super::{
    anchor_children, anchor_output, domain_table, person_dates, reduce_dates,
    select_phenotype_columns, ReturnDate,
};
use crate::{
    aggregators::ValueAggregator,
    codelist::Codelist,
    columns,
    filters::{CodelistFilter, DateFilter, RelativeTimeRangeFilter, ValueFilter},
    node::{canonical_name, ComputeNode},
    relational::{Join, Table},
    ArcStr, Error, Result, TableMap,
};
use serde_json::{json, Value as Json};
use std::sync::Arc;

/// Codelist-selected rows with a numeric `VALUE`: lab results, vitals,
/// scores. Beyond the codelist/date/relative-time filtering it supports
/// value bounds, per-subject or per-day value aggregation, and composition
/// with an upstream measurement (`further_value_filter`): rows are first
/// restricted to the upstream phenotype's qualifying `(subject, date)` row
/// set, then the local value filter applies.
pub struct MeasurementPhenotype {
    name: ArcStr,
    domain: ArcStr,
    codelist_filter: CodelistFilter,
    date_range: Option<DateFilter>,
    relative_time_ranges: Vec<RelativeTimeRangeFilter>,
    value_filter: Option<ValueFilter>,
    value_aggregation: Option<ValueAggregator>,
    further_value_filter_phenotype: Option<Arc<dyn ComputeNode>>,
    return_date: ReturnDate,
}

impl MeasurementPhenotype {
    pub fn new(domain: impl Into<ArcStr>, codelist: Codelist) -> Self {
        MeasurementPhenotype {
            name: codelist.name().into(),
            domain: domain.into(),
            codelist_filter: CodelistFilter::new(codelist),
            date_range: None,
            relative_time_ranges: Vec::new(),
            value_filter: None,
            value_aggregation: None,
            further_value_filter_phenotype: None,
            return_date: ReturnDate::First,
        }
    }

    pub fn with_name(mut self, name: impl Into<ArcStr>) -> Self {
        self.name = name.into();
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

    pub fn with_value_filter(mut self, value_filter: ValueFilter) -> Self {
        self.value_filter = Some(value_filter);
        self
    }

    pub fn with_value_aggregation(mut self, aggregation: ValueAggregator) -> Self {
        self.value_aggregation = Some(aggregation);
        self
    }

    pub fn with_further_value_filter(mut self, phenotype: Arc<dyn ComputeNode>) -> Self {
        self.further_value_filter_phenotype = Some(phenotype);
        self
    }

    pub fn with_return_date(mut self, return_date: ReturnDate) -> Self {
        self.return_date = return_date;
        self
    }

    fn filtered_rows(&self, tables: &TableMap) -> Result<Table> {
        let table = domain_table(tables, &self.domain)?;
        table.require_column(columns::VALUE, "measurement phenotype")?;
        let mut table = self.codelist_filter.filter(table)?;
        if let Some(date_range) = &self.date_range {
            table = date_range.filter(&table)?;
        }
        for rtr in &self.relative_time_ranges {
            table = rtr.filter(&table, anchor_output(rtr, tables)?)?;
        }
        if let Some(upstream) = &self.further_value_filter_phenotype {
            let name = canonical_name(&**upstream);
            let upstream_table = tables.get(&name).ok_or(Error::Lookup {
                parent: self.name.to_string(),
                child: name.to_string(),
            })?;
            let row_set = person_dates(upstream_table)?;
            table = table.join(&row_set, &[columns::PERSON_ID, columns::EVENT_DATE], Join::Semi)?;
        }
        if let Some(value_filter) = &self.value_filter {
            table = value_filter.filter(&table)?;
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
        let name = crate::serialize::get_str(value, "name", "MeasurementPhenotype")?;
        let domain = crate::serialize::get_str(value, "domain", "MeasurementPhenotype")?;
        let codelist_filter = CodelistFilter::from_dict(value.get("codelist_filter").ok_or_else(
            || crate::Error::config("MeasurementPhenotype missing 'codelist_filter'"),
        )?)?;
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
        let value_filter = match value.get("value_filter") {
            None | Some(Json::Null) => None,
            Some(v) => Some(ValueFilter::from_dict(v)?),
        };
        let value_aggregation = match value.get("value_aggregation") {
            None | Some(Json::Null) => None,
            Some(v) => Some(ValueAggregator::from_dict(v)?),
        };
        let further = crate::serialize::optional_node(value, "further_value_filter_phenotype")?;
        let return_date = ReturnDate::from_str(crate::serialize::get_str(
            value,
            "return_date",
            "MeasurementPhenotype",
        )?)?;
        Ok(Arc::new(MeasurementPhenotype {
            name: name.into(),
            domain: domain.into(),
            codelist_filter,
            date_range,
            relative_time_ranges,
            value_filter,
            value_aggregation,
            further_value_filter_phenotype: further,
            return_date,
        }))
    }
}

impl ComputeNode for MeasurementPhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        let mut children = anchor_children(&self.relative_time_ranges);
        if let Some(further) = &self.further_value_filter_phenotype {
            let name = canonical_name(&**further);
            if !children.iter().any(|c| canonical_name(&**c) == name) {
                children.push(further.clone());
            }
        }
        children
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "MeasurementPhenotype",
            "name": &*self.name,
            "domain": &*self.domain,
            "codelist_filter": self.codelist_filter.to_dict(),
            "date_range": self.date_range.as_ref().map(DateFilter::to_dict),
            "relative_time_ranges": self
                .relative_time_ranges
                .iter()
                .map(RelativeTimeRangeFilter::to_dict)
                .collect::<Vec<_>>(),
            "value_filter": self.value_filter.as_ref().map(ValueFilter::to_dict),
            "value_aggregation": self.value_aggregation.as_ref().map(ValueAggregator::to_dict),
            "further_value_filter_phenotype": self
                .further_value_filter_phenotype
                .as_ref()
                .map(|p| p.to_dict()),
            "return_date": self.return_date.as_str(),
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let mut rows = self.filtered_rows(tables)?;
        if let Some(aggregation) = &self.value_aggregation {
            rows = aggregation.aggregate(&rows)?;
        }
        let reduced = reduce_dates(&rows, self.return_date, true, self.nearest_anchor(tables)?)?;
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

    fn measurements() -> TableMap {
        let mut builder = Table::builder([
            "PERSON_ID",
            "CODE",
            "CODE_TYPE",
            "EVENT_DATE",
            "VALUE",
            "INDEX_DATE",
        ]);
        let index = date(2022, 1, 1);
        // P1: two same-day eGFR readings then a later one
        for (person, day, value) in [
            ("P1", date(2021, 12, 1), 50.0),
            ("P1", date(2021, 12, 1), 60.0),
            ("P1", date(2021, 12, 20), 80.0),
            ("P2", date(2021, 12, 10), 30.0),
        ] {
            builder.push([
                Datum::from(person),
                Datum::from("eGFR"),
                Datum::from("LOINC"),
                Datum::from(day),
                Datum::from(value),
                Datum::from(index),
            ]);
        }
        let mut tables = TableMap::new();
        tables.insert("MEASUREMENT".into(), builder.build().unwrap());
        tables
    }

    fn egfr() -> Codelist {
        Codelist::from_mapping("egfr", [("LOINC", vec!["eGFR"])])
    }

    #[test]
    fn value_filter_bounds_measurements() {
        let pt = MeasurementPhenotype::new("MEASUREMENT", egfr())
            .with_value_filter(ValueFilter::min(Value::greater_than_or_equal_to(45.0)))
            .with_return_date(ReturnDate::All);
        let out = run(&pt, &measurements());
        assert_eq!(persons(&out), vec!["P1", "P1", "P1"]);
    }

    #[test]
    fn daily_mean_then_last() {
        let pt = MeasurementPhenotype::new("MEASUREMENT", egfr())
            .with_value_aggregation(ValueAggregator::daily_mean())
            .with_return_date(ReturnDate::Last);
        let out = run(&pt, &measurements());
        let p1 = out
            .rows()
            .iter()
            .find(|r| r[0] == Datum::from("P1"))
            .unwrap();
        assert_eq!(p1[2], Datum::from(date(2021, 12, 20)));
        assert_eq!(p1[3], Datum::Float(80.0));
    }

    #[test]
    fn per_subject_median_keeps_value_and_nulls_date() {
        let pt = MeasurementPhenotype::new("MEASUREMENT", egfr())
            .with_value_aggregation(ValueAggregator::median())
            .with_return_date(ReturnDate::All);
        let out = run(&pt, &measurements());
        let p1 = out
            .rows()
            .iter()
            .find(|r| r[0] == Datum::from("P1"))
            .unwrap();
        assert_eq!(p1[3], Datum::Float(60.0));
        assert!(p1[2].is_null());
    }

    #[test]
    fn further_value_filter_composes_row_sets() {
        // upstream: readings below 55 (P1's 50 on 12-01, P2's 30 on 12-10)
        let low: Arc<dyn ComputeNode> = Arc::new(
            MeasurementPhenotype::new("MEASUREMENT", egfr())
                .with_name("egfr_low")
                .with_value_filter(ValueFilter::max(Value::less_than(55.0)))
                .with_return_date(ReturnDate::All),
        );
        // local: among those rows, values above 40
        let pt = MeasurementPhenotype::new("MEASUREMENT", egfr())
            .with_name("egfr_low_but_ok")
            .with_further_value_filter(low)
            .with_value_filter(ValueFilter::min(Value::greater_than(40.0)))
            .with_return_date(ReturnDate::All);
        let out = run(&pt, &measurements());
        // P1 12-01 qualifies twice upstream but local rows are 50 and 60;
        // both sit on the upstream row set's dates, only 50 and 60 > 40
        assert_eq!(persons(&out), vec!["P1", "P1"]);
    }
}
