//! Phenotypes over period-shaped domains (`START_DATE`/`END_DATE` per
//! row): overlap tests, period counts, covered-day totals and
//! gap-to-neighbour measurements, all anchored to a per-subject date.

use super::{anchor_output, domain_table, reduce_dates, select_phenotype_columns, ReturnDate};
use crate::{
    columns,
    filters::{RelativeTimeRangeFilter, Value, ValueFilter, When},
    node::ComputeNode,
    relational::{col, lit, Datum, Expr, Join, Table},
    ArcStr, Result, TableMap,
};
use chrono::NaiveDate;
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;
use std::sync::Arc;

const DAYS_SCRATCH: &str = "__DAYS";

fn zero_or(min_days: Option<&Value>) -> Value {
    min_days
        .cloned()
        .unwrap_or_else(|| Value::greater_than_or_equal_to(0))
}

fn rtr_children(rtr: Option<&RelativeTimeRangeFilter>) -> Vec<Arc<dyn ComputeNode>> {
    rtr.and_then(|r| r.anchor_phenotype.clone())
        .into_iter()
        .collect()
}

fn rtr_from_dict(value: &Json, key: &str) -> Result<Option<RelativeTimeRangeFilter>> {
    match value.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(v) => RelativeTimeRangeFilter::from_dict(v).map(Some),
    }
}

fn value_filter_from_dict(value: &Json) -> Result<Option<ValueFilter>> {
    match value.get("value_filter") {
        None | Some(Json::Null) => Ok(None),
        Some(v) => ValueFilter::from_dict(v).map(Some),
    }
}

/// Subjects with at least one period overlapping the anchored window;
/// `EVENT_DATE` is the period end (`before`) or start (`after`).
pub struct TimeRangePhenotype {
    name: ArcStr,
    domain: ArcStr,
    relative_time_range: RelativeTimeRangeFilter,
    return_date: ReturnDate,
}

impl TimeRangePhenotype {
    pub fn new(
        name: impl Into<ArcStr>,
        domain: impl Into<ArcStr>,
        relative_time_range: RelativeTimeRangeFilter,
    ) -> Self {
        TimeRangePhenotype {
            name: name.into(),
            domain: domain.into(),
            relative_time_range,
            return_date: ReturnDate::First,
        }
    }

    pub fn with_return_date(mut self, return_date: ReturnDate) -> Self {
        self.return_date = return_date;
        self
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "TimeRangePhenotype")?;
        let domain = crate::serialize::get_str(value, "domain", "TimeRangePhenotype")?;
        let rtr = rtr_from_dict(value, "relative_time_range")?
            .ok_or_else(|| crate::Error::config("TimeRangePhenotype missing 'relative_time_range'"))?;
        let return_date = ReturnDate::from_str(crate::serialize::get_str(
            value,
            "return_date",
            "TimeRangePhenotype",
        )?)?;
        Ok(Arc::new(
            TimeRangePhenotype::new(name, domain, rtr).with_return_date(return_date),
        ))
    }
}

impl ComputeNode for TimeRangePhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        rtr_children(Some(&self.relative_time_range))
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "TimeRangePhenotype",
            "name": &*self.name,
            "domain": &*self.domain,
            "relative_time_range": self.relative_time_range.to_dict(),
            "return_date": self.return_date.as_str(),
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let table = domain_table(tables, &self.domain)?;
        table.require_column(columns::START_DATE, "time range phenotype")?;
        table.require_column(columns::END_DATE, "time range phenotype")?;
        let rtr = &self.relative_time_range;
        let anchor = anchor_output(rtr, tables)?;
        let (table, anchor_col) = rtr.attach_anchor(table, anchor)?;
        let table = table.filter(&col(columns::START_DATE).is_not_null())?;

        // A period [S, E] overlaps the window when S is on the near side
        // of it and E on the far side; a null E is an ongoing period.
        let min = zero_or(rtr.min_days.as_ref());
        let overlap = match rtr.when {
            When::Before => {
                let start_ok = min.to_expr(col(anchor_col).days_since(col(columns::START_DATE)));
                let end_ok = match &rtr.max_days {
                    Some(max) => col(columns::END_DATE)
                        .is_null()
                        .or(max.to_expr(col(anchor_col).days_since(col(columns::END_DATE)))),
                    None => lit(true),
                };
                start_ok.and(end_ok)
            }
            When::After => {
                let end_ok = col(columns::END_DATE)
                    .is_null()
                    .or(min.to_expr(col(columns::END_DATE).days_since(col(anchor_col))));
                let start_ok = match &rtr.max_days {
                    Some(max) => max.to_expr(col(columns::START_DATE).days_since(col(anchor_col))),
                    None => lit(true),
                };
                start_ok.and(end_ok)
            }
        };
        let endpoint = match rtr.when {
            When::Before => columns::END_DATE,
            When::After => columns::START_DATE,
        };
        let out = table
            .filter(&overlap)?
            .mutate(columns::EVENT_DATE, &col(endpoint))?;
        let reduced = reduce_dates(&out, self.return_date, false, None)?;
        select_phenotype_columns(&reduced)
    }
}

/// Number of periods lying entirely inside the anchored window (whole
/// period inclusion: both endpoints in the window). `VALUE` is the count,
/// `EVENT_DATE` null.
pub struct TimeRangeCountPhenotype {
    name: ArcStr,
    domain: ArcStr,
    relative_time_range: Option<RelativeTimeRangeFilter>,
    value_filter: Option<ValueFilter>,
}

impl TimeRangeCountPhenotype {
    pub fn new(name: impl Into<ArcStr>, domain: impl Into<ArcStr>) -> Self {
        TimeRangeCountPhenotype {
            name: name.into(),
            domain: domain.into(),
            relative_time_range: None,
            value_filter: None,
        }
    }

    pub fn with_relative_time_range(mut self, rtr: RelativeTimeRangeFilter) -> Self {
        self.relative_time_range = Some(rtr);
        self
    }

    pub fn with_value_filter(mut self, value_filter: ValueFilter) -> Self {
        self.value_filter = Some(value_filter);
        self
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "TimeRangeCountPhenotype")?;
        let domain = crate::serialize::get_str(value, "domain", "TimeRangeCountPhenotype")?;
        let mut pt = TimeRangeCountPhenotype::new(name, domain);
        pt.relative_time_range = rtr_from_dict(value, "relative_time_range")?;
        pt.value_filter = value_filter_from_dict(value)?;
        Ok(Arc::new(pt))
    }
}

impl ComputeNode for TimeRangeCountPhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        rtr_children(self.relative_time_range.as_ref())
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "TimeRangeCountPhenotype",
            "name": &*self.name,
            "domain": &*self.domain,
            "relative_time_range": self
                .relative_time_range
                .as_ref()
                .map(RelativeTimeRangeFilter::to_dict),
            "value_filter": self.value_filter.as_ref().map(ValueFilter::to_dict),
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let table = domain_table(tables, &self.domain)?;
        table.require_column(columns::START_DATE, "time range count")?;
        table.require_column(columns::END_DATE, "time range count")?;
        let mut table = table.filter(
            &col(columns::START_DATE)
                .is_not_null()
                .and(col(columns::END_DATE).is_not_null()),
        )?;

        if let Some(rtr) = &self.relative_time_range {
            let anchor = anchor_output(rtr, tables)?;
            let (anchored, anchor_col) = rtr.attach_anchor(&table, anchor)?;
            let min = zero_or(rtr.min_days.as_ref());
            let inside = match rtr.when {
                When::Before => {
                    // whole period before the anchor side of the window
                    let end_ok = min.to_expr(col(anchor_col).days_since(col(columns::END_DATE)));
                    let start_ok = match &rtr.max_days {
                        Some(max) => {
                            max.to_expr(col(anchor_col).days_since(col(columns::START_DATE)))
                        }
                        None => lit(true),
                    };
                    start_ok.and(end_ok)
                }
                When::After => {
                    let start_ok =
                        min.to_expr(col(columns::START_DATE).days_since(col(anchor_col)));
                    let end_ok = match &rtr.max_days {
                        Some(max) => {
                            max.to_expr(col(columns::END_DATE).days_since(col(anchor_col)))
                        }
                        None => lit(true),
                    };
                    start_ok.and(end_ok)
                }
            };
            table = anchored
                .filter(&inside)?
                .select(&[columns::PERSON_ID, columns::START_DATE, columns::END_DATE])?;
        } else {
            table = table.select(&[columns::PERSON_ID, columns::START_DATE, columns::END_DATE])?;
        }

        let mut counts = table.distinct().aggregate(
            &[columns::PERSON_ID],
            &[(columns::VALUE, crate::relational::Agg::count())],
        )?;
        if let Some(value_filter) = &self.value_filter {
            counts = value_filter.filter(&counts)?;
        }
        select_phenotype_columns(&counts)
    }
}

/// Total days covered by distinct periods passing the window rules
/// (`END − START + 1` summed per subject). Subjects from the person table
/// with no qualifying period get `VALUE` 0.
pub struct TimeRangeDayCountPhenotype {
    name: ArcStr,
    domain: ArcStr,
    relative_time_range: Option<RelativeTimeRangeFilter>,
    value_filter: Option<ValueFilter>,
    allow_null_end_date: bool,
}

impl TimeRangeDayCountPhenotype {
    pub fn new(name: impl Into<ArcStr>, domain: impl Into<ArcStr>) -> Self {
        TimeRangeDayCountPhenotype {
            name: name.into(),
            domain: domain.into(),
            relative_time_range: None,
            value_filter: None,
            allow_null_end_date: false,
        }
    }

    pub fn with_relative_time_range(mut self, rtr: RelativeTimeRangeFilter) -> Self {
        self.relative_time_range = Some(rtr);
        self
    }

    pub fn with_value_filter(mut self, value_filter: ValueFilter) -> Self {
        self.value_filter = Some(value_filter);
        self
    }

    /// Keep ongoing periods (null `END_DATE`); they contribute no days but
    /// don't drop the subject.
    pub fn allowing_null_end_date(mut self) -> Self {
        self.allow_null_end_date = true;
        self
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "TimeRangeDayCountPhenotype")?;
        let domain = crate::serialize::get_str(value, "domain", "TimeRangeDayCountPhenotype")?;
        let mut pt = TimeRangeDayCountPhenotype::new(name, domain);
        pt.relative_time_range = rtr_from_dict(value, "relative_time_range")?;
        pt.value_filter = value_filter_from_dict(value)?;
        pt.allow_null_end_date = value
            .get("allow_null_end_date")
            .and_then(Json::as_bool)
            .unwrap_or(false);
        Ok(Arc::new(pt))
    }
}

impl ComputeNode for TimeRangeDayCountPhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        rtr_children(self.relative_time_range.as_ref())
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "TimeRangeDayCountPhenotype",
            "name": &*self.name,
            "domain": &*self.domain,
            "relative_time_range": self
                .relative_time_range
                .as_ref()
                .map(RelativeTimeRangeFilter::to_dict),
            "value_filter": self.value_filter.as_ref().map(ValueFilter::to_dict),
            "allow_null_end_date": self.allow_null_end_date,
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let table = domain_table(tables, &self.domain)?;
        table.require_column(columns::START_DATE, "time range day count")?;
        table.require_column(columns::END_DATE, "time range day count")?;
        let mut table = table.filter(&col(columns::START_DATE).is_not_null())?;
        if !self.allow_null_end_date {
            table = table.filter(&col(columns::END_DATE).is_not_null())?;
        }

        if let Some(rtr) = &self.relative_time_range {
            let anchor = anchor_output(rtr, tables)?;
            let (anchored, anchor_col) = rtr.attach_anchor(&table, anchor)?;
            let side = match rtr.when {
                // periods ending by the anchor
                When::Before => col(anchor_col)
                    .days_since(col(columns::END_DATE))
                    .gte(lit(0)),
                // periods starting at or after the anchor
                When::After => col(columns::START_DATE)
                    .days_since(col(anchor_col))
                    .gte(lit(0)),
            };
            let mut anchored = anchored.filter(&side)?;
            if let Some(min) = &rtr.min_days {
                let diff = match rtr.when {
                    When::Before => col(anchor_col).days_since(col(columns::END_DATE)),
                    When::After => col(columns::START_DATE).days_since(col(anchor_col)),
                };
                anchored = anchored.filter(&min.to_expr(diff))?;
            }
            if let Some(max) = &rtr.max_days {
                let diff = match rtr.when {
                    When::Before => col(anchor_col).days_since(col(columns::START_DATE)),
                    When::After => col(columns::END_DATE).days_since(col(anchor_col)),
                };
                anchored = anchored.filter(&max.to_expr(diff))?;
            }
            table = anchored;
        }

        let periods = table
            .select(&[columns::PERSON_ID, columns::START_DATE, columns::END_DATE])?
            .distinct()
            .mutate(
                DAYS_SCRATCH,
                &col(columns::END_DATE)
                    .days_since(col(columns::START_DATE))
                    .add(lit(1)),
            )?;
        let mut totals = periods.aggregate(
            &[columns::PERSON_ID],
            &[(columns::VALUE, crate::relational::Agg::sum(DAYS_SCRATCH))],
        )?;
        if let Some(value_filter) = &self.value_filter {
            totals = value_filter.filter(&totals)?;
        }
        let result = select_phenotype_columns(&totals)?;

        // subjects with no periods at all still appear, with zero days
        if let Some(person) = tables.get("PERSON") {
            let person_ids = person.select(&[columns::PERSON_ID])?.distinct();
            let joined = person_ids.join(&result, &[columns::PERSON_ID], Join::Left)?;
            let filled = joined.mutate(
                columns::VALUE,
                &Expr::case(
                    vec![(col(columns::VALUE).is_null(), lit(0))],
                    col(columns::VALUE),
                ),
            )?;
            return select_phenotype_columns(&filled);
        }
        Ok(result)
    }
}

/// For each subject's anchor-covering period, the day gap to the nearest
/// period on the chosen side. `VALUE` is the gap, `EVENT_DATE` the
/// neighbour's start (`after`) or end (`before`).
pub struct TimeRangeDaysToNextRange {
    name: ArcStr,
    domain: ArcStr,
    relative_time_range: RelativeTimeRangeFilter,
    value_filter: Option<ValueFilter>,
}

impl TimeRangeDaysToNextRange {
    pub fn new(
        name: impl Into<ArcStr>,
        domain: impl Into<ArcStr>,
        relative_time_range: RelativeTimeRangeFilter,
    ) -> Self {
        TimeRangeDaysToNextRange {
            name: name.into(),
            domain: domain.into(),
            relative_time_range,
            value_filter: None,
        }
    }

    pub fn with_value_filter(mut self, value_filter: ValueFilter) -> Self {
        self.value_filter = Some(value_filter);
        self
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "TimeRangeDaysToNextRange")?;
        let domain = crate::serialize::get_str(value, "domain", "TimeRangeDaysToNextRange")?;
        let rtr = rtr_from_dict(value, "relative_time_range")?.ok_or_else(|| {
            crate::Error::config("TimeRangeDaysToNextRange missing 'relative_time_range'")
        })?;
        let mut pt = TimeRangeDaysToNextRange::new(name, domain, rtr);
        pt.value_filter = value_filter_from_dict(value)?;
        Ok(Arc::new(pt))
    }
}

impl ComputeNode for TimeRangeDaysToNextRange {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        rtr_children(Some(&self.relative_time_range))
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "TimeRangeDaysToNextRange",
            "name": &*self.name,
            "domain": &*self.domain,
            "relative_time_range": self.relative_time_range.to_dict(),
            "value_filter": self.value_filter.as_ref().map(ValueFilter::to_dict),
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let table = domain_table(tables, &self.domain)?;
        table.require_column(columns::START_DATE, "days to next range")?;
        table.require_column(columns::END_DATE, "days to next range")?;
        let rtr = &self.relative_time_range;
        let anchor = anchor_output(rtr, tables)?;
        let (table, anchor_col) = rtr.attach_anchor(table, anchor)?;

        let person_idx = table.require_column(columns::PERSON_ID, "days to next range")?;
        let start_idx = table.require_column(columns::START_DATE, "days to next range")?;
        let end_idx = table.require_column(columns::END_DATE, "days to next range")?;
        let anchor_idx = table.require_column(anchor_col, "days to next range")?;

        // periods per subject, with the subject's anchor date
        let mut periods: BTreeMap<Datum, (Option<NaiveDate>, Vec<(NaiveDate, NaiveDate)>)> =
            BTreeMap::new();
        for row in table.rows() {
            let entry = periods.entry(row[person_idx].clone()).or_default();
            if entry.0.is_none() {
                entry.0 = row[anchor_idx].as_date();
            }
            if let (Some(start), Some(end)) = (row[start_idx].as_date(), row[end_idx].as_date()) {
                entry.1.push((start, end));
            }
        }

        let mut builder = Table::builder([columns::PERSON_ID, columns::EVENT_DATE, columns::VALUE]);
        for (person, (anchor_date, mut ranges)) in periods {
            let Some(anchor_date) = anchor_date else {
                continue;
            };
            ranges.sort();
            // the covering period; with several, the earliest start wins
            let Some(covering) = ranges
                .iter()
                .find(|(start, end)| *start <= anchor_date && anchor_date <= *end)
                .copied()
            else {
                continue;
            };
            let neighbour = match rtr.when {
                When::After => ranges
                    .iter()
                    .filter(|(start, _)| *start > covering.1)
                    .map(|(start, _)| ((*start - covering.1).num_days(), *start))
                    .min(),
                When::Before => ranges
                    .iter()
                    .filter(|(_, end)| *end < covering.0)
                    .map(|(_, end)| ((covering.0 - *end).num_days(), *end))
                    .min(),
            };
            if let Some((gap, endpoint)) = neighbour {
                builder.push([person, Datum::from(endpoint), Datum::from(gap)]);
            }
        }
        let mut out = builder.build()?;
        if let Some(value_filter) = &self.value_filter {
            out = value_filter.filter(&out)?;
        }
        select_phenotype_columns(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phenotypes::test_util::{date, persons, run};

    fn index() -> NaiveDate {
        date(2022, 1, 15)
    }

    /// P1: covering period plus one 10 days later and one 20 days later.
    /// P2: covering period only. P3: no covering period. P4: a prior
    /// period 40 days before the covering one.
    fn visits() -> TableMap {
        let covering = (date(2022, 1, 1), date(2022, 1, 30));
        let mut builder =
            Table::builder(["PERSON_ID", "START_DATE", "END_DATE", "INDEX_DATE"]);
        let mut push = |person: &str, start: NaiveDate, end: NaiveDate| {
            builder.push([
                Datum::from(person),
                Datum::from(start),
                Datum::from(end),
                Datum::from(index()),
            ]);
        };
        push("P1", covering.0, covering.1);
        push("P1", date(2022, 2, 9), date(2022, 2, 14));
        push("P1", date(2022, 2, 19), date(2022, 2, 24));
        push("P2", covering.0, covering.1);
        push("P3", date(2021, 1, 1), date(2021, 1, 30));
        push("P4", covering.0, covering.1);
        push("P4", date(2021, 11, 12), date(2021, 11, 22));
        let mut tables = TableMap::new();
        tables.insert("VISIT_OCCURRENCE".into(), builder.build().unwrap());
        tables
    }

    #[test]
    fn overlap_with_pre_index_window() {
        // window: 0..365 days before index
        let pt = TimeRangePhenotype::new(
            "any_coverage",
            "VISIT_OCCURRENCE",
            RelativeTimeRangeFilter::before()
                .with_max_days(Value::less_than_or_equal_to(365)),
        );
        let out = run(&pt, &visits());
        // P3's period ended more than 365 days before index? no — it
        // overlaps the window; P1/P2/P4 cover the index itself
        assert_eq!(persons(&out), vec!["P1", "P2", "P3", "P4"]);
    }

    #[test]
    fn whole_period_count_in_window() {
        // count periods entirely within one year before index
        let pt = TimeRangeCountPhenotype::new("n_prior_periods", "VISIT_OCCURRENCE")
            .with_relative_time_range(
                RelativeTimeRangeFilter::before()
                    .with_max_days(Value::less_than_or_equal_to(365)),
            );
        let out = run(&pt, &visits());
        // only P4's prior period lies wholly before the index
        assert_eq!(persons(&out), vec!["P4"]);
        let p4 = &out.rows()[0];
        assert_eq!(p4[3], Datum::Int(1));
        assert!(p4[2].is_null());
    }

    #[test]
    fn day_count_sums_distinct_periods() {
        let pt = TimeRangeDayCountPhenotype::new("days_in_hospital", "VISIT_OCCURRENCE")
            .with_relative_time_range(
                RelativeTimeRangeFilter::after()
                    .with_max_days(Value::less_than_or_equal_to(365)),
            );
        let out = run(&pt, &visits());
        // P1's two post-index periods: 6 + 6 days
        let p1 = out
            .rows()
            .iter()
            .find(|r| r[0] == Datum::from("P1"))
            .unwrap();
        assert_eq!(p1[3], Datum::Int(12));
    }

    #[test]
    fn day_count_zero_fills_from_person_table() {
        let mut tables = visits();
        tables.insert(
            "PERSON".into(),
            Table::builder(["PERSON_ID"])
                .row([Datum::from("P1")])
                .row([Datum::from("P9")])
                .build()
                .unwrap(),
        );
        let pt = TimeRangeDayCountPhenotype::new("days_in_hospital", "VISIT_OCCURRENCE")
            .with_relative_time_range(
                RelativeTimeRangeFilter::after()
                    .with_max_days(Value::less_than_or_equal_to(365)),
            );
        let out = run(&pt, &tables);
        assert_eq!(persons(&out), vec!["P1", "P9"]);
        let p9 = out
            .rows()
            .iter()
            .find(|r| r[0] == Datum::from("P9"))
            .unwrap();
        assert_eq!(p9[3], Datum::Int(0));
    }

    #[test]
    fn gap_to_next_range() {
        let pt = TimeRangeDaysToNextRange::new(
            "gap_to_next",
            "VISIT_OCCURRENCE",
            RelativeTimeRangeFilter::after(),
        );
        let out = run(&pt, &visits());
        // P1: nearest later period starts 10 days after coverage lapses
        assert_eq!(persons(&out), vec!["P1"]);
        let p1 = &out.rows()[0];
        assert_eq!(p1[3], Datum::Int(10));
        assert_eq!(p1[2], Datum::from(date(2022, 2, 9)));
    }

    #[test]
    fn gap_to_previous_range() {
        let pt = TimeRangeDaysToNextRange::new(
            "prior_gap",
            "VISIT_OCCURRENCE",
            RelativeTimeRangeFilter::before(),
        );
        let out = run(&pt, &visits());
        // only P4 has a period ending before its covering period
        assert_eq!(persons(&out), vec!["P4"]);
        let p4 = &out.rows()[0];
        assert_eq!(p4[3], Datum::Int(40));
        assert_eq!(p4[2], Datum::from(date(2021, 11, 22)));
    }
}
