//! Pre-filtering of every input domain by a study period. The output data
//! must look as if nothing before the period start was ever observed and
//! the future after the period end never happened.

use crate::{
    columns,
    filters::{DateFilter, Op},
    node::ComputeNode,
    relational::{col, lit, Datum, Expr, Table},
    ArcStr, Error, Result, TableMap,
};
use serde_json::{json, Value as Json};

/// Rewrites one table against a study period. Per row:
///
/// 1. `EVENT_DATE` outside the period (operators respected) drops the row.
/// 2. `START_DATE` strictly after the period end drops the row; otherwise
///    it is clamped up to the period start (one day later when the lower
///    bound is exclusive).
/// 3. `END_DATE` strictly before the period start drops the row; an end
///    beyond the period end becomes null (the end was never observed).
/// 4. `DATE_OF_DEATH` beyond the period end becomes null; never drops.
///
/// Only exact column names participate; nothing is inferred from
/// substrings.
#[derive(Debug, Clone)]
pub struct DataPeriodFilter {
    date_filter: DateFilter,
}

impl DataPeriodFilter {
    pub fn new(date_filter: DateFilter) -> Result<Self> {
        if &*date_filter.column_name != columns::EVENT_DATE {
            return Err(Error::config(format!(
                "data period filtering is keyed on EVENT_DATE, not '{}'",
                date_filter.column_name
            )));
        }
        if let Some(min) = &date_filter.min_value {
            if !matches!(min.op, Op::Gt | Op::Gte) {
                return Err(Error::config("data period lower bound must be > or >="));
            }
        }
        if let Some(max) = &date_filter.max_value {
            if !matches!(max.op, Op::Lt | Op::Lte) {
                return Err(Error::config("data period upper bound must be < or <="));
            }
        }
        Ok(DataPeriodFilter { date_filter })
    }

    pub fn date_filter(&self) -> &DateFilter {
        &self.date_filter
    }

    pub fn apply(&self, table: &Table) -> Result<Table> {
        let mut table = table.clone();
        let min = self.date_filter.min_value.as_ref();
        let max = self.date_filter.max_value.as_ref();

        // 1. row drops, evaluated before any column rewriting
        if table.has_column(columns::EVENT_DATE) {
            table = self.date_filter.filter(&table)?;
        }
        if table.has_column(columns::START_DATE) {
            if let Some(max) = max {
                // keep rows starting inside the period or with unknown start
                let keep = col(columns::START_DATE)
                    .is_null()
                    .or(max.to_expr(col(columns::START_DATE)));
                table = table.filter(&keep)?;
            }
        }
        if table.has_column(columns::END_DATE) {
            if let Some(min) = min {
                let keep = col(columns::END_DATE)
                    .is_null()
                    .or(min.to_expr(col(columns::END_DATE)));
                table = table.filter(&keep)?;
            }
        }

        // 2. column rewrites, all against the pre-rewrite row
        let mut mutations: Vec<(&str, Expr)> = Vec::new();
        if table.has_column(columns::START_DATE) {
            if let Some(min) = min {
                let period_start = match min.op {
                    Op::Gte => lit(min.value.clone()),
                    // exclusive bound: the first observed day is one later
                    Op::Gt => lit(min.value.clone()).add_days(1),
                    _ => unreachable!("validated in new"),
                };
                mutations.push((
                    columns::START_DATE,
                    Expr::Greatest(vec![col(columns::START_DATE), period_start]),
                ));
            }
        }
        for column in [columns::END_DATE, columns::DATE_OF_DEATH] {
            if table.has_column(column) {
                if let Some(max) = max {
                    let beyond = match max.op {
                        Op::Lte => col(column).gt(lit(max.value.clone())),
                        Op::Lt => col(column).gte(lit(max.value.clone())),
                        _ => unreachable!("validated in new"),
                    };
                    mutations.push((
                        column,
                        Expr::case(vec![(beyond, lit(Datum::Null))], col(column)),
                    ));
                }
            }
        }
        if mutations.is_empty() {
            Ok(table)
        } else {
            table.mutate_many(&mutations)
        }
    }

    pub fn to_dict(&self) -> Json {
        json!({
            "class_name": "DataPeriodFilter",
            "date_filter": self.date_filter.to_dict(),
        })
    }

    pub fn from_dict(value: &Json) -> Result<Self> {
        let date_filter = DateFilter::from_dict(
            value
                .get("date_filter")
                .ok_or_else(|| Error::config("DataPeriodFilter dict missing 'date_filter'"))?,
        )?;
        DataPeriodFilter::new(date_filter)
    }
}

/// [`DataPeriodFilter`] as a compute node over one named domain, so that a
/// workflow can schedule the rewrite ahead of the phenotypes reading the
/// domain.
pub struct DataPeriodFilterNode {
    name: ArcStr,
    domain: ArcStr,
    filter: DataPeriodFilter,
}

impl DataPeriodFilterNode {
    pub fn new(
        name: impl Into<ArcStr>,
        domain: impl Into<ArcStr>,
        date_filter: DateFilter,
    ) -> Result<Self> {
        Ok(DataPeriodFilterNode {
            name: name.into(),
            domain: domain.into(),
            filter: DataPeriodFilter::new(date_filter)?,
        })
    }

    pub fn from_dict_node(value: &Json) -> Result<std::sync::Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "DataPeriodFilterNode")?;
        let domain = crate::serialize::get_str(value, "domain", "DataPeriodFilterNode")?;
        let date_filter = DateFilter::from_dict(
            value
                .get("date_filter")
                .ok_or_else(|| Error::config("DataPeriodFilterNode dict missing 'date_filter'"))?,
        )?;
        Ok(std::sync::Arc::new(DataPeriodFilterNode::new(
            name,
            domain,
            date_filter,
        )?))
    }
}

impl ComputeNode for DataPeriodFilterNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "DataPeriodFilterNode",
            "name": &*self.name,
            "domain": &*self.domain,
            "date_filter": self.filter.date_filter().to_dict(),
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let table = tables
            .get(&self.domain)
            .ok_or_else(|| Error::config(format!("no input table for domain '{}'", self.domain)))?;
        self.filter.apply(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::Value;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn study_2020() -> DataPeriodFilter {
        DataPeriodFilter::new(DateFilter::new(
            Some(Value::after_or_on(date(2020, 1, 1))),
            Some(Value::before_or_on(date(2020, 12, 31))),
        ))
        .unwrap()
    }

    #[test]
    fn event_rows_outside_period_drop() {
        let t = Table::builder(["PERSON_ID", "EVENT_DATE"])
            .row([Datum::from("P1"), Datum::from(date(2019, 11, 15))])
            .row([Datum::from("P2"), Datum::from(date(2020, 6, 1))])
            .row([Datum::from("P3"), Datum::from(date(2020, 12, 31))])
            .row([Datum::from("P4"), Datum::from(date(2021, 2, 15))])
            .build()
            .unwrap();
        let out = study_2020().apply(&t).unwrap();
        let ids: Vec<_> = out.column_values("PERSON_ID").unwrap();
        assert_eq!(ids, vec![Datum::from("P2"), Datum::from("P3")]);
    }

    #[test]
    fn period_rows_are_clipped_to_the_study_window() {
        let t = Table::builder(["PERSON_ID", "START_DATE", "END_DATE"])
            .row([
                Datum::from("P1"),
                Datum::from(date(2019, 10, 1)),
                Datum::from(date(2019, 11, 1)),
            ])
            .row([
                Datum::from("P2"),
                Datum::from(date(2019, 11, 1)),
                Datum::from(date(2020, 3, 1)),
            ])
            .row([
                Datum::from("P3"),
                Datum::from(date(2020, 6, 1)),
                Datum::from(date(2020, 8, 1)),
            ])
            .row([
                Datum::from("P4"),
                Datum::from(date(2020, 10, 1)),
                Datum::from(date(2021, 3, 1)),
            ])
            .row([
                Datum::from("P5"),
                Datum::from(date(2021, 1, 1)),
                Datum::from(date(2021, 6, 1)),
            ])
            .build()
            .unwrap();
        let out = study_2020().apply(&t).unwrap().sort_by(&["PERSON_ID"]).unwrap();
        let ids: Vec<_> = out.column_values("PERSON_ID").unwrap();
        assert_eq!(
            ids,
            vec![Datum::from("P2"), Datum::from("P3"), Datum::from("P4")]
        );
        let starts = out.column_values("START_DATE").unwrap();
        assert_eq!(starts[0], Datum::from(date(2020, 1, 1))); // clamped up
        assert_eq!(starts[1], Datum::from(date(2020, 6, 1)));
        let ends = out.column_values("END_DATE").unwrap();
        assert_eq!(ends[1], Datum::from(date(2020, 8, 1)));
        assert!(ends[2].is_null()); // beyond the period end
    }

    #[test]
    fn death_dates_null_but_never_drop() {
        let t = Table::builder(["PERSON_ID", "DATE_OF_DEATH"])
            .row([Datum::from("P1"), Datum::from(date(2019, 5, 10))])
            .row([Datum::from("P2"), Datum::from(date(2020, 7, 15))])
            .row([Datum::from("P3"), Datum::from(date(2021, 4, 20))])
            .row([Datum::from("P4"), Datum::Null])
            .build()
            .unwrap();
        let out = study_2020().apply(&t).unwrap();
        assert_eq!(out.len(), 4);
        let deaths = out.column_values("DATE_OF_DEATH").unwrap();
        assert_eq!(deaths[0], Datum::from(date(2019, 5, 10)));
        assert_eq!(deaths[1], Datum::from(date(2020, 7, 15)));
        assert!(deaths[2].is_null());
    }

    #[test]
    fn exclusive_lower_bound_clamps_one_day_later() {
        let f = DataPeriodFilter::new(DateFilter::new(
            Some(Value::after(date(2020, 1, 1))),
            None,
        ))
        .unwrap();
        let t = Table::builder(["PERSON_ID", "START_DATE"])
            .row([Datum::from("P1"), Datum::from(date(2019, 6, 1))])
            .build()
            .unwrap();
        let out = f.apply(&t).unwrap();
        assert_eq!(
            out.column_values("START_DATE").unwrap()[0],
            Datum::from(date(2020, 1, 2))
        );
    }

    #[test]
    fn non_event_date_column_is_rejected() {
        let err = DataPeriodFilter::new(
            DateFilter::new(None, None).with_column("ADMISSION_DATE"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
