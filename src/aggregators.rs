//! Row-reducing operators keyed by a grouping set (default `{PERSON_ID}`,
//! or `{PERSON_ID, EVENT_DATE}` for the daily variants).
//!
//! Date aggregators pick the row with the extreme (or anchor-nearest)
//! `EVENT_DATE` per group; a tie on the date must still resolve to a
//! single row, deterministically, which is done by lexicographic order on
//! `VALUE`, then `CODE`, then the remaining columns.

use crate::{
    columns,
    relational::{col, lit, Agg, Datum, Table},
    ArcStr, Result,
};
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;

const AGG_DATE: &str = "__AGG_DATE";
const ABS_DELTA: &str = "__ABS_DELTA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DateFn {
    Earliest,
    Latest,
}

/// Selects, per group, the row with the earliest/latest event date
/// ([`DateAggregator::first`] / [`DateAggregator::last`]), or the row
/// nearest to an anchor date ([`DateAggregator::nearest`]).
#[derive(Debug, Clone)]
pub struct DateAggregator {
    function: DateFn,
    /// Column holding the anchor date; set only for `nearest`.
    anchor_column: Option<ArcStr>,
    aggregation_index: Vec<ArcStr>,
    event_date_column: ArcStr,
    reduce: bool,
}

impl DateAggregator {
    pub fn first() -> Self {
        Self::new(DateFn::Earliest)
    }

    pub fn last() -> Self {
        Self::new(DateFn::Latest)
    }

    /// Nearest by absolute day delta to `anchor_column` (which the caller
    /// joins in); a delta tie resolves to the earlier date.
    pub fn nearest(anchor_column: impl Into<ArcStr>) -> Self {
        let mut agg = Self::new(DateFn::Earliest);
        agg.anchor_column = Some(anchor_column.into());
        agg
    }

    fn new(function: DateFn) -> Self {
        DateAggregator {
            function,
            anchor_column: None,
            aggregation_index: vec![columns::PERSON_ID.into()],
            event_date_column: columns::EVENT_DATE.into(),
            reduce: false,
        }
    }

    pub fn with_reduce(mut self) -> Self {
        self.reduce = true;
        self
    }

    pub fn with_index<I, S>(mut self, index: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
    {
        self.aggregation_index = index.into_iter().map(Into::into).collect();
        self
    }

    pub fn aggregate(&self, table: &Table) -> Result<Table> {
        let index: Vec<&str> = self.aggregation_index.iter().map(|c| &**c).collect();
        let date_col = &*self.event_date_column;

        // nearest ties (two dates equidistant) go to the earlier date;
        // first/last date ties go to the smaller (VALUE, CODE)
        let (filtered, prefer): (Table, &[&str]) = match &self.anchor_column {
            None => {
                let agg = match self.function {
                    DateFn::Earliest => Agg::min(date_col),
                    DateFn::Latest => Agg::max(date_col),
                };
                let out = table
                    .window(&index, AGG_DATE, &agg)?
                    .filter(&col(date_col).eq(col(AGG_DATE)))?
                    .drop_columns(&[AGG_DATE])?;
                (out, &[columns::VALUE, columns::CODE])
            }
            Some(anchor) => {
                let delta = col(date_col).days_since(col(anchor.clone())).abs();
                let with_delta = table.mutate(ABS_DELTA, &delta)?;
                let out = with_delta
                    .window(&index, AGG_DATE, &Agg::min(ABS_DELTA))?
                    .filter(&col(ABS_DELTA).eq(col(AGG_DATE)))?
                    .drop_columns(&[ABS_DELTA, AGG_DATE])?;
                (out, &[columns::EVENT_DATE, columns::VALUE, columns::CODE])
            }
        };

        if self.reduce {
            let mut keep = index.clone();
            keep.push(date_col);
            let out = filtered.select(&keep)?.distinct();
            // a date tie still leaves one row here; only VALUE is dropped
            let out = dedupe_per_group(&out, &index, prefer)?;
            out.mutate(columns::VALUE, &lit(Datum::Null))
        } else {
            dedupe_per_group(&filtered, &index, prefer)
        }
    }

    pub fn to_dict(&self) -> Json {
        json!({
            "class_name": "DateAggregator",
            "aggregation_function": match (self.function, &self.anchor_column) {
                (_, Some(_)) => "nearest",
                (DateFn::Earliest, _) => "min",
                (DateFn::Latest, _) => "max",
            },
            "aggregation_index": self.aggregation_index.iter().map(|c| &**c).collect::<Vec<_>>(),
            "event_date_column": &*self.event_date_column,
            "reduce": self.reduce,
        })
    }
}

/// Keep exactly one row per group key: the lexicographically smallest,
/// comparing the `prefer` columns first, then the rest left to right.
/// Deterministic on any input.
fn dedupe_per_group(table: &Table, keys: &[&str], prefer: &[&str]) -> Result<Table> {
    let mut order: Vec<&str> = keys.to_vec();
    for preferred in prefer.iter().copied() {
        if table.has_column(preferred) && !order.contains(&preferred) {
            order.push(preferred);
        }
    }
    for column in table.columns() {
        if !order.contains(&&**column) {
            order.push(&**column);
        }
    }
    let sorted = table.sort_by(&order)?;
    let key_idxs: Vec<usize> = keys
        .iter()
        .map(|k| sorted.column_index(k).expect("sorted by these columns"))
        .collect();
    let mut seen: BTreeMap<Vec<Datum>, ()> = BTreeMap::new();
    let mut rows = Vec::new();
    for row in sorted.rows() {
        let key: Vec<Datum> = key_idxs.iter().map(|i| row[*i].clone()).collect();
        if seen.insert(key, ()).is_none() {
            rows.push(row.clone());
        }
    }
    Table::new(sorted.columns().to_vec(), rows)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueFn {
    Min,
    Max,
    Mean,
    Median,
}

impl ValueFn {
    fn as_str(&self) -> &'static str {
        match self {
            ValueFn::Min => "min",
            ValueFn::Max => "max",
            ValueFn::Mean => "mean",
            ValueFn::Median => "median",
        }
    }
}

/// Reduces the `VALUE` column per group. The daily variants group by
/// `(PERSON_ID, EVENT_DATE)`, yielding one value per subject-day;
/// otherwise the event date is nulled when reducing (it no longer refers
/// to any single row).
#[derive(Debug, Clone)]
pub struct ValueAggregator {
    function: ValueFn,
    aggregation_index: Vec<ArcStr>,
    reduce: bool,
}

impl ValueAggregator {
    pub fn min() -> Self {
        Self::new(ValueFn::Min, false)
    }

    pub fn max() -> Self {
        Self::new(ValueFn::Max, false)
    }

    pub fn mean() -> Self {
        Self::new(ValueFn::Mean, false)
    }

    pub fn median() -> Self {
        Self::new(ValueFn::Median, false)
    }

    pub fn daily_min() -> Self {
        Self::new(ValueFn::Min, true)
    }

    pub fn daily_max() -> Self {
        Self::new(ValueFn::Max, true)
    }

    pub fn daily_mean() -> Self {
        Self::new(ValueFn::Mean, true)
    }

    pub fn daily_median() -> Self {
        Self::new(ValueFn::Median, true)
    }

    fn new(function: ValueFn, daily: bool) -> Self {
        let aggregation_index = if daily {
            vec![columns::PERSON_ID.into(), columns::EVENT_DATE.into()]
        } else {
            vec![columns::PERSON_ID.into()]
        };
        ValueAggregator {
            function,
            aggregation_index,
            reduce: true,
        }
    }

    pub fn without_reduce(mut self) -> Self {
        self.reduce = false;
        self
    }

    pub fn aggregate(&self, table: &Table) -> Result<Table> {
        let index: Vec<&str> = self.aggregation_index.iter().map(|c| &**c).collect();
        let agg = match self.function {
            ValueFn::Min => Agg::min(columns::VALUE),
            ValueFn::Max => Agg::max(columns::VALUE),
            ValueFn::Mean => Agg::mean(columns::VALUE),
            ValueFn::Median => Agg::median(columns::VALUE),
        };
        if self.reduce {
            let mut out = table.aggregate(&index, &[(columns::VALUE, agg)])?;
            if !index.contains(&columns::EVENT_DATE) {
                out = out.mutate(columns::EVENT_DATE, &lit(Datum::Null))?;
            }
            Ok(out)
        } else {
            // replace VALUE with the per-partition aggregate, keeping rows
            let out = table.window(&index, "__AGG_VALUE", &agg)?;
            out.mutate(columns::VALUE, &col("__AGG_VALUE"))?
                .drop_columns(&["__AGG_VALUE"])
        }
    }

    pub fn to_dict(&self) -> Json {
        json!({
            "class_name": "ValueAggregator",
            "aggregation_function": self.function.as_str(),
            "aggregation_index": self.aggregation_index.iter().map(|c| &**c).collect::<Vec<_>>(),
            "reduce": self.reduce,
        })
    }

    pub fn from_dict(value: &Json) -> Result<Self> {
        let function = match crate::serialize::get_str(value, "aggregation_function", "ValueAggregator")? {
            "min" => ValueFn::Min,
            "max" => ValueFn::Max,
            "mean" => ValueFn::Mean,
            "median" => ValueFn::Median,
            other => {
                return Err(crate::Error::config(format!(
                    "unsupported aggregation function '{other}'"
                )))
            }
        };
        let aggregation_index = value
            .get("aggregation_index")
            .and_then(Json::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Json::as_str)
                    .map(ArcStr::from)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| vec![columns::PERSON_ID.into()]);
        let reduce = value.get("reduce").and_then(Json::as_bool).unwrap_or(true);
        Ok(ValueAggregator {
            function,
            aggregation_index,
            reduce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn measurements() -> Table {
        Table::builder(["PERSON_ID", "EVENT_DATE", "VALUE", "CODE"])
            .row([
                Datum::from("P1"),
                Datum::from(date(2020, 1, 1)),
                Datum::from(3.0),
                Datum::from("a"),
            ])
            .row([
                Datum::from("P1"),
                Datum::from(date(2020, 1, 1)),
                Datum::from(4.0),
                Datum::from("b"),
            ])
            .row([
                Datum::from("P1"),
                Datum::from(date(2020, 2, 1)),
                Datum::from(10.0),
                Datum::from("a"),
            ])
            .row([
                Datum::from("P2"),
                Datum::from(date(2020, 3, 1)),
                Datum::from(7.0),
                Datum::from("a"),
            ])
            .build()
            .unwrap()
    }

    #[test]
    fn first_breaks_date_ties_deterministically() {
        let out = DateAggregator::first().aggregate(&measurements()).unwrap();
        assert_eq!(out.len(), 2);
        let p1 = out
            .rows()
            .iter()
            .find(|r| r[0] == Datum::from("P1"))
            .unwrap();
        // two rows share 2020-01-01; the smaller VALUE wins
        assert_eq!(p1[2], Datum::Float(3.0));
    }

    #[test]
    fn last_with_reduce_nulls_value() {
        let out = DateAggregator::last()
            .with_reduce()
            .aggregate(&measurements())
            .unwrap();
        assert_eq!(out.len(), 2);
        for row in out.rows() {
            assert!(row[2].is_null()); // VALUE
        }
        let p1 = out
            .rows()
            .iter()
            .find(|r| r[0] == Datum::from("P1"))
            .unwrap();
        assert_eq!(p1[1], Datum::from(date(2020, 2, 1)));
    }

    #[test]
    fn nearest_minimises_absolute_delta() {
        let anchored = measurements()
            .mutate("ANCHOR", &lit(date(2020, 1, 20)))
            .unwrap();
        let out = DateAggregator::nearest("ANCHOR").aggregate(&anchored).unwrap();
        let p1 = out
            .rows()
            .iter()
            .find(|r| r[0] == Datum::from("P1"))
            .unwrap();
        // 2020-02-01 is 12 days away, 2020-01-01 is 19 days away
        assert_eq!(p1[1], Datum::from(date(2020, 2, 1)));
    }

    #[test]
    fn daily_mean_keeps_the_day() {
        let out = ValueAggregator::daily_mean()
            .aggregate(&measurements())
            .unwrap();
        assert_eq!(out.len(), 3);
        let day1 = out
            .rows()
            .iter()
            .find(|r| r[0] == Datum::from("P1") && r[1] == Datum::from(date(2020, 1, 1)))
            .unwrap();
        assert_eq!(day1[2], Datum::Float(3.5));
    }

    #[test]
    fn median_reduces_per_subject_and_nulls_the_date() {
        let out = ValueAggregator::median().aggregate(&measurements()).unwrap();
        let p1 = out
            .rows()
            .iter()
            .find(|r| r[0] == Datum::from("P1"))
            .unwrap();
        assert_eq!(p1[1], Datum::Float(4.0));
        assert!(p1[2].is_null()); // EVENT_DATE nulled
    }
}
