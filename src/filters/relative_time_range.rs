use super::Value;
use crate::{
    columns,
    node::ComputeNode,
    relational::{col, Join, Table},
    Error, Result,
};
use serde_json::{json, Value as Json};
use std::sync::Arc;

/// Which side of the anchor the window lies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    Before,
    After,
}

impl When {
    pub fn as_str(&self) -> &'static str {
        match self {
            When::Before => "before",
            When::After => "after",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "before" => Ok(When::Before),
            "after" => Ok(When::After),
            other => Err(Error::config(format!("unknown 'when' value '{other}'"))),
        }
    }
}

/// Filters event rows by their day distance to a per-subject anchor date.
///
/// The distance is `anchor − EVENT_DATE` for `before` and `EVENT_DATE −
/// anchor` for `after`, bounded by the optional day thresholds. The anchor
/// is the per-subject `EVENT_DATE` of `anchor_phenotype` when one is set,
/// else the row's `INDEX_DATE` column. Rows with a null anchor or a null
/// target date are dropped.
///
/// This is the only filter that introduces a dependency edge between
/// phenotypes: a phenotype using an anchored filter gains the anchor as a
/// child node.
#[derive(Clone)]
pub struct RelativeTimeRangeFilter {
    pub min_days: Option<Value>,
    pub max_days: Option<Value>,
    pub when: When,
    pub anchor_phenotype: Option<Arc<dyn ComputeNode>>,
}

impl std::fmt::Debug for RelativeTimeRangeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RelativeTimeRangeFilter")
            .field("min_days", &self.min_days)
            .field("max_days", &self.max_days)
            .field("when", &self.when)
            .field(
                "anchor_phenotype",
                &self.anchor_phenotype.as_ref().map(|p| p.name().to_string()),
            )
            .finish()
    }
}

/// Scratch column holding the joined-in anchor date.
const ANCHOR_DATE: &str = "__ANCHOR_DATE";
/// Scratch column holding the signed day distance.
const DAYS_FROM_ANCHOR: &str = "__DAYS_FROM_ANCHOR";

impl RelativeTimeRangeFilter {
    pub fn before() -> Self {
        RelativeTimeRangeFilter {
            min_days: None,
            max_days: None,
            when: When::Before,
            anchor_phenotype: None,
        }
    }

    pub fn after() -> Self {
        RelativeTimeRangeFilter {
            min_days: None,
            max_days: None,
            when: When::After,
            anchor_phenotype: None,
        }
    }

    pub fn with_min_days(mut self, min_days: Value) -> Self {
        self.min_days = Some(min_days);
        self
    }

    pub fn with_max_days(mut self, max_days: Value) -> Self {
        self.max_days = Some(max_days);
        self
    }

    pub fn with_anchor(mut self, anchor: Arc<dyn ComputeNode>) -> Self {
        self.anchor_phenotype = Some(anchor);
        self
    }

    /// Join the anchor date onto `table` as a scratch column and return
    /// (table, anchor column name). With no anchor phenotype the row's
    /// `INDEX_DATE` is the anchor. Used by phenotypes that interpret the
    /// window against their own columns (period tables).
    pub fn attach_anchor(
        &self,
        table: &Table,
        anchor_table: Option<&Table>,
    ) -> Result<(Table, &'static str)> {
        match (&self.anchor_phenotype, anchor_table) {
            (Some(_), Some(anchor)) => {
                let anchor = anchor
                    .select(&[columns::PERSON_ID, columns::EVENT_DATE])?
                    .rename(columns::EVENT_DATE, ANCHOR_DATE)?
                    .distinct();
                let joined = table.join(&anchor, &[columns::PERSON_ID], Join::Inner)?;
                Ok((joined, ANCHOR_DATE))
            }
            (Some(p), None) => Err(Error::Lookup {
                parent: "relative time range filter".into(),
                child: p.name().to_string(),
            }),
            (None, _) => {
                table.require_column(columns::INDEX_DATE, "relative time range filter")?;
                Ok((table.clone(), columns::INDEX_DATE))
            }
        }
    }

    /// Filter `table` (an event table carrying `EVENT_DATE`). When the
    /// filter has an anchor phenotype, its output table must be supplied.
    pub fn filter(&self, table: &Table, anchor_table: Option<&Table>) -> Result<Table> {
        table.require_column(columns::EVENT_DATE, "relative time range filter")?;
        let original_columns: Vec<&str> = table.columns().iter().map(|c| &**c).collect();
        let (table, anchor_col) = self.attach_anchor(table, anchor_table)?;
        let diff = match self.when {
            When::Before => col(anchor_col).days_since(col(columns::EVENT_DATE)),
            When::After => col(columns::EVENT_DATE).days_since(col(anchor_col)),
        };
        let mut out = table
            .mutate(DAYS_FROM_ANCHOR, &diff)?
            .filter(&col(DAYS_FROM_ANCHOR).is_not_null())?;
        if let Some(min) = &self.min_days {
            out = out.filter(&min.to_expr(col(DAYS_FROM_ANCHOR)))?;
        }
        if let Some(max) = &self.max_days {
            out = out.filter(&max.to_expr(col(DAYS_FROM_ANCHOR)))?;
        }
        out.select(&original_columns)
    }

    pub fn to_dict(&self) -> Json {
        json!({
            "class_name": "RelativeTimeRangeFilter",
            "min_days": self.min_days.as_ref().map(Value::to_dict),
            "max_days": self.max_days.as_ref().map(Value::to_dict),
            "when": self.when.as_str(),
            "anchor_phenotype": self.anchor_phenotype.as_ref().map(|p| p.to_dict()),
        })
    }

    pub fn from_dict(value: &Json) -> Result<Self> {
        let bound = |key: &str| -> Result<Option<Value>> {
            match value.get(key) {
                None | Some(Json::Null) => Ok(None),
                Some(v) => Value::from_dict(v).map(Some),
            }
        };
        let when = When::from_str(crate::serialize::get_str(
            value,
            "when",
            "RelativeTimeRangeFilter",
        )?)?;
        Ok(RelativeTimeRangeFilter {
            min_days: bound("min_days")?,
            max_days: bound("max_days")?,
            when,
            anchor_phenotype: crate::serialize::optional_node(value, "anchor_phenotype")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Datum;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn events() -> Table {
        let index = date(2022, 1, 1);
        Table::builder(["PERSON_ID", "EVENT_DATE", "INDEX_DATE"])
            .row([
                Datum::from("P1"),
                Datum::from(date(2021, 12, 22)),
                Datum::from(index),
            ])
            .row([
                Datum::from("P1"),
                Datum::from(date(2021, 12, 31)),
                Datum::from(index),
            ])
            .row([
                Datum::from("P2"),
                Datum::from(date(2022, 1, 3)),
                Datum::from(index),
            ])
            .row([Datum::from("P3"), Datum::Null, Datum::from(index)])
            .build()
            .unwrap()
    }

    #[test]
    fn before_measures_anchor_minus_target() {
        let f = RelativeTimeRangeFilter::before()
            .with_min_days(Value::greater_than_or_equal_to(5));
        let out = f.filter(&events(), None).unwrap();
        // only the event 10 days before index passes; null dates drop
        assert_eq!(out.len(), 1);
        assert_eq!(out.rows()[0][1], Datum::from(date(2021, 12, 22)));
        // scratch columns removed
        assert_eq!(out.columns().len(), 3);
    }

    #[test]
    fn symmetry_between_before_and_after() {
        // before with bounds [-3, 0] ≡ after with bounds [0, 3]
        let before = RelativeTimeRangeFilter::before()
            .with_min_days(Value::greater_than_or_equal_to(-3))
            .with_max_days(Value::less_than_or_equal_to(0));
        let after = RelativeTimeRangeFilter::after()
            .with_min_days(Value::greater_than_or_equal_to(0))
            .with_max_days(Value::less_than_or_equal_to(3));
        let a = before.filter(&events(), None).unwrap().sort();
        let b = after.filter(&events(), None).unwrap().sort();
        assert_eq!(a.rows(), b.rows());
        assert_eq!(a.len(), 1); // P2, 2 days after index
    }

    #[test]
    fn anchor_table_supplies_per_subject_dates() {
        let anchor = Table::builder(["PERSON_ID", "EVENT_DATE"])
            .row([Datum::from("P1"), Datum::from(date(2021, 12, 30))])
            .build()
            .unwrap();
        struct Dummy;
        impl ComputeNode for Dummy {
            fn name(&self) -> &str {
                "anchor"
            }
            fn to_dict(&self) -> Json {
                json!({"class_name": "Dummy", "name": "anchor"})
            }
            fn execute_plan(&self, _tables: &crate::TableMap) -> Result<Table> {
                unreachable!()
            }
        }
        let f = RelativeTimeRangeFilter::before()
            .with_min_days(Value::greater_than_or_equal_to(0))
            .with_anchor(Arc::new(Dummy));
        let out = f.filter(&events(), Some(&anchor)).unwrap();
        // P2 has no anchor row and is dropped by the inner join
        assert_eq!(out.len(), 1);
        assert_eq!(out.rows()[0][0], Datum::from("P1"));
        assert_eq!(out.rows()[0][1], Datum::from(date(2021, 12, 22)));
    }
}
