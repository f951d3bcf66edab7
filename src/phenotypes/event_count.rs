use super::{person_dates, select_phenotype_columns, ReturnDate};
use crate::{
    columns,
    filters::{RelativeTimeRangeFilter, ValueFilter},
    node::{canonical_name, ComputeNode},
    relational::{Datum, Table},
    ArcStr, Error, Result, TableMap,
};
use chrono::NaiveDate;
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Which event of a qualifying pair contributes its date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComponentDateSelect {
    First,
    #[default]
    Second,
}

impl ComponentDateSelect {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentDateSelect::First => "first",
            ComponentDateSelect::Second => "second",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "first" => ComponentDateSelect::First,
            "second" => ComponentDateSelect::Second,
            other => {
                return Err(Error::config(format!(
                    "unknown component_date_select '{other}'"
                )))
            }
        })
    }
}

/// Counts a component phenotype's events per subject ("at least two
/// diagnoses"), with an optional spacing requirement between event pairs.
///
/// The count threshold is the `value_filter` (over the per-subject event
/// count). With a `relative_time_range`, the day bounds apply to the
/// distance between pairs of events; each qualifying pair contributes the
/// date of its `component_date_select` element. Without one, every event
/// contributes. `return_date` then reduces as usual. `VALUE` carries the
/// subject's event count.
pub struct EventCountPhenotype {
    name: ArcStr,
    phenotype: Arc<dyn ComputeNode>,
    value_filter: Option<ValueFilter>,
    relative_time_range: Option<RelativeTimeRangeFilter>,
    return_date: ReturnDate,
    component_date_select: ComponentDateSelect,
}

impl EventCountPhenotype {
    pub fn new(name: impl Into<ArcStr>, phenotype: Arc<dyn ComputeNode>) -> Self {
        EventCountPhenotype {
            name: name.into(),
            phenotype,
            value_filter: None,
            relative_time_range: None,
            return_date: ReturnDate::First,
            component_date_select: ComponentDateSelect::default(),
        }
    }

    pub fn with_value_filter(mut self, value_filter: ValueFilter) -> Self {
        self.value_filter = Some(value_filter);
        self
    }

    pub fn with_relative_time_range(mut self, rtr: RelativeTimeRangeFilter) -> Self {
        self.relative_time_range = Some(rtr);
        self
    }

    pub fn with_return_date(mut self, return_date: ReturnDate) -> Self {
        self.return_date = return_date;
        self
    }

    pub fn with_component_date_select(mut self, select: ComponentDateSelect) -> Self {
        self.component_date_select = select;
        self
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "EventCountPhenotype")?;
        let phenotype = crate::serialize::optional_node(value, "phenotype")?
            .ok_or_else(|| Error::config("EventCountPhenotype missing 'phenotype'"))?;
        let mut pt = EventCountPhenotype::new(name, phenotype);
        pt.value_filter = match value.get("value_filter") {
            None | Some(Json::Null) => None,
            Some(v) => Some(ValueFilter::from_dict(v)?),
        };
        pt.relative_time_range = match value.get("relative_time_range") {
            None | Some(Json::Null) => None,
            Some(v) => Some(RelativeTimeRangeFilter::from_dict(v)?),
        };
        pt.return_date = ReturnDate::from_str(crate::serialize::get_str(
            value,
            "return_date",
            "EventCountPhenotype",
        )?)?;
        pt.component_date_select = ComponentDateSelect::from_str(crate::serialize::get_str(
            value,
            "component_date_select",
            "EventCountPhenotype",
        )?)?;
        Ok(Arc::new(pt))
    }
}

impl ComputeNode for EventCountPhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        vec![self.phenotype.clone()]
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "EventCountPhenotype",
            "name": &*self.name,
            "phenotype": self.phenotype.to_dict(),
            "value_filter": self.value_filter.as_ref().map(ValueFilter::to_dict),
            "relative_time_range": self
                .relative_time_range
                .as_ref()
                .map(RelativeTimeRangeFilter::to_dict),
            "return_date": self.return_date.as_str(),
            "component_date_select": self.component_date_select.as_str(),
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let child_name = canonical_name(&*self.phenotype);
        let child = tables.get(&child_name).ok_or(Error::Lookup {
            parent: self.name.to_string(),
            child: child_name.to_string(),
        })?;
        let events = person_dates(child)?;
        let person_idx = events.require_column(columns::PERSON_ID, "event count")?;
        let date_idx = events.require_column(columns::EVENT_DATE, "event count")?;

        let mut per_person: BTreeMap<Datum, Vec<NaiveDate>> = BTreeMap::new();
        for row in events.rows() {
            if let Some(date) = row[date_idx].as_date() {
                per_person
                    .entry(row[person_idx].clone())
                    .or_default()
                    .push(date);
            }
        }

        let mut builder = Table::builder([columns::PERSON_ID, columns::EVENT_DATE, columns::VALUE]);
        for (person, mut dates) in per_person {
            dates.sort();
            let count = dates.len() as i64;
            if let Some(value_filter) = &self.value_filter {
                let passes = value_filter
                    .min_value
                    .as_ref()
                    .map_or(true, |m| m.matches(&Datum::Int(count)))
                    && value_filter
                        .max_value
                        .as_ref()
                        .map_or(true, |m| m.matches(&Datum::Int(count)));
                if !passes {
                    continue;
                }
            }
            // which events contribute a date
            let mut component_dates: Vec<NaiveDate> = match &self.relative_time_range {
                None => dates.clone(),
                Some(rtr) => {
                    let mut out = Vec::new();
                    for (i, first) in dates.iter().enumerate() {
                        for second in &dates[i + 1..] {
                            let gap = (*second - *first).num_days();
                            let min_ok = rtr
                                .min_days
                                .as_ref()
                                .map_or(true, |m| m.matches(&Datum::Int(gap)));
                            let max_ok = rtr
                                .max_days
                                .as_ref()
                                .map_or(true, |m| m.matches(&Datum::Int(gap)));
                            if min_ok && max_ok {
                                out.push(match self.component_date_select {
                                    ComponentDateSelect::First => *first,
                                    ComponentDateSelect::Second => *second,
                                });
                            }
                        }
                    }
                    out.sort();
                    out.dedup();
                    out
                }
            };
            match self.return_date {
                ReturnDate::All => {}
                ReturnDate::First => component_dates.truncate(1),
                ReturnDate::Last => {
                    if let Some(last) = component_dates.pop() {
                        component_dates = vec![last];
                    }
                }
                ReturnDate::Nearest => {
                    return Err(Error::config(
                        "return_date 'nearest' is ambiguous for event counts",
                    ))
                }
            }
            for date in component_dates {
                builder.push([person.clone(), Datum::from(date), Datum::Int(count)]);
            }
        }
        select_phenotype_columns(&builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codelist::Codelist;
    use crate::filters::Value;
    use crate::phenotypes::test_util::{date, persons, run};
    use crate::phenotypes::CodelistPhenotype;

    /// P1 has events 10, 9 and 1 days before index plus one on it; P2 has
    /// two, 10 days and 1 day before.
    fn tables() -> TableMap {
        let index = date(2022, 1, 1);
        let mut builder =
            Table::builder(["PERSON_ID", "CODE", "CODE_TYPE", "EVENT_DATE", "INDEX_DATE"]);
        for (person, days_before) in
            [("P1", 10u64), ("P1", 9), ("P1", 1), ("P1", 0), ("P2", 10), ("P2", 1)]
        {
            builder.push([
                Datum::from(person),
                Datum::from("c1"),
                Datum::from("ICD10CM"),
                Datum::from(index - chrono::Days::new(days_before)),
                Datum::from(index),
            ]);
        }
        let mut out = TableMap::new();
        out.insert("CONDITION_OCCURRENCE".into(), builder.build().unwrap());
        out
    }

    fn prior_events() -> Arc<dyn ComputeNode> {
        Arc::new(
            CodelistPhenotype::new("CONDITION_OCCURRENCE", Codelist::from_codes("c1", ["c1"]))
                .with_return_date(ReturnDate::All)
                .with_relative_time_range(
                    RelativeTimeRangeFilter::before()
                        .with_min_days(Value::greater_than_or_equal_to(0)),
                ),
        )
    }

    fn spaced(pt: EventCountPhenotype) -> EventCountPhenotype {
        pt.with_relative_time_range(
            RelativeTimeRangeFilter::before().with_min_days(Value::greater_than_or_equal_to(5)),
        )
    }

    #[test]
    fn pair_spacing_selects_second_events() {
        let pt = spaced(
            EventCountPhenotype::new("ec", prior_events())
                .with_value_filter(ValueFilter::min(Value::greater_than(2))),
        )
        .with_return_date(ReturnDate::All);
        let out = run(&pt, &tables());
        // only P1 has more than two events; its pairs ≥5 days apart end
        // at the last two dates
        assert_eq!(persons(&out), vec!["P1", "P1"]);
        let mut dates: Vec<Datum> = out.column_values(columns::EVENT_DATE).unwrap();
        dates.sort();
        assert_eq!(
            dates,
            vec![
                Datum::from(date(2021, 12, 31)),
                Datum::from(date(2022, 1, 1))
            ]
        );
    }

    #[test]
    fn first_of_first_components() {
        let pt = spaced(
            EventCountPhenotype::new("ec", prior_events())
                .with_value_filter(ValueFilter::min(Value::greater_than(2)))
                .with_component_date_select(ComponentDateSelect::First),
        )
        .with_return_date(ReturnDate::First);
        let out = run(&pt, &tables());
        assert_eq!(out.len(), 1);
        assert_eq!(out.rows()[0][2], Datum::from(date(2021, 12, 22)));
    }

    #[test]
    fn count_threshold_admits_both_subjects() {
        let pt = spaced(
            EventCountPhenotype::new("ec", prior_events())
                .with_value_filter(ValueFilter::min(Value::greater_than_or_equal_to(2)))
                .with_component_date_select(ComponentDateSelect::First),
        )
        .with_return_date(ReturnDate::First);
        let out = run(&pt, &tables());
        assert_eq!(persons(&out), vec!["P1", "P2"]);
        for row in out.rows() {
            assert_eq!(row[2], Datum::from(date(2021, 12, 22)));
        }
    }

    #[test]
    fn second_event_without_spacing() {
        // "two events, index at the first": no pair spacing, count ≥ 2
        let pt = EventCountPhenotype::new("ec", prior_events())
            .with_value_filter(ValueFilter::min(Value::greater_than_or_equal_to(2)))
            .with_return_date(ReturnDate::First);
        let out = run(&pt, &tables());
        assert_eq!(persons(&out), vec!["P1", "P2"]);
        let p2 = out
            .rows()
            .iter()
            .find(|r| r[0] == Datum::from("P2"))
            .unwrap();
        assert_eq!(p2[2], Datum::from(date(2021, 12, 22)));
        assert_eq!(p2[3], Datum::Int(2));
    }
}
