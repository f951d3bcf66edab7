use super::select_phenotype_columns;
use crate::{
    columns,
    node::{canonical_name, ComputeNode},
    relational::{col, lit, Datum, Table},
    ArcStr, Error, Result, TableMap,
};
use serde_json::{json, Value as Json};
use std::sync::Arc;

/// The component phenotype with every event date shifted by a fixed
/// number of days (positive or negative). `VALUE` is nulled: after the
/// shift the value no longer describes the date it sits on.
pub struct TimeShiftPhenotype {
    name: ArcStr,
    phenotype: Arc<dyn ComputeNode>,
    days: i64,
}

impl TimeShiftPhenotype {
    pub fn new(name: impl Into<ArcStr>, phenotype: Arc<dyn ComputeNode>, days: i64) -> Self {
        TimeShiftPhenotype {
            name: name.into(),
            phenotype,
            days,
        }
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "TimeShiftPhenotype")?;
        let phenotype = crate::serialize::optional_node(value, "phenotype")?
            .ok_or_else(|| Error::config("TimeShiftPhenotype missing 'phenotype'"))?;
        let days = value
            .get("days")
            .and_then(Json::as_i64)
            .ok_or_else(|| Error::config("TimeShiftPhenotype missing integer 'days'"))?;
        Ok(Arc::new(TimeShiftPhenotype::new(name, phenotype, days)))
    }
}

impl ComputeNode for TimeShiftPhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        vec![self.phenotype.clone()]
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "TimeShiftPhenotype",
            "name": &*self.name,
            "phenotype": self.phenotype.to_dict(),
            "days": self.days,
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let child_name = canonical_name(&*self.phenotype);
        let child = tables.get(&child_name).ok_or(Error::Lookup {
            parent: self.name.to_string(),
            child: child_name.to_string(),
        })?;
        let shifted = child.mutate_many(&[
            (
                columns::EVENT_DATE,
                col(columns::EVENT_DATE).add_days(self.days),
            ),
            (columns::VALUE, lit(Datum::Null)),
        ])?;
        select_phenotype_columns(&shifted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codelist::Codelist;
    use crate::phenotypes::test_util::{date, run};
    use crate::phenotypes::{CodelistPhenotype, ReturnDate};

    fn tables() -> TableMap {
        let table = Table::builder(["PERSON_ID", "CODE", "CODE_TYPE", "EVENT_DATE"])
            .row([
                Datum::from("P1"),
                Datum::from("c1"),
                Datum::from("ICD10"),
                Datum::from(date(2022, 1, 10)),
            ])
            .row([
                Datum::from("P2"),
                Datum::from("c1"),
                Datum::from("ICD10"),
                Datum::from(date(2022, 3, 1)),
            ])
            .build()
            .unwrap();
        let mut tables = TableMap::new();
        tables.insert("CONDITION_OCCURRENCE".into(), table);
        tables
    }

    #[test]
    fn shifts_forward_and_backward() {
        let base: Arc<dyn ComputeNode> = Arc::new(
            CodelistPhenotype::new("CONDITION_OCCURRENCE", Codelist::from_codes("c1", ["c1"]))
                .with_return_date(ReturnDate::All),
        );
        let forward = TimeShiftPhenotype::new("washout_end", base.clone(), 30);
        let out = run(&forward, &tables());
        assert_eq!(out.rows()[0][2], Datum::from(date(2022, 2, 9)));
        assert!(out.rows()[0][3].is_null());

        let backward = TimeShiftPhenotype::new("lookback_start", base, -10);
        let out = run(&backward, &tables());
        assert_eq!(out.rows()[0][2], Datum::from(date(2021, 12, 31)));
    }
}
