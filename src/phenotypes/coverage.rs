use super::{domain_table, reduce_dates, select_phenotype_columns, ReturnDate};
use crate::{
    columns,
    filters::{RelativeTimeRangeFilter, Value, When},
    node::{canonical_name, ComputeNode},
    relational::{col, Join, Table},
    ArcStr, Error, Result, TableMap,
};
use serde_json::{json, Value as Json};
use std::sync::Arc;

const ANCHOR_DATE: &str = "__ANCHOR_DATE";
const COVERED_DAYS: &str = "__COVERED_DAYS";

/// Subjects whose coverage period contains the anchor date and extends at
/// least `min_days` on the chosen side of it.
///
/// Consumes a period-shaped domain (`START_DATE`/`END_DATE`). The anchor
/// is the row's `INDEX_DATE`, or an anchor phenotype's per-subject date.
/// `EVENT_DATE` is the period end (`before`) or start (`after`); `VALUE`
/// is null.
pub struct ContinuousCoveragePhenotype {
    name: ArcStr,
    domain: ArcStr,
    min_days: Option<Value>,
    when: When,
    anchor_phenotype: Option<Arc<dyn ComputeNode>>,
    return_date: ReturnDate,
}

impl ContinuousCoveragePhenotype {
    pub fn new(name: impl Into<ArcStr>, domain: impl Into<ArcStr>) -> Self {
        ContinuousCoveragePhenotype {
            name: name.into(),
            domain: domain.into(),
            min_days: None,
            when: When::Before,
            anchor_phenotype: None,
            return_date: ReturnDate::First,
        }
    }

    pub fn with_min_days(mut self, min_days: Value) -> Self {
        self.min_days = Some(min_days);
        self
    }

    pub fn with_when(mut self, when: When) -> Self {
        self.when = when;
        self
    }

    pub fn with_anchor(mut self, anchor: Arc<dyn ComputeNode>) -> Self {
        self.anchor_phenotype = Some(anchor);
        self
    }

    pub fn with_return_date(mut self, return_date: ReturnDate) -> Self {
        self.return_date = return_date;
        self
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "ContinuousCoveragePhenotype")?;
        let domain = crate::serialize::get_str(value, "domain", "ContinuousCoveragePhenotype")?;
        let min_days = match value.get("min_days") {
            None | Some(Json::Null) => None,
            Some(v) => Some(Value::from_dict(v)?),
        };
        let when = When::from_str(crate::serialize::get_str(
            value,
            "when",
            "ContinuousCoveragePhenotype",
        )?)?;
        let return_date = ReturnDate::from_str(crate::serialize::get_str(
            value,
            "return_date",
            "ContinuousCoveragePhenotype",
        )?)?;
        let mut pt = ContinuousCoveragePhenotype::new(name, domain)
            .with_when(when)
            .with_return_date(return_date);
        pt.min_days = min_days;
        pt.anchor_phenotype = crate::serialize::optional_node(value, "anchor_phenotype")?;
        Ok(Arc::new(pt))
    }
}

impl ComputeNode for ContinuousCoveragePhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        self.anchor_phenotype.iter().cloned().collect()
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "ContinuousCoveragePhenotype",
            "name": &*self.name,
            "domain": &*self.domain,
            "min_days": self.min_days.as_ref().map(Value::to_dict),
            "when": self.when.as_str(),
            "anchor_phenotype": self.anchor_phenotype.as_ref().map(|p| p.to_dict()),
            "return_date": self.return_date.as_str(),
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let table = domain_table(tables, &self.domain)?;
        table.require_column(columns::START_DATE, "continuous coverage")?;
        table.require_column(columns::END_DATE, "continuous coverage")?;

        let (table, anchor_col) = match &self.anchor_phenotype {
            Some(anchor) => {
                let anchor_name = canonical_name(&**anchor);
                let anchor_table = tables.get(&anchor_name).ok_or(Error::Lookup {
                    parent: self.name.to_string(),
                    child: anchor_name.to_string(),
                })?;
                let dates = anchor_table
                    .select(&[columns::PERSON_ID, columns::EVENT_DATE])?
                    .rename(columns::EVENT_DATE, ANCHOR_DATE)?
                    .distinct();
                (
                    table.join(&dates, &[columns::PERSON_ID], Join::Inner)?,
                    ANCHOR_DATE,
                )
            }
            None => {
                table.require_column(columns::INDEX_DATE, "continuous coverage")?;
                (table.clone(), columns::INDEX_DATE)
            }
        };

        // the period must contain the anchor day
        let covering = col(columns::START_DATE)
            .lte(col(anchor_col))
            .and(col(columns::END_DATE).gte(col(anchor_col)));
        let covered = match self.when {
            When::Before => col(anchor_col).days_since(col(columns::START_DATE)),
            When::After => col(columns::END_DATE).days_since(col(anchor_col)),
        };
        let mut out = table
            .filter(&covering)?
            .mutate(COVERED_DAYS, &covered)?;
        if let Some(min_days) = &self.min_days {
            out = out.filter(&min_days.to_expr(col(COVERED_DAYS)))?;
        }
        let endpoint = match self.when {
            When::Before => columns::END_DATE,
            When::After => columns::START_DATE,
        };
        let out = out.mutate(columns::EVENT_DATE, &col(endpoint))?;
        let reduced = reduce_dates(&out, self.return_date, false, None)?;
        select_phenotype_columns(&reduced)
    }
}
