use super::{reduce_dates, select_phenotype_columns, ReturnDate};
use crate::{
    columns,
    node::ComputeNode,
    relational::{col, Join, Table},
    ArcStr, Result, TableMap,
};
use serde_json::{json, Value as Json};
use std::sync::Arc;

/// Rows of `phenotype` sharing an encounter with the subject's
/// `anchor_phenotype` row: both component row sources must carry
/// `column_name` (the encounter id), and null ids never match.
///
/// Matching happens on the components' *source rows* (all their filters
/// applied, source columns kept), since encounter ids are not part of the
/// phenotype output shape.
pub struct WithinSameEncounterPhenotype {
    name: ArcStr,
    anchor_phenotype: Arc<dyn ComputeNode>,
    phenotype: Arc<dyn ComputeNode>,
    column_name: ArcStr,
    return_date: ReturnDate,
}

impl WithinSameEncounterPhenotype {
    pub fn new(
        name: impl Into<ArcStr>,
        anchor_phenotype: Arc<dyn ComputeNode>,
        phenotype: Arc<dyn ComputeNode>,
        column_name: impl Into<ArcStr>,
    ) -> Self {
        WithinSameEncounterPhenotype {
            name: name.into(),
            anchor_phenotype,
            phenotype,
            column_name: column_name.into(),
            return_date: ReturnDate::First,
        }
    }

    pub fn with_return_date(mut self, return_date: ReturnDate) -> Self {
        self.return_date = return_date;
        self
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "WithinSameEncounterPhenotype")?;
        let anchor = crate::serialize::optional_node(value, "anchor_phenotype")?.ok_or_else(
            || crate::Error::config("WithinSameEncounterPhenotype missing 'anchor_phenotype'"),
        )?;
        let phenotype = crate::serialize::optional_node(value, "phenotype")?.ok_or_else(|| {
            crate::Error::config("WithinSameEncounterPhenotype missing 'phenotype'")
        })?;
        let column_name =
            crate::serialize::get_str(value, "column_name", "WithinSameEncounterPhenotype")?;
        let return_date = ReturnDate::from_str(crate::serialize::get_str(
            value,
            "return_date",
            "WithinSameEncounterPhenotype",
        )?)?;
        Ok(Arc::new(
            WithinSameEncounterPhenotype::new(name, anchor, phenotype, column_name)
                .with_return_date(return_date),
        ))
    }
}

impl ComputeNode for WithinSameEncounterPhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        vec![self.anchor_phenotype.clone(), self.phenotype.clone()]
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "WithinSameEncounterPhenotype",
            "name": &*self.name,
            "anchor_phenotype": self.anchor_phenotype.to_dict(),
            "phenotype": self.phenotype.to_dict(),
            "column_name": &*self.column_name,
            "return_date": self.return_date.as_str(),
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let column = &*self.column_name;
        let anchor_rows = self.anchor_phenotype.execute_rows(tables)?;
        anchor_rows.require_column(column, "within same encounter")?;
        let anchor_keys = anchor_rows
            .filter(&col(column).is_not_null())?
            .select(&[columns::PERSON_ID, column])?
            .distinct();

        let rows = self.phenotype.execute_rows(tables)?;
        rows.require_column(column, "within same encounter")?;
        let matched = rows
            .filter(&col(column).is_not_null())?
            .join(&anchor_keys, &[columns::PERSON_ID, column], Join::Semi)?;

        let reduced = reduce_dates(&matched, self.return_date, true, None)?;
        select_phenotype_columns(&reduced)
    }
}
