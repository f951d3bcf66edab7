use super::{domain_table, select_phenotype_columns};
use crate::{
    columns,
    filters::ValueFilter,
    node::{canonical_name, ComputeNode},
    relational::{col, lit, Expr, Join, Table},
    ArcStr, Error, Result, TableMap,
};
use serde_json::{json, Value as Json};
use std::sync::Arc;

const ANCHOR_DATE: &str = "__ANCHOR_DATE";

/// Whole years between birth and the anchor date (the subject's
/// `INDEX_DATE`, or an anchor phenotype's event date).
///
/// A null `DATE_OF_BIRTH` is assembled from `YEAR_OF_BIRTH` /
/// `MONTH_OF_BIRTH` / `DAY_OF_BIRTH`, imputing missing month and day.
/// `VALUE` is the age, `EVENT_DATE` the anchor date.
pub struct AgePhenotype {
    name: ArcStr,
    domain: ArcStr,
    value_filter: Option<ValueFilter>,
    impute_month: u32,
    impute_day: u32,
    anchor_phenotype: Option<Arc<dyn ComputeNode>>,
}

impl Default for AgePhenotype {
    fn default() -> Self {
        Self::new()
    }
}

impl AgePhenotype {
    pub fn new() -> Self {
        AgePhenotype {
            name: "age".into(),
            domain: "PERSON".into(),
            value_filter: None,
            impute_month: 6,
            impute_day: 1,
            anchor_phenotype: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<ArcStr>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_domain(mut self, domain: impl Into<ArcStr>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_value_filter(mut self, value_filter: ValueFilter) -> Self {
        self.value_filter = Some(value_filter);
        self
    }

    pub fn with_imputation(mut self, month: u32, day: u32) -> Self {
        self.impute_month = month;
        self.impute_day = day;
        self
    }

    pub fn with_anchor(mut self, anchor: Arc<dyn ComputeNode>) -> Self {
        self.anchor_phenotype = Some(anchor);
        self
    }

    /// Birth date: the explicit column when present and non-null, else
    /// assembled from components with imputation.
    fn birth_date_expr(&self, table: &Table) -> Result<Expr> {
        let explicit = table.has_column(columns::DATE_OF_BIRTH);
        let components = table.has_column(columns::YEAR_OF_BIRTH);
        if !explicit && !components {
            return Err(Error::schema(
                columns::DATE_OF_BIRTH,
                "age needs a birth date or a birth year",
            ));
        }
        let assembled = if components {
            let month = if table.has_column(columns::MONTH_OF_BIRTH) {
                Expr::case(
                    vec![(
                        col(columns::MONTH_OF_BIRTH).is_not_null(),
                        col(columns::MONTH_OF_BIRTH),
                    )],
                    lit(self.impute_month as i64),
                )
            } else {
                lit(self.impute_month as i64)
            };
            let day = if table.has_column(columns::DAY_OF_BIRTH) {
                Expr::case(
                    vec![(
                        col(columns::DAY_OF_BIRTH).is_not_null(),
                        col(columns::DAY_OF_BIRTH),
                    )],
                    lit(self.impute_day as i64),
                )
            } else {
                lit(self.impute_day as i64)
            };
            Some(Expr::MakeDate {
                year: Box::new(col(columns::YEAR_OF_BIRTH)),
                month: Box::new(month),
                day: Box::new(day),
            })
        } else {
            None
        };
        Ok(match (explicit, assembled) {
            (true, Some(assembled)) => Expr::case(
                vec![(
                    col(columns::DATE_OF_BIRTH).is_not_null(),
                    col(columns::DATE_OF_BIRTH),
                )],
                assembled,
            ),
            (true, None) => col(columns::DATE_OF_BIRTH),
            (false, Some(assembled)) => assembled,
            (false, None) => unreachable!("checked above"),
        })
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "AgePhenotype")?;
        let domain = crate::serialize::get_str(value, "domain", "AgePhenotype")?;
        let value_filter = match value.get("value_filter") {
            None | Some(Json::Null) => None,
            Some(v) => Some(ValueFilter::from_dict(v)?),
        };
        let impute_month = value
            .get("impute_month")
            .and_then(Json::as_u64)
            .unwrap_or(6) as u32;
        let impute_day = value.get("impute_day").and_then(Json::as_u64).unwrap_or(1) as u32;
        Ok(Arc::new(AgePhenotype {
            name: name.into(),
            domain: domain.into(),
            value_filter,
            impute_month,
            impute_day,
            anchor_phenotype: crate::serialize::optional_node(value, "anchor_phenotype")?,
        }))
    }
}

impl ComputeNode for AgePhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        self.anchor_phenotype.iter().cloned().collect()
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "AgePhenotype",
            "name": &*self.name,
            "domain": &*self.domain,
            "value_filter": self.value_filter.as_ref().map(ValueFilter::to_dict),
            "impute_month": self.impute_month,
            "impute_day": self.impute_day,
            "anchor_phenotype": self.anchor_phenotype.as_ref().map(|p| p.to_dict()),
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let person = domain_table(tables, &self.domain)?;
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
                    person.join(&dates, &[columns::PERSON_ID], Join::Inner)?,
                    ANCHOR_DATE,
                )
            }
            None => {
                person.require_column(columns::INDEX_DATE, "age phenotype")?;
                (person.clone(), columns::INDEX_DATE)
            }
        };
        let birth = self.birth_date_expr(&table)?;
        let age = col(anchor_col).years_since(birth);
        let mut out = table
            .mutate_many(&[
                (columns::VALUE, age),
                (columns::EVENT_DATE, col(anchor_col)),
            ])?
            .filter(&col(columns::VALUE).is_not_null())?;
        if let Some(value_filter) = &self.value_filter {
            out = value_filter.filter(&out)?;
        }
        select_phenotype_columns(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::Value;
    use crate::phenotypes::test_util::{date, persons, run};
    use crate::Datum;

    fn person_tables() -> TableMap {
        let index = date(2020, 5, 10);
        let table = Table::builder([
            "PERSON_ID",
            "DATE_OF_BIRTH",
            "YEAR_OF_BIRTH",
            "INDEX_DATE",
        ])
        .row([
            Datum::from("P1"),
            Datum::from(date(2000, 3, 1)),
            Datum::from(2000),
            Datum::from(index),
        ])
        .row([
            Datum::from("P2"),
            Datum::Null,
            Datum::from(2010),
            Datum::from(index),
        ])
        .row([
            Datum::from("P3"),
            Datum::from(date(2002, 6, 1)),
            Datum::from(2002),
            Datum::from(index),
        ])
        .build()
        .unwrap();
        let mut tables = TableMap::new();
        tables.insert("PERSON".into(), table);
        tables
    }

    #[test]
    fn whole_years_at_anchor() {
        let out = run(&AgePhenotype::new(), &person_tables());
        let value_of = |p: &str| {
            out.rows()
                .iter()
                .find(|r| r[0] == Datum::from(p))
                .unwrap()[3]
                .clone()
        };
        assert_eq!(value_of("P1"), Datum::Int(20));
        // P3's birthday (June 1st) is after the May index date
        assert_eq!(value_of("P3"), Datum::Int(17));
    }

    #[test]
    fn null_birth_date_imputes_from_year() {
        let out = run(&AgePhenotype::new(), &person_tables());
        let p2 = out
            .rows()
            .iter()
            .find(|r| r[0] == Datum::from("P2"))
            .unwrap();
        // imputed 2010-06-01, after the May anchor
        assert_eq!(p2[3], Datum::Int(9));
        assert_eq!(p2[2], Datum::from(date(2020, 5, 10)));
    }

    #[test]
    fn age_bound_is_an_inclusion_criterion() {
        let pt = AgePhenotype::new()
            .with_value_filter(ValueFilter::min(Value::greater_than_or_equal_to(18)));
        let out = run(&pt, &person_tables());
        assert_eq!(persons(&out), vec!["P1"]);
    }
}
