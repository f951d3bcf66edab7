use crate::{
    relational::{col, Expr, Table},
    ArcStr, Datum, Error, Result,
};
use serde_json::{json, Value as Json};

/// Row-level set membership on a categorical column, composable with
/// [`filter_and`], [`filter_or`] and [`filter_not`] into a boolean tree
/// evaluated on the same row.
#[derive(Debug, Clone, PartialEq)]
pub enum CategoricalFilter {
    IsIn {
        column_name: ArcStr,
        allowed_values: Vec<Datum>,
        /// Which domain table the column lives in; consulted by
        /// phenotypes that accept filters spanning several domains.
        domain: Option<ArcStr>,
    },
    And(Box<CategoricalFilter>, Box<CategoricalFilter>),
    Or(Box<CategoricalFilter>, Box<CategoricalFilter>),
    Not(Box<CategoricalFilter>),
}

pub fn filter_and(lhs: CategoricalFilter, rhs: CategoricalFilter) -> CategoricalFilter {
    CategoricalFilter::And(Box::new(lhs), Box::new(rhs))
}

pub fn filter_or(lhs: CategoricalFilter, rhs: CategoricalFilter) -> CategoricalFilter {
    CategoricalFilter::Or(Box::new(lhs), Box::new(rhs))
}

pub fn filter_not(inner: CategoricalFilter) -> CategoricalFilter {
    CategoricalFilter::Not(Box::new(inner))
}

impl CategoricalFilter {
    pub fn is_in<I, D>(column_name: impl Into<ArcStr>, allowed_values: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Datum>,
    {
        CategoricalFilter::IsIn {
            column_name: column_name.into(),
            allowed_values: allowed_values.into_iter().map(Into::into).collect(),
            domain: None,
        }
    }

    pub fn with_domain(self, domain: impl Into<ArcStr>) -> Self {
        match self {
            CategoricalFilter::IsIn {
                column_name,
                allowed_values,
                ..
            } => CategoricalFilter::IsIn {
                column_name,
                allowed_values,
                domain: Some(domain.into()),
            },
            other => other,
        }
    }

    /// The predicate over one row.
    pub fn to_expr(&self) -> Expr {
        match self {
            CategoricalFilter::IsIn {
                column_name,
                allowed_values,
                ..
            } => col(column_name.clone()).in_list(allowed_values.clone()),
            CategoricalFilter::And(lhs, rhs) => lhs.to_expr().and(rhs.to_expr()),
            CategoricalFilter::Or(lhs, rhs) => lhs.to_expr().or(rhs.to_expr()),
            CategoricalFilter::Not(inner) => inner.to_expr().not(),
        }
    }

    pub fn filter(&self, table: &Table) -> Result<Table> {
        for column in self.columns() {
            table.require_column(&column, "categorical filter")?;
        }
        table.filter(&self.to_expr())
    }

    /// Every column referenced anywhere in the tree.
    pub fn columns(&self) -> Vec<ArcStr> {
        match self {
            CategoricalFilter::IsIn { column_name, .. } => vec![column_name.clone()],
            CategoricalFilter::And(lhs, rhs) | CategoricalFilter::Or(lhs, rhs) => {
                let mut out = lhs.columns();
                out.extend(rhs.columns());
                out
            }
            CategoricalFilter::Not(inner) => inner.columns(),
        }
    }

    /// The first declared domain in the tree, if any.
    pub fn domain(&self) -> Option<&ArcStr> {
        match self {
            CategoricalFilter::IsIn { domain, .. } => domain.as_ref(),
            CategoricalFilter::And(lhs, rhs) | CategoricalFilter::Or(lhs, rhs) => {
                lhs.domain().or_else(|| rhs.domain())
            }
            CategoricalFilter::Not(inner) => inner.domain(),
        }
    }

    pub fn to_dict(&self) -> Json {
        match self {
            CategoricalFilter::IsIn {
                column_name,
                allowed_values,
                domain,
            } => json!({
                "class_name": "CategoricalFilter",
                "column_name": &**column_name,
                "allowed_values": allowed_values
                    .iter()
                    .map(crate::serialize::datum_to_json)
                    .collect::<Vec<_>>(),
                "domain": domain.as_deref(),
            }),
            CategoricalFilter::And(lhs, rhs) => json!({
                "class_name": "AndFilter",
                "left": lhs.to_dict(),
                "right": rhs.to_dict(),
            }),
            CategoricalFilter::Or(lhs, rhs) => json!({
                "class_name": "OrFilter",
                "left": lhs.to_dict(),
                "right": rhs.to_dict(),
            }),
            CategoricalFilter::Not(inner) => json!({
                "class_name": "NotFilter",
                "filter": inner.to_dict(),
            }),
        }
    }

    pub fn from_dict(value: &Json) -> Result<Self> {
        let class = value
            .get("class_name")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::config("categorical filter dict missing 'class_name'"))?;
        let child = |key: &str| -> Result<CategoricalFilter> {
            CategoricalFilter::from_dict(
                value
                    .get(key)
                    .ok_or_else(|| Error::config(format!("{class} dict missing '{key}'")))?,
            )
        };
        Ok(match class {
            "CategoricalFilter" => {
                let column_name = value
                    .get("column_name")
                    .and_then(Json::as_str)
                    .ok_or_else(|| Error::config("CategoricalFilter missing 'column_name'"))?;
                let allowed_values = value
                    .get("allowed_values")
                    .and_then(Json::as_array)
                    .ok_or_else(|| Error::config("CategoricalFilter missing 'allowed_values'"))?
                    .iter()
                    .map(crate::serialize::datum_from_json)
                    .collect::<Result<Vec<_>>>()?;
                let domain = value
                    .get("domain")
                    .and_then(Json::as_str)
                    .map(ArcStr::from);
                CategoricalFilter::IsIn {
                    column_name: column_name.into(),
                    allowed_values,
                    domain,
                }
            }
            "AndFilter" => filter_and(child("left")?, child("right")?),
            "OrFilter" => filter_or(child("left")?, child("right")?),
            "NotFilter" => filter_not(child("filter")?),
            other => {
                return Err(Error::config(format!(
                    "unknown categorical filter class '{other}'"
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        Table::builder(["PERSON_ID", "SEX", "STATUS"])
            .row([Datum::from("P1"), Datum::from("F"), Datum::from("inpatient")])
            .row([Datum::from("P2"), Datum::from("M"), Datum::from("inpatient")])
            .row([Datum::from("P3"), Datum::from("F"), Datum::from("outpatient")])
            .row([Datum::from("P4"), Datum::Null, Datum::from("outpatient")])
            .build()
            .unwrap()
    }

    #[test]
    fn composition_evaluates_on_the_same_row() {
        let female = CategoricalFilter::is_in("SEX", ["F"]);
        let inpatient = CategoricalFilter::is_in("STATUS", ["inpatient"]);
        let out = filter_and(female.clone(), inpatient).filter(&table()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.rows()[0][0], Datum::from("P1"));

        let not_female = filter_not(female);
        let out = not_female.filter(&table()).unwrap();
        // null category is neither F nor not-F
        assert_eq!(out.len(), 1);
        assert_eq!(out.rows()[0][0], Datum::from("P2"));
    }

    #[test]
    fn dict_round_trip() {
        let f = filter_or(
            CategoricalFilter::is_in("SEX", ["F"]).with_domain("PERSON"),
            filter_not(CategoricalFilter::is_in("STATUS", ["inpatient"])),
        );
        let restored = CategoricalFilter::from_dict(&f.to_dict()).unwrap();
        assert_eq!(f, restored);
    }
}
