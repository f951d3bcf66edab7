use super::{person_dates, select_phenotype_columns, ReturnDate};
use crate::{
    columns,
    node::{canonical_name, ComputeNode},
    relational::{Datum, Table},
    ArcStr, Error, Result, TableMap,
};
use serde_json::{json, Value as Json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A boolean expression over phenotype membership, built with
/// [`logic_and`], [`logic_or`] and [`logic_not`].
#[derive(Clone)]
pub enum LogicExpr {
    Phenotype(Arc<dyn ComputeNode>),
    And(Box<LogicExpr>, Box<LogicExpr>),
    Or(Box<LogicExpr>, Box<LogicExpr>),
    Not(Box<LogicExpr>),
}

pub fn logic_and(lhs: impl Into<LogicExpr>, rhs: impl Into<LogicExpr>) -> LogicExpr {
    LogicExpr::And(Box::new(lhs.into()), Box::new(rhs.into()))
}

pub fn logic_or(lhs: impl Into<LogicExpr>, rhs: impl Into<LogicExpr>) -> LogicExpr {
    LogicExpr::Or(Box::new(lhs.into()), Box::new(rhs.into()))
}

pub fn logic_not(inner: impl Into<LogicExpr>) -> LogicExpr {
    LogicExpr::Not(Box::new(inner.into()))
}

impl From<Arc<dyn ComputeNode>> for LogicExpr {
    fn from(node: Arc<dyn ComputeNode>) -> Self {
        LogicExpr::Phenotype(node)
    }
}

fn merge_contributions(
    mut lhs: BTreeMap<ArcStr, BTreeSet<Datum>>,
    rhs: BTreeMap<ArcStr, BTreeSet<Datum>>,
) -> BTreeMap<ArcStr, BTreeSet<Datum>> {
    for (name, members) in rhs {
        lhs.entry(name).or_default().extend(members);
    }
    lhs
}

impl LogicExpr {
    /// Leaf phenotypes, one entry per distinct name.
    fn leaves(&self, out: &mut Vec<Arc<dyn ComputeNode>>) {
        match self {
            LogicExpr::Phenotype(node) => {
                let name = canonical_name(&**node);
                if !out.iter().any(|c| canonical_name(&**c) == name) {
                    out.push(node.clone());
                }
            }
            LogicExpr::And(lhs, rhs) | LogicExpr::Or(lhs, rhs) => {
                lhs.leaves(out);
                rhs.leaves(out);
            }
            LogicExpr::Not(inner) => inner.leaves(out),
        }
    }

    /// The subjects satisfying this (sub)expression, plus, per leaf, the
    /// subjects for which that leaf sits on a *satisfied* branch — those
    /// are the rows allowed to contribute a date. A leaf under a
    /// conjunction contributes only where the whole conjunction holds; a
    /// leaf under a negation never contributes.
    fn evaluate(
        &self,
        membership: &BTreeMap<ArcStr, BTreeSet<Datum>>,
        universe: &BTreeSet<Datum>,
    ) -> (BTreeSet<Datum>, BTreeMap<ArcStr, BTreeSet<Datum>>) {
        match self {
            LogicExpr::Phenotype(node) => {
                let name = canonical_name(&**node);
                let subjects = membership.get(&name).cloned().unwrap_or_default();
                let mut contributions = BTreeMap::new();
                contributions.insert(name, subjects.clone());
                (subjects, contributions)
            }
            LogicExpr::And(lhs, rhs) => {
                let (l_set, l_contrib) = lhs.evaluate(membership, universe);
                let (r_set, r_contrib) = rhs.evaluate(membership, universe);
                let subjects: BTreeSet<Datum> = l_set.intersection(&r_set).cloned().collect();
                let mut contributions = merge_contributions(l_contrib, r_contrib);
                for members in contributions.values_mut() {
                    *members = members.intersection(&subjects).cloned().collect();
                }
                (subjects, contributions)
            }
            LogicExpr::Or(lhs, rhs) => {
                let (l_set, l_contrib) = lhs.evaluate(membership, universe);
                let (r_set, r_contrib) = rhs.evaluate(membership, universe);
                let subjects = l_set.union(&r_set).cloned().collect();
                (subjects, merge_contributions(l_contrib, r_contrib))
            }
            LogicExpr::Not(inner) => {
                let (inner_set, _) = inner.evaluate(membership, universe);
                let subjects = universe.difference(&inner_set).cloned().collect();
                (subjects, BTreeMap::new())
            }
        }
    }

    pub fn to_dict(&self) -> Json {
        match self {
            LogicExpr::Phenotype(node) => node.to_dict(),
            LogicExpr::And(lhs, rhs) => json!({
                "class_name": "LogicAnd",
                "left": lhs.to_dict(),
                "right": rhs.to_dict(),
            }),
            LogicExpr::Or(lhs, rhs) => json!({
                "class_name": "LogicOr",
                "left": lhs.to_dict(),
                "right": rhs.to_dict(),
            }),
            LogicExpr::Not(inner) => json!({
                "class_name": "LogicNot",
                "operand": inner.to_dict(),
            }),
        }
    }

    pub fn from_dict(value: &Json) -> Result<Self> {
        let class = crate::serialize::get_str(value, "class_name", "logic expression")?;
        let child = |key: &str| -> Result<LogicExpr> {
            LogicExpr::from_dict(
                value
                    .get(key)
                    .ok_or_else(|| Error::config(format!("{class} missing '{key}'")))?,
            )
        };
        Ok(match class {
            "LogicAnd" => logic_and(child("left")?, child("right")?),
            "LogicOr" => logic_or(child("left")?, child("right")?),
            "LogicNot" => logic_not(child("operand")?),
            _ => LogicExpr::Phenotype(crate::serialize::node_from_dict(value)?),
        })
    }
}

/// How a logic phenotype resolves its event date.
#[derive(Clone)]
pub enum LogicReturnDate {
    /// Reduce the union of contributing dates (dates of operand phenotypes
    /// that are true for the subject).
    Reduce(ReturnDate),
    /// Use one named operand's date.
    FromPhenotype(ArcStr),
}

/// A subject qualifies iff the boolean expression over phenotype
/// membership is true. `VALUE` is null.
pub struct LogicPhenotype {
    name: ArcStr,
    expression: LogicExpr,
    return_date: LogicReturnDate,
}

impl LogicPhenotype {
    pub fn new(name: impl Into<ArcStr>, expression: LogicExpr) -> Self {
        LogicPhenotype {
            name: name.into(),
            expression,
            return_date: LogicReturnDate::Reduce(ReturnDate::First),
        }
    }

    pub fn with_return_date(mut self, return_date: LogicReturnDate) -> Self {
        self.return_date = return_date;
        self
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "LogicPhenotype")?;
        let expression = LogicExpr::from_dict(
            value
                .get("expression")
                .ok_or_else(|| Error::config("LogicPhenotype missing 'expression'"))?,
        )?;
        let return_date = match value.get("return_date") {
            Some(Json::String(s)) => LogicReturnDate::Reduce(ReturnDate::from_str(s)?),
            Some(Json::Object(map)) => LogicReturnDate::FromPhenotype(
                map.get("phenotype")
                    .and_then(Json::as_str)
                    .ok_or_else(|| Error::config("logic return_date object missing 'phenotype'"))?
                    .into(),
            ),
            _ => LogicReturnDate::Reduce(ReturnDate::First),
        };
        Ok(Arc::new(
            LogicPhenotype::new(name, expression).with_return_date(return_date),
        ))
    }
}

impl ComputeNode for LogicPhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        let mut out = Vec::new();
        self.expression.leaves(&mut out);
        out
    }

    fn to_dict(&self) -> Json {
        let return_date = match &self.return_date {
            LogicReturnDate::Reduce(rd) => json!(rd.as_str()),
            LogicReturnDate::FromPhenotype(name) => json!({ "phenotype": &**name }),
        };
        json!({
            "class_name": "LogicPhenotype",
            "name": &*self.name,
            "expression": self.expression.to_dict(),
            "return_date": return_date,
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let leaves = self.children();
        let mut membership: BTreeMap<ArcStr, BTreeSet<Datum>> = BTreeMap::new();
        let mut leaf_tables: BTreeMap<ArcStr, Table> = BTreeMap::new();
        for leaf in &leaves {
            let leaf_name = canonical_name(&**leaf);
            let table = tables.get(&leaf_name).ok_or(Error::Lookup {
                parent: self.name.to_string(),
                child: leaf_name.to_string(),
            })?;
            let subjects: BTreeSet<Datum> = table
                .column_values(columns::PERSON_ID)?
                .into_iter()
                .filter(|v| !v.is_null())
                .collect();
            membership.insert(leaf_name.clone(), subjects);
            leaf_tables.insert(leaf_name, table.clone());
        }

        // `not` complements against the person domain when available,
        // else against every subject any operand mentions
        let universe: BTreeSet<Datum> = match tables.get("PERSON") {
            Some(person) => person
                .column_values(columns::PERSON_ID)?
                .into_iter()
                .filter(|v| !v.is_null())
                .collect(),
            None => membership.values().flatten().cloned().collect(),
        };

        let (qualifying, contributions) = self.expression.evaluate(&membership, &universe);

        // contributing dates: each leaf's rows, restricted to the subjects
        // for which that leaf is on a satisfied branch
        let empty = BTreeSet::new();
        let mut date_rows = Table::builder([columns::PERSON_ID, columns::EVENT_DATE]);
        let contributing: Vec<ArcStr> = match &self.return_date {
            LogicReturnDate::FromPhenotype(name) => {
                let wanted = crate::connector::canonical_name(name);
                if !leaf_tables.contains_key(&wanted) {
                    return Err(Error::config(format!(
                        "logic return_date references '{name}' which is not in the expression"
                    )));
                }
                vec![wanted]
            }
            LogicReturnDate::Reduce(_) => leaf_tables.keys().cloned().collect(),
        };
        for leaf_name in contributing {
            let allowed: &BTreeSet<Datum> = match &self.return_date {
                // the named operand's date is taken wherever it exists
                LogicReturnDate::FromPhenotype(_) => &qualifying,
                LogicReturnDate::Reduce(_) => contributions.get(&leaf_name).unwrap_or(&empty),
            };
            let dates = person_dates(&leaf_tables[&leaf_name])?;
            let person_idx = dates.require_column(columns::PERSON_ID, "logic phenotype")?;
            let date_idx = dates.require_column(columns::EVENT_DATE, "logic phenotype")?;
            for row in dates.rows() {
                if allowed.contains(&row[person_idx]) && !row[date_idx].is_null() {
                    date_rows.push([row[person_idx].clone(), row[date_idx].clone()]);
                }
            }
        }
        let date_table = date_rows.build()?.distinct();

        let reduced = match &self.return_date {
            LogicReturnDate::Reduce(ReturnDate::All) => date_table,
            LogicReturnDate::Reduce(ReturnDate::Nearest) => {
                return Err(Error::config(
                    "return_date 'nearest' is ambiguous for logic phenotypes",
                ))
            }
            LogicReturnDate::Reduce(rd) => super::reduce_dates(&date_table, *rd, false, None)?,
            // the named operand is already reduced per subject; keep its
            // earliest date if not
            LogicReturnDate::FromPhenotype(_) => {
                super::reduce_dates(&date_table, ReturnDate::First, false, None)?
            }
        };

        // qualifying subjects with no contributing date still belong to
        // the phenotype, with a null date
        let mut builder = Table::builder([columns::PERSON_ID, columns::EVENT_DATE, columns::VALUE]);
        let date_person_idx = reduced.require_column(columns::PERSON_ID, "logic phenotype")?;
        let date_idx = reduced.require_column(columns::EVENT_DATE, "logic phenotype")?;
        let mut dated: BTreeSet<Datum> = BTreeSet::new();
        for row in reduced.rows() {
            if qualifying.contains(&row[date_person_idx]) {
                dated.insert(row[date_person_idx].clone());
                builder.push([row[date_person_idx].clone(), row[date_idx].clone(), Datum::Null]);
            }
        }
        for person in &qualifying {
            if !dated.contains(person) {
                builder.push([person.clone(), Datum::Null, Datum::Null]);
            }
        }
        select_phenotype_columns(&builder.build()?)
    }
}
