use super::select_phenotype_columns;
use crate::{
    columns,
    filters::ValueFilter,
    node::{canonical_name, ComputeNode},
    relational::{Datum, Table},
    ArcStr, Error, Result, TableMap,
};
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A numeric expression tree over phenotype values, built with
/// [`arith_add`] and friends. The same tree drives both
/// [`ArithmeticPhenotype`] (operands contribute their `VALUE`) and
/// [`ScorePhenotype`] (operands contribute 1 when present, 0 when not).
#[derive(Clone)]
pub enum ArithmeticExpr {
    Phenotype(Arc<dyn ComputeNode>),
    Constant(f64),
    Add(Box<ArithmeticExpr>, Box<ArithmeticExpr>),
    Sub(Box<ArithmeticExpr>, Box<ArithmeticExpr>),
    Mul(Box<ArithmeticExpr>, Box<ArithmeticExpr>),
    Div(Box<ArithmeticExpr>, Box<ArithmeticExpr>),
    Pow(Box<ArithmeticExpr>, Box<ArithmeticExpr>),
}

pub fn arith_add(lhs: impl Into<ArithmeticExpr>, rhs: impl Into<ArithmeticExpr>) -> ArithmeticExpr {
    ArithmeticExpr::Add(Box::new(lhs.into()), Box::new(rhs.into()))
}

pub fn arith_sub(lhs: impl Into<ArithmeticExpr>, rhs: impl Into<ArithmeticExpr>) -> ArithmeticExpr {
    ArithmeticExpr::Sub(Box::new(lhs.into()), Box::new(rhs.into()))
}

pub fn arith_mul(lhs: impl Into<ArithmeticExpr>, rhs: impl Into<ArithmeticExpr>) -> ArithmeticExpr {
    ArithmeticExpr::Mul(Box::new(lhs.into()), Box::new(rhs.into()))
}

pub fn arith_div(lhs: impl Into<ArithmeticExpr>, rhs: impl Into<ArithmeticExpr>) -> ArithmeticExpr {
    ArithmeticExpr::Div(Box::new(lhs.into()), Box::new(rhs.into()))
}

pub fn arith_pow(lhs: impl Into<ArithmeticExpr>, rhs: impl Into<ArithmeticExpr>) -> ArithmeticExpr {
    ArithmeticExpr::Pow(Box::new(lhs.into()), Box::new(rhs.into()))
}

/// Unweighted sum of the given phenotypes, the common score shape.
pub fn score_sum<I>(phenotypes: I) -> ArithmeticExpr
where
    I: IntoIterator<Item = Arc<dyn ComputeNode>>,
{
    let mut iter = phenotypes.into_iter();
    let first = iter
        .next()
        .map(ArithmeticExpr::Phenotype)
        .unwrap_or(ArithmeticExpr::Constant(0.0));
    iter.fold(first, |acc, pt| arith_add(acc, ArithmeticExpr::Phenotype(pt)))
}

impl From<Arc<dyn ComputeNode>> for ArithmeticExpr {
    fn from(node: Arc<dyn ComputeNode>) -> Self {
        ArithmeticExpr::Phenotype(node)
    }
}

impl From<f64> for ArithmeticExpr {
    fn from(value: f64) -> Self {
        ArithmeticExpr::Constant(value)
    }
}

impl ArithmeticExpr {
    fn leaves(&self, out: &mut Vec<Arc<dyn ComputeNode>>) {
        match self {
            ArithmeticExpr::Phenotype(node) => {
                let name = canonical_name(&**node);
                if !out.iter().any(|c| canonical_name(&**c) == name) {
                    out.push(node.clone());
                }
            }
            ArithmeticExpr::Constant(_) => {}
            ArithmeticExpr::Add(lhs, rhs)
            | ArithmeticExpr::Sub(lhs, rhs)
            | ArithmeticExpr::Mul(lhs, rhs)
            | ArithmeticExpr::Div(lhs, rhs)
            | ArithmeticExpr::Pow(lhs, rhs) => {
                lhs.leaves(out);
                rhs.leaves(out);
            }
        }
    }

    /// Evaluate for one subject; `None` when an operand is missing (or a
    /// division hits zero).
    fn evaluate(&self, operands: &BTreeMap<ArcStr, f64>) -> Option<f64> {
        match self {
            ArithmeticExpr::Phenotype(node) => operands.get(&canonical_name(&**node)).copied(),
            ArithmeticExpr::Constant(value) => Some(*value),
            ArithmeticExpr::Add(lhs, rhs) => {
                Some(lhs.evaluate(operands)? + rhs.evaluate(operands)?)
            }
            ArithmeticExpr::Sub(lhs, rhs) => {
                Some(lhs.evaluate(operands)? - rhs.evaluate(operands)?)
            }
            ArithmeticExpr::Mul(lhs, rhs) => {
                Some(lhs.evaluate(operands)? * rhs.evaluate(operands)?)
            }
            ArithmeticExpr::Div(lhs, rhs) => {
                let denominator = rhs.evaluate(operands)?;
                if denominator == 0.0 {
                    None
                } else {
                    Some(lhs.evaluate(operands)? / denominator)
                }
            }
            ArithmeticExpr::Pow(lhs, rhs) => {
                Some(lhs.evaluate(operands)?.powf(rhs.evaluate(operands)?))
            }
        }
    }

    pub fn to_dict(&self) -> Json {
        let binary = |class: &str, lhs: &ArithmeticExpr, rhs: &ArithmeticExpr| {
            json!({"class_name": class, "left": lhs.to_dict(), "right": rhs.to_dict()})
        };
        match self {
            ArithmeticExpr::Phenotype(node) => node.to_dict(),
            ArithmeticExpr::Constant(value) => json!({"class_name": "Constant", "value": value}),
            ArithmeticExpr::Add(lhs, rhs) => binary("ArithAdd", lhs, rhs),
            ArithmeticExpr::Sub(lhs, rhs) => binary("ArithSub", lhs, rhs),
            ArithmeticExpr::Mul(lhs, rhs) => binary("ArithMul", lhs, rhs),
            ArithmeticExpr::Div(lhs, rhs) => binary("ArithDiv", lhs, rhs),
            ArithmeticExpr::Pow(lhs, rhs) => binary("ArithPow", lhs, rhs),
        }
    }

    pub fn from_dict(value: &Json) -> Result<Self> {
        let class = crate::serialize::get_str(value, "class_name", "arithmetic expression")?;
        let child = |key: &str| -> Result<ArithmeticExpr> {
            ArithmeticExpr::from_dict(
                value
                    .get(key)
                    .ok_or_else(|| Error::config(format!("{class} missing '{key}'")))?,
            )
        };
        Ok(match class {
            "Constant" => ArithmeticExpr::Constant(
                value
                    .get("value")
                    .and_then(Json::as_f64)
                    .ok_or_else(|| Error::config("Constant missing numeric 'value'"))?,
            ),
            "ArithAdd" => arith_add(child("left")?, child("right")?),
            "ArithSub" => arith_sub(child("left")?, child("right")?),
            "ArithMul" => arith_mul(child("left")?, child("right")?),
            "ArithDiv" => arith_div(child("left")?, child("right")?),
            "ArithPow" => arith_pow(child("left")?, child("right")?),
            _ => ArithmeticExpr::Phenotype(crate::serialize::node_from_dict(value)?),
        })
    }
}

/// Per-leaf membership and per-subject operand values for the expression
/// leaves. Subjects are the union of everyone any leaf mentions, sorted.
struct Operands {
    values: BTreeMap<Datum, BTreeMap<ArcStr, f64>>,
    membership: BTreeMap<ArcStr, std::collections::BTreeSet<Datum>>,
    subjects: Vec<Datum>,
}

fn collect_operands(
    parent: &str,
    leaves: &[Arc<dyn ComputeNode>],
    tables: &TableMap,
) -> Result<Operands> {
    let mut values: BTreeMap<Datum, BTreeMap<ArcStr, f64>> = BTreeMap::new();
    let mut membership: BTreeMap<ArcStr, std::collections::BTreeSet<Datum>> = BTreeMap::new();
    let mut subjects: Vec<Datum> = Vec::new();
    for leaf in leaves {
        let leaf_name = canonical_name(&**leaf);
        let table = tables.get(&leaf_name).ok_or(Error::Lookup {
            parent: parent.to_string(),
            child: leaf_name.to_string(),
        })?;
        let person_idx = table.require_column(columns::PERSON_ID, "arithmetic phenotype")?;
        let value_idx = table.require_column(columns::VALUE, "arithmetic phenotype")?;
        let members = membership.entry(leaf_name.clone()).or_default();
        for row in table.rows() {
            let person = row[person_idx].clone();
            if person.is_null() {
                continue;
            }
            if !subjects.contains(&person) {
                subjects.push(person.clone());
            }
            members.insert(person.clone());
            // first row per subject wins; leaves are usually reduced
            if let Some(value) = row[value_idx].as_f64() {
                values
                    .entry(person)
                    .or_default()
                    .entry(leaf_name.clone())
                    .or_insert(value);
            }
        }
    }
    subjects.sort();
    Ok(Operands {
        values,
        membership,
        subjects,
    })
}

/// `VALUE` is the arithmetic expression over operand phenotype values;
/// subjects missing any operand drop out. `EVENT_DATE` is null.
pub struct ArithmeticPhenotype {
    name: ArcStr,
    expression: ArithmeticExpr,
    value_filter: Option<ValueFilter>,
}

impl ArithmeticPhenotype {
    pub fn new(name: impl Into<ArcStr>, expression: ArithmeticExpr) -> Self {
        ArithmeticPhenotype {
            name: name.into(),
            expression,
            value_filter: None,
        }
    }

    pub fn with_value_filter(mut self, value_filter: ValueFilter) -> Self {
        self.value_filter = Some(value_filter);
        self
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "ArithmeticPhenotype")?;
        let expression = ArithmeticExpr::from_dict(
            value
                .get("expression")
                .ok_or_else(|| Error::config("ArithmeticPhenotype missing 'expression'"))?,
        )?;
        let mut pt = ArithmeticPhenotype::new(name, expression);
        pt.value_filter = match value.get("value_filter") {
            None | Some(Json::Null) => None,
            Some(v) => Some(ValueFilter::from_dict(v)?),
        };
        Ok(Arc::new(pt))
    }
}

impl ComputeNode for ArithmeticPhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        let mut out = Vec::new();
        self.expression.leaves(&mut out);
        out
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "ArithmeticPhenotype",
            "name": &*self.name,
            "expression": self.expression.to_dict(),
            "value_filter": self.value_filter.as_ref().map(ValueFilter::to_dict),
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let leaves = self.children();
        let operands = collect_operands(&self.name, &leaves, tables)?;
        let mut builder = Table::builder([columns::PERSON_ID, columns::VALUE]);
        for person in &operands.subjects {
            let values = operands.values.get(person).cloned().unwrap_or_default();
            if values.len() < leaves.len() {
                continue; // some operand missing for this subject
            }
            if let Some(result) = self.expression.evaluate(&values) {
                builder.push([person.clone(), Datum::from(result)]);
            }
        }
        let mut out = builder.build()?;
        if let Some(value_filter) = &self.value_filter {
            out = value_filter.filter(&out)?;
        }
        select_phenotype_columns(&out)
    }
}

/// Like [`ArithmeticPhenotype`] but each operand contributes 1 when the
/// subject is present and 0 when not (values are ignored), over the union
/// of operand subjects. Coefficients come from constant multiplication.
pub struct ScorePhenotype {
    name: ArcStr,
    expression: ArithmeticExpr,
}

impl ScorePhenotype {
    pub fn new(name: impl Into<ArcStr>, expression: ArithmeticExpr) -> Self {
        ScorePhenotype {
            name: name.into(),
            expression,
        }
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "ScorePhenotype")?;
        let expression = ArithmeticExpr::from_dict(
            value
                .get("expression")
                .ok_or_else(|| Error::config("ScorePhenotype missing 'expression'"))?,
        )?;
        Ok(Arc::new(ScorePhenotype::new(name, expression)))
    }
}

impl ComputeNode for ScorePhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        let mut out = Vec::new();
        self.expression.leaves(&mut out);
        out
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "ScorePhenotype",
            "name": &*self.name,
            "expression": self.expression.to_dict(),
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let leaves = self.children();
        let operands = collect_operands(&self.name, &leaves, tables)?;
        let leaf_names: Vec<ArcStr> = leaves.iter().map(|l| canonical_name(&**l)).collect();
        let mut builder = Table::builder([columns::PERSON_ID, columns::VALUE]);
        for person in &operands.subjects {
            let presence: BTreeMap<ArcStr, f64> = leaf_names
                .iter()
                .map(|name| {
                    let hit = operands
                        .membership
                        .get(name)
                        .map_or(false, |members| members.contains(person));
                    (name.clone(), if hit { 1.0 } else { 0.0 })
                })
                .collect();
            if let Some(result) = self.expression.evaluate(&presence) {
                builder.push([person.clone(), Datum::from(result)]);
            }
        }
        select_phenotype_columns(&builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::Value;
    use crate::phenotypes::test_util::{persons, run};

    fn value_table(rows: &[(&str, f64)]) -> Table {
        let mut builder =
            Table::builder([columns::PERSON_ID, columns::BOOLEAN, columns::VALUE]);
        for (person, value) in rows {
            builder.push([Datum::from(*person), Datum::from(true), Datum::from(*value)]);
        }
        builder.build().unwrap()
    }

    /// A fake upstream phenotype: its output is preset into the table map
    /// under its name, the workflow-style contract.
    struct Preset(&'static str);
    impl ComputeNode for Preset {
        fn name(&self) -> &str {
            self.0
        }
        fn to_dict(&self) -> Json {
            json!({"class_name": "Preset", "name": self.0})
        }
        fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
            Ok(tables[&ArcStr::from(self.0.to_uppercase())].clone())
        }
    }

    fn preset(name: &'static str) -> Arc<dyn ComputeNode> {
        Arc::new(Preset(name))
    }

    fn tables() -> TableMap {
        let mut tables = TableMap::new();
        tables.insert(
            "WEIGHT".into(),
            value_table(&[("P1", 80.0), ("P2", 60.0)]),
        );
        tables.insert(
            "HEIGHT".into(),
            value_table(&[("P1", 2.0), ("P2", 1.5), ("P3", 1.8)]),
        );
        tables
    }

    #[test]
    fn bmi_drops_subjects_missing_an_operand() {
        let bmi = ArithmeticPhenotype::new(
            "bmi",
            arith_div(
                preset("weight"),
                arith_mul(preset("height"), preset("height")),
            ),
        );
        let out = run(&bmi, &tables());
        // P3 has no weight
        assert_eq!(persons(&out), vec!["P1", "P2"]);
        let p1 = out
            .rows()
            .iter()
            .find(|r| r[0] == Datum::from("P1"))
            .unwrap();
        assert_eq!(p1[3], Datum::Float(20.0));
        assert!(p1[2].is_null());
    }

    #[test]
    fn value_filter_applies_to_the_result() {
        let bmi = ArithmeticPhenotype::new(
            "bmi_high",
            arith_div(
                preset("weight"),
                arith_mul(preset("height"), preset("height")),
            ),
        )
        .with_value_filter(ValueFilter::min(Value::greater_than(25.0)));
        let out = run(&bmi, &tables());
        assert_eq!(persons(&out), vec!["P2"]);
    }

    #[test]
    fn score_counts_presence_over_the_union() {
        let score = ScorePhenotype::new(
            "risk",
            arith_add(
                arith_mul(2.0, preset("weight")),
                ArithmeticExpr::Phenotype(preset("height")),
            ),
        );
        let out = run(&score, &tables());
        assert_eq!(persons(&out), vec!["P1", "P2", "P3"]);
        let value_of = |p: &str| {
            out.rows()
                .iter()
                .find(|r| r[0] == Datum::from(p))
                .unwrap()[3]
                .clone()
        };
        assert_eq!(value_of("P1"), Datum::Float(3.0));
        assert_eq!(value_of("P3"), Datum::Float(1.0));
    }
}
