//! Thresholds: an operator plus a numeric or date boundary. The operator
//! carries the boundary-day/boundary-value semantics (`>` vs `>=`), which
//! the rest of the engine honours precisely.

use crate::{
    relational::{lit, CmpOp, Expr},
    Datum, Error, Result,
};
use chrono::NaiveDate;
use serde_json::{json, Value as Json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Gt => ">",
            Op::Gte => ">=",
            Op::Lt => "<",
            Op::Lte => "<=",
            Op::Eq => "=",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            ">" => Op::Gt,
            ">=" => Op::Gte,
            "<" => Op::Lt,
            "<=" => Op::Lte,
            "=" => Op::Eq,
            other => return Err(Error::config(format!("unknown operator '{other}'"))),
        })
    }

    fn cmp_op(&self) -> CmpOp {
        match self {
            Op::Gt => CmpOp::Gt,
            Op::Gte => CmpOp::Gte,
            Op::Lt => CmpOp::Lt,
            Op::Lte => CmpOp::Lte,
            Op::Eq => CmpOp::Eq,
        }
    }
}

/// `(operator, boundary)`. The boundary is a number or a date.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub op: Op,
    pub value: Datum,
}

impl Value {
    pub fn new(op: Op, value: impl Into<Datum>) -> Self {
        Value {
            op,
            value: value.into(),
        }
    }

    pub fn greater_than(value: impl Into<Datum>) -> Self {
        Value::new(Op::Gt, value)
    }

    pub fn greater_than_or_equal_to(value: impl Into<Datum>) -> Self {
        Value::new(Op::Gte, value)
    }

    pub fn less_than(value: impl Into<Datum>) -> Self {
        Value::new(Op::Lt, value)
    }

    pub fn less_than_or_equal_to(value: impl Into<Datum>) -> Self {
        Value::new(Op::Lte, value)
    }

    pub fn equal_to(value: impl Into<Datum>) -> Self {
        Value::new(Op::Eq, value)
    }

    // date-flavoured constructors, for readability at call sites

    pub fn after(date: NaiveDate) -> Self {
        Value::new(Op::Gt, date)
    }

    pub fn after_or_on(date: NaiveDate) -> Self {
        Value::new(Op::Gte, date)
    }

    pub fn before(date: NaiveDate) -> Self {
        Value::new(Op::Lt, date)
    }

    pub fn before_or_on(date: NaiveDate) -> Self {
        Value::new(Op::Lte, date)
    }

    /// The predicate `target <op> boundary`.
    pub fn to_expr(&self, target: Expr) -> Expr {
        target.cmp_op(self.op.cmp_op(), lit(self.value.clone()))
    }

    /// Test a single value; null never matches.
    pub fn matches(&self, candidate: &Datum) -> bool {
        match candidate.sql_cmp(&self.value) {
            None => false,
            Some(ord) => match self.op {
                Op::Gt => ord.is_gt(),
                Op::Gte => ord.is_ge(),
                Op::Lt => ord.is_lt(),
                Op::Lte => ord.is_le(),
                Op::Eq => ord.is_eq(),
            },
        }
    }

    pub fn to_dict(&self) -> Json {
        json!({
            "class_name": "Value",
            "operator": self.op.as_str(),
            "value": crate::serialize::datum_to_json(&self.value),
        })
    }

    pub fn from_dict(value: &Json) -> Result<Self> {
        let op = value
            .get("operator")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::config("Value dict missing 'operator'"))?;
        let boundary = value
            .get("value")
            .ok_or_else(|| Error::config("Value dict missing 'value'"))?;
        Ok(Value {
            op: Op::from_str(op)?,
            value: crate::serialize::datum_from_json(boundary)?,
        })
    }
}
