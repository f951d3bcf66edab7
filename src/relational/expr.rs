//! A small expression language evaluated row-by-row against a table.
//!
//! Expressions are built programmatically (no textual syntax). Null follows
//! SQL semantics throughout: comparisons and arithmetic over null produce
//! null, `and`/`or` are three-valued, and a filter keeps only rows whose
//! predicate is exactly true.

use super::Datum;
use crate::{ArcStr, Error, Result};
use chrono::Days;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Column(ArcStr),
    Literal(Datum),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    InList(Box<Expr>, Vec<Datum>),
    /// First matching `when` wins; no match falls through to `otherwise`.
    Case {
        whens: Vec<(Expr, Expr)>,
        otherwise: Box<Expr>,
    },
    /// Null-propagating: null if any operand is null.
    Greatest(Vec<Expr>),
    Least(Vec<Expr>),
    /// Whole days in `lhs - rhs`; null unless both sides are dates.
    DaysBetween(Box<Expr>, Box<Expr>),
    AddDays(Box<Expr>, i64),
    /// Whole calendar years from `rhs` up to `lhs` (an age when `rhs` is a
    /// birth date).
    YearsBetween(Box<Expr>, Box<Expr>),
    /// Assemble a date from numeric components; null when any component is
    /// null or the combination is not a real date.
    MakeDate {
        year: Box<Expr>,
        month: Box<Expr>,
        day: Box<Expr>,
    },
}

pub fn col(name: impl Into<ArcStr>) -> Expr {
    Expr::Column(name.into())
}

pub fn lit(value: impl Into<Datum>) -> Expr {
    Expr::Literal(value.into())
}

impl Expr {
    pub fn eq(self, rhs: Expr) -> Expr {
        Expr::Cmp(CmpOp::Eq, Box::new(self), Box::new(rhs))
    }

    pub fn ne(self, rhs: Expr) -> Expr {
        Expr::Cmp(CmpOp::Ne, Box::new(self), Box::new(rhs))
    }

    pub fn gt(self, rhs: Expr) -> Expr {
        Expr::Cmp(CmpOp::Gt, Box::new(self), Box::new(rhs))
    }

    pub fn gte(self, rhs: Expr) -> Expr {
        Expr::Cmp(CmpOp::Gte, Box::new(self), Box::new(rhs))
    }

    pub fn lt(self, rhs: Expr) -> Expr {
        Expr::Cmp(CmpOp::Lt, Box::new(self), Box::new(rhs))
    }

    pub fn lte(self, rhs: Expr) -> Expr {
        Expr::Cmp(CmpOp::Lte, Box::new(self), Box::new(rhs))
    }

    pub fn cmp_op(self, op: CmpOp, rhs: Expr) -> Expr {
        Expr::Cmp(op, Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(self, rhs: Expr) -> Expr {
        Expr::Arith(ArithOp::Add, Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn sub(self, rhs: Expr) -> Expr {
        Expr::Arith(ArithOp::Sub, Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn mul(self, rhs: Expr) -> Expr {
        Expr::Arith(ArithOp::Mul, Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn div(self, rhs: Expr) -> Expr {
        Expr::Arith(ArithOp::Div, Box::new(self), Box::new(rhs))
    }

    pub fn pow(self, rhs: Expr) -> Expr {
        Expr::Arith(ArithOp::Pow, Box::new(self), Box::new(rhs))
    }

    /// Absolute value of a numeric expression.
    pub fn abs(self) -> Expr {
        Expr::case(
            vec![(self.clone().lt(lit(0)), lit(0).sub(self.clone()))],
            self,
        )
    }

    pub fn and(self, rhs: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    pub fn is_null(self) -> Expr {
        Expr::IsNull(Box::new(self))
    }

    pub fn is_not_null(self) -> Expr {
        self.is_null().not()
    }

    pub fn in_list(self, values: Vec<Datum>) -> Expr {
        Expr::InList(Box::new(self), values)
    }

    pub fn days_since(self, rhs: Expr) -> Expr {
        Expr::DaysBetween(Box::new(self), Box::new(rhs))
    }

    pub fn years_since(self, rhs: Expr) -> Expr {
        Expr::YearsBetween(Box::new(self), Box::new(rhs))
    }

    pub fn add_days(self, days: i64) -> Expr {
        Expr::AddDays(Box::new(self), days)
    }

    pub fn case(whens: Vec<(Expr, Expr)>, otherwise: Expr) -> Expr {
        Expr::Case {
            whens,
            otherwise: Box::new(otherwise),
        }
    }

    /// Evaluate against one row. `columns` names the row's cells in order.
    pub fn eval(&self, columns: &[ArcStr], row: &[Datum]) -> Result<Datum> {
        match self {
            Expr::Column(name) => {
                let idx = columns
                    .iter()
                    .position(|c| **c == **name)
                    .ok_or_else(|| Error::schema(&**name, "referenced by expression"))?;
                Ok(row[idx].clone())
            }
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Cmp(op, lhs, rhs) => {
                let lhs = lhs.eval(columns, row)?;
                let rhs = rhs.eval(columns, row)?;
                Ok(match lhs.sql_cmp(&rhs) {
                    None => Datum::Null,
                    Some(ord) => {
                        let res = match op {
                            CmpOp::Eq => ord.is_eq(),
                            CmpOp::Ne => ord.is_ne(),
                            CmpOp::Gt => ord.is_gt(),
                            CmpOp::Gte => ord.is_ge(),
                            CmpOp::Lt => ord.is_lt(),
                            CmpOp::Lte => ord.is_le(),
                        };
                        Datum::Bool(res)
                    }
                })
            }
            Expr::Arith(op, lhs, rhs) => {
                let lhs = lhs.eval(columns, row)?;
                let rhs = rhs.eval(columns, row)?;
                Ok(arith(*op, &lhs, &rhs))
            }
            Expr::And(lhs, rhs) => {
                let lhs = lhs.eval(columns, row)?;
                let rhs = rhs.eval(columns, row)?;
                Ok(match (as_bool(&lhs), as_bool(&rhs)) {
                    (Some(false), _) | (_, Some(false)) => Datum::Bool(false),
                    (Some(true), Some(true)) => Datum::Bool(true),
                    _ => Datum::Null,
                })
            }
            Expr::Or(lhs, rhs) => {
                let lhs = lhs.eval(columns, row)?;
                let rhs = rhs.eval(columns, row)?;
                Ok(match (as_bool(&lhs), as_bool(&rhs)) {
                    (Some(true), _) | (_, Some(true)) => Datum::Bool(true),
                    (Some(false), Some(false)) => Datum::Bool(false),
                    _ => Datum::Null,
                })
            }
            Expr::Not(inner) => {
                let inner = inner.eval(columns, row)?;
                Ok(match as_bool(&inner) {
                    Some(v) => Datum::Bool(!v),
                    None => Datum::Null,
                })
            }
            Expr::IsNull(inner) => Ok(Datum::Bool(inner.eval(columns, row)?.is_null())),
            Expr::InList(inner, values) => {
                let inner = inner.eval(columns, row)?;
                if inner.is_null() {
                    return Ok(Datum::Null);
                }
                Ok(Datum::Bool(values.iter().any(|v| inner.sql_eq(v))))
            }
            Expr::Case { whens, otherwise } => {
                for (cond, value) in whens {
                    if cond.eval(columns, row)?.is_true() {
                        return value.eval(columns, row);
                    }
                }
                otherwise.eval(columns, row)
            }
            Expr::Greatest(parts) => extremum(parts, columns, row, true),
            Expr::Least(parts) => extremum(parts, columns, row, false),
            Expr::DaysBetween(lhs, rhs) => {
                let lhs = lhs.eval(columns, row)?;
                let rhs = rhs.eval(columns, row)?;
                Ok(match (lhs.as_date(), rhs.as_date()) {
                    (Some(a), Some(b)) => Datum::Int((a - b).num_days()),
                    _ => Datum::Null,
                })
            }
            Expr::AddDays(inner, days) => {
                let inner = inner.eval(columns, row)?;
                Ok(match inner.as_date() {
                    Some(d) => {
                        let shifted = if *days >= 0 {
                            d.checked_add_days(Days::new(*days as u64))
                        } else {
                            d.checked_sub_days(Days::new(days.unsigned_abs()))
                        };
                        shifted.map(Datum::Date).unwrap_or(Datum::Null)
                    }
                    None => Datum::Null,
                })
            }
            Expr::YearsBetween(lhs, rhs) => {
                let lhs = lhs.eval(columns, row)?;
                let rhs = rhs.eval(columns, row)?;
                Ok(match (lhs.as_date(), rhs.as_date()) {
                    (Some(later), Some(earlier)) => {
                        use chrono::Datelike;
                        let mut years = later.year() - earlier.year();
                        if (later.month(), later.day()) < (earlier.month(), earlier.day()) {
                            years -= 1;
                        }
                        Datum::Int(years as i64)
                    }
                    _ => Datum::Null,
                })
            }
            Expr::MakeDate { year, month, day } => {
                let year = year.eval(columns, row)?;
                let month = month.eval(columns, row)?;
                let day = day.eval(columns, row)?;
                Ok(
                    match (year.as_f64(), month.as_f64(), day.as_f64()) {
                        (Some(y), Some(m), Some(d)) => {
                            chrono::NaiveDate::from_ymd_opt(y as i32, m as u32, d as u32)
                                .map(Datum::Date)
                                .unwrap_or(Datum::Null)
                        }
                        _ => Datum::Null,
                    },
                )
            }
        }
    }
}

fn as_bool(value: &Datum) -> Option<bool> {
    match value {
        Datum::Bool(v) => Some(*v),
        _ => None,
    }
}

fn arith(op: ArithOp, lhs: &Datum, rhs: &Datum) -> Datum {
    if lhs.is_null() || rhs.is_null() {
        return Datum::Null;
    }
    let (x, y) = match (lhs.as_f64(), rhs.as_f64()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Datum::Null,
    };
    let ints = matches!((lhs, rhs), (Datum::Int(_), Datum::Int(_)));
    match op {
        ArithOp::Add if ints => Datum::Int(x as i64 + y as i64),
        ArithOp::Sub if ints => Datum::Int(x as i64 - y as i64),
        ArithOp::Mul if ints => Datum::Int(x as i64 * y as i64),
        ArithOp::Add => Datum::Float(x + y),
        ArithOp::Sub => Datum::Float(x - y),
        ArithOp::Mul => Datum::Float(x * y),
        ArithOp::Div => {
            if y == 0.0 {
                Datum::Null
            } else {
                Datum::Float(x / y)
            }
        }
        ArithOp::Pow => Datum::Float(x.powf(y)),
    }
}

fn extremum(parts: &[Expr], columns: &[ArcStr], row: &[Datum], greatest: bool) -> Result<Datum> {
    let mut best: Option<Datum> = None;
    for part in parts {
        let value = part.eval(columns, row)?;
        if value.is_null() {
            return Ok(Datum::Null);
        }
        best = Some(match best {
            None => value,
            Some(current) => {
                let take = match value.sql_cmp(&current) {
                    Some(ord) if greatest => ord.is_gt(),
                    Some(ord) => ord.is_lt(),
                    None => false,
                };
                if take {
                    value
                } else {
                    current
                }
            }
        });
    }
    Ok(best.unwrap_or(Datum::Null))
}

/// A row-reducing aggregate, applied per group by
/// [`Table::aggregate`](super::Table::aggregate) and per partition by
/// [`Table::window`](super::Table::window).
#[derive(Debug, Clone)]
pub enum Agg {
    /// Number of rows in the group.
    Count,
    /// Number of distinct non-null values in the column.
    CountDistinct(ArcStr),
    Sum(ArcStr),
    Min(ArcStr),
    Max(ArcStr),
    Mean(ArcStr),
    Median(ArcStr),
}

impl Agg {
    pub fn count() -> Self {
        Agg::Count
    }

    pub fn count_distinct(column: impl Into<ArcStr>) -> Self {
        Agg::CountDistinct(column.into())
    }

    pub fn sum(column: impl Into<ArcStr>) -> Self {
        Agg::Sum(column.into())
    }

    pub fn min(column: impl Into<ArcStr>) -> Self {
        Agg::Min(column.into())
    }

    pub fn max(column: impl Into<ArcStr>) -> Self {
        Agg::Max(column.into())
    }

    pub fn mean(column: impl Into<ArcStr>) -> Self {
        Agg::Mean(column.into())
    }

    pub fn median(column: impl Into<ArcStr>) -> Self {
        Agg::Median(column.into())
    }

    pub(crate) fn column(&self) -> Option<&ArcStr> {
        match self {
            Agg::Count => None,
            Agg::CountDistinct(c)
            | Agg::Sum(c)
            | Agg::Min(c)
            | Agg::Max(c)
            | Agg::Mean(c)
            | Agg::Median(c) => Some(c),
        }
    }
}
