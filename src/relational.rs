//! The relational layer: dynamic cell values, a small expression language
//! and an immutable in-memory table supporting the operator set the engine
//! needs (select / filter / mutate / join / group-by / aggregate / window /
//! distinct / union / sort).

mod expr;
mod table;

pub use expr::{col, lit, Agg, ArithOp, CmpOp, Expr};
pub use table::{Join, Table, TableBuilder};

use crate::ArcStr;
use chrono::NaiveDate;
use std::cmp::Ordering;
use std::fmt;

/// A single cell value.
///
/// Two orderings live on `Datum`. The *total* order (`Ord`) ranks nulls
/// first and merges the numeric variants; it drives sorting, grouping and
/// `distinct`, so every engine output is deterministic. The *SQL* order
/// ([`Datum::sql_cmp`]) returns `None` when either side is null or the
/// types are incomparable; it drives filters and join keys, so null never
/// matches a bound and null keys never join.
#[derive(Debug, Clone)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(ArcStr),
    Date(NaiveDate),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// `true` only for `Bool(true)`; anything else (including null) is not
    /// truthy. Filters keep exactly the truthy rows.
    pub fn is_true(&self) -> bool {
        matches!(self, Datum::Bool(true))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int(v) => Some(*v as f64),
            Datum::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Datum::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Str(s) => Some(s),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Int(_) | Datum::Float(_) => 2,
            Datum::Str(_) => 3,
            Datum::Date(_) => 4,
        }
    }

    /// SQL-style comparison: `None` if either side is null or the variants
    /// are incomparable. Ints and floats compare numerically.
    pub fn sql_cmp(&self, other: &Datum) -> Option<Ordering> {
        use Datum::*;
        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Str(a), Str(b)) => Some(a.cmp(b)),
            (Date(a), Date(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => Some(x.total_cmp(&y)),
                _ => None,
            },
        }
    }

    pub fn sql_eq(&self, other: &Datum) -> bool {
        self.sql_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        use Datum::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (a, b) if a.rank() == 2 && b.rank() == 2 => {
                // merged numeric ordering, total on floats
                a.as_f64().unwrap().total_cmp(&b.as_f64().unwrap())
            }
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Datum::Null => f.write_str(""),
            Datum::Bool(v) => write!(f, "{}", v),
            Datum::Int(v) => write!(f, "{}", v),
            Datum::Float(v) => write!(f, "{}", v),
            Datum::Str(v) => f.write_str(v),
            Datum::Date(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Datum {
    fn from(v: bool) -> Self {
        Datum::Bool(v)
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int(v)
    }
}

impl From<i32> for Datum {
    fn from(v: i32) -> Self {
        Datum::Int(v as i64)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Self {
        Datum::Float(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Str(v.into())
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Self {
        Datum::Str(v.into())
    }
}

impl From<ArcStr> for Datum {
    fn from(v: ArcStr) -> Self {
        Datum::Str(v)
    }
}

impl From<NaiveDate> for Datum {
    fn from(v: NaiveDate) -> Self {
        Datum::Date(v)
    }
}

impl<T: Into<Datum>> From<Option<T>> for Datum {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Datum::Null,
        }
    }
}
