use super::{apply_bounds, Value};
use crate::{columns, relational::Table, ArcStr, Error, Result};
use serde_json::{json, Value as Json};

/// Numeric bounds on one column (default `VALUE`). Same semantics as
/// [`DateFilter`](super::DateFilter) over numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueFilter {
    pub min_value: Option<Value>,
    pub max_value: Option<Value>,
    pub column_name: ArcStr,
}

impl ValueFilter {
    pub fn new(min_value: Option<Value>, max_value: Option<Value>) -> Self {
        ValueFilter {
            min_value,
            max_value,
            column_name: columns::VALUE.into(),
        }
    }

    pub fn min(min_value: Value) -> Self {
        ValueFilter::new(Some(min_value), None)
    }

    pub fn max(max_value: Value) -> Self {
        ValueFilter::new(None, Some(max_value))
    }

    pub fn with_column(mut self, column_name: impl Into<ArcStr>) -> Self {
        self.column_name = column_name.into();
        self
    }

    pub fn filter(&self, table: &Table) -> Result<Table> {
        apply_bounds(
            table,
            &self.column_name,
            self.min_value.as_ref(),
            self.max_value.as_ref(),
            "value filter",
        )
    }

    pub fn to_dict(&self) -> Json {
        json!({
            "class_name": "ValueFilter",
            "min_value": self.min_value.as_ref().map(Value::to_dict),
            "max_value": self.max_value.as_ref().map(Value::to_dict),
            "column_name": &*self.column_name,
        })
    }

    pub fn from_dict(value: &Json) -> Result<Self> {
        let bound = |key: &str| -> Result<Option<Value>> {
            match value.get(key) {
                None | Some(Json::Null) => Ok(None),
                Some(v) => Value::from_dict(v).map(Some),
            }
        };
        let column_name = value
            .get("column_name")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::config("ValueFilter dict missing 'column_name'"))?;
        Ok(ValueFilter {
            min_value: bound("min_value")?,
            max_value: bound("max_value")?,
            column_name: column_name.into(),
        })
    }
}
