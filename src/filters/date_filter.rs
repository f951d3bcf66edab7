use super::{apply_bounds, Value};
use crate::{columns, relational::Table, ArcStr, Error, Result};
use serde_json::{json, Value as Json};

/// Absolute date bounds on one column (default `EVENT_DATE`). Both bounds
/// optional; the input schema is preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct DateFilter {
    pub min_value: Option<Value>,
    pub max_value: Option<Value>,
    pub column_name: ArcStr,
}

impl DateFilter {
    pub fn new(min_value: Option<Value>, max_value: Option<Value>) -> Self {
        DateFilter {
            min_value,
            max_value,
            column_name: columns::EVENT_DATE.into(),
        }
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
            "date filter",
        )
    }

    pub fn to_dict(&self) -> Json {
        json!({
            "class_name": "DateFilter",
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
            .ok_or_else(|| Error::config("DateFilter dict missing 'column_name'"))?;
        Ok(DateFilter {
            min_value: bound("min_value")?,
            max_value: bound("max_value")?,
            column_name: column_name.into(),
        })
    }
}
