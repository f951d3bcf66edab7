//! Structural serialisation. Every node and filter serialises to
//! `{"class_name": …, parameters…}`; `from_dict` reconstructs the tree via
//! a registry keyed by `class_name`. JSON maps here are ordered (sorted
//! keys), so `canonical_json` is a deterministic hash preimage.

use crate::{node::ComputeNode, Datum, Error, Result};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Encode one cell for a dictionary. Dates wrap as
/// `{"__datetime__": "<iso8601>"}` so they survive JSON round-trips typed.
pub fn datum_to_json(value: &Datum) -> Json {
    match value {
        Datum::Null => Json::Null,
        Datum::Bool(v) => json!(v),
        Datum::Int(v) => json!(v),
        Datum::Float(v) => json!(v),
        Datum::Str(v) => json!(&**v),
        Datum::Date(v) => json!({ "__datetime__": v.format("%Y-%m-%d").to_string() }),
    }
}

pub fn datum_from_json(value: &Json) -> Result<Datum> {
    Ok(match value {
        Json::Null => Datum::Null,
        Json::Bool(v) => Datum::Bool(*v),
        Json::Number(n) => {
            if let Some(v) = n.as_i64() {
                Datum::Int(v)
            } else {
                Datum::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(v) => Datum::Str(v.as_str().into()),
        Json::Object(map) => {
            let iso = map
                .get("__datetime__")
                .and_then(Json::as_str)
                .ok_or_else(|| Error::config("expected a '__datetime__' object"))?;
            // accept a full datetime but keep day granularity
            let date_part = iso.split('T').next().unwrap_or(iso);
            let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
                .map_err(|e| Error::config(format!("bad date '{iso}': {e}")))?;
            Datum::Date(date)
        }
        Json::Array(_) => return Err(Error::config("unexpected array where scalar expected")),
    })
}

/// Deterministic JSON text: `serde_json` maps are ordered, so equal
/// dictionaries always print identically.
pub fn canonical_json(value: &Json) -> String {
    serde_json::to_string(value).expect("JSON value always serialises")
}

/// MD5 hex digest of the canonical JSON; the cache key of lazy execution.
pub fn hash_dict(value: &Json) -> String {
    format!("{:x}", md5::compute(canonical_json(value)))
}

pub(crate) fn get_str<'a>(value: &'a Json, key: &str, class: &str) -> Result<&'a str> {
    value
        .get(key)
        .and_then(Json::as_str)
        .ok_or_else(|| Error::config(format!("{class} dict missing '{key}'")))
}

type NodeFromDict = fn(&Json) -> Result<Arc<dyn ComputeNode>>;

static REGISTRY: Lazy<BTreeMap<&'static str, NodeFromDict>> = Lazy::new(|| {
    use crate::{data_period::DataPeriodFilterNode, phenotypes::*};
    let mut map: BTreeMap<&'static str, NodeFromDict> = BTreeMap::new();
    map.insert("CodelistPhenotype", CodelistPhenotype::from_dict_node);
    map.insert("MeasurementPhenotype", MeasurementPhenotype::from_dict_node);
    map.insert("AgePhenotype", AgePhenotype::from_dict_node);
    map.insert("SexPhenotype", SexPhenotype::from_dict_node);
    map.insert("CategoricalPhenotype", CategoricalPhenotype::from_dict_node);
    map.insert(
        "ContinuousCoveragePhenotype",
        ContinuousCoveragePhenotype::from_dict_node,
    );
    map.insert("TimeRangePhenotype", TimeRangePhenotype::from_dict_node);
    map.insert(
        "TimeRangeCountPhenotype",
        TimeRangeCountPhenotype::from_dict_node,
    );
    map.insert(
        "TimeRangeDayCountPhenotype",
        TimeRangeDayCountPhenotype::from_dict_node,
    );
    map.insert(
        "TimeRangeDaysToNextRange",
        TimeRangeDaysToNextRange::from_dict_node,
    );
    map.insert("EventCountPhenotype", EventCountPhenotype::from_dict_node);
    map.insert("LogicPhenotype", LogicPhenotype::from_dict_node);
    map.insert("ArithmeticPhenotype", ArithmeticPhenotype::from_dict_node);
    map.insert("ScorePhenotype", ScorePhenotype::from_dict_node);
    map.insert("BinPhenotype", BinPhenotype::from_dict_node);
    map.insert(
        "WithinSameEncounterPhenotype",
        WithinSameEncounterPhenotype::from_dict_node,
    );
    map.insert("TimeShiftPhenotype", TimeShiftPhenotype::from_dict_node);
    map.insert(
        "UserDefinedPhenotype",
        UserDefinedPhenotype::from_dict_node,
    );
    map.insert("DataPeriodFilterNode", DataPeriodFilterNode::from_dict_node);
    map
});

/// Reconstruct a node tree from its dictionary.
///
/// `from_dict(node.to_dict())` is structurally equal to `node` for every
/// built-in node except [`UserDefinedPhenotype`], whose function cannot be
/// rebuilt from data.
///
/// [`UserDefinedPhenotype`]: crate::phenotypes::UserDefinedPhenotype
pub fn node_from_dict(value: &Json) -> Result<Arc<dyn ComputeNode>> {
    let class = get_str(value, "class_name", "node")?;
    let builder = REGISTRY
        .get(class)
        .ok_or_else(|| Error::config(format!("unknown node class '{class}'")))?;
    builder(value)
}

/// `None` for a missing or null key, otherwise the reconstructed node.
pub(crate) fn optional_node(value: &Json, key: &str) -> Result<Option<Arc<dyn ComputeNode>>> {
    match value.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(v) => node_from_dict(v).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": 2});
        assert_eq!(canonical_json(&a), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn datum_round_trip() {
        let date = NaiveDate::from_ymd_opt(2020, 5, 10).unwrap();
        for datum in [
            Datum::Null,
            Datum::Bool(true),
            Datum::Int(3),
            Datum::Float(1.5),
            Datum::Str("x".into()),
            Datum::Date(date),
        ] {
            let restored = datum_from_json(&datum_to_json(&datum)).unwrap();
            assert_eq!(datum, restored);
        }
    }

    #[test]
    fn hashes_differ_by_class_name() {
        let a = json!({"class_name": "A", "x": 1});
        let b = json!({"class_name": "B", "x": 1});
        assert_ne!(hash_dict(&a), hash_dict(&b));
        assert_eq!(hash_dict(&a), hash_dict(&a.clone()));
    }

    #[test]
    fn nested_node_trees_round_trip_through_the_registry() {
        use crate::codelist::Codelist;
        use crate::filters::{RelativeTimeRangeFilter, Value, ValueFilter};
        use crate::phenotypes::{
            CodelistPhenotype, ComponentDateSelect, EventCountPhenotype, ReturnDate,
        };
        use std::sync::Arc;

        let entry = Arc::new(
            CodelistPhenotype::new(
                "CONDITION_OCCURRENCE",
                Codelist::from_mapping("af", [("ICD-10", vec!["I48"])]),
            )
            .with_return_date(ReturnDate::All),
        );
        let node = EventCountPhenotype::new("two_af", entry)
            .with_value_filter(ValueFilter::min(Value::greater_than_or_equal_to(2)))
            .with_relative_time_range(
                RelativeTimeRangeFilter::before()
                    .with_min_days(Value::greater_than_or_equal_to(5)),
            )
            .with_component_date_select(ComponentDateSelect::First);

        let restored = node_from_dict(&node.to_dict()).unwrap();
        assert_eq!(
            canonical_json(&node.to_dict()),
            canonical_json(&restored.to_dict())
        );
        assert_eq!(
            crate::node::node_hash(&node),
            crate::node::node_hash(&*restored)
        );
        // the anchor chain survives as a child edge
        assert_eq!(restored.children().len(), 1);
        assert_eq!(restored.children()[0].name(), "af");
    }
}
