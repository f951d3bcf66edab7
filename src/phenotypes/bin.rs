use super::select_phenotype_columns;
use crate::{
    codelist::Codelist,
    columns,
    node::{canonical_name, ComputeNode},
    relational::{Datum, Table},
    ArcStr, Error, Result, TableMap,
};
use serde_json::{json, Value as Json};
use std::sync::Arc;

/// What a discrete bin label matches: literal values, or any code of a
/// codelist.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingTarget {
    Values(Vec<ArcStr>),
    Codelist(Codelist),
}

impl MappingTarget {
    fn matches(&self, value: &str) -> bool {
        match self {
            MappingTarget::Values(values) => values.iter().any(|v| **v == *value),
            MappingTarget::Codelist(codelist) => codelist.contains_code(value),
        }
    }

    fn to_dict(&self) -> Json {
        match self {
            MappingTarget::Values(values) => {
                json!(values.iter().map(|v| &**v).collect::<Vec<_>>())
            }
            MappingTarget::Codelist(codelist) => codelist.to_dict(),
        }
    }

    fn from_dict(value: &Json) -> Result<Self> {
        match value {
            Json::Array(values) => Ok(MappingTarget::Values(
                values
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .map(ArcStr::from)
                            .ok_or_else(|| Error::config("mapping values must be strings"))
                    })
                    .collect::<Result<Vec<_>>>()?,
            )),
            Json::Object(_) => Ok(MappingTarget::Codelist(Codelist::from_dict(value)?)),
            _ => Err(Error::config("mapping target must be a list or a codelist")),
        }
    }
}

/// Half-open numeric bins over an ascending edge list: `[e0-e1)`,
/// `[e1-e2)`, …, with `<e0` below the first edge and `>=eN` at or above
/// the last.
fn numeric_label(edges: &[f64], value: f64) -> String {
    let fmt = |v: f64| {
        if v.fract() == 0.0 {
            format!("{}", v as i64)
        } else {
            format!("{v}")
        }
    };
    if value < edges[0] {
        return format!("<{}", fmt(edges[0]));
    }
    for window in edges.windows(2) {
        if value >= window[0] && value < window[1] {
            return format!("[{}-{})", fmt(window[0]), fmt(window[1]));
        }
    }
    format!(">={}", fmt(edges[edges.len() - 1]))
}

/// Transforms a phenotype's `VALUE`: numeric binning into half-open
/// intervals with out-of-range labels, or a discrete mapping from values
/// and codes to labels. Rows whose value is null or unmapped drop out.
pub struct BinPhenotype {
    name: ArcStr,
    phenotype: Arc<dyn ComputeNode>,
    bins: Option<Vec<f64>>,
    value_mapping: Option<Vec<(ArcStr, MappingTarget)>>,
}

const DEFAULT_BINS: [f64; 10] = [0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0];

impl BinPhenotype {
    /// Numeric binning with the default decade edges.
    pub fn new(name: impl Into<ArcStr>, phenotype: Arc<dyn ComputeNode>) -> Self {
        BinPhenotype {
            name: name.into(),
            phenotype,
            bins: None,
            value_mapping: None,
        }
    }

    pub fn with_bins(mut self, bins: Vec<f64>) -> Self {
        self.bins = Some(bins);
        self
    }

    pub fn with_value_mapping<I, S>(mut self, mapping: I) -> Self
    where
        I: IntoIterator<Item = (S, MappingTarget)>,
        S: Into<ArcStr>,
    {
        self.value_mapping = Some(mapping.into_iter().map(|(k, v)| (k.into(), v)).collect());
        self
    }

    pub fn from_dict_node(value: &Json) -> Result<Arc<dyn ComputeNode>> {
        let name = crate::serialize::get_str(value, "name", "BinPhenotype")?;
        let phenotype = crate::serialize::optional_node(value, "phenotype")?
            .ok_or_else(|| Error::config("BinPhenotype missing 'phenotype'"))?;
        let mut pt = BinPhenotype::new(name, phenotype);
        pt.bins = match value.get("bins") {
            None | Some(Json::Null) => None,
            Some(v) => Some(
                v.as_array()
                    .ok_or_else(|| Error::config("'bins' must be a list"))?
                    .iter()
                    .map(|e| {
                        e.as_f64()
                            .ok_or_else(|| Error::config("bin edges must be numbers"))
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        pt.value_mapping = match value.get("value_mapping") {
            None | Some(Json::Null) => None,
            Some(v) => {
                let map = v
                    .as_array()
                    .ok_or_else(|| Error::config("'value_mapping' must be a list of pairs"))?;
                let mut out = Vec::new();
                for pair in map {
                    let label = pair
                        .get("label")
                        .and_then(Json::as_str)
                        .ok_or_else(|| Error::config("mapping entry missing 'label'"))?;
                    let target = MappingTarget::from_dict(
                        pair.get("target")
                            .ok_or_else(|| Error::config("mapping entry missing 'target'"))?,
                    )?;
                    out.push((ArcStr::from(label), target));
                }
                Some(out)
            }
        };
        Ok(Arc::new(pt))
    }

    fn label(&self, value: &Datum) -> Option<String> {
        if let Some(mapping) = &self.value_mapping {
            let text = match value {
                Datum::Str(s) => s.to_string(),
                other if !other.is_null() => other.to_string(),
                _ => return None,
            };
            return mapping
                .iter()
                .find(|(_, target)| target.matches(&text))
                .map(|(label, _)| label.to_string());
        }
        let number = value.as_f64()?;
        let edges = self.bins.as_deref().unwrap_or(&DEFAULT_BINS);
        Some(numeric_label(edges, number))
    }
}

impl ComputeNode for BinPhenotype {
    fn name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn ComputeNode>> {
        vec![self.phenotype.clone()]
    }

    fn to_dict(&self) -> Json {
        json!({
            "class_name": "BinPhenotype",
            "name": &*self.name,
            "phenotype": self.phenotype.to_dict(),
            "bins": self.bins,
            "value_mapping": self.value_mapping.as_ref().map(|mapping| {
                mapping
                    .iter()
                    .map(|(label, target)| {
                        json!({"label": &**label, "target": target.to_dict()})
                    })
                    .collect::<Vec<_>>()
            }),
        })
    }

    fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
        let child_name = canonical_name(&*self.phenotype);
        let child = tables.get(&child_name).ok_or(Error::Lookup {
            parent: self.name.to_string(),
            child: child_name.to_string(),
        })?;
        let person_idx = child.require_column(columns::PERSON_ID, "bin phenotype")?;
        let date_idx = child.require_column(columns::EVENT_DATE, "bin phenotype")?;
        let value_idx = child.require_column(columns::VALUE, "bin phenotype")?;

        let mut builder = Table::builder([columns::PERSON_ID, columns::EVENT_DATE, columns::VALUE]);
        for row in child.rows() {
            if let Some(label) = self.label(&row[value_idx]) {
                builder.push([
                    row[person_idx].clone(),
                    row[date_idx].clone(),
                    Datum::from(label),
                ]);
            }
        }
        select_phenotype_columns(&builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phenotypes::test_util::run;

    struct Preset;
    impl ComputeNode for Preset {
        fn name(&self) -> &str {
            "ages"
        }
        fn to_dict(&self) -> Json {
            json!({"class_name": "Preset", "name": "ages"})
        }
        fn execute_plan(&self, tables: &TableMap) -> Result<Table> {
            Ok(tables[&ArcStr::from("AGES")].clone())
        }
    }

    fn ages(values: &[(&str, Datum)]) -> TableMap {
        let mut builder =
            Table::builder([columns::PERSON_ID, columns::EVENT_DATE, columns::VALUE]);
        for (person, value) in values {
            builder.push([Datum::from(*person), Datum::Null, value.clone()]);
        }
        let mut tables = TableMap::new();
        tables.insert("AGES".into(), builder.build().unwrap());
        tables
    }

    fn labels(table: &Table) -> Vec<String> {
        table
            .column_values(columns::VALUE)
            .unwrap()
            .into_iter()
            .map(|v| v.to_string())
            .collect()
    }

    #[test]
    fn default_decades() {
        let tables = ages(&[
            ("P0", Datum::Int(0)),
            ("P1", Datum::Int(5)),
            ("P2", Datum::Int(10)),
            ("P3", Datum::Int(15)),
            ("P4", Datum::Int(20)),
        ]);
        let out = run(&BinPhenotype::new("age_bins", Arc::new(Preset)), &tables);
        assert_eq!(
            labels(&out.sort_by(&["PERSON_ID"]).unwrap()),
            vec!["[0-10)", "[0-10)", "[10-20)", "[10-20)", "[20-30)"]
        );
    }

    #[test]
    fn explicit_edges_get_out_of_range_labels() {
        let tables = ages(&[
            ("P0", Datum::Int(0)),
            ("P1", Datum::Int(5)),
            ("P2", Datum::Int(10)),
            ("P3", Datum::Int(15)),
            ("P4", Datum::Int(20)),
        ]);
        let pt = BinPhenotype::new("age_bins", Arc::new(Preset)).with_bins(vec![10.0, 20.0]);
        let out = run(&pt, &tables);
        assert_eq!(
            labels(&out.sort_by(&["PERSON_ID"]).unwrap()),
            vec!["<10", "<10", "[10-20)", "[10-20)", ">=20"]
        );
    }

    #[test]
    fn discrete_mapping_with_codelists() {
        let tables = ages(&[
            ("P1", Datum::from("I21")),
            ("P2", Datum::from("I23")),
            ("P3", Datum::from("E99")),
            ("P4", Datum::Null),
        ]);
        let pt = BinPhenotype::new("diagnosis_group", Arc::new(Preset)).with_value_mapping([
            (
                "Acute MI",
                MappingTarget::Codelist(Codelist::from_codes("acute_mi", ["I21", "I22"])),
            ),
            (
                "MI Complications",
                MappingTarget::Values(vec!["I23".into()]),
            ),
        ]);
        let out = run(&pt, &tables);
        // unmapped and null values drop
        assert_eq!(out.len(), 2);
        assert_eq!(
            labels(&out.sort_by(&["PERSON_ID"]).unwrap()),
            vec!["Acute MI", "MI Complications"]
        );
    }
}
