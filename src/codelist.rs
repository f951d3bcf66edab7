//! Sets of clinical codes, optionally keyed by code type (ICD-10, SNOMED,
//! …), plus resolution of codelists out of CSV files.

use crate::{ArcStr, Error, Result};
use serde_json::{json, Map, Value as Json};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// A named set of codes keyed by code type. Codelists entered as a flat
/// list normalise to a single `None` code type, meaning "match the code
/// whatever its type column says".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codelist {
    name: ArcStr,
    mapping: BTreeMap<Option<ArcStr>, BTreeSet<ArcStr>>,
}

impl Codelist {
    /// A codelist of untyped codes.
    pub fn from_codes<I, S>(name: impl Into<ArcStr>, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
    {
        let mut mapping = BTreeMap::new();
        mapping.insert(None, codes.into_iter().map(Into::into).collect());
        Codelist {
            name: name.into(),
            mapping,
        }
    }

    /// A codelist keyed by code type.
    pub fn from_mapping<K, I, S>(name: impl Into<ArcStr>, mapping: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<S>)>,
        K: Into<ArcStr>,
        S: Into<ArcStr>,
    {
        Codelist {
            name: name.into(),
            mapping: mapping
                .into_iter()
                .map(|(k, v)| (Some(k.into()), v.into_iter().map(Into::into).collect()))
                .collect(),
        }
    }

    /// A one-code codelist named after the code itself.
    pub fn single(code: impl Into<ArcStr>) -> Self {
        let code = code.into();
        Codelist::from_codes(code.clone(), [code])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All `(code_type, code)` pairs, code type `None` for untyped entries.
    pub fn pairs(&self) -> impl Iterator<Item = (Option<&ArcStr>, &ArcStr)> + '_ {
        self.mapping
            .iter()
            .flat_map(|(ty, codes)| codes.iter().map(move |c| (ty.as_ref(), c)))
    }

    /// Every code, across all code types.
    pub fn all_codes(&self) -> BTreeSet<ArcStr> {
        self.mapping.values().flatten().cloned().collect()
    }

    pub fn contains_code(&self, code: &str) -> bool {
        self.mapping.values().any(|codes| codes.contains(code))
    }

    /// Groups of codes that must match together with their type column,
    /// `None` key meaning type-blind.
    pub fn mapping(&self) -> &BTreeMap<Option<ArcStr>, BTreeSet<ArcStr>> {
        &self.mapping
    }

    pub fn to_dict(&self) -> Json {
        let mut codelist = Map::new();
        for (ty, codes) in &self.mapping {
            let key = match ty {
                Some(ty) => ty.to_string(),
                // mirrors how a null key coerces in JSON
                None => "null".to_string(),
            };
            codelist.insert(
                key,
                Json::Array(codes.iter().map(|c| Json::String(c.to_string())).collect()),
            );
        }
        json!({
            "class_name": "Codelist",
            "name": &*self.name,
            "codelist": codelist,
        })
    }

    pub fn from_dict(value: &Json) -> Result<Self> {
        let name = value
            .get("name")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::config("Codelist dict missing 'name'"))?;
        let raw = value
            .get("codelist")
            .and_then(Json::as_object)
            .ok_or_else(|| Error::config("Codelist dict missing 'codelist'"))?;
        let mut mapping = BTreeMap::new();
        for (key, codes) in raw {
            let ty = if key == "null" {
                None
            } else {
                Some(ArcStr::from(key.as_str()))
            };
            let codes = codes
                .as_array()
                .ok_or_else(|| Error::config("codelist entries must be arrays"))?
                .iter()
                .map(|c| {
                    c.as_str()
                        .map(ArcStr::from)
                        .ok_or_else(|| Error::config("codes must be strings"))
                })
                .collect::<Result<BTreeSet<_>>>()?;
            mapping.insert(ty, codes);
        }
        Ok(Codelist {
            name: name.into(),
            mapping,
        })
    }
}

/// Several codelists treated as one: the union of the members' codes,
/// taken at filter time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeCodelist {
    name: ArcStr,
    members: Vec<Codelist>,
}

impl CompositeCodelist {
    pub fn new(name: impl Into<ArcStr>, members: Vec<Codelist>) -> Self {
        CompositeCodelist {
            name: name.into(),
            members,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[Codelist] {
        &self.members
    }

    /// Union the members into a single resolved codelist.
    pub fn resolve(&self) -> Codelist {
        let mut mapping: BTreeMap<Option<ArcStr>, BTreeSet<ArcStr>> = BTreeMap::new();
        for member in &self.members {
            for (ty, codes) in member.mapping() {
                mapping.entry(ty.clone()).or_default().extend(codes.iter().cloned());
            }
        }
        Codelist {
            name: self.name.clone(),
            mapping,
        }
    }

    pub fn to_dict(&self) -> Json {
        json!({
            "class_name": "CompositeCodelist",
            "name": &*self.name,
            "codelists": self.members.iter().map(Codelist::to_dict).collect::<Vec<_>>(),
        })
    }

    pub fn from_dict(value: &Json) -> Result<Self> {
        let name = value
            .get("name")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::config("CompositeCodelist dict missing 'name'"))?;
        let members = value
            .get("codelists")
            .and_then(Json::as_array)
            .ok_or_else(|| Error::config("CompositeCodelist dict missing 'codelists'"))?
            .iter()
            .map(Codelist::from_dict)
            .collect::<Result<Vec<_>>>()?;
        Ok(CompositeCodelist::new(name, members))
    }
}

/// Resolves named codelists out of a CSV file shaped
/// `codelist,code_type,code` (column names configurable).
///
/// Resolution happens at prepare time, before any execution; failures are
/// [`Error::CodelistResolution`].
pub struct CsvCodelistFactory {
    path: PathBuf,
    code_column: String,
    codelist_column: String,
    code_type_column: String,
}

impl CsvCodelistFactory {
    pub fn new(path: impl AsRef<Path>) -> Self {
        CsvCodelistFactory {
            path: path.as_ref().to_owned(),
            code_column: "code".into(),
            codelist_column: "codelist".into(),
            code_type_column: "code_type".into(),
        }
    }

    pub fn with_columns(
        mut self,
        code: impl Into<String>,
        codelist: impl Into<String>,
        code_type: impl Into<String>,
    ) -> Self {
        self.code_column = code.into();
        self.codelist_column = codelist.into();
        self.code_type_column = code_type.into();
        self
    }

    pub fn get_codelist(&self, name: &str) -> Result<Codelist> {
        let resolution_err = |reason: String| Error::CodelistResolution {
            name: name.to_string(),
            reason,
        };
        let mut reader = csv::Reader::from_path(&self.path).map_err(|e| {
            resolution_err(format!("cannot read '{}': {}", self.path.display(), e))
        })?;
        let headers = reader
            .headers()
            .map_err(|e| resolution_err(e.to_string()))?
            .clone();
        let position = |column: &str| {
            headers
                .iter()
                .position(|h| h == column)
                .ok_or_else(|| resolution_err(format!("missing column '{}'", column)))
        };
        let code_idx = position(&self.code_column)?;
        let codelist_idx = position(&self.codelist_column)?;
        let code_type_idx = position(&self.code_type_column)?;

        let mut mapping: BTreeMap<Option<ArcStr>, BTreeSet<ArcStr>> = BTreeMap::new();
        for record in reader.records() {
            let record = record.map_err(|e| resolution_err(e.to_string()))?;
            if record.get(codelist_idx) != Some(name) {
                continue;
            }
            let code = record
                .get(code_idx)
                .ok_or_else(|| resolution_err("short record".into()))?;
            let ty = match record.get(code_type_idx) {
                Some("") | None => None,
                Some(ty) => Some(ArcStr::from(ty)),
            };
            mapping.entry(ty).or_default().insert(code.into());
        }
        if mapping.is_empty() {
            return Err(resolution_err("no rows with that codelist name".into()));
        }
        Ok(Codelist {
            name: name.into(),
            mapping,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_list_normalises_to_untyped() {
        let cl = Codelist::from_codes("af", ["I48", "I48.1"]);
        assert_eq!(cl.mapping().len(), 1);
        assert!(cl.mapping().contains_key(&None));
        assert!(cl.contains_code("I48"));
    }

    #[test]
    fn typed_mapping_keeps_pairs() {
        let cl = Codelist::from_mapping(
            "af",
            [("ICD-9", vec!["427.31"]), ("ICD-10", vec!["I48.0", "I48.1"])],
        );
        let pairs: Vec<_> = cl.pairs().collect();
        assert_eq!(pairs.len(), 3);
        assert!(pairs
            .iter()
            .any(|(ty, c)| ty.map(|t| &**t) == Some("ICD-9") && &***c == "427.31"));
    }

    #[test]
    fn dict_round_trip() {
        let cl = Codelist::from_mapping("af", [("ICD-10", vec!["I48.0"])]);
        let restored = Codelist::from_dict(&cl.to_dict()).unwrap();
        assert_eq!(cl, restored);

        let untyped = Codelist::from_codes("x", ["a"]);
        let restored = Codelist::from_dict(&untyped.to_dict()).unwrap();
        assert_eq!(untyped, restored);
    }

    #[test]
    fn composite_unions_members() {
        let a = Codelist::from_codes("a", ["x"]);
        let b = Codelist::from_codes("b", ["y"]);
        let resolved = CompositeCodelist::new("ab", vec![a, b]).resolve();
        assert!(resolved.contains_code("x"));
        assert!(resolved.contains_code("y"));
    }

    #[test]
    fn missing_csv_is_resolution_error() {
        let factory = CsvCodelistFactory::new("/nonexistent/codelists.csv");
        let err = factory.get_codelist("af").unwrap_err();
        assert!(matches!(err, Error::CodelistResolution { .. }));
    }
}
