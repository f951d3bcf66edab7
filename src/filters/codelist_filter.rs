use crate::{
    codelist::Codelist,
    columns,
    relational::{col, Expr, Table},
    Datum, Result,
};
use serde_json::{json, Value as Json};

/// Selects rows whose code matches the codelist.
///
/// With `use_code_type` set, matching is by `(CODE_TYPE, CODE)` pair for
/// typed entries; untyped entries (code type unknown) match on `CODE`
/// alone. With it unset, the code type column is ignored entirely.
#[derive(Debug, Clone, PartialEq)]
pub struct CodelistFilter {
    pub codelist: Codelist,
    pub use_code_type: bool,
}

impl CodelistFilter {
    pub fn new(codelist: Codelist) -> Self {
        CodelistFilter {
            codelist,
            use_code_type: true,
        }
    }

    pub fn ignoring_code_type(codelist: Codelist) -> Self {
        CodelistFilter {
            codelist,
            use_code_type: false,
        }
    }

    /// Filter by the union of a composite's member codelists.
    pub fn from_composite(composite: &crate::codelist::CompositeCodelist) -> Self {
        CodelistFilter::new(composite.resolve())
    }

    pub fn filter(&self, table: &Table) -> Result<Table> {
        table.require_column(columns::CODE, "codelist filter")?;
        let mut predicate: Option<Expr> = None;
        let mut add = |clause: Expr| {
            predicate = Some(match predicate.take() {
                Some(existing) => existing.or(clause),
                None => clause,
            });
        };
        if self.use_code_type {
            for (ty, codes) in self.codelist.mapping() {
                let codes: Vec<Datum> = codes.iter().map(|c| Datum::from(c.clone())).collect();
                let in_codes = col(columns::CODE).in_list(codes);
                match ty {
                    Some(ty) => {
                        table.require_column(columns::CODE_TYPE, "codelist filter")?;
                        add(col(columns::CODE_TYPE)
                            .eq(crate::relational::lit(ty.clone()))
                            .and(in_codes));
                    }
                    None => add(in_codes),
                }
            }
        } else {
            let codes: Vec<Datum> = self
                .codelist
                .all_codes()
                .into_iter()
                .map(Datum::from)
                .collect();
            add(col(columns::CODE).in_list(codes));
        }
        match predicate {
            Some(predicate) => table.filter(&predicate),
            // empty codelist matches nothing
            None => Ok(Table::empty(table.columns().to_vec())),
        }
    }

    pub fn to_dict(&self) -> Json {
        json!({
            "class_name": "CodelistFilter",
            "codelist": self.codelist.to_dict(),
            "use_code_type": self.use_code_type,
        })
    }

    pub fn from_dict(value: &Json) -> Result<Self> {
        let codelist = Codelist::from_dict(
            value
                .get("codelist")
                .ok_or_else(|| crate::Error::config("CodelistFilter dict missing 'codelist'"))?,
        )?;
        let use_code_type = value
            .get("use_code_type")
            .and_then(Json::as_bool)
            .unwrap_or(true);
        Ok(CodelistFilter {
            codelist,
            use_code_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn table() -> Table {
        Table::builder(["PERSON_ID", "CODE", "CODE_TYPE"])
            .row([
                Datum::from("P1"),
                Datum::from("I48.0"),
                Datum::from("ICD-10"),
            ])
            .row([
                Datum::from("P2"),
                Datum::from("I48.0"),
                Datum::from("ICD-9"),
            ])
            .row([
                Datum::from("P3"),
                Datum::from("427.31"),
                Datum::from("ICD-9"),
            ])
            .build()
            .unwrap()
    }

    #[test]
    fn typed_matching_is_by_pair() {
        let cl = Codelist::from_mapping("af", [("ICD-10", vec!["I48.0"])]);
        let out = CodelistFilter::new(cl).filter(&table()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.rows()[0][0], Datum::from("P1"));
    }

    #[test]
    fn untyped_entries_ignore_the_type_column() {
        let cl = Codelist::from_codes("af", ["I48.0"]);
        let out = CodelistFilter::new(cl).filter(&table()).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn use_code_type_false_flattens() {
        let cl = Codelist::from_mapping("af", [("ICD-10", vec!["427.31"])]);
        let out = CodelistFilter::ignoring_code_type(cl)
            .filter(&table())
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.rows()[0][0], Datum::from("P3"));
    }

    #[test]
    fn missing_code_column_is_schema_error() {
        let t = Table::builder(["PERSON_ID"])
            .row([Datum::from("P1")])
            .build()
            .unwrap();
        let cl = Codelist::from_codes("af", ["x"]);
        assert!(matches!(
            CodelistFilter::new(cl).filter(&t).unwrap_err(),
            Error::Schema { .. }
        ));
    }
}
