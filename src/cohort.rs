//! Cohort assembly: one entry criterion producing the per-subject index
//! date, then inclusions, exclusions, baseline characteristics and
//! outcomes executed against index-anchored inputs, with an attrition
//! waterfall accounting for every step.

use crate::{
    columns,
    data_period::DataPeriodFilter,
    filters::DateFilter,
    node::{canonical_name, ComputeNode, ExecutionContext},
    relational::{col, lit, Datum, Expr, Join, Table},
    workflow::Workflow,
    ArcStr, Result, TableMap,
};
use serde_json::{json, Value as Json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{event, Level};

/// One row of the attrition waterfall.
#[derive(Debug, Clone)]
pub struct AttritionRow {
    /// `entry`, `inclusion`, `exclusion` or `final`.
    pub step: ArcStr,
    pub name: ArcStr,
    /// Distinct subjects in the phenotype alone; none for the final row.
    pub n: Option<i64>,
    /// Subjects remaining after applying the steps so far, in order.
    pub remaining: i64,
    /// Change against the previous row; none for the entry row.
    pub delta: Option<i64>,
    /// `remaining` as a percentage of the entry count.
    pub pct_of_entry: f64,
}

/// The attrition waterfall: how each criterion, applied in order, shrinks
/// the cohort from the entry count down to the final population.
#[derive(Debug, Clone, Default)]
pub struct Attrition {
    rows: Vec<AttritionRow>,
}

impl Attrition {
    pub fn rows(&self) -> &[AttritionRow] {
        &self.rows
    }

    /// The waterfall as a relational table (also what a connector
    /// materialises).
    pub fn to_table(&self) -> Result<Table> {
        let mut builder =
            Table::builder(["TYPE", "NAME", "N", "REMAINING", "DELTA", "PCT_OF_ENTRY"]);
        for row in &self.rows {
            builder.push([
                Datum::from(row.step.clone()),
                Datum::from(row.name.clone()),
                Datum::from(row.n),
                Datum::from(row.remaining),
                Datum::from(row.delta),
                Datum::from(row.pct_of_entry),
            ]);
        }
        builder.build()
    }

    /// Render for the terminal.
    pub fn term_table(&self) -> term_data_table::Table<'_> {
        use term_data_table::{Cell, Row, Table};
        let mut table = Table::new().with_row(
            Row::new()
                .with_cell(Cell::from("Type"))
                .with_cell(Cell::from("Name"))
                .with_cell(Cell::from("N"))
                .with_cell(Cell::from("Remaining"))
                .with_cell(Cell::from("Delta"))
                .with_cell(Cell::from("% of entry")),
        );
        for row in &self.rows {
            let opt = |v: Option<i64>| v.map(|v| v.to_string()).unwrap_or_default();
            table.add_row(
                Row::new()
                    .with_cell(Cell::from(row.step.to_string()))
                    .with_cell(Cell::from(row.name.to_string()))
                    .with_cell(Cell::from(opt(row.n)))
                    .with_cell(Cell::from(row.remaining.to_string()))
                    .with_cell(Cell::from(opt(row.delta)))
                    .with_cell(Cell::from(format!("{:.1}", row.pct_of_entry))),
            );
        }
        table
    }
}

/// Everything a cohort run produces.
pub struct CohortResult {
    /// The entry criterion's phenotype table.
    pub entry_table: Table,
    /// Final cohort: one row per remaining subject with their
    /// `INDEX_DATE`.
    pub index_table: Table,
    /// Final cohort left-joined with every characteristic and outcome.
    pub characteristics_table: Table,
    pub attrition: Attrition,
    /// Output of every node executed along the way, by canonical name.
    pub phenotype_tables: BTreeMap<ArcStr, Table>,
}

/// A reproducible patient-selection pipeline.
///
/// Execution order: data-period rewrite of all inputs, the entry
/// criterion's subtree, derivation of `INDEX_DATE` onto every domain,
/// then all remaining phenotypes via the workflow scheduler, then
/// sequential inclusion/exclusion accounting.
pub struct Cohort {
    name: ArcStr,
    entry_criterion: Arc<dyn ComputeNode>,
    inclusions: Vec<Arc<dyn ComputeNode>>,
    exclusions: Vec<Arc<dyn ComputeNode>>,
    characteristics: Vec<Arc<dyn ComputeNode>>,
    outcomes: Vec<Arc<dyn ComputeNode>>,
    data_period: Option<DataPeriodFilter>,
}

impl Cohort {
    pub fn new(name: impl Into<ArcStr>, entry_criterion: Arc<dyn ComputeNode>) -> Self {
        Cohort {
            name: name.into(),
            entry_criterion,
            inclusions: Vec::new(),
            exclusions: Vec::new(),
            characteristics: Vec::new(),
            outcomes: Vec::new(),
            data_period: None,
        }
    }

    pub fn with_inclusion(mut self, phenotype: Arc<dyn ComputeNode>) -> Self {
        self.inclusions.push(phenotype);
        self
    }

    pub fn with_exclusion(mut self, phenotype: Arc<dyn ComputeNode>) -> Self {
        self.exclusions.push(phenotype);
        self
    }

    pub fn with_characteristic(mut self, phenotype: Arc<dyn ComputeNode>) -> Self {
        self.characteristics.push(phenotype);
        self
    }

    pub fn with_outcome(mut self, phenotype: Arc<dyn ComputeNode>) -> Self {
        self.outcomes.push(phenotype);
        self
    }

    /// Restrict every input domain to a study period before anything
    /// executes.
    pub fn with_data_period(mut self, date_filter: DateFilter) -> Result<Self> {
        self.data_period = Some(DataPeriodFilter::new(date_filter)?);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry_criterion(&self) -> &Arc<dyn ComputeNode> {
        &self.entry_criterion
    }

    pub fn execute(&self, tables: &TableMap, ctx: &ExecutionContext) -> Result<CohortResult> {
        ctx.validate()?;
        event!(Level::INFO, cohort = %self.name, "assembling cohort");

        // 1. study-period rewrite of every input
        let mut inputs = tables.clone();
        if let Some(data_period) = &self.data_period {
            for (domain, table) in tables {
                inputs.insert(domain.clone(), data_period.apply(table)?);
            }
        }

        // 2. the entry criterion and its subtree
        let entry_workflow = Workflow::with_dependencies(vec![self.entry_criterion.clone()])?;
        let entry_results = entry_workflow.execute(&inputs, ctx)?;
        let entry_name = canonical_name(&*self.entry_criterion);
        let entry_table = entry_results[&entry_name].clone();

        // 3. index dates onto every domain
        let index_dates = entry_table
            .filter(&col(columns::BOOLEAN).eq(lit(true)))?
            .select(&[columns::PERSON_ID, columns::EVENT_DATE])?
            .rename(columns::EVENT_DATE, columns::INDEX_DATE)?
            .distinct();
        let mut anchored = TableMap::new();
        for (domain, table) in &inputs {
            let table = if table.has_column(columns::PERSON_ID) {
                let table = if table.has_column(columns::INDEX_DATE) {
                    table.drop_columns(&[columns::INDEX_DATE])?
                } else {
                    table.clone()
                };
                table.join(&index_dates, &[columns::PERSON_ID], Join::Left)?
            } else {
                table.clone()
            };
            anchored.insert(domain.clone(), table);
        }
        // completed subtree outputs short-circuit the next stage
        for (name, table) in &entry_results {
            anchored.insert(name.clone(), table.clone());
        }

        // 4. every remaining phenotype, dependency-scheduled
        let mut roots: Vec<Arc<dyn ComputeNode>> = vec![self.entry_criterion.clone()];
        roots.extend(self.inclusions.iter().cloned());
        roots.extend(self.exclusions.iter().cloned());
        roots.extend(self.characteristics.iter().cloned());
        roots.extend(self.outcomes.iter().cloned());
        let workflow = Workflow::with_dependencies(roots)?;
        let results = workflow.execute(&anchored, ctx)?;

        // 5. sequential attrition accounting
        let mut attrition = Attrition::default();
        let mut current: BTreeSet<Datum> = subjects_of(&index_dates)?;
        let entry_n = current.len() as i64;
        let pct = |remaining: i64| {
            if entry_n == 0 {
                0.0
            } else {
                remaining as f64 / entry_n as f64 * 100.0
            }
        };
        attrition.rows.push(AttritionRow {
            step: "entry".into(),
            name: entry_name.clone(),
            n: Some(entry_n),
            remaining: entry_n,
            delta: None,
            pct_of_entry: pct(entry_n),
        });
        let mut previous = entry_n;
        let steps = self
            .inclusions
            .iter()
            .map(|p| ("inclusion", p))
            .chain(self.exclusions.iter().map(|p| ("exclusion", p)));
        for (step, phenotype) in steps {
            let name = canonical_name(&**phenotype);
            let members = subjects_of(&results[&name])?;
            if step == "inclusion" {
                current = current.intersection(&members).cloned().collect();
            } else {
                current = current.difference(&members).cloned().collect();
            }
            let remaining = current.len() as i64;
            event!(
                Level::INFO,
                cohort = %self.name, criterion = %name, step, remaining,
                "applied criterion"
            );
            attrition.rows.push(AttritionRow {
                step: step.into(),
                name,
                n: Some(members.len() as i64),
                remaining,
                delta: Some(remaining - previous),
                pct_of_entry: pct(remaining),
            });
            previous = remaining;
        }
        attrition.rows.push(AttritionRow {
            step: "final".into(),
            name: "".into(),
            n: None,
            remaining: current.len() as i64,
            delta: None,
            pct_of_entry: pct(current.len() as i64),
        });

        // 6. final cohort and the characteristics join
        let final_members: Vec<Datum> = current.iter().cloned().collect();
        let member_table = Table::new(
            vec![columns::PERSON_ID.into()],
            final_members.into_iter().map(|p| vec![p]).collect(),
        )?;
        let index_table = index_dates.join(&member_table, &[columns::PERSON_ID], Join::Semi)?;

        let mut characteristics_table = index_table.clone();
        for phenotype in self.characteristics.iter().chain(&self.outcomes) {
            let name = canonical_name(&**phenotype);
            let output = one_row_per_subject(&results[&name])?;
            let renamed = output
                .rename(columns::BOOLEAN, &format!("{name}_BOOLEAN"))?
                .rename(columns::EVENT_DATE, &format!("{name}_DATE"))?
                .rename(columns::VALUE, &format!("{name}_VALUE"))?;
            characteristics_table =
                characteristics_table.join(&renamed, &[columns::PERSON_ID], Join::Left)?;
            let flag = format!("{name}_BOOLEAN");
            characteristics_table = characteristics_table.mutate(
                &flag,
                &Expr::case(vec![(col(flag.as_str()).is_null(), lit(false))], col(flag.as_str())),
            )?;
        }

        // 7. materialise the cohort-level outputs
        if let Some(connector) = &ctx.connector {
            let prefix = self.name.to_uppercase();
            connector.create_table(&index_table, &format!("{prefix}__INDEX"), ctx.overwrite)?;
            connector.create_table(
                &characteristics_table,
                &format!("{prefix}__CHARACTERISTICS"),
                ctx.overwrite,
            )?;
            connector.create_table(
                &attrition.to_table()?,
                &format!("{prefix}__ATTRITION"),
                ctx.overwrite,
            )?;
        }

        let mut phenotype_tables = results;
        for (name, table) in entry_results {
            phenotype_tables.entry(name).or_insert(table);
        }
        Ok(CohortResult {
            entry_table,
            index_table,
            characteristics_table,
            attrition,
            phenotype_tables,
        })
    }

    pub fn to_dict(&self) -> Json {
        let list = |nodes: &[Arc<dyn ComputeNode>]| {
            nodes.iter().map(|n| n.to_dict()).collect::<Vec<_>>()
        };
        json!({
            "class_name": "Cohort",
            "name": &*self.name,
            "entry_criterion": self.entry_criterion.to_dict(),
            "inclusions": list(&self.inclusions),
            "exclusions": list(&self.exclusions),
            "characteristics": list(&self.characteristics),
            "outcomes": list(&self.outcomes),
            "data_period": self.data_period.as_ref().map(DataPeriodFilter::to_dict),
        })
    }

    pub fn from_dict(value: &Json) -> Result<Self> {
        let name = crate::serialize::get_str(value, "name", "Cohort")?;
        let entry = crate::serialize::optional_node(value, "entry_criterion")?
            .ok_or_else(|| crate::Error::config("Cohort dict missing 'entry_criterion'"))?;
        let nodes = |key: &str| -> Result<Vec<Arc<dyn ComputeNode>>> {
            match value.get(key) {
                None | Some(Json::Null) => Ok(Vec::new()),
                Some(v) => v
                    .as_array()
                    .ok_or_else(|| crate::Error::config(format!("'{key}' must be a list")))?
                    .iter()
                    .map(crate::serialize::node_from_dict)
                    .collect(),
            }
        };
        let mut cohort = Cohort::new(name, entry);
        cohort.inclusions = nodes("inclusions")?;
        cohort.exclusions = nodes("exclusions")?;
        cohort.characteristics = nodes("characteristics")?;
        cohort.outcomes = nodes("outcomes")?;
        cohort.data_period = match value.get("data_period") {
            None | Some(Json::Null) => None,
            Some(v) => Some(DataPeriodFilter::from_dict(v)?),
        };
        Ok(cohort)
    }
}

fn subjects_of(table: &Table) -> Result<BTreeSet<Datum>> {
    Ok(table
        .column_values(columns::PERSON_ID)?
        .into_iter()
        .filter(|v| !v.is_null())
        .collect())
}

/// One deterministic row per subject (the smallest row in total order),
/// for joining characteristics side by side.
fn one_row_per_subject(table: &Table) -> Result<Table> {
    let sorted = table.sort();
    let person_idx = sorted.require_column(columns::PERSON_ID, "characteristics join")?;
    let mut seen: BTreeSet<Datum> = BTreeSet::new();
    let mut rows = Vec::new();
    for row in sorted.rows() {
        if seen.insert(row[person_idx].clone()) {
            rows.push(row.clone());
        }
    }
    Table::new(sorted.columns().to_vec(), rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codelist::Codelist;
    use crate::filters::{Value, ValueFilter};
    use crate::phenotypes::test_util::date;
    use crate::phenotypes::{
        AgePhenotype, CodelistPhenotype, ContinuousCoveragePhenotype, SexPhenotype,
    };

    fn af_entry() -> Arc<dyn ComputeNode> {
        Arc::new(
            CodelistPhenotype::new(
                "CONDITION_OCCURRENCE",
                Codelist::from_mapping("af", [("ICD-10", vec!["I48"])]),
            )
            .with_name("af_entry"),
        )
    }

    /// P1 (born 2000) and P2 (born 2010) both have AF; only P1 is adult at
    /// index. P3 has no AF. An out-of-period event for P1 must not move
    /// the index date.
    fn study_tables() -> TableMap {
        let person = Table::builder(["PERSON_ID", "DATE_OF_BIRTH", "SEX"])
            .row([
                Datum::from("P1"),
                Datum::from(date(2000, 3, 1)),
                Datum::from("F"),
            ])
            .row([
                Datum::from("P2"),
                Datum::from(date(2010, 1, 1)),
                Datum::from("M"),
            ])
            .row([
                Datum::from("P3"),
                Datum::from(date(1990, 1, 1)),
                Datum::from("F"),
            ])
            .build()
            .unwrap();
        let mut conditions =
            Table::builder(["PERSON_ID", "CODE", "CODE_TYPE", "EVENT_DATE"]);
        for (person, day) in [
            ("P1", date(2018, 1, 1)), // before the study period
            ("P1", date(2020, 5, 10)),
            ("P2", date(2020, 6, 1)),
        ] {
            conditions.push([
                Datum::from(person),
                Datum::from("I48"),
                Datum::from("ICD-10"),
                Datum::from(day),
            ]);
        }
        let mut tables = TableMap::new();
        tables.insert("PERSON".into(), person);
        tables.insert("CONDITION_OCCURRENCE".into(), conditions.build().unwrap());
        tables
    }

    fn study_cohort() -> Cohort {
        Cohort::new("af_adults", af_entry())
            .with_inclusion(Arc::new(
                AgePhenotype::new()
                    .with_value_filter(ValueFilter::min(Value::greater_than_or_equal_to(18))),
            ))
            .with_characteristic(Arc::new(SexPhenotype::new()))
            .with_data_period(crate::filters::DateFilter::new(
                Some(Value::after_or_on(date(2019, 1, 1))),
                Some(Value::before_or_on(date(2021, 12, 31))),
            ))
            .unwrap()
    }

    #[test]
    fn entry_plus_age_inclusion() {
        let result = study_cohort()
            .execute(&study_tables(), &ExecutionContext::new())
            .unwrap();
        // only the adult AF patient remains, indexed at the first
        // in-period AF event
        assert_eq!(result.index_table.len(), 1);
        let row = &result.index_table.rows()[0];
        assert_eq!(row[0], Datum::from("P1"));
        assert_eq!(row[1], Datum::from(date(2020, 5, 10)));

        let steps: Vec<(String, i64)> = result
            .attrition
            .rows()
            .iter()
            .map(|r| (r.step.to_string(), r.remaining))
            .collect();
        assert_eq!(
            steps,
            vec![
                ("entry".to_string(), 2),
                ("inclusion".to_string(), 1),
                ("final".to_string(), 1),
            ]
        );
    }

    #[test]
    fn characteristics_join_onto_the_final_cohort() {
        let result = study_cohort()
            .execute(&study_tables(), &ExecutionContext::new())
            .unwrap();
        let t = &result.characteristics_table;
        assert_eq!(t.len(), 1);
        let sex = t.column_index("SEX_VALUE").unwrap();
        assert_eq!(t.rows()[0][sex], Datum::from("F"));
        let flag = t.column_index("SEX_BOOLEAN").unwrap();
        assert_eq!(t.rows()[0][flag], Datum::Bool(true));
        // date column follows the <NAME>_DATE naming
        assert!(t.has_column("SEX_DATE"));
    }

    #[test]
    fn coverage_inclusion_anchored_to_entry() {
        // both subjects enter on 2020-07-01; only P1 has 180 days of
        // prior observation
        let mut conditions = Table::builder(["PERSON_ID", "CODE", "CODE_TYPE", "EVENT_DATE"]);
        for person in ["P1", "P2"] {
            conditions.push([
                Datum::from(person),
                Datum::from("I48"),
                Datum::from("ICD-10"),
                Datum::from(date(2020, 7, 1)),
            ]);
        }
        let periods = Table::builder(["PERSON_ID", "START_DATE", "END_DATE"])
            .row([
                Datum::from("P1"),
                Datum::from(date(2019, 1, 1)),
                Datum::from(date(2021, 12, 31)),
            ])
            .row([
                Datum::from("P2"),
                Datum::from(date(2019, 10, 1)),
                Datum::from(date(2020, 6, 1)),
            ])
            .build()
            .unwrap();
        let mut tables = TableMap::new();
        tables.insert("CONDITION_OCCURRENCE".into(), conditions.build().unwrap());
        tables.insert("OBSERVATION_PERIOD".into(), periods);

        let entry = af_entry();
        let coverage = Arc::new(
            ContinuousCoveragePhenotype::new("baseline_coverage", "OBSERVATION_PERIOD")
                .with_min_days(Value::greater_than_or_equal_to(180))
                .with_anchor(entry.clone()),
        );
        let cohort = Cohort::new("covered_af", entry).with_inclusion(coverage);
        let result = cohort.execute(&tables, &ExecutionContext::new()).unwrap();
        assert_eq!(result.index_table.len(), 1);
        assert_eq!(result.index_table.rows()[0][0], Datum::from("P1"));
    }

    #[test]
    fn waterfall_accounts_for_every_step() {
        // entry: P1..P4; inclusion keeps P1..P3; exclusion removes P3
        let mut conditions = Table::builder(["PERSON_ID", "CODE", "CODE_TYPE", "EVENT_DATE"]);
        for person in ["P1", "P2", "P3", "P4"] {
            conditions.push([
                Datum::from(person),
                Datum::from("I48"),
                Datum::from("ICD-10"),
                Datum::from(date(2020, 1, 1)),
            ]);
        }
        for person in ["P1", "P2", "P3"] {
            conditions.push([
                Datum::from(person),
                Datum::from("K01"),
                Datum::from("ICD-10"),
                Datum::from(date(2020, 2, 1)),
            ]);
        }
        conditions.push([
            Datum::from("P3"),
            Datum::from("X99"),
            Datum::from("ICD-10"),
            Datum::from(date(2020, 3, 1)),
        ]);
        let mut tables = TableMap::new();
        tables.insert("CONDITION_OCCURRENCE".into(), conditions.build().unwrap());

        let keep = Arc::new(CodelistPhenotype::new(
            "CONDITION_OCCURRENCE",
            Codelist::from_mapping("keep", [("ICD-10", vec!["K01"])]),
        ));
        let drop = Arc::new(CodelistPhenotype::new(
            "CONDITION_OCCURRENCE",
            Codelist::from_mapping("drop", [("ICD-10", vec!["X99"])]),
        ));
        let cohort = Cohort::new("wf", af_entry())
            .with_inclusion(keep)
            .with_exclusion(drop);
        let result = cohort.execute(&tables, &ExecutionContext::new()).unwrap();

        let rows = result.attrition.rows();
        assert_eq!(rows.len(), 4);
        assert_eq!((rows[0].n, rows[0].remaining, rows[0].delta), (Some(4), 4, None));
        assert_eq!((rows[1].n, rows[1].remaining, rows[1].delta), (Some(3), 3, Some(-1)));
        assert_eq!((rows[2].n, rows[2].remaining, rows[2].delta), (Some(1), 2, Some(-1)));
        assert_eq!((rows[3].n, rows[3].remaining), (None, 2));
        assert!((rows[3].pct_of_entry - 50.0).abs() < 1e-9);
        // set identity: entry ∩ inclusions \ exclusions
        let members = subjects_of(&result.index_table).unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.contains(&Datum::from("P1")));
        assert!(members.contains(&Datum::from("P2")));
    }

    #[test]
    fn repeated_runs_are_deterministic() {
        let tables = study_tables();
        let a = study_cohort()
            .execute(&tables, &ExecutionContext::new().with_threads(4))
            .unwrap();
        let b = study_cohort()
            .execute(&tables, &ExecutionContext::new().with_threads(1))
            .unwrap();
        assert_eq!(a.index_table.sort().rows(), b.index_table.sort().rows());
        assert_eq!(
            a.characteristics_table.sort().rows(),
            b.characteristics_table.sort().rows()
        );
        for (name, table) in &a.phenotype_tables {
            assert_eq!(table.sort().rows(), b.phenotype_tables[name].sort().rows());
        }
    }

    #[test]
    fn cohort_dict_round_trip() {
        let cohort = study_cohort();
        let restored = Cohort::from_dict(&cohort.to_dict()).unwrap();
        assert_eq!(
            crate::serialize::canonical_json(&cohort.to_dict()),
            crate::serialize::canonical_json(&restored.to_dict())
        );
    }
}
