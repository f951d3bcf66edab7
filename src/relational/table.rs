use super::{Agg, Datum, Expr};
use crate::{ArcStr, Error, Result};
use itertools::Itertools;
use noisy_float::prelude::*;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// How to join two tables on a set of key columns.
///
/// Rows whose key contains a null never match (so e.g. an anti-join keeps
/// them). `Semi` and `Anti` return left columns only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    Inner,
    Left,
    Outer,
    Semi,
    Anti,
}

/// An immutable relation. Cloning is cheap (shared internals); every
/// operation returns a fresh table, so upstream tables are never mutated.
#[derive(Debug, Clone)]
pub struct Table {
    columns: Arc<Vec<ArcStr>>,
    rows: Arc<Vec<Vec<Datum>>>,
}

impl Table {
    pub fn new(columns: Vec<ArcStr>, rows: Vec<Vec<Datum>>) -> Result<Self> {
        if columns.iter().duplicates().next().is_some() {
            return Err(Error::config("duplicate column name in table"));
        }
        for row in &rows {
            if row.len() != columns.len() {
                return Err(Error::config(format!(
                    "row width {} does not match column count {}",
                    row.len(),
                    columns.len()
                )));
            }
        }
        Ok(Table {
            columns: Arc::new(columns),
            rows: Arc::new(rows),
        })
    }

    pub fn builder<I, S>(columns: I) -> TableBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<ArcStr>,
    {
        TableBuilder {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn empty(columns: Vec<ArcStr>) -> Self {
        Table {
            columns: Arc::new(columns),
            rows: Arc::new(Vec::new()),
        }
    }

    pub fn columns(&self) -> &[ArcStr] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Datum>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| **c == *name)
    }

    pub fn require_column(&self, name: &str, context: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| Error::schema(name, context))
    }

    /// All values of one column, in row order.
    pub fn column_values(&self, name: &str) -> Result<Vec<Datum>> {
        let idx = self.require_column(name, "column_values")?;
        Ok(self.rows.iter().map(|r| r[idx].clone()).collect())
    }

    pub fn select(&self, names: &[&str]) -> Result<Table> {
        let idxs = names
            .iter()
            .map(|n| self.require_column(n, "select"))
            .collect::<Result<Vec<_>>>()?;
        let columns = idxs.iter().map(|i| self.columns[*i].clone()).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| idxs.iter().map(|i| row[*i].clone()).collect())
            .collect();
        Table::new(columns, rows)
    }

    pub fn drop_columns(&self, names: &[&str]) -> Result<Table> {
        let keep: Vec<&str> = self
            .columns
            .iter()
            .filter(|c| !names.contains(&&***c))
            .map(|c| &**c)
            .collect();
        self.select(&keep)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<Table> {
        let idx = self.require_column(from, "rename")?;
        let mut columns = (*self.columns).clone();
        columns[idx] = to.into();
        Table::new(columns, (*self.rows).clone())
    }

    /// Keep rows for which the predicate evaluates to exactly true.
    pub fn filter(&self, predicate: &Expr) -> Result<Table> {
        let mut rows = Vec::new();
        for row in self.rows.iter() {
            if predicate.eval(&self.columns, row)?.is_true() {
                rows.push(row.clone());
            }
        }
        Table::new((*self.columns).clone(), rows)
    }

    /// Add or replace one column. See [`Table::mutate_many`].
    pub fn mutate(&self, name: &str, expr: &Expr) -> Result<Table> {
        self.mutate_many(&[(name, expr.clone())])
    }

    /// Add or replace columns. All expressions see the *pre-mutation* row,
    /// so a column can be rewritten in terms of its own old value.
    pub fn mutate_many(&self, mutations: &[(&str, Expr)]) -> Result<Table> {
        let mut columns = (*self.columns).clone();
        let mut targets = Vec::with_capacity(mutations.len());
        for (name, _) in mutations {
            match self.column_index(name) {
                Some(idx) => targets.push(idx),
                None => {
                    columns.push((*name).into());
                    targets.push(columns.len() - 1);
                }
            }
        }
        let mut rows = Vec::with_capacity(self.rows.len());
        for row in self.rows.iter() {
            let mut out = row.clone();
            out.resize(columns.len(), Datum::Null);
            for ((_, expr), target) in mutations.iter().zip(&targets) {
                out[*target] = expr.eval(&self.columns, row)?;
            }
            rows.push(out);
        }
        Table::new(columns, rows)
    }

    /// Distinct rows, in the total order of their values.
    pub fn distinct(&self) -> Table {
        let set: BTreeSet<&Vec<Datum>> = self.rows.iter().collect();
        Table {
            columns: self.columns.clone(),
            rows: Arc::new(set.into_iter().cloned().collect()),
        }
    }

    /// Append another table with the same column set (any column order).
    pub fn union(&self, other: &Table) -> Result<Table> {
        let idxs = self
            .columns
            .iter()
            .map(|c| other.require_column(c, "union"))
            .collect::<Result<Vec<_>>>()?;
        if other.columns.len() != self.columns.len() {
            return Err(Error::config("union of tables with differing column sets"));
        }
        let mut rows = (*self.rows).clone();
        for row in other.rows.iter() {
            rows.push(idxs.iter().map(|i| row[*i].clone()).collect());
        }
        Table::new((*self.columns).clone(), rows)
    }

    /// Stable sort by the named columns (total order, nulls first).
    pub fn sort_by(&self, names: &[&str]) -> Result<Table> {
        let idxs = names
            .iter()
            .map(|n| self.require_column(n, "sort_by"))
            .collect::<Result<Vec<_>>>()?;
        let mut rows = (*self.rows).clone();
        rows.sort_by(|a, b| {
            idxs.iter()
                .map(|i| a[*i].cmp(&b[*i]))
                .find(|o| !o.is_eq())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Table::new((*self.columns).clone(), rows)
    }

    /// Sort by every column left to right; canonical row order for
    /// comparing outputs.
    pub fn sort(&self) -> Table {
        let mut rows = (*self.rows).clone();
        rows.sort();
        Table {
            columns: self.columns.clone(),
            rows: Arc::new(rows),
        }
    }

    pub fn join(&self, other: &Table, on: &[&str], how: Join) -> Result<Table> {
        let left_keys = on
            .iter()
            .map(|n| self.require_column(n, "join"))
            .collect::<Result<Vec<_>>>()?;
        let right_keys = on
            .iter()
            .map(|n| other.require_column(n, "join"))
            .collect::<Result<Vec<_>>>()?;

        // Index the right side; rows with a null key never match.
        let mut right_index: BTreeMap<Vec<Datum>, Vec<usize>> = BTreeMap::new();
        for (idx, row) in other.rows.iter().enumerate() {
            let key: Vec<Datum> = right_keys.iter().map(|i| row[*i].clone()).collect();
            if key.iter().any(Datum::is_null) {
                continue;
            }
            right_index.entry(key).or_default().push(idx);
        }

        // Right payload: non-key columns, suffixed on collision.
        let right_payload: Vec<usize> = (0..other.columns.len())
            .filter(|i| !right_keys.contains(i))
            .collect();
        let mut columns = (*self.columns).clone();
        if !matches!(how, Join::Semi | Join::Anti) {
            for i in &right_payload {
                let name = &other.columns[*i];
                if self.has_column(name) {
                    columns.push(format!("{}_RIGHT", name).into());
                } else {
                    columns.push(name.clone());
                }
            }
        }

        let mut rows: Vec<Vec<Datum>> = Vec::new();
        let mut matched_right: BTreeSet<usize> = BTreeSet::new();
        for row in self.rows.iter() {
            let key: Vec<Datum> = left_keys.iter().map(|i| row[*i].clone()).collect();
            let matches = if key.iter().any(Datum::is_null) {
                None
            } else {
                right_index.get(&key)
            };
            match how {
                Join::Semi => {
                    if matches.is_some() {
                        rows.push(row.clone());
                    }
                }
                Join::Anti => {
                    if matches.is_none() {
                        rows.push(row.clone());
                    }
                }
                Join::Inner | Join::Left | Join::Outer => match matches {
                    Some(idxs) => {
                        for ridx in idxs {
                            matched_right.insert(*ridx);
                            let mut out = row.clone();
                            let rrow = &other.rows[*ridx];
                            out.extend(right_payload.iter().map(|i| rrow[*i].clone()));
                            rows.push(out);
                        }
                    }
                    None => {
                        if matches!(how, Join::Left | Join::Outer) {
                            let mut out = row.clone();
                            out.extend(right_payload.iter().map(|_| Datum::Null));
                            rows.push(out);
                        }
                    }
                },
            }
        }
        if how == Join::Outer {
            for (ridx, rrow) in other.rows.iter().enumerate() {
                if matched_right.contains(&ridx) {
                    continue;
                }
                let mut out = vec![Datum::Null; self.columns.len()];
                for (l, r) in left_keys.iter().zip(&right_keys) {
                    out[*l] = rrow[*r].clone();
                }
                out.extend(right_payload.iter().map(|i| rrow[*i].clone()));
                rows.push(out);
            }
        }
        Table::new(columns, rows)
    }

    /// Group by key columns and reduce; output is keys + one column per
    /// aggregate, ordered by key.
    pub fn aggregate(&self, keys: &[&str], aggs: &[(&str, Agg)]) -> Result<Table> {
        let key_idxs = keys
            .iter()
            .map(|n| self.require_column(n, "aggregate"))
            .collect::<Result<Vec<_>>>()?;
        for (_, agg) in aggs {
            if let Some(column) = agg.column() {
                self.require_column(column, "aggregate")?;
            }
        }
        let groups = self.group_rows(&key_idxs);
        let mut columns: Vec<ArcStr> = key_idxs.iter().map(|i| self.columns[*i].clone()).collect();
        columns.extend(aggs.iter().map(|(name, _)| ArcStr::from(*name)));
        let mut rows = Vec::with_capacity(groups.len());
        for (key, members) in groups {
            let mut out = key;
            for (_, agg) in aggs {
                out.push(self.apply_agg(agg, &members)?);
            }
            rows.push(out);
        }
        Table::new(columns, rows)
    }

    /// Append a column holding a per-partition aggregate (the analytic
    /// counterpart of [`Table::aggregate`]; row count is preserved).
    pub fn window(&self, keys: &[&str], out_name: &str, agg: &Agg) -> Result<Table> {
        let key_idxs = keys
            .iter()
            .map(|n| self.require_column(n, "window"))
            .collect::<Result<Vec<_>>>()?;
        if let Some(column) = agg.column() {
            self.require_column(column, "window")?;
        }
        let groups = self.group_rows(&key_idxs);
        let mut per_key: BTreeMap<Vec<Datum>, Datum> = BTreeMap::new();
        for (key, members) in groups {
            let value = self.apply_agg(agg, &members)?;
            per_key.insert(key, value);
        }
        let mut columns = (*self.columns).clone();
        match self.column_index(out_name) {
            Some(_) => return Err(Error::config(format!("window output column '{out_name}' already exists"))),
            None => columns.push(out_name.into()),
        }
        let mut rows = Vec::with_capacity(self.rows.len());
        for row in self.rows.iter() {
            let key: Vec<Datum> = key_idxs.iter().map(|i| row[*i].clone()).collect();
            let mut out = row.clone();
            out.push(per_key.get(&key).cloned().unwrap_or(Datum::Null));
            rows.push(out);
        }
        Table::new(columns, rows)
    }

    fn group_rows(&self, key_idxs: &[usize]) -> BTreeMap<Vec<Datum>, Vec<usize>> {
        let mut groups: BTreeMap<Vec<Datum>, Vec<usize>> = BTreeMap::new();
        for (idx, row) in self.rows.iter().enumerate() {
            let key: Vec<Datum> = key_idxs.iter().map(|i| row[*i].clone()).collect();
            groups.entry(key).or_default().push(idx);
        }
        groups
    }

    fn apply_agg(&self, agg: &Agg, members: &[usize]) -> Result<Datum> {
        let values = |column: &ArcStr| -> Vec<&Datum> {
            let idx = self.column_index(column).expect("validated by caller");
            members
                .iter()
                .map(|m| &self.rows[*m][idx])
                .filter(|v| !v.is_null())
                .collect()
        };
        Ok(match agg {
            Agg::Count => Datum::Int(members.len() as i64),
            Agg::CountDistinct(column) => {
                let distinct: BTreeSet<&Datum> = values(column).into_iter().collect();
                Datum::Int(distinct.len() as i64)
            }
            Agg::Min(column) => values(column).into_iter().min().cloned().unwrap_or(Datum::Null),
            Agg::Max(column) => values(column).into_iter().max().cloned().unwrap_or(Datum::Null),
            Agg::Sum(column) => {
                let values = values(column);
                if values.is_empty() {
                    Datum::Null
                } else if values.iter().all(|v| matches!(v, Datum::Int(_))) {
                    Datum::Int(values.iter().filter_map(|v| match v {
                        Datum::Int(x) => Some(*x),
                        _ => None,
                    }).sum())
                } else {
                    Datum::Float(values.iter().filter_map(|v| v.as_f64()).sum())
                }
            }
            Agg::Mean(column) => {
                let nums: Vec<f64> = values(column).iter().filter_map(|v| v.as_f64()).collect();
                if nums.is_empty() {
                    Datum::Null
                } else {
                    Datum::Float(nums.iter().sum::<f64>() / nums.len() as f64)
                }
            }
            Agg::Median(column) => {
                let mut nums: Vec<N64> = values(column)
                    .iter()
                    .filter_map(|v| v.as_f64())
                    .map(n64)
                    .collect();
                if nums.is_empty() {
                    Datum::Null
                } else {
                    nums.sort();
                    let mid = nums.len() / 2;
                    if nums.len() % 2 == 1 {
                        Datum::Float(nums[mid].raw())
                    } else {
                        Datum::Float((nums[mid - 1].raw() + nums[mid].raw()) / 2.0)
                    }
                }
            }
        })
    }
}

/// Row-by-row construction, used pervasively in tests and by hosts
/// assembling small input tables.
pub struct TableBuilder {
    columns: Vec<ArcStr>,
    rows: Vec<Vec<Datum>>,
}

impl TableBuilder {
    pub fn row<I, D>(mut self, row: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Datum>,
    {
        self.rows.push(row.into_iter().map(Into::into).collect());
        self
    }

    pub fn push<I, D>(&mut self, row: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<Datum>,
    {
        self.rows.push(row.into_iter().map(Into::into).collect());
    }

    pub fn build(self) -> Result<Table> {
        Table::new(self.columns, self.rows)
    }
}
