#![forbid(unsafe_code)]

use std::collections::HashMap;

use chrono::NaiveDate;
use thiserror::Error;
use tr_columnar::{Array, ColumnError, KeyAtom, RowMask};
use tr_table::{ColumnInput, Table, TableError};
use tr_types::{DType, TypeError, Value};

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("column `{name}` does not exist")]
    MissingColumn { name: String },
    #[error("reduction over {kind} values is not numeric")]
    NonNumericReduction { kind: &'static str },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Type(#[from] TypeError),
}

// ── Reductions ─────────────────────────────────────────────────────────

/// A reduction maps one sub-array to one scalar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reduce {
    Sum,
    Mean,
    Count,
    Min,
    Max,
    First,
    Last,
    Std,
    Var,
    Median,
    Custom(fn(&Array) -> Value),
}

fn finite_f64s(array: &Array) -> Result<Vec<f64>, GroupError> {
    let mut out = Vec::with_capacity(array.len());
    for value in array.iter() {
        if value.is_missing() {
            continue;
        }
        out.push(value.to_f64().map_err(|_| GroupError::NonNumericReduction {
            kind: value.kind_name(),
        })?);
    }
    Ok(out)
}

impl Reduce {
    pub fn apply(self, array: &Array) -> Result<Value, GroupError> {
        match self {
            Self::Sum => match array {
                Array::Int(d) => Ok(Value::Int(d.iter().fold(0_i64, |a, b| a.wrapping_add(*b)))),
                Array::Float(d) => Ok(Value::Float(d.iter().sum())),
                Array::Bool(d) => Ok(Value::Int(d.iter().filter(|&&b| b).count() as i64)),
                _ => Ok(Value::Float(finite_f64s(array)?.iter().sum())),
            },
            Self::Mean => {
                let nums = finite_f64s(array)?;
                if nums.is_empty() {
                    return Ok(Value::Float(f64::NAN));
                }
                Ok(Value::Float(nums.iter().sum::<f64>() / nums.len() as f64))
            }
            Self::Count => Ok(Value::Int(array.len() as i64)),
            Self::Min => reduce_extremum(array, true),
            Self::Max => reduce_extremum(array, false),
            Self::First => Ok(array.value(0).unwrap_or(Value::Null)),
            Self::Last => Ok(array
                .value(array.len().wrapping_sub(1))
                .unwrap_or(Value::Null)),
            Self::Var => Ok(variance(&finite_f64s(array)?).map_or(Value::Null, Value::Float)),
            Self::Std => Ok(variance(&finite_f64s(array)?)
                .map_or(Value::Null, |v| Value::Float(v.sqrt()))),
            Self::Median => {
                let mut nums = finite_f64s(array)?;
                if nums.is_empty() {
                    return Ok(Value::Null);
                }
                nums.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let mid = nums.len() / 2;
                if nums.len() % 2 == 0 {
                    Ok(Value::Float((nums[mid - 1] + nums[mid]) / 2.0))
                } else {
                    Ok(Value::Float(nums[mid]))
                }
            }
            Self::Custom(f) => Ok(f(array)),
        }
    }
}

/// Population variance; `None` for an empty input.
fn variance(nums: &[f64]) -> Option<f64> {
    if nums.is_empty() {
        return None;
    }
    let n = nums.len() as f64;
    let mean = nums.iter().sum::<f64>() / n;
    Some(nums.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n)
}

fn reduce_extremum(array: &Array, min: bool) -> Result<Value, GroupError> {
    if array.is_empty() {
        return Ok(Value::Null);
    }
    match array {
        Array::Int(d) => Ok(Value::Int(if min {
            *d.iter().min().unwrap_or(&0)
        } else {
            *d.iter().max().unwrap_or(&0)
        })),
        Array::Str(d) => Ok(d
            .iter()
            .cloned()
            .reduce(|a, b| {
                if (a <= b) == min {
                    a
                } else {
                    b
                }
            })
            .map_or(Value::Null, Value::Str)),
        Array::Date(d) => Ok(Value::Date(if min {
            *d.iter().min().unwrap_or(&NaiveDate::MIN)
        } else {
            *d.iter().max().unwrap_or(&NaiveDate::MIN)
        })),
        Array::Bool(d) => Ok(Value::Bool(if min {
            d.iter().all(|&b| b)
        } else {
            d.iter().any(|&b| b)
        })),
        _ => {
            let nums = finite_f64s(array)?;
            if nums.is_empty() {
                return Ok(Value::Null);
            }
            let folded = if min {
                nums.iter().copied().fold(f64::INFINITY, f64::min)
            } else {
                nums.iter().copied().fold(f64::NEG_INFINITY, f64::max)
            };
            Ok(Value::Float(folded))
        }
    }
}

/// One aggregation-specification entry: a plain reduction of the column
/// sharing the result name, or a renamed reduction over another source.
#[derive(Debug, Clone)]
pub enum Reduction {
    Direct(Reduce),
    Renamed(Reduce, String),
}

#[derive(Debug, Clone)]
struct AggEntry {
    output: String,
    source: String,
    reduce: Reduce,
}

// ── Group keys ─────────────────────────────────────────────────────────

/// One distinct group: its key tuple, member row positions in ascending
/// order, and the equivalent row mask.
#[derive(Debug, Clone)]
pub struct GroupSlot {
    pub key: Vec<Value>,
    pub indices: Vec<usize>,
    pub mask: RowMask,
}

// ── Aggregation engine ─────────────────────────────────────────────────

/// The shared grouping primitive consumed by `group_by`, `transform`, and
/// `iterate_by`.
#[derive(Debug, Clone)]
pub struct Aggregation {
    group_by: Vec<String>,
    entries: Vec<AggEntry>,
}

impl Aggregation {
    /// Resolve the specification into `(output, source, reduce)` entries.
    #[must_use]
    pub fn new(group_by: Vec<String>, spec: Vec<(String, Reduction)>) -> Self {
        let entries = spec
            .into_iter()
            .map(|(output, reduction)| match reduction {
                Reduction::Direct(reduce) => AggEntry {
                    source: output.clone(),
                    output,
                    reduce,
                },
                Reduction::Renamed(reduce, source) => AggEntry {
                    output,
                    source,
                    reduce,
                },
            })
            .collect();
        Self { group_by, entries }
    }

    #[must_use]
    pub fn group_columns(&self) -> &[String] {
        &self.group_by
    }

    /// Every group-by column and every aggregation source must exist.
    /// Columns the specification does not reference are ignored.
    pub fn validate(&self, table: &Table) -> Result<(), GroupError> {
        for name in &self.group_by {
            if !table.contains(name) {
                return Err(GroupError::MissingColumn { name: name.clone() });
            }
        }
        for entry in &self.entries {
            if !table.contains(&entry.source) {
                return Err(GroupError::MissingColumn {
                    name: entry.source.clone(),
                });
            }
        }
        Ok(())
    }

    /// Distinct group-key tuples in first-occurrence order, single pass.
    pub fn unique_groups(&self, table: &Table) -> Result<Vec<GroupSlot>, GroupError> {
        self.validate(table)?;
        let rows = table.rows();
        let keys: Vec<Array> = self
            .group_by
            .iter()
            .map(|name| Ok(table.column(name)?.materialize()?))
            .collect::<Result<_, GroupError>>()?;

        let mut ordering: Vec<(Vec<Value>, Vec<usize>)> = Vec::new();
        let mut slot = HashMap::<Vec<KeyAtom>, usize>::new();

        for row in 0..rows {
            let atoms: Vec<KeyAtom> = keys
                .iter()
                .filter_map(|arr| arr.value(row))
                .map(|v| KeyAtom::from_value(&v))
                .collect();
            match slot.get(&atoms) {
                Some(&group) => ordering[group].1.push(row),
                None => {
                    let key = keys.iter().filter_map(|arr| arr.value(row)).collect();
                    slot.insert(atoms, ordering.len());
                    ordering.push((key, vec![row]));
                }
            }
        }

        Ok(ordering
            .into_iter()
            .map(|(key, indices)| {
                let mut mask = RowMask::none_set(rows);
                for &idx in &indices {
                    mask.set(idx, true);
                }
                GroupSlot { key, indices, mask }
            })
            .collect())
    }

    fn source_dtype(&self, table: &Table, name: &str) -> DType {
        table.dtype(name).unwrap_or(DType::Object)
    }

    /// One output row per group: group-by columns hold key values, each
    /// aggregation output holds its reduction over the member sub-array.
    pub fn group_by(&self, table: &Table) -> Result<Table, GroupError> {
        let groups = self.unique_groups(table)?;

        let mut out = Table::empty();
        for (pos, name) in self.group_by.iter().enumerate() {
            let values: Vec<Value> = groups.iter().map(|g| g.key[pos].clone()).collect();
            let array = build_column(values, self.source_dtype(table, name))?;
            out.set_column(name.clone(), ColumnInput::Array(array))?;
        }
        for entry in &self.entries {
            let source = table.column(&entry.source)?.materialize()?;
            let mut results = Vec::with_capacity(groups.len());
            for group in &groups {
                let sub = source.gather(&group.indices)?;
                results.push(entry.reduce.apply(&sub)?);
            }
            let array = build_column(results, self.source_dtype(table, &entry.source))?;
            out.set_column(entry.output.clone(), ColumnInput::Array(array))?;
        }
        Ok(out)
    }

    /// Reductions broadcast back over every member row: original row count
    /// and order are preserved.
    pub fn transform(&self, table: &Table) -> Result<Table, GroupError> {
        let groups = self.unique_groups(table)?;
        let rows = table.rows();

        let mut out = Table::empty();
        for name in &self.group_by {
            let array = table.column(name)?.materialize()?;
            out.set_column(name.clone(), ColumnInput::Array(array))?;
        }
        for entry in &self.entries {
            let source = table.column(&entry.source)?.materialize()?;
            let mut scattered = vec![Value::Null; rows];
            for group in &groups {
                let sub = source.gather(&group.indices)?;
                let result = entry.reduce.apply(&sub)?;
                for &idx in &group.indices {
                    scattered[idx] = result.clone();
                }
            }
            let array = build_column(scattered, self.source_dtype(table, &entry.source))?;
            out.set_column(entry.output.clone(), ColumnInput::Array(array))?;
        }
        Ok(out)
    }

    /// Lazy per-group partition in first-occurrence order. Each call
    /// starts a fresh iterator; each yielded sub-table is the row gather
    /// for the group's mask and therefore aliases parent storage.
    pub fn iterate_by(&self, table: &Table) -> Result<IterateBy, GroupError> {
        let groups = self.unique_groups(table)?;
        Ok(IterateBy {
            parent: table.clone(),
            groups: groups.into_iter(),
            position: 0,
        })
    }
}

fn build_column(values: Vec<Value>, fallback: DType) -> Result<Array, GroupError> {
    if values.is_empty() {
        return Ok(Array::empty(fallback));
    }
    Ok(Array::from_values(values)?)
}

/// One partition of an `iterate_by` pass.
#[derive(Debug)]
pub struct GroupView {
    pub position: usize,
    pub key: Vec<Value>,
    pub indices: Vec<usize>,
    pub table: Table,
}

#[derive(Debug)]
pub struct IterateBy {
    parent: Table,
    groups: std::vec::IntoIter<GroupSlot>,
    position: usize,
}

impl Iterator for IterateBy {
    type Item = Result<GroupView, GroupError>;

    fn next(&mut self) -> Option<Self::Item> {
        let group = self.groups.next()?;
        let position = self.position;
        self.position += 1;
        let table = match self.parent.filter_mask(&group.mask) {
            Ok(table) => table,
            Err(err) => return Some(Err(err.into())),
        };
        Some(Ok(GroupView {
            position,
            key: group.key,
            indices: group.indices,
            table,
        }))
    }
}

// ── Front-end helpers ──────────────────────────────────────────────────

/// SQL `GROUP BY`: one row per distinct key tuple.
pub fn group_by(
    table: &Table,
    columns: &[&str],
    spec: Vec<(String, Reduction)>,
) -> Result<Table, GroupError> {
    Aggregation::new(columns.iter().map(|&c| c.to_owned()).collect(), spec).group_by(table)
}

/// SQL `GROUP BY` joined back to the source rows.
pub fn transform(
    table: &Table,
    columns: &[&str],
    spec: Vec<(String, Reduction)>,
) -> Result<Table, GroupError> {
    Aggregation::new(columns.iter().map(|&c| c.to_owned()).collect(), spec).transform(table)
}

/// Partition into per-group sub-tables.
pub fn iterate_by(table: &Table, columns: &[&str]) -> Result<IterateBy, GroupError> {
    Aggregation::new(columns.iter().map(|&c| c.to_owned()).collect(), Vec::new()).iterate_by(table)
}

#[cfg(test)]
mod tests {
    use tr_columnar::Array;
    use tr_table::{ColumnInput, Table};
    use tr_types::{DType, Value};

    use super::{group_by, iterate_by, transform, Aggregation, GroupError, Reduce, Reduction};

    fn fixture() -> Table {
        Table::new(vec![
            ("x", ColumnInput::from(vec![1_i64, 2, 3, 4, 5, 6])),
            ("y", vec!["one", "two", "one", "two", "one", "two"].into()),
            ("z", vec![0_i64, 0, 0, 1, 1, 1].into()),
        ])
        .expect("fixture")
    }

    fn sum_of_x() -> Vec<(String, Reduction)> {
        vec![("x".to_owned(), Reduction::Direct(Reduce::Sum))]
    }

    #[test]
    fn unique_groups_follow_first_occurrence() {
        let agg = Aggregation::new(vec!["y".to_owned(), "z".to_owned()], Vec::new());
        let groups = agg.unique_groups(&fixture()).expect("groups");
        assert_eq!(groups.len(), 4);
        let keys: Vec<_> = groups.iter().map(|g| g.key.clone()).collect();
        assert_eq!(
            keys,
            vec![
                vec![Value::Str("one".to_owned()), Value::Int(0)],
                vec![Value::Str("two".to_owned()), Value::Int(0)],
                vec![Value::Str("two".to_owned()), Value::Int(1)],
                vec![Value::Str("one".to_owned()), Value::Int(1)],
            ]
        );
        assert_eq!(groups[0].indices, vec![0, 2]);
        assert_eq!(groups[1].indices, vec![1]);
        assert_eq!(groups[2].indices, vec![3, 5]);
        assert_eq!(groups[3].indices, vec![4]);
    }

    #[test]
    fn masks_partition_the_row_space() {
        let agg = Aggregation::new(vec!["y".to_owned(), "z".to_owned()], Vec::new());
        let table = fixture();
        let groups = agg.unique_groups(&table).expect("groups");

        let total: usize = groups.iter().map(|g| g.mask.count_set()).sum();
        assert_eq!(total, table.rows());

        for (i, a) in groups.iter().enumerate() {
            for b in groups.iter().skip(i + 1) {
                assert_eq!(a.mask.and_mask(&b.mask).count_set(), 0);
            }
        }
    }

    #[test]
    fn group_by_reduces_in_group_order() {
        let out = group_by(&fixture(), &["y", "z"], sum_of_x()).expect("group_by");
        assert_eq!(out.rows(), 4);
        assert_eq!(out.columns(), &["y", "z", "x"]);
        assert_eq!(
            out.column("x").expect("x").values(),
            vec![Value::Int(4), Value::Int(2), Value::Int(10), Value::Int(5)]
        );
        assert_eq!(out.dtype("x"), Some(DType::Int));
    }

    #[test]
    fn renamed_aggregation_reads_its_source() {
        let spec = vec![
            ("x".to_owned(), Reduction::Direct(Reduce::Sum)),
            (
                "new_x".to_owned(),
                Reduction::Renamed(Reduce::Sum, "x".to_owned()),
            ),
            (
                "count".to_owned(),
                Reduction::Renamed(Reduce::Count, "x".to_owned()),
            ),
        ];
        let out = group_by(&fixture(), &["y", "z"], spec).expect("group_by");
        assert_eq!(
            out.column("new_x").expect("new_x").values(),
            out.column("x").expect("x").values()
        );
        assert_eq!(
            out.column("count").expect("count").values(),
            vec![Value::Int(2), Value::Int(1), Value::Int(2), Value::Int(1)]
        );
    }

    #[test]
    fn validate_names_the_missing_column() {
        let err = group_by(&fixture(), &["nope"], sum_of_x()).expect_err("missing group col");
        assert!(matches!(err, GroupError::MissingColumn { ref name } if name == "nope"));

        let err = group_by(
            &fixture(),
            &["y"],
            vec![(
                "out".to_owned(),
                Reduction::Renamed(Reduce::Sum, "gone".to_owned()),
            )],
        )
        .expect_err("missing source");
        assert!(matches!(err, GroupError::MissingColumn { ref name } if name == "gone"));
    }

    #[test]
    fn transform_preserves_rows_and_order() {
        let table = fixture();
        let out = transform(&table, &["y", "z"], sum_of_x()).expect("transform");
        assert_eq!(out.rows(), table.rows());
        assert_eq!(
            out.column("y").expect("y").values(),
            table.column("y").expect("y").values()
        );
        assert_eq!(
            out.column("x").expect("x").values(),
            vec![
                Value::Int(4),
                Value::Int(2),
                Value::Int(4),
                Value::Int(10),
                Value::Int(5),
                Value::Int(10),
            ]
        );
    }

    #[test]
    fn iterate_by_yields_aliasing_subtables() {
        let table = fixture();
        for group in iterate_by(&table, &["y", "z"]).expect("iterate") {
            let group = group.expect("group");
            let sum = Reduce::Sum
                .apply(&group.table.column("x").expect("x").materialize().expect("arr"))
                .expect("sum");
            group
                .table
                .column("x")
                .expect("x")
                .fill(&(0..group.table.rows()).collect::<Vec<_>>(), &sum)
                .expect("write back");
        }
        // writes through the sub-tables landed in the parent
        assert_eq!(
            table.column("x").expect("x").values(),
            vec![
                Value::Int(4),
                Value::Int(2),
                Value::Int(4),
                Value::Int(10),
                Value::Int(5),
                Value::Int(10),
            ]
        );
    }

    #[test]
    fn iterate_by_restarts_per_call() {
        let table = fixture();
        let first: Vec<_> = iterate_by(&table, &["y"])
            .expect("iterate")
            .map(|g| g.expect("group").key)
            .collect();
        let second: Vec<_> = iterate_by(&table, &["y"])
            .expect("iterate")
            .map(|g| g.expect("group").key)
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn custom_reduction_runs_verbatim() {
        fn spread(array: &Array) -> Value {
            match array {
                Array::Int(d) => Value::Int(
                    d.iter().max().copied().unwrap_or(0) - d.iter().min().copied().unwrap_or(0),
                ),
                _ => Value::Null,
            }
        }
        let spec = vec![(
            "spread".to_owned(),
            Reduction::Renamed(Reduce::Custom(spread), "x".to_owned()),
        )];
        let out = group_by(&fixture(), &["y"], spec).expect("group_by");
        // y=one rows have x {1,3,5}; y=two rows have x {2,4,6}
        assert_eq!(
            out.column("spread").expect("spread").values(),
            vec![Value::Int(4), Value::Int(4)]
        );
    }

    #[test]
    fn reductions_cover_numeric_edges() {
        let floats = Array::Float(vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(Reduce::Mean.apply(&floats).expect("mean"), Value::Float(5.0));
        assert_eq!(Reduce::Var.apply(&floats).expect("var"), Value::Float(4.0));
        assert_eq!(Reduce::Std.apply(&floats).expect("std"), Value::Float(2.0));
        assert_eq!(Reduce::Min.apply(&floats).expect("min"), Value::Float(2.0));
        assert_eq!(Reduce::Max.apply(&floats).expect("max"), Value::Float(9.0));
        assert_eq!(
            Reduce::Median.apply(&floats).expect("median"),
            Value::Float(4.5)
        );
        assert_eq!(Reduce::First.apply(&floats).expect("first"), Value::Float(2.0));
        assert_eq!(Reduce::Last.apply(&floats).expect("last"), Value::Float(9.0));
        assert_eq!(Reduce::Count.apply(&floats).expect("count"), Value::Int(8));

        let empty = Array::Float(Vec::new());
        assert_eq!(Reduce::Sum.apply(&empty).expect("sum"), Value::Float(0.0));
        assert_eq!(Reduce::First.apply(&empty).expect("first"), Value::Null);
        assert!(matches!(Reduce::Mean.apply(&empty).expect("mean"), Value::Float(v) if v.is_nan()));
    }

    #[test]
    fn nan_keys_form_one_group() {
        let table = Table::new(vec![
            ("k", ColumnInput::from(vec![f64::NAN, 1.0, f64::NAN])),
            ("v", vec![10_i64, 20, 30].into()),
        ])
        .expect("table");
        let groups = Aggregation::new(vec!["k".to_owned()], Vec::new())
            .unique_groups(&table)
            .expect("groups");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].indices, vec![0, 2]);
    }
}
