#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::mem::size_of;

use bumpalo::{collections::Vec as BumpVec, Bump};
use thiserror::Error;
use tr_columnar::{compare_values, Array, ColumnError, CompareOp, KeyAtom};
use tr_table::{ColumnInput, Table, TableError};
use tr_types::{DType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    Inner,
    Left,
}

/// One `(left_column, right_column, operator)` predicate triple; all
/// triples of a join must hold for a row pairing to match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub left: String,
    pub right: String,
    pub op: CompareOp,
}

impl Predicate {
    /// Parse an operator spelling; anything outside
    /// `{==, !=, <, <=, >, >=}` is rejected.
    pub fn new(
        left: impl Into<String>,
        right: impl Into<String>,
        op: &str,
    ) -> Result<Self, JoinError> {
        let op = CompareOp::parse(op).map_err(|_| JoinError::UnknownOperator {
            op: op.to_owned(),
        })?;
        Ok(Self {
            left: left.into(),
            right: right.into(),
            op,
        })
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("join operator `{op}` is not one of ==, !=, <, <=, >, >=")]
    UnknownOperator { op: String },
    #[error("predicate `{left}` {op} `{right}` compares {left_dtype} with {right_dtype}")]
    DtypeMismatch {
        left: String,
        right: String,
        op: &'static str,
        left_dtype: DType,
        right_dtype: DType,
    },
    #[error("column `{name}` does not exist")]
    MissingColumn { name: String },
    #[error("select column `{name}` does not exist on either side")]
    UnknownSelect { name: String },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// Intermediate pair buffers live in a bump arena when the byte estimate
/// fits the budget; otherwise the global allocator takes over. Both paths
/// produce identical tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for JoinExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JoinExecutionTrace {
    used_arena: bool,
    output_rows: usize,
    estimated_bytes: usize,
}

// ── Cross join ─────────────────────────────────────────────────────────

/// Cartesian product: `left.rows * right.rows` output rows, row
/// `i * right.rows + j` pairing left row `i` with right row `j`.
///
/// `select` defaults to all columns of both sides in table order; a
/// requested column present on neither side is an index error.
pub fn cross_join(
    left: &Table,
    right: &Table,
    select: Option<&[&str]>,
) -> Result<Table, JoinError> {
    let names = resolve_select(left, right, select, true)?;

    let l = left.rows();
    let r = right.rows();
    let mut left_pos = Vec::with_capacity(l * r);
    let mut right_pos = Vec::with_capacity(l * r);
    for i in 0..l {
        for j in 0..r {
            left_pos.push(i);
            right_pos.push(j);
        }
    }

    let mut out = Table::empty();
    for name in names {
        let (source, positions) = if left.contains(&name) {
            (left, &left_pos)
        } else {
            (right, &right_pos)
        };
        let gathered = source.column(&name)?.materialize()?.gather(positions)?;
        out.set_column(name, ColumnInput::Array(gathered))?;
    }
    Ok(out)
}

// ── Conditional join ───────────────────────────────────────────────────

/// Inner or left join under the AND of all predicate triples.
///
/// Equality predicates drive a hash build/probe on the right side;
/// remaining inequality predicates filter the candidate pairs. With no
/// equality predicate every pair is checked.
pub fn join(
    left: &Table,
    right: &Table,
    predicates: &[Predicate],
    select: &[&str],
    mode: JoinMode,
) -> Result<Table, JoinError> {
    join_with_options(
        left,
        right,
        predicates,
        select,
        mode,
        JoinExecutionOptions::default(),
    )
}

pub fn join_with_options(
    left: &Table,
    right: &Table,
    predicates: &[Predicate],
    select: &[&str],
    mode: JoinMode,
    options: JoinExecutionOptions,
) -> Result<Table, JoinError> {
    let (table, _trace) = join_with_trace(left, right, predicates, select, mode, options)?;
    Ok(table)
}

fn join_with_trace(
    left: &Table,
    right: &Table,
    predicates: &[Predicate],
    select: &[&str],
    mode: JoinMode,
    options: JoinExecutionOptions,
) -> Result<(Table, JoinExecutionTrace), JoinError> {
    validate_predicates(left, right, predicates)?;
    let names = resolve_select(left, right, Some(select), false)?;

    // Materialize every predicate column once, before any row scan.
    let mut left_cols = HashMap::<&str, Array>::new();
    let mut right_cols = HashMap::<&str, Array>::new();
    for p in predicates {
        if !left_cols.contains_key(p.left.as_str()) {
            left_cols.insert(p.left.as_str(), left.column(&p.left)?.materialize()?);
        }
        if !right_cols.contains_key(p.right.as_str()) {
            right_cols.insert(p.right.as_str(), right.column(&p.right)?.materialize()?);
        }
    }

    let equi: Vec<&Predicate> = predicates.iter().filter(|p| p.op == CompareOp::Eq).collect();
    let residual: Vec<&Predicate> =
        predicates.iter().filter(|p| p.op != CompareOp::Eq).collect();

    // Build phase: hash right rows by their equi-key tuple. Rows with a
    // missing key component match nothing, consistent with the scalar
    // comparison semantics.
    let right_rows = right.rows();
    let mut probe = HashMap::<Vec<KeyAtom>, Vec<usize>>::new();
    if !equi.is_empty() {
        for j in 0..right_rows {
            if let Some(key) = equi_key(&equi, &right_cols, Side::Right, j) {
                probe.entry(key).or_default().push(j);
            }
        }
    }

    let candidates_of = |i: usize| {
        if equi.is_empty() {
            Candidates::All(right_rows)
        } else {
            match equi_key(&equi, &left_cols, Side::Left, i) {
                Some(key) => Candidates::Probed(probe.get(&key)),
                None => Candidates::Probed(None),
            }
        }
    };

    let output_rows = estimate_output_rows(left.rows(), mode, &candidates_of);
    let estimated_bytes = estimate_intermediate_bytes(output_rows);
    let use_arena = options.use_arena && estimated_bytes <= options.arena_budget_bytes;

    let residual_holds = |i: usize, j: usize| -> Result<bool, JoinError> {
        for p in &residual {
            let lhs = left_cols[p.left.as_str()].value(i).unwrap_or(Value::Null);
            let rhs = right_cols[p.right.as_str()].value(j).unwrap_or(Value::Null);
            if !compare_values(&lhs, &rhs, p.op)? {
                return Ok(false);
            }
        }
        Ok(true)
    };

    let table = if use_arena {
        scan_with_arena(
            left,
            right,
            &names,
            mode,
            output_rows,
            &candidates_of,
            &residual_holds,
        )?
    } else {
        scan_with_global_allocator(
            left,
            right,
            &names,
            mode,
            output_rows,
            &candidates_of,
            &residual_holds,
        )?
    };

    let trace = JoinExecutionTrace {
        used_arena: use_arena,
        output_rows,
        estimated_bytes,
    };
    Ok((table, trace))
}

enum Candidates<'a> {
    All(usize),
    Probed(Option<&'a Vec<usize>>),
}

impl Candidates<'_> {
    fn len(&self) -> usize {
        match self {
            Self::All(n) => *n,
            Self::Probed(hits) => hits.map_or(0, Vec::len),
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = usize> + '_> {
        match self {
            Self::All(n) => Box::new(0..*n),
            Self::Probed(hits) => {
                Box::new(hits.map_or(&[][..], Vec::as_slice).iter().copied())
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

/// The hashable equi-key tuple for one row, or `None` when any component
/// is missing.
fn equi_key(
    equi: &[&Predicate],
    columns: &HashMap<&str, Array>,
    side: Side,
    row: usize,
) -> Option<Vec<KeyAtom>> {
    equi.iter()
        .map(|p| {
            let name = match side {
                Side::Left => p.left.as_str(),
                Side::Right => p.right.as_str(),
            };
            let value = columns[name].value(row)?;
            if value.is_missing() {
                return None;
            }
            Some(KeyAtom::from_value(&value))
        })
        .collect()
}

fn estimate_output_rows<'a, F: Fn(usize) -> Candidates<'a>>(
    left_rows: usize,
    mode: JoinMode,
    candidates_of: &F,
) -> usize {
    (0..left_rows)
        .map(|i| {
            let hits = candidates_of(i).len();
            if hits == 0 && matches!(mode, JoinMode::Left) {
                1
            } else {
                hits
            }
        })
        .sum()
}

fn estimate_intermediate_bytes(output_rows: usize) -> usize {
    output_rows.saturating_mul(size_of::<usize>() + size_of::<Option<usize>>())
}

fn scan_with_global_allocator<'a, F, R>(
    left: &Table,
    right: &Table,
    names: &[String],
    mode: JoinMode,
    output_rows: usize,
    candidates_of: &F,
    residual_holds: &R,
) -> Result<Table, JoinError>
where
    F: Fn(usize) -> Candidates<'a>,
    R: Fn(usize, usize) -> Result<bool, JoinError>,
{
    let mut left_pos = Vec::<usize>::with_capacity(output_rows);
    let mut right_pos = Vec::<Option<usize>>::with_capacity(output_rows);

    for i in 0..left.rows() {
        let mut matched = false;
        for j in candidates_of(i).iter() {
            if residual_holds(i, j)? {
                matched = true;
                left_pos.push(i);
                right_pos.push(Some(j));
            }
        }
        if !matched && matches!(mode, JoinMode::Left) {
            left_pos.push(i);
            right_pos.push(None);
        }
    }

    emit_join(left, right, names, &left_pos, &right_pos)
}

fn scan_with_arena<'a, F, R>(
    left: &Table,
    right: &Table,
    names: &[String],
    mode: JoinMode,
    output_rows: usize,
    candidates_of: &F,
    residual_holds: &R,
) -> Result<Table, JoinError>
where
    F: Fn(usize) -> Candidates<'a>,
    R: Fn(usize, usize) -> Result<bool, JoinError>,
{
    let arena = Bump::new();
    let mut left_pos = BumpVec::<usize>::with_capacity_in(output_rows, &arena);
    let mut right_pos = BumpVec::<Option<usize>>::with_capacity_in(output_rows, &arena);

    for i in 0..left.rows() {
        let mut matched = false;
        for j in candidates_of(i).iter() {
            if residual_holds(i, j)? {
                matched = true;
                left_pos.push(i);
                right_pos.push(Some(j));
            }
        }
        if !matched && matches!(mode, JoinMode::Left) {
            left_pos.push(i);
            right_pos.push(None);
        }
    }

    emit_join(left, right, names, left_pos.as_slice(), right_pos.as_slice())
}

/// Materialize the selected output columns from matched pair positions.
/// Unmatched right positions become the missing sentinel and the column
/// dtype follows the usual null-promotion rules.
fn emit_join(
    left: &Table,
    right: &Table,
    names: &[String],
    left_pos: &[usize],
    right_pos: &[Option<usize>],
) -> Result<Table, JoinError> {
    let mut out = Table::empty();
    for name in names {
        if left.contains(name) {
            let gathered = left.column(name)?.materialize()?.gather(left_pos)?;
            out.set_column(name.clone(), ColumnInput::Array(gathered))?;
            continue;
        }
        let source = right.column(name)?.materialize()?;
        let values: Vec<Value> = right_pos
            .iter()
            .map(|pos| pos.and_then(|j| source.value(j)).unwrap_or(Value::Null))
            .collect();
        out.set_column(name.clone(), ColumnInput::Values(values))?;
    }
    Ok(out)
}

fn validate_predicates(
    left: &Table,
    right: &Table,
    predicates: &[Predicate],
) -> Result<(), JoinError> {
    for p in predicates {
        let left_dtype = left.dtype(&p.left).ok_or_else(|| JoinError::MissingColumn {
            name: p.left.clone(),
        })?;
        let right_dtype = right
            .dtype(&p.right)
            .ok_or_else(|| JoinError::MissingColumn {
                name: p.right.clone(),
            })?;
        if left_dtype != right_dtype {
            return Err(JoinError::DtypeMismatch {
                left: p.left.clone(),
                right: p.right.clone(),
                op: p.op.symbol(),
                left_dtype,
                right_dtype,
            });
        }
    }
    Ok(())
}

/// Resolve the output column list; the left side wins a name collision.
fn resolve_select(
    left: &Table,
    right: &Table,
    select: Option<&[&str]>,
    cross: bool,
) -> Result<Vec<String>, JoinError> {
    match select {
        None => {
            let mut names: Vec<String> = left.columns().to_vec();
            for name in right.columns() {
                if !left.contains(name) {
                    names.push(name.clone());
                }
            }
            Ok(names)
        }
        Some(requested) => {
            let mut names = Vec::with_capacity(requested.len());
            for &name in requested {
                if !left.contains(name) && !right.contains(name) {
                    if cross {
                        return Err(JoinError::UnknownSelect {
                            name: name.to_owned(),
                        });
                    }
                    return Err(JoinError::MissingColumn {
                        name: name.to_owned(),
                    });
                }
                names.push(name.to_owned());
            }
            Ok(names)
        }
    }
}

#[cfg(test)]
mod tests {
    use tr_table::{ColumnInput, Table};
    use tr_types::{DType, Value};

    use super::{
        cross_join, join, join_with_options, join_with_trace, JoinError, JoinExecutionOptions,
        JoinMode, Predicate,
    };

    fn left_table() -> Table {
        Table::new(vec![
            ("x", ColumnInput::from(vec![1_i64, 2, 3, 4, 5, 6])),
            ("y", vec!["one", "two", "one", "two", "one", "two"].into()),
            ("z", vec![0_i64, 0, 0, 1, 1, 1].into()),
        ])
        .expect("left")
    }

    fn right_table() -> Table {
        Table::new(vec![
            ("a", ColumnInput::from(vec![1_i64, 1, 2, 2, 3, 3])),
            ("b", vec!["one", "two", "one", "two", "one", "two"].into()),
            ("c", vec![0_i64, 0, 0, 1, 1, 1].into()),
        ])
        .expect("right")
    }

    #[test]
    fn cross_join_row_count_is_product() {
        let out = cross_join(&left_table(), &right_table(), None).expect("cross");
        assert_eq!(out.rows(), 36);
        assert_eq!(out.columns(), &["x", "y", "z", "a", "b", "c"]);
        // row i*right.rows + j pairs left row i with right row j
        assert_eq!(out.cell(0, "x").expect("cell"), Value::Int(1));
        assert_eq!(out.cell(5, "x").expect("cell"), Value::Int(1));
        assert_eq!(out.cell(5, "a").expect("cell"), Value::Int(3));
        assert_eq!(out.cell(6, "x").expect("cell"), Value::Int(2));
    }

    #[test]
    fn cross_join_select_subset_and_miss() {
        let out = cross_join(&left_table(), &right_table(), Some(&["x", "z", "a", "c"]))
            .expect("cross");
        assert_eq!(out.columns(), &["x", "z", "a", "c"]);

        let err = cross_join(&left_table(), &right_table(), Some(&["x", "nope"]))
            .expect_err("missing select");
        assert!(matches!(err, JoinError::UnknownSelect { ref name } if name == "nope"));
    }

    #[test]
    fn inner_equi_join_matches_pairs() {
        let out = join(
            &left_table(),
            &right_table(),
            &[Predicate::new("x", "a", "==").expect("pred")],
            &["x", "y", "a", "b"],
            JoinMode::Inner,
        )
        .expect("join");
        // x in {1,2,3} each matches two right rows; x in {4,5,6} match none
        assert_eq!(out.rows(), 6);
        assert_eq!(
            out.column("x").expect("x").values(),
            vec![
                Value::Int(1),
                Value::Int(1),
                Value::Int(2),
                Value::Int(2),
                Value::Int(3),
                Value::Int(3),
            ]
        );
    }

    #[test]
    fn left_join_keeps_unmatched_rows_with_null_sentinel() {
        let out = join(
            &left_table(),
            &right_table(),
            &[Predicate::new("x", "a", "==").expect("pred")],
            &["x", "a", "b"],
            JoinMode::Left,
        )
        .expect("join");
        assert_eq!(out.rows(), 9);
        assert!(out.rows() >= left_table().rows());

        // unmatched left rows carry missing right cells; the int column
        // becomes float NaN, the string column promotes to object null
        assert_eq!(out.dtype("a"), Some(DType::Float));
        assert_eq!(out.dtype("b"), Some(DType::Object));
        let last_b = out.cell(-1, "b").expect("cell");
        assert_eq!(last_b, Value::Null);
        assert!(out.cell(-1, "a").expect("cell").is_missing());
    }

    #[test]
    fn multi_predicate_and_semantics() {
        let right = Table::new(vec![
            ("a", ColumnInput::from(vec![1_i64, 1, 1, 2, 2, 2])),
            ("b", vec!["one", "two", "one", "two", "one", "two"].into()),
            ("c", vec![2_i64, 2, 2, 3, 3, 3].into()),
        ])
        .expect("right");
        let out = join(
            &left_table(),
            &right,
            &[
                Predicate::new("x", "a", "==").expect("pred"),
                Predicate::new("z", "c", "==").expect("pred"),
            ],
            &["x", "y", "a", "b"],
            JoinMode::Inner,
        )
        .expect("join");
        // z is only 0/1 while c is only 2/3: conjunction can never hold
        assert_eq!(out.rows(), 0);
    }

    #[test]
    fn inequality_predicates_scan_all_pairs() {
        let out = join(
            &left_table(),
            &right_table(),
            &[Predicate::new("x", "a", "<").expect("pred")],
            &["x", "a"],
            JoinMode::Inner,
        )
        .expect("join");
        // pairs with x < a: x=1 matches a in {2,2,3,3}; x=2 matches {3,3}
        assert_eq!(out.rows(), 6);
        let bound = left_table().rows() * right_table().rows();
        assert!(out.rows() <= bound);
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = Predicate::new("x", "a", "===").expect_err("operator");
        assert!(matches!(err, JoinError::UnknownOperator { ref op } if op == "==="));
    }

    #[test]
    fn dtype_mismatch_fails_before_scan() {
        let mut right = right_table();
        right
            .update_dtypes_inplace(&[("a", "float")])
            .expect("retag");
        let err = join(
            &left_table(),
            &right,
            &[Predicate::new("x", "a", "==").expect("pred")],
            &["x", "a"],
            JoinMode::Inner,
        )
        .expect_err("dtype mismatch");
        assert!(matches!(err, JoinError::DtypeMismatch { .. }));
    }

    #[test]
    fn predicate_and_select_misses_are_key_errors() {
        let err = join(
            &left_table(),
            &right_table(),
            &[Predicate::new("gone", "a", "==").expect("pred")],
            &["x"],
            JoinMode::Inner,
        )
        .expect_err("predicate column");
        assert!(matches!(err, JoinError::MissingColumn { ref name } if name == "gone"));

        let err = join(
            &left_table(),
            &right_table(),
            &[Predicate::new("x", "a", "==").expect("pred")],
            &["x", "gone"],
            JoinMode::Inner,
        )
        .expect_err("select column");
        assert!(matches!(err, JoinError::MissingColumn { ref name } if name == "gone"));
    }

    #[test]
    fn arena_join_matches_global_allocator_behavior() {
        let predicates = [Predicate::new("x", "a", "<=").expect("pred")];
        let select = ["x", "y", "a", "b"];

        let arena = join_with_options(
            &left_table(),
            &right_table(),
            &predicates,
            &select,
            JoinMode::Left,
            JoinExecutionOptions::default(),
        )
        .expect("arena join");

        let global = join_with_options(
            &left_table(),
            &right_table(),
            &predicates,
            &select,
            JoinMode::Left,
            JoinExecutionOptions {
                use_arena: false,
                arena_budget_bytes: 0,
            },
        )
        .expect("global join");

        assert_eq!(arena.rows(), global.rows());
        for name in ["x", "y", "a", "b"] {
            assert_eq!(
                arena.column(name).expect("col").values(),
                global.column(name).expect("col").values()
            );
        }
    }

    #[test]
    fn arena_join_falls_back_when_budget_is_too_small() {
        let options = JoinExecutionOptions {
            use_arena: true,
            arena_budget_bytes: 1,
        };
        let (out, trace) = join_with_trace(
            &left_table(),
            &right_table(),
            &[Predicate::new("x", "a", "==").expect("pred")],
            &["x", "a"],
            JoinMode::Inner,
            options,
        )
        .expect("fallback join");
        assert_eq!(out.rows(), 6);
        assert!(!trace.used_arena);
        assert!(trace.estimated_bytes > options.arena_budget_bytes);
    }
}
