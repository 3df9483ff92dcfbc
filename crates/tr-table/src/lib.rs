#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use thiserror::Error;
use tr_columnar::{Array, ColumnError, RowMask};
use tr_types::{record_cast, registry, DType, TypeError, Value};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndexError {
    #[error("boolean mask length {mask} does not match row count {rows}")]
    MaskLength { mask: usize, rows: usize },
    #[error("row {position} out of bounds for {rows} rows")]
    RowOutOfBounds { position: i64, rows: usize },
    #[error("slice step must be non-zero")]
    ZeroStep,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TableError {
    #[error("columns must share one row count: `{column}` has {actual} rows, expected {expected}")]
    RowCount {
        column: String,
        expected: usize,
        actual: usize,
    },
    #[error("column `{column}` input must squeeze to one dimension")]
    Shape { column: String },
    #[error("column `{name}` does not exist")]
    MissingColumn { name: String },
    #[error("union dtype mismatch for `{column}`: {left} vs {right}")]
    UnionDtype {
        column: String,
        left: DType,
        right: DType,
    },
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

// ── Column slots ───────────────────────────────────────────────────────

/// Shared column storage plus an optional picked row set.
///
/// This is the unit of the aliasing contract: a row-gather sub-table
/// clones the slot and composes a pick, so element writes on either side
/// land in the same backing array. Replacing a column rebinds a fresh
/// slot and detaches only that column.
#[derive(Debug, Clone)]
struct Slot {
    storage: Rc<RefCell<Array>>,
    pick: Option<Rc<[usize]>>,
}

impl Slot {
    fn detached(array: Array) -> Self {
        Self {
            storage: Rc::new(RefCell::new(array)),
            pick: None,
        }
    }

    fn len(&self) -> usize {
        match &self.pick {
            Some(pick) => pick.len(),
            None => self.storage.borrow().len(),
        }
    }

    fn dtype(&self) -> DType {
        self.storage.borrow().dtype()
    }

    fn map_row(&self, row: usize) -> Option<usize> {
        match &self.pick {
            Some(pick) => pick.get(row).copied(),
            None => (row < self.storage.borrow().len()).then_some(row),
        }
    }

    fn value(&self, row: usize) -> Option<Value> {
        let mapped = self.map_row(row)?;
        self.storage.borrow().value(mapped)
    }

    fn set_value(&self, row: usize, value: &Value) -> Result<(), TableError> {
        let mapped = self.map_row(row).ok_or(IndexError::RowOutOfBounds {
            position: row as i64,
            rows: self.len(),
        })?;
        self.storage.borrow_mut().set_value(mapped, value)?;
        Ok(())
    }

    fn materialize(&self) -> Result<Array, TableError> {
        let storage = self.storage.borrow();
        match &self.pick {
            Some(pick) => Ok(storage.gather(pick)?),
            None => Ok(storage.clone()),
        }
    }

    /// Re-gather this slot: `rows` are positions in view coordinates.
    fn gathered(&self, rows: &[usize]) -> Result<Self, TableError> {
        let len = self.len();
        let mut mapped = Vec::with_capacity(rows.len());
        for &row in rows {
            mapped.push(self.map_row(row).ok_or(IndexError::RowOutOfBounds {
                position: row as i64,
                rows: len,
            })?);
        }
        Ok(Self {
            storage: Rc::clone(&self.storage),
            pick: Some(Rc::from(mapped)),
        })
    }
}

/// A live handle onto one column. Shares storage with the owning table:
/// element writes through the handle are visible to the owner and to
/// every aliasing sub-table.
#[derive(Debug, Clone)]
pub struct ColumnRef {
    slot: Slot,
}

impl ColumnRef {
    #[must_use]
    pub fn len(&self) -> usize {
        self.slot.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.slot.dtype()
    }

    #[must_use]
    pub fn value(&self, row: usize) -> Option<Value> {
        self.slot.value(row)
    }

    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        (0..self.len()).filter_map(|row| self.slot.value(row)).collect()
    }

    pub fn materialize(&self) -> Result<Array, TableError> {
        self.slot.materialize()
    }

    /// Elementwise semantic equality against one scalar.
    pub fn eq_value(&self, value: &Value) -> Result<RowMask, TableError> {
        Ok(self.materialize()?.eq_value(value))
    }

    pub fn set(&self, row: usize, value: &Value) -> Result<(), TableError> {
        self.slot.set_value(row, value)
    }

    /// Write `values[i]` at view position `positions[i]`.
    pub fn scatter(&self, positions: &[usize], values: &Array) -> Result<(), TableError> {
        if positions.len() != values.len() {
            return Err(TableError::RowCount {
                column: "<scatter>".to_owned(),
                expected: positions.len(),
                actual: values.len(),
            });
        }
        for (slot_idx, &row) in positions.iter().enumerate() {
            if let Some(value) = values.value(slot_idx) {
                self.slot.set_value(row, &value)?;
            }
        }
        Ok(())
    }

    /// Broadcast one scalar over a set of view positions.
    pub fn fill(&self, positions: &[usize], value: &Value) -> Result<(), TableError> {
        for &row in positions {
            self.slot.set_value(row, value)?;
        }
        Ok(())
    }

    pub fn fill_mask(&self, mask: &RowMask, value: &Value) -> Result<(), TableError> {
        if mask.len() != self.len() {
            return Err(IndexError::MaskLength {
                mask: mask.len(),
                rows: self.len(),
            }
            .into());
        }
        self.fill(&mask.ones(), value)
    }
}

// ── Construction inputs ────────────────────────────────────────────────

/// Array-like construction-boundary value for one column.
#[derive(Debug, Clone)]
pub enum ColumnInput {
    Array(Array),
    Values(Vec<Value>),
    Scalar(Value),
    Nested(Vec<Vec<Value>>),
}

impl ColumnInput {
    /// Normalize to a 1-D array. Scalars broadcast to `hint` rows (or a
    /// length-1 array when no row count exists yet); nested inputs are
    /// squeezed when unambiguous.
    fn normalize(self, column: &str, hint: Option<usize>) -> Result<Array, TableError> {
        match self {
            Self::Array(array) => Ok(array),
            Self::Values(values) => Ok(Array::from_values(values)?),
            Self::Scalar(value) => {
                let rows = hint.unwrap_or(1);
                Ok(Array::from_values(vec![value; rows])?)
            }
            Self::Nested(rows) => {
                if rows.len() == 1 {
                    let inner = rows.into_iter().next().unwrap_or_default();
                    return Ok(Array::from_values(inner)?);
                }
                if rows.iter().all(|inner| inner.len() == 1) {
                    let flat: Vec<Value> =
                        rows.into_iter().filter_map(|inner| inner.into_iter().next()).collect();
                    return Ok(Array::from_values(flat)?);
                }
                Err(TableError::Shape {
                    column: column.to_owned(),
                })
            }
        }
    }
}

impl From<Array> for ColumnInput {
    fn from(array: Array) -> Self {
        Self::Array(array)
    }
}

impl From<Vec<i64>> for ColumnInput {
    fn from(values: Vec<i64>) -> Self {
        Self::Array(Array::Int(values))
    }
}

impl From<Vec<f64>> for ColumnInput {
    fn from(values: Vec<f64>) -> Self {
        Self::Array(Array::Float(values))
    }
}

impl From<Vec<bool>> for ColumnInput {
    fn from(values: Vec<bool>) -> Self {
        Self::Array(Array::Bool(values))
    }
}

impl From<Vec<&str>> for ColumnInput {
    fn from(values: Vec<&str>) -> Self {
        Self::Array(Array::Str(values.into_iter().map(str::to_owned).collect()))
    }
}

impl From<Vec<String>> for ColumnInput {
    fn from(values: Vec<String>) -> Self {
        Self::Array(Array::Str(values))
    }
}

impl From<Vec<Value>> for ColumnInput {
    fn from(values: Vec<Value>) -> Self {
        Self::Values(values)
    }
}

impl From<Value> for ColumnInput {
    fn from(value: Value) -> Self {
        Self::Scalar(value)
    }
}

// ── Indexer ────────────────────────────────────────────────────────────

/// Python-slice bounds: negative indices count from the end, out-of-range
/// bounds clamp, step may be negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceRange {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl SliceRange {
    #[must_use]
    pub fn new(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Self {
        Self { start, stop, step }
    }

    /// Resolve to concrete row positions for a column of length `len`.
    pub fn resolve(&self, len: usize) -> Result<Vec<usize>, IndexError> {
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(IndexError::ZeroStep);
        }
        let n = len as i64;

        let (start, stop) = if step > 0 {
            let norm = |v: i64| {
                let v = if v < 0 { v + n } else { v };
                v.clamp(0, n)
            };
            (
                self.start.map_or(0, norm),
                self.stop.map_or(n, norm),
            )
        } else {
            let norm = |v: i64| {
                let v = if v < 0 { v + n } else { v };
                v.clamp(-1, n - 1)
            };
            (
                self.start.map_or(n - 1, norm),
                self.stop.map_or(-1, norm),
            )
        };

        let mut out = Vec::new();
        let mut idx = start;
        while (step > 0 && idx < stop) || (step < 0 && idx > stop) {
            out.push(idx as usize);
            idx += step;
        }
        Ok(out)
    }
}

/// The six index-expression shapes.
#[derive(Debug, Clone)]
pub enum Selector {
    /// One column by name: a live shared handle.
    Column(String),
    /// An ordered column subset: a new table sharing storage.
    Columns(Vec<String>),
    /// One row (negative counts from the end): a single-row table.
    Row(i64),
    /// A row gather: a new table aliasing parent storage.
    Rows(Vec<i64>),
    /// A boolean row mask, length must equal the row count; aliases.
    Mask(Vec<bool>),
    /// A Python-style slice: a detached copy.
    Range(SliceRange),
    /// One cell: a scalar.
    Cell(i64, String),
}

/// What a selector resolves to.
#[derive(Debug)]
pub enum Selected {
    Column(ColumnRef),
    Table(Table),
    Scalar(Value),
}

// ── Table ──────────────────────────────────────────────────────────────

/// The columnar table: parallel name → array and name → dtype mappings
/// with equal row counts across all columns and explicit insertion order.
#[derive(Debug, Clone)]
pub struct Table {
    slots: BTreeMap<String, Slot>,
    dtypes: BTreeMap<String, DType>,
    column_order: Vec<String>,
    rows: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::empty()
    }
}

impl Table {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            slots: BTreeMap::new(),
            dtypes: BTreeMap::new(),
            column_order: Vec::new(),
            rows: 0,
        }
    }

    /// Construct from name → array-like entries, in order. Coerced arrays
    /// must agree in length once more than one column exists.
    pub fn new<N, I>(columns: Vec<(N, I)>) -> Result<Self, TableError>
    where
        N: Into<String>,
        I: Into<ColumnInput>,
    {
        let mut table = Self::empty();
        for (name, input) in columns {
            table.set_column(name.into(), input.into())?;
        }
        Ok(table)
    }

    /// Construct with caller-supplied dtype overrides: tags are validated
    /// against the canonical kinds and the columns coerced through the
    /// registry.
    pub fn with_dtypes<N, I>(
        columns: Vec<(N, I)>,
        dtypes: &[(&str, &str)],
    ) -> Result<Self, TableError>
    where
        N: Into<String>,
        I: Into<ColumnInput>,
    {
        let mut table = Self::new(columns)?;
        table.update_dtypes_inplace(dtypes)?;
        Ok(table)
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Column names in insertion order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.column_order
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    #[must_use]
    pub fn dtype(&self, name: &str) -> Option<DType> {
        self.dtypes.get(name).copied()
    }

    /// (name, dtype) pairs in insertion order.
    #[must_use]
    pub fn dtypes(&self) -> Vec<(String, DType)> {
        self.column_order
            .iter()
            .filter_map(|name| self.dtypes.get(name).map(|dt| (name.clone(), *dt)))
            .collect()
    }

    fn slot(&self, name: &str) -> Result<&Slot, TableError> {
        self.slots.get(name).ok_or_else(|| TableError::MissingColumn {
            name: name.to_owned(),
        })
    }

    /// A live shared handle onto one column.
    pub fn column(&self, name: &str) -> Result<ColumnRef, TableError> {
        Ok(ColumnRef {
            slot: self.slot(name)?.clone(),
        })
    }

    /// Canonical name → array mapping, materialized in table order.
    pub fn data(&self) -> Result<Vec<(String, Array)>, TableError> {
        self.column_order
            .iter()
            .map(|name| Ok((name.clone(), self.slot(name)?.materialize()?)))
            .collect()
    }

    /// The requested columns (default all, table order) as shared
    /// handles; no element copies.
    pub fn to_list(&self, columns: Option<&[&str]>) -> Result<Vec<ColumnRef>, TableError> {
        match columns {
            None => self.column_order.iter().map(|name| self.column(name)).collect(),
            Some(names) => names.iter().map(|name| self.column(name)).collect(),
        }
    }

    /// Lazy, restartable row-tuple iterator; each call yields a fresh
    /// iterator from row zero. Unknown requested columns fail up front.
    pub fn to_records(
        &self,
        columns: Option<&[&str]>,
        cast_null: bool,
    ) -> Result<Records, TableError> {
        let names: Vec<String> = match columns {
            None => self.column_order.clone(),
            Some(names) => names.iter().map(|&n| n.to_owned()).collect(),
        };
        let mut cells = Vec::with_capacity(names.len());
        for name in &names {
            let slot = self.slot(name)?.clone();
            let dtype = self.dtypes[name];
            cells.push((slot, dtype));
        }
        Ok(Records {
            cells,
            rows: self.rows,
            cursor: 0,
            cast_null,
        })
    }

    /// One scalar cell; the row may be negative (from the end).
    pub fn cell(&self, row: i64, name: &str) -> Result<Value, TableError> {
        let position = self.normalize_row(row)?;
        let slot = self.slot(name)?;
        slot.value(position).ok_or_else(|| {
            IndexError::RowOutOfBounds {
                position: row,
                rows: self.rows,
            }
            .into()
        })
    }

    // ── Mutation ───────────────────────────────────────────────────────

    /// Replace or append a column. The value is coerced as in
    /// construction, must match the current row count unless the table is
    /// empty, and rebinds fresh storage (detaching any aliases of the old
    /// column). The dtype tag is re-derived.
    pub fn set_column(
        &mut self,
        name: impl Into<String>,
        input: impl Into<ColumnInput>,
    ) -> Result<(), TableError> {
        let name = name.into();
        let hint = (!self.slots.is_empty()).then_some(self.rows);
        let array = input.into().normalize(&name, hint)?;
        if self.slots.is_empty() {
            self.rows = array.len();
        } else if array.len() != self.rows {
            return Err(TableError::RowCount {
                column: name,
                expected: self.rows,
                actual: array.len(),
            });
        }
        self.dtypes.insert(name.clone(), array.dtype());
        if self.slots.insert(name.clone(), Slot::detached(array)).is_none() {
            self.column_order.push(name);
        }
        Ok(())
    }

    /// Element-level write; visible through every alias of the column.
    pub fn set_value(&self, name: &str, row: usize, value: &Value) -> Result<(), TableError> {
        self.slot(name)?.set_value(row, value)
    }

    /// Remove a column and its tag. Returns whether the column existed.
    pub fn delete_column(&mut self, name: &str) -> bool {
        let existed = self.slots.remove(name).is_some();
        self.dtypes.remove(name);
        self.column_order.retain(|c| c != name);
        if self.slots.is_empty() {
            self.rows = 0;
        }
        existed
    }

    /// Deep copy: shares no storage with the original.
    pub fn copy(&self) -> Result<Self, TableError> {
        let mut slots = BTreeMap::new();
        for (name, slot) in &self.slots {
            slots.insert(name.clone(), Slot::detached(slot.materialize()?));
        }
        Ok(Self {
            slots,
            dtypes: self.dtypes.clone(),
            column_order: self.column_order.clone(),
            rows: self.rows,
        })
    }

    /// Rename columns, preserving order and tags. Validates every source
    /// name before touching anything.
    pub fn rename_inplace(&mut self, renames: &[(&str, &str)]) -> Result<(), TableError> {
        for &(old, _) in renames {
            self.slot(old)?;
        }
        for &(old, new) in renames {
            if old == new {
                continue;
            }
            let slot = match self.slots.remove(old) {
                Some(slot) => slot,
                None => continue, // renamed away by an earlier pair
            };
            let dtype = self.dtypes.remove(old).unwrap_or(DType::Object);
            if self.slots.insert(new.to_owned(), slot).is_some() {
                // the target name already existed; its entry is replaced
                self.column_order.retain(|c| c.as_str() != new);
            }
            self.dtypes.insert(new.to_owned(), dtype);
            for c in &mut self.column_order {
                if c.as_str() == old {
                    *c = new.to_owned();
                }
            }
        }
        Ok(())
    }

    /// Renamed view sharing storage with `self`.
    pub fn rename(&self, renames: &[(&str, &str)]) -> Result<Self, TableError> {
        let mut out = self.clone();
        out.rename_inplace(renames)?;
        Ok(out)
    }

    /// Coerce named columns to new tags through the registry. All tags and
    /// names validate before any column is overwritten; columns already
    /// carrying the desired tag are left alone.
    pub fn update_dtypes_inplace(&mut self, specs: &[(&str, &str)]) -> Result<(), TableError> {
        let mut plan = Vec::with_capacity(specs.len());
        for &(name, tag) in specs {
            let target = DType::parse(tag)?;
            let cast = registry::lookup(target.name())?;
            self.slot(name)?;
            plan.push((name.to_owned(), target, cast));
        }
        let mut coerced = Vec::with_capacity(plan.len());
        for (name, target, cast) in plan {
            if self.dtypes[&name] == target {
                continue;
            }
            let current = self.slot(&name)?.materialize()?;
            coerced.push((name, current.cast_with(cast, target)?));
        }
        // every cast succeeded; only now touch the table
        for (name, array) in coerced {
            self.dtypes.insert(name.clone(), array.dtype());
            self.slots.insert(name, Slot::detached(array));
        }
        Ok(())
    }

    /// Coercing copy; the original is untouched.
    pub fn update_dtypes(&self, specs: &[(&str, &str)]) -> Result<Self, TableError> {
        let mut out = self.copy()?;
        out.update_dtypes_inplace(specs)?;
        Ok(out)
    }

    fn validate_union(&self, other: &Self) -> Result<(), TableError> {
        for name in &self.column_order {
            let left = self.dtypes[name];
            let right = other
                .dtype(name)
                .ok_or_else(|| TableError::MissingColumn { name: name.clone() })?;
            if left != right {
                return Err(TableError::UnionDtype {
                    column: name.clone(),
                    left,
                    right,
                });
            }
        }
        if let Some(extra) = other.column_order.iter().find(|n| !self.contains(n)) {
            return Err(TableError::MissingColumn {
                name: extra.clone(),
            });
        }
        Ok(())
    }

    /// Append the rows of a compatible table: identical column-name sets
    /// and identical per-column tags required; row counts need not match.
    pub fn union(&self, other: &Self) -> Result<Self, TableError> {
        self.validate_union(other)?;
        let mut out = Self::empty();
        for name in &self.column_order {
            let joined = self
                .slot(name)?
                .materialize()?
                .concat(&other.slot(name)?.materialize()?)?;
            out.set_column(name.clone(), ColumnInput::Array(joined))?;
        }
        Ok(out)
    }

    /// Merge another table's columns into this one: same-named columns are
    /// replaced (tag re-derived), new names are appended in `other`'s
    /// order. Row counts must match unless this table is empty.
    pub fn update_inplace(&mut self, other: &Self) -> Result<(), TableError> {
        if !self.slots.is_empty() && !other.slots.is_empty() && other.rows != self.rows {
            return Err(TableError::RowCount {
                column: other.column_order[0].clone(),
                expected: self.rows,
                actual: other.rows,
            });
        }
        for name in &other.column_order {
            let array = other.slot(name)?.materialize()?;
            self.set_column(name.clone(), ColumnInput::Array(array))?;
        }
        Ok(())
    }

    /// Merging copy; untouched columns still share storage with `self`.
    pub fn update(&self, other: &Self) -> Result<Self, TableError> {
        let mut out = self.clone();
        out.update_inplace(other)?;
        Ok(out)
    }

    pub fn union_inplace(&mut self, other: &Self) -> Result<(), TableError> {
        self.validate_union(other)?;
        let mut joined = Vec::with_capacity(self.column_order.len());
        for name in &self.column_order {
            joined.push((
                name.clone(),
                self.slot(name)?
                    .materialize()?
                    .concat(&other.slot(name)?.materialize()?)?,
            ));
        }
        self.rows += other.rows;
        for (name, array) in joined {
            self.slots.insert(name, Slot::detached(array));
        }
        Ok(())
    }

    // ── Indexing ───────────────────────────────────────────────────────

    fn normalize_row(&self, position: i64) -> Result<usize, TableError> {
        let n = self.rows as i64;
        let mapped = if position < 0 { position + n } else { position };
        if mapped < 0 || mapped >= n {
            return Err(IndexError::RowOutOfBounds {
                position,
                rows: self.rows,
            }
            .into());
        }
        Ok(mapped as usize)
    }

    fn gathered(&self, positions: &[usize]) -> Result<Self, TableError> {
        let mut slots = BTreeMap::new();
        for (name, slot) in &self.slots {
            slots.insert(name.clone(), slot.gathered(positions)?);
        }
        Ok(Self {
            slots,
            dtypes: self.dtypes.clone(),
            column_order: self.column_order.clone(),
            rows: positions.len(),
        })
    }

    /// Row gather by (possibly negative) positions. The result **aliases**
    /// parent storage: element writes go through to `self`.
    pub fn take_rows(&self, positions: &[i64]) -> Result<Self, TableError> {
        let resolved = positions
            .iter()
            .map(|&p| self.normalize_row(p))
            .collect::<Result<Vec<_>, _>>()?;
        self.gathered(&resolved)
    }

    /// Single-row table (aliasing, like `take_rows`).
    pub fn row(&self, position: i64) -> Result<Self, TableError> {
        let resolved = self.normalize_row(position)?;
        self.gathered(&[resolved])
    }

    /// Boolean-mask row subset; the mask length must equal the row count.
    /// Aliases parent storage.
    pub fn filter_mask(&self, mask: &RowMask) -> Result<Self, TableError> {
        if mask.len() != self.rows {
            return Err(IndexError::MaskLength {
                mask: mask.len(),
                rows: self.rows,
            }
            .into());
        }
        self.gathered(&mask.ones())
    }

    pub fn filter(&self, mask: &[bool]) -> Result<Self, TableError> {
        self.filter_mask(&RowMask::from_bools(mask))
    }

    /// Python-slice row subset. Unlike the gather forms this produces a
    /// **detached copy**.
    pub fn slice(&self, range: SliceRange) -> Result<Self, TableError> {
        let positions = range.resolve(self.rows)?;
        let mut out = Self::empty();
        for name in &self.column_order {
            let slot = self.slot(name)?;
            let view = slot.gathered(&positions)?;
            out.set_column(name.clone(), ColumnInput::Array(view.materialize()?))?;
        }
        Ok(out)
    }

    /// Ordered column subset; storage is shared with `self`.
    pub fn select_columns(&self, names: &[&str]) -> Result<Self, TableError> {
        let mut slots = BTreeMap::new();
        let mut dtypes = BTreeMap::new();
        let mut order = Vec::with_capacity(names.len());
        for &name in names {
            let slot = self.slot(name)?.clone();
            dtypes.insert(name.to_owned(), self.dtypes[name]);
            slots.insert(name.to_owned(), slot);
            order.push(name.to_owned());
        }
        Ok(Self {
            slots,
            dtypes,
            column_order: order,
            rows: if names.is_empty() { 0 } else { self.rows },
        })
    }

    /// Resolve one of the six index-expression shapes.
    pub fn select(&self, selector: &Selector) -> Result<Selected, TableError> {
        match selector {
            Selector::Column(name) => Ok(Selected::Column(self.column(name)?)),
            Selector::Columns(names) => {
                let borrowed: Vec<&str> = names.iter().map(String::as_str).collect();
                Ok(Selected::Table(self.select_columns(&borrowed)?))
            }
            Selector::Row(position) => Ok(Selected::Table(self.row(*position)?)),
            Selector::Rows(positions) => Ok(Selected::Table(self.take_rows(positions)?)),
            Selector::Mask(bits) => Ok(Selected::Table(self.filter(bits)?)),
            Selector::Range(range) => Ok(Selected::Table(self.slice(*range)?)),
            Selector::Cell(row, name) => Ok(Selected::Scalar(self.cell(*row, name)?)),
        }
    }
}

/// Lazy row-tuple iterator produced by [`Table::to_records`].
#[derive(Debug)]
pub struct Records {
    cells: Vec<(Slot, DType)>,
    rows: usize,
    cursor: usize,
    cast_null: bool,
}

impl Iterator for Records {
    type Item = Result<Vec<Value>, TableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.rows {
            return None;
        }
        let row = self.cursor;
        self.cursor += 1;
        let mut out = Vec::with_capacity(self.cells.len());
        for (slot, dtype) in &self.cells {
            let value = match slot.value(row) {
                Some(value) => value,
                None => {
                    return Some(Err(IndexError::RowOutOfBounds {
                        position: row as i64,
                        rows: self.rows,
                    }
                    .into()))
                }
            };
            match record_cast(&value, *dtype, self.cast_null) {
                Ok(cast) => out.push(cast),
                Err(err) => return Some(Err(err.into())),
            }
        }
        Some(Ok(out))
    }
}
