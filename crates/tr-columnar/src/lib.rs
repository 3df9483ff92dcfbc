#![forbid(unsafe_code)]

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tr_types::{cast_value, CastFn, DType, TypeError, Value};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColumnError {
    #[error("index {index} out of bounds for array of length {len}")]
    OutOfBounds { index: usize, len: usize },
    #[error("cannot concatenate {left} array with {right} array")]
    ConcatDtype { left: DType, right: DType },
    #[error("dtype {dtype} cannot store a missing value")]
    MissingUnsupported { dtype: DType },
    #[error(transparent)]
    Type(#[from] TypeError),
}

// ── RowMask ────────────────────────────────────────────────────────────

/// Packed row-selection bitmask.
#[derive(Debug, Clone, Eq)]
pub struct RowMask {
    words: Vec<u64>,
    len: usize,
}

impl RowMask {
    #[must_use]
    pub fn from_bools(bits: &[bool]) -> Self {
        let len = bits.len();
        let mut words = vec![0_u64; len.div_ceil(64)];
        for (idx, &set) in bits.iter().enumerate() {
            if set {
                words[idx / 64] |= 1_u64 << (idx % 64);
            }
        }
        Self { words, len }
    }

    #[must_use]
    pub fn all_set(len: usize) -> Self {
        let mut words = vec![u64::MAX; len.div_ceil(64)];
        let remainder = len % 64;
        if remainder > 0 && !words.is_empty() {
            let last = words.len() - 1;
            words[last] = (1_u64 << remainder) - 1;
        }
        Self { words, len }
    }

    #[must_use]
    pub fn none_set(len: usize) -> Self {
        Self {
            words: vec![0_u64; len.div_ceil(64)],
            len,
        }
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        (self.words[idx / 64] >> (idx % 64)) & 1 == 1
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        if idx >= self.len {
            return;
        }
        if value {
            self.words[idx / 64] |= 1_u64 << (idx % 64);
        } else {
            self.words[idx / 64] &= !(1_u64 << (idx % 64));
        }
    }

    #[must_use]
    pub fn count_set(&self) -> usize {
        let full_words = self.len / 64;
        let mut count: u32 = self.words[..full_words]
            .iter()
            .map(|w| w.count_ones())
            .sum();
        let remainder = self.len % 64;
        if remainder > 0 && full_words < self.words.len() {
            let mask = (1_u64 << remainder) - 1;
            count += (self.words[full_words] & mask).count_ones();
        }
        count as usize
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn and_mask(&self, other: &Self) -> Self {
        let len = self.len.min(other.len);
        let word_count = len.div_ceil(64);
        let words = self.words[..word_count]
            .iter()
            .zip(&other.words[..word_count])
            .map(|(a, b)| a & b)
            .collect();
        Self { words, len }
    }

    #[must_use]
    pub fn or_mask(&self, other: &Self) -> Self {
        let len = self.len.min(other.len);
        let word_count = len.div_ceil(64);
        let words = self.words[..word_count]
            .iter()
            .zip(&other.words[..word_count])
            .map(|(a, b)| a | b)
            .collect();
        Self { words, len }
    }

    #[must_use]
    pub fn not_mask(&self) -> Self {
        let mut words: Vec<u64> = self.words.iter().map(|w| !w).collect();
        let remainder = self.len % 64;
        if remainder > 0 && !words.is_empty() {
            let last = words.len() - 1;
            words[last] &= (1_u64 << remainder) - 1;
        }
        Self {
            words,
            len: self.len,
        }
    }

    /// Set positions in ascending order.
    #[must_use]
    pub fn ones(&self) -> Vec<usize> {
        (0..self.len).filter(|&idx| self.get(idx)).collect()
    }

    pub fn bits(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(|idx| self.get(idx))
    }
}

impl PartialEq for RowMask {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.bits().eq(other.bits())
    }
}

impl Serialize for RowMask {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let bits: Vec<bool> = self.bits().collect();
        let mut state = serializer.serialize_struct("RowMask", 1)?;
        state.serialize_field("bits", &bits)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for RowMask {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            bits: Vec<bool>,
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(Self::from_bools(&raw.bits))
    }
}

// ── Array ──────────────────────────────────────────────────────────────

/// A single contiguous, homogeneously-typed, one-dimensional column.
///
/// Typed storage keeps arithmetic and gathers on plain slices; `Object`
/// is the catch-all for heterogeneous or null-bearing non-float data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "data", rename_all = "snake_case")]
pub enum Array {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Bool(Vec<bool>),
    Str(Vec<String>),
    Date(Vec<NaiveDate>),
    Object(Vec<Value>),
}

impl Array {
    #[must_use]
    pub fn empty(dtype: DType) -> Self {
        match dtype {
            DType::Int => Self::Int(Vec::new()),
            DType::Float => Self::Float(Vec::new()),
            DType::Bool => Self::Bool(Vec::new()),
            DType::Str => Self::Str(Vec::new()),
            DType::Date => Self::Date(Vec::new()),
            DType::Object => Self::Object(Vec::new()),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Int(_) => DType::Int,
            Self::Float(_) => DType::Float,
            Self::Bool(_) => DType::Bool,
            Self::Str(_) => DType::Str,
            Self::Date(_) => DType::Date,
            Self::Object(_) => DType::Object,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int(d) => d.len(),
            Self::Float(d) => d.len(),
            Self::Bool(d) => d.len(),
            Self::Str(d) => d.len(),
            Self::Date(d) => d.len(),
            Self::Object(d) => d.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<Value> {
        match self {
            Self::Int(d) => d.get(idx).map(|v| Value::Int(*v)),
            Self::Float(d) => d.get(idx).map(|v| Value::Float(*v)),
            Self::Bool(d) => d.get(idx).map(|v| Value::Bool(*v)),
            Self::Str(d) => d.get(idx).map(|v| Value::Str(v.clone())),
            Self::Date(d) => d.get(idx).map(|v| Value::Date(*v)),
            Self::Object(d) => d.get(idx).cloned(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        (0..self.len()).filter_map(move |idx| self.value(idx))
    }

    /// Materialize every element.
    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        self.iter().collect()
    }

    /// Write one element, coercing to this array's dtype.
    pub fn set_value(&mut self, idx: usize, value: &Value) -> Result<(), ColumnError> {
        let len = self.len();
        if idx >= len {
            return Err(ColumnError::OutOfBounds { index: idx, len });
        }
        let coerced = cast_value(value, self.dtype())?;
        match (self, coerced) {
            (Self::Int(d), Value::Int(v)) => d[idx] = v,
            (Self::Float(d), Value::Float(v)) => d[idx] = v,
            (Self::Bool(d), Value::Bool(v)) => d[idx] = v,
            (Self::Str(d), Value::Str(v)) => d[idx] = v,
            (Self::Date(d), Value::Date(v)) => d[idx] = v,
            (Self::Object(d), v) => d[idx] = v,
            (arr, Value::Null) => {
                return Err(ColumnError::MissingUnsupported { dtype: arr.dtype() })
            }
            // cast_value returned the requested dtype or a missing marker,
            // both handled above.
            _ => unreachable!("cast_value returned mismatched kind"),
        }
        Ok(())
    }

    /// Build an array from scalar values, inferring the narrowest dtype.
    ///
    /// Numeric kinds widen (`bool` < `int` < `float`); nulls keep an
    /// all-numeric column as `float` (NaN markers) and force everything
    /// else into `object` so the null survives.
    pub fn from_values(values: Vec<Value>) -> Result<Self, ColumnError> {
        // bool < int < float for widening purposes; None = non-numeric.
        fn numeric_rank(kind: DType) -> Option<u8> {
            match kind {
                DType::Bool => Some(0),
                DType::Int => Some(1),
                DType::Float => Some(2),
                _ => None,
            }
        }
        fn widen(seen: DType, kind: DType) -> Option<DType> {
            if seen == kind {
                return Some(seen);
            }
            let (a, b) = (numeric_rank(seen)?, numeric_rank(kind)?);
            Some(if a >= b { seen } else { kind })
        }

        let mut has_null = false;
        let mut inferred: Option<DType> = None;
        let mut homogeneous = true;
        for value in &values {
            match value.dtype() {
                None => has_null = true,
                Some(kind) => match inferred {
                    None => inferred = Some(kind),
                    Some(seen) => match widen(seen, kind) {
                        Some(wide) => inferred = Some(wide),
                        None => homogeneous = false,
                    },
                },
            }
        }

        let target = match (homogeneous, has_null, inferred) {
            (false, _, _) | (true, _, None) => DType::Object,
            (true, true, Some(k)) => {
                if numeric_rank(k).is_some() {
                    DType::Float
                } else {
                    DType::Object
                }
            }
            (true, false, Some(k)) => k,
        };

        Self::from_values_as(values, target)
    }

    /// Build an array of a known dtype from scalar values, coercing each.
    pub fn from_values_as(values: Vec<Value>, dtype: DType) -> Result<Self, ColumnError> {
        match dtype {
            DType::Int => values
                .iter()
                .map(|v| match cast_value(v, DType::Int)? {
                    Value::Int(x) => Ok(x),
                    _ => Err(TypeError::InvalidCast {
                        from: v.kind_name(),
                        to: DType::Int,
                    }),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Int)
                .map_err(ColumnError::from),
            DType::Float => values
                .iter()
                .map(|v| match cast_value(v, DType::Float)? {
                    Value::Float(x) => Ok(x),
                    _ => Err(TypeError::InvalidCast {
                        from: v.kind_name(),
                        to: DType::Float,
                    }),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Float)
                .map_err(ColumnError::from),
            DType::Bool => values
                .iter()
                .map(|v| match cast_value(v, DType::Bool)? {
                    Value::Bool(x) => Ok(x),
                    _ => Err(TypeError::InvalidCast {
                        from: v.kind_name(),
                        to: DType::Bool,
                    }),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Bool)
                .map_err(ColumnError::from),
            DType::Str => values
                .iter()
                .map(|v| match cast_value(v, DType::Str)? {
                    Value::Str(x) => Ok(x),
                    _ => Err(TypeError::InvalidCast {
                        from: v.kind_name(),
                        to: DType::Str,
                    }),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Str)
                .map_err(ColumnError::from),
            DType::Date => values
                .iter()
                .map(|v| match cast_value(v, DType::Date)? {
                    Value::Date(x) => Ok(x),
                    _ => Err(TypeError::InvalidCast {
                        from: v.kind_name(),
                        to: DType::Date,
                    }),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Date)
                .map_err(ColumnError::from),
            DType::Object => Ok(Self::Object(values)),
        }
    }

    /// Gather rows by position. Positions may repeat and appear in any
    /// order; an out-of-range position is an error, never a skip.
    pub fn gather(&self, positions: &[usize]) -> Result<Self, ColumnError> {
        let len = self.len();
        if let Some(&bad) = positions.iter().find(|&&p| p >= len) {
            return Err(ColumnError::OutOfBounds { index: bad, len });
        }
        Ok(match self {
            Self::Int(d) => Self::Int(positions.iter().map(|&p| d[p]).collect()),
            Self::Float(d) => Self::Float(positions.iter().map(|&p| d[p]).collect()),
            Self::Bool(d) => Self::Bool(positions.iter().map(|&p| d[p]).collect()),
            Self::Str(d) => Self::Str(positions.iter().map(|&p| d[p].clone()).collect()),
            Self::Date(d) => Self::Date(positions.iter().map(|&p| d[p]).collect()),
            Self::Object(d) => Self::Object(positions.iter().map(|&p| d[p].clone()).collect()),
        })
    }

    /// Append another array of the same dtype.
    pub fn concat(&self, other: &Self) -> Result<Self, ColumnError> {
        if self.dtype() != other.dtype() {
            return Err(ColumnError::ConcatDtype {
                left: self.dtype(),
                right: other.dtype(),
            });
        }
        Ok(match (self, other) {
            (Self::Int(a), Self::Int(b)) => {
                Self::Int(a.iter().chain(b.iter()).copied().collect())
            }
            (Self::Float(a), Self::Float(b)) => {
                Self::Float(a.iter().chain(b.iter()).copied().collect())
            }
            (Self::Bool(a), Self::Bool(b)) => {
                Self::Bool(a.iter().chain(b.iter()).copied().collect())
            }
            (Self::Str(a), Self::Str(b)) => {
                Self::Str(a.iter().chain(b.iter()).cloned().collect())
            }
            (Self::Date(a), Self::Date(b)) => {
                Self::Date(a.iter().chain(b.iter()).copied().collect())
            }
            (Self::Object(a), Self::Object(b)) => {
                Self::Object(a.iter().chain(b.iter()).cloned().collect())
            }
            _ => unreachable!("dtype equality checked above"),
        })
    }

    /// Re-coerce every element through a registered cast and rebuild the
    /// array. The result dtype is re-derived from the cast output, with
    /// `hint` settling the empty and all-null cases.
    pub fn cast_with(&self, cast: CastFn, hint: DType) -> Result<Self, ColumnError> {
        let mut out = Vec::with_capacity(self.len());
        for value in self.iter() {
            out.push(cast(&value)?);
        }
        if out.is_empty() || out.iter().all(Value::is_missing) {
            return Self::from_values_as(out, hint);
        }
        Self::from_values(out)
    }

    /// Elementwise semantic equality against one scalar.
    #[must_use]
    pub fn eq_value(&self, value: &Value) -> RowMask {
        let mut mask = RowMask::none_set(self.len());
        for (idx, element) in self.iter().enumerate() {
            if element.semantic_eq(value) {
                mask.set(idx, true);
            }
        }
        mask
    }
}

// ── Hashable key atoms ─────────────────────────────────────────────────

/// Hashable stand-in for one scalar used as a grouping or equi-join key.
/// All NaNs collapse onto one bit pattern so they key together.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum KeyAtom {
    Null,
    Bool(bool),
    Int(i64),
    FloatBits(u64),
    Str(String),
    Date(NaiveDate),
}

impl KeyAtom {
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(v) => Self::Bool(*v),
            Value::Int(v) => Self::Int(*v),
            Value::Float(v) => Self::FloatBits(if v.is_nan() {
                f64::NAN.to_bits()
            } else {
                v.to_bits()
            }),
            Value::Str(v) => Self::Str(v.clone()),
            Value::Date(v) => Self::Date(*v),
        }
    }
}

// ── Comparisons ────────────────────────────────────────────────────────

/// Comparison operators usable in join predicates and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Parse the exact operator spellings `==`, `!=`, `<`, `<=`, `>`, `>=`.
    pub fn parse(op: &str) -> Result<Self, TypeError> {
        match op {
            "==" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            _ => Err(TypeError::UnknownTag { tag: op.to_owned() }),
        }
    }

    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    fn of_ordering(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            Self::Eq => ordering == Equal,
            Self::Ne => ordering != Equal,
            Self::Lt => ordering == Less,
            Self::Le => ordering != Greater,
            Self::Gt => ordering == Greater,
            Self::Ge => ordering != Less,
        }
    }
}

/// Compare two scalars under an operator.
///
/// Strings compare lexicographically, dates chronologically, booleans with
/// `false < true`, and numeric kinds through `f64`. A missing operand
/// matches nothing: every operator yields `false` except `!=`.
pub fn compare_values(left: &Value, right: &Value, op: CompareOp) -> Result<bool, ColumnError> {
    if left.is_missing() || right.is_missing() {
        return Ok(matches!(op, CompareOp::Ne));
    }

    if let (Value::Str(a), Value::Str(b)) = (left, right) {
        return Ok(op.of_ordering(a.cmp(b)));
    }
    if let (Value::Date(a), Value::Date(b)) = (left, right) {
        return Ok(op.of_ordering(a.cmp(b)));
    }
    if let (Value::Bool(a), Value::Bool(b)) = (left, right) {
        return Ok(op.of_ordering(a.cmp(b)));
    }

    let lhs = left.to_f64()?;
    let rhs = right.to_f64()?;
    Ok(match op {
        CompareOp::Eq => lhs == rhs,
        CompareOp::Ne => lhs != rhs,
        CompareOp::Lt => lhs < rhs,
        CompareOp::Le => lhs <= rhs,
        CompareOp::Gt => lhs > rhs,
        CompareOp::Ge => lhs >= rhs,
    })
}

#[cfg(test)]
mod tests {
    use tr_types::{DType, Value};

    use super::{compare_values, Array, ColumnError, CompareOp, RowMask};

    #[test]
    fn mask_round_trips_bools() {
        let bits = [true, false, true, true, false];
        let mask = RowMask::from_bools(&bits);
        assert_eq!(mask.len(), 5);
        assert_eq!(mask.count_set(), 3);
        assert_eq!(mask.ones(), vec![0, 2, 3]);
        assert_eq!(mask.bits().collect::<Vec<_>>(), bits);
    }

    #[test]
    fn mask_logic_ops() {
        let a = RowMask::from_bools(&[true, true, false, false]);
        let b = RowMask::from_bools(&[true, false, true, false]);
        assert_eq!(a.and_mask(&b).ones(), vec![0]);
        assert_eq!(a.or_mask(&b).ones(), vec![0, 1, 2]);
        assert_eq!(a.not_mask().ones(), vec![2, 3]);
    }

    #[test]
    fn mask_spans_word_boundary() {
        let mut mask = RowMask::none_set(130);
        mask.set(0, true);
        mask.set(64, true);
        mask.set(129, true);
        assert_eq!(mask.count_set(), 3);
        assert_eq!(mask.ones(), vec![0, 64, 129]);
        assert_eq!(mask.not_mask().count_set(), 127);
    }

    #[test]
    fn inference_widens_numeric_kinds() {
        let arr = Array::from_values(vec![Value::Bool(true), Value::Int(7), Value::Float(3.5)])
            .expect("infer");
        assert_eq!(arr.dtype(), DType::Float);
        assert_eq!(arr.value(0), Some(Value::Float(1.0)));
    }

    #[test]
    fn inference_keeps_numeric_nulls_as_float() {
        let arr = Array::from_values(vec![Value::Int(1), Value::Null, Value::Int(3)])
            .expect("infer");
        assert_eq!(arr.dtype(), DType::Float);
        assert!(arr.value(1).expect("value").is_missing());
    }

    #[test]
    fn inference_promotes_mixed_kinds_to_object() {
        let arr = Array::from_values(vec![Value::Int(1), Value::Str("one".to_owned())])
            .expect("infer");
        assert_eq!(arr.dtype(), DType::Object);

        let nullable = Array::from_values(vec![Value::Str("one".to_owned()), Value::Null])
            .expect("infer");
        assert_eq!(nullable.dtype(), DType::Object);
        assert_eq!(nullable.value(1), Some(Value::Null));
    }

    #[test]
    fn gather_repeats_and_reorders() {
        let arr = Array::Int(vec![10, 20, 30]);
        let out = arr.gather(&[2, 0, 0]).expect("gather");
        assert_eq!(out, Array::Int(vec![30, 10, 10]));

        let err = arr.gather(&[3]).expect_err("out of range");
        assert!(matches!(err, ColumnError::OutOfBounds { index: 3, len: 3 }));
    }

    #[test]
    fn concat_requires_same_dtype() {
        let a = Array::Int(vec![1]);
        let b = Array::Float(vec![2.0]);
        let err = a.concat(&b).expect_err("dtype mismatch");
        assert!(matches!(err, ColumnError::ConcatDtype { .. }));

        let joined = a.concat(&Array::Int(vec![2, 3])).expect("concat");
        assert_eq!(joined, Array::Int(vec![1, 2, 3]));
    }

    #[test]
    fn set_value_coerces_to_array_dtype() {
        let mut arr = Array::Float(vec![1.0, 2.0]);
        arr.set_value(1, &Value::Int(9)).expect("set");
        assert_eq!(arr, Array::Float(vec![1.0, 9.0]));

        let mut ints = Array::Int(vec![1]);
        let err = ints.set_value(0, &Value::Null).expect_err("null into int");
        assert!(matches!(err, ColumnError::MissingUnsupported { .. }));
    }

    #[test]
    fn eq_value_identifies_nan_keys() {
        let arr = Array::Float(vec![1.0, f64::NAN, 1.0, f64::NAN]);
        let mask = arr.eq_value(&Value::Float(f64::NAN));
        assert_eq!(mask.ones(), vec![1, 3]);
    }

    #[test]
    fn operator_parsing_is_exact() {
        assert_eq!(CompareOp::parse("<=").expect("le"), CompareOp::Le);
        assert!(CompareOp::parse("===").is_err());
        assert!(CompareOp::parse("=<").is_err());
    }

    #[test]
    fn comparisons_cover_kinds() {
        assert!(compare_values(&Value::Int(2), &Value::Float(2.0), CompareOp::Eq).expect("num"));
        assert!(compare_values(
            &Value::Str("abc".to_owned()),
            &Value::Str("abd".to_owned()),
            CompareOp::Lt
        )
        .expect("str"));
        assert!(compare_values(&Value::Bool(false), &Value::Bool(true), CompareOp::Lt)
            .expect("bool"));
        assert!(
            !compare_values(&Value::Null, &Value::Int(1), CompareOp::Eq).expect("missing eq")
        );
        assert!(compare_values(&Value::Null, &Value::Int(1), CompareOp::Ne).expect("missing ne"));
    }
}
