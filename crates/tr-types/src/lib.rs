#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Days from the Common Era epoch to the Unix epoch (1970-01-01).
const UNIX_EPOCH_CE_DAYS: i64 = 719_163;

/// Canonical coarse-grained element kinds. Every concrete column
/// representation maps onto exactly one of these six tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Int,
    Float,
    Bool,
    Str,
    Date,
    Object,
}

impl DType {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Str => "str",
            Self::Date => "date",
            Self::Object => "object",
        }
    }

    /// Classify a type's string form into a canonical tag.
    ///
    /// Pattern rules, not exact identity: `"int64"`, `"uint8"` and `"int"`
    /// all land on `Int`; `"<U12"` is a string kind, `"<M8[D]"` a date kind.
    pub fn parse(tag: &str) -> Result<Self, TypeError> {
        let t = tag.trim();
        if t.contains("int") {
            Ok(Self::Int)
        } else if t.contains("float") {
            Ok(Self::Float)
        } else if t.contains("bool") {
            Ok(Self::Bool)
        } else if t.contains("str") || t.starts_with("<U") {
            Ok(Self::Str)
        } else if t.contains("date") || t.starts_with("<M") {
            Ok(Self::Date)
        } else if t.contains("object") || t == "O" {
            Ok(Self::Object)
        } else {
            Err(TypeError::UnknownTag { tag: t.to_owned() })
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single cell value. Missingness is either an explicit `Null` or a
/// `Float` NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
}

impl Value {
    /// The canonical kind of a non-null value; `Null` carries no kind.
    #[must_use]
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(DType::Bool),
            Self::Int(_) => Some(DType::Int),
            Self::Float(_) => Some(DType::Float),
            Self::Str(_) => Some(DType::Str),
            Self::Date(_) => Some(DType::Date),
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        self.dtype().map_or("null", DType::name)
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Float(v) => v.is_nan(),
            _ => false,
        }
    }

    /// Equality that identifies all NaNs with each other.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => (a.is_nan() && b.is_nan()) || (a == b),
            _ => self == other,
        }
    }

    /// The missing marker for a given column dtype: NaN keeps float columns
    /// homogeneous, every other kind carries an explicit `Null`.
    #[must_use]
    pub fn missing_for_dtype(dtype: DType) -> Self {
        match dtype {
            DType::Float => Self::Float(f64::NAN),
            _ => Self::Null,
        }
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Int(v) => Ok(*v as f64),
            Self::Float(v) => Ok(*v),
            Self::Null => Err(TypeError::Missing),
            Self::Str(_) | Self::Date(_) => Err(TypeError::NonNumeric {
                kind: self.kind_name(),
            }),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str(""),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("`{tag}` is not a valid dtype")]
    UnknownTag { tag: String },
    #[error("dtype `{tag}` has no registered coercion")]
    UnregisteredTag { tag: String },
    #[error("cannot cast {from} value to dtype {to}")]
    InvalidCast { from: &'static str, to: DType },
    #[error("cannot parse `{value}` as dtype {to}")]
    ParseFailure { value: String, to: DType },
    #[error("{value} does not fit in dtype {to}")]
    OutOfRange { value: String, to: DType },
    #[error("value of kind {kind} is not numeric")]
    NonNumeric { kind: &'static str },
    #[error("value is missing")]
    Missing,
}

// ── Scalar casts ───────────────────────────────────────────────────────

fn epoch_days(date: NaiveDate) -> i64 {
    use chrono::Datelike;
    i64::from(date.num_days_from_ce()) - UNIX_EPOCH_CE_DAYS
}

fn date_from_epoch_days(days: i64, to: DType) -> Result<NaiveDate, TypeError> {
    i32::try_from(days + UNIX_EPOCH_CE_DAYS)
        .ok()
        .and_then(NaiveDate::from_num_days_from_ce_opt)
        .ok_or_else(|| TypeError::OutOfRange {
            value: days.to_string(),
            to,
        })
}

/// Coerce one scalar to a target dtype.
///
/// `Null` maps to the target's missing marker. Float-to-int truncates;
/// non-finite floats do not fit an int. Dates convert to and from whole
/// days since the Unix epoch.
pub fn cast_value(value: &Value, target: DType) -> Result<Value, TypeError> {
    if value.is_missing() {
        return Ok(Value::missing_for_dtype(target));
    }
    let from = value.kind_name();

    match target {
        DType::Int => match value {
            Value::Int(v) => Ok(Value::Int(*v)),
            Value::Bool(v) => Ok(Value::Int(i64::from(*v))),
            Value::Float(v) => {
                if !v.is_finite() || *v < i64::MIN as f64 || *v > i64::MAX as f64 {
                    return Err(TypeError::OutOfRange {
                        value: v.to_string(),
                        to: target,
                    });
                }
                Ok(Value::Int(v.trunc() as i64))
            }
            Value::Str(v) => v.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                TypeError::ParseFailure {
                    value: v.clone(),
                    to: target,
                }
            }),
            Value::Date(v) => Ok(Value::Int(epoch_days(*v))),
            Value::Null => unreachable!("missing handled above"),
        },
        DType::Float => match value {
            Value::Float(v) => Ok(Value::Float(*v)),
            Value::Int(v) => Ok(Value::Float(*v as f64)),
            Value::Bool(v) => Ok(Value::Float(if *v { 1.0 } else { 0.0 })),
            Value::Str(v) => v.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                TypeError::ParseFailure {
                    value: v.clone(),
                    to: target,
                }
            }),
            Value::Date(v) => Ok(Value::Float(epoch_days(*v) as f64)),
            Value::Null => unreachable!("missing handled above"),
        },
        DType::Bool => match value {
            Value::Bool(v) => Ok(Value::Bool(*v)),
            Value::Int(v) => Ok(Value::Bool(*v != 0)),
            Value::Float(v) => Ok(Value::Bool(*v != 0.0)),
            Value::Str(v) => Ok(Value::Bool(!v.is_empty())),
            Value::Date(_) => Err(TypeError::InvalidCast { from, to: target }),
            Value::Null => unreachable!("missing handled above"),
        },
        DType::Str => Ok(Value::Str(value.to_string())),
        DType::Date => match value {
            Value::Date(v) => Ok(Value::Date(*v)),
            Value::Str(v) => NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|_| TypeError::ParseFailure {
                    value: v.clone(),
                    to: target,
                }),
            Value::Int(v) => date_from_epoch_days(*v, target).map(Value::Date),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Object => Ok(value.clone()),
    }
}

/// Per-cell export cast for record iteration.
///
/// Dates render as `%Y-%m-%d` strings and object cells as their display
/// form. With `cast_null`, a float NaN becomes an explicit `Null` instead
/// of a number.
pub fn record_cast(value: &Value, dtype: DType, cast_null: bool) -> Result<Value, TypeError> {
    if value.is_missing() {
        if cast_null || !matches!(dtype, DType::Float) {
            return Ok(Value::Null);
        }
        return Ok(Value::Float(f64::NAN));
    }
    match dtype {
        DType::Date | DType::Object => Ok(Value::Str(value.to_string())),
        _ => cast_value(value, dtype),
    }
}

// ── TypeRegistry ───────────────────────────────────────────────────────

/// A registered scalar coercion function.
pub type CastFn = fn(&Value) -> Result<Value, TypeError>;

/// Mutable mapping from scalar-kind-name to a coercion function.
///
/// The process-wide instance (see [`registry`]) is initialized with the six
/// built-in kinds; callers may swap or remove entries, and any coercion
/// consulted through an unregistered tag fails with a `TypeError`.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    casts: HashMap<String, CastFn>,
}

fn cast_to_int(v: &Value) -> Result<Value, TypeError> {
    cast_value(v, DType::Int)
}
fn cast_to_float(v: &Value) -> Result<Value, TypeError> {
    cast_value(v, DType::Float)
}
fn cast_to_bool(v: &Value) -> Result<Value, TypeError> {
    cast_value(v, DType::Bool)
}
fn cast_to_str(v: &Value) -> Result<Value, TypeError> {
    cast_value(v, DType::Str)
}
fn cast_to_date(v: &Value) -> Result<Value, TypeError> {
    cast_value(v, DType::Date)
}
fn cast_to_object(v: &Value) -> Result<Value, TypeError> {
    cast_value(v, DType::Object)
}

impl TypeRegistry {
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut casts = HashMap::<String, CastFn>::new();
        casts.insert("int".to_owned(), cast_to_int);
        casts.insert("float".to_owned(), cast_to_float);
        casts.insert("bool".to_owned(), cast_to_bool);
        casts.insert("str".to_owned(), cast_to_str);
        casts.insert("date".to_owned(), cast_to_date);
        casts.insert("object".to_owned(), cast_to_object);
        Self { casts }
    }

    pub fn register(&mut self, tag: impl Into<String>, cast: CastFn) {
        self.casts.insert(tag.into(), cast);
    }

    pub fn unregister(&mut self, tag: &str) -> bool {
        self.casts.remove(tag).is_some()
    }

    #[must_use]
    pub fn lookup(&self, tag: &str) -> Option<CastFn> {
        self.casts.get(tag).copied()
    }
}

/// Process-wide registry access. All coercion lookups go through these
/// functions rather than touching the backing state directly.
pub mod registry {
    use super::{CastFn, TypeError, TypeRegistry, REGISTRY};

    pub fn lookup(tag: &str) -> Result<CastFn, TypeError> {
        let guard = REGISTRY.read().unwrap_or_else(|e| e.into_inner());
        guard.lookup(tag).ok_or_else(|| TypeError::UnregisteredTag {
            tag: tag.to_owned(),
        })
    }

    pub fn register(tag: impl Into<String>, cast: CastFn) {
        let mut guard = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
        guard.register(tag, cast);
    }

    pub fn unregister(tag: &str) -> bool {
        let mut guard = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
        guard.unregister(tag)
    }

    /// Restore the six built-in kinds, discarding custom registrations.
    pub fn reset() {
        let mut guard = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
        *guard = TypeRegistry::with_builtins();
    }
}

static REGISTRY: Lazy<RwLock<TypeRegistry>> =
    Lazy::new(|| RwLock::new(TypeRegistry::with_builtins()));

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{cast_value, record_cast, registry, DType, TypeError, Value};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn tag_patterns_classify_concrete_forms() {
        assert_eq!(DType::parse("int64").expect("int64"), DType::Int);
        assert_eq!(DType::parse("float32").expect("float32"), DType::Float);
        assert_eq!(DType::parse("<U12").expect("<U12"), DType::Str);
        assert_eq!(DType::parse("<M8[D]").expect("<M8[D]"), DType::Date);
        assert_eq!(DType::parse("datetime64").expect("datetime64"), DType::Date);
        assert_eq!(DType::parse("O").expect("O"), DType::Object);
    }

    #[test]
    fn invalid_tag_never_silently_passes() {
        let err = DType::parse("flot").expect_err("must fail");
        assert_eq!(
            err,
            TypeError::UnknownTag {
                tag: "flot".to_owned()
            }
        );
    }

    #[test]
    fn float_to_int_truncates() {
        assert_eq!(
            cast_value(&Value::Float(3.9), DType::Int).expect("cast"),
            Value::Int(3)
        );
        assert_eq!(
            cast_value(&Value::Float(-3.9), DType::Int).expect("cast"),
            Value::Int(-3)
        );
    }

    #[test]
    fn non_finite_float_does_not_fit_int() {
        let err = cast_value(&Value::Float(f64::INFINITY), DType::Int).expect_err("must fail");
        assert!(matches!(err, TypeError::OutOfRange { .. }));
    }

    #[test]
    fn missing_maps_to_target_marker() {
        assert!(
            matches!(cast_value(&Value::Null, DType::Float).expect("cast"), Value::Float(v) if v.is_nan())
        );
        assert_eq!(
            cast_value(&Value::Float(f64::NAN), DType::Str).expect("cast"),
            Value::Null
        );
    }

    #[test]
    fn date_round_trips_through_epoch_days() {
        let d = Value::Date(date(2020, 4, 25));
        let as_int = cast_value(&d, DType::Int).expect("to int");
        assert_eq!(cast_value(&as_int, DType::Date).expect("back"), d);
    }

    #[test]
    fn date_parses_from_iso_string() {
        assert_eq!(
            cast_value(&Value::Str("2020-04-25".to_owned()), DType::Date).expect("parse"),
            Value::Date(date(2020, 4, 25))
        );
    }

    #[test]
    fn record_cast_renders_date_and_nan() {
        let d = record_cast(&Value::Date(date(2020, 1, 2)), DType::Date, true).expect("date");
        assert_eq!(d, Value::Str("2020-01-02".to_owned()));

        let nan = record_cast(&Value::Float(f64::NAN), DType::Float, true).expect("nan");
        assert_eq!(nan, Value::Null);

        let kept = record_cast(&Value::Float(f64::NAN), DType::Float, false).expect("nan kept");
        assert!(matches!(kept, Value::Float(v) if v.is_nan()));
    }

    #[test]
    fn semantic_eq_identifies_nans() {
        assert!(Value::Float(f64::NAN).semantic_eq(&Value::Float(f64::NAN)));
        assert!(!Value::Float(f64::NAN).semantic_eq(&Value::Float(0.0)));
    }

    #[test]
    fn registry_lookup_register_unregister() {
        registry::reset();
        let cast = registry::lookup("int").expect("builtin int");
        assert_eq!(cast(&Value::Bool(true)).expect("bool to int"), Value::Int(1));

        assert!(registry::unregister("int"));
        let err = registry::lookup("int").expect_err("gone");
        assert!(matches!(err, TypeError::UnregisteredTag { .. }));

        registry::reset();
        assert!(registry::lookup("int").is_ok());
    }
}
