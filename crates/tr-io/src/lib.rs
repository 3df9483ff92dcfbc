#![forbid(unsafe_code)]

use chrono::NaiveDate;
use csv::{ReaderBuilder, WriterBuilder};
use thiserror::Error;
use tr_table::{ColumnInput, Table, TableError};
use tr_types::Value;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("csv input has no headers")]
    MissingHeaders,
    #[error("source has no column `{name}`")]
    MissingColumn { name: String },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ── Source adapters ────────────────────────────────────────────────────

/// The one capability set an import source must provide: ordered column
/// names, an array-like per column, and an optional dtype tag hint.
pub trait TableSource {
    fn column_names(&self) -> Vec<String>;
    fn column(&self, name: &str) -> Result<ColumnInput, IoError>;
    fn dtype_hint(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Build a table from any source: columns land in source order, then any
/// dtype hints coerce through the registry.
pub fn import<S: TableSource>(source: &S) -> Result<Table, IoError> {
    let names = source.column_names();
    let mut table = Table::empty();
    for name in &names {
        let input = source.column(name)?;
        table.set_column(name.clone(), input)?;
    }
    let hints: Vec<(String, String)> = names
        .iter()
        .filter_map(|name| source.dtype_hint(name).map(|hint| (name.clone(), hint)))
        .collect();
    if !hints.is_empty() {
        let specs: Vec<(&str, &str)> = hints
            .iter()
            .map(|(name, hint)| (name.as_str(), hint.as_str()))
            .collect();
        table.update_dtypes_inplace(&specs)?;
    }
    Ok(table)
}

/// A mapping of column name → array-like value.
#[derive(Debug, Clone, Default)]
pub struct MappingSource {
    entries: Vec<(String, ColumnInput)>,
    hints: Vec<(String, String)>,
}

impl MappingSource {
    #[must_use]
    pub fn new(entries: Vec<(String, ColumnInput)>) -> Self {
        Self {
            entries,
            hints: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_dtypes(mut self, hints: Vec<(String, String)>) -> Self {
        self.hints = hints;
        self
    }
}

impl TableSource for MappingSource {
    fn column_names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    fn column(&self, name: &str) -> Result<ColumnInput, IoError> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, input)| input.clone())
            .ok_or_else(|| IoError::MissingColumn {
                name: name.to_owned(),
            })
    }

    fn dtype_hint(&self, name: &str) -> Option<String> {
        self.hints
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, hint)| hint.clone())
    }
}

/// A sequence of single-key mappings, each contributing one column,
/// merged in order (a repeated key keeps its first position but takes the
/// later value).
#[derive(Debug, Clone, Default)]
pub struct RecordMapsSource {
    merged: Vec<(String, ColumnInput)>,
}

impl RecordMapsSource {
    #[must_use]
    pub fn new(maps: Vec<(String, ColumnInput)>) -> Self {
        let mut merged: Vec<(String, ColumnInput)> = Vec::with_capacity(maps.len());
        for (name, input) in maps {
            match merged.iter_mut().find(|(n, _)| *n == name) {
                Some(entry) => entry.1 = input,
                None => merged.push((name, input)),
            }
        }
        Self { merged }
    }
}

impl TableSource for RecordMapsSource {
    fn column_names(&self) -> Vec<String> {
        self.merged.iter().map(|(name, _)| name.clone()).collect()
    }

    fn column(&self, name: &str) -> Result<ColumnInput, IoError> {
        self.merged
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, input)| input.clone())
            .ok_or_else(|| IoError::MissingColumn {
                name: name.to_owned(),
            })
    }
}

/// A single-column scalar.
#[derive(Debug, Clone)]
pub struct ScalarSource {
    pub name: String,
    pub value: Value,
}

impl TableSource for ScalarSource {
    fn column_names(&self) -> Vec<String> {
        vec![self.name.clone()]
    }

    fn column(&self, name: &str) -> Result<ColumnInput, IoError> {
        if name != self.name {
            return Err(IoError::MissingColumn {
                name: name.to_owned(),
            });
        }
        Ok(ColumnInput::Scalar(self.value.clone()))
    }
}

/// An already-built table is itself a valid source.
impl TableSource for Table {
    fn column_names(&self) -> Vec<String> {
        self.columns().to_vec()
    }

    fn column(&self, name: &str) -> Result<ColumnInput, IoError> {
        let array = Table::column(self, name)?.materialize()?;
        Ok(ColumnInput::Array(array))
    }

    fn dtype_hint(&self, name: &str) -> Option<String> {
        self.dtype(name).map(|dt| dt.name().to_owned())
    }
}

// ── CSV boundary ───────────────────────────────────────────────────────

pub fn read_csv_str(input: &str) -> Result<Table, IoError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(input.as_bytes());

    let headers = reader.headers().cloned()?;
    if headers.is_empty() {
        return Err(IoError::MissingHeaders);
    }

    let header_count = headers.len();
    let row_hint = input.len() / (header_count * 8).max(1);
    let mut columns: Vec<Vec<Value>> = (0..header_count)
        .map(|_| Vec::with_capacity(row_hint))
        .collect();

    for row in reader.records() {
        let record = row?;
        for (idx, col) in columns.iter_mut().enumerate() {
            let field = record.get(idx).unwrap_or_default();
            col.push(parse_value(field));
        }
    }

    let entries = columns
        .into_iter()
        .enumerate()
        .map(|(idx, values)| {
            let name = headers.get(idx).unwrap_or_default().to_owned();
            (name, ColumnInput::Values(values))
        })
        .collect();

    import(&MappingSource::new(entries))
}

pub fn write_csv_string(table: &Table) -> Result<String, IoError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());

    let headers: Vec<String> = table.columns().to_vec();
    writer.write_record(&headers)?;

    for row in table.to_records(None, true)? {
        let cells: Vec<String> = row?.iter().map(Value::to_string).collect();
        writer.write_record(&cells)?;
    }

    let bytes = writer.into_inner().map_err(|err| err.into_error())?;
    Ok(String::from_utf8(bytes)?)
}

/// Field inference ladder: empty = null, then int, float, bool, ISO date,
/// falling back to a plain string.
fn parse_value(field: &str) -> Value {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }

    if let Ok(value) = trimmed.parse::<i64>() {
        return Value::Int(value);
    }
    if let Ok(value) = trimmed.parse::<f64>() {
        return Value::Float(value);
    }
    if let Ok(value) = trimmed.parse::<bool>() {
        return Value::Bool(value);
    }
    if let Ok(value) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Value::Date(value);
    }

    Value::Str(trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    use tr_table::ColumnInput;
    use tr_types::{DType, Value};

    use super::{
        import, read_csv_str, write_csv_string, MappingSource, RecordMapsSource, ScalarSource,
        TableSource,
    };

    #[test]
    fn mapping_source_imports_in_order() {
        let source = MappingSource::new(vec![
            ("x".to_owned(), ColumnInput::from(vec![1_i64, 2, 3])),
            ("y".to_owned(), vec!["a", "b", "c"].into()),
        ]);
        let table = import(&source).expect("import");
        assert_eq!(table.columns(), &["x", "y"]);
        assert_eq!(table.rows(), 3);
    }

    #[test]
    fn mapping_source_applies_dtype_hints() {
        let source = MappingSource::new(vec![(
            "x".to_owned(),
            ColumnInput::from(vec![1_i64, 2, 3]),
        )])
        .with_dtypes(vec![("x".to_owned(), "float".to_owned())]);
        let table = import(&source).expect("import");
        assert_eq!(table.dtype("x"), Some(DType::Float));
    }

    #[test]
    fn record_maps_merge_in_order() {
        let source = RecordMapsSource::new(vec![
            ("x".to_owned(), ColumnInput::from(vec![1_i64, 2])),
            ("y".to_owned(), ColumnInput::from(vec![3_i64, 4])),
            ("x".to_owned(), ColumnInput::from(vec![9_i64, 9])),
        ]);
        let table = import(&source).expect("import");
        assert_eq!(table.columns(), &["x", "y"]);
        assert_eq!(
            table.column("x").expect("x").values(),
            vec![Value::Int(9), Value::Int(9)]
        );
    }

    #[test]
    fn scalar_source_is_a_single_row() {
        let table = import(&ScalarSource {
            name: "only".to_owned(),
            value: Value::Int(7),
        })
        .expect("import");
        assert_eq!(table.rows(), 1);
        assert_eq!(table.cell(0, "only").expect("cell"), Value::Int(7));
    }

    #[test]
    fn table_round_trips_as_its_own_source() {
        let original = import(&MappingSource::new(vec![
            ("x".to_owned(), ColumnInput::from(vec![1_i64, 2])),
            ("y".to_owned(), vec![1.5_f64, 2.5].into()),
        ]))
        .expect("original");

        let reimported = import(&original).expect("reimport");
        assert_eq!(reimported.columns(), original.columns());
        assert_eq!(
            reimported.column("y").expect("y").values(),
            original.column("y").expect("y").values()
        );
        // the round trip copies: mutating one side leaves the other alone
        reimported
            .set_value("x", 0, &Value::Int(99))
            .expect("mutate");
        assert_eq!(original.cell(0, "x").expect("cell"), Value::Int(1));
    }

    #[test]
    fn csv_round_trip_preserves_null_and_shape() {
        let input = "id,value,day\n1,10,2020-01-02\n2,,2020-01-03\n3,3.5,2020-01-04\n";
        let table = read_csv_str(input).expect("read");
        assert_eq!(table.rows(), 3);
        assert_eq!(table.dtype("day"), Some(DType::Date));
        assert!(table.cell(1, "value").expect("cell").is_missing());

        let out = write_csv_string(&table).expect("write");
        assert!(out.contains("id,value,day"));
        assert!(out.contains("3,3.5,2020-01-04"));
        assert!(out.contains("2,,2020-01-03"));
    }

    #[test]
    fn csv_headers_are_required() {
        let err = read_csv_str("").expect_err("no headers");
        assert!(matches!(err, super::IoError::MissingHeaders | super::IoError::Csv(_)));
    }

    #[test]
    fn source_misses_are_reported() {
        let source = MappingSource::new(vec![(
            "x".to_owned(),
            ColumnInput::from(vec![1_i64]),
        )]);
        let err = source.column("gone").expect_err("missing");
        assert!(matches!(err, super::IoError::MissingColumn { ref name } if name == "gone"));
    }
}
