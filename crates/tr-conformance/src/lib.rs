#![forbid(unsafe_code)]

//! Shared fixtures and invariant checkers for the conformance suites.

use tr_table::{ColumnInput, Table};

/// The canonical six-row fixture:
/// `x = [1..6]`, `y = [one,two,one,two,one,two]`, `z = [0,0,0,1,1,1]`.
#[must_use]
pub fn build_table() -> Table {
    Table::new(vec![
        ("x", ColumnInput::from(vec![1_i64, 2, 3, 4, 5, 6])),
        ("y", vec!["one", "two", "one", "two", "one", "two"].into()),
        ("z", vec![0_i64, 0, 0, 1, 1, 1].into()),
    ])
    .expect("fixture must construct")
}

/// Assert the structural invariants every table must uphold:
/// parallel key sets, equal column lengths, and tags consistent with the
/// runtime array kinds.
pub fn check_table(table: &Table) {
    let dtypes = table.dtypes();
    assert_eq!(
        table.columns().len(),
        dtypes.len(),
        "column and dtype key sets must be parallel"
    );
    for name in table.columns() {
        let column = table.column(name).expect("listed column must resolve");
        assert_eq!(
            column.len(),
            table.rows(),
            "column `{name}` length must equal the table row count"
        );
        let tag = table.dtype(name).expect("listed column must carry a tag");
        let array = column.materialize().expect("column must materialize");
        assert_eq!(
            array.dtype(),
            tag,
            "column `{name}` runtime kind must match its recorded tag"
        );
    }
}
