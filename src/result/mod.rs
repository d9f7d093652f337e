use crate::core::{Row, Value};

/// Fully materialized rows returned by `execute_reader` and schema queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    /// First column of the first row, the value `execute_scalar` reports.
    pub fn first_value(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_column_name() {
        let result = QueryResult::new(
            vec!["Id".into(), "Name".into()],
            vec![vec![Value::Integer(1), Value::from("alice")]],
        );

        assert_eq!(result.row_count(), 1);
        assert_eq!(result.value(0, "name"), Some(&Value::from("alice")));
        assert_eq!(result.first_value(), Some(&Value::Integer(1)));
        assert!(result.value(1, "name").is_none());
    }
}
