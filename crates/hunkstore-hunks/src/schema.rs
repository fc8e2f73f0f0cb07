//! Table schema with per-column hunk thresholds

use hunkstore_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A value column
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Values longer than this are externalized; `None` keeps every value inline
    pub max_inline_hunk_size: Option<usize>,
}

impl ColumnSchema {
    /// Column whose values always stay inline
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_inline_hunk_size: None,
        }
    }

    #[must_use]
    pub fn with_max_inline_hunk_size(name: impl Into<String>, max_inline_hunk_size: usize) -> Self {
        Self {
            name: name.into(),
            max_inline_hunk_size: Some(max_inline_hunk_size),
        }
    }
}

/// Schema of a sorted table: one int64 key column followed by value columns
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    key_column: String,
    value_columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(key_column: impl Into<String>, value_columns: Vec<ColumnSchema>) -> Result<Self> {
        let key_column = key_column.into();
        let mut names = HashSet::new();
        names.insert(key_column.clone());
        for column in &value_columns {
            if !names.insert(column.name.clone()) {
                return Err(Error::invalid_argument(format!(
                    "duplicate column name {:?}",
                    column.name
                )));
            }
        }
        Ok(Self {
            key_column,
            value_columns,
        })
    }

    #[must_use]
    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    #[must_use]
    pub fn value_columns(&self) -> &[ColumnSchema] {
        &self.value_columns
    }

    /// Position of a value column
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.value_columns.iter().position(|c| c.name == name)
    }

    /// Whether any column may externalize values
    #[must_use]
    pub fn has_hunk_columns(&self) -> bool {
        self.value_columns
            .iter()
            .any(|c| c.max_inline_hunk_size.is_some())
    }

    /// Check that `new` may replace this schema
    ///
    /// Columns must keep their names and order. Removing `max_inline_hunk_size`
    /// from a column is rejected while the table still holds hunk references.
    pub fn validate_alteration(&self, new: &Self, has_hunk_refs: bool) -> Result<()> {
        if self.key_column != new.key_column {
            return Err(Error::schema_violation(format!(
                "key column cannot change from {:?} to {:?}",
                self.key_column, new.key_column
            )));
        }
        if self.value_columns.len() != new.value_columns.len() {
            return Err(Error::schema_violation(
                "value columns cannot be added or removed",
            ));
        }
        for (old, altered) in self.value_columns.iter().zip(&new.value_columns) {
            if old.name != altered.name {
                return Err(Error::schema_violation(format!(
                    "column {:?} cannot be renamed to {:?}",
                    old.name, altered.name
                )));
            }
            if has_hunk_refs
                && old.max_inline_hunk_size.is_some()
                && altered.max_inline_hunk_size.is_none()
            {
                return Err(Error::schema_violation(format!(
                    "cannot remove max_inline_hunk_size from column {:?} while hunk references exist",
                    old.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(threshold: Option<usize>) -> TableSchema {
        TableSchema::new(
            "key",
            vec![ColumnSchema {
                name: "value".into(),
                max_inline_hunk_size: threshold,
            }],
        )
        .unwrap()
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let err = TableSchema::new("key", vec![ColumnSchema::new("key")]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_threshold_changes_allowed() {
        let current = schema(Some(10));
        current.validate_alteration(&schema(Some(100)), true).unwrap();
        current.validate_alteration(&schema(Some(5)), true).unwrap();
        schema(None).validate_alteration(&current, false).unwrap();
    }

    #[test]
    fn test_removing_hunks_with_refs_rejected() {
        let current = schema(Some(10));
        assert!(matches!(
            current.validate_alteration(&schema(None), true),
            Err(Error::SchemaViolation(_))
        ));
        current.validate_alteration(&schema(None), false).unwrap();
    }

    #[test]
    fn test_structural_changes_rejected() {
        let current = schema(Some(10));
        let renamed = TableSchema::new("key", vec![ColumnSchema::new("other")]).unwrap();
        assert!(current.validate_alteration(&renamed, false).is_err());

        let rekeyed = TableSchema::new("id", vec![ColumnSchema::new("value")]).unwrap();
        assert!(current.validate_alteration(&rekeyed, false).is_err());
        assert!(current.has_hunk_columns());
        assert_eq!(current.column_index("value"), Some(0));
    }
}
