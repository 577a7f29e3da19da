//! Schema objects seen by the compiler
//!
//! Tables, columns and indexes as the storage layer describes them. The
//! compiler asks two kinds of questions here: the declared type and
//! collation of a column, and whether an index covering a given set of
//! columns exists.

pub mod collation;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::types::{FieldType, SortOrder};

pub use collation::{CollId, COLL_BINARY, COLL_NONE, COLL_UNICODE, COLL_UNICODE_CI};

// ============================================================================
// Column Definition
// ============================================================================

/// Column in a table
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Declared type
    pub field_type: FieldType,
    /// Declared collation
    pub coll_id: CollId,
    /// NULL values allowed
    pub is_nullable: bool,
}

impl Default for Column {
    fn default() -> Self {
        Self {
            name: String::new(),
            field_type: FieldType::Scalar,
            coll_id: COLL_NONE,
            is_nullable: true,
        }
    }
}

impl Column {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            ..Default::default()
        }
    }

    pub fn with_collation(mut self, coll_id: CollId) -> Self {
        self.coll_id = coll_id;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }
}

// ============================================================================
// Index
// ============================================================================

/// Index column specification
#[derive(Debug, Clone, PartialEq)]
pub struct IndexColumn {
    /// Position of the column in the table
    pub column: usize,
    /// Collation of the key part
    pub coll_id: CollId,
    /// Sort order
    pub sort_order: SortOrder,
}

impl IndexColumn {
    pub fn new(column: usize) -> Self {
        Self {
            column,
            coll_id: COLL_NONE,
            sort_order: SortOrder::Asc,
        }
    }
}

/// Table index. Index number 0 is the primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct Index {
    /// Index name
    pub name: String,
    /// Position in the table's index list
    pub index_no: u32,
    /// Key parts
    pub columns: Vec<IndexColumn>,
    /// Is UNIQUE index
    pub unique: bool,
}

impl Index {
    pub fn new(name: impl Into<String>, columns: Vec<IndexColumn>, unique: bool) -> Self {
        Self {
            name: name.into(),
            index_no: 0,
            columns,
            unique,
        }
    }

    /// Position of table column `column` among the key parts
    pub fn part_of(&self, column: usize) -> Option<usize> {
        self.columns.iter().position(|c| c.column == column)
    }
}

// ============================================================================
// Table
// ============================================================================

/// Database table (or view definition when `is_view` is set)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    /// Table name
    pub name: String,
    /// Columns
    pub columns: Vec<Column>,
    /// Indexes; the first one is the primary key
    pub indexes: Vec<Arc<Index>>,
    /// Is a view
    pub is_view: bool,
    /// Estimated row count
    pub row_estimate: i64,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            ..Default::default()
        }
    }

    /// Add an index, assigning its index number
    pub fn add_index(&mut self, mut index: Index) {
        index.index_no = self.indexes.len() as u32;
        self.indexes.push(Arc::new(index));
    }

    /// Find column index by name
    pub fn find_column(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|col| col.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                Error::with_message(ErrorCode::Error, format!("no such column: {}", name))
            })
    }

    pub fn column(&self, idx: usize) -> Option<&Column> {
        self.columns.get(idx)
    }

    pub fn primary_key(&self) -> Option<&Arc<Index>> {
        self.indexes.first()
    }

    /// Find an index whose leading key parts are exactly `columns` (in any
    /// order) and, when `need_unique` is set, which is unique.
    pub fn find_index_on(&self, columns: &[usize], need_unique: bool) -> Option<&Arc<Index>> {
        self.indexes.iter().find(|idx| {
            if need_unique && !idx.unique {
                return false;
            }
            if idx.columns.len() < columns.len() {
                return false;
            }
            if need_unique && idx.columns.len() != columns.len() {
                return false;
            }
            idx.columns[..columns.len()]
                .iter()
                .all(|part| columns.contains(&part.column))
        })
    }
}

// ============================================================================
// Schema
// ============================================================================

/// Database schema containing all tables
#[derive(Debug, Clone, Default)]
pub struct Schema {
    /// Tables keyed by lower-cased name
    pub tables: HashMap<String, Arc<Table>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, table: Table) -> Arc<Table> {
        let table = Arc::new(table);
        self.tables
            .insert(table.name.to_lowercase(), Arc::clone(&table));
        table
    }

    /// Get table by name (case-insensitive)
    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(&name.to_lowercase()).cloned()
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.contains_key(&name.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> Table {
        let mut t = Table::new(
            "t",
            vec![
                Column::new("id", FieldType::Integer).not_null(),
                Column::new("a", FieldType::Integer),
                Column::new("s", FieldType::String).with_collation(COLL_UNICODE_CI),
            ],
        );
        t.add_index(Index::new("pk", vec![IndexColumn::new(0)], true));
        t.add_index(Index::new(
            "t_a_s",
            vec![IndexColumn::new(1), IndexColumn::new(2)],
            false,
        ));
        t
    }

    #[test]
    fn test_find_column() {
        let t = sample_table();
        assert_eq!(t.find_column("A").unwrap(), 1);
        let err = t.find_column("zz").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Error);
    }

    #[test]
    fn test_find_index_on() {
        let t = sample_table();
        assert_eq!(t.find_index_on(&[0], true).unwrap().name, "pk");
        assert_eq!(t.find_index_on(&[1], false).unwrap().name, "t_a_s");
        assert!(t.find_index_on(&[1], true).is_none());
        assert_eq!(t.indexes[1].index_no, 1);
    }

    #[test]
    fn test_schema_lookup_is_case_insensitive() {
        let mut schema = Schema::new();
        schema.add_table(sample_table());
        assert!(schema.table_exists("T"));
        assert_eq!(schema.table("t").unwrap().columns.len(), 3);
    }
}
