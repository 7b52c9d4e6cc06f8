//! Table, column and index descriptors, plus the validation DDL applies
//! before a descriptor reaches the catalog.

use serde::{Deserialize, Serialize};
use tinydb_store::{PageNo, NO_PAGE};

use crate::error::{Error, Result};
use crate::value::{coerce, ColumnType, Value};

/// A single-column reference to another table's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub autoincrement: bool,
    pub unique: bool,
    pub default: Option<Value>,
    pub references: Option<ForeignKey>,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        ColumnDesc {
            name: name.into(),
            ty,
            nullable: true,
            primary_key: false,
            autoincrement: false,
            unique: false,
            default: None,
            references: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn autoincrement(mut self) -> Self {
        self.autoincrement = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ForeignKey {
            table: table.into(),
            column: column.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDesc {
    pub name: String,
    pub columns: Vec<ColumnDesc>,
    /// Ordered primary-key column names. Populated by [`TableDesc::normalize`]
    /// from column flags when the table declares a single-column key.
    pub primary_key: Vec<String>,
    pub root_page: PageNo,
}

impl TableDesc {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDesc>) -> Self {
        TableDesc {
            name: name.into(),
            columns,
            primary_key: Vec::new(),
            root_page: NO_PAGE,
        }
    }

    /// Declares a composite primary key at table level.
    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDesc> {
        self.column_index(name).map(|i| &self.columns[i])
    }

    /// Positions of the primary-key columns, in declared key order.
    pub fn pk_positions(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|name| self.column_index(name))
            .collect()
    }

    /// The autoincrement column position, if the table has one.
    pub fn autoincrement_position(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.autoincrement)
    }

    /// Validates the descriptor and fills in derived state (the table-level
    /// key list, NOT NULL on key columns). Cross-table checks (foreign-key
    /// targets) happen in the catalog layer.
    pub fn normalize(&mut self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Schema("table name cannot be empty".into()));
        }
        if self.columns.is_empty() {
            return Err(Error::Schema(format!(
                "table '{}' must have at least one column",
                self.name
            )));
        }
        for (i, column) in self.columns.iter().enumerate() {
            if column.name.trim().is_empty() {
                return Err(Error::Schema("column name cannot be empty".into()));
            }
            for other in &self.columns[..i] {
                if other.name.eq_ignore_ascii_case(&column.name) {
                    return Err(Error::Schema(format!(
                        "duplicate column '{}' in table '{}'",
                        column.name, self.name
                    )));
                }
            }
        }

        let flagged: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect();
        if self.primary_key.is_empty() {
            match flagged.len() {
                0 => {
                    return Err(Error::Schema(format!(
                        "table '{}' requires a primary key",
                        self.name
                    )))
                }
                1 => self.primary_key = flagged,
                _ => {
                    return Err(Error::Schema(
                        "declare a composite primary key at table level".into(),
                    ))
                }
            }
        } else {
            for name in &self.primary_key {
                if self.column_index(name).is_none() {
                    return Err(Error::Schema(format!(
                        "primary-key column '{name}' does not exist in table '{}'",
                        self.name
                    )));
                }
            }
            let mut seen: Vec<&String> = Vec::new();
            for name in &self.primary_key {
                if seen.iter().any(|s| s.eq_ignore_ascii_case(name)) {
                    return Err(Error::Schema(format!(
                        "primary-key column '{name}' listed twice"
                    )));
                }
                seen.push(name);
            }
            for name in &flagged {
                if !self.primary_key.iter().any(|k| k.eq_ignore_ascii_case(name)) {
                    return Err(Error::Schema(format!(
                        "column '{name}' is flagged PRIMARY KEY but missing from the table-level key"
                    )));
                }
            }
        }

        // Key columns are implicitly NOT NULL.
        let key_names = self.primary_key.clone();
        for name in &key_names {
            if let Some(i) = self.column_index(name) {
                self.columns[i].primary_key = true;
                self.columns[i].nullable = false;
            }
        }

        let autoinc: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.autoincrement)
            .map(|(i, _)| i)
            .collect();
        if autoinc.len() > 1 {
            return Err(Error::Schema(
                "at most one AUTOINCREMENT column per table".into(),
            ));
        }
        if let Some(&i) = autoinc.first() {
            let column = &self.columns[i];
            if column.ty != ColumnType::Integer {
                return Err(Error::Schema(
                    "AUTOINCREMENT requires an INTEGER column".into(),
                ));
            }
            if self.primary_key.len() != 1
                || !self.primary_key[0].eq_ignore_ascii_case(&column.name)
            {
                return Err(Error::Schema(
                    "AUTOINCREMENT requires a single-column INTEGER PRIMARY KEY".into(),
                ));
            }
        }

        // Defaults must be storable in their column.
        for column in &mut self.columns {
            if let Some(default) = column.default.take() {
                let coerced = coerce(default, column.ty).map_err(|_| {
                    Error::Schema(format!(
                        "default value for column '{}' does not fit type {}",
                        column.name, column.ty
                    ))
                })?;
                column.default = Some(coerced);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDesc {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub root_page: PageNo,
}

impl IndexDesc {
    pub fn new(name: impl Into<String>, table: impl Into<String>, columns: &[&str]) -> Self {
        IndexDesc {
            name: name.into(),
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
            root_page: NO_PAGE,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Schema-changing operations accepted by `Database::alter_table`.
#[derive(Debug, Clone)]
pub enum AlterTableOp {
    RenameTable { table: String, new_name: String },
    RenameColumn { table: String, column: String, new_name: String },
    AddColumn { table: String, column: ColumnDesc },
    RemoveColumn { table: String, column: String },
}
