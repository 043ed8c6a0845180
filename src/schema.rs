//! Entity metadata: tables, columns, keys and relationships.
//!
//! Filters, orderings and relationship options name columns and relationships
//! by string; everything is resolved against a [`Schema`] before any SQL is
//! rendered.

use crate::error::{Error, Result};
use crate::value::Value;

/// Schema definition for the database
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Schema {
    pub tables: Vec<TableDefinition>,
}

impl Schema {
    pub fn new() -> Self {
        Self { tables: Vec::new() }
    }

    pub fn add_table(mut self, table: TableDefinition) -> Self {
        self.tables.push(table);
        self
    }

    /// Look up a table by name
    pub fn table(&self, name: &str) -> Result<&TableDefinition> {
        self.tables
            .iter()
            .find(|table| table.name == name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    pub indexes: Vec<IndexDefinition>,
    pub relationships: Vec<RelationshipDefinition>,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: ColumnDefinition) -> Self {
        if column.constraints.contains(&ColumnConstraint::PrimaryKey)
            && !self.primary_key.contains(&column.name)
        {
            self.primary_key.push(column.name.clone());
        }
        self.columns.push(column);
        self
    }

    pub fn with_foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    pub fn with_index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_relationship(mut self, relationship: RelationshipDefinition) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn column(&self, name: &str) -> Result<&ColumnDefinition> {
        self.columns
            .iter()
            .find(|column| column.name == name)
            .ok_or_else(|| Error::UnknownColumn {
                table: self.name.clone(),
                column: name.to_string(),
            })
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column.name == name)
    }

    pub fn relationship(&self, name: &str) -> Result<&RelationshipDefinition> {
        self.find_relationship(name)
            .ok_or_else(|| Error::UnknownRelationship {
                table: self.name.clone(),
                relationship: name.to_string(),
            })
    }

    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipDefinition> {
        self.relationships.iter().find(|rel| rel.name == name)
    }

    pub fn primary_key_columns(&self) -> &[String] {
        &self.primary_key
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|column| column.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: DataType,
    pub constraints: Vec<ColumnConstraint>,
    pub default_value: Option<DefaultValue>,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            constraints: Vec::new(),
            default_value: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.constraints.push(ColumnConstraint::PrimaryKey);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.constraints.push(ColumnConstraint::NotNull);
        self
    }

    pub fn unique(mut self) -> Self {
        self.constraints.push(ColumnConstraint::Unique);
        self
    }

    pub fn with_default(mut self, default_value: DefaultValue) -> Self {
        self.default_value = Some(default_value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer,
    Text,
    Real,
    Blob,
    Boolean,
}

impl DataType {
    /// Normalize a stored value to this column type. SQLite keeps booleans
    /// as integers.
    pub fn decode(self, value: Value) -> Value {
        match (self, value) {
            (DataType::Boolean, Value::Integer(i)) => Value::Boolean(i != 0),
            (DataType::Real, Value::Integer(i)) => Value::Real(i as f64),
            (_, value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnConstraint {
    PrimaryKey,
    NotNull,
    Unique,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Integer(i64),
    Text(String),
    Real(f64),
    Boolean(bool),
    Null,
    CurrentTimestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub column: String,
    pub foreign_table: String,
    pub foreign_column: String,
    pub on_delete: ForeignKeyAction,
    pub on_update: ForeignKeyAction,
}

impl ForeignKey {
    pub fn new(
        column: impl Into<String>,
        foreign_table: impl Into<String>,
        foreign_column: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            foreign_table: foreign_table.into(),
            foreign_column: foreign_column.into(),
            on_delete: ForeignKeyAction::NoAction,
            on_update: ForeignKeyAction::NoAction,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForeignKeyAction {
    NoAction,
    Cascade,
    SetNull,
    SetDefault,
    Restrict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Whether a relationship resolves to at most one related row or to a
/// collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    ToOne,
    ToMany,
}

/// A navigable relationship from one table to another.
///
/// Related rows are those where `target.remote_column = self.local_column`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipDefinition {
    pub name: String,
    pub target: String,
    pub kind: RelationKind,
    pub local_column: String,
    pub remote_column: String,
}

impl RelationshipDefinition {
    /// Relationship through a foreign key held by this table
    /// (`self.local_column -> target.remote_column`).
    pub fn to_one(
        name: impl Into<String>,
        target: impl Into<String>,
        local_column: impl Into<String>,
        remote_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::ToOne,
            local_column: local_column.into(),
            remote_column: remote_column.into(),
        }
    }

    /// Relationship through a foreign key held by the target table.
    pub fn to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        local_column: impl Into<String>,
        remote_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::ToMany,
            local_column: local_column.into(),
            remote_column: remote_column.into(),
        }
    }
}
