//! Query plans and the builders that compose them.
//!
//! [`Select`] is the not-yet-executed query: projection, explicit joins,
//! required and optional predicates, grouping, ordering, slicing and the
//! relationship load directives attached to it. Mutations are expressed as
//! [`Update`], [`Insert`] and [`Delete`], each returning the affected rows.

use indexmap::IndexMap;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::expr::{ColumnRef, Expr};
use crate::filter::{compile_filters, resolve_column, FilterExpression, Scope};
use crate::record::Record;
use crate::relationship::{apply_relationship_options, LoadDirective, RelationshipOptions};
use crate::schema::{Schema, TableDefinition};
use crate::value::Value;

/// Column/value pairs of one row to insert or update.
pub type Values = IndexMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Every column of the root table, in definition order.
    Entity(Vec<ColumnRef>),
    Distinct(Vec<ColumnRef>),
    Columns(Vec<ColumnRef>),
    Count,
    One,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "asc" => Ok(Direction::Asc),
            "desc" => Ok(Direction::Desc),
            other => Err(Error::InvalidDirection(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    /// Relationship names from the root table to the joined table.
    pub path: Vec<String>,
    pub table: String,
    pub alias: String,
    pub kind: JoinKind,
    pub on: Expr,
}

impl Join {
    /// Dotted relationship path, as used in filter field names.
    pub fn path_name(&self) -> String {
        self.path.join(".")
    }
}

/// A composed select statement (query plan).
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub(crate) table: String,
    pub(crate) alias: String,
    pub(crate) projection: Projection,
    pub(crate) source: Option<Box<Select>>,
    pub(crate) joins: Vec<Join>,
    pub(crate) filters: Vec<Expr>,
    pub(crate) optional_filters: Vec<Expr>,
    pub(crate) group_by: Vec<Expr>,
    pub(crate) order_by: Vec<OrderBy>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
    pub(crate) loads: Vec<LoadDirective>,
}

impl Select {
    /// Select every column of `table`.
    pub fn new(table: &TableDefinition) -> Self {
        let alias = table.name.clone();
        let columns = qualified_columns(table, &alias);
        Self::with_projection(&table.name, alias, Projection::Entity(columns))
    }

    fn with_projection(table: &str, alias: String, projection: Projection) -> Self {
        Self {
            table: table.to_string(),
            alias,
            projection,
            source: None,
            joins: Vec::new(),
            filters: Vec::new(),
            optional_filters: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            loads: Vec::new(),
        }
    }

    /// `SELECT 1 FROM table AS alias WHERE ...`, the body of an EXISTS.
    pub(crate) fn correlated(table: &TableDefinition, alias: &str, filters: Vec<Expr>) -> Self {
        let mut select = Self::with_projection(&table.name, alias.to_string(), Projection::One);
        select.filters = filters;
        select
    }

    /// Select `column` from `inner`, wrapped as a derived table.
    pub(crate) fn column_of(inner: Select, alias: &str, column: &str) -> Self {
        let mut select = Self::with_projection(
            &inner.table,
            alias.to_string(),
            Projection::Columns(vec![ColumnRef {
                qualifier: alias.to_string(),
                column: column.to_string(),
            }]),
        );
        select.source = Some(Box::new(inner));
        select
    }

    /// `SELECT count(*) FROM (inner)`, ignoring relationship loads.
    pub fn count(&self) -> Self {
        let mut inner = self.clone();
        inner.loads.clear();
        let mut select = Self::with_projection(&self.table, "anon_count".to_string(), Projection::Count);
        select.source = Some(Box::new(inner));
        select
    }

    /// Select the row of `table` whose primary key matches `record`.
    pub fn by_primary_key(table: &TableDefinition, record: &Record) -> Result<Self> {
        let keys = table.primary_key_columns();
        if keys.is_empty() {
            return Err(Error::MissingPrimaryKey(table.name.clone()));
        }
        let mut select = Self::new(table);
        for key in keys {
            let value = record.get(key).cloned().unwrap_or(Value::Null);
            select
                .filters
                .push(Expr::eq_or_is_null(Expr::column(&select.alias, key), value));
        }
        Ok(select)
    }

    /// Name of the root table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Alias the root table is qualified with in rendered SQL.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// What the select returns.
    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    /// Explicit and eager joins, in the order they were added.
    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    /// Relationship loads resolved from relationship options.
    pub fn loads(&self) -> &[LoadDirective] {
        &self.loads
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// Whether rows map to full entities of the root table.
    pub fn is_entity(&self) -> bool {
        matches!(self.projection, Projection::Entity(_))
    }

    /// Predicates of the plan, required first.
    pub fn predicates(&self) -> impl Iterator<Item = &Expr> {
        self.filters.iter().chain(self.optional_filters.iter())
    }

    /// Add an inner join along a dotted relationship path
    /// (`"addresses"`, `"addresses.city"`).
    pub fn join(self, schema: &Schema, path: &str) -> Result<Self> {
        self.add_join(schema, path, JoinKind::Inner)
    }

    /// Add a left outer join along a dotted relationship path.
    pub fn outer_join(self, schema: &Schema, path: &str) -> Result<Self> {
        self.add_join(schema, path, JoinKind::LeftOuter)
    }

    fn add_join(mut self, schema: &Schema, path: &str, kind: JoinKind) -> Result<Self> {
        let path: Vec<String> = path.split('.').map(str::to_string).collect();
        let (name, parents) = path
            .split_last()
            .ok_or_else(|| Error::InvalidFilter("empty join path".to_string()))?;

        let (parent_table, parent_alias) = if parents.is_empty() {
            (schema.table(&self.table)?, self.alias.clone())
        } else {
            let parent = self
                .joins
                .iter()
                .find(|join| join.path == parents)
                .ok_or_else(|| Error::MissingJoin(parents.join(".")))?;
            (schema.table(&parent.table)?, parent.alias.clone())
        };

        let relationship = parent_table.relationship(name)?;
        let alias = format!("{}_j{}", relationship.target, self.joins.len() + 1);
        let on = Expr::eq(
            Expr::column(&alias, &relationship.remote_column),
            Expr::column(&parent_alias, &relationship.local_column),
        );

        self.joins.push(Join {
            path: path.clone(),
            table: relationship.target.clone(),
            alias,
            kind,
            on,
        });
        Ok(self)
    }

    /// Append the predicates compiled from `filters`.
    pub fn apply_filters(
        mut self,
        schema: &Schema,
        filters: Option<&FilterExpression>,
        with_optional: bool,
    ) -> Result<Self> {
        let table = schema.table(&self.table)?;
        let scope = Scope::new(table, &self.alias).with_joins(&self.joins);
        let predicates = compile_filters(schema, scope, filters, with_optional)?;

        if with_optional {
            self.optional_filters.extend(predicates);
        } else {
            self.filters.extend(predicates);
        }
        Ok(self)
    }

    /// Group by columns of the root table or of explicit joins.
    pub fn apply_group_by(mut self, schema: &Schema, group_by: Option<&[String]>) -> Result<Self> {
        let Some(group_by) = group_by else {
            return Ok(self);
        };
        for name in group_by {
            let expr = self.resolve(schema, name)?;
            self.group_by.push(expr);
        }
        Ok(self)
    }

    /// Order by parallel lists of columns and `"asc"` / `"desc"` directions.
    /// Nothing is ordered unless both lists are given.
    pub fn apply_order_by(
        mut self,
        schema: &Schema,
        order_by: Option<&[String]>,
        direction: Option<&[String]>,
    ) -> Result<Self> {
        let (Some(order_by), Some(direction)) = (order_by, direction) else {
            return Ok(self);
        };
        if order_by.len() != direction.len() {
            return Err(Error::OrderByMismatch {
                order_by: order_by.len(),
                direction: direction.len(),
            });
        }

        for (name, direction) in order_by.iter().zip(direction) {
            let direction = direction.parse()?;
            let expr = self.resolve(schema, name)?;
            self.order_by.push(OrderBy { expr, direction });
        }
        Ok(self)
    }

    /// Set the limit. `None` keeps the current one.
    pub fn apply_limit(mut self, limit: Option<u64>) -> Self {
        if limit.is_some() {
            self.limit = limit;
        }
        self
    }

    pub(crate) fn slice(mut self, offset: u64, limit: u64) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    fn resolve(&self, schema: &Schema, name: &str) -> Result<Expr> {
        let table = schema.table(&self.table)?;
        let scope = Scope::new(table, &self.alias).with_joins(&self.joins);
        resolve_column(schema, scope, name)?.ok_or_else(|| Error::UnknownColumn {
            table: table.name.clone(),
            column: name.to_string(),
        })
    }
}

/// `SELECT table.*`, or `SELECT DISTINCT` over `distinct` when given.
pub fn select_distinct(schema: &Schema, table: &str, distinct: Option<&[String]>) -> Result<Select> {
    let table = schema.table(table)?;
    let mut select = Select::new(table);

    if let Some(distinct) = distinct {
        let columns = distinct
            .iter()
            .map(|name| {
                table.column(name).map(|_| ColumnRef {
                    qualifier: select.alias.clone(),
                    column: name.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        select.projection = Projection::Distinct(columns);
    }

    Ok(select)
}

/// Parameters of a select, shared by every select-shaped repository call.
#[derive(Debug, Default, Clone)]
pub struct SelectQuery {
    pub distinct: Option<Vec<String>>,
    pub filters: Option<FilterExpression>,
    pub optional_filters: Option<FilterExpression>,
    pub relationship_options: Option<RelationshipOptions>,
    pub group_by: Option<Vec<String>>,
    pub order_by: Option<Vec<String>>,
    pub direction: Option<Vec<String>>,
    pub limit: Option<u64>,
}

impl SelectQuery {
    /// An empty query: every row, no loads, no ordering.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return distinct values of `columns` instead of entities.
    pub fn distinct<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.distinct = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn filters(mut self, filters: FilterExpression) -> Self {
        self.filters = Some(filters);
        self
    }

    /// Filters whose `Operand::None` entries are skipped.
    pub fn optional_filters(mut self, filters: FilterExpression) -> Self {
        self.optional_filters = Some(filters);
        self
    }

    pub fn relationship_options(mut self, options: RelationshipOptions) -> Self {
        self.relationship_options = Some(options);
        self
    }

    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn order_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order_by = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// `"asc"` or `"desc"` for each `order_by` column.
    pub fn direction<I, S>(mut self, directions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.direction = Some(directions.into_iter().map(Into::into).collect());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Compose `stmt` with the query's relationship options, filters, grouping,
/// ordering and limit, in that order.
pub fn build_select_stmt(schema: &Schema, stmt: Select, query: &SelectQuery) -> Result<Select> {
    apply_relationship_options(schema, stmt, query.relationship_options.as_ref())?
        .apply_filters(schema, query.filters.as_ref(), false)?
        .apply_filters(schema, query.optional_filters.as_ref(), true)?
        .apply_group_by(schema, query.group_by.as_deref())?
        .apply_order_by(schema, query.order_by.as_deref(), query.direction.as_deref())
        .map(|select| select.apply_limit(query.limit))
}

/// `UPDATE table SET ... WHERE ...`, with optional `RETURNING`.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub(crate) table: String,
    pub(crate) assignments: Vec<(String, Value)>,
    pub(crate) filters: Vec<Expr>,
    pub(crate) returning: Vec<String>,
}

/// Multi-row `INSERT`.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub(crate) table: String,
    pub(crate) rows: Vec<Values>,
    pub(crate) returning: Vec<String>,
}

impl Insert {
    /// Rows in insertion order.
    pub fn rows(&self) -> &[Values] {
        &self.rows
    }
}

/// `DELETE FROM table WHERE ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub(crate) table: String,
    pub(crate) filters: Vec<Expr>,
    pub(crate) returning: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl From<Select> for Statement {
    fn from(select: Select) -> Self {
        Statement::Select(select)
    }
}

impl From<Insert> for Statement {
    fn from(insert: Insert) -> Self {
        Statement::Insert(insert)
    }
}

impl From<Update> for Statement {
    fn from(update: Update) -> Self {
        Statement::Update(update)
    }
}

impl From<Delete> for Statement {
    fn from(delete: Delete) -> Self {
        Statement::Delete(delete)
    }
}

/// `UPDATE table SET values WHERE filters RETURNING *`
pub fn build_update_stmt(
    schema: &Schema,
    table: &str,
    values: &Values,
    filters: Option<&FilterExpression>,
) -> Result<Update> {
    let table = schema.table(table)?;
    validate_values(table, values)?;
    let filters = compile_filters(schema, Scope::new(table, &table.name), filters, false)?;

    Ok(Update {
        table: table.name.clone(),
        assignments: values
            .iter()
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect(),
        filters,
        returning: column_names(table),
    })
}

/// `INSERT INTO table VALUES rows RETURNING *`, one statement per row.
pub fn build_insert_stmt(schema: &Schema, table: &str, rows: Vec<Values>) -> Result<Insert> {
    let table = schema.table(table)?;
    validate_values_list(table, &rows)?;

    Ok(Insert {
        table: table.name.clone(),
        rows,
        returning: column_names(table),
    })
}

/// `DELETE FROM table WHERE filters RETURNING *`
pub fn build_delete_stmt(
    schema: &Schema,
    table: &str,
    filters: Option<&FilterExpression>,
) -> Result<Delete> {
    let table = schema.table(table)?;
    let filters = compile_filters(schema, Scope::new(table, &table.name), filters, false)?;

    Ok(Delete {
        table: table.name.clone(),
        filters,
        returning: column_names(table),
    })
}

impl Delete {
    /// Delete every row without reading them back.
    pub fn all(table: &TableDefinition) -> Self {
        Self {
            table: table.name.clone(),
            filters: Vec::new(),
            returning: Vec::new(),
        }
    }
}

impl Insert {
    /// Insert rows without reading them back.
    pub fn unreturning(table: &TableDefinition, rows: Vec<Values>) -> Result<Self> {
        validate_values_list(table, &rows)?;
        Ok(Self {
            table: table.name.clone(),
            rows,
            returning: Vec::new(),
        })
    }
}

/// A values payload must be non-empty and name only columns of `table`.
pub fn validate_values(table: &TableDefinition, values: &Values) -> Result<()> {
    if values.is_empty() {
        return Err(Error::InvalidValues(
            "values expected to be a non-empty mapping of column names".to_string(),
        ));
    }
    if let Some(unknown) = values.keys().find(|column| !table.has_column(column)) {
        return Err(Error::InvalidValues(format!(
            "`{unknown}` is not a column of `{}`",
            table.name
        )));
    }
    Ok(())
}

/// Reject an empty row list, or rows naming columns `table` does not have.
pub fn validate_values_list(table: &TableDefinition, rows: &[Values]) -> Result<()> {
    if rows.is_empty() {
        return Err(Error::InvalidValues(
            "values expected to be a non-empty list of non-empty mappings".to_string(),
        ));
    }
    rows.iter().try_for_each(|values| validate_values(table, values))
}

pub(crate) fn qualified_columns(table: &TableDefinition, qualifier: &str) -> Vec<ColumnRef> {
    table
        .column_names()
        .map(|column| ColumnRef {
            qualifier: qualifier.to_string(),
            column: column.to_string(),
        })
        .collect()
}

fn column_names(table: &TableDefinition) -> Vec<String> {
    table.column_names().map(str::to_string).collect()
}
