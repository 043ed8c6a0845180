//! Declarative filter expressions and their compilation into predicates.
//!
//! A [`FilterExpression`] maps fields to `{operator -> operand}` entries. The
//! compiler walks fields and operators in insertion order and emits one
//! predicate list which callers conjoin.
//!
//! ```
//! use sql_repo::{FilterExpression, Operator};
//!
//! let filters = FilterExpression::new()
//!     .with("EMAIL", Operator::IEqual, "alice@x.com")
//!     .with("ID", Operator::In, vec![1, 3]);
//! assert_eq!(filters.len(), 2);
//! ```

use indexmap::IndexMap;
use std::collections::{BTreeSet, HashSet};

use crate::error::{Error, Result};
use crate::expr::{BinaryOp, Expr};
use crate::operator::Operator;
use crate::schema::{RelationKind, RelationshipDefinition, Schema, TableDefinition};
use crate::statement::{Join, Select};
use crate::value::Value;

/// Left-hand side of a filter entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Field {
    /// A column or relationship of the filtered table, or `"<join>.<COLUMN>"`
    /// for a column of an explicit join.
    Name(String),
    /// Several columns compared as one tuple.
    Composite(Vec<String>),
}

impl Field {
    /// Tuple of columns, compared against `Operand::Tuples`.
    pub fn composite<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Field::Composite(names.into_iter().map(Into::into).collect())
    }
}

impl From<&str> for Field {
    fn from(name: &str) -> Self {
        Field::Name(name.to_string())
    }
}

impl From<String> for Field {
    fn from(name: String) -> Self {
        Field::Name(name)
    }
}

/// Right-hand side of a filter entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No value supplied. Optional filters skip the operator entirely.
    None,
    Value(Value),
    List(Vec<Value>),
    /// Unordered values; normalized to a de-duplicated list.
    Set(Vec<Value>),
    /// Tuples for composite fields.
    Tuples(Vec<Vec<Value>>),
    /// Nested expression over the related table (HAS / ANY).
    Filter(FilterExpression),
}

impl Operand {
    /// One tuple per row, for composite fields.
    pub fn tuples<I, T>(rows: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: IntoIterator,
        T::Item: Into<Value>,
    {
        Operand::Tuples(
            rows.into_iter()
                .map(|row| row.into_iter().map(Into::into).collect())
                .collect(),
        )
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Operand::None)
    }
}

macro_rules! impl_operand_from_scalar {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Operand {
                fn from(value: $ty) -> Self {
                    Operand::Value(value.into())
                }
            }
        )*
    };
}

impl_operand_from_scalar!(Value, i32, i64, u32, f64, bool, &str, String);

impl<T: Into<Operand>> From<Option<T>> for Operand {
    fn from(value: Option<T>) -> Self {
        value.map_or(Operand::None, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Operand {
    fn from(values: Vec<T>) -> Self {
        Operand::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Operand {
    fn from(values: [T; N]) -> Self {
        Operand::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>, S> From<HashSet<T, S>> for Operand {
    fn from(values: HashSet<T, S>) -> Self {
        Operand::Set(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<BTreeSet<T>> for Operand {
    fn from(values: BTreeSet<T>) -> Self {
        Operand::Set(values.into_iter().map(Into::into).collect())
    }
}

impl From<FilterExpression> for Operand {
    fn from(filters: FilterExpression) -> Self {
        Operand::Filter(filters)
    }
}

/// Insertion-ordered `{field -> {operator -> operand}}` mapping.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FilterExpression {
    fields: IndexMap<Field, IndexMap<Operator, Operand>>,
}

impl FilterExpression {
    /// An expression with no entries; compiles to no predicates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an `operator -> operand` entry for `field`, replacing any operand
    /// already set for the same operator.
    pub fn with(
        mut self,
        field: impl Into<Field>,
        operator: Operator,
        operand: impl Into<Operand>,
    ) -> Self {
        self.insert(field, operator, operand);
        self
    }

    /// In-place form of [`FilterExpression::with`].
    ///
    /// ```
    /// use sql_repo::{FilterExpression, Operator};
    ///
    /// let mut filters = FilterExpression::new();
    /// filters.insert("ID", Operator::Superior, 1);
    /// filters.insert("ID", Operator::Inferior, 10);
    /// assert_eq!(filters.len(), 1);
    /// assert_eq!(filters.iter().next().map(|(_, ops)| ops.len()), Some(2));
    /// ```
    pub fn insert(
        &mut self,
        field: impl Into<Field>,
        operator: Operator,
        operand: impl Into<Operand>,
    ) {
        self.fields
            .entry(field.into())
            .or_default()
            .insert(operator, operand.into());
    }

    /// Number of distinct fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields with their operators, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Field, &IndexMap<Operator, Operand>)> {
        self.fields.iter()
    }
}

/// The table a filter is compiled against.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub table: &'a TableDefinition,
    pub qualifier: &'a str,
    pub joins: &'a [Join],
    depth: usize,
}

impl<'a> Scope<'a> {
    /// Compile against `table`, qualifying its columns with `qualifier`.
    pub fn new(table: &'a TableDefinition, qualifier: &'a str) -> Self {
        Self {
            table,
            qualifier,
            joins: &[],
            depth: 0,
        }
    }

    /// Make `"<join>.<COLUMN>"` fields resolvable against `joins`.
    pub fn with_joins(mut self, joins: &'a [Join]) -> Self {
        self.joins = joins;
        self
    }
}

enum Target<'s> {
    Column(Expr),
    Columns(Vec<Expr>),
    Relationship(&'s RelationshipDefinition),
}

/// Translates filter expressions into predicate lists.
#[derive(Debug, Clone, Copy)]
pub struct FilterCompiler<'a> {
    schema: &'a Schema,
    with_optional: bool,
}

impl<'a> FilterCompiler<'a> {
    /// With `with_optional`, entries whose operand is `Operand::None` are skipped.
    pub fn new(schema: &'a Schema, with_optional: bool) -> Self {
        Self {
            schema,
            with_optional,
        }
    }

    /// Predicates for every entry, following field then operator insertion order.
    pub fn compile(&self, scope: Scope<'_>, filters: &FilterExpression) -> Result<Vec<Expr>> {
        let mut conditions = Vec::new();

        for (field, operators) in filters.iter() {
            let target = self.resolve(scope, field)?;

            for (&operator, operand) in operators {
                if self.with_optional && operand.is_none() {
                    continue;
                }

                match &target {
                    Target::Column(lhs) => {
                        self.column_conditions(lhs, operator, operand, &mut conditions)?
                    }
                    Target::Columns(lhs) => {
                        tuple_conditions(lhs, operator, operand, &mut conditions)?
                    }
                    Target::Relationship(relationship) => self.relationship_conditions(
                        scope,
                        relationship,
                        operator,
                        operand,
                        &mut conditions,
                    )?,
                }
            }
        }

        Ok(conditions)
    }

    fn resolve<'s>(&self, scope: Scope<'s>, field: &Field) -> Result<Target<'s>> {
        match field {
            Field::Name(name) => {
                if let Some(column) = resolve_column(self.schema, scope, name)? {
                    return Ok(Target::Column(column));
                }
                scope
                    .table
                    .find_relationship(name)
                    .map(Target::Relationship)
                    .ok_or_else(|| Error::UnknownColumn {
                        table: scope.table.name.clone(),
                        column: name.clone(),
                    })
            }
            Field::Composite(names) => {
                if names.is_empty() {
                    return Err(Error::InvalidFilter("empty composite field".to_string()));
                }
                let columns = names
                    .iter()
                    .map(|name| {
                        resolve_column(self.schema, scope, name)?
                            .ok_or_else(|| Error::UnknownColumn {
                                table: scope.table.name.clone(),
                                column: name.clone(),
                            })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Target::Columns(columns))
            }
        }
    }

    fn column_conditions(
        &self,
        lhs: &Expr,
        operator: Operator,
        operand: &Operand,
        conditions: &mut Vec<Expr>,
    ) -> Result<()> {
        let lhs = lhs.clone();

        match operator {
            Operator::Equal => conditions.push(Expr::eq_or_is_null(lhs, scalar(operator, operand)?)),
            Operator::IEqual => {
                let value = scalar(operator, operand)?;
                conditions.push(if value.is_null() {
                    lhs.is_null()
                } else {
                    Expr::eq(lhs.lower(), Expr::Value(value).lower())
                });
            }
            Operator::Different => {
                conditions.push(Expr::ne_or_is_not_null(lhs, scalar(operator, operand)?))
            }
            Operator::IDifferent => {
                let value = scalar(operator, operand)?;
                conditions.push(if value.is_null() {
                    lhs.is_not_null()
                } else {
                    Expr::binary(lhs.lower(), BinaryOp::Ne, Expr::Value(value).lower())
                });
            }
            Operator::Like | Operator::NotLike => {
                let negated = operator == Operator::NotLike;
                let value = scalar(operator, operand)?;
                conditions.push(match (value.is_null(), negated) {
                    (true, false) => lhs.is_null(),
                    (true, true) => lhs.is_not_null(),
                    (false, _) => lhs.like(Expr::Value(value), negated),
                });
            }
            Operator::ILike | Operator::NotILike => {
                let negated = operator == Operator::NotILike;
                let value = scalar(operator, operand)?;
                conditions.push(match (value.is_null(), negated) {
                    (true, false) => lhs.is_null(),
                    (true, true) => lhs.is_not_null(),
                    (false, _) => lhs.lower().like(Expr::Value(value).lower(), negated),
                });
            }
            Operator::Between | Operator::BetweenOrEqual => {
                let Some((lower, upper)) = bounds(operand) else {
                    return Ok(());
                };
                let (lower_op, upper_op) = if operator == Operator::Between {
                    (BinaryOp::Gt, BinaryOp::Lt)
                } else {
                    (BinaryOp::Ge, BinaryOp::Le)
                };
                if !lower.is_null() {
                    conditions.push(Expr::binary(lhs.clone(), lower_op, Expr::Value(lower)));
                }
                if !upper.is_null() {
                    conditions.push(Expr::binary(lhs, upper_op, Expr::Value(upper)));
                }
            }
            Operator::Superior => conditions.push(comparison(lhs, BinaryOp::Gt, operator, operand)?),
            Operator::Inferior => conditions.push(comparison(lhs, BinaryOp::Lt, operator, operand)?),
            Operator::SuperiorOrEqual => {
                conditions.push(comparison(lhs, BinaryOp::Ge, operator, operand)?)
            }
            Operator::InferiorOrEqual => {
                conditions.push(comparison(lhs, BinaryOp::Le, operator, operand)?)
            }
            Operator::In | Operator::NotIn => {
                let list = list(operator, operand)?
                    .into_iter()
                    .map(Expr::Value)
                    .collect();
                conditions.push(lhs.in_list(list, operator == Operator::NotIn));
            }
            Operator::IIn | Operator::NotIIn => {
                let list = list(operator, operand)?
                    .into_iter()
                    .map(lower_unless_null)
                    .collect();
                conditions.push(lhs.lower().in_list(list, operator == Operator::NotIIn));
            }
            Operator::Has | Operator::Any => {
                return Err(Error::InvalidFilter(format!(
                    "{operator:?} applies to relationships, not columns"
                )));
            }
        }

        Ok(())
    }

    fn relationship_conditions(
        &self,
        scope: Scope<'_>,
        relationship: &RelationshipDefinition,
        operator: Operator,
        operand: &Operand,
        conditions: &mut Vec<Expr>,
    ) -> Result<()> {
        let expected = match operator {
            Operator::Has => RelationKind::ToOne,
            Operator::Any => RelationKind::ToMany,
            _ => {
                return Err(Error::InvalidFilter(format!(
                    "{operator:?} cannot be applied to relationship `{}`",
                    relationship.name
                )));
            }
        };
        if relationship.kind != expected {
            return Err(Error::InvalidFilter(format!(
                "{operator:?} cannot be applied to {:?} relationship `{}`",
                relationship.kind, relationship.name
            )));
        }

        let nested = match operand {
            Operand::Filter(nested) => nested,
            Operand::None | Operand::Value(Value::Null) => return Ok(()),
            _ => {
                return Err(Error::InvalidFilter(format!(
                    "{operator:?} expects a nested filter expression"
                )));
            }
        };

        let target = self.schema.table(&relationship.target)?;
        let alias = format!("{}_{}", target.name, scope.depth + 1);
        let inner = Scope {
            table: target,
            qualifier: &alias,
            joins: &[],
            depth: scope.depth + 1,
        };
        let predicates = self.compile(inner, nested)?;
        let correlation = Expr::eq(
            Expr::column(&alias, &relationship.remote_column),
            Expr::column(scope.qualifier, &relationship.local_column),
        );

        match operator {
            // One EXISTS per nested predicate.
            Operator::Has => {
                for predicate in predicates {
                    conditions.push(Expr::exists(Select::correlated(
                        target,
                        &alias,
                        vec![correlation.clone(), predicate],
                    )));
                }
            }
            _ => {
                if predicates.is_empty() {
                    return Ok(());
                }
                let mut filter = vec![correlation];
                filter.extend(predicates);
                conditions.push(Expr::exists(Select::correlated(target, &alias, filter)));
            }
        }

        Ok(())
    }
}

/// Compile `filters` against `scope`. Absent filters compile to nothing.
pub fn compile_filters(
    schema: &Schema,
    scope: Scope<'_>,
    filters: Option<&FilterExpression>,
    with_optional: bool,
) -> Result<Vec<Expr>> {
    match filters {
        Some(filters) => FilterCompiler::new(schema, with_optional).compile(scope, filters),
        None => Ok(Vec::new()),
    }
}

/// Resolve `name` to a qualified column of the scope's table or, for dotted
/// names, of an explicit join. Returns `None` when the table has no such
/// column (it may still name a relationship).
pub(crate) fn resolve_column(schema: &Schema, scope: Scope<'_>, name: &str) -> Result<Option<Expr>> {
    if let Some((path, column)) = name.rsplit_once('.') {
        let join = scope
            .joins
            .iter()
            .find(|join| join.path_name() == path)
            .ok_or_else(|| Error::MissingJoin(path.to_string()))?;
        schema.table(&join.table)?.column(column)?;
        return Ok(Some(Expr::column(join.alias.clone(), column)));
    }

    Ok(scope
        .table
        .has_column(name)
        .then(|| Expr::column(scope.qualifier, name)))
}

fn tuple_conditions(
    columns: &[Expr],
    operator: Operator,
    operand: &Operand,
    conditions: &mut Vec<Expr>,
) -> Result<()> {
    if !operator.is_membership() {
        return Err(Error::InvalidFilter(format!(
            "composite fields only support membership operators, got {operator:?}"
        )));
    }
    let Operand::Tuples(rows) = operand else {
        return Err(Error::InvalidFilter(format!(
            "{operator:?} on a composite field expects tuples"
        )));
    };
    if let Some(row) = rows.iter().find(|row| row.len() != columns.len()) {
        return Err(Error::InvalidFilter(format!(
            "tuple of {} values does not match composite field of {} columns",
            row.len(),
            columns.len()
        )));
    }

    let case_insensitive = matches!(operator, Operator::IIn | Operator::NotIIn);
    let negated = matches!(operator, Operator::NotIn | Operator::NotIIn);

    let lhs = if case_insensitive {
        Expr::Tuple(columns.iter().cloned().map(Expr::lower).collect())
    } else {
        Expr::Tuple(columns.to_vec())
    };
    let list = rows
        .iter()
        .map(|row| {
            Expr::Tuple(
                row.iter()
                    .cloned()
                    .map(|value| {
                        if case_insensitive {
                            lower_unless_null(value)
                        } else {
                            Expr::Value(value)
                        }
                    })
                    .collect(),
            )
        })
        .collect();

    conditions.push(lhs.in_list(list, negated));
    Ok(())
}

fn comparison(lhs: Expr, op: BinaryOp, operator: Operator, operand: &Operand) -> Result<Expr> {
    Ok(Expr::binary(lhs, op, Expr::Value(scalar(operator, operand)?)))
}

fn lower_unless_null(value: Value) -> Expr {
    if value.is_null() {
        Expr::Value(value)
    } else {
        Expr::Value(value).lower()
    }
}

fn scalar(operator: Operator, operand: &Operand) -> Result<Value> {
    match operand {
        Operand::None => Ok(Value::Null),
        Operand::Value(value) => Ok(value.clone()),
        _ => Err(Error::InvalidFilter(format!(
            "{operator:?} expects a single value"
        ))),
    }
}

fn list(operator: Operator, operand: &Operand) -> Result<Vec<Value>> {
    match operand {
        Operand::None => Ok(vec![Value::Null]),
        Operand::Value(value) => Ok(vec![value.clone()]),
        Operand::List(values) => Ok(values.clone()),
        Operand::Set(values) => Ok(dedup(values)),
        Operand::Tuples(_) | Operand::Filter(_) => Err(Error::InvalidFilter(format!(
            "{operator:?} on a single column expects a list of values"
        ))),
    }
}

/// A 2-element bound, or `None` when the operand has any other shape.
fn bounds(operand: &Operand) -> Option<(Value, Value)> {
    let values = match operand {
        Operand::List(values) => values.clone(),
        Operand::Set(values) => dedup(values),
        _ => return None,
    };
    match <[Value; 2]>::try_from(values) {
        Ok([lower, upper]) => Some((lower, upper)),
        Err(_) => None,
    }
}

fn dedup(values: &[Value]) -> Vec<Value> {
    let mut seen = HashSet::new();
    values
        .iter()
        .filter(|value| seen.insert(*value))
        .cloned()
        .collect()
}
