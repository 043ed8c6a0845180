//! Rendering of statements and table definitions to SQLite SQL.

use std::fmt::Write as _;

use crate::expr::{ColumnRef, Expr};
use crate::schema::{
    ColumnConstraint, ColumnDefinition, DataType, DefaultValue, ForeignKeyAction, IndexDefinition,
    TableDefinition,
};
use crate::statement::{Delete, Direction, Insert, JoinKind, Projection, Select, Statement, Update};
use crate::value::{Params, Value};

/// SQL Query with typed parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub statement: String,
    pub params: Params,
}

/// Render `statement`. Inserts produce one query per row.
pub fn render(statement: &Statement) -> Vec<SqlQuery> {
    match statement {
        Statement::Select(select) => vec![render_select(select)],
        Statement::Insert(insert) => render_insert(insert),
        Statement::Update(update) => vec![render_update(update)],
        Statement::Delete(delete) => vec![render_delete(delete)],
    }
}

pub fn render_select(select: &Select) -> SqlQuery {
    let mut writer = Writer::default();
    writer.select(select);
    writer.finish()
}

fn render_insert(insert: &Insert) -> Vec<SqlQuery> {
    insert
        .rows
        .iter()
        .map(|values| {
            let mut writer = Writer::default();
            let columns = values.keys().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
            let _ = write!(writer.sql, "INSERT INTO {} ({columns}) VALUES (", quote(&insert.table));
            for (i, value) in values.values().enumerate() {
                if i > 0 {
                    writer.sql.push_str(", ");
                }
                writer.bind(value.clone());
            }
            writer.sql.push(')');
            writer.returning(&insert.returning);
            writer.finish()
        })
        .collect()
}

fn render_update(update: &Update) -> SqlQuery {
    let mut writer = Writer::default();
    let _ = write!(writer.sql, "UPDATE {} SET ", quote(&update.table));
    for (i, (column, value)) in update.assignments.iter().enumerate() {
        if i > 0 {
            writer.sql.push_str(", ");
        }
        let _ = write!(writer.sql, "{} = ", quote(column));
        writer.bind(value.clone());
    }
    writer.where_clause(&update.filters);
    writer.returning(&update.returning);
    writer.finish()
}

fn render_delete(delete: &Delete) -> SqlQuery {
    let mut writer = Writer::default();
    let _ = write!(writer.sql, "DELETE FROM {}", quote(&delete.table));
    writer.where_clause(&delete.filters);
    writer.returning(&delete.returning);
    writer.finish()
}

#[derive(Default)]
struct Writer {
    sql: String,
    params: Params,
}

impl Writer {
    fn finish(self) -> SqlQuery {
        SqlQuery {
            statement: self.sql,
            params: self.params,
        }
    }

    fn bind(&mut self, value: Value) {
        let placeholder = self.params.push(value);
        self.sql.push_str(placeholder);
    }

    fn select(&mut self, select: &Select) {
        self.sql.push_str("SELECT ");
        match &select.projection {
            Projection::Entity(columns) | Projection::Columns(columns) => self.columns(columns),
            Projection::Distinct(columns) => {
                self.sql.push_str("DISTINCT ");
                self.columns(columns);
            }
            Projection::Count => self.sql.push_str("count(*)"),
            Projection::One => self.sql.push('1'),
        }

        self.sql.push_str(" FROM ");
        match &select.source {
            Some(source) => {
                self.sql.push('(');
                self.select(source);
                self.sql.push(')');
            }
            None => self.sql.push_str(&quote(&select.table)),
        }
        let _ = write!(self.sql, " AS {}", quote(&select.alias));

        for join in &select.joins {
            let keyword = match join.kind {
                JoinKind::Inner => "JOIN",
                JoinKind::LeftOuter => "LEFT OUTER JOIN",
            };
            let _ = write!(
                self.sql,
                " {keyword} {} AS {} ON ",
                quote(&join.table),
                quote(&join.alias)
            );
            self.expr(&join.on);
        }

        let predicates: Vec<&Expr> = select.predicates().collect();
        self.where_refs(&predicates);

        if !select.group_by.is_empty() {
            self.sql.push_str(" GROUP BY ");
            self.list(&select.group_by);
        }

        if !select.order_by.is_empty() {
            self.sql.push_str(" ORDER BY ");
            for (i, order) in select.order_by.iter().enumerate() {
                if i > 0 {
                    self.sql.push_str(", ");
                }
                self.expr(&order.expr);
                self.sql.push_str(match order.direction {
                    Direction::Asc => " ASC",
                    Direction::Desc => " DESC",
                });
            }
        }

        match (select.limit, select.offset) {
            (Some(limit), Some(offset)) => {
                let _ = write!(self.sql, " LIMIT {limit} OFFSET {offset}");
            }
            (Some(limit), None) => {
                let _ = write!(self.sql, " LIMIT {limit}");
            }
            // SQLite only accepts OFFSET after a LIMIT; -1 is unbounded.
            (None, Some(offset)) => {
                let _ = write!(self.sql, " LIMIT -1 OFFSET {offset}");
            }
            (None, None) => {}
        }
    }

    fn columns(&mut self, columns: &[ColumnRef]) {
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.column(column);
        }
    }

    fn column(&mut self, column: &ColumnRef) {
        let _ = write!(self.sql, "{}.{}", quote(&column.qualifier), quote(&column.column));
    }

    fn where_clause(&mut self, predicates: &[Expr]) {
        let predicates: Vec<&Expr> = predicates.iter().collect();
        self.where_refs(&predicates);
    }

    fn where_refs(&mut self, predicates: &[&Expr]) {
        for (i, predicate) in predicates.iter().enumerate() {
            self.sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            self.expr(predicate);
        }
    }

    fn returning(&mut self, columns: &[String]) {
        if columns.is_empty() {
            return;
        }
        let columns = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
        let _ = write!(self.sql, " RETURNING {columns}");
    }

    fn list(&mut self, exprs: &[Expr]) {
        for (i, expr) in exprs.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.expr(expr);
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Column(column) => self.column(column),
            Expr::Value(value) => self.bind(value.clone()),
            Expr::Lower(inner) => {
                self.sql.push_str("lower(");
                self.expr(inner);
                self.sql.push(')');
            }
            Expr::Tuple(items) => {
                self.sql.push('(');
                self.list(items);
                self.sql.push(')');
            }
            Expr::BinaryOp { lhs, op, rhs } => {
                self.expr(lhs);
                let _ = write!(self.sql, " {} ", op.as_sql());
                self.expr(rhs);
            }
            Expr::IsNull { expr, negated } => {
                self.expr(expr);
                self.sql
                    .push_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                self.expr(expr);
                self.sql.push_str(if *negated { " NOT LIKE " } else { " LIKE " });
                self.expr(pattern);
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => self.in_list(expr, list, *negated),
            Expr::InSubquery { expr, subquery } => {
                self.expr(expr);
                self.sql.push_str(" IN (");
                self.select(subquery);
                self.sql.push(')');
            }
            Expr::And(items) => {
                if items.is_empty() {
                    self.sql.push_str("1 = 1");
                    return;
                }
                self.sql.push('(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(" AND ");
                    }
                    self.expr(item);
                }
                self.sql.push(')');
            }
            Expr::Exists(select) => {
                self.sql.push_str("EXISTS (");
                self.select(select);
                self.sql.push(')');
            }
        }
    }

    fn in_list(&mut self, expr: &Expr, list: &[Expr], negated: bool) {
        if list.is_empty() {
            self.sql.push_str(if negated { "1 = 1" } else { "1 = 0" });
            return;
        }
        self.expr(expr);
        self.sql.push_str(if negated { " NOT IN (" } else { " IN (" });
        // Row values only compare against a subquery.
        if matches!(expr, Expr::Tuple(_)) {
            self.sql.push_str("VALUES ");
        }
        self.list(list);
        self.sql.push(')');
    }
}

/// Quote an identifier.
pub fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// `CREATE TABLE IF NOT EXISTS` for `table`.
pub fn create_table_sql(table: &TableDefinition) -> String {
    let single_key = table.primary_key.len() == 1;
    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|column| column_sql(column, single_key))
        .collect();

    if table.primary_key.len() > 1 {
        let keys = table.primary_key.iter().map(|k| quote(k)).collect::<Vec<_>>();
        parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
    }

    for fk in &table.foreign_keys {
        parts.push(format!(
            "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
            quote(&fk.column),
            quote(&fk.foreign_table),
            quote(&fk.foreign_column),
            action_sql(&fk.on_delete),
            action_sql(&fk.on_update),
        ));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote(&table.name),
        parts.join(", ")
    )
}

/// `CREATE [UNIQUE] INDEX IF NOT EXISTS` for `index` on `table`.
pub fn create_index_sql(table: &TableDefinition, index: &IndexDefinition) -> String {
    let columns = index.columns.iter().map(|c| quote(c)).collect::<Vec<_>>();
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote(&index.name),
        quote(&table.name),
        columns.join(", ")
    )
}

fn column_sql(column: &ColumnDefinition, inline_primary_key: bool) -> String {
    let mut sql = format!("{} {}", quote(&column.name), type_sql(column.data_type));
    for constraint in &column.constraints {
        match constraint {
            ColumnConstraint::PrimaryKey if inline_primary_key => sql.push_str(" PRIMARY KEY"),
            ColumnConstraint::PrimaryKey => {}
            ColumnConstraint::NotNull => sql.push_str(" NOT NULL"),
            ColumnConstraint::Unique => sql.push_str(" UNIQUE"),
        }
    }
    if let Some(default) = &column.default_value {
        sql.push_str(" DEFAULT ");
        sql.push_str(&default_sql(default));
    }
    sql
}

fn type_sql(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Integer => "INTEGER",
        DataType::Text => "TEXT",
        DataType::Real => "REAL",
        DataType::Blob => "BLOB",
        DataType::Boolean => "BOOLEAN",
    }
}

fn default_sql(default: &DefaultValue) -> String {
    match default {
        DefaultValue::Integer(v) => v.to_string(),
        DefaultValue::Text(v) => format!("'{}'", v.replace('\'', "''")),
        DefaultValue::Real(v) => v.to_string(),
        DefaultValue::Boolean(v) => i32::from(*v).to_string(),
        DefaultValue::Null => "NULL".to_string(),
        DefaultValue::CurrentTimestamp => "CURRENT_TIMESTAMP".to_string(),
    }
}

fn action_sql(action: &ForeignKeyAction) -> &'static str {
    match action {
        ForeignKeyAction::NoAction => "NO ACTION",
        ForeignKeyAction::Cascade => "CASCADE",
        ForeignKeyAction::SetNull => "SET NULL",
        ForeignKeyAction::SetDefault => "SET DEFAULT",
        ForeignKeyAction::Restrict => "RESTRICT",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_embedded_quotes() {
        assert_eq!(quote("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn empty_membership_is_constant() {
        let mut writer = Writer::default();
        writer.expr(&Expr::column("T", "ID").in_list(Vec::new(), false));
        assert_eq!(writer.sql, "1 = 0");

        let mut writer = Writer::default();
        writer.expr(&Expr::column("T", "ID").in_list(Vec::new(), true));
        assert_eq!(writer.sql, "1 = 1");
    }
}
