//! Blocking repository facade.
//!
//! Every operation takes an optional session. A supplied session is reused
//! as is; otherwise a session is opened for the call, closed afterwards and
//! rolled back when the call fails. Mutations leave transaction control to
//! the caller through the `flush` and `commit` flags.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::filter::FilterExpression;
use crate::loader::{attach_relation, relation_select, Loader};
use crate::pagination::{apply_pagination, Pagination};
use crate::record::{Entity, Record};
use crate::schema::{Schema, TableDefinition};
use crate::session::{record_from_row, Session, SessionFactory, SessionScope};
use crate::statement::{
    build_delete_stmt, build_insert_stmt, build_select_stmt, build_update_stmt, select_distinct,
    Select, SelectQuery, Statement, Values,
};

pub struct Repository<F> {
    factory: Arc<F>,
    schema: Arc<Schema>,
}

impl<F> Clone for Repository<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            schema: Arc::clone(&self.schema),
        }
    }
}

impl<F: SessionFactory> Repository<F> {
    pub fn new(factory: Arc<F>, schema: Arc<Schema>) -> Self {
        Self { factory, schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Open a session the caller controls, to share across several calls.
    pub fn session(&self) -> Result<F::Session> {
        self.factory.open()
    }

    fn run<T>(
        &self,
        session: Option<&mut F::Session>,
        f: impl FnOnce(&mut F::Session, &Schema) -> Result<T>,
    ) -> Result<T> {
        let mut scope = SessionScope::acquire(self.factory.as_ref(), session)?;
        let result = f(&mut *scope, &self.schema);
        scope.finish(result)
    }

    /// The single row of `E` matching `query`.
    pub fn select<E: Entity>(
        &self,
        query: &SelectQuery,
        session: Option<&mut F::Session>,
    ) -> Result<Option<E>> {
        self.run(session, |session, schema| {
            let stmt = select_distinct(schema, E::TABLE, query.distinct.as_deref())?;
            select_one(session, schema, stmt, query)
        })
    }

    pub fn select_stmt<E: Entity>(
        &self,
        stmt: Select,
        query: &SelectQuery,
        session: Option<&mut F::Session>,
    ) -> Result<Option<E>> {
        self.run(session, |session, schema| {
            select_one(session, schema, stmt, query)
        })
    }

    pub fn select_all<E: Entity>(
        &self,
        query: &SelectQuery,
        session: Option<&mut F::Session>,
    ) -> Result<Vec<E>> {
        self.run(session, |session, schema| {
            let stmt = select_distinct(schema, E::TABLE, query.distinct.as_deref())?;
            select_many(session, schema, stmt, query)
        })
    }

    pub fn select_all_stmt<E: Entity>(
        &self,
        stmt: Select,
        query: &SelectQuery,
        session: Option<&mut F::Session>,
    ) -> Result<Vec<E>> {
        self.run(session, |session, schema| {
            select_many(session, schema, stmt, query)
        })
    }

    pub fn select_paginate<E: Entity>(
        &self,
        query: &SelectQuery,
        page: Option<u32>,
        per_page: Option<u32>,
        session: Option<&mut F::Session>,
    ) -> Result<(Vec<E>, Option<Pagination>)> {
        self.run(session, |session, schema| {
            let stmt = select_distinct(schema, E::TABLE, query.distinct.as_deref())?;
            select_page(session, schema, stmt, query, page, per_page)
        })
    }

    pub fn select_paginate_stmt<E: Entity>(
        &self,
        stmt: Select,
        query: &SelectQuery,
        page: Option<u32>,
        per_page: Option<u32>,
        session: Option<&mut F::Session>,
    ) -> Result<(Vec<E>, Option<Pagination>)> {
        self.run(session, |session, schema| {
            select_page(session, schema, stmt, query, page, per_page)
        })
    }

    /// Distinct tuples of `columns` of `E`'s table.
    pub fn select_distinct<E: Entity>(
        &self,
        columns: &[String],
        query: &SelectQuery,
        session: Option<&mut F::Session>,
    ) -> Result<Vec<Record>> {
        self.run(session, |session, schema| {
            let stmt = select_distinct(schema, E::TABLE, Some(columns))?;
            let stmt = build_select_stmt(schema, stmt, query)?;
            fetch_records(session, schema, stmt)
        })
    }

    pub fn add<E: Entity>(
        &self,
        values: Values,
        flush: bool,
        commit: bool,
        session: Option<&mut F::Session>,
    ) -> Result<E> {
        self.add_all(vec![values], flush, commit, session)?
            .pop()
            .ok_or_else(|| Error::RefreshFailed(E::TABLE.to_string()))
    }

    pub fn add_all<E: Entity>(
        &self,
        values: Vec<Values>,
        flush: bool,
        commit: bool,
        session: Option<&mut F::Session>,
    ) -> Result<Vec<E>> {
        self.run(session, |session, schema| {
            let table = schema.table(E::TABLE)?;
            let stmt = build_insert_stmt(schema, E::TABLE, values)?;
            mutate_all(session, table, stmt.into(), flush, commit)
        })
    }

    /// Update the single row matching `filters`.
    pub fn update<E: Entity>(
        &self,
        values: &Values,
        filters: Option<&FilterExpression>,
        flush: bool,
        commit: bool,
        session: Option<&mut F::Session>,
    ) -> Result<Option<E>> {
        self.run(session, |session, schema| {
            let table = schema.table(E::TABLE)?;
            let stmt = build_update_stmt(schema, E::TABLE, values, filters)?;
            mutate_one(session, table, stmt.into(), flush, commit, true)
        })
    }

    /// Update every row matching `filters`; true iff any row matched.
    pub fn update_all<E: Entity>(
        &self,
        values: &Values,
        filters: Option<&FilterExpression>,
        flush: bool,
        commit: bool,
        session: Option<&mut F::Session>,
    ) -> Result<bool> {
        self.run(session, |session, schema| {
            let table = schema.table(E::TABLE)?;
            let stmt = build_update_stmt(schema, E::TABLE, values, filters)?;
            mutate_any(session, table, stmt.into(), flush, commit)
        })
    }

    /// Update every row matching `filters` and return the updated rows.
    pub fn update_all_returning<E: Entity>(
        &self,
        values: &Values,
        filters: Option<&FilterExpression>,
        flush: bool,
        commit: bool,
        session: Option<&mut F::Session>,
    ) -> Result<Vec<E>> {
        self.run(session, |session, schema| {
            let table = schema.table(E::TABLE)?;
            let stmt = build_update_stmt(schema, E::TABLE, values, filters)?;
            mutate_all(session, table, stmt.into(), flush, commit)
        })
    }

    /// Delete the single row matching `filters` and return it.
    pub fn delete<E: Entity>(
        &self,
        filters: Option<&FilterExpression>,
        flush: bool,
        commit: bool,
        session: Option<&mut F::Session>,
    ) -> Result<Option<E>> {
        self.run(session, |session, schema| {
            let table = schema.table(E::TABLE)?;
            let stmt = build_delete_stmt(schema, E::TABLE, filters)?;
            mutate_one(session, table, stmt.into(), flush, commit, false)
        })
    }

    /// Delete every row matching `filters`; true iff any row matched.
    pub fn delete_all<E: Entity>(
        &self,
        filters: Option<&FilterExpression>,
        flush: bool,
        commit: bool,
        session: Option<&mut F::Session>,
    ) -> Result<bool> {
        self.run(session, |session, schema| {
            let table = schema.table(E::TABLE)?;
            let stmt = build_delete_stmt(schema, E::TABLE, filters)?;
            mutate_any(session, table, stmt.into(), flush, commit)
        })
    }

    /// Read a relation of `record` that was left lazy when it was selected.
    pub fn load_relation(
        &self,
        record: &mut Record,
        name: &str,
        session: Option<&mut F::Session>,
    ) -> Result<()> {
        self.run(session, |session, schema| {
            let (stmt, relationship) = relation_select(schema, record, name)?;
            let related = fetch_records(session, schema, stmt)?;
            attach_relation(record, relationship, related);
            Ok(())
        })
    }
}

/// Execute `select` and every follow-up statement its relationship loading
/// needs.
pub fn fetch_records<S: Session>(
    session: &mut S,
    schema: &Schema,
    select: Select,
) -> Result<Vec<Record>> {
    let mut loader = Loader::new(schema, select)?;
    while let Some(statement) = loader.next_statement() {
        let rows = session.execute(&statement)?;
        loader.feed(rows)?;
    }
    Ok(loader.finish())
}

fn select_one<S: Session, E: Entity>(
    session: &mut S,
    schema: &Schema,
    stmt: Select,
    query: &SelectQuery,
) -> Result<Option<E>> {
    let stmt = build_select_stmt(schema, stmt, query)?;
    let mut records = fetch_records(session, schema, stmt)?;
    if records.len() > 1 {
        return Err(Error::MultipleRows(records.len()));
    }
    records.pop().map(E::from_record).transpose()
}

fn select_many<S: Session, E: Entity>(
    session: &mut S,
    schema: &Schema,
    stmt: Select,
    query: &SelectQuery,
) -> Result<Vec<E>> {
    let stmt = build_select_stmt(schema, stmt, query)?;
    fetch_records(session, schema, stmt)?
        .into_iter()
        .map(E::from_record)
        .collect()
}

fn select_page<S: Session, E: Entity>(
    session: &mut S,
    schema: &Schema,
    stmt: Select,
    query: &SelectQuery,
    page: Option<u32>,
    per_page: Option<u32>,
) -> Result<(Vec<E>, Option<Pagination>)> {
    let stmt = build_select_stmt(schema, stmt, query)?;
    let (stmt, pagination) = apply_pagination(session, stmt, page, per_page)?;
    let entities = fetch_records(session, schema, stmt)?
        .into_iter()
        .map(E::from_record)
        .collect::<Result<Vec<_>>>()?;
    Ok((entities, pagination))
}

fn mutate<S: Session>(
    session: &mut S,
    table: &TableDefinition,
    statement: Statement,
) -> Result<Vec<Record>> {
    Ok(session
        .execute(&statement)?
        .into_iter()
        .map(|row| record_from_row(table, row))
        .collect())
}

fn mutate_all<S: Session, E: Entity>(
    session: &mut S,
    table: &TableDefinition,
    statement: Statement,
    flush: bool,
    commit: bool,
) -> Result<Vec<E>> {
    let mut records = mutate(session, table, statement)?;
    finish_mutation(session, table, &mut records, flush, commit)?;
    records.into_iter().map(E::from_record).collect()
}

fn mutate_one<S: Session, E: Entity>(
    session: &mut S,
    table: &TableDefinition,
    statement: Statement,
    flush: bool,
    commit: bool,
    refresh: bool,
) -> Result<Option<E>> {
    let mut records = mutate(session, table, statement)?;
    if records.len() > 1 {
        return Err(Error::MultipleRows(records.len()));
    }
    if records.is_empty() {
        return Ok(None);
    }
    let refreshed: &mut [Record] = if refresh { &mut records } else { &mut [] };
    finish_mutation(session, table, refreshed, flush, commit)?;
    records.pop().map(E::from_record).transpose()
}

fn mutate_any<S: Session>(
    session: &mut S,
    table: &TableDefinition,
    statement: Statement,
    flush: bool,
    commit: bool,
) -> Result<bool> {
    if mutate(session, table, statement)?.is_empty() {
        return Ok(false);
    }
    finish_mutation(session, table, &mut [], flush, commit)?;
    Ok(true)
}

/// Apply the flush and commit flags, then reload `records` when either was
/// set so that columns computed by the database are visible.
fn finish_mutation<S: Session>(
    session: &mut S,
    table: &TableDefinition,
    records: &mut [Record],
    flush: bool,
    commit: bool,
) -> Result<()> {
    if flush {
        session.flush()?;
    }
    if commit {
        session.commit()?;
    }
    if flush || commit {
        for record in records.iter_mut() {
            session.refresh(table, record)?;
        }
    }
    Ok(())
}
