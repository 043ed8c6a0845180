//! Suspending repository facade, the counterpart of
//! [`Repository`](crate::repository::Repository).
//!
//! Statements are built by the same builders and loaded by the same
//! [`Loader`]; only the session calls suspend. Rows refreshed after a
//! mutation are reloaded concurrently.

use futures::future::try_join_all;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::filter::FilterExpression;
use crate::loader::{attach_relation, relation_select, Loader};
use crate::pagination::{async_apply_pagination, Pagination};
use crate::record::{Entity, Record};
use crate::schema::{Schema, TableDefinition};
use crate::session::{record_from_row, AsyncSession, AsyncSessionFactory, AsyncSessionScope};
use crate::statement::{
    build_delete_stmt, build_insert_stmt, build_select_stmt, build_update_stmt, select_distinct,
    Select, SelectQuery, Statement, Values,
};

pub struct AsyncRepository<F> {
    factory: Arc<F>,
    schema: Arc<Schema>,
}

impl<F> Clone for AsyncRepository<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            schema: Arc::clone(&self.schema),
        }
    }
}

impl<F: AsyncSessionFactory> AsyncRepository<F> {
    pub fn new(factory: Arc<F>, schema: Arc<Schema>) -> Self {
        Self { factory, schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub async fn session(&self) -> Result<F::Session> {
        self.factory.open().await
    }

    async fn scope<'a>(
        &self,
        session: Option<&'a F::Session>,
    ) -> Result<AsyncSessionScope<'a, F::Session>> {
        AsyncSessionScope::acquire(self.factory.as_ref(), session).await
    }

    pub async fn select<E: Entity>(
        &self,
        query: &SelectQuery,
        session: Option<&F::Session>,
    ) -> Result<Option<E>> {
        let stmt = select_distinct(&self.schema, E::TABLE, query.distinct.as_deref())?;
        self.select_stmt(stmt, query, session).await
    }

    pub async fn select_stmt<E: Entity>(
        &self,
        stmt: Select,
        query: &SelectQuery,
        session: Option<&F::Session>,
    ) -> Result<Option<E>> {
        let scope = self.scope(session).await?;
        let result = select_one(&*scope, &self.schema, stmt, query).await;
        scope.finish(result).await
    }

    pub async fn select_all<E: Entity>(
        &self,
        query: &SelectQuery,
        session: Option<&F::Session>,
    ) -> Result<Vec<E>> {
        let stmt = select_distinct(&self.schema, E::TABLE, query.distinct.as_deref())?;
        self.select_all_stmt(stmt, query, session).await
    }

    pub async fn select_all_stmt<E: Entity>(
        &self,
        stmt: Select,
        query: &SelectQuery,
        session: Option<&F::Session>,
    ) -> Result<Vec<E>> {
        let scope = self.scope(session).await?;
        let result = select_many(&*scope, &self.schema, stmt, query).await;
        scope.finish(result).await
    }

    pub async fn select_paginate<E: Entity>(
        &self,
        query: &SelectQuery,
        page: Option<u32>,
        per_page: Option<u32>,
        session: Option<&F::Session>,
    ) -> Result<(Vec<E>, Option<Pagination>)> {
        let stmt = select_distinct(&self.schema, E::TABLE, query.distinct.as_deref())?;
        self.select_paginate_stmt(stmt, query, page, per_page, session)
            .await
    }

    pub async fn select_paginate_stmt<E: Entity>(
        &self,
        stmt: Select,
        query: &SelectQuery,
        page: Option<u32>,
        per_page: Option<u32>,
        session: Option<&F::Session>,
    ) -> Result<(Vec<E>, Option<Pagination>)> {
        let scope = self.scope(session).await?;
        let result = select_page(&*scope, &self.schema, stmt, query, page, per_page).await;
        scope.finish(result).await
    }

    pub async fn select_distinct<E: Entity>(
        &self,
        columns: &[String],
        query: &SelectQuery,
        session: Option<&F::Session>,
    ) -> Result<Vec<Record>> {
        let stmt = select_distinct(&self.schema, E::TABLE, Some(columns))?;
        let stmt = build_select_stmt(&self.schema, stmt, query)?;
        let scope = self.scope(session).await?;
        let result = fetch_records(&*scope, &self.schema, stmt).await;
        scope.finish(result).await
    }

    pub async fn add<E: Entity>(
        &self,
        values: Values,
        flush: bool,
        commit: bool,
        session: Option<&F::Session>,
    ) -> Result<E> {
        let mut entities = self.add_all(vec![values], flush, commit, session).await?;
        entities
            .pop()
            .ok_or_else(|| Error::RefreshFailed(E::TABLE.to_string()))
    }

    pub async fn add_all<E: Entity>(
        &self,
        values: Vec<Values>,
        flush: bool,
        commit: bool,
        session: Option<&F::Session>,
    ) -> Result<Vec<E>> {
        let table = self.schema.table(E::TABLE)?;
        let stmt = build_insert_stmt(&self.schema, E::TABLE, values)?;
        let scope = self.scope(session).await?;
        let result = mutate_all(&*scope, table, stmt.into(), flush, commit).await;
        scope.finish(result).await
    }

    pub async fn update<E: Entity>(
        &self,
        values: &Values,
        filters: Option<&FilterExpression>,
        flush: bool,
        commit: bool,
        session: Option<&F::Session>,
    ) -> Result<Option<E>> {
        let table = self.schema.table(E::TABLE)?;
        let stmt = build_update_stmt(&self.schema, E::TABLE, values, filters)?;
        let scope = self.scope(session).await?;
        let result = mutate_one(&*scope, table, stmt.into(), flush, commit, true).await;
        scope.finish(result).await
    }

    pub async fn update_all<E: Entity>(
        &self,
        values: &Values,
        filters: Option<&FilterExpression>,
        flush: bool,
        commit: bool,
        session: Option<&F::Session>,
    ) -> Result<bool> {
        let table = self.schema.table(E::TABLE)?;
        let stmt = build_update_stmt(&self.schema, E::TABLE, values, filters)?;
        let scope = self.scope(session).await?;
        let result = mutate_any(&*scope, table, stmt.into(), flush, commit).await;
        scope.finish(result).await
    }

    pub async fn update_all_returning<E: Entity>(
        &self,
        values: &Values,
        filters: Option<&FilterExpression>,
        flush: bool,
        commit: bool,
        session: Option<&F::Session>,
    ) -> Result<Vec<E>> {
        let table = self.schema.table(E::TABLE)?;
        let stmt = build_update_stmt(&self.schema, E::TABLE, values, filters)?;
        let scope = self.scope(session).await?;
        let result = mutate_all(&*scope, table, stmt.into(), flush, commit).await;
        scope.finish(result).await
    }

    pub async fn delete<E: Entity>(
        &self,
        filters: Option<&FilterExpression>,
        flush: bool,
        commit: bool,
        session: Option<&F::Session>,
    ) -> Result<Option<E>> {
        let table = self.schema.table(E::TABLE)?;
        let stmt = build_delete_stmt(&self.schema, E::TABLE, filters)?;
        let scope = self.scope(session).await?;
        let result = mutate_one(&*scope, table, stmt.into(), flush, commit, false).await;
        scope.finish(result).await
    }

    pub async fn delete_all<E: Entity>(
        &self,
        filters: Option<&FilterExpression>,
        flush: bool,
        commit: bool,
        session: Option<&F::Session>,
    ) -> Result<bool> {
        let table = self.schema.table(E::TABLE)?;
        let stmt = build_delete_stmt(&self.schema, E::TABLE, filters)?;
        let scope = self.scope(session).await?;
        let result = mutate_any(&*scope, table, stmt.into(), flush, commit).await;
        scope.finish(result).await
    }

    pub async fn load_relation(
        &self,
        record: &mut Record,
        name: &str,
        session: Option<&F::Session>,
    ) -> Result<()> {
        let (stmt, relationship) = relation_select(&self.schema, record, name)?;
        let scope = self.scope(session).await?;
        let result = fetch_records(&*scope, &self.schema, stmt).await;
        let related = scope.finish(result).await?;
        attach_relation(record, relationship, related);
        Ok(())
    }
}

pub async fn fetch_records<S: AsyncSession>(
    session: &S,
    schema: &Schema,
    select: Select,
) -> Result<Vec<Record>> {
    let mut loader = Loader::new(schema, select)?;
    while let Some(statement) = loader.next_statement() {
        let rows = session.execute(&statement).await?;
        loader.feed(rows)?;
    }
    Ok(loader.finish())
}

async fn select_one<S: AsyncSession, E: Entity>(
    session: &S,
    schema: &Schema,
    stmt: Select,
    query: &SelectQuery,
) -> Result<Option<E>> {
    let stmt = build_select_stmt(schema, stmt, query)?;
    let mut records = fetch_records(session, schema, stmt).await?;
    if records.len() > 1 {
        return Err(Error::MultipleRows(records.len()));
    }
    records.pop().map(E::from_record).transpose()
}

async fn select_many<S: AsyncSession, E: Entity>(
    session: &S,
    schema: &Schema,
    stmt: Select,
    query: &SelectQuery,
) -> Result<Vec<E>> {
    let stmt = build_select_stmt(schema, stmt, query)?;
    fetch_records(session, schema, stmt)
        .await?
        .into_iter()
        .map(E::from_record)
        .collect()
}

async fn select_page<S: AsyncSession, E: Entity>(
    session: &S,
    schema: &Schema,
    stmt: Select,
    query: &SelectQuery,
    page: Option<u32>,
    per_page: Option<u32>,
) -> Result<(Vec<E>, Option<Pagination>)> {
    let stmt = build_select_stmt(schema, stmt, query)?;
    let (stmt, pagination) = async_apply_pagination(session, stmt, page, per_page).await?;
    let entities = fetch_records(session, schema, stmt)
        .await?
        .into_iter()
        .map(E::from_record)
        .collect::<Result<Vec<_>>>()?;
    Ok((entities, pagination))
}

async fn mutate<S: AsyncSession>(
    session: &S,
    table: &TableDefinition,
    statement: Statement,
) -> Result<Vec<Record>> {
    Ok(session
        .execute(&statement)
        .await?
        .into_iter()
        .map(|row| record_from_row(table, row))
        .collect())
}

/// Every affected row, refreshed when flushed or committed.
async fn mutate_all<S: AsyncSession, E: Entity>(
    session: &S,
    table: &TableDefinition,
    statement: Statement,
    flush: bool,
    commit: bool,
) -> Result<Vec<E>> {
    let mut records = mutate(session, table, statement).await?;
    finish_mutation(session, table, &mut records, flush, commit).await?;
    records.into_iter().map(E::from_record).collect()
}

/// The single affected row, if any.
async fn mutate_one<S: AsyncSession, E: Entity>(
    session: &S,
    table: &TableDefinition,
    statement: Statement,
    flush: bool,
    commit: bool,
    refresh: bool,
) -> Result<Option<E>> {
    let mut records = mutate(session, table, statement).await?;
    if records.len() > 1 {
        return Err(Error::MultipleRows(records.len()));
    }
    if records.is_empty() {
        return Ok(None);
    }
    let refreshed: &mut [Record] = if refresh { &mut records } else { &mut [] };
    finish_mutation(session, table, refreshed, flush, commit).await?;
    records.pop().map(E::from_record).transpose()
}

/// Whether any row was affected.
async fn mutate_any<S: AsyncSession>(
    session: &S,
    table: &TableDefinition,
    statement: Statement,
    flush: bool,
    commit: bool,
) -> Result<bool> {
    if mutate(session, table, statement).await?.is_empty() {
        return Ok(false);
    }
    finish_mutation(session, table, &mut [], flush, commit).await?;
    Ok(true)
}

async fn finish_mutation<S: AsyncSession>(
    session: &S,
    table: &TableDefinition,
    records: &mut [Record],
    flush: bool,
    commit: bool,
) -> Result<()> {
    if flush {
        session.flush().await?;
    }
    if commit {
        session.commit().await?;
    }
    if flush || commit {
        try_join_all(records.iter_mut().map(|record| session.refresh(table, record))).await?;
    }
    Ok(())
}
