//! The narrow session interface the repositories are written against.
//!
//! A session owns one unit of work on one connection. Repositories either
//! reuse a caller-supplied session or open a scoped one that is released on
//! every exit path and rolled back when the operation fails.

use async_trait::async_trait;
use std::ops::{Deref, DerefMut};
use tracing::error;

use crate::error::{Error, Result};
use crate::record::Record;
use crate::schema::TableDefinition;
use crate::statement::{Select, Statement};
use crate::value::{Row, Value};

/// Blocking session.
pub trait Session {
    /// Execute `statement` and return the rows it produces.
    fn execute(&mut self, statement: &Statement) -> Result<Vec<Row>>;

    /// First column of the first row.
    fn scalar(&mut self, statement: &Statement) -> Result<Option<Value>> {
        let rows = self.execute(statement)?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next()))
    }

    /// Mark the end of a batch of pending statements.
    fn flush(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Reload the column values of `record` from the database.
    fn refresh(&mut self, table: &TableDefinition, record: &mut Record) -> Result<()> {
        let select = Select::by_primary_key(table, record)?;
        let row = self
            .execute(&Statement::Select(select))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::RefreshFailed(table.name.clone()))?;
        record.refresh_from(record_from_row(table, row));
        Ok(())
    }

    /// Release the session, discarding uncommitted work.
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

pub trait SessionFactory {
    type Session: Session;

    fn open(&self) -> Result<Self::Session>;
}

/// A session that is either borrowed from the caller or opened for one
/// operation.
pub enum SessionScope<'a, S> {
    Borrowed(&'a mut S),
    Owned(S),
}

impl<'a, S: Session> SessionScope<'a, S> {
    pub fn acquire<F>(factory: &F, session: Option<&'a mut S>) -> Result<Self>
    where
        F: SessionFactory<Session = S>,
    {
        match session {
            Some(session) => Ok(SessionScope::Borrowed(session)),
            None => factory.open().map(SessionScope::Owned),
        }
    }

    /// Release an owned session. Failed operations roll it back first.
    pub fn finish<T>(self, result: Result<T>) -> Result<T> {
        let SessionScope::Owned(mut session) = self else {
            return result;
        };
        match result {
            Ok(value) => {
                session.close()?;
                Ok(value)
            }
            Err(err) => {
                error!(error = %err, "session operation failed, rolling back");
                if let Err(rollback) = session.rollback() {
                    error!(error = %rollback, "rollback failed");
                }
                let _ = session.close();
                Err(err)
            }
        }
    }
}

impl<S> Deref for SessionScope<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        match self {
            SessionScope::Borrowed(session) => session,
            SessionScope::Owned(session) => session,
        }
    }
}

impl<S> DerefMut for SessionScope<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        match self {
            SessionScope::Borrowed(session) => session,
            SessionScope::Owned(session) => session,
        }
    }
}

/// Suspending session.
#[async_trait]
pub trait AsyncSession: Send + Sync {
    async fn execute(&self, statement: &Statement) -> Result<Vec<Row>>;

    async fn scalar(&self, statement: &Statement) -> Result<Option<Value>> {
        let rows = self.execute(statement).await?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next()))
    }

    async fn flush(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    async fn refresh(&self, table: &TableDefinition, record: &mut Record) -> Result<()> {
        let select = Select::by_primary_key(table, record)?;
        let row = self
            .execute(&Statement::Select(select))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::RefreshFailed(table.name.clone()))?;
        record.refresh_from(record_from_row(table, row));
        Ok(())
    }

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait AsyncSessionFactory: Send + Sync {
    type Session: AsyncSession;

    async fn open(&self) -> Result<Self::Session>;
}

pub enum AsyncSessionScope<'a, S> {
    Borrowed(&'a S),
    Owned(S),
}

impl<'a, S: AsyncSession> AsyncSessionScope<'a, S> {
    pub async fn acquire<F>(factory: &F, session: Option<&'a S>) -> Result<Self>
    where
        F: AsyncSessionFactory<Session = S>,
    {
        match session {
            Some(session) => Ok(AsyncSessionScope::Borrowed(session)),
            None => factory.open().await.map(AsyncSessionScope::Owned),
        }
    }

    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        let AsyncSessionScope::Owned(session) = self else {
            return result;
        };
        match result {
            Ok(value) => {
                session.close().await?;
                Ok(value)
            }
            Err(err) => {
                error!(error = %err, "session operation failed, rolling back");
                if let Err(rollback) = session.rollback().await {
                    error!(error = %rollback, "rollback failed");
                }
                let _ = session.close().await;
                Err(err)
            }
        }
    }
}

impl<S> Deref for AsyncSessionScope<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        match self {
            AsyncSessionScope::Borrowed(session) => session,
            AsyncSessionScope::Owned(session) => session,
        }
    }
}

/// Build a record from a row of `table` in column order.
pub(crate) fn record_from_row(table: &TableDefinition, row: Row) -> Record {
    Record::from_values(
        table.name.clone(),
        table
            .columns
            .iter()
            .zip(row)
            .map(|(column, value)| (column.name.clone(), column.data_type.decode(value)))
            .collect(),
    )
}
