//! SQLite adapter: configuration, connections and sessions.

use async_trait::async_trait;
use rusqlite::types::{FromSql, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::observer::{QueryObserver, TracingObserver};
use crate::schema::Schema;
use crate::seed::{async_init_tables_from_json_files, init_tables_from_json_files, ordered_tables};
use crate::session::{AsyncSession, AsyncSessionFactory, Session, SessionFactory};
use crate::sql::{create_index_sql, create_table_sql, render};
use crate::statement::Statement;
use crate::value::{Row, Value};

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(v) => ToSqlOutput::Borrowed(ValueRef::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Borrowed(ValueRef::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
            Value::Boolean(v) => ToSqlOutput::Borrowed(ValueRef::Integer(i64::from(*v))),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::Integer(v),
            ValueRef::Real(v) => Value::Real(v),
            ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
            ValueRef::Blob(v) => Value::Blob(v.to_vec()),
        })
    }
}

/// SQLite configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SqliteConfig {
    /// Path to the SQLite database file
    pub db_path: String,
    /// Schema definition for the database
    pub schema: Schema,
    pub busy_timeout: Duration,
    pub foreign_keys: bool,
    /// Seed tables from JSON files when the database is initialized
    pub ini: bool,
    /// Directory holding `<TABLE>.json` seed files
    pub init_database_dir_json: Option<PathBuf>,
}

impl SqliteConfig {
    /// Create a new SQLite config with path and schema
    pub fn new(db_path: impl Into<String>, schema: Schema) -> Self {
        Self {
            db_path: db_path.into(),
            schema,
            busy_timeout: Duration::from_secs(5),
            foreign_keys: true,
            ini: false,
            init_database_dir_json: None,
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn with_foreign_keys(mut self, foreign_keys: bool) -> Self {
        self.foreign_keys = foreign_keys;
        self
    }

    /// Seed the database from `dir` on [`SqliteDatabase::initialize`].
    pub fn with_seed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ini = true;
        self.init_database_dir_json = Some(dir.into());
        self
    }
}

/// Opens sessions on one SQLite database file.
#[derive(Clone)]
pub struct SqliteDatabase {
    config: SqliteConfig,
    schema: Arc<Schema>,
    observer: Arc<dyn QueryObserver>,
}

impl std::fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDatabase")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SqliteDatabase {
    pub fn new(config: SqliteConfig) -> Self {
        let schema = Arc::new(config.schema.clone());
        Self {
            config,
            schema,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Replace the query observer sessions report to.
    pub fn with_observer(mut self, observer: Arc<dyn QueryObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.config.db_path)?;
        conn.busy_timeout(self.config.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", self.config.foreign_keys)?;
        // LIKE is case-sensitive; ILIKE lowers both sides.
        conn.pragma_update(None, "case_sensitive_like", true)?;
        Ok(conn)
    }

    /// Create every table and index of the schema that does not exist yet.
    pub fn create_database(&self) -> Result<()> {
        let conn = self.open_connection()?;
        let names: Vec<&str> = self.schema.tables.iter().map(|t| t.name.as_str()).collect();

        for table in ordered_tables(&self.schema, &names)? {
            debug!(table = %table.name, "creating table");
            conn.execute(&create_table_sql(table), [])?;
            for index in &table.indexes {
                conn.execute(&create_index_sql(table, index), [])?;
            }
        }
        Ok(())
    }

    /// Create the database and seed it when configured to.
    pub fn initialize(&self) -> Result<()> {
        info!(path = %self.config.db_path, "initializing sqlite database");
        self.create_database()?;

        match (&self.config.init_database_dir_json, self.config.ini) {
            (Some(dir), true) => {
                let names: Vec<&str> =
                    self.schema.tables.iter().map(|t| t.name.as_str()).collect();
                let mut session = self.open()?;
                init_tables_from_json_files(&mut session, &self.schema, dir, &names)?;
                session.close()
            }
            (None, true) => {
                warn!("seeding requested without a seed directory");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl SessionFactory for SqliteDatabase {
    type Session = SqliteSession;

    fn open(&self) -> Result<SqliteSession> {
        Ok(SqliteSession {
            conn: self.open_connection()?,
            observer: Arc::clone(&self.observer),
            in_transaction: false,
        })
    }
}

/// One connection and its open transaction, begun by the first statement.
pub struct SqliteSession {
    conn: Connection,
    observer: Arc<dyn QueryObserver>,
    in_transaction: bool,
}

impl SqliteSession {
    fn begin(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.conn.execute_batch("BEGIN")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

impl Session for SqliteSession {
    fn execute(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        self.begin()?;
        let mut result = Vec::new();

        for query in render(statement) {
            self.observer.on_query_start(&query.statement, &query.params);
            let started = Instant::now();

            let mut stmt = self.conn.prepare_cached(&query.statement)?;
            let width = stmt.column_count();
            let mut rows = stmt.query(params_from_iter(query.params.values.iter()))?;
            while let Some(row) = rows.next()? {
                result.push(
                    (0..width)
                        .map(|i| row.get::<_, Value>(i))
                        .collect::<rusqlite::Result<Row>>()?,
                );
            }

            self.observer
                .on_query_end(&query.statement, started.elapsed());
        }

        Ok(result)
    }

    fn flush(&mut self) -> Result<()> {
        // Statements are sent as they are executed.
        debug!("flush");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.in_transaction {
            self.conn.execute_batch("COMMIT")?;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if self.in_transaction {
            self.in_transaction = false;
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn close(mut self) -> Result<()> {
        self.rollback()
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "rollback on drop failed");
            }
        }
    }
}

/// Suspending front of [`SqliteDatabase`]. Connections do blocking I/O on
/// the blocking thread pool.
#[derive(Debug, Clone)]
pub struct AsyncSqliteDatabase {
    inner: Arc<SqliteDatabase>,
}

impl AsyncSqliteDatabase {
    pub fn new(database: SqliteDatabase) -> Self {
        Self {
            inner: Arc::new(database),
        }
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.inner.schema()
    }

    pub async fn create_database(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.create_database()).await?
    }

    /// Create the database, then seed it through an async session when
    /// configured to.
    pub async fn initialize(&self) -> Result<()> {
        let config = &self.inner.config;
        info!(path = %config.db_path, "initializing sqlite database");
        self.create_database().await?;

        match (&config.init_database_dir_json, config.ini) {
            (Some(dir), true) => {
                let names: Vec<&str> =
                    self.inner.schema.tables.iter().map(|t| t.name.as_str()).collect();
                let session = self.open().await?;
                let seeded =
                    async_init_tables_from_json_files(&session, &self.inner.schema, dir, &names)
                        .await;
                session.close().await?;
                seeded.map(|_| ())
            }
            (None, true) => {
                warn!("seeding requested without a seed directory");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl AsyncSessionFactory for AsyncSqliteDatabase {
    type Session = AsyncSqliteSession;

    async fn open(&self) -> Result<AsyncSqliteSession> {
        let inner = Arc::clone(&self.inner);
        let session = tokio::task::spawn_blocking(move || inner.open()).await??;
        Ok(AsyncSqliteSession {
            inner: Arc::new(Mutex::new(session)),
        })
    }
}

#[derive(Clone)]
pub struct AsyncSqliteSession {
    inner: Arc<Mutex<SqliteSession>>,
}

impl AsyncSqliteSession {
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteSession) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&mut *lock(&inner))).await?
    }
}

// The last handle passes the connection to the blocking pool, where
// `SqliteSession::drop` rolls back any open transaction.
impl Drop for AsyncSqliteSession {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) != 1 {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            handle.spawn_blocking(move || drop(inner));
        }
    }
}

fn lock(session: &Mutex<SqliteSession>) -> MutexGuard<'_, SqliteSession> {
    session
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl AsyncSession for AsyncSqliteSession {
    async fn execute(&self, statement: &Statement) -> Result<Vec<Row>> {
        let statement = statement.clone();
        self.run(move |session| session.execute(&statement)).await
    }

    async fn flush(&self) -> Result<()> {
        self.run(|session| session.flush()).await
    }

    async fn commit(&self) -> Result<()> {
        self.run(|session| session.commit()).await
    }

    async fn rollback(&self) -> Result<()> {
        self.run(|session| session.rollback()).await
    }

    async fn close(&self) -> Result<()> {
        self.run(|session| session.rollback()).await
    }
}
