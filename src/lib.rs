//! Generic repositories over SQLite with declarative filters and
//! relationship loading.
//!
//! # Intention
//!
//! - Provide select, insert, update and delete helpers parameterized by
//!   entity type, usable from blocking and async code alike.
//! - Express filters as data: `{column -> {operator -> value}}` mappings
//!   compiled into SQL predicates.
//! - Control how relationships are loaded (joined, select-in, subquery,
//!   lazy, no-load, raise, contains-eager) per call.
//! - Paginate with a count query and offset/limit.
//!
//! # Architectural Boundaries
//!
//! - Statement building, filter compilation and relationship loading depend
//!   only on the [`Session`] / [`AsyncSession`] interface, never on rusqlite.
//! - The [`sqlite`] module is the one concrete engine adapter.
//! - No query language of its own and no transaction guarantees beyond the
//!   engine's.

pub mod async_repository;
pub mod error;
pub mod expr;
pub mod filter;
pub mod loader;
pub mod observer;
pub mod operator;
pub mod pagination;
pub mod record;
pub mod relationship;
pub mod repository;
pub mod schema;
pub mod seed;
pub mod session;
pub mod sql;
pub mod sqlite;
pub mod statement;
pub mod value;

pub use async_repository::AsyncRepository;
pub use error::{Error, Result};
pub use filter::{Field, FilterExpression, Operand};
pub use observer::{QueryObserver, TracingObserver};
pub use operator::Operator;
pub use pagination::Pagination;
pub use record::{Entity, FromValue, Raw, Record, Related};
pub use relationship::{
    LoadingTechnique, RelationshipOption, RelationshipOptions, MAX_RELATIONSHIP_DEPTH,
};
pub use repository::Repository;
pub use schema::{
    ColumnDefinition, DataType, ForeignKey, IndexDefinition, RelationshipDefinition, Schema,
    TableDefinition,
};
pub use session::{AsyncSession, AsyncSessionFactory, Session, SessionFactory};
pub use sqlite::{AsyncSqliteDatabase, AsyncSqliteSession, SqliteConfig, SqliteDatabase, SqliteSession};
pub use statement::{Direction, Select, SelectQuery, Statement, Values};
pub use value::Value;
