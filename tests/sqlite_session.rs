mod common;

use anyhow::Result;
use pretty_assertions::assert_eq;
use rusqlite::{Connection, OptionalExtension};
use sql_repo::statement::{build_delete_stmt, build_insert_stmt};
use sql_repo::{
    ColumnDefinition, DataType, Error, FilterExpression, Operator, Schema, Select, Session,
    SessionFactory, SqliteConfig, SqliteDatabase, Statement, TableDefinition, Value,
};
use tempfile::NamedTempFile;

use common::values;

fn measurements_schema() -> Schema {
    Schema::new().add_table(
        TableDefinition::new("measurements")
            .with_column(ColumnDefinition::new("id", DataType::Integer).primary_key())
            .with_column(ColumnDefinition::new("weight", DataType::Real))
            .with_column(ColumnDefinition::new("payload", DataType::Blob))
            .with_column(ColumnDefinition::new("checked", DataType::Boolean)),
    )
}

// The file must outlive every connection opened on it.
fn temp_database(schema: Schema) -> Result<(SqliteDatabase, NamedTempFile)> {
    let file = NamedTempFile::new()?;
    let config = SqliteConfig::new(file.path().to_string_lossy().into_owned(), schema);
    let database = SqliteDatabase::new(config);
    database.create_database()?;
    Ok((database, file))
}

#[test]
fn test_create_database_creates_tables_and_indexes() -> Result<()> {
    let (database, file) = temp_database(common::schema())?;
    // Idempotent.
    database.create_database()?;

    let conn = Connection::open(file.path())?;
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    assert_eq!(tables, vec!["addresses", "cities", "users"]);

    let index: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name = 'idx_users_email'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    assert_eq!(index.as_deref(), Some("idx_users_email"));
    Ok(())
}

#[test]
fn test_values_round_trip_through_columns() -> Result<()> {
    let (database, _file) = temp_database(measurements_schema())?;
    let schema = database.schema();
    let mut session = database.open()?;

    let insert = build_insert_stmt(
        &schema,
        "measurements",
        vec![values([
            ("weight", Value::Real(2.5)),
            ("payload", Value::Blob(vec![0, 159, 146, 150])),
            ("checked", Value::Boolean(true)),
        ])],
    )?;
    let rows = session.execute(&insert.into())?;
    assert_eq!(
        rows,
        vec![vec![
            Value::Integer(1),
            Value::Real(2.5),
            Value::Blob(vec![0, 159, 146, 150]),
            Value::Integer(1),
        ]]
    );

    // Selected rows are decoded by column type.
    let select = Select::new(schema.table("measurements")?);
    let records = sql_repo::repository::fetch_records(&mut session, &schema, select)?;
    assert_eq!(records[0].get("checked"), Some(&Value::Boolean(true)));
    assert_eq!(records[0].try_get::<Option<f64>>("weight")?, Some(2.5));
    assert_eq!(records[0].try_get::<Vec<u8>>("payload")?, vec![0, 159, 146, 150]);
    session.close()?;
    Ok(())
}

#[test]
fn test_transaction_begins_lazily_and_commits() -> Result<()> {
    let (database, _file) = temp_database(common::schema())?;
    let schema = database.schema();

    let mut session = database.open()?;
    assert!(!session.in_transaction());
    let insert = build_insert_stmt(&schema, "cities", vec![values([("name", Value::from("Lille"))])])?;
    session.execute(&insert.into())?;
    assert!(session.in_transaction());
    session.commit()?;
    assert!(!session.in_transaction());
    session.close()?;

    let mut reader = database.open()?;
    let count = reader.scalar(&Statement::Select(Select::new(schema.table("cities")?).count()))?;
    assert_eq!(count, Some(Value::Integer(1)));
    reader.close()?;
    Ok(())
}

#[test]
fn test_dropped_session_discards_uncommitted_work() -> Result<()> {
    let (database, _file) = temp_database(common::schema())?;
    let schema = database.schema();

    {
        let mut session = database.open()?;
        let insert =
            build_insert_stmt(&schema, "cities", vec![values([("name", Value::from("Brest"))])])?;
        session.execute(&insert.into())?;
    }

    let mut session = database.open()?;
    let count = session.scalar(&Statement::Select(Select::new(schema.table("cities")?).count()))?;
    assert_eq!(count, Some(Value::Integer(0)));
    Ok(())
}

#[test]
fn test_foreign_keys_are_enforced() -> Result<()> {
    let (database, _file) = temp_database(common::schema())?;
    let schema = database.schema();
    let mut session = database.open()?;

    let insert = build_insert_stmt(
        &schema,
        "addresses",
        vec![values([
            ("user_id", Value::from(99)),
            ("street", Value::from("nowhere")),
        ])],
    )?;
    let err = session.execute(&insert.into()).unwrap_err();
    assert!(matches!(err, Error::Sqlite(_)));
    session.rollback()?;

    let delete = build_delete_stmt(
        &schema,
        "users",
        Some(&FilterExpression::new().with("id", Operator::Equal, 99)),
    )?;
    assert!(session.execute(&delete.into())?.is_empty());
    session.close()?;
    Ok(())
}

#[test]
fn test_like_is_case_sensitive() -> Result<()> {
    let (_dir, database) = common::database(true)?;
    let schema = database.schema();
    let mut session = database.open()?;

    let like = |pattern: &str| {
        Select::new(schema.table("users").expect("users table")).apply_filters(
            &schema,
            Some(&FilterExpression::new().with("email", Operator::Like, pattern)),
            false,
        )
    };
    let sensitive = sql_repo::repository::fetch_records(&mut session, &schema, like("alice%")?)?;
    assert_eq!(sensitive.len(), 1);

    let ilike = Select::new(schema.table("users")?).apply_filters(
        &schema,
        Some(&FilterExpression::new().with("email", Operator::ILike, "alice%")),
        false,
    )?;
    let insensitive = sql_repo::repository::fetch_records(&mut session, &schema, ilike)?;
    assert_eq!(insensitive.len(), 2);
    session.close()?;
    Ok(())
}
