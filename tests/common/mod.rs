#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use indexmap::IndexMap;
use serde_json::json;
use sql_repo::schema::DefaultValue;
use sql_repo::{
    ColumnDefinition, DataType, Entity, ForeignKey, IndexDefinition, Record, RelationshipDefinition,
    Repository, Schema, SqliteConfig, SqliteDatabase, TableDefinition, Value, Values,
};
use tempfile::TempDir;

/// cities <- addresses -> users
pub fn schema() -> Schema {
    Schema::new()
        .add_table(
            TableDefinition::new("cities")
                .with_column(ColumnDefinition::new("id", DataType::Integer).primary_key())
                .with_column(ColumnDefinition::new("name", DataType::Text).not_null())
                .with_relationship(RelationshipDefinition::to_many(
                    "addresses",
                    "addresses",
                    "id",
                    "city_id",
                )),
        )
        .add_table(
            TableDefinition::new("users")
                .with_column(ColumnDefinition::new("id", DataType::Integer).primary_key())
                .with_column(ColumnDefinition::new("email", DataType::Text).not_null())
                .with_column(ColumnDefinition::new("first_name", DataType::Text))
                .with_column(
                    ColumnDefinition::new("is_active", DataType::Boolean)
                        .not_null()
                        .with_default(DefaultValue::Boolean(true)),
                )
                .with_index(IndexDefinition {
                    name: "idx_users_email".to_string(),
                    columns: vec!["email".to_string()],
                    unique: false,
                })
                .with_relationship(RelationshipDefinition::to_many(
                    "addresses",
                    "addresses",
                    "id",
                    "user_id",
                )),
        )
        .add_table(
            TableDefinition::new("addresses")
                .with_column(ColumnDefinition::new("id", DataType::Integer).primary_key())
                .with_column(ColumnDefinition::new("user_id", DataType::Integer).not_null())
                .with_column(ColumnDefinition::new("city_id", DataType::Integer))
                .with_column(ColumnDefinition::new("street", DataType::Text).not_null())
                .with_foreign_key(ForeignKey::new("user_id", "users", "id"))
                .with_foreign_key(ForeignKey::new("city_id", "cities", "id"))
                .with_relationship(RelationshipDefinition::to_one("user", "users", "user_id", "id"))
                .with_relationship(RelationshipDefinition::to_one("city", "cities", "city_id", "id")),
        )
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub first_name: Option<String>,
    pub is_active: bool,
}

impl Entity for User {
    const TABLE: &'static str = "users";

    fn from_record(record: Record) -> sql_repo::Result<Self> {
        Ok(Self {
            id: record.try_get("id")?,
            email: record.try_get("email")?,
            first_name: record.try_get("first_name")?,
            is_active: record.try_get("is_active")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub id: i64,
    pub user_id: i64,
    pub city_id: Option<i64>,
    pub street: String,
}

impl Entity for Address {
    const TABLE: &'static str = "addresses";

    fn from_record(record: Record) -> sql_repo::Result<Self> {
        Ok(Self {
            id: record.try_get("id")?,
            user_id: record.try_get("user_id")?,
            city_id: record.try_get("city_id")?,
            street: record.try_get("street")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct City {
    pub id: i64,
    pub name: String,
}

impl Entity for City {
    const TABLE: &'static str = "cities";

    fn from_record(record: Record) -> sql_repo::Result<Self> {
        Ok(Self {
            id: record.try_get("id")?,
            name: record.try_get("name")?,
        })
    }
}

/// Build a values payload from `(column, value)` pairs.
pub fn values<I, V>(pairs: I) -> Values
where
    I: IntoIterator<Item = (&'static str, V)>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(column, value)| (column.to_string(), value.into()))
        .collect::<IndexMap<_, _>>()
}

/// Write the fixture data as seed files into `dir`.
pub fn write_seed_files(dir: &Path) -> Result<()> {
    let users = json!([
        {"id": 1, "email": "alice@x.com", "first_name": "Alice", "is_active": true},
        {"id": 2, "email": "bob@x.com", "first_name": "Bob", "is_active": false},
        {"id": 3, "email": "Alice@X.com", "first_name": null, "is_active": true},
    ]);
    let cities = json!([
        {"id": 1, "name": "Lyon"},
        {"id": 2, "name": "Nantes"},
    ]);
    let addresses = json!([
        {"id": 1, "user_id": 1, "city_id": 1, "street": "1 rue de la Paix"},
        {"id": 2, "user_id": 1, "city_id": 2, "street": "2 quai des Chartrons"},
        {"id": 3, "user_id": 2, "city_id": 1, "street": "3 place Bellecour"},
    ]);

    std::fs::write(dir.join("USERS.json"), serde_json::to_string(&users)?)?;
    std::fs::write(dir.join("CITIES.json"), serde_json::to_string(&cities)?)?;
    std::fs::write(dir.join("ADDRESSES.json"), serde_json::to_string(&addresses)?)?;
    Ok(())
}

/// A fresh database file in its own temporary directory. The directory must
/// outlive the database.
pub fn database(seeded: bool) -> Result<(TempDir, SqliteDatabase)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("test.db");
    let mut config = SqliteConfig::new(path.to_string_lossy().into_owned(), schema());

    if seeded {
        let seeds = dir.path().join("seeds");
        std::fs::create_dir(&seeds)?;
        write_seed_files(&seeds)?;
        config = config.with_seed_dir(seeds);
    }

    let database = SqliteDatabase::new(config);
    database.initialize()?;
    Ok((dir, database))
}

pub fn repository(seeded: bool) -> Result<(TempDir, Repository<SqliteDatabase>)> {
    let (dir, database) = database(seeded)?;
    let schema = database.schema();
    Ok((dir, Repository::new(Arc::new(database), schema)))
}
