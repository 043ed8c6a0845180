mod common;

use anyhow::Result;
use pretty_assertions::assert_eq;
use sql_repo::seed::{init_tables_from_json_files, load_seed_file, ordered_tables, seed_file_path};
use sql_repo::{
    AsyncSqliteDatabase, SelectQuery, Session, SessionFactory, SqliteConfig, SqliteDatabase, Value,
};

use common::{schema, write_seed_files, Address, City, User};

#[test]
fn test_tables_are_ordered_parents_first() -> Result<()> {
    let schema = schema();
    let names: Vec<&str> = ordered_tables(&schema, &["addresses", "users", "cities"])?
        .into_iter()
        .map(|table| table.name.as_str())
        .collect();
    assert_eq!(names, vec!["users", "cities", "addresses"]);

    // Tables outside the requested set do not pull in their parents.
    let names: Vec<&str> = ordered_tables(&schema, &["addresses"])?
        .into_iter()
        .map(|table| table.name.as_str())
        .collect();
    assert_eq!(names, vec!["addresses"]);
    Ok(())
}

#[test]
fn test_seed_files_are_read_by_column_type() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let schema = schema();
    let users = schema.table("users")?;

    assert_eq!(seed_file_path(dir.path(), users), dir.path().join("USERS.json"));
    assert_eq!(load_seed_file(dir.path(), users)?, None);

    std::fs::write(
        dir.path().join("USERS.json"),
        r#"[{"id": 7, "email": "h@x.com", "is_active": 0, "first_name": null}]"#,
    )?;
    let rows = load_seed_file(dir.path(), users)?.expect("seed file exists");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&Value::Integer(7)));
    assert_eq!(rows[0].get("is_active"), Some(&Value::Boolean(false)));
    assert_eq!(rows[0].get("first_name"), Some(&Value::Null));

    std::fs::write(dir.path().join("USERS.json"), r#"[{"nickname": "h"}]"#)?;
    assert!(load_seed_file(dir.path(), users).is_err());
    Ok(())
}

#[test]
fn test_initialize_seeds_every_table() -> Result<()> {
    let (_dir, repo) = common::repository(true)?;

    let users: Vec<User> = repo.select_all(&SelectQuery::new(), None)?;
    let cities: Vec<City> = repo.select_all(&SelectQuery::new(), None)?;
    let addresses: Vec<Address> = repo.select_all(&SelectQuery::new(), None)?;
    assert_eq!((users.len(), cities.len(), addresses.len()), (3, 2, 3));
    assert!(!users.iter().find(|user| user.id == 2).expect("bob").is_active);
    Ok(())
}

#[test]
fn test_reseeding_replaces_rows() -> Result<()> {
    let (dir, database) = common::database(true)?;
    let seeds = dir.path().join("seeds");
    let schema = database.schema();

    std::fs::write(seeds.join("CITIES.json"), r#"[{"id": 1, "name": "Lyon"}]"#)?;
    std::fs::write(
        seeds.join("ADDRESSES.json"),
        r#"[{"id": 9, "user_id": 2, "city_id": 1, "street": "9 rue Neuve"}]"#,
    )?;

    let mut session = database.open()?;
    let seeded = init_tables_from_json_files(&mut session, &schema, &seeds, &["cities", "addresses"])?;
    assert_eq!(seeded.len(), 2);
    session.close()?;

    let repo = sql_repo::Repository::new(std::sync::Arc::new(database), schema);
    let cities: Vec<City> = repo.select_all(&SelectQuery::new(), None)?;
    assert_eq!(cities, vec![City { id: 1, name: "Lyon".to_string() }]);
    let addresses: Vec<Address> = repo.select_all(&SelectQuery::new(), None)?;
    assert_eq!(addresses.iter().map(|a| a.id).collect::<Vec<_>>(), vec![9]);
    // Not part of the reseed.
    let users: Vec<User> = repo.select_all(&SelectQuery::new(), None)?;
    assert_eq!(users.len(), 3);
    Ok(())
}

#[test]
fn test_missing_seed_directory_only_creates_tables() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = SqliteConfig::new(
        dir.path().join("plain.db").to_string_lossy().into_owned(),
        schema(),
    );
    config.ini = true;
    let database = SqliteDatabase::new(config);
    database.initialize()?;

    let mut session = database.open()?;
    let rows = session.execute(&sql_repo::Statement::Select(sql_repo::Select::new(
        database.schema().table("users")?,
    )))?;
    assert!(rows.is_empty());
    session.close()?;
    Ok(())
}

#[tokio::test]
async fn test_async_initialize_seeds_tables() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let seeds = dir.path().join("seeds");
    std::fs::create_dir(&seeds)?;
    write_seed_files(&seeds)?;

    let config = SqliteConfig::new(
        dir.path().join("async.db").to_string_lossy().into_owned(),
        schema(),
    )
    .with_seed_dir(&seeds);
    let database = AsyncSqliteDatabase::new(SqliteDatabase::new(config));
    database.initialize().await?;
    // Seeding twice gives the same content.
    database.initialize().await?;

    let schema = database.schema();
    let repo = sql_repo::AsyncRepository::new(std::sync::Arc::new(database), schema);
    let addresses: Vec<Address> = repo.select_all(&SelectQuery::new(), None).await?;
    assert_eq!(addresses.len(), 3);
    Ok(())
}
