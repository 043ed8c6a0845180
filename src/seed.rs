//! Table seeding from JSON files.
//!
//! Each table is read from `<dir>/<TABLE_NAME_UPPER>.json`, a JSON array of
//! objects keyed by column name. Tables with a seed file are emptied children
//! first, then filled parents first so that foreign keys hold throughout.

use indexmap::IndexMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::Result;
use crate::schema::{DataType, Schema, TableDefinition};
use crate::session::{AsyncSession, Session};
use crate::statement::{Delete, Insert, Statement, Values};
use crate::value::Value;

/// The tables named in `names`, ordered so that every table comes after the
/// tables its foreign keys reference.
pub fn ordered_tables<'s>(schema: &'s Schema, names: &[&str]) -> Result<Vec<&'s TableDefinition>> {
    let wanted: HashSet<&str> = names.iter().copied().collect();
    let mut ordered = Vec::with_capacity(names.len());
    let mut visited = HashSet::new();

    for name in names {
        visit(schema, name, &wanted, &mut visited, &mut ordered)?;
    }
    Ok(ordered)
}

fn visit<'s>(
    schema: &'s Schema,
    name: &str,
    wanted: &HashSet<&str>,
    visited: &mut HashSet<String>,
    ordered: &mut Vec<&'s TableDefinition>,
) -> Result<()> {
    if !visited.insert(name.to_string()) {
        return Ok(());
    }
    let table = schema.table(name)?;
    for fk in &table.foreign_keys {
        if fk.foreign_table != table.name && wanted.contains(fk.foreign_table.as_str()) {
            visit(schema, &fk.foreign_table, wanted, visited, ordered)?;
        }
    }
    ordered.push(table);
    Ok(())
}

/// Path of the seed file for `table` under `dir`.
pub fn seed_file_path(dir: &Path, table: &TableDefinition) -> PathBuf {
    dir.join(format!("{}.json", table.name.to_uppercase()))
}

/// Read the seed rows of `table`, or `None` when the file does not exist.
pub fn load_seed_file(dir: &Path, table: &TableDefinition) -> Result<Option<Vec<Values>>> {
    let path = seed_file_path(dir, table);
    if !path.exists() {
        debug!(path = %path.display(), "no seed file");
        return Ok(None);
    }

    let content = std::fs::read_to_string(&path)?;
    let objects: Vec<serde_json::Map<String, serde_json::Value>> = serde_json::from_str(&content)?;

    objects
        .into_iter()
        .map(|object| {
            object
                .into_iter()
                .map(|(column, value)| {
                    let data_type = table.column(&column)?.data_type;
                    Ok((column, json_value(data_type, value)))
                })
                .collect::<Result<IndexMap<_, _>>>()
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn json_value(data_type: DataType, value: serde_json::Value) -> Value {
    match (data_type, value) {
        (DataType::Real, serde_json::Value::Number(n)) => {
            n.as_f64().map_or(Value::Null, Value::Real)
        }
        (DataType::Boolean, serde_json::Value::Number(n)) => match n.as_i64() {
            Some(v) => Value::Boolean(v != 0),
            None => Value::Null,
        },
        (_, value) => Value::from(value),
    }
}

/// Seed files of `tables`, skipping tables without one.
fn load_all<'s>(
    dir: &Path,
    tables: &[&'s TableDefinition],
) -> Result<Vec<(&'s TableDefinition, Vec<Values>)>> {
    let mut seeds = Vec::new();
    for &table in tables {
        if let Some(rows) = load_seed_file(dir, table)? {
            seeds.push((table, rows));
        }
    }
    Ok(seeds)
}

/// Seed `names` from JSON files in `dir` and commit once all tables are
/// filled. Tables without a seed file are left untouched.
pub fn init_tables_from_json_files<'s, S: Session>(
    session: &mut S,
    schema: &'s Schema,
    dir: &Path,
    names: &[&str],
) -> Result<Vec<&'s TableDefinition>> {
    let tables = ordered_tables(schema, names)?;
    let seeds = load_all(dir, &tables)?;

    for (table, _) in seeds.iter().rev() {
        session.execute(&Statement::Delete(Delete::all(table)))?;
    }

    for (table, rows) in seeds {
        let count = rows.len();
        if !rows.is_empty() {
            session.execute(&Statement::Insert(Insert::unreturning(table, rows)?))?;
        }
        info!(table = %table.name, rows = count, dir = %dir.display(), "initialized table from seed file");
    }
    session.commit()?;

    Ok(tables)
}

pub async fn async_init_tables_from_json_files<'s, S: AsyncSession>(
    session: &S,
    schema: &'s Schema,
    dir: &Path,
    names: &[&str],
) -> Result<Vec<&'s TableDefinition>> {
    let tables = ordered_tables(schema, names)?;
    let seeds = load_all(dir, &tables)?;

    for (table, _) in seeds.iter().rev() {
        session.execute(&Statement::Delete(Delete::all(table))).await?;
    }

    for (table, rows) in seeds {
        let count = rows.len();
        if !rows.is_empty() {
            session
                .execute(&Statement::Insert(Insert::unreturning(table, rows)?))
                .await?;
        }
        info!(table = %table.name, rows = count, dir = %dir.display(), "initialized table from seed file");
    }
    session.commit().await?;

    Ok(tables)
}
