//! Materialized rows and the mapping from rows to application entities.

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::marker::PhantomData;
use std::ops::Deref;

use crate::error::{Error, Result};
use crate::value::Value;

/// State of a relationship slot on a [`Record`].
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    /// Loading was disabled; reads as empty.
    NotLoaded,
    /// Deferred until fetched through the repository.
    Lazy,
    /// Reading the relation is an error.
    Raise,
    One(Option<Box<Record>>),
    Many(Vec<Record>),
}

/// One row of a table with the relations loaded alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    table: String,
    values: IndexMap<String, Value>,
    relations: IndexMap<String, Related>,
}

impl Record {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            values: IndexMap::new(),
            relations: IndexMap::new(),
        }
    }

    pub fn from_values(table: impl Into<String>, values: IndexMap<String, Value>) -> Self {
        Self {
            table: table.into(),
            values,
            relations: IndexMap::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn values(&self) -> &IndexMap<String, Value> {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Read `column` as `T`. A missing column reads as null.
    pub fn try_get<T: FromValue>(&self, column: &str) -> Result<T> {
        let value = self.values.get(column).unwrap_or(&Value::Null);
        T::from_value(value).map_err(|err| match err {
            Error::Conversion(reason) => Error::Conversion(format!("{}.{column}: {reason}", self.table)),
            other => other,
        })
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn relation(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }

    pub fn relations(&self) -> &IndexMap<String, Related> {
        &self.relations
    }

    pub fn set_relation(&mut self, name: impl Into<String>, related: Related) {
        self.relations.insert(name.into(), related);
    }

    pub(crate) fn relation_mut(&mut self, name: &str) -> Option<&mut Related> {
        self.relations.get_mut(name)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        matches!(
            self.relations.get(name),
            Some(Related::One(_) | Related::Many(_))
        )
    }

    /// The related row of a to-one relation.
    pub fn one(&self, name: &str) -> Result<Option<&Record>> {
        match self.relations.get(name) {
            Some(Related::One(record)) => Ok(record.as_deref()),
            Some(Related::Many(records)) => Ok(records.first()),
            Some(Related::NotLoaded) => Ok(None),
            Some(Related::Raise) => Err(Error::RaiseLoad(name.to_string())),
            Some(Related::Lazy) | None => Err(Error::RelationNotLoaded(name.to_string())),
        }
    }

    /// The related rows of a to-many relation.
    pub fn many(&self, name: &str) -> Result<&[Record]> {
        match self.relations.get(name) {
            Some(Related::Many(records)) => Ok(records),
            Some(Related::One(Some(record))) => Ok(std::slice::from_ref(record.as_ref())),
            Some(Related::One(None) | Related::NotLoaded) => Ok(&[]),
            Some(Related::Raise) => Err(Error::RaiseLoad(name.to_string())),
            Some(Related::Lazy) | None => Err(Error::RelationNotLoaded(name.to_string())),
        }
    }

    /// Overwrite column values with `fresh`, keeping loaded relations.
    pub(crate) fn refresh_from(&mut self, fresh: Record) {
        self.values = fresh.values;
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let loaded = self
            .relations
            .iter()
            .filter(|(_, related)| matches!(related, Related::One(_) | Related::Many(_)));
        let mut map = serializer.serialize_map(None)?;
        for (column, value) in &self.values {
            map.serialize_entry(column, value)?;
        }
        for (name, related) in loaded {
            match related {
                Related::One(record) => map.serialize_entry(name, &record)?,
                Related::Many(records) => map.serialize_entry(name, records)?,
                _ => {}
            }
        }
        map.end()
    }
}

/// Conversion from a column value.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch(expected: &str, value: &Value) -> Error {
    Error::Conversion(format!("expected {expected}, found {value:?}"))
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| mismatch("integer", value))
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        let wide = i64::from_value(value)?;
        i32::try_from(wide).map_err(|_| mismatch("32-bit integer", value))
    }
}

impl FromValue for u32 {
    fn from_value(value: &Value) -> Result<Self> {
        let wide = i64::from_value(value)?;
        u32::try_from(wide).map_err(|_| mismatch("unsigned 32-bit integer", value))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch("real", value))
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch("boolean", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| mismatch("text", value))
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Blob(bytes) => Ok(bytes.clone()),
            other => Err(mismatch("blob", other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

/// An application type mapped to a table.
pub trait Entity: Sized {
    const TABLE: &'static str;

    fn from_record(record: Record) -> Result<Self>;
}

/// The untyped [`Record`] of `E`'s table.
pub struct Raw<E> {
    record: Record,
    entity: PhantomData<fn() -> E>,
}

impl<E> Raw<E> {
    pub fn into_record(self) -> Record {
        self.record
    }
}

impl<E: Entity> Entity for Raw<E> {
    const TABLE: &'static str = E::TABLE;

    fn from_record(record: Record) -> Result<Self> {
        Ok(Self {
            record,
            entity: PhantomData,
        })
    }
}

impl<E> Deref for Raw<E> {
    type Target = Record;

    fn deref(&self) -> &Record {
        &self.record
    }
}

impl<E> std::fmt::Debug for Raw<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Raw").field(&self.record).finish()
    }
}

impl<E> Clone for Raw<E> {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
            entity: PhantomData,
        }
    }
}
