//! Relationship loading options and their translation into load directives.

use indexmap::IndexMap;
use tracing::warn;

use crate::error::{Error, Result};
use crate::filter::FilterExpression;
use crate::schema::Schema;
use crate::statement::Select;

/// Option trees nested deeper than this are rejected.
pub const MAX_RELATIONSHIP_DEPTH: usize = 16;

/// How a relationship is populated when the parent rows are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingTechnique {
    /// Left outer join in the parent statement.
    Joined,
    /// Follow-up query keyed by a subquery re-running the parent select.
    Subquery,
    /// Follow-up query keyed by the parent primary keys.
    SelectIn,
    /// Loaded on demand through the repository.
    Lazy,
    /// Never loaded; reads as empty.
    NoLoad,
    /// Reading the relation is an error.
    Raise,
    /// Populated from an explicit join already on the statement.
    ContainsEager,
}

/// Loading option for one relationship.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipOption {
    pub lazy: LoadingTechnique,
    pub added_criteria: Option<FilterExpression>,
    pub children: RelationshipOptions,
}

pub type RelationshipOptions = IndexMap<String, RelationshipOption>;

impl RelationshipOption {
    pub fn new(lazy: LoadingTechnique) -> Self {
        Self {
            lazy,
            added_criteria: None,
            children: RelationshipOptions::new(),
        }
    }

    /// Restrict the related rows that are loaded.
    pub fn with_criteria(mut self, criteria: FilterExpression) -> Self {
        self.added_criteria = Some(criteria);
        self
    }

    pub fn with_child(mut self, name: impl Into<String>, child: RelationshipOption) -> Self {
        self.children.insert(name.into(), child);
        self
    }
}

/// A flattened relationship option: the relationship path from the root
/// table, how to load it and which extra criteria apply.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadDirective {
    pub path: Vec<String>,
    pub technique: LoadingTechnique,
    pub criteria: Option<FilterExpression>,
}

impl LoadDirective {
    pub fn path_name(&self) -> String {
        self.path.join(".")
    }
}

/// Attach one load directive per option node to `select`, depth-first.
pub fn apply_relationship_options(
    schema: &Schema,
    mut select: Select,
    options: Option<&RelationshipOptions>,
) -> Result<Select> {
    let Some(options) = options else {
        return Ok(select);
    };
    let table = select.table.clone();
    let mut path = Vec::new();
    collect(schema, &table, options, &mut path, &mut select.loads)?;
    Ok(select)
}

fn collect(
    schema: &Schema,
    table: &str,
    options: &RelationshipOptions,
    path: &mut Vec<String>,
    loads: &mut Vec<LoadDirective>,
) -> Result<()> {
    if path.len() >= MAX_RELATIONSHIP_DEPTH {
        return Err(Error::RelationshipDepthExceeded {
            depth: MAX_RELATIONSHIP_DEPTH,
        });
    }
    let table = schema.table(table)?;

    for (name, option) in options {
        if name.is_empty() {
            warn!(table = %table.name, "skipping relationship option with an empty name");
            continue;
        }
        let Some(relationship) = table.find_relationship(name) else {
            warn!(table = %table.name, relationship = %name, "skipping unknown relationship");
            continue;
        };

        path.push(name.clone());
        loads.push(LoadDirective {
            path: path.clone(),
            technique: option.lazy,
            criteria: option.added_criteria.clone(),
        });
        if !option.children.is_empty() {
            collect(schema, &relationship.target, &option.children, path, loads)?;
        }
        path.pop();
    }

    Ok(())
}
