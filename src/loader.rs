//! Execution plan for relationship loading.
//!
//! A [`Loader`] turns a [`Select`] and its load directives into a sequence of
//! statements. The first statement reads the root rows together with every
//! joined or contains-eager relation; select-in and subquery relations are
//! read by follow-up statements keyed on the rows already materialized. The
//! loader never talks to a session itself: callers pull statements with
//! [`Loader::next_statement`], execute them and hand the rows back through
//! [`Loader::feed`], which keeps the same plan usable from blocking and
//! suspending repositories.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::expr::{ColumnRef, Expr};
use crate::filter::{compile_filters, FilterExpression, Scope};
use crate::record::{Record, Related};
use crate::relationship::LoadingTechnique;
use crate::schema::{DataType, RelationKind, RelationshipDefinition, Schema, TableDefinition};
use crate::statement::{Join, JoinKind, Projection, Select, Statement};
use crate::value::{Row, Value};

const SUBQUERY_ALIAS: &str = "anon_1";

/// Parent keys bound by one select-in statement.
pub const SELECT_IN_BATCH: usize = 500;

#[derive(Debug)]
struct Node {
    path: Vec<String>,
    parent: Option<usize>,
    relationship: RelationshipDefinition,
    technique: LoadingTechnique,
    criteria: Option<FilterExpression>,
}

/// Columns of one table within a statement's row layout.
#[derive(Debug)]
struct Segment {
    table: String,
    alias: String,
    columns: Vec<String>,
    data_types: Vec<DataType>,
    key: Vec<usize>,
    /// Parent segment and the relation this segment populates on it.
    parent: Option<(usize, RelationshipDefinition)>,
    /// Relation states every new record of this segment starts with.
    slots: Vec<(String, Related)>,
    records: Vec<Record>,
    owners: Vec<usize>,
    index: HashMap<(usize, Vec<Value>), usize>,
}

impl Segment {
    fn new(table: &TableDefinition, alias: &str, columns: Vec<String>) -> Self {
        let data_types = columns
            .iter()
            .map(|name| {
                table
                    .column(name)
                    .map(|column| column.data_type)
                    .unwrap_or(DataType::Integer)
            })
            .collect();
        let positions: Vec<usize> = table
            .primary_key
            .iter()
            .filter_map(|key| columns.iter().position(|column| column == key))
            .collect();
        let key = if positions.is_empty() || positions.len() != table.primary_key.len() {
            (0..columns.len()).collect()
        } else {
            positions
        };
        Self {
            table: table.name.clone(),
            alias: alias.to_string(),
            columns,
            data_types,
            key,
            parent: None,
            slots: Vec::new(),
            records: Vec::new(),
            owners: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn entity(table: &TableDefinition, alias: &str) -> Self {
        let columns = table.column_names().map(str::to_string).collect();
        Self::new(table, alias, columns)
    }

    fn column_refs(&self) -> impl Iterator<Item = ColumnRef> + '_ {
        self.columns.iter().map(|column| ColumnRef {
            qualifier: self.alias.clone(),
            column: column.clone(),
        })
    }

    /// Record the row slice for `owner`, returning the record index or `None`
    /// when an outer join produced no row for this segment.
    fn accept(&mut self, owner: usize, values: &[Value]) -> Option<usize> {
        let key: Vec<Value> = self.key.iter().map(|&i| values[i].clone()).collect();
        if self.parent.is_some() && key.iter().all(Value::is_null) {
            return None;
        }
        if let Some(&existing) = self.index.get(&(owner, key.clone())) {
            return Some(existing);
        }

        let mut record = Record::from_values(
            self.table.clone(),
            self.columns
                .iter()
                .zip(&self.data_types)
                .zip(values)
                .map(|((column, data_type), value)| (column.clone(), data_type.decode(value.clone())))
                .collect::<IndexMap<_, _>>(),
        );
        for (name, related) in &self.slots {
            record.set_relation(name.clone(), related.clone());
        }

        let position = self.records.len();
        self.records.push(record);
        self.owners.push(owner);
        self.index.insert((owner, key), position);
        Some(position)
    }
}

/// One statement of the plan and the row layout it produces.
#[derive(Debug)]
struct Level {
    /// Node whose related rows this level reads; `None` for the root rows.
    root: Option<usize>,
    /// Level that holds the parents of `root`.
    parent: Option<usize>,
    statement: Select,
    /// Statement before eager joins, re-run by subquery follow-ups.
    base: Select,
    segments: Vec<Segment>,
    follow_ups: Vec<(usize, usize)>,
}

#[derive(Debug)]
struct Loaded {
    root: Option<usize>,
    parent: Option<usize>,
    records: Vec<Record>,
}

/// Pull-driven relationship loading for one select.
#[derive(Debug)]
pub struct Loader<'a> {
    schema: &'a Schema,
    nodes: Vec<Node>,
    queue: VecDeque<Level>,
    current: Option<Level>,
    loaded: Vec<Loaded>,
}

impl<'a> Loader<'a> {
    pub fn new(schema: &'a Schema, select: Select) -> Result<Self> {
        let nodes = if select.is_entity() {
            plan_nodes(schema, &select)?
        } else {
            Vec::new()
        };

        let mut loader = Self {
            schema,
            nodes,
            queue: VecDeque::new(),
            current: None,
            loaded: Vec::new(),
        };
        let root = loader.root_level(select)?;
        loader.queue.push_back(root);
        Ok(loader)
    }

    /// The next statement to execute, or `None` once every level is read.
    pub fn next_statement(&mut self) -> Option<Statement> {
        let level = self.queue.pop_front()?;
        let statement = Statement::Select(level.statement.clone());
        self.current = Some(level);
        Some(statement)
    }

    /// Materialize the rows of the statement last returned by
    /// [`Loader::next_statement`] and schedule its follow-up statements.
    pub fn feed(&mut self, rows: Vec<Row>) -> Result<()> {
        let Some(mut level) = self.current.take() else {
            return Ok(());
        };

        for row in rows {
            materialize(&mut level.segments, &row);
        }

        let index = self.loaded.len();
        let mut follow_ups = Vec::new();
        for &(node, segment) in &level.follow_ups {
            follow_ups.extend(self.follow_up(&level, node, segment, index)?);
        }
        self.queue.extend(follow_ups);

        self.loaded.push(Loaded {
            root: level.root,
            parent: level.parent,
            records: assemble(level.segments),
        });
        Ok(())
    }

    /// Root records with every loaded relation attached.
    pub fn finish(mut self) -> Vec<Record> {
        while self.loaded.len() > 1 {
            let Some(child) = self.loaded.pop() else {
                break;
            };
            let (Some(node), Some(parent)) = (child.root, child.parent) else {
                continue;
            };
            let node = &self.nodes[node];
            let skip = self.loaded[parent]
                .root
                .map_or(0, |root| self.nodes[root].path.len());
            let relative = &node.path[skip..node.path.len() - 1];

            let mut groups: IndexMap<Value, Vec<Record>> = IndexMap::new();
            for record in child.records {
                let key = record
                    .get(&node.relationship.remote_column)
                    .cloned()
                    .unwrap_or(Value::Null);
                groups.entry(key).or_default().push(record);
            }

            // Batches of one relation append to the empty slots set up when
            // the parents were read.
            let relationship = &node.relationship;
            visit(&mut self.loaded[parent].records, relative, &mut |record| {
                let Some(related) = record
                    .get(&relationship.local_column)
                    .and_then(|key| groups.get(key))
                    .cloned()
                else {
                    return;
                };
                match record.relation_mut(&relationship.name) {
                    Some(Related::Many(children)) => children.extend(related),
                    _ => record.set_relation(
                        relationship.name.clone(),
                        related_of(relationship.kind, related),
                    ),
                }
            });
        }

        self.loaded
            .pop()
            .map(|loaded| loaded.records)
            .unwrap_or_default()
    }

    fn root_level(&self, select: Select) -> Result<Level> {
        let table = self.schema.table(&select.table)?;
        let mut base = select;
        base.loads.clear();

        let root = match &base.projection {
            Projection::Entity(_) => Segment::entity(table, &base.alias),
            Projection::Distinct(columns) | Projection::Columns(columns) => Segment::new(
                table,
                &base.alias,
                columns.iter().map(|column| column.column.clone()).collect(),
            ),
            Projection::Count => Segment::new(table, &base.alias, vec!["count".to_string()]),
            Projection::One => Segment::new(table, &base.alias, vec!["1".to_string()]),
        };

        self.build_level(None, None, base, root)
    }

    fn build_level(
        &self,
        root: Option<usize>,
        parent: Option<usize>,
        base: Select,
        root_segment: Segment,
    ) -> Result<Level> {
        let mut segments = vec![root_segment];
        let mut segment_of: HashMap<usize, usize> = HashMap::new();
        let mut eager: Vec<Join> = Vec::new();
        let mut follow_ups = Vec::new();
        let join_offset = base.joins.len();

        for (index, node) in self.nodes.iter().enumerate() {
            let parent_segment = match node.parent {
                p if p == root => 0,
                Some(p) => match segment_of.get(&p) {
                    Some(&segment) => segment,
                    None => continue,
                },
                None => continue,
            };
            let relationship = &node.relationship;
            let name = relationship.name.clone();

            match node.technique {
                LoadingTechnique::Joined => {
                    let target = self.schema.table(&relationship.target)?;
                    let alias = format!(
                        "{}_j{}",
                        target.name,
                        join_offset + eager.len() + 1
                    );
                    let mut on = vec![Expr::eq(
                        Expr::column(&alias, &relationship.remote_column),
                        Expr::column(&segments[parent_segment].alias, &relationship.local_column),
                    )];
                    on.extend(compile_filters(
                        self.schema,
                        Scope::new(target, &alias),
                        node.criteria.as_ref(),
                        false,
                    )?);
                    eager.push(Join {
                        path: node.path.clone(),
                        table: target.name.clone(),
                        alias: alias.clone(),
                        kind: JoinKind::LeftOuter,
                        on: Expr::and(on),
                    });
                    segment_of.insert(index, self.child_segment(
                        &mut segments,
                        parent_segment,
                        relationship,
                        &alias,
                    )?);
                }
                LoadingTechnique::ContainsEager => {
                    let join = base
                        .joins
                        .iter()
                        .find(|join| join.path == node.path)
                        .filter(|_| root.is_none())
                        .ok_or_else(|| Error::MissingJoin(node.path.join(".")))?;
                    let alias = join.alias.clone();
                    segment_of.insert(index, self.child_segment(
                        &mut segments,
                        parent_segment,
                        relationship,
                        &alias,
                    )?);
                }
                LoadingTechnique::SelectIn | LoadingTechnique::Subquery => {
                    segments[parent_segment]
                        .slots
                        .push((name, related_of(relationship.kind, Vec::new())));
                    follow_ups.push((index, parent_segment));
                }
                LoadingTechnique::Lazy => segments[parent_segment].slots.push((name, Related::Lazy)),
                LoadingTechnique::NoLoad => {
                    segments[parent_segment].slots.push((name, Related::NotLoaded))
                }
                LoadingTechnique::Raise => segments[parent_segment].slots.push((name, Related::Raise)),
            }
        }

        let mut statement = if !eager.is_empty()
            && (base.limit.is_some() || base.offset.is_some())
            && base.joins.is_empty()
        {
            wrap(&base, &segments[0])
        } else {
            base.clone()
        };
        if segments.len() > 1 {
            statement.joins.extend(eager);
            statement.projection =
                Projection::Columns(segments.iter().flat_map(Segment::column_refs).collect());
        }

        Ok(Level {
            root,
            parent,
            statement,
            base,
            segments,
            follow_ups,
        })
    }

    fn child_segment(
        &self,
        segments: &mut Vec<Segment>,
        parent: usize,
        relationship: &RelationshipDefinition,
        alias: &str,
    ) -> Result<usize> {
        let target = self.schema.table(&relationship.target)?;
        let mut segment = Segment::entity(target, alias);
        segment.parent = Some((parent, relationship.clone()));
        segments[parent]
            .slots
            .push((relationship.name.clone(), related_of(relationship.kind, Vec::new())));
        segments.push(segment);
        Ok(segments.len() - 1)
    }

    fn follow_up(
        &self,
        level: &Level,
        node: usize,
        segment: usize,
        loaded_index: usize,
    ) -> Result<Vec<Level>> {
        let parents = &level.segments[segment];
        if parents.records.is_empty() {
            return Ok(Vec::new());
        }

        let info = &self.nodes[node];
        let relationship = &info.relationship;
        let target = self.schema.table(&relationship.target)?;
        let remote = Expr::column(&target.name, &relationship.remote_column);

        let memberships = if info.technique == LoadingTechnique::Subquery && segment == 0 {
            vec![remote.in_subquery(Select::column_of(
                level.base.clone(),
                SUBQUERY_ALIAS,
                &relationship.local_column,
            ))]
        } else {
            let mut seen = HashSet::new();
            let keys: Vec<Expr> = parents
                .records
                .iter()
                .filter_map(|record| record.get(&relationship.local_column))
                .filter(|value| !value.is_null() && seen.insert((*value).clone()))
                .cloned()
                .map(Expr::Value)
                .collect();
            keys.chunks(SELECT_IN_BATCH)
                .map(|batch| remote.clone().in_list(batch.to_vec(), false))
                .collect()
        };

        let criteria = compile_filters(
            self.schema,
            Scope::new(target, &target.name),
            info.criteria.as_ref(),
            false,
        )?;

        memberships
            .into_iter()
            .map(|membership| {
                let mut select = Select::new(target);
                select.filters.push(membership);
                select.filters.extend(criteria.iter().cloned());
                let root = Segment::entity(target, &select.alias);
                self.build_level(Some(node), Some(loaded_index), select, root)
            })
            .collect()
    }
}

/// Flatten the select's load directives into a parent-linked node list.
fn plan_nodes(schema: &Schema, select: &Select) -> Result<Vec<Node>> {
    let mut nodes: Vec<Node> = Vec::new();

    for directive in &select.loads {
        let Some((name, parents)) = directive.path.split_last() else {
            continue;
        };
        let (parent, table) = if parents.is_empty() {
            (None, schema.table(&select.table)?)
        } else {
            match nodes.iter().position(|node| node.path == parents) {
                Some(position) => (
                    Some(position),
                    schema.table(&nodes[position].relationship.target)?,
                ),
                None => continue,
            }
        };

        nodes.push(Node {
            path: directive.path.clone(),
            parent,
            relationship: table.relationship(name)?.clone(),
            technique: directive.technique,
            criteria: directive.criteria.clone(),
        });
    }

    Ok(nodes)
}

/// Re-select the root rows from a derived table so that limit and offset
/// count parents rather than joined rows.
fn wrap(base: &Select, root: &Segment) -> Select {
    let mut outer = base.clone();
    outer.source = Some(Box::new(base.clone()));
    outer.projection = Projection::Entity(root.column_refs().collect());
    outer.joins = Vec::new();
    outer.filters = Vec::new();
    outer.optional_filters = Vec::new();
    outer.group_by = Vec::new();
    outer.limit = None;
    outer.offset = None;
    outer
}

fn materialize(segments: &mut [Segment], row: &Row) {
    let mut current: Vec<Option<usize>> = Vec::with_capacity(segments.len());
    let mut offset = 0;

    for segment in segments.iter_mut() {
        let width = segment.columns.len();
        let Some(values) = row.get(offset..offset + width) else {
            current.push(None);
            continue;
        };
        offset += width;

        let owner = match &segment.parent {
            None => Some(0),
            Some((parent, _)) => current[*parent],
        };
        current.push(owner.and_then(|owner| segment.accept(owner, values)));
    }
}

/// Fold child segments into their parents, deepest first.
fn assemble(mut segments: Vec<Segment>) -> Vec<Record> {
    for index in (1..segments.len()).rev() {
        let records = std::mem::take(&mut segments[index].records);
        let owners = std::mem::take(&mut segments[index].owners);
        let Some((parent, relationship)) = segments[index].parent.clone() else {
            continue;
        };

        for (record, owner) in records.into_iter().zip(owners) {
            let Some(owner) = segments[parent].records.get_mut(owner) else {
                continue;
            };
            let Some(slot) = owner.relation_mut(&relationship.name) else {
                continue;
            };
            match slot {
                Related::Many(children) => children.push(record),
                Related::One(None) => *slot = Related::One(Some(Box::new(record))),
                _ => {}
            }
        }
    }

    segments
        .into_iter()
        .next()
        .map(|root| root.records)
        .unwrap_or_default()
}

fn visit(records: &mut [Record], path: &[String], f: &mut dyn FnMut(&mut Record)) {
    let Some((name, rest)) = path.split_first() else {
        records.iter_mut().for_each(|record| f(record));
        return;
    };
    for record in records.iter_mut() {
        match record.relation_mut(name) {
            Some(Related::Many(children)) => visit(children, rest, f),
            Some(Related::One(Some(child))) => visit(std::slice::from_mut(child.as_mut()), rest, f),
            _ => {}
        }
    }
}

fn related_of(kind: RelationKind, mut records: Vec<Record>) -> Related {
    match kind {
        RelationKind::ToMany => Related::Many(records),
        RelationKind::ToOne if records.is_empty() => Related::One(None),
        RelationKind::ToOne => Related::One(Some(Box::new(records.swap_remove(0)))),
    }
}

/// Statement reading the rows of `name` related to `record`.
pub fn relation_select<'s>(
    schema: &'s Schema,
    record: &Record,
    name: &str,
) -> Result<(Select, &'s RelationshipDefinition)> {
    let table = schema.table(record.table())?;
    let relationship = table.relationship(name)?;
    let target = schema.table(&relationship.target)?;

    let mut select = Select::new(target);
    let key = record
        .get(&relationship.local_column)
        .cloned()
        .unwrap_or(Value::Null);
    select.filters.push(Expr::eq_or_is_null(
        Expr::column(&select.alias, &relationship.remote_column),
        key,
    ));
    Ok((select, relationship))
}

/// Store `records` as the loaded value of `relationship` on `record`.
pub fn attach_relation(record: &mut Record, relationship: &RelationshipDefinition, records: Vec<Record>) {
    record.set_relation(relationship.name.clone(), related_of(relationship.kind, records));
}
