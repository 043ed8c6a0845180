mod common;

use anyhow::Result;
use pretty_assertions::assert_eq;
use sql_repo::sql::{render, render_select};
use sql_repo::statement::{
    build_delete_stmt, build_insert_stmt, build_select_stmt, build_update_stmt, select_distinct,
};
use sql_repo::{Direction, Error, FilterExpression, Operator, Select, SelectQuery, Statement, Value};

use common::{schema, values};

const USER_COLUMNS: &str = r#""users"."id", "users"."email", "users"."first_name", "users"."is_active""#;
const RETURNING: &str = r#" RETURNING "id", "email", "first_name", "is_active""#;

fn users_select(query: &SelectQuery) -> Result<String> {
    let schema = schema();
    let stmt = select_distinct(&schema, "users", query.distinct.as_deref())?;
    let stmt = build_select_stmt(&schema, stmt, query)?;
    Ok(render_select(&stmt).statement)
}

#[test]
fn test_plain_select() -> Result<()> {
    let sql = users_select(&SelectQuery::new())?;
    assert_eq!(sql, format!(r#"SELECT {USER_COLUMNS} FROM "users" AS "users""#));
    Ok(())
}

#[test]
fn test_distinct_group_order_limit() -> Result<()> {
    let query = SelectQuery::new()
        .distinct(["is_active"])
        .group_by(["is_active"])
        .order_by(["is_active"])
        .direction(["desc"])
        .limit(5);
    let sql = users_select(&query)?;
    assert_eq!(
        sql,
        r#"SELECT DISTINCT "users"."is_active" FROM "users" AS "users" GROUP BY "users"."is_active" ORDER BY "users"."is_active" DESC LIMIT 5"#
    );
    Ok(())
}

#[test]
fn test_required_predicates_precede_optional_ones() -> Result<()> {
    let query = SelectQuery::new()
        .optional_filters(FilterExpression::new().with("first_name", Operator::Equal, Some("Bob")))
        .filters(FilterExpression::new().with("is_active", Operator::Equal, true));
    let sql = users_select(&query)?;
    assert!(sql.ends_with(r#" WHERE "users"."is_active" = ? AND "users"."first_name" = ?"#));
    Ok(())
}

#[test]
fn test_order_by_requires_matching_directions() -> Result<()> {
    let err = users_select(&SelectQuery::new().order_by(["id", "email"]).direction(["asc"]))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::OrderByMismatch {
            order_by: 2,
            direction: 1
        })
    ));

    // Without directions nothing is ordered.
    let sql = users_select(&SelectQuery::new().order_by(["id"]))?;
    assert!(!sql.contains("ORDER BY"));
    Ok(())
}

#[test]
fn test_invalid_direction() {
    let err = users_select(&SelectQuery::new().order_by(["id"]).direction(["up"])).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidDirection(direction)) if direction == "up"
    ));

    assert_eq!("asc".parse::<Direction>().ok(), Some(Direction::Asc));
    assert_eq!("desc".parse::<Direction>().ok(), Some(Direction::Desc));
    assert!("DESCENDING".parse::<Direction>().is_err());
}

#[test]
fn test_unknown_order_column() {
    let err = users_select(&SelectQuery::new().order_by(["age"]).direction(["asc"])).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::UnknownColumn { .. })
    ));
}

#[test]
fn test_count_wraps_the_select() -> Result<()> {
    let schema = schema();
    let select = Select::new(schema.table("users")?).apply_limit(Some(2));
    let sql = render_select(&select.count()).statement;
    assert_eq!(
        sql,
        format!(r#"SELECT count(*) FROM (SELECT {USER_COLUMNS} FROM "users" AS "users" LIMIT 2) AS "anon_count""#)
    );
    Ok(())
}

#[test]
fn test_insert_renders_one_statement_per_row() -> Result<()> {
    let schema = schema();
    let insert = build_insert_stmt(
        &schema,
        "users",
        vec![
            values([("email", Value::from("a@x.com")), ("is_active", Value::from(true))]),
            values([("email", Value::from("b@x.com"))]),
        ],
    )?;
    let queries = render(&Statement::Insert(insert));
    let sql: Vec<&str> = queries.iter().map(|query| query.statement.as_str()).collect();
    assert_eq!(
        sql,
        vec![
            format!(r#"INSERT INTO "users" ("email", "is_active") VALUES (?, ?){RETURNING}"#),
            format!(r#"INSERT INTO "users" ("email") VALUES (?){RETURNING}"#),
        ]
    );
    assert_eq!(
        queries[0].params.values,
        vec![Value::from("a@x.com"), Value::Boolean(true)]
    );
    Ok(())
}

#[test]
fn test_update_and_delete() -> Result<()> {
    let schema = schema();
    let by_id = FilterExpression::new().with("id", Operator::Equal, 2);

    let update = build_update_stmt(
        &schema,
        "users",
        &values([("email", Value::from("robert@x.com"))]),
        Some(&by_id),
    )?;
    let queries = render(&update.into());
    assert_eq!(
        queries[0].statement,
        format!(r#"UPDATE "users" SET "email" = ? WHERE "users"."id" = ?{RETURNING}"#)
    );
    assert_eq!(
        queries[0].params.values,
        vec![Value::from("robert@x.com"), Value::Integer(2)]
    );

    let delete = build_delete_stmt(&schema, "users", Some(&by_id))?;
    let queries = render(&delete.into());
    assert_eq!(
        queries[0].statement,
        format!(r#"DELETE FROM "users" WHERE "users"."id" = ?{RETURNING}"#)
    );

    let delete_everything = build_delete_stmt(&schema, "users", None)?;
    let queries = render(&delete_everything.into());
    assert_eq!(queries[0].statement, format!(r#"DELETE FROM "users"{RETURNING}"#));
    Ok(())
}

#[test]
fn test_values_validation() -> Result<()> {
    let schema = schema();

    let err = build_update_stmt(&schema, "users", &Default::default(), None).unwrap_err();
    assert!(matches!(err, Error::InvalidValues(_)));

    let err = build_insert_stmt(&schema, "users", vec![values([("age", Value::from(3))])])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidValues(message) if message.contains("age")));

    let err = build_insert_stmt(&schema, "users", vec![Default::default()]).unwrap_err();
    assert!(matches!(err, Error::InvalidValues(_)));

    let err = build_insert_stmt(&schema, "people", vec![values([("id", Value::from(1))])])
        .unwrap_err();
    assert!(matches!(err, Error::UnknownTable(table) if table == "people"));
    Ok(())
}

#[test]
fn test_explicit_join_kinds() -> Result<()> {
    let schema = schema();
    let select = Select::new(schema.table("addresses")?)
        .outer_join(&schema, "city")?
        .join(&schema, "user")?;
    let sql = render_select(&select).statement;
    assert!(sql.contains(
        r#" LEFT OUTER JOIN "cities" AS "cities_j1" ON "cities_j1"."id" = "addresses"."city_id""#
    ));
    assert!(sql.contains(r#" JOIN "users" AS "users_j2" ON "users_j2"."id" = "addresses"."user_id""#));

    let err = Select::new(schema.table("addresses")?)
        .join(&schema, "owner")
        .unwrap_err();
    assert!(matches!(err, Error::UnknownRelationship { .. }));

    let err = Select::new(schema.table("users")?)
        .join(&schema, "addresses.city")
        .unwrap_err();
    assert!(matches!(err, Error::MissingJoin(path) if path == "addresses"));
    Ok(())
}
