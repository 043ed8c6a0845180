mod common;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use pretty_assertions::assert_eq;
use sql_repo::loader::SELECT_IN_BATCH;
use sql_repo::value::Params;
use sql_repo::{
    Error, FilterExpression, LoadingTechnique, Operator, QueryObserver, Raw, Record, Related,
    RelationshipOption, RelationshipOptions, Repository, Select, SelectQuery, SqliteDatabase,
    Value, MAX_RELATIONSHIP_DEPTH,
};
use tempfile::TempDir;

use common::{values, Address, User};

#[derive(Default)]
struct Recorder {
    queries: Mutex<Vec<String>>,
}

impl Recorder {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.queries.lock().unwrap())
    }
}

impl QueryObserver for Recorder {
    fn on_query_start(&self, sql: &str, _params: &Params) {
        self.queries.lock().unwrap().push(sql.to_string());
    }
}

fn recorded_repository() -> Result<(TempDir, Repository<SqliteDatabase>, Arc<Recorder>)> {
    let (dir, database) = common::database(true)?;
    let recorder = Arc::new(Recorder::default());
    let database = database.with_observer(recorder.clone());
    let schema = database.schema();
    Ok((dir, Repository::new(Arc::new(database), schema), recorder))
}

fn options(name: &str, option: RelationshipOption) -> RelationshipOptions {
    let mut options = RelationshipOptions::new();
    options.insert(name.to_string(), option);
    options
}

fn by_id(id: i64) -> FilterExpression {
    FilterExpression::new().with("id", Operator::Equal, id)
}

fn select_users(
    repo: &Repository<SqliteDatabase>,
    query: SelectQuery,
) -> Result<Vec<Record>> {
    let query = query.order_by(["id"]).direction(["asc"]);
    Ok(repo
        .select_all::<Raw<User>>(&query, None)?
        .into_iter()
        .map(Raw::into_record)
        .collect())
}

fn streets(record: &Record) -> Result<Vec<String>> {
    let mut streets = record
        .many("addresses")?
        .iter()
        .map(|address| address.try_get("street"))
        .collect::<sql_repo::Result<Vec<String>>>()?;
    streets.sort();
    Ok(streets)
}

#[test]
fn test_joined_parent_with_noload_child_issues_one_join() -> Result<()> {
    let (_dir, repo, recorder) = recorded_repository()?;
    let tree = options(
        "addresses",
        RelationshipOption::new(LoadingTechnique::Joined)
            .with_child("city", RelationshipOption::new(LoadingTechnique::NoLoad)),
    );

    let users = select_users(&repo, SelectQuery::new().relationship_options(tree))?;
    let queries = recorder.take();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].contains(
        r#" LEFT OUTER JOIN "addresses" AS "addresses_j1" ON "addresses_j1"."user_id" = "users"."id""#
    ));
    assert!(!queries[0].contains(r#""cities""#));

    assert_eq!(users.len(), 3);
    let alice = &users[0];
    assert_eq!(streets(alice)?.len(), 2);
    for address in alice.many("addresses")? {
        assert_eq!(address.relation("city"), Some(&Related::NotLoaded));
        assert_eq!(address.one("city")?, None);
    }
    assert!(users[2].many("addresses")?.is_empty());
    Ok(())
}

#[test]
fn test_nested_joins_deduplicate_parents() -> Result<()> {
    let (_dir, repo, recorder) = recorded_repository()?;
    let tree = options(
        "addresses",
        RelationshipOption::new(LoadingTechnique::Joined)
            .with_child("city", RelationshipOption::new(LoadingTechnique::Joined)),
    );

    let users = select_users(&repo, SelectQuery::new().relationship_options(tree))?;
    let queries = recorder.take();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].contains(r#"LEFT OUTER JOIN "addresses" AS "addresses_j1""#));
    assert!(queries[0].contains(
        r#" LEFT OUTER JOIN "cities" AS "cities_j2" ON "cities_j2"."id" = "addresses_j1"."city_id""#
    ));

    let ids: Vec<i64> = users
        .iter()
        .map(|user| user.try_get("id"))
        .collect::<sql_repo::Result<_>>()?;
    assert_eq!(ids, vec![1, 2, 3]);

    let mut cities: Vec<String> = users[0]
        .many("addresses")?
        .iter()
        .map(|address| {
            address
                .one("city")?
                .map(|city| city.try_get::<String>("name"))
                .unwrap_or_else(|| Ok(String::new()))
        })
        .collect::<sql_repo::Result<_>>()?;
    cities.sort();
    assert_eq!(cities, vec!["Lyon".to_string(), "Nantes".to_string()]);
    Ok(())
}

#[test]
fn test_limit_with_joined_relation_counts_parents() -> Result<()> {
    let (_dir, repo, recorder) = recorded_repository()?;
    let tree = options("addresses", RelationshipOption::new(LoadingTechnique::Joined));

    let users = select_users(&repo, SelectQuery::new().relationship_options(tree).limit(1))?;
    let queries = recorder.take();
    assert!(queries[0].contains(r#" LIMIT 1) AS "users" LEFT OUTER JOIN"#));

    assert_eq!(users.len(), 1);
    assert_eq!(streets(&users[0])?.len(), 2);
    Ok(())
}

#[test]
fn test_joined_criteria_restrict_related_rows() -> Result<()> {
    let (_dir, repo, _) = recorded_repository()?;
    let tree = options(
        "addresses",
        RelationshipOption::new(LoadingTechnique::Joined)
            .with_criteria(FilterExpression::new().with("city_id", Operator::Equal, 2)),
    );

    let users = select_users(&repo, SelectQuery::new().filters(by_id(1)).relationship_options(tree))?;
    assert_eq!(users.len(), 1);
    assert_eq!(streets(&users[0])?, vec!["2 quai des Chartrons".to_string()]);
    Ok(())
}

#[test]
fn test_selectin_issues_keyed_follow_up() -> Result<()> {
    let (_dir, repo, recorder) = recorded_repository()?;
    let tree = options(
        "addresses",
        RelationshipOption::new(LoadingTechnique::SelectIn)
            .with_criteria(FilterExpression::new().with("city_id", Operator::Equal, 1)),
    );

    let users = select_users(&repo, SelectQuery::new().relationship_options(tree))?;
    let queries = recorder.take();
    assert_eq!(queries.len(), 2);
    assert!(queries[1].contains(r#"WHERE "addresses"."user_id" IN (?, ?, ?) AND "addresses"."city_id" = ?"#));

    assert_eq!(streets(&users[0])?, vec!["1 rue de la Paix".to_string()]);
    assert_eq!(streets(&users[1])?, vec!["3 place Bellecour".to_string()]);
    assert!(streets(&users[2])?.is_empty());
    Ok(())
}

#[test]
fn test_subquery_reruns_parent_select() -> Result<()> {
    let (_dir, repo, recorder) = recorded_repository()?;
    let tree = options("addresses", RelationshipOption::new(LoadingTechnique::Subquery));

    let users = select_users(
        &repo,
        SelectQuery::new()
            .filters(FilterExpression::new().with("is_active", Operator::Equal, true))
            .relationship_options(tree),
    )?;
    let queries = recorder.take();
    assert_eq!(queries.len(), 2);
    assert!(queries[1].contains(r#"WHERE "addresses"."user_id" IN (SELECT "anon_1"."id" FROM (SELECT "#));
    assert!(queries[1].contains(r#"WHERE "users"."is_active" = ?"#));

    assert_eq!(users.len(), 2);
    assert_eq!(streets(&users[0])?.len(), 2);
    assert!(streets(&users[1])?.is_empty());
    Ok(())
}

#[test]
fn test_subquery_under_selectin_loads_grandchildren() -> Result<()> {
    let (_dir, repo, recorder) = recorded_repository()?;
    let tree = options(
        "addresses",
        RelationshipOption::new(LoadingTechnique::SelectIn)
            .with_child("city", RelationshipOption::new(LoadingTechnique::SelectIn)),
    );

    let users = select_users(&repo, SelectQuery::new().filters(by_id(2)).relationship_options(tree))?;
    assert_eq!(recorder.take().len(), 3);

    let address = &users[0].many("addresses")?[0];
    let city = address.one("city")?.expect("address 3 is in Lyon");
    assert_eq!(city.try_get::<String>("name")?, "Lyon");
    Ok(())
}

#[test]
fn test_raise_and_noload() -> Result<()> {
    let (_dir, repo, recorder) = recorded_repository()?;

    let users = select_users(
        &repo,
        SelectQuery::new()
            .filters(by_id(1))
            .relationship_options(options("addresses", RelationshipOption::new(LoadingTechnique::Raise))),
    )?;
    assert!(matches!(users[0].many("addresses"), Err(Error::RaiseLoad(name)) if name == "addresses"));

    let users = select_users(
        &repo,
        SelectQuery::new()
            .filters(by_id(1))
            .relationship_options(options("addresses", RelationshipOption::new(LoadingTechnique::NoLoad))),
    )?;
    assert!(users[0].many("addresses")?.is_empty());
    assert!(!users[0].is_loaded("addresses"));

    // Neither technique reads related rows.
    assert_eq!(recorder.take().len(), 2);
    Ok(())
}

#[test]
fn test_contains_eager_reads_explicit_join() -> Result<()> {
    let (_dir, repo, recorder) = recorded_repository()?;
    let schema = repo.schema().clone();

    let stmt = Select::new(schema.table("users")?).join(&schema, "addresses")?;
    let query = SelectQuery::new()
        .filters(FilterExpression::new().with("addresses.street", Operator::ILike, "%RUE%"))
        .relationship_options(options(
            "addresses",
            RelationshipOption::new(LoadingTechnique::ContainsEager),
        ));

    let users: Vec<Raw<User>> = repo.select_all_stmt(stmt, &query, None)?;
    let queries = recorder.take();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].matches(" JOIN ").count(), 1);

    assert_eq!(users.len(), 1);
    assert_eq!(streets(&users[0])?, vec!["1 rue de la Paix".to_string()]);

    let err = repo
        .select_all::<Raw<User>>(
            &SelectQuery::new().relationship_options(options(
                "addresses",
                RelationshipOption::new(LoadingTechnique::ContainsEager),
            )),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, Error::MissingJoin(path) if path == "addresses"));
    Ok(())
}

#[test]
fn test_unknown_relationship_options_are_skipped() -> Result<()> {
    let (_dir, repo, recorder) = recorded_repository()?;

    let mut tree = options("friends", RelationshipOption::new(LoadingTechnique::Joined));
    tree.insert(String::new(), RelationshipOption::new(LoadingTechnique::Joined));

    let users = select_users(&repo, SelectQuery::new().relationship_options(tree))?;
    assert_eq!(users.len(), 3);
    assert!(users[0].relations().is_empty());
    assert!(!recorder.take()[0].contains("JOIN"));
    Ok(())
}

#[test]
fn test_relationship_depth_is_bounded() -> Result<()> {
    let (_dir, repo, _) = recorded_repository()?;

    // users -> addresses -> user -> addresses -> ...
    let mut option = RelationshipOption::new(LoadingTechnique::NoLoad);
    for depth in (1..=MAX_RELATIONSHIP_DEPTH + 1).rev() {
        let name = if depth % 2 == 1 { "user" } else { "addresses" };
        option = RelationshipOption::new(LoadingTechnique::NoLoad).with_child(name, option);
    }
    let tree = options("addresses", option);

    let err = repo
        .select_all::<Raw<User>>(&SelectQuery::new().relationship_options(tree), None)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::RelationshipDepthExceeded { depth } if depth == MAX_RELATIONSHIP_DEPTH
    ));
    Ok(())
}

#[test]
fn test_loaded_relations_serialize_inline() -> Result<()> {
    let (_dir, repo, _) = recorded_repository()?;
    let tree = options(
        "addresses",
        RelationshipOption::new(LoadingTechnique::SelectIn)
            .with_criteria(FilterExpression::new().with("id", Operator::Equal, 3)),
    );

    let users = select_users(&repo, SelectQuery::new().filters(by_id(2)).relationship_options(tree))?;
    let json = serde_json::to_value(&users[0])?;
    assert_eq!(
        json,
        serde_json::json!({
            "id": 2,
            "email": "bob@x.com",
            "first_name": "Bob",
            "is_active": false,
            "addresses": [
                {"id": 3, "user_id": 2, "city_id": 1, "street": "3 place Bellecour"}
            ]
        })
    );
    Ok(())
}

#[test]
fn test_selectin_keys_are_sent_in_batches() -> Result<()> {
    let (_dir, repo, recorder) = recorded_repository()?;
    let extra = SELECT_IN_BATCH as i64 + 20;
    let new_ids: Vec<i64> = (4..4 + extra).collect();

    repo.add_all::<User>(
        new_ids
            .iter()
            .map(|id| {
                values([
                    ("id", Value::from(*id)),
                    ("email", Value::from(format!("user{id}@x.com"))),
                ])
            })
            .collect(),
        false,
        true,
        None,
    )?;
    repo.add_all::<Address>(
        new_ids
            .iter()
            .map(|id| {
                values([
                    ("user_id", Value::from(*id)),
                    ("street", Value::from(format!("{id} rue Neuve"))),
                ])
            })
            .collect(),
        false,
        true,
        None,
    )?;
    recorder.take();

    let tree = options("addresses", RelationshipOption::new(LoadingTechnique::SelectIn));
    let users = select_users(&repo, SelectQuery::new().relationship_options(tree))?;

    let queries = recorder.take();
    assert_eq!(queries.len(), 3);
    let placeholders: Vec<usize> = queries[1..]
        .iter()
        .map(|sql| sql.matches('?').count())
        .collect();
    assert_eq!(placeholders, vec![SELECT_IN_BATCH, 3 + extra as usize - SELECT_IN_BATCH]);

    assert_eq!(users.len(), 3 + extra as usize);
    assert_eq!(streets(&users[0])?.len(), 2);
    assert!(users[2].many("addresses")?.is_empty());
    for user in &users[3..] {
        let id: i64 = user.try_get("id")?;
        assert_eq!(streets(user)?, vec![format!("{id} rue Neuve")]);
    }
    Ok(())
}
