//! Named queries runnable from the command line, one per query shape the builder supports.

use std::time::Instant;
use crate::engine::{
    engine::Engine,
    expression::{CaseBuilder, EntityPath, Expr},
    materializer::Entity,
    query_builder::sub_select,
};
use crate::store::{fixture, RowStore};
use crate::utils::{
    error::EngineResult,
    types::{ColumnMetadata, DataType, QueryResult, Row, Value},
};

type Seeder = fn(&RowStore) -> EngineResult<()>;

/// What a scenario produced
pub struct ScenarioOutput {
    pub result: QueryResult,
    /// Extra line shown under the result, e.g. paging totals
    pub summary: Option<String>,
}

impl From<QueryResult> for ScenarioOutput {
    fn from(result: QueryResult) -> Self {
        Self { result, summary: None }
    }
}

pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    /// Rows the scenario adds on top of the built-in fixture
    extra_rows: Option<Seeder>,
    query: fn(&Engine) -> EngineResult<ScenarioOutput>,
}

impl Scenario {
    /// Run the scenario; extra rows are only added to the built-in data set
    pub fn run(&self, engine: &Engine, builtin_data: bool) -> EngineResult<ScenarioOutput> {
        if builtin_data {
            if let Some(seed) = self.extra_rows {
                seed(engine.store())?;
            }
        }
        (self.query)(engine)
    }
}

pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

pub static SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "search",
        description: "members named member1 aged 10 to 30",
        extra_rows: None,
        query: search,
    },
    Scenario {
        name: "search_all",
        description: "predicate list with absent entries dropped",
        extra_rows: None,
        query: search_all,
    },
    Scenario {
        name: "sort",
        description: "age desc, username asc with nulls last",
        extra_rows: Some(fixture::seed_sort_rows),
        query: sort,
    },
    Scenario {
        name: "paging",
        description: "offset 1 limit 2 with a separate total count",
        extra_rows: None,
        query: paging,
    },
    Scenario {
        name: "count",
        description: "count query for all members",
        extra_rows: None,
        query: count,
    },
    Scenario {
        name: "aggregation",
        description: "count, sum, avg, max and min of member ages",
        extra_rows: None,
        query: aggregation,
    },
    Scenario {
        name: "group",
        description: "average member age per team",
        extra_rows: None,
        query: group,
    },
    Scenario {
        name: "join",
        description: "members of teamA through the team association",
        extra_rows: None,
        query: join,
    },
    Scenario {
        name: "theta_join",
        description: "members whose username equals a team name",
        extra_rows: Some(fixture::seed_theta_rows),
        query: theta_join,
    },
    Scenario {
        name: "join_on_filtering",
        description: "every member, with its team only when it is teamA",
        extra_rows: None,
        query: join_on_filtering,
    },
    Scenario {
        name: "join_on_no_relation",
        description: "left join of teams on username = team name",
        extra_rows: Some(fixture::seed_theta_rows),
        query: join_on_no_relation,
    },
    Scenario {
        name: "fetch_join",
        description: "member1 with its team fetched in the same query",
        extra_rows: None,
        query: fetch_join,
    },
    Scenario {
        name: "no_fetch_join",
        description: "member1 with its team left unloaded",
        extra_rows: None,
        query: no_fetch_join,
    },
    Scenario {
        name: "subquery",
        description: "members with the maximum age",
        extra_rows: None,
        query: subquery_max,
    },
    Scenario {
        name: "subquery_goe",
        description: "members at or above the average age",
        extra_rows: None,
        query: subquery_goe,
    },
    Scenario {
        name: "subquery_in",
        description: "members whose age is in the ages above 10",
        extra_rows: None,
        query: subquery_in,
    },
    Scenario {
        name: "select_subquery",
        description: "usernames next to the overall average age",
        extra_rows: None,
        query: select_subquery,
    },
    Scenario {
        name: "basic_case",
        description: "simple case over member age",
        extra_rows: None,
        query: basic_case,
    },
    Scenario {
        name: "complex_case",
        description: "searched case over age ranges",
        extra_rows: None,
        query: complex_case,
    },
    Scenario {
        name: "constant",
        description: "usernames next to a constant",
        extra_rows: None,
        query: constant,
    },
    Scenario {
        name: "concat",
        description: "username_age for member1",
        extra_rows: None,
        query: concat,
    },
    Scenario {
        name: "simple_projection",
        description: "usernames only",
        extra_rows: None,
        query: simple_projection,
    },
    Scenario {
        name: "tuple_projection",
        description: "username and age pairs",
        extra_rows: None,
        query: tuple_projection,
    },
];

fn member_sub() -> EntityPath {
    fixture::member_as("memberSub")
}

fn search(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    engine
        .select_from(&member)
        .filter(member.col("username").eq("member1").and(member.col("age").between(10, 30)))
        .fetch_result_set()
        .map(Into::into)
}

fn search_all(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    engine
        .select_from(&member)
        .filter_all([Some(member.col("username").eq("member1")), None, Some(member.col("age").eq(10))])
        .fetch_result_set()
        .map(Into::into)
}

fn sort(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    engine
        .select_from(&member)
        .filter(member.col("age").eq(100))
        .order_by([member.col("age").desc(), member.col("username").asc().nulls_last()])
        .fetch_result_set()
        .map(Into::into)
}

fn entities_result(schema_columns: Vec<ColumnMetadata>, entities: &[Entity], start: Instant) -> QueryResult {
    QueryResult {
        columns: schema_columns,
        rows: entities.iter().map(|e| Row::new(e.values().to_vec())).collect(),
        execution_time: start.elapsed(),
    }
}

fn paging(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let start = Instant::now();
    let member = fixture::member();
    let page = engine
        .select_from(&member)
        .order_by([member.col("username").desc()])
        .offset(1)
        .limit(2)
        .fetch_results()?;

    let columns = engine.store().schema(fixture::MEMBER)?.columns.clone();
    Ok(ScenarioOutput {
        result: entities_result(columns, page.results(), start),
        summary: Some(format!(
            "total {}, limit {}, offset {}",
            page.total(),
            page.limit().map_or_else(|| "none".to_string(), |l| l.to_string()),
            page.offset()
        )),
    })
}

fn count(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let start = Instant::now();
    let member = fixture::member();
    let total = engine.select_from(&member).fetch_count()?;

    Ok(QueryResult {
        columns: vec![ColumnMetadata::new("count", DataType::Integer, false)],
        rows: vec![Row::new(vec![Value::Integer(total as i64)])],
        execution_time: start.elapsed(),
    }
    .into())
}

fn aggregation(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    let age = member.col("age");
    engine
        .select([
            member.count(),
            age.clone().sum(),
            age.clone().avg(),
            age.clone().max(),
            age.min(),
        ])
        .from(&member)
        .fetch_result_set()
        .map(Into::into)
}

fn group(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    let team = fixture::team();
    engine
        .select([team.col("name"), member.col("age").avg()])
        .from(&member)
        .join(member.relation("team"), &team)
        .group_by([team.col("name")])
        .fetch_result_set()
        .map(Into::into)
}

fn join(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    let team = fixture::team();
    engine
        .select_from(&member)
        .join(member.relation("team"), &team)
        .filter(team.col("name").eq("teamA"))
        .fetch_result_set()
        .map(Into::into)
}

fn theta_join(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    let team = fixture::team();
    engine
        .select(&member)
        .from(&member)
        .from(&team)
        .filter(member.col("username").eq(team.col("name")))
        .fetch_result_set()
        .map(Into::into)
}

fn join_on_filtering(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    let team = fixture::team();
    engine
        .select([member.entity(), team.entity()])
        .from(&member)
        .left_join(member.relation("team"), &team)
        .on(team.col("name").eq("teamA"))
        .fetch_result_set()
        .map(Into::into)
}

fn join_on_no_relation(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    let team = fixture::team();
    engine
        .select([member.entity(), team.entity()])
        .from(&member)
        .left_join_entity(&team)
        .on(member.col("username").eq(team.col("name")))
        .fetch_result_set()
        .map(Into::into)
}

fn load_state_result(entity: Option<Entity>, start: Instant) -> QueryResult {
    let rows = entity
        .map(|member| {
            let team = member
                .related("team")
                .and_then(|t| t.get("name").cloned())
                .unwrap_or(Value::Null);
            Row::new(vec![
                member.get("username").cloned().unwrap_or(Value::Null),
                team,
                Value::Boolean(member.is_loaded("team")),
            ])
        })
        .into_iter()
        .collect();

    QueryResult {
        columns: vec![
            ColumnMetadata::new("username", DataType::Text, true),
            ColumnMetadata::new("team", DataType::Text, true),
            ColumnMetadata::new("team_loaded", DataType::Boolean, false),
        ],
        rows,
        execution_time: start.elapsed(),
    }
}

fn fetch_join(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let start = Instant::now();
    let member = fixture::member();
    let team = fixture::team();
    let found = engine
        .select_from(&member)
        .join(member.relation("team"), &team)
        .fetch_join()
        .filter(member.col("username").eq("member1"))
        .fetch_one()?;
    Ok(load_state_result(found, start).into())
}

fn no_fetch_join(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let start = Instant::now();
    let member = fixture::member();
    let found = engine
        .select_from(&member)
        .filter(member.col("username").eq("member1"))
        .fetch_one()?;
    Ok(load_state_result(found, start).into())
}

fn subquery_max(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    let sub = member_sub();
    engine
        .select_from(&member)
        .filter(member.col("age").eq(sub_select(sub.col("age").max()).from(&sub)))
        .fetch_result_set()
        .map(Into::into)
}

fn subquery_goe(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    let sub = member_sub();
    engine
        .select_from(&member)
        .filter(member.col("age").goe(sub_select(sub.col("age").avg()).from(&sub)))
        .fetch_result_set()
        .map(Into::into)
}

fn subquery_in(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    let sub = member_sub();
    engine
        .select_from(&member)
        .filter(
            member
                .col("age")
                .in_subquery(sub_select(sub.col("age")).from(&sub).filter(sub.col("age").gt(10))),
        )
        .fetch_result_set()
        .map(Into::into)
}

fn select_subquery(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    let sub = member_sub();
    engine
        .select([member.col("username"), sub_select(sub.col("age").avg()).from(&sub).into()])
        .from(&member)
        .fetch_result_set()
        .map(Into::into)
}

fn basic_case(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    engine
        .select(
            member
                .col("age")
                .when(10)
                .then("ten")
                .when(20)
                .then("twenty")
                .otherwise("other"),
        )
        .from(&member)
        .fetch_result_set()
        .map(Into::into)
}

fn complex_case(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    let age = member.col("age");
    engine
        .select(
            CaseBuilder::new()
                .when(age.clone().between(0, 20))
                .then("0~20")
                .when(age.between(21, 30))
                .then("21~30")
                .otherwise("other"),
        )
        .from(&member)
        .fetch_result_set()
        .map(Into::into)
}

fn constant(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    engine
        .select([member.col("username"), Expr::constant("A")])
        .from(&member)
        .fetch_result_set()
        .map(Into::into)
}

fn concat(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    engine
        .select(
            member
                .col("username")
                .concat("_")
                .concat(member.col("age").string_value()),
        )
        .from(&member)
        .filter(member.col("username").eq("member1"))
        .fetch_result_set()
        .map(Into::into)
}

fn simple_projection(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    engine
        .select(member.col("username"))
        .from(&member)
        .fetch_result_set()
        .map(Into::into)
}

fn tuple_projection(engine: &Engine) -> EngineResult<ScenarioOutput> {
    let member = fixture::member();
    engine
        .select([member.col("username"), member.col("age")])
        .from(&member)
        .fetch_result_set()
        .map(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::EngineConfig;

    fn engine() -> Engine {
        let engine = Engine::new(EngineConfig::default());
        fixture::create_tables(engine.store()).unwrap();
        fixture::seed(engine.store()).unwrap();
        engine
    }

    fn column(result: &QueryResult, index: usize) -> Vec<Value> {
        result.rows.iter().map(|row| row.values[index].clone()).collect()
    }

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<&str> = SCENARIOS.iter().map(|s| s.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), SCENARIOS.len());
    }

    #[test]
    fn test_every_scenario_runs_on_the_fixture() {
        for scenario in SCENARIOS {
            let engine = engine();
            if let Err(e) = scenario.run(&engine, true) {
                panic!("scenario {} failed: {}", scenario.name, e);
            }
        }
    }

    #[test]
    fn test_sort_scenario() {
        let output = find("sort").unwrap().run(&engine(), true).unwrap();
        assert_eq!(
            column(&output.result, 1),
            vec![Value::from("member5"), Value::from("member6"), Value::Null]
        );
    }

    #[test]
    fn test_paging_summary() {
        let output = find("paging").unwrap().run(&engine(), true).unwrap();
        assert_eq!(output.result.row_count(), 2);
        assert_eq!(output.summary.as_deref(), Some("total 4, limit 2, offset 1"));
    }

    #[test]
    fn test_fetch_join_reports_load_state() {
        let fetched = find("fetch_join").unwrap().run(&engine(), true).unwrap();
        assert_eq!(fetched.result.rows[0].values[2], Value::Boolean(true));
        assert_eq!(fetched.result.rows[0].values[1], Value::from("teamA"));

        let lazy = find("no_fetch_join").unwrap().run(&engine(), true).unwrap();
        assert_eq!(lazy.result.rows[0].values[2], Value::Boolean(false));
        assert_eq!(lazy.result.rows[0].values[1], Value::Null);
    }

    #[test]
    fn test_extra_rows_skipped_for_loaded_data() {
        let output = find("sort").unwrap().run(&engine(), false).unwrap();
        assert!(output.result.is_empty());
    }
}
