//! The Member/Team data set used by the CLI scenarios and the tests.
//!
//! `Member` rows reference `Team` through the nullable `team_id` column, exposed
//! as the `team` association.

use std::convert::TryFrom;
use crate::engine::{expression::EntityPath, materializer::Entity};
use crate::store::RowStore;
use crate::utils::{
    error::{EngineError, EngineResult},
    types::{DataType, RowId, Schema, Value},
};

pub const MEMBER: &str = "Member";
pub const TEAM: &str = "Team";

pub fn member_schema() -> Schema {
    Schema::new(MEMBER)
        .with_column("username", DataType::Text, true)
        .with_column("age", DataType::Integer, false)
        .with_foreign_key("team_id", "team", TEAM)
}

pub fn team_schema() -> Schema {
    Schema::new(TEAM).with_column("name", DataType::Text, true)
}

/// `Member` under its default alias `member`
pub fn member() -> EntityPath {
    member_as("member")
}

pub fn member_as(alias: &str) -> EntityPath {
    EntityPath::new(MEMBER, alias)
}

/// `Team` under its default alias `team`
pub fn team() -> EntityPath {
    team_as("team")
}

pub fn team_as(alias: &str) -> EntityPath {
    EntityPath::new(TEAM, alias)
}

/// Register both tables, referenced table first
pub fn create_tables(store: &RowStore) -> EngineResult<()> {
    store.create_table(team_schema())?;
    store.create_table(member_schema())?;
    Ok(())
}

fn insert_member(store: &RowStore, username: Option<&str>, age: i64, team: Option<RowId>) -> EngineResult<RowId> {
    store.insert_named(
        MEMBER,
        &[
            ("username", Value::from(username)),
            ("age", Value::Integer(age)),
            ("team_id", Value::from(team.map(|id| id.0))),
        ],
    )
}

/// teamA holds member1 and member2, teamB holds member3 and member4; ages 10 to 40
pub fn seed(store: &RowStore) -> EngineResult<()> {
    let team_a = store.insert_named(TEAM, &[("name", "teamA".into())])?;
    let team_b = store.insert_named(TEAM, &[("name", "teamB".into())])?;

    insert_member(store, Some("member1"), 10, Some(team_a))?;
    insert_member(store, Some("member2"), 20, Some(team_a))?;
    insert_member(store, Some("member3"), 30, Some(team_b))?;
    insert_member(store, Some("member4"), 40, Some(team_b))?;
    Ok(())
}

/// Three members aged 100, one of them without a username
pub fn seed_sort_rows(store: &RowStore) -> EngineResult<()> {
    insert_member(store, None, 100, None)?;
    insert_member(store, Some("member5"), 100, None)?;
    insert_member(store, Some("member6"), 100, None)?;
    Ok(())
}

/// Members named after teams, for joins on unrelated columns
pub fn seed_theta_rows(store: &RowStore) -> EngineResult<()> {
    for name in ["teamA", "teamB", "teamC"] {
        insert_member(store, Some(name), 0, None)?;
    }
    Ok(())
}

/// Typed view of a `Member` entity
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: RowId,
    pub username: Option<String>,
    pub age: i64,
    pub team_id: Option<RowId>,
}

/// Typed view of a `Team` entity
#[derive(Debug, Clone, PartialEq)]
pub struct Team {
    pub id: RowId,
    pub name: Option<String>,
}

fn expect_table(entity: &Entity, table: &str) -> EngineResult<()> {
    if entity.table() != table {
        return Err(EngineError::Execution(format!(
            "cannot read a {} from a {} entity",
            table,
            entity.table()
        )));
    }
    Ok(())
}

impl TryFrom<&Entity> for Member {
    type Error = EngineError;

    fn try_from(entity: &Entity) -> EngineResult<Self> {
        expect_table(entity, MEMBER)?;
        let age = entity
            .get_i64("age")
            .ok_or_else(|| EngineError::Execution(format!("member {} has no age", entity.id())))?;

        Ok(Member {
            id: entity.id(),
            username: entity.get_str("username").map(str::to_string),
            age,
            team_id: entity.get_i64("team_id").map(RowId),
        })
    }
}

impl TryFrom<&Entity> for Team {
    type Error = EngineError;

    fn try_from(entity: &Entity) -> EngineResult<Self> {
        expect_table(entity, TEAM)?;
        Ok(Team {
            id: entity.id(),
            name: entity.get_str("name").map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_links_members_to_teams() {
        let store = RowStore::new();
        create_tables(&store).unwrap();
        seed(&store).unwrap();

        assert_eq!(store.row_count(TEAM).unwrap(), 2);
        assert_eq!(store.row_count(MEMBER).unwrap(), 4);

        let snapshot = store.snapshot();
        let schema = snapshot.schema(MEMBER).unwrap().clone();
        let rows = snapshot.rows(MEMBER).unwrap();
        let members: Vec<Member> = rows
            .iter()
            .map(|row| Member::try_from(&Entity::from_row(schema.clone(), row)).unwrap())
            .collect();

        assert_eq!(members[0].username.as_deref(), Some("member1"));
        assert_eq!(members[0].team_id, Some(RowId(1)));
        assert_eq!(members[3].age, 40);
        assert_eq!(members[3].team_id, Some(RowId(2)));
    }

    #[test]
    fn test_typed_record_checks_table() {
        let store = RowStore::new();
        create_tables(&store).unwrap();
        seed(&store).unwrap();

        let snapshot = store.snapshot();
        let schema = snapshot.schema(TEAM).unwrap().clone();
        let team = Entity::from_row(schema, &snapshot.rows(TEAM).unwrap()[0]);

        assert_eq!(Team::try_from(&team).unwrap().name.as_deref(), Some("teamA"));
        match Member::try_from(&team) {
            Err(EngineError::Execution(msg)) => assert!(msg.contains("Member")),
            other => panic!("Expected Execution error, got {:?}", other),
        }
    }

    #[test]
    fn test_extra_rows() {
        let store = RowStore::new();
        create_tables(&store).unwrap();
        seed_sort_rows(&store).unwrap();
        seed_theta_rows(&store).unwrap();

        let rows = store.scan(MEMBER).unwrap();
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[0].values[1], Value::Null);
        assert_eq!(rows[5].values[1], Value::from("teamC"));
    }
}
