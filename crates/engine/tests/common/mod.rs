//! Shared test fixtures: a Person record, its partial-update form, and the
//! comparators for its secondary indexes.

#![allow(dead_code)]

use std::any::Any;
use std::cmp::Ordering;
use vial_engine::{Entity, EntityComparator, TableSpec};

pub const PERSON: &str = "person";
/// Unique secondary index over the name field.
pub const BY_NAME: usize = 1;
/// Non-unique secondary index over the age field.
pub const BY_AGE: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Person {
    pub id: u64,
    pub name: String,
    pub age: u32,
}

impl Person {
    pub fn new(name: &str, age: u32) -> Self {
        Person {
            id: 0,
            name: name.to_string(),
            age,
        }
    }

    /// A probe entity carrying only key fields, for index lookups.
    pub fn probe(name: &str) -> Self {
        Person::new(name, 0)
    }
}

impl Entity for Person {
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
    fn merge(&self, _base: Option<&dyn Entity>) -> Option<Box<dyn Entity>> {
        // a complete record: insert, or overwrite every field
        Some(Box::new(self.clone()))
    }
    fn clone_entity(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Partial update of a [`Person`]: unset fields fall back to the version
/// the update was built from for ordering, and to the live base at merge.
#[derive(Debug, Clone, Default)]
pub struct PersonUpdate {
    pub id: u64,
    pub name: Option<String>,
    pub age: Option<u32>,
    base: Option<Person>,
}

impl PersonUpdate {
    pub fn of(person: &Person) -> Self {
        PersonUpdate {
            id: person.id,
            name: None,
            age: None,
            base: Some(person.clone()),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_age(mut self, age: u32) -> Self {
        self.age = Some(age);
        self
    }

    fn name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.base.as_ref().map(|base| base.name.as_str()))
            .unwrap_or("")
    }

    fn age(&self) -> u32 {
        self.age
            .or(self.base.as_ref().map(|base| base.age))
            .unwrap_or(0)
    }
}

impl Entity for PersonUpdate {
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
    fn merge(&self, base: Option<&dyn Entity>) -> Option<Box<dyn Entity>> {
        // an update without a surviving target stores nothing
        let live = base?.as_any().downcast_ref::<Person>()?;
        Some(Box::new(Person {
            id: self.id,
            name: self.name.clone().unwrap_or_else(|| live.name.clone()),
            age: self.age.unwrap_or(live.age),
        }))
    }
    fn clone_entity(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn name_of(entity: &dyn Entity) -> &str {
    if let Some(person) = entity.as_any().downcast_ref::<Person>() {
        &person.name
    } else if let Some(update) = entity.as_any().downcast_ref::<PersonUpdate>() {
        update.name()
    } else {
        ""
    }
}

pub fn age_of(entity: &dyn Entity) -> u32 {
    if let Some(person) = entity.as_any().downcast_ref::<Person>() {
        person.age
    } else if let Some(update) = entity.as_any().downcast_ref::<PersonUpdate>() {
        update.age()
    } else {
        0
    }
}

pub struct NameComparator;

impl EntityComparator for NameComparator {
    fn compare(&self, a: &dyn Entity, b: &dyn Entity) -> Ordering {
        name_of(a).cmp(name_of(b))
    }
    fn key_string(&self, entity: &dyn Entity) -> String {
        format!("name:{}", name_of(entity))
    }
}

pub struct AgeComparator;

impl EntityComparator for AgeComparator {
    fn compare(&self, a: &dyn Entity, b: &dyn Entity) -> Ordering {
        age_of(a).cmp(&age_of(b))
    }
    fn key_string(&self, entity: &dyn Entity) -> String {
        format!("age:{}", age_of(entity))
    }
}

/// The standard fixture table: main id index, unique name index,
/// non-unique age index.
pub fn person_table() -> TableSpec {
    TableSpec::new(PERSON)
        .with_index(Box::new(NameComparator), true)
        .with_index(Box::new(AgeComparator), false)
}

pub fn as_person(entity: &dyn Entity) -> Person {
    entity
        .as_any()
        .downcast_ref::<Person>()
        .expect("expected a Person")
        .clone()
}
