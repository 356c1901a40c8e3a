//! End-to-end smoke test through the public facade
//!
//! Exercises the whole pipeline, from schema registration and staged
//! writes through batched commit, snapshot reads, deletes, and background
//! GC, the way an
//! embedding application would.

use std::any::Any;
use std::cmp::Ordering;
use std::sync::Arc;
use vialdb::{Config, Database, Entity, EntityComparator, TableSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Book {
    id: u64,
    title: String,
    year: u32,
}

impl Book {
    fn new(title: &str, year: u32) -> Self {
        Book {
            id: 0,
            title: title.to_string(),
            year,
        }
    }
}

impl Entity for Book {
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
    fn merge(&self, _base: Option<&dyn Entity>) -> Option<Box<dyn Entity>> {
        Some(Box::new(self.clone()))
    }
    fn clone_entity(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct TitleComparator;

impl EntityComparator for TitleComparator {
    fn compare(&self, a: &dyn Entity, b: &dyn Entity) -> Ordering {
        title_of(a).cmp(title_of(b))
    }
    fn key_string(&self, entity: &dyn Entity) -> String {
        format!("title:{}", title_of(entity))
    }
}

fn title_of(entity: &dyn Entity) -> &str {
    entity
        .as_any()
        .downcast_ref::<Book>()
        .map(|book| book.title.as_str())
        .unwrap_or("")
}

fn book_of(entity: &Arc<dyn Entity>) -> Book {
    entity.as_any().downcast_ref::<Book>().unwrap().clone()
}

#[test]
fn test_store_lifecycle() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let db = Database::with_config(
        Config::builder()
            .core_pool_size(2)
            .commit_batch_size(8)
            .build(),
    );
    db.create_table(TableSpec::new("book").with_index(Box::new(TitleComparator), true))
        .unwrap();

    // two independent tables commit through independent queues
    db.create_table(TableSpec::new("shelf")).unwrap();

    let mut tx = db.begin();
    for i in 0..50u32 {
        tx.create_or_update("book", vec![Box::new(Book::new(&format!("title{:02}", i), 1970 + i))])
            .unwrap();
    }
    tx.commit().unwrap();

    // range over the title index
    let tx = db.begin();
    let shelf: Vec<Book> = tx
        .query_by_index(
            "book",
            1,
            Some(&Book::new("title10", 0)),
            true,
            Some(&Book::new("title20", 0)),
            false,
        )
        .unwrap()
        .iter()
        .map(book_of)
        .collect();
    assert_eq!(shelf.len(), 10);
    assert!(shelf.windows(2).all(|pair| pair[0].title < pair[1].title));

    // delete and verify across both index paths
    let mut tx = db.begin();
    tx.remove_by_id("book", &[11]).unwrap();
    tx.commit().unwrap();

    let tx = db.begin();
    assert!(tx.get_by_id("book", 11).unwrap().is_none());
    assert!(tx
        .get_by_index("book", 1, &Book::new("title10", 0))
        .unwrap()
        .is_none());
    let rest = tx
        .query_by_index("book", 1, None, true, None, true)
        .unwrap();
    assert_eq!(rest.len(), 49);

    db.shutdown();
}

#[test]
fn test_two_instances_are_isolated() {
    let first = Database::new();
    let second = Database::new();
    first.create_table(TableSpec::new("book")).unwrap();
    second.create_table(TableSpec::new("book")).unwrap();

    let mut tx = first.begin();
    tx.create_or_update("book", vec![Box::new(Book::new("only in first", 2000))])
        .unwrap();
    tx.commit().unwrap();

    let tx = second.begin();
    assert!(tx.get_by_id("book", 1).unwrap().is_none());
    assert_eq!(second.visible_revision(), 0);
    assert!(first.visible_revision() >= 1);
}
