//! Schema registration
//!
//! A table is declared once with its name and an ordered list of secondary
//! index specifications. The main by-id index is implicit and always
//! present at position 0.

use vial_core::EntityComparator;

/// One secondary index: an ordering plus a uniqueness flag
pub struct IndexSpec {
    /// Key ordering for the index
    pub comparator: Box<dyn EntityComparator>,
    /// Reject duplicate keys across distinct ids
    pub unique: bool,
}

impl IndexSpec {
    /// Declare a secondary index
    pub fn new(comparator: Box<dyn EntityComparator>, unique: bool) -> Self {
        IndexSpec { comparator, unique }
    }
}

/// A table declaration: name plus secondary indexes
pub struct TableSpec {
    /// Registry name, unique within the store
    pub name: String,
    /// Secondary indexes in registration order (index ids 1..)
    pub indexes: Vec<IndexSpec>,
}

impl TableSpec {
    /// Declare a table with no secondary indexes
    pub fn new(name: impl Into<String>) -> Self {
        TableSpec {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    /// Append a secondary index
    pub fn with_index(mut self, comparator: Box<dyn EntityComparator>, unique: bool) -> Self {
        self.indexes.push(IndexSpec::new(comparator, unique));
        self
    }
}
