//! Table registry

use crate::schema::TableSpec;
use crate::table::EntityTable;
use dashmap::DashMap;
use std::sync::Arc;
use vial_core::{Error, Result};

/// Registry mapping a table name to its [`EntityTable`]
#[derive(Default)]
pub struct EntityStore {
    tables: DashMap<String, Arc<EntityTable>>,
}

impl EntityStore {
    /// Create an empty registry
    pub fn new() -> Self {
        EntityStore::default()
    }

    /// Register a table; rejects duplicate names
    pub fn create_table(&self, spec: TableSpec) -> Result<Arc<EntityTable>> {
        let name = spec.name.clone();
        let table = Arc::new(EntityTable::from_spec(spec));
        match self.tables.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::TableExists { name }),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&table));
                Ok(table)
            }
        }
    }

    /// Look up a table by name
    pub fn table(&self, name: &str) -> Result<Arc<EntityTable>> {
        self.tables
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::UnknownTable {
                name: name.to_string(),
            })
    }

    /// All registered tables
    pub fn tables(&self) -> Vec<Arc<EntityTable>> {
        self.tables
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Collect superseded versions in every table
    pub fn garbage_collect(&self, floor_revision: u64) {
        for entry in self.tables.iter() {
            entry.value().garbage_collect(floor_revision);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_table_rejected() {
        let store = EntityStore::new();
        store.create_table(TableSpec::new("person")).unwrap();
        assert!(matches!(
            store.create_table(TableSpec::new("person")),
            Err(Error::TableExists { .. })
        ));
    }

    #[test]
    fn test_unknown_table() {
        let store = EntityStore::new();
        assert!(matches!(
            store.table("ghost"),
            Err(Error::UnknownTable { .. })
        ));
    }
}
