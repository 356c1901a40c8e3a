//! Client-facing transaction handle
//!
//! A transaction fixes its snapshot revision at creation and stays
//! read-only until its first successful write. Reads merge its private
//! patches over the base indexes; writes stage into the patches only.
//! `commit` hands off to the coordinator and blocks until every table has
//! applied the assigned revision.
//!
//! # Lifecycle
//!
//! `Active` → `Committed` | `RolledBack` (terminal). Every operation on a
//! terminal transaction is rejected; that is always a caller bug. A failed
//! commit rolls the transaction back automatically after unwinding whatever
//! the attempt had grafted; retrying means opening a new transaction.

use crate::database::DatabaseInner;
use crate::table::MAIN_INDEX;
use std::sync::Arc;
use tracing::warn;
use vial_core::{Entity, Error, Result, Tombstone};

/// Where a transaction is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Accepting reads and writes
    Active,
    /// Terminal: all writes are visible at the commit revision
    Committed,
    /// Terminal: all writes were discarded
    RolledBack,
}

/// A snapshot-isolated unit of work
pub struct Transaction {
    db: Arc<DatabaseInner>,
    id: u64,
    snapshot_revision: u64,
    read_only: bool,
    status: TransactionStatus,
}

impl Transaction {
    pub(crate) fn new(db: Arc<DatabaseInner>, id: u64, snapshot_revision: u64) -> Self {
        Transaction {
            db,
            id,
            snapshot_revision,
            read_only: true,
            status: TransactionStatus::Active,
        }
    }

    /// This transaction's id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The revision bounding every read in this transaction
    pub fn snapshot_revision(&self) -> u64 {
        self.snapshot_revision
    }

    /// True until the first successful write
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Current lifecycle state
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Allocate an entity id from a table's counter
    pub fn next_id(&self, table: &str) -> Result<u64> {
        self.ensure_active()?;
        Ok(self.db.store.table(table)?.next_id())
    }

    /// Stage inserts or updates
    ///
    /// Updates with id `0` get a fresh id assigned. A uniqueness conflict
    /// against last-known committed state is reported immediately; the
    /// authoritative check still happens at commit.
    pub fn create_or_update(
        &mut self,
        table: &str,
        updates: Vec<Box<dyn Entity>>,
    ) -> Result<()> {
        self.ensure_active()?;
        self.db.store.table(table)?.put(self.id, updates)?;
        self.read_only = false;
        Ok(())
    }

    /// Stage deletions by id
    ///
    /// Ids with no live entity at the snapshot are ignored; a transaction
    /// that only deletes nothing stays read-only.
    pub fn remove_by_id(&mut self, table: &str, ids: &[u64]) -> Result<()> {
        self.ensure_active()?;
        let table = self.db.store.table(table)?;
        if table.remove(self.id, self.snapshot_revision, ids)? {
            self.read_only = false;
        }
        Ok(())
    }

    /// Read one entity by id
    pub fn get_by_id(&self, table: &str, id: u64) -> Result<Option<Arc<dyn Entity>>> {
        self.get_by_index(table, MAIN_INDEX, &Tombstone::new(id))
    }

    /// Read one entity through an index (0 = the main id index)
    pub fn get_by_index(
        &self,
        table: &str,
        index_id: usize,
        key: &dyn Entity,
    ) -> Result<Option<Arc<dyn Entity>>> {
        self.ensure_active()?;
        let table = self.db.store.table(table)?;
        let found = table.get_by_index(self.id, index_id, self.snapshot_revision, key);
        Ok(found.and_then(|version| {
            if version.is_tombstone() {
                None
            } else {
                Some(Arc::clone(version.entity()))
            }
        }))
    }

    /// Range scan through an index, in index order
    #[allow(clippy::too_many_arguments)]
    pub fn query_by_index(
        &self,
        table: &str,
        index_id: usize,
        from: Option<&dyn Entity>,
        from_inclusive: bool,
        to: Option<&dyn Entity>,
        to_inclusive: bool,
    ) -> Result<Vec<Arc<dyn Entity>>> {
        self.ensure_active()?;
        let table = self.db.store.table(table)?;
        Ok(table
            .query_by_index(
                self.id,
                index_id,
                self.snapshot_revision,
                from,
                from_inclusive,
                to,
                to_inclusive,
            )
            .into_iter()
            .map(|version| Arc::clone(version.entity()))
            .collect())
    }

    /// Commit all staged writes under one new revision
    ///
    /// A no-op for read-only transactions. Blocks until every table's
    /// committer has applied the revision. A conflict (or any pipeline
    /// failure) aborts the transaction: whatever the failed attempt managed
    /// to graft is unwound, the transaction becomes rolled-back, and the
    /// error is surfaced. Retrying means starting a new transaction.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        if !self.read_only {
            if let Err(error) = DatabaseInner::commit_transaction(&self.db, self.id) {
                for table in self.db.store.tables() {
                    if let Err(unwind_error) = table.rollback(self.id) {
                        warn!(
                            target: "vial::txn",
                            transaction_id = self.id,
                            table = table.name(),
                            %unwind_error,
                            "failed to unwind aborted commit"
                        );
                    }
                }
                self.status = TransactionStatus::RolledBack;
                self.db.close_transaction(self.id);
                return Err(error);
            }
        }
        self.status = TransactionStatus::Committed;
        self.db.close_transaction(self.id);
        Ok(())
    }

    /// Discard all staged writes, unwinding anything a failed commit
    /// already grafted
    pub fn rollback(&mut self) -> Result<()> {
        match self.status {
            TransactionStatus::Committed => {
                return Err(Error::TransactionCommitted { id: self.id })
            }
            TransactionStatus::RolledBack => return Ok(()),
            TransactionStatus::Active => {}
        }
        if !self.read_only {
            for table in self.db.store.tables() {
                table.rollback(self.id)?;
            }
        }
        self.status = TransactionStatus::RolledBack;
        self.db.close_transaction(self.id);
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        match self.status {
            TransactionStatus::Active => Ok(()),
            TransactionStatus::Committed => Err(Error::TransactionCommitted { id: self.id }),
            TransactionStatus::RolledBack => Err(Error::TransactionRolledBack { id: self.id }),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status != TransactionStatus::Active {
            return;
        }
        if !self.read_only {
            for table in self.db.store.tables() {
                if let Err(error) = table.rollback(self.id) {
                    warn!(
                        target: "vial::txn",
                        transaction_id = self.id,
                        table = table.name(),
                        %error,
                        "rollback on drop failed"
                    );
                }
            }
        }
        self.db.close_transaction(self.id);
    }
}
