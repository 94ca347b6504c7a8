//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety.
//! Each commit replaces one record in a single write transaction, so a crash
//! leaves either the old record or the new one.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};

use super::{ConversationRecord, RowLock, RowLocks, Storage, StorageError};

/// Table: conversations
/// Key: conversation id
/// Value: CBOR-encoded ConversationRecord
const CONVERSATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("conversations");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc). Row
/// locks are process-local; one process owns the database file.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
    locks: RowLocks,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates the CONVERSATIONS table if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io_error)?;

        let txn = db.begin_write().map_err(io_error)?;
        {
            let _ = txn.open_table(CONVERSATIONS).map_err(io_error)?;
        }
        txn.commit().map_err(io_error)?;

        Ok(Self { db: Arc::new(db), locks: RowLocks::new() })
    }
}

impl Storage for RedbStorage {
    fn create_conversation(
        &self,
        conversation_id: &str,
        record: &ConversationRecord,
    ) -> Result<(), StorageError> {
        let bytes = encode_record(record)?;

        let txn = self.db.begin_write().map_err(io_error)?;
        {
            let mut table = txn.open_table(CONVERSATIONS).map_err(io_error)?;

            if table.get(conversation_id).map_err(io_error)?.is_some() {
                return Err(StorageError::AlreadyExists {
                    conversation_id: conversation_id.to_string(),
                });
            }

            table.insert(conversation_id, bytes.as_slice()).map_err(io_error)?;
        }
        txn.commit().map_err(io_error)?;

        Ok(())
    }

    fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(io_error)?;
        let table = txn.open_table(CONVERSATIONS).map_err(io_error)?;

        match table.get(conversation_id).map_err(io_error)? {
            Some(value) => Ok(Some(decode_record(value.value())?)),
            None => Ok(None),
        }
    }

    fn lock_conversation(&self, conversation_id: &str) -> Result<RowLock, StorageError> {
        self.locks.acquire(conversation_id)
    }

    fn commit_conversation(
        &self,
        conversation_id: &str,
        expected_version: u64,
        record: &ConversationRecord,
    ) -> Result<(), StorageError> {
        debug_assert_eq!(record.version, expected_version + 1);

        let bytes = encode_record(record)?;

        // Dropping an uncommitted write transaction aborts it, so every early
        // return below leaves the stored record untouched.
        let txn = self.db.begin_write().map_err(io_error)?;
        {
            let mut table = txn.open_table(CONVERSATIONS).map_err(io_error)?;

            let current_version = match table.get(conversation_id).map_err(io_error)? {
                Some(value) => decode_record(value.value())?.version,
                None => {
                    return Err(StorageError::NotFound {
                        conversation_id: conversation_id.to_string(),
                    });
                },
            };

            if current_version != expected_version {
                return Err(StorageError::Conflict {
                    expected: expected_version,
                    actual: current_version,
                });
            }

            table.insert(conversation_id, bytes.as_slice()).map_err(io_error)?;
        }
        txn.commit().map_err(io_error)?;

        Ok(())
    }

    fn list_conversations(&self, owner: &str) -> Result<Vec<String>, StorageError> {
        let txn = self.db.begin_read().map_err(io_error)?;
        let table = txn.open_table(CONVERSATIONS).map_err(io_error)?;

        let mut ids = Vec::new();
        for entry in table.iter().map_err(io_error)? {
            let (key, value) = entry.map_err(io_error)?;
            let record = decode_record(value.value())?;
            if record.owner == owner && !record.deleted {
                ids.push(key.value().to_string());
            }
        }

        Ok(ids)
    }
}

fn io_error(err: impl std::fmt::Display) -> StorageError {
    StorageError::Io(err.to_string())
}

fn encode_record(record: &ConversationRecord) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(record, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode_record(bytes: &[u8]) -> Result<ConversationRecord, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}
