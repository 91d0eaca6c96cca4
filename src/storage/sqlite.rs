use super::{QueuesStorage, StorageError};
use crate::message::{Message, MessageFlags};
use bytes::Bytes;
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

/// File-backed [`QueuesStorage`] on an embedded SQLite database.
///
/// One `items` table holds everything; push order is preserved through the
/// implicit rowid. The uuid column stores the 32-char lowercase hex form of
/// the raw 16 bytes. A `NULL` ttl means the message never expires.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Open (creating the schema if needed) and compact the database.
    pub fn open(path: impl AsRef<Path>) -> Result<SqliteStorage, StorageError> {
        let conn = Connection::open(path.as_ref())?;
        let mut storage = SqliteStorage { conn };
        storage.ensure_schema()?;
        storage.conn.execute_batch("VACUUM")?;
        debug!("sqlite queue storage open at {:?}", path.as_ref());
        Ok(storage)
    }

    fn ensure_schema(&mut self) -> Result<(), StorageError> {
        let tables: i64 = self.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'items'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            self.conn.execute_batch(
                "CREATE TABLE items (
                     queue_name TEXT NOT NULL,
                     uuid TEXT NOT NULL,
                     data BLOB NOT NULL,
                     ttl REAL,
                     flags INTEGER NOT NULL
                 );
                 CREATE INDEX items_queue_name ON items (queue_name);
                 CREATE INDEX items_uuid ON items (uuid);",
            )?;
        }
        Ok(())
    }
}

impl QueuesStorage for SqliteStorage {
    fn get_queues(&mut self) -> Result<Vec<String>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT DISTINCT queue_name FROM items")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn get_items(&mut self, queue_name: &str) -> Result<Vec<Message>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid, data, ttl, flags FROM items WHERE queue_name = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![queue_name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Option<f64>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (uuid, data, ttl, flags) = row?;
            let uuid = Uuid::parse_str(&uuid)
                .map_err(|e| StorageError::Backend(format!("corrupt uuid column: {}", e)))?;
            items.push(Message {
                uuid,
                data: Bytes::from(data),
                ttl: ttl.map(|t| t as f32),
                flags: MessageFlags::from_bits_truncate(flags as u32),
            });
        }
        Ok(items)
    }

    fn push(&mut self, queue_name: &str, item: &Message) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO items (queue_name, uuid, data, ttl, flags) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                queue_name,
                item.uuid.simple().to_string(),
                item.data.as_ref(),
                item.ttl.map(f64::from),
                item.flags.bits(),
            ],
        )?;
        Ok(())
    }

    fn delete_items(&mut self, items: &[Message]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        for item in items {
            tx.execute(
                "DELETE FROM items WHERE uuid = ?1",
                params![item.uuid.simple().to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn update_items_ttl(&mut self, items: &[Message]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        for item in items {
            tx.execute(
                "UPDATE items SET ttl = ?1 WHERE uuid = ?2",
                params![item.ttl.map(f64::from), item.uuid.simple().to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn open_fresh() -> (TempDir, SqliteStorage) {
        let dir = TempDir::new("wireq-sqlite").unwrap();
        let storage = SqliteStorage::open(dir.path().join("queues.db")).unwrap();
        (dir, storage)
    }

    fn item(data: &'static [u8], ttl: Option<f32>, flags: MessageFlags) -> Message {
        Message {
            uuid: Uuid::new_v4(),
            data: Bytes::from_static(data),
            ttl,
            flags,
        }
    }

    #[test]
    fn test_roundtrip_preserves_fields_and_order() {
        let (_dir, mut storage) = open_fresh();
        let first = item(b"first", Some(12.5), MessageFlags::PERSISTENT);
        let second = item(b"second", None, MessageFlags::PERSISTENT);
        storage.push("bob", &first).unwrap();
        storage.push("bob", &second).unwrap();
        storage.push("alice", &item(b"other", Some(1.0), MessageFlags::PERSISTENT)).unwrap();

        let mut queues = storage.get_queues().unwrap();
        queues.sort();
        assert_eq!(queues, vec!["alice".to_string(), "bob".to_string()]);

        let items = storage.get_items("bob").unwrap();
        assert_eq!(items, vec![first, second]);
        assert_eq!(items[1].ttl, None, "NULL ttl must come back as infinite");

        assert!(storage.get_items("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_items_survive_reopen() {
        let dir = TempDir::new("wireq-sqlite").unwrap();
        let path = dir.path().join("queues.db");

        let stored = item(b"payload", Some(60.0), MessageFlags::PERSISTENT);
        {
            let mut storage = SqliteStorage::open(&path).unwrap();
            storage.push("bob", &stored).unwrap();
        }

        let mut storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.get_items("bob").unwrap(), vec![stored]);
    }

    #[test]
    fn test_delete_items() {
        let (_dir, mut storage) = open_fresh();
        let keep = item(b"keep", Some(1.0), MessageFlags::PERSISTENT);
        let gone = item(b"gone", Some(1.0), MessageFlags::PERSISTENT);
        storage.push("bob", &keep).unwrap();
        storage.push("bob", &gone).unwrap();

        storage.delete_items(std::slice::from_ref(&gone)).unwrap();
        assert_eq!(storage.get_items("bob").unwrap(), vec![keep]);
    }

    #[test]
    fn test_update_items_ttl() {
        let (_dir, mut storage) = open_fresh();
        let mut stored = item(b"x", Some(10.0), MessageFlags::PERSISTENT);
        storage.push("bob", &stored).unwrap();

        stored.ttl = Some(3.5);
        storage.update_items_ttl(std::slice::from_ref(&stored)).unwrap();
        assert_eq!(storage.get_items("bob").unwrap()[0].ttl, Some(3.5));
    }
}
