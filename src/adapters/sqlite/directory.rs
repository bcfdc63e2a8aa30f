use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

use super::DbPool;
use crate::store::{DirectoryStore, EntityHandle, EntityKind, LocalEntity, PropertyValue};
use crate::types::error::{GabError, Result};

/// SQLite-backed store for the mirrored entities of one directory
pub struct SqliteDirectoryStore {
    pool: DbPool,
    directory: String,
}

impl SqliteDirectoryStore {
    pub fn new(pool: DbPool, directory: &str) -> Self {
        Self {
            pool,
            directory: directory.to_string(),
        }
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn split_value(value: &PropertyValue) -> (Option<i64>, Option<&str>) {
    match value {
        PropertyValue::Int(v) => (Some(*v), None),
        PropertyValue::Text(s) => (None, Some(s.as_str())),
    }
}

fn join_value(value_int: Option<i64>, value_text: Option<String>) -> Option<PropertyValue> {
    match (value_int, value_text) {
        (_, Some(text)) => Some(PropertyValue::Text(text)),
        (Some(v), None) => Some(PropertyValue::Int(v)),
        (None, None) => None,
    }
}

impl DirectoryStore for SqliteDirectoryStore {
    fn create(&self, kind: EntityKind) -> Result<LocalEntity> {
        Ok(LocalEntity::new(
            EntityHandle::new(Uuid::new_v4().to_string()),
            kind,
        ))
    }

    fn load(&self, handle: &EntityHandle) -> Result<Option<LocalEntity>> {
        let conn = self.pool.get()?;

        let row = conn
            .query_row(
                "SELECT kind, body, picture FROM directory_entities
                 WHERE handle = ?1 AND directory = ?2",
                params![handle.as_str(), self.directory],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                    ))
                },
            )
            .optional()?;

        let (kind, body, picture) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let kind = EntityKind::from_str(&kind)
            .ok_or_else(|| GabError::Database(format!("Unknown entity kind: {}", kind)))?;

        let mut entity = LocalEntity::new(handle.clone(), kind);
        entity.body = body;
        entity.picture = picture;

        let mut stmt = conn.prepare(
            "SELECT name, value_int, value_text FROM entity_properties WHERE handle = ?1",
        )?;
        let rows = stmt.query_map(params![handle.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        for row in rows {
            let (name, value_int, value_text) = row?;
            if let Some(value) = join_value(value_int, value_text) {
                entity.properties.insert(name, value);
            }
        }

        let mut stmt = conn.prepare(
            "SELECT member_handle FROM group_members
             WHERE group_handle = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![handle.as_str()], |row| row.get::<_, String>(0))?;
        for row in rows {
            entity.members.push(EntityHandle::new(row?));
        }

        Ok(Some(entity))
    }

    fn save(&self, entity: &LocalEntity) -> Result<()> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_ms();

        tx.execute(
            "INSERT INTO directory_entities (handle, directory, kind, body, picture, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(handle) DO UPDATE SET
                kind = excluded.kind,
                body = excluded.body,
                picture = excluded.picture,
                updated_at = excluded.updated_at",
            params![
                entity.handle.as_str(),
                self.directory,
                entity.kind.as_str(),
                entity.body,
                entity.picture,
                now,
            ],
        )?;

        tx.execute(
            "DELETE FROM entity_properties WHERE handle = ?1",
            params![entity.handle.as_str()],
        )?;
        for (name, value) in &entity.properties {
            let (value_int, value_text) = split_value(value);
            tx.execute(
                "INSERT INTO entity_properties (handle, name, value_int, value_text)
                 VALUES (?1, ?2, ?3, ?4)",
                params![entity.handle.as_str(), name, value_int, value_text],
            )?;
        }

        tx.execute(
            "DELETE FROM group_members WHERE group_handle = ?1",
            params![entity.handle.as_str()],
        )?;
        for (position, member) in entity.members.iter().enumerate() {
            // Members deleted since they were added are dropped silently
            tx.execute(
                "INSERT INTO group_members (group_handle, member_handle, position)
                 SELECT ?1, ?2, ?3
                 WHERE EXISTS (SELECT 1 FROM directory_entities WHERE handle = ?2)",
                params![entity.handle.as_str(), member.as_str(), position as i64],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn delete(&self, handle: &EntityHandle) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM directory_entities WHERE handle = ?1 AND directory = ?2",
            params![handle.as_str(), self.directory],
        )?;
        Ok(())
    }

    fn is_live(&self, handle: &EntityHandle) -> bool {
        let conn = match self.pool.get() {
            Ok(conn) => conn,
            Err(_) => return false,
        };
        conn.query_row(
            "SELECT 1 FROM directory_entities WHERE handle = ?1 AND directory = ?2",
            params![handle.as_str(), self.directory],
            |_| Ok(()),
        )
        .optional()
        .map(|found| found.is_some())
        .unwrap_or(false)
    }

    fn search(&self, name: &str, value: &PropertyValue) -> Result<Vec<EntityHandle>> {
        let conn = self.pool.get()?;
        let sql = match value {
            PropertyValue::Text(_) => {
                "SELECT p.handle FROM entity_properties p
                 JOIN directory_entities e ON e.handle = p.handle
                 WHERE e.directory = ?1 AND p.name = ?2 AND p.value_text = ?3
                 ORDER BY e.created_at, e.rowid"
            }
            PropertyValue::Int(_) => {
                "SELECT p.handle FROM entity_properties p
                 JOIN directory_entities e ON e.handle = p.handle
                 WHERE e.directory = ?1 AND p.name = ?2 AND p.value_int = ?3
                 ORDER BY e.created_at, e.rowid"
            }
        };

        let mut stmt = conn.prepare(sql)?;
        let handles: Vec<String> = match value {
            PropertyValue::Text(text) => stmt
                .query_map(params![self.directory, name, text], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?,
            PropertyValue::Int(v) => stmt
                .query_map(params![self.directory, name, v], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?,
        };

        Ok(handles.into_iter().map(EntityHandle::new).collect())
    }

    fn attach_picture(&self, entity: &mut LocalEntity, path: &Path) -> Result<()> {
        let data = std::fs::read(path)?;
        if data.is_empty() {
            return Err(GabError::InvalidInput(format!(
                "Empty picture file: {}",
                path.display()
            )));
        }
        entity.picture = Some(data);
        Ok(())
    }

    fn clear(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM directory_entities WHERE directory = ?1",
            params![self.directory],
        )?;
        debug!("Cleared {} entities from directory {}", removed, self.directory);
        Ok(removed)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM directory_entities WHERE directory = ?1",
            params![self.directory],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn index_property(&self, name: &str) -> Result<Option<PropertyValue>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT value_int, value_text FROM directory_index
                 WHERE directory = ?1 AND name = ?2",
                params![self.directory, name],
                |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;

        Ok(row.and_then(|(value_int, value_text)| join_value(value_int, value_text)))
    }

    fn set_index_properties(&self, properties: &[(&str, PropertyValue)]) -> Result<()> {
        let conn = self.pool.get()?;
        let tx = conn.unchecked_transaction()?;

        for (name, value) in properties {
            let (value_int, value_text) = split_value(value);
            tx.execute(
                "INSERT INTO directory_index (directory, name, value_int, value_text)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(directory, name) DO UPDATE SET
                    value_int = excluded.value_int,
                    value_text = excluded.value_text",
                params![self.directory, name, value_int, value_text],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn delete_index(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM directory_index WHERE directory = ?1",
            params![self.directory],
        )?;
        Ok(())
    }
}

/// All directories that have entities or an index in the database
pub fn known_directories(pool: &DbPool) -> Result<Vec<String>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT directory FROM directory_entities
         UNION
         SELECT directory FROM directory_index
         ORDER BY 1",
    )?;

    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut directories = Vec::new();
    for row in rows {
        directories.push(row?);
    }
    Ok(directories)
}

/// Remove every entity and the index of a directory
pub fn remove_directory(pool: &DbPool, directory: &str) -> Result<usize> {
    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;

    let removed = tx.execute(
        "DELETE FROM directory_entities WHERE directory = ?1",
        params![directory],
    )?;
    tx.execute(
        "DELETE FROM directory_index WHERE directory = ?1",
        params![directory],
    )?;

    tx.commit()?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::pool::create_memory_pool;

    fn store(directory: &str) -> (DbPool, SqliteDirectoryStore) {
        let pool = create_memory_pool().expect("Failed to create database");
        let store = SqliteDirectoryStore::new(pool.clone(), directory);
        (pool, store)
    }

    fn saved_contact(store: &SqliteDirectoryStore, id: &str) -> LocalEntity {
        let mut contact = store.create(EntityKind::Contact).unwrap();
        contact.set("directoryId", id);
        contact.set("fullName", format!("Contact {}", id));
        store.save(&contact).unwrap();
        contact
    }

    #[test]
    fn test_save_and_load_group_with_members() {
        let (_pool, store) = store("example.com");
        let alice = saved_contact(&store, "alice");
        let bob = saved_contact(&store, "bob");

        let mut group = store.create(EntityKind::Group).unwrap();
        group.set("dlName", "Team");
        group.set("displayTypeEx", 0i64);
        group.add_member(&bob.handle);
        group.add_member(&alice.handle);
        store.save(&group).unwrap();

        let loaded = store.load(&group.handle).unwrap().expect("group not found");
        assert_eq!(loaded.kind, EntityKind::Group);
        assert_eq!(loaded.text("dlName"), Some("Team"));
        assert_eq!(loaded.int("displayTypeEx"), Some(0));
        assert_eq!(loaded.members, vec![bob.handle.clone(), alice.handle.clone()]);
    }

    #[test]
    fn test_delete_drops_membership_and_liveness() {
        let (_pool, store) = store("example.com");
        let alice = saved_contact(&store, "alice");

        let mut group = store.create(EntityKind::Group).unwrap();
        group.add_member(&alice.handle);
        store.save(&group).unwrap();

        assert!(store.is_live(&alice.handle));
        store.delete(&alice.handle).unwrap();
        assert!(!store.is_live(&alice.handle));

        let loaded = store.load(&group.handle).unwrap().unwrap();
        assert!(loaded.members.is_empty());
    }

    #[test]
    fn test_search_by_text_and_int() {
        let (_pool, store) = store("example.com");
        let alice = saved_contact(&store, "alice");
        saved_contact(&store, "bob");

        let found = store
            .search("directoryId", &PropertyValue::from("alice"))
            .unwrap();
        assert_eq!(found, vec![alice.handle.clone()]);

        let mut room = store.create(EntityKind::Contact).unwrap();
        room.set("displayTypeEx", 7i64);
        store.save(&room).unwrap();
        let rooms = store.search("displayTypeEx", &PropertyValue::Int(7)).unwrap();
        assert_eq!(rooms, vec![room.handle]);

        assert!(store
            .search_one("directoryId", &PropertyValue::from("carol"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_directories_are_isolated() {
        let pool = create_memory_pool().unwrap();
        let first = SqliteDirectoryStore::new(pool.clone(), "one.example");
        let second = SqliteDirectoryStore::new(pool.clone(), "two.example");

        let alice = saved_contact(&first, "alice");
        saved_contact(&second, "alice");
        first
            .set_index_properties(&[("currentSequence", PropertyValue::Int(3))])
            .unwrap();

        assert!(!second.is_live(&alice.handle));
        assert_eq!(second.load(&alice.handle).unwrap(), None);
        assert_eq!(
            known_directories(&pool).unwrap(),
            vec!["one.example".to_string(), "two.example".to_string()]
        );

        assert_eq!(first.clear().unwrap(), 1);
        assert_eq!(first.count().unwrap(), 0);
        assert_eq!(second.count().unwrap(), 1);

        assert_eq!(remove_directory(&pool, "two.example").unwrap(), 1);
        assert_eq!(known_directories(&pool).unwrap(), vec!["one.example".to_string()]);
    }

    #[test]
    fn test_index_properties() {
        let (_pool, store) = store("example.com");
        assert_eq!(store.index_property("currentSequence").unwrap(), None);

        store
            .set_index_properties(&[
                ("currentSequence", PropertyValue::Int(4)),
                ("lastProcessed", PropertyValue::from(";;;")),
            ])
            .unwrap();
        assert_eq!(
            store.index_property("currentSequence").unwrap(),
            Some(PropertyValue::Int(4))
        );
        assert_eq!(
            store.index_property("lastProcessed").unwrap(),
            Some(PropertyValue::from(";;;"))
        );

        store.delete_index().unwrap();
        assert_eq!(store.index_property("currentSequence").unwrap(), None);
    }

    #[test]
    fn test_attach_picture_reads_file() {
        let (_pool, store) = store("example.com");
        let mut contact = store.create(EntityKind::Contact).unwrap();

        let path = std::env::temp_dir().join(format!("gab-sync-test-{}.jpg", Uuid::new_v4()));
        std::fs::write(&path, [0xFFu8, 0xD8, 0xFF]).unwrap();
        store.attach_picture(&mut contact, &path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(contact.picture, Some(vec![0xFF, 0xD8, 0xFF]));
        store.save(&contact).unwrap();
        let loaded = store.load(&contact.handle).unwrap().unwrap();
        assert_eq!(loaded.picture, Some(vec![0xFF, 0xD8, 0xFF]));
    }
}
