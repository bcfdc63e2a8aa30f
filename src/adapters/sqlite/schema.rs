use rusqlite::Connection;

use crate::types::error::GabError;

pub fn initialize_schema(conn: &Connection) -> Result<(), GabError> {
    conn.execute_batch("
        -- Mirrored contacts and groups, one row per entity.
        -- Every row belongs to exactly one directory (the GAB domain).
        CREATE TABLE IF NOT EXISTS directory_entities (
            handle          TEXT PRIMARY KEY,   -- UUID
            directory       TEXT NOT NULL,
            kind            TEXT NOT NULL,      -- contact, group
            body            TEXT,
            picture         BLOB,
            created_at      INTEGER NOT NULL,   -- unix epoch ms
            updated_at      INTEGER NOT NULL    -- unix epoch ms
        );

        CREATE INDEX IF NOT EXISTS idx_directory_entities_directory
            ON directory_entities(directory);

        -- Named properties attached to entities (directoryId, ownerChunk, fields).
        -- Exactly one of value_int / value_text is set.
        CREATE TABLE IF NOT EXISTS entity_properties (
            handle          TEXT NOT NULL REFERENCES directory_entities(handle) ON DELETE CASCADE,
            name            TEXT NOT NULL,
            value_int       INTEGER,
            value_text      TEXT,
            PRIMARY KEY (handle, name)
        );

        CREATE INDEX IF NOT EXISTS idx_entity_properties_text
            ON entity_properties(name, value_text);
        CREATE INDEX IF NOT EXISTS idx_entity_properties_int
            ON entity_properties(name, value_int);

        -- Group membership. Deleting either side drops the link.
        CREATE TABLE IF NOT EXISTS group_members (
            group_handle    TEXT NOT NULL REFERENCES directory_entities(handle) ON DELETE CASCADE,
            member_handle   TEXT NOT NULL REFERENCES directory_entities(handle) ON DELETE CASCADE,
            position        INTEGER NOT NULL,
            PRIMARY KEY (group_handle, member_handle)
        );

        CREATE INDEX IF NOT EXISTS idx_group_members_member
            ON group_members(member_handle);

        -- Hidden index entity per directory (chunk sequence and per-chunk tokens)
        CREATE TABLE IF NOT EXISTS directory_index (
            directory       TEXT NOT NULL,
            name            TEXT NOT NULL,
            value_int       INTEGER,
            value_text      TEXT,
            PRIMARY KEY (directory, name)
        );

        -- Chunk messages delivered by the external channel
        CREATE TABLE IF NOT EXISTS queue_messages (
            entry_id        TEXT PRIMARY KEY,
            queue           TEXT NOT NULL,
            subject         TEXT NOT NULL,
            body            TEXT NOT NULL,
            location        TEXT NOT NULL,      -- opaque version token
            revision        INTEGER NOT NULL,   -- monotonic, higher is newer
            modified_at     INTEGER NOT NULL    -- unix epoch ms
        );

        CREATE INDEX IF NOT EXISTS idx_queue_messages_revision
            ON queue_messages(queue, revision DESC);

        -- Application-defined tags on queue messages
        CREATE TABLE IF NOT EXISTS queue_message_properties (
            entry_id        TEXT NOT NULL REFERENCES queue_messages(entry_id) ON DELETE CASCADE,
            name            TEXT NOT NULL,
            value           TEXT NOT NULL,
            PRIMARY KEY (entry_id, name)
        );
    ")?;

    Ok(())
}
