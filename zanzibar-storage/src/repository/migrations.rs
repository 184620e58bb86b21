//! Relational schema for the PostgreSQL engine.

use database_layer::{Migration, MigrationRegistry, MigrationResult};

/// Every schema migration the PostgreSQL engine depends on.
///
/// # Errors
///
/// Fails only if two migrations share a version.
pub fn registry() -> MigrationResult<MigrationRegistry> {
    Ok(MigrationRegistry::builder()
        .register(
            Migration::new(1, "create tuple and changelog tables")
                .forward([
                    "CREATE TABLE IF NOT EXISTS tuple (
                        store TEXT NOT NULL,
                        object_type TEXT NOT NULL,
                        object_id TEXT NOT NULL,
                        relation TEXT NOT NULL,
                        _user TEXT NOT NULL,
                        user_type TEXT NOT NULL,
                        inserted_at TIMESTAMPTZ NOT NULL,
                        PRIMARY KEY (store, object_type, object_id, relation, _user)
                    )",
                    "CREATE TABLE IF NOT EXISTS changelog (
                        id BIGSERIAL PRIMARY KEY,
                        store TEXT NOT NULL,
                        object_type TEXT NOT NULL,
                        object_id TEXT NOT NULL,
                        relation TEXT NOT NULL,
                        _user TEXT NOT NULL,
                        operation INTEGER NOT NULL,
                        inserted_at TIMESTAMPTZ NOT NULL
                    )",
                ])
                .backward(["DROP TABLE IF EXISTS changelog", "DROP TABLE IF EXISTS tuple"]),
        )?
        .register(
            Migration::new(2, "index tuples for reverse lookups")
                .forward([
                    "CREATE INDEX IF NOT EXISTS idx_reverse_lookup_user \
                     ON tuple (store, object_type, relation, _user)",
                ])
                .backward(["DROP INDEX IF EXISTS idx_reverse_lookup_user"]),
        )?
        .register(
            Migration::new(3, "index changelog by insertion time")
                .forward([
                    "CREATE INDEX IF NOT EXISTS idx_changelog_store_inserted_at \
                     ON changelog (store, inserted_at)",
                ])
                .backward(["DROP INDEX IF EXISTS idx_changelog_store_inserted_at"]),
        )?
        .register(
            Migration::new(4, "add relationship conditions")
                .forward([
                    "ALTER TABLE tuple ADD COLUMN condition_name TEXT, \
                     ADD COLUMN condition_context BYTEA",
                    "ALTER TABLE changelog ADD COLUMN condition_name TEXT, \
                     ADD COLUMN condition_context BYTEA",
                ])
                .backward([
                    "ALTER TABLE tuple DROP COLUMN condition_name, DROP COLUMN condition_context",
                    "ALTER TABLE changelog DROP COLUMN condition_name, DROP COLUMN condition_context",
                ]),
        )?
        .build())
}
