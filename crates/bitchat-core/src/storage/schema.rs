//! Database schema definitions.

/// Schema version for migrations.
pub const SCHEMA_VERSION: u32 = 1;

/// SQL to create the database schema.
pub const CREATE_SCHEMA: &str = r#"
-- This node's keys (exactly one row)
CREATE TABLE IF NOT EXISTS identity (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    static_secret BLOB NOT NULL,
    signing_secret BLOB NOT NULL,
    created_at INTEGER NOT NULL
);

-- Peers seen on the mesh
CREATE TABLE IF NOT EXISTS peers (
    peer_id BLOB PRIMARY KEY,
    static_public_key BLOB NOT NULL,
    signing_public_key BLOB,
    nickname TEXT NOT NULL,
    trust_level TEXT NOT NULL DEFAULT 'unknown',
    is_favorite INTEGER NOT NULL DEFAULT 0,
    is_blocked INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_peers_last_seen ON peers(last_seen);

-- Settings table
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);

-- Schema version
INSERT OR REPLACE INTO settings (key, value) VALUES ('schema_version', ?);
"#;
