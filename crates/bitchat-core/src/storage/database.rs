//! SQLite database operations.

use super::schema::{CREATE_SCHEMA, SCHEMA_VERSION};
use crate::crypto::X25519PublicKey;
use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityStore, Peer, PeerId, TrustLevel};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use tracing::debug;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the database file.
    pub path: String,
    /// Whether to use in-memory database (for testing).
    pub in_memory: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: super::DEFAULT_DB_NAME.to_string(),
            in_memory: false,
        }
    }
}

/// Database handle.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let conn = if config.in_memory {
            Connection::open_in_memory()
        } else {
            // Create parent directories if needed
            if let Some(parent) = Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Storage(format!("failed to create directory: {}", e)))?;
            }

            Connection::open_with_flags(
                &config.path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        }
        .map_err(|e| Error::Storage(format!("failed to open database: {}", e)))?;

        // secrets live in this file; keep deleted pages and temp data off disk
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = DELETE;
            PRAGMA secure_delete = ON;
            PRAGMA temp_store = MEMORY;
            "#,
        )
        .map_err(|e| Error::Storage(format!("failed to set pragmas: {}", e)))?;

        let db = Self { conn };
        db.init_schema()?;
        debug!(path = %config.path, in_memory = config.in_memory, "Database opened");

        Ok(db)
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&DatabaseConfig {
            path: ":memory:".to_string(),
            in_memory: true,
        })
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(&CREATE_SCHEMA.replace("?", &SCHEMA_VERSION.to_string()))
            .map_err(|e| Error::Storage(format!("failed to create schema: {}", e)))?;
        Ok(())
    }

    /// Schema version recorded in the database.
    pub fn schema_version(&self) -> Result<u32> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT CAST(value AS TEXT) FROM settings WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Storage(e.to_string()))?;

        value
            .ok_or_else(|| Error::Storage("schema version missing".into()))?
            .parse()
            .map_err(|e| Error::Storage(format!("bad schema version: {}", e)))
    }

    /// Store identity (only one allowed).
    pub fn store_identity(&self, identity: &Identity) -> Result<()> {
        let static_secret = identity.static_keypair().secret_bytes();
        let signing_secret = identity.signing_keypair().secret_bytes();
        let now = chrono::Utc::now().timestamp();

        self.conn
            .execute(
                r#"
                INSERT OR REPLACE INTO identity (id, static_secret, signing_secret, created_at)
                VALUES (1, ?, ?, ?)
                "#,
                params![static_secret.as_slice(), signing_secret.as_slice(), now],
            )
            .map_err(|e| Error::Storage(format!("failed to store identity: {}", e)))?;

        Ok(())
    }

    /// Load identity.
    pub fn load_identity(&self) -> Result<Option<Identity>> {
        let result = self.conn.query_row(
            "SELECT static_secret, signing_secret FROM identity WHERE id = 1",
            [],
            |row| {
                let static_secret: Vec<u8> = row.get(0)?;
                let signing_secret: Vec<u8> = row.get(1)?;
                Ok((static_secret, signing_secret))
            },
        );

        match result {
            Ok((static_secret, signing_secret)) => {
                let identity = Identity::from_secret_bytes(
                    &zeroize::Zeroizing::new(static_secret),
                    &zeroize::Zeroizing::new(signing_secret),
                )?;
                Ok(Some(identity))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    /// Insert or update a peer record.
    ///
    /// Connection state is not stored; every loaded peer starts disconnected.
    pub fn save_peer(&self, peer: &Peer) -> Result<()> {
        PeerWriter { conn: &self.conn }.write(peer)
    }

    /// Save many peers in one transaction.
    pub fn save_peers<'a>(&mut self, peers: impl IntoIterator<Item = &'a Peer>) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| Error::Storage(format!("failed to begin transaction: {}", e)))?;

        let mut count = 0;
        {
            let writer = PeerWriter { conn: &tx };
            for peer in peers {
                writer.write(peer)?;
                count += 1;
            }
        }

        tx.commit()
            .map_err(|e| Error::Storage(format!("failed to commit peers: {}", e)))?;
        Ok(count)
    }

    /// Load a single peer.
    pub fn load_peer(&self, id: &PeerId) -> Result<Option<Peer>> {
        self.conn
            .query_row(
                &format!("{} WHERE peer_id = ?", SELECT_PEER),
                params![id.as_bytes().as_slice()],
                read_peer_row,
            )
            .optional()
            .map_err(|e| Error::Storage(e.to_string()))?
            .transpose()
    }

    /// Load every stored peer, most recently seen first.
    pub fn load_peers(&self) -> Result<Vec<Peer>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY last_seen DESC", SELECT_PEER))
            .map_err(|e| Error::Storage(e.to_string()))?;

        let rows = stmt
            .query_map([], read_peer_row)
            .map_err(|e| Error::Storage(e.to_string()))?;

        let mut peers = Vec::new();
        for row in rows {
            peers.push(row.map_err(|e| Error::Storage(e.to_string()))??);
        }
        Ok(peers)
    }

    /// Delete a peer record. Returns whether one existed.
    pub fn delete_peer(&self, id: &PeerId) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM peers WHERE peer_id = ?",
                params![id.as_bytes().as_slice()],
            )
            .map_err(|e| Error::Storage(format!("failed to delete peer: {}", e)))?;
        Ok(affected > 0)
    }
}

impl IdentityStore for Database {
    fn load(&self) -> Result<Option<Identity>> {
        self.load_identity()
    }

    fn save(&self, identity: &Identity) -> Result<()> {
        self.store_identity(identity)
    }
}

const SELECT_PEER: &str = r#"
SELECT peer_id, static_public_key, signing_public_key, nickname, trust_level,
       is_favorite, is_blocked, last_seen
FROM peers
"#;

/// Upserts peers through a borrowed connection or transaction.
///
/// The static key of an existing row is never overwritten.
struct PeerWriter<'c> {
    conn: &'c Connection,
}

impl PeerWriter<'_> {
    fn write(&self, peer: &Peer) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.conn
            .execute(
                r#"
                INSERT INTO peers
                (peer_id, static_public_key, signing_public_key, nickname, trust_level,
                 is_favorite, is_blocked, last_seen, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(peer_id) DO UPDATE SET
                    signing_public_key = excluded.signing_public_key,
                    nickname = excluded.nickname,
                    trust_level = excluded.trust_level,
                    is_favorite = excluded.is_favorite,
                    is_blocked = excluded.is_blocked,
                    last_seen = excluded.last_seen,
                    updated_at = excluded.updated_at
                "#,
                params![
                    peer.id.as_bytes().as_slice(),
                    peer.static_public_key.as_bytes().as_slice(),
                    peer.signing_public_key.as_ref().map(|k| k.as_slice()),
                    peer.nickname,
                    peer.trust_level.as_str(),
                    peer.is_favorite as i32,
                    peer.is_blocked as i32,
                    peer.last_seen as i64,
                    now,
                ],
            )
            .map_err(|e| Error::Storage(format!("failed to save peer: {}", e)))?;
        Ok(())
    }
}

/// Row decoding is split in two: SQL errors surface through rusqlite,
/// content errors (bad key length, id mismatch) through the inner result.
fn read_peer_row(row: &Row<'_>) -> rusqlite::Result<Result<Peer>> {
    let peer_id: Vec<u8> = row.get(0)?;
    let static_key: Vec<u8> = row.get(1)?;
    let signing_key: Option<Vec<u8>> = row.get(2)?;
    let nickname: String = row.get(3)?;
    let trust_level: String = row.get(4)?;
    let is_favorite: i32 = row.get(5)?;
    let is_blocked: i32 = row.get(6)?;
    let last_seen: i64 = row.get(7)?;

    Ok(build_peer(
        &peer_id,
        &static_key,
        signing_key.as_deref(),
        nickname,
        &trust_level,
        is_favorite != 0,
        is_blocked != 0,
        last_seen,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_peer(
    peer_id: &[u8],
    static_key: &[u8],
    signing_key: Option<&[u8]>,
    nickname: String,
    trust_level: &str,
    is_favorite: bool,
    is_blocked: bool,
    last_seen: i64,
) -> Result<Peer> {
    let static_public_key = X25519PublicKey::from_slice(static_key)
        .map_err(|_| Error::Storage("stored static key has wrong length".into()))?;

    let mut peer = Peer::new(static_public_key, nickname, last_seen.max(0) as u64);
    if peer.id.as_bytes().as_slice() != peer_id {
        return Err(Error::Storage(format!(
            "stored peer id {} does not match its static key",
            hex::encode(peer_id)
        )));
    }

    if let Some(key) = signing_key {
        let key: [u8; 32] = key
            .try_into()
            .map_err(|_| Error::Storage("stored signing key has wrong length".into()))?;
        peer = peer.with_signing_key(key);
    }

    peer.trust_level = TrustLevel::parse(trust_level)
        .ok_or_else(|| Error::Storage(format!("unknown trust level '{}'", trust_level)))?;
    peer.is_favorite = is_favorite;
    peer.is_blocked = is_blocked;
    peer.is_connected = false;
    Ok(peer)
}
