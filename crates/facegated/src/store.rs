//! Durable identity store backed by SQLite.
//!
//! Two tables: `identities(email, credential)` and
//! `enrollment_vectors(id, email, embedding, created_at)`, with embeddings
//! stored as packed little-endian f32 blobs.

use crate::identity::{Credential, IdentityKey};
use chrono::{SecondsFormat, Utc};
use facegate_core::UnitVector;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    email TEXT PRIMARY KEY,
    credential TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS enrollment_vectors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL REFERENCES identities(email),
    embedding BLOB NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_enrollment_vectors_email ON enrollment_vectors(email);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt enrollment vector {id} for {identity}: {len}-byte blob")]
    CorruptVector { identity: String, id: i64, len: usize },
}

/// Persistent mapping from identity to credential and enrollment vectors.
///
/// `append_vector` does not enforce the per-identity cap; the enrollment
/// workflow checks it under its own per-identity lock.
pub trait IdentityStore: Send + Sync {
    fn count_vectors(&self, identity: &IdentityKey) -> Result<usize, StoreError>;
    fn identity_exists(&self, identity: &IdentityKey) -> Result<bool, StoreError>;
    /// Insert the identity unless it already exists. Returns `true` if a row
    /// was inserted; an existing credential is never overwritten.
    fn create_identity_if_absent(
        &self,
        identity: &IdentityKey,
        credential: &Credential,
    ) -> Result<bool, StoreError>;
    fn append_vector(&self, identity: &IdentityKey, vector: &UnitVector) -> Result<(), StoreError>;
    fn list_vectors(&self, identity: &IdentityKey) -> Result<Vec<UnitVector>, StoreError>;
    fn get_credential(&self, identity: &IdentityKey) -> Result<Option<Credential>, StoreError>;
}

pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
}

impl SqliteIdentityStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "identity store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Every write is a single statement or a committed transaction, so a
        // panic elsewhere cannot leave the connection half-written.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IdentityStore for SqliteIdentityStore {
    fn count_vectors(&self, identity: &IdentityKey) -> Result<usize, StoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM enrollment_vectors WHERE email = ?1",
            params![identity.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn identity_exists(&self, identity: &IdentityKey) -> Result<bool, StoreError> {
        let exists = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM identities WHERE email = ?1)",
            params![identity.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn create_identity_if_absent(
        &self,
        identity: &IdentityKey,
        credential: &Credential,
    ) -> Result<bool, StoreError> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO identities (email, credential) VALUES (?1, ?2)",
            params![identity.as_str(), credential.as_str()],
        )?;
        if inserted > 0 {
            tracing::info!(identity = %identity, "identity registered");
        }
        Ok(inserted > 0)
    }

    fn append_vector(&self, identity: &IdentityKey, vector: &UnitVector) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO enrollment_vectors (email, embedding, created_at) VALUES (?1, ?2, ?3)",
            params![
                identity.as_str(),
                vector.to_le_bytes(),
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn list_vectors(&self, identity: &IdentityKey) -> Result<Vec<UnitVector>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, embedding FROM enrollment_vectors WHERE email = ?1")?;
        let rows = stmt.query_map(params![identity.as_str()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut vectors = Vec::new();
        for row in rows {
            let (id, blob) = row?;
            let vector =
                UnitVector::from_le_bytes(&blob).ok_or_else(|| StoreError::CorruptVector {
                    identity: identity.to_string(),
                    id,
                    len: blob.len(),
                })?;
            vectors.push(vector);
        }
        Ok(vectors)
    }

    fn get_credential(&self, identity: &IdentityKey) -> Result<Option<Credential>, StoreError> {
        let credential = self
            .conn()
            .query_row(
                "SELECT credential FROM identities WHERE email = ?1",
                params![identity.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(credential.map(Credential::from_stored))
    }
}
