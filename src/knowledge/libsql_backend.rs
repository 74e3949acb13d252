//! libSQL knowledge backend.
//!
//! One table per collection; embeddings are stored as little-endian f32 BLOBs
//! and ranked in process. Supports local file and in-memory databases.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::knowledge::backend::KnowledgeBackend;
use crate::knowledge::migrations;
use crate::knowledge::{Collection, KnowledgeRecord, Metadata, NewRecord, RecordContent};

/// libSQL-backed knowledge storage.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Collections whose table is known to exist.
    ready: Mutex<HashSet<Collection>>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Knowledge database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StorageError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StorageError> {
        let conn = db
            .connect()
            .map_err(|e| StorageError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            ready: Mutex::new(Collection::ALL.into_iter().collect()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    fn is_ready(&self, collection: Collection) -> bool {
        self.ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&collection)
    }

    fn mark_ready(&self, collection: Collection, ready: bool) {
        let mut set = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        if ready {
            set.insert(collection);
        } else {
            set.remove(&collection);
        }
    }

    /// Forget that a collection's table exists so the next access recreates it.
    pub fn invalidate_collection(&self, collection: Collection) {
        self.mark_ready(collection, false);
    }
}

// ── Helper functions ────────────────────────────────────────────────

const RECORD_COLUMNS: &str = "id, tenant_id, content, embedding, metadata, created_at, updated_at";

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>, StorageError> {
    if bytes.len() % 4 != 0 {
        return Err(StorageError::Serialization(format!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn is_missing_table(e: &libsql::Error) -> bool {
    e.to_string().contains("no such table")
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a KnowledgeRecord.
///
/// Column order matches RECORD_COLUMNS:
/// 0:id, 1:tenant_id, 2:content, 3:embedding, 4:metadata, 5:created_at, 6:updated_at
fn row_to_record(row: &libsql::Row) -> Result<KnowledgeRecord, StorageError> {
    let read = |e: libsql::Error| StorageError::Query(format!("row parse: {e}"));

    let id: i64 = row.get(0).map_err(read)?;
    let tenant_id: String = row.get(1).map_err(read)?;
    let content_str: String = row.get(2).map_err(read)?;
    let embedding_bytes: Vec<u8> = row.get(3).map_err(read)?;
    let metadata_str: String = row.get(4).map_err(read)?;
    let created_str: String = row.get(5).map_err(read)?;
    let updated_str: Option<String> = row.get(6).ok();

    let content: RecordContent = serde_json::from_str(&content_str)
        .map_err(|e| StorageError::Serialization(format!("record {id} content: {e}")))?;
    let metadata: Metadata = serde_json::from_str(&metadata_str).unwrap_or_default();

    Ok(KnowledgeRecord {
        id,
        tenant_id,
        content,
        embedding: decode_embedding(&embedding_bytes)?,
        metadata,
        created_at: parse_datetime(&created_str),
        updated_at: updated_str.as_deref().map(parse_datetime),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl KnowledgeBackend for LibSqlBackend {
    fn name(&self) -> &str {
        "libsql"
    }

    async fn ensure_collection(&self, collection: Collection) -> Result<(), StorageError> {
        if self.is_ready(collection) {
            return Ok(());
        }

        self.conn()
            .execute_batch(migrations::collection_ddl(collection))
            .await
            .map_err(|e| {
                StorageError::Query(format!("ensure_collection {collection}: {e}"))
            })?;
        self.mark_ready(collection, true);
        debug!(collection = %collection, "Collection table created lazily");
        Ok(())
    }

    async fn insert(&self, collection: Collection, record: NewRecord) -> Result<i64, StorageError> {
        let content_json = serde_json::to_string(&record.content)
            .map_err(|e| StorageError::Serialization(format!("record content: {e}")))?;
        let metadata_json = serde_json::to_string(&record.metadata)
            .map_err(|e| StorageError::Serialization(format!("record metadata: {e}")))?;
        let now = Utc::now().to_rfc3339();
        let updated_at = collection.tracks_updates().then(|| now.clone());

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "INSERT INTO {collection} (tenant_id, content, embedding, metadata, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) RETURNING id"
                ),
                params![
                    record.tenant_id.as_str(),
                    content_json,
                    libsql::Value::Blob(encode_embedding(&record.embedding)),
                    metadata_json,
                    now,
                    opt_text_owned(updated_at),
                ],
            )
            .await
            .map_err(|e| StorageError::Query(format!("insert into {collection}: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StorageError::Query(format!("insert into {collection}: {e}")))?
            .ok_or_else(|| {
                StorageError::Query(format!("insert into {collection}: no id returned"))
            })?;
        let id: i64 = row
            .get(0)
            .map_err(|e| StorageError::Query(format!("insert into {collection}: {e}")))?;

        debug!(collection = %collection, id, tenant_id = %record.tenant_id, "Record inserted");
        Ok(id)
    }

    async fn scan(
        &self,
        collection: Collection,
        tenant_id: &str,
    ) -> Result<Vec<KnowledgeRecord>, StorageError> {
        let query = self
            .conn()
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM {collection} WHERE tenant_id = ?1 ORDER BY id ASC"
                ),
                params![tenant_id],
            )
            .await;
        let mut rows = match query {
            Ok(rows) => rows,
            Err(e) if is_missing_table(&e) => {
                // Dropped behind our back: recreate, nothing to return.
                self.invalidate_collection(collection);
                self.ensure_collection(collection).await?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(StorageError::Query(format!("scan {collection}: {e}"))),
        };

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StorageError::Query(format!("scan {collection}: {e}")))?
        {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn delete_by_tenant(
        &self,
        collection: Collection,
        tenant_id: &str,
    ) -> Result<usize, StorageError> {
        let count = self
            .conn()
            .execute(
                &format!("DELETE FROM {collection} WHERE tenant_id = ?1"),
                params![tenant_id],
            )
            .await
            .map_err(|e| StorageError::Query(format!("delete_by_tenant {collection}: {e}")))?;
        Ok(count as usize)
    }

    async fn count(
        &self,
        collection: Collection,
        tenant_id: Option<&str>,
    ) -> Result<usize, StorageError> {
        let mut rows = match tenant_id {
            Some(tenant) => {
                self.conn()
                    .query(
                        &format!("SELECT COUNT(*) FROM {collection} WHERE tenant_id = ?1"),
                        params![tenant],
                    )
                    .await
            }
            None => {
                self.conn()
                    .query(&format!("SELECT COUNT(*) FROM {collection}"), ())
                    .await
            }
        }
        .map_err(|e| StorageError::Query(format!("count {collection}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| StorageError::Query(format!("count {collection}: {e}")))?;
                Ok(count as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(StorageError::Query(format!("count {collection}: {e}"))),
        }
    }
}
