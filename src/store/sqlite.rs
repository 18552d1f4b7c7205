//! SQLite-backed [`KnowledgeStore`].
//!
//! One database file holds the whole knowledge base:
//!
//! | Table | Contents |
//! |-------|----------|
//! | `store_meta` | schema version, embedding model, embedding dims |
//! | `documents` | the document registry, keyed by source path |
//! | `chunks` | chunk text and offsets; `ord` records insertion order |
//! | `chunk_vectors` | one little-endian f32 BLOB per chunk |
//!
//! Each document is replaced inside one transaction, so a failed write
//! leaves the previous version of that document in place. The connection
//! pool runs in WAL mode; on top of that the store keeps a writer lock so
//! mutations are serialised and searches see a consistent snapshot.
//!
//! [`SqliteStore::open`] refuses a file it cannot trust: a failed
//! `integrity_check`, an unknown schema version or vectors of the wrong
//! width yield [`StoreError::Corrupted`]; a file written by a different
//! embedding model yields [`StoreError::IncompatibleModel`]. What happens
//! next is the caller's decision (see [`quarantine`]).

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{Chunk, DocumentRecord, ScoredChunk, StoreStats};

use super::{check_insert, rank, EmbeddingSignature, KnowledgeStore, StoreError};

const SCHEMA_VERSION: &str = "1";

// SQLITE_CORRUPT and SQLITE_NOTADB primary result codes.
const SQLITE_CORRUPT: i64 = 11;
const SQLITE_NOTADB: i64 = 26;

pub struct SqliteStore {
    pool: SqlitePool,
    path: PathBuf,
    dims: Option<usize>,
    lock: RwLock<()>,
}

impl SqliteStore {
    /// Open (creating if missing) the store at `path`.
    ///
    /// `signature` is the active embedding model. A fresh store records it;
    /// an existing store must match it. `None` opens the store for
    /// inspection and deletion only: inserts are refused.
    pub async fn open(
        path: &Path,
        signature: Option<&EmbeddingSignature>,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(classify)?;

        match prepare(&pool, signature).await {
            Ok(dims) => {
                info!(path = %path.display(), ?dims, "knowledge store opened");
                Ok(Self {
                    pool,
                    path: path.to_path_buf(),
                    dims,
                    lock: RwLock::new(()),
                })
            }
            Err(e) => {
                pool.close().await;
                Err(e)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Map errors that mean "this file is not a usable database" to `Corrupted`.
fn classify(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db) = e {
        let code = db
            .code()
            .and_then(|c| c.parse::<i64>().ok())
            .map(|c| c & 0xff);
        if matches!(code, Some(SQLITE_CORRUPT) | Some(SQLITE_NOTADB)) {
            return StoreError::Corrupted(db.message().to_string());
        }
    }
    StoreError::Database(e)
}

/// Verify, migrate and sign the database. Returns the store width.
async fn prepare(
    pool: &SqlitePool,
    signature: Option<&EmbeddingSignature>,
) -> Result<Option<usize>, StoreError> {
    let report: Vec<String> = sqlx::query_scalar("PRAGMA integrity_check")
        .fetch_all(pool)
        .await
        .map_err(classify)?;
    if report.first().map(String::as_str) != Some("ok") {
        return Err(StoreError::Corrupted(report.join("; ")));
    }

    migrate(pool).await.map_err(classify)?;

    match read_meta(pool, "schema_version").await? {
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => {
            return Err(StoreError::Corrupted(format!(
                "unsupported schema version {}",
                v
            )))
        }
        None => write_meta(pool, "schema_version", SCHEMA_VERSION).await?,
    }

    let stored_model = read_meta(pool, "embedding_model").await?;
    let stored_dims = match read_meta(pool, "embedding_dims").await? {
        Some(d) => Some(d.parse::<usize>().map_err(|_| {
            StoreError::Corrupted(format!("invalid embedding_dims value '{}'", d))
        })?),
        None => None,
    };

    let dims = match (signature, stored_model, stored_dims) {
        (Some(sig), Some(model), Some(dims)) => {
            if model != sig.model || dims != sig.dims {
                return Err(StoreError::IncompatibleModel {
                    stored_model: model,
                    stored_dims: dims,
                    model: sig.model.clone(),
                    dims: sig.dims,
                });
            }
            Some(dims)
        }
        (Some(sig), _, _) => {
            write_meta(pool, "embedding_model", &sig.model).await?;
            write_meta(pool, "embedding_dims", &sig.dims.to_string()).await?;
            Some(sig.dims)
        }
        (None, _, dims) => dims,
    };

    if let Some(dims) = dims {
        let bad: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunk_vectors WHERE length(embedding) != ?",
        )
        .bind((dims * 4) as i64)
        .fetch_one(pool)
        .await
        .map_err(classify)?;
        if bad > 0 {
            return Err(StoreError::Corrupted(format!(
                "{} vectors do not have {} dimensions",
                bad, dims
            )));
        }
    }

    let orphans: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM chunks c
        LEFT JOIN chunk_vectors v ON v.chunk_id = c.id
        WHERE v.chunk_id IS NULL
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(classify)?;
    if orphans > 0 {
        return Err(StoreError::Corrupted(format!(
            "{} chunks have no embedding",
            orphans
        )));
    }

    Ok(dims)
}

async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            source_path TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            last_modified INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            ord INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            source_path TEXT NOT NULL REFERENCES documents(source_path),
            sequence_index INTEGER NOT NULL,
            char_start INTEGER NOT NULL,
            char_end INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            UNIQUE(source_path, sequence_index)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY REFERENCES chunks(id),
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source_path)")
        .execute(&mut *tx)
        .await?;

    tx.commit().await
}

async fn read_meta(pool: &SqlitePool, key: &str) -> Result<Option<String>, StoreError> {
    sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(classify)
}

async fn write_meta(pool: &SqlitePool, key: &str, value: &str) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO store_meta (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<Chunk, sqlx::Error> {
    Ok(Chunk {
        id: row.try_get("id")?,
        text: row.try_get("text")?,
        source_path: row.try_get("source_path")?,
        sequence_index: row.try_get::<i64, _>("sequence_index")? as usize,
        char_start: row.try_get::<i64, _>("char_start")? as usize,
        char_end: row.try_get::<i64, _>("char_end")? as usize,
        hash: row.try_get("hash")?,
    })
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<DocumentRecord, sqlx::Error> {
    Ok(DocumentRecord {
        source_path: row.try_get("source_path")?,
        kind: row.try_get("kind")?,
        last_modified: row.try_get("last_modified")?,
        content_hash: row.try_get("content_hash")?,
        ingested_at: row.try_get("ingested_at")?,
    })
}

#[async_trait]
impl KnowledgeStore for SqliteStore {
    async fn insert(
        &self,
        record: &DocumentRecord,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), StoreError> {
        check_insert(self.dims, chunks, embeddings)?;

        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (source_path, kind, last_modified, content_hash, ingested_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source_path) DO UPDATE SET
                kind = excluded.kind,
                last_modified = excluded.last_modified,
                content_hash = excluded.content_hash,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&record.source_path)
        .bind(&record.kind)
        .bind(record.last_modified)
        .bind(&record.content_hash)
        .bind(record.ingested_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE source_path = ?)",
        )
        .bind(&record.source_path)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE source_path = ?")
            .bind(&record.source_path)
            .execute(&mut *tx)
            .await?;

        for (chunk, vector) in chunks.iter().zip(embeddings) {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, source_path, sequence_index, char_start, char_end, text, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&record.source_path)
            .bind(chunk.sequence_index as i64)
            .bind(chunk.char_start as i64)
            .bind(chunk.char_end as i64)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunk_vectors (chunk_id, embedding) VALUES (?, ?)")
                .bind(&chunk.id)
                .bind(vec_to_blob(vector))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(path = %record.source_path, chunks = chunks.len(), "document stored");
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let dims = self.dims.unwrap_or(query.len());
        if query.len() != dims {
            return Err(StoreError::DimensionMismatch {
                expected: dims,
                got: query.len(),
            });
        }

        let rows = {
            let _guard = self.lock.read().await;
            sqlx::query(
                r#"
                SELECT c.id, c.source_path, c.sequence_index, c.char_start, c.char_end,
                       c.text, c.hash, v.embedding
                FROM chunks c
                JOIN chunk_vectors v ON v.chunk_id = c.id
                ORDER BY c.ord
                "#,
            )
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?
        };

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            if blob.len() != dims * 4 {
                return Err(StoreError::Corrupted(format!(
                    "vector of {} bytes in a {}-dimensional store",
                    blob.len(),
                    dims
                )));
            }
            let vector = blob_to_vec(&blob);
            candidates.push(ScoredChunk {
                chunk: row_to_chunk(row)?,
                similarity: cosine_similarity(query, &vector),
            });
        }

        Ok(rank(candidates, k, threshold))
    }

    async fn delete(&self, source_path: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE source_path = ?)",
        )
        .bind(source_path)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE source_path = ?")
            .bind(source_path)
            .execute(&mut *tx)
            .await?;

        let removed = sqlx::query("DELETE FROM documents WHERE source_path = ?")
            .bind(source_path)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.write().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM documents")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(path = %self.path.display(), "knowledge store cleared");
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let _guard = self.lock.read().await;
        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM documents) AS docs, (SELECT COUNT(*) FROM chunks) AS chunks",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(classify)?;

        Ok(StoreStats {
            document_count: row.try_get::<i64, _>("docs")? as usize,
            chunk_count: row.try_get::<i64, _>("chunks")? as usize,
        })
    }

    async fn document(&self, source_path: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let _guard = self.lock.read().await;
        let row = sqlx::query(
            "SELECT source_path, kind, last_modified, content_hash, ingested_at \
             FROM documents WHERE source_path = ?",
        )
        .bind(source_path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(row_to_record(&row)?),
            None => None,
        })
    }

    async fn chunk_ids(&self, source_path: &str) -> Result<Vec<String>, StoreError> {
        let _guard = self.lock.read().await;
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM chunks WHERE source_path = ? ORDER BY sequence_index",
        )
        .bind(source_path)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn documents(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        let _guard = self.lock.read().await;
        let rows = sqlx::query(
            "SELECT source_path, kind, last_modified, content_hash, ingested_at \
             FROM documents ORDER BY source_path",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row_to_record(row).map_err(StoreError::from))
            .collect()
    }
}

/// Move a damaged store (and its WAL side files) out of the way.
///
/// Returns the new path of the main file: `<path>.corrupt-<timestamp>`.
pub fn quarantine(path: &Path) -> std::io::Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S").to_string();
    let target = with_suffix(path, &format!(".corrupt-{}", stamp));
    std::fs::rename(path, &target)?;

    for side in ["-wal", "-shm"] {
        let from = with_suffix(path, side);
        if from.exists() {
            if let Err(e) = std::fs::rename(&from, with_suffix(&target, side)) {
                warn!(path = %from.display(), error = %e, "could not move side file");
            }
        }
    }

    warn!(from = %path.display(), to = %target.display(), "quarantined knowledge store");
    Ok(target)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
