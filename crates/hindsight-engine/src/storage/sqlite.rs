//! SQLite-backed storage for banks, memory units, documents, async
//! operations, mental models, and directives.
//!
//! Two connections (`reader`/`writer`), each behind its own `Mutex`
//! rather than a pool: SQLite's single-writer model means a connection
//! pool buys nothing for the writer side, and a lone reader connection
//! is enough concurrency for this engine's per-bank access pattern
//! (see SPEC_FULL.md §6 [FULL]). WAL mode lets the reader proceed while
//! the writer holds its lock.
//!
//! Tag arrays and `source_memory_ids` are stored as JSON-TEXT columns
//! rather than native SQL arrays — SQLite has no array type, and this
//! keeps the schema portable with the logical column shapes described
//! in the spec without depending on a JSON1-specific index for every
//! query (see DESIGN.md for the full tradeoff).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::embeddings::local::Embedding;
use crate::error::{EngineError, Result};
use crate::memory::{Bank, BankConfig, Directive, Document, FactType, HistoryAction, HistoryEntry, MemoryUnit, MentalModel};
use crate::search::{sanitize_fts5_query, TemporalCandidate, VectorIndex};
use crate::tags::{TagMatchMode, TagSet};

use super::migrations::MIGRATIONS;

/// Storage handle for one database file. Cheap to clone-share via `Arc`
/// at the call site; internally single-instance, matching the teacher's
/// `writer: Mutex<Connection>` / `reader: Mutex<Connection>` split.
pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    /// Per-bank dense index cache, hydrated lazily on first access to a
    /// bank and kept in sync on every insert/update/delete. Brute-force
    /// cosine search (`search::VectorIndex`) rather than an ANN index —
    /// see that module's doc comment for why.
    vector_indexes: Mutex<HashMap<String, VectorIndex>>,
}

impl Storage {
    /// Open (creating if absent) the database at the platform default
    /// location when `db_path` is `None`: `ai.hindsight.engine`'s data
    /// directory, matching `embeddings::local`'s cache-dir naming.
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => default_db_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Fatal(e.to_string()))?;
            restrict_to_owner_dir(parent);
        }
        let storage = Self::open_at(&path)?;
        restrict_to_owner_file(&path);
        Ok(storage)
    }

    /// Open a specific file path, applying migrations and PRAGMA tuning.
    pub fn open_at(path: &Path) -> Result<Self> {
        let writer = Connection::open(path)?;
        configure_connection(&writer)?;
        apply_migrations(&writer)?;

        let reader = Connection::open(path)?;
        configure_connection(&reader)?;

        Ok(Self { writer: Mutex::new(writer), reader: Mutex::new(reader), vector_indexes: Mutex::new(HashMap::new()) })
    }

    /// In-process shared-cache in-memory database, for tests: two
    /// `:memory:` connections are normally two separate databases, so
    /// this uses a named shared-cache URI instead.
    pub fn open_in_memory(name: &str) -> Result<Self> {
        let uri = format!("file:{name}?mode=memory&cache=shared");
        let flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
            | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            | rusqlite::OpenFlags::SQLITE_OPEN_URI
            | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let writer = Connection::open_with_flags(&uri, flags)?;
        configure_connection(&writer)?;
        apply_migrations(&writer)?;
        let reader = Connection::open_with_flags(&uri, flags)?;
        configure_connection(&reader)?;
        Ok(Self { writer: Mutex::new(writer), reader: Mutex::new(reader), vector_indexes: Mutex::new(HashMap::new()) })
    }

    fn writer(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.writer.lock().expect("writer connection mutex poisoned")
    }

    fn reader(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.reader.lock().expect("reader connection mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Banks
    // ------------------------------------------------------------------

    pub fn create_bank(&self, bank: &Bank) -> Result<()> {
        let config_json = serde_json::to_string(&bank.config).map_err(|e| EngineError::Validation(e.to_string()))?;
        self.writer().execute(
            "INSERT INTO banks (id, name, embedding_dim, created_at, config_json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![bank.id, bank.name, bank.embedding_dim as i64, bank.created_at.to_rfc3339(), config_json],
        )?;
        self.vector_indexes.lock().expect("vector index cache mutex poisoned").insert(
            bank.id.clone(),
            VectorIndex::with_config(crate::search::VectorIndexConfig { dimensions: bank.embedding_dim, ..Default::default() })
                .map_err(|e| EngineError::Fatal(e.to_string()))?,
        );
        Ok(())
    }

    pub fn get_bank(&self, bank_id: &str) -> Result<Bank> {
        let conn = self.reader();
        conn.query_row("SELECT id, name, embedding_dim, created_at, config_json FROM banks WHERE id = ?1", params![bank_id], row_to_bank)
            .optional()?
            .ok_or_else(|| EngineError::not_found("bank", bank_id))
    }

    pub fn list_banks(&self) -> Result<Vec<Bank>> {
        let conn = self.reader();
        let mut stmt = conn.prepare("SELECT id, name, embedding_dim, created_at, config_json FROM banks ORDER BY created_at")?;
        let rows = stmt.query_map([], row_to_bank)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::from)
    }

    pub fn delete_bank(&self, bank_id: &str) -> Result<()> {
        self.writer().execute("DELETE FROM banks WHERE id = ?1", params![bank_id])?;
        self.vector_indexes.lock().expect("vector index cache mutex poisoned").remove(bank_id);
        Ok(())
    }

    /// Lazily hydrate a bank's dense index from its non-consolidated
    /// memory rows, the teacher's `load_embeddings_into_index` pattern
    /// applied per-bank instead of once globally.
    fn ensure_vector_index_loaded(&self, bank_id: &str) -> Result<()> {
        if self.vector_indexes.lock().expect("vector index cache mutex poisoned").contains_key(bank_id) {
            return Ok(());
        }
        let bank = self.get_bank(bank_id)?;
        let mut index = VectorIndex::with_config(crate::search::VectorIndexConfig { dimensions: bank.embedding_dim, ..Default::default() })
            .map_err(|e| EngineError::Fatal(e.to_string()))?;

        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT id, embedding FROM memory_units WHERE bank_id = ?1 AND consolidated_at IS NULL AND embedding IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![bank_id], |row| {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, blob))
        })?;
        for row in rows {
            let (id, blob) = row?;
            if let Some(embedding) = Embedding::from_bytes(&blob) {
                index.add(&id, &embedding.vector).map_err(|e| EngineError::Fatal(e.to_string()))?;
            }
        }
        drop(conn);
        self.vector_indexes.lock().expect("vector index cache mutex poisoned").insert(bank_id.to_string(), index);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Memory units
    // ------------------------------------------------------------------

    pub fn insert_memory(&self, unit: &MemoryUnit) -> Result<()> {
        self.ensure_vector_index_loaded(&unit.bank_id)?;
        {
            let conn = self.writer();
            insert_memory_row(&conn, unit)?;
        }
        if let Some(embedding) = &unit.embedding {
            let mut indexes = self.vector_indexes.lock().expect("vector index cache mutex poisoned");
            if let Some(index) = indexes.get_mut(&unit.bank_id) {
                index.add(&unit.id, embedding).map_err(|e| EngineError::Conflict(e.to_string()))?;
            }
        }
        Ok(())
    }

    pub fn update_memory(&self, unit: &MemoryUnit) -> Result<()> {
        self.ensure_vector_index_loaded(&unit.bank_id)?;
        {
            let conn = self.writer();
            update_memory_row(&conn, unit)?;
        }
        let mut indexes = self.vector_indexes.lock().expect("vector index cache mutex poisoned");
        if let Some(index) = indexes.get_mut(&unit.bank_id) {
            if let Some(embedding) = &unit.embedding {
                index.add(&unit.id, embedding).map_err(|e| EngineError::Conflict(e.to_string()))?;
            } else {
                index.remove(&unit.id).map_err(|e| EngineError::Fatal(e.to_string()))?;
            }
        }
        Ok(())
    }

    pub fn get_memory(&self, memory_id: &str) -> Result<MemoryUnit> {
        let conn = self.reader();
        conn.query_row(MEMORY_SELECT_SQL, params![memory_id], row_to_memory_unit)
            .optional()?
            .ok_or_else(|| EngineError::not_found("memory_unit", memory_id))
    }

    pub fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<MemoryUnit>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.reader();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memory_units WHERE id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), row_to_memory_unit)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::from)
    }

    /// Hard delete, cascading per SPEC_FULL.md §4.5.4: every observation
    /// citing `memory_id` is itself deleted (an observation's proof
    /// chain includes a now-gone source, so the synthesis is no longer
    /// sound), and every *other* memory unit those deleted observations
    /// cited has its `consolidated_at` reset to `NULL` so it re-enters
    /// the consolidation queue. Used by admin tooling and tests; the
    /// consolidation engine normally invalidates rather than deletes
    /// (see `mark_consolidated`/`invalidate_observation`).
    pub fn delete_memory(&self, bank_id: &str, memory_id: &str) -> Result<()> {
        self.cascade_delete_observations_citing(bank_id, memory_id)?;

        self.writer().execute("DELETE FROM memory_units WHERE id = ?1", params![memory_id])?;
        self.ensure_vector_index_loaded(bank_id)?;
        let mut indexes = self.vector_indexes.lock().expect("vector index cache mutex poisoned");
        if let Some(index) = indexes.get_mut(bank_id) {
            index.remove(memory_id).map_err(|e| EngineError::Fatal(e.to_string()))?;
        }
        Ok(())
    }

    /// Step 4 of §4.5.4: clear a memory's own consolidated status (so it
    /// re-enters the consolidation queue) without deleting the memory
    /// itself, cascading the same observation cleanup as `delete_memory`.
    /// Distinct from `delete_memory`: the target row survives, only its
    /// consolidated/observation state is reset.
    pub fn clear_observations_for_memory(&self, bank_id: &str, memory_id: &str) -> Result<()> {
        self.cascade_delete_observations_citing(bank_id, memory_id)?;
        self.writer().execute(
            "UPDATE memory_units SET consolidated_at = NULL WHERE id = ?1",
            params![memory_id],
        )?;
        Ok(())
    }

    /// Shared cascade: delete every observation citing `memory_id`, then
    /// reset `consolidated_at` to `NULL` on every *other* memory those
    /// observations also cited, since their proof is now incomplete.
    fn cascade_delete_observations_citing(&self, bank_id: &str, memory_id: &str) -> Result<()> {
        let citing = self.observations_citing(bank_id, memory_id)?;
        if citing.is_empty() {
            return Ok(());
        }

        let mut co_sources: HashSet<String> = HashSet::new();
        for observation in &citing {
            for other_id in &observation.source_memory_ids {
                if other_id != memory_id {
                    co_sources.insert(other_id.clone());
                }
            }
        }

        {
            let conn = self.writer();
            for observation in &citing {
                conn.execute("DELETE FROM memory_units WHERE id = ?1", params![observation.id])?;
            }
        }
        self.ensure_vector_index_loaded(bank_id)?;
        {
            let mut indexes = self.vector_indexes.lock().expect("vector index cache mutex poisoned");
            if let Some(index) = indexes.get_mut(bank_id) {
                for observation in &citing {
                    index.remove(&observation.id).ok();
                }
            }
        }

        if !co_sources.is_empty() {
            let conn = self.writer();
            let mut stmt = conn.prepare("UPDATE memory_units SET consolidated_at = NULL WHERE id = ?1")?;
            for id in &co_sources {
                stmt.execute(params![id])?;
            }
        }
        Ok(())
    }

    /// Fold source facts into a consolidation result: set
    /// `consolidated_at`, excluding them from future candidate pools
    /// while keeping the row addressable via an observation's
    /// `source_memory_ids` (§4.5 invalidation).
    pub fn mark_consolidated(&self, memory_ids: &[String], at: DateTime<Utc>) -> Result<()> {
        let conn = self.writer();
        let mut stmt = conn.prepare("UPDATE memory_units SET consolidated_at = ?1, updated_at = ?1 WHERE id = ?2")?;
        for id in memory_ids {
            stmt.execute(params![at.to_rfc3339(), id])?;
        }
        Ok(())
    }

    /// Append an audit entry to an observation's history and persist
    /// its updated fields in one transaction-free call (the two writes
    /// that matter — `history_json` and `updated_at` — both happen here
    /// so callers never forget one).
    pub fn append_observation_history(&self, memory_id: &str, entry: &HistoryEntry) -> Result<()> {
        let conn = self.writer();
        let existing: String = conn.query_row("SELECT history_json FROM memory_units WHERE id = ?1", params![memory_id], |r| r.get(0))?;
        let mut history: Vec<HistoryEntry> = serde_json::from_str(&existing).unwrap_or_default();
        history.push(entry.clone());
        let history_json = serde_json::to_string(&history).map_err(|e| EngineError::Validation(e.to_string()))?;
        conn.execute(
            "UPDATE memory_units SET history_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![history_json, entry.at.to_rfc3339(), memory_id],
        )?;
        Ok(())
    }

    /// Invalidate an observation in place: mark it consolidated (removed
    /// from candidate pools) and append an `Invalidated` history entry,
    /// per the consolidation engine's delete action (§4.5.4).
    pub fn invalidate_observation(&self, bank_id: &str, memory_id: &str, operation_id: &str, detail: Option<String>, at: DateTime<Utc>) -> Result<()> {
        self.append_observation_history(
            memory_id,
            &HistoryEntry { at, operation_id: operation_id.to_string(), action: HistoryAction::Invalidated, detail },
        )?;
        self.mark_consolidated(std::slice::from_ref(&memory_id.to_string()), at)?;
        self.ensure_vector_index_loaded(bank_id)?;
        let mut indexes = self.vector_indexes.lock().expect("vector index cache mutex poisoned");
        if let Some(index) = indexes.get_mut(bank_id) {
            index.remove(memory_id).ok();
        }
        Ok(())
    }

    /// All non-consolidated memory units in a bank, grouped by exact
    /// (sorted) tag set — the consolidation engine's batching key
    /// (§4.5.1 step 2).
    pub fn units_by_exact_tag_set(&self, bank_id: &str) -> Result<HashMap<String, Vec<MemoryUnit>>> {
        let conn = self.reader();
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memory_units WHERE bank_id = ?1 AND consolidated_at IS NULL AND fact_type != 'observation'");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![bank_id], row_to_memory_unit)?;
        let mut grouped: HashMap<String, Vec<MemoryUnit>> = HashMap::new();
        for row in rows {
            let unit = row?;
            grouped.entry(unit.tags.canonical_key()).or_default().push(unit);
        }
        Ok(grouped)
    }

    /// Existing observations in a bank, grouped by exact tag set —
    /// the authorization universe for a consolidation batch sharing
    /// that same tag set (§4.5.2: a fact may only be merged into an
    /// observation whose tags exactly match its own batch).
    pub fn observations_by_exact_tag_set(&self, bank_id: &str) -> Result<HashMap<String, Vec<MemoryUnit>>> {
        let conn = self.reader();
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memory_units WHERE bank_id = ?1 AND consolidated_at IS NULL AND fact_type = 'observation'");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![bank_id], row_to_memory_unit)?;
        let mut grouped: HashMap<String, Vec<MemoryUnit>> = HashMap::new();
        for row in rows {
            let unit = row?;
            grouped.entry(unit.tags.canonical_key()).or_default().push(unit);
        }
        Ok(grouped)
    }

    /// All non-consolidated, non-observation memory units in a bank as
    /// a flat list ordered by `created_at`, for the deduplication
    /// pass's against-DB comparison (§4.3). Unlike
    /// `units_by_exact_tag_set`, dedup buckets by best-date window
    /// rather than tag set, so the grouping happens in the caller.
    pub fn facts_for_dedup(&self, bank_id: &str) -> Result<Vec<MemoryUnit>> {
        let conn = self.reader();
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memory_units WHERE bank_id = ?1 AND consolidated_at IS NULL \
             AND fact_type != 'observation' ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![bank_id], row_to_memory_unit)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::from)
    }

    /// Observations whose `source_memory_ids` includes `memory_id`,
    /// used by the consolidation engine to find the reinforcement
    /// target for a freshly-batched fact before deciding create vs
    /// update (§4.5.2).
    pub fn observations_citing(&self, bank_id: &str, memory_id: &str) -> Result<Vec<MemoryUnit>> {
        let conn = self.reader();
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memory_units WHERE bank_id = ?1 AND fact_type = 'observation' AND source_memory_ids_json LIKE ?2");
        let needle = format!("%\"{memory_id}\"%");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![bank_id, needle], row_to_memory_unit)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::from)
    }

    /// Step 1 of recall's candidate gathering: dense cosine search
    /// against the bank's in-memory index.
    pub fn candidates_by_dense(&self, bank_id: &str, query_embedding: &[f32], limit: usize) -> Result<Vec<(String, f32)>> {
        self.ensure_vector_index_loaded(bank_id)?;
        let indexes = self.vector_indexes.lock().expect("vector index cache mutex poisoned");
        let index = indexes.get(bank_id).ok_or_else(|| EngineError::not_found("bank", bank_id))?;
        index.search(query_embedding, limit).map_err(|e| EngineError::Conflict(e.to_string()))
    }

    /// Step 2: FTS5/BM25 lexical search. An empty sanitized query (e.g.
    /// a query that is only punctuation) skips the `MATCH` entirely,
    /// since FTS5 rejects an empty match expression.
    pub fn candidates_by_sparse(&self, bank_id: &str, query_text: &str, limit: usize) -> Result<Vec<(String, f32)>> {
        let sanitized = sanitize_fts5_query(query_text);
        if sanitized.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT m.id, bm25(memory_units_fts) AS rank
             FROM memory_units_fts
             JOIN memory_units m ON m.rowid = memory_units_fts.rowid
             WHERE memory_units_fts MATCH ?1 AND m.bank_id = ?2 AND m.consolidated_at IS NULL
             ORDER BY rank LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![sanitized, bank_id, limit as i64], |row| {
            let id: String = row.get(0)?;
            let bm25: f64 = row.get(1)?;
            // bm25() returns lower-is-better; invert to a positive
            // similarity-like score so fusion treats every candidate
            // source uniformly (higher is better).
            Ok((id, (1.0 / (1.0 + bm25.max(0.0))) as f32))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::from)
    }

    /// Step 3: temporal-recency pool, ranked by distance from
    /// `reference` using each candidate's best-date.
    pub fn candidates_by_temporal(&self, bank_id: &str, reference: DateTime<Utc>, limit: usize) -> Result<Vec<(String, f32)>> {
        let conn = self.reader();
        let sql = format!("SELECT {MEMORY_COLUMNS} FROM memory_units WHERE bank_id = ?1 AND consolidated_at IS NULL");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![bank_id], row_to_memory_unit)?;
        let mut candidates = Vec::new();
        for row in rows {
            let unit = row?;
            candidates.push(TemporalCandidate::new(unit.id.clone(), unit.best_date()));
        }
        let mut ranked = crate::search::rank_by_recency(candidates, reference);
        ranked.truncate(limit);
        Ok(ranked)
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    pub fn insert_document(&self, document: &Document) -> Result<()> {
        let tags_json = serde_json::to_string(&document.tags.as_vec()).map_err(|e| EngineError::Validation(e.to_string()))?;
        self.writer().execute(
            "INSERT INTO documents (id, bank_id, title, raw_text, tags_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![document.id, document.bank_id, document.title, document.raw_text, tags_json, document.created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_document(&self, document_id: &str) -> Result<Document> {
        let conn = self.reader();
        conn.query_row(
            "SELECT id, bank_id, title, raw_text, tags_json, created_at FROM documents WHERE id = ?1",
            params![document_id],
            row_to_document,
        )
        .optional()?
        .ok_or_else(|| EngineError::not_found("document", document_id))
    }

    /// Batched hydration for chunk assembly (§4.6 step 8): recall's
    /// chunk attachment needs the parent document of every top-ranked
    /// candidate, not just one.
    pub fn fetch_documents(&self, ids: &[String]) -> Result<Vec<Document>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.reader();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT id, bank_id, title, raw_text, tags_json, created_at FROM documents WHERE id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|id| id as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), row_to_document)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::from)
    }

    // ------------------------------------------------------------------
    // Async operations
    // ------------------------------------------------------------------

    pub fn create_operation(&self, id: &str, bank_id: &str, kind: &str, created_at: DateTime<Utc>) -> Result<()> {
        self.writer().execute(
            "INSERT INTO async_operations (id, bank_id, kind, status, created_at) VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![id, bank_id, kind, created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn complete_operation(&self, id: &str, completed_at: DateTime<Utc>, result_metadata_json: &str) -> Result<()> {
        self.writer().execute(
            "UPDATE async_operations SET status = 'completed', completed_at = ?1, result_metadata_json = ?2 WHERE id = ?3",
            params![completed_at.to_rfc3339(), result_metadata_json, id],
        )?;
        Ok(())
    }

    pub fn fail_operation(&self, id: &str, completed_at: DateTime<Utc>, error: &str) -> Result<()> {
        self.writer().execute(
            "UPDATE async_operations SET status = 'failed', completed_at = ?1, error = ?2 WHERE id = ?3",
            params![completed_at.to_rfc3339(), error, id],
        )?;
        Ok(())
    }

    /// Cooperative cancellation (§5): marks the row `cancelled` so the
    /// worker observes it at its next checkpoint. Does not interrupt an
    /// in-flight LLM call; the worker finishes that call, discards the
    /// result, and exits on its own.
    pub fn cancel_operation(&self, id: &str, completed_at: DateTime<Utc>) -> Result<()> {
        self.writer().execute(
            "UPDATE async_operations SET status = 'cancelled', completed_at = ?1 WHERE id = ?2 AND status IN ('pending', 'running')",
            params![completed_at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// True once `cancel_operation` has flagged this row, or the caller
    /// simply wants to poll whether a running job should stop. Workers
    /// call this between consolidation batches / candidate-pool stages.
    pub fn is_cancelled(&self, id: &str) -> Result<bool> {
        let conn = self.reader();
        let status: String = conn.query_row("SELECT status FROM async_operations WHERE id = ?1", params![id], |r| r.get(0))?;
        Ok(status == "cancelled")
    }

    /// Insert an operation row verbatim, preserving its original id,
    /// status, and timestamps. Used by `import_bank` to faithfully
    /// replay an exported operations log rather than re-deriving state
    /// transitions that already happened on the source instance.
    fn insert_operation_row(&self, row: &OperationRow) -> Result<()> {
        self.writer().execute(
            "INSERT INTO async_operations (id, bank_id, kind, status, created_at, completed_at, error, result_metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.id,
                row.bank_id,
                row.kind,
                row.status,
                row.created_at.to_rfc3339(),
                row.completed_at.map(|d| d.to_rfc3339()),
                row.error,
                row.result_metadata_json,
            ],
        )?;
        Ok(())
    }

    pub fn get_operation(&self, id: &str) -> Result<OperationRow> {
        let conn = self.reader();
        conn.query_row(
            "SELECT id, bank_id, kind, status, created_at, completed_at, error, result_metadata_json FROM async_operations WHERE id = ?1",
            params![id],
            row_to_operation,
        )
        .optional()?
        .ok_or_else(|| EngineError::not_found("operation", id))
    }

    pub fn list_operations_by_bank(&self, bank_id: &str, status: Option<&str>) -> Result<Vec<OperationRow>> {
        let conn = self.reader();
        let rows = if let Some(status) = status {
            let mut stmt = conn.prepare(
                "SELECT id, bank_id, kind, status, created_at, completed_at, error, result_metadata_json FROM async_operations WHERE bank_id = ?1 AND status = ?2 ORDER BY created_at",
            )?;
            stmt.query_map(params![bank_id, status], row_to_operation)?.collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, bank_id, kind, status, created_at, completed_at, error, result_metadata_json FROM async_operations WHERE bank_id = ?1 ORDER BY created_at",
            )?;
            stmt.query_map(params![bank_id], row_to_operation)?.collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Mental models
    // ------------------------------------------------------------------

    pub fn upsert_mental_model(&self, model: &MentalModel) -> Result<()> {
        let tags_json = serde_json::to_string(&model.tags.as_vec()).map_err(|e| EngineError::Validation(e.to_string()))?;
        let based_on_json = serde_json::to_string(&model.based_on).map_err(|e| EngineError::Validation(e.to_string()))?;
        self.writer().execute(
            "INSERT INTO mental_models (id, bank_id, tags_json, summary, based_on_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET tags_json = excluded.tags_json, summary = excluded.summary,
                based_on_json = excluded.based_on_json, updated_at = excluded.updated_at",
            params![model.id, model.bank_id, tags_json, model.summary, based_on_json, model.updated_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn mental_models_for_bank(&self, bank_id: &str) -> Result<Vec<MentalModel>> {
        let conn = self.reader();
        let mut stmt = conn.prepare("SELECT id, bank_id, tags_json, summary, based_on_json, updated_at FROM mental_models WHERE bank_id = ?1")?;
        let rows = stmt.query_map(params![bank_id], row_to_mental_model)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::from)
    }

    pub fn mental_model_matching(&self, bank_id: &str, tags: &TagSet, mode: TagMatchMode) -> Result<Option<MentalModel>> {
        Ok(self.mental_models_for_bank(bank_id)?.into_iter().find(|m| mode.matches(&m.tags, tags)))
    }

    // ------------------------------------------------------------------
    // Directives
    // ------------------------------------------------------------------

    pub fn insert_directive(&self, directive: &Directive) -> Result<()> {
        let tags_json = serde_json::to_string(&directive.tags.as_vec()).map_err(|e| EngineError::Validation(e.to_string()))?;
        self.writer().execute(
            "INSERT INTO directives (id, bank_id, tags_json, text, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![directive.id, directive.bank_id, tags_json, directive.text, directive.created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn directives_matching(&self, bank_id: &str, tags: &TagSet, mode: TagMatchMode) -> Result<Vec<Directive>> {
        let conn = self.reader();
        let mut stmt = conn.prepare("SELECT id, bank_id, tags_json, text, created_at FROM directives WHERE bank_id = ?1")?;
        let rows = stmt.query_map(params![bank_id], row_to_directive)?;
        let all = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(all.into_iter().filter(|d| mode.matches(&d.tags, tags)).collect())
    }

    // ------------------------------------------------------------------
    // Export / import (backup, bank migration)
    // ------------------------------------------------------------------

    pub fn export_bank(&self, bank_id: &str) -> Result<BankExport> {
        let bank = self.get_bank(bank_id)?;
        let conn = self.reader();

        let mut mu_stmt = conn.prepare(&format!("SELECT {MEMORY_COLUMNS} FROM memory_units WHERE bank_id = ?1"))?;
        let memory_units = mu_stmt.query_map(params![bank_id], row_to_memory_unit)?.collect::<rusqlite::Result<Vec<_>>>()?;

        let mut doc_stmt = conn.prepare("SELECT id, bank_id, title, raw_text, tags_json, created_at FROM documents WHERE bank_id = ?1")?;
        let documents = doc_stmt.query_map(params![bank_id], row_to_document)?.collect::<rusqlite::Result<Vec<_>>>()?;

        drop(conn);
        let mental_models = self.mental_models_for_bank(bank_id)?;
        let directives = self.directives_matching(bank_id, &TagSet::default(), TagMatchMode::Any)?;
        let async_operations = self.list_operations_by_bank(bank_id, None)?;

        Ok(BankExport { bank, memory_units, documents, mental_models, directives, async_operations })
    }

    pub fn import_bank(&self, export: &BankExport) -> Result<()> {
        self.create_bank(&export.bank)?;
        for document in &export.documents {
            self.insert_document(document)?;
        }
        for unit in &export.memory_units {
            self.insert_memory(unit)?;
        }
        for model in &export.mental_models {
            self.upsert_mental_model(model)?;
        }
        for directive in &export.directives {
            self.insert_directive(directive)?;
        }
        for operation in &export.async_operations {
            self.insert_operation_row(operation)?;
        }
        Ok(())
    }
}

/// A full bank snapshot, serializable for backup or cross-instance
/// migration (SPEC_FULL.md §4.9): every table scoped to the bank,
/// including its async-operations audit trail.
#[derive(Debug, Serialize, Deserialize)]
pub struct BankExport {
    pub bank: Bank,
    pub memory_units: Vec<MemoryUnit>,
    pub documents: Vec<Document>,
    pub mental_models: Vec<MentalModel>,
    pub directives: Vec<Directive>,
    pub async_operations: Vec<OperationRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRow {
    pub id: String,
    pub bank_id: String,
    pub kind: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result_metadata_json: Option<String>,
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::StorageTransient(e)
    }
}

// ------------------------------------------------------------------
// Connection setup
// ------------------------------------------------------------------

fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;
         PRAGMA temp_store = MEMORY;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA mmap_size = 268435456;
         PRAGMA journal_size_limit = 67108864;",
    )?;
    Ok(())
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    let current_version: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
        conn.execute_batch(migration.up)
            .map_err(|e| EngineError::Fatal(format!("migration {} ({}) failed: {e}", migration.version, migration.description)))?;
        conn.pragma_update(None, "user_version", migration.version)?;
    }
    Ok(())
}

fn default_db_path() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("ai", "hindsight", "engine")
        .ok_or_else(|| EngineError::Fatal("could not determine a home directory for the default database path".to_string()))?;
    Ok(proj_dirs.data_dir().join("hindsight.db"))
}

#[cfg(unix)]
fn restrict_to_owner_dir(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o700);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn restrict_to_owner_dir(_path: &Path) {}

#[cfg(unix)]
fn restrict_to_owner_file(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn restrict_to_owner_file(_path: &Path) {}

// ------------------------------------------------------------------
// Row mapping
// ------------------------------------------------------------------

const MEMORY_COLUMNS: &str = "id, bank_id, fact_type, text, embedding, tags_json, document_id, \
     event_date, occurred_start, occurred_end, mentioned_at, created_at, updated_at, consolidated_at, \
     source_memory_ids_json, proof_count, history_json";

const MEMORY_SELECT_SQL: &str = "SELECT id, bank_id, fact_type, text, embedding, tags_json, document_id, \
     event_date, occurred_start, occurred_end, mentioned_at, created_at, updated_at, consolidated_at, \
     source_memory_ids_json, proof_count, history_json FROM memory_units WHERE id = ?1";

fn parse_dt(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_opt_dt(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_dt(&s)).transpose()
}

fn row_to_memory_unit(row: &Row) -> rusqlite::Result<MemoryUnit> {
    let fact_type_str: String = row.get(2)?;
    let fact_type = FactType::parse(&fact_type_str)
        .ok_or_else(|| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, format!("unknown fact_type {fact_type_str}").into()))?;

    let embedding_blob: Option<Vec<u8>> = row.get(4)?;
    let embedding = embedding_blob.and_then(|b| Embedding::from_bytes(&b)).map(|e| e.vector);

    let tags_json: String = row.get(5)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();

    let source_ids_json: String = row.get(14)?;
    let source_memory_ids: Vec<String> = serde_json::from_str(&source_ids_json).unwrap_or_default();

    let history_json: String = row.get(16)?;
    let history: Vec<HistoryEntry> = serde_json::from_str(&history_json).unwrap_or_default();

    Ok(MemoryUnit {
        id: row.get(0)?,
        bank_id: row.get(1)?,
        fact_type,
        text: row.get(3)?,
        embedding,
        tags: TagSet::from(tags),
        document_id: row.get(6)?,
        event_date: parse_opt_dt(row.get(7)?)?,
        occurred_start: parse_opt_dt(row.get(8)?)?,
        occurred_end: parse_opt_dt(row.get(9)?)?,
        mentioned_at: parse_opt_dt(row.get(10)?)?,
        created_at: parse_dt(&row.get::<_, String>(11)?)?,
        updated_at: parse_dt(&row.get::<_, String>(12)?)?,
        consolidated_at: parse_opt_dt(row.get(13)?)?,
        source_memory_ids,
        proof_count: row.get::<_, i64>(15)? as u32,
        history,
    })
}

fn insert_memory_row(conn: &Connection, unit: &MemoryUnit) -> rusqlite::Result<()> {
    let tags_json = serde_json::to_string(&unit.tags.as_vec()).unwrap_or_else(|_| "[]".to_string());
    let source_ids_json = serde_json::to_string(&unit.source_memory_ids).unwrap_or_else(|_| "[]".to_string());
    let history_json = serde_json::to_string(&unit.history).unwrap_or_else(|_| "[]".to_string());
    let embedding_blob = unit.embedding.as_ref().map(|v| Embedding::new(v.clone()).to_bytes());

    conn.execute(
        "INSERT INTO memory_units (
            id, bank_id, fact_type, text, embedding, tags_json, document_id,
            event_date, occurred_start, occurred_end, mentioned_at, created_at, updated_at, consolidated_at,
            source_memory_ids_json, proof_count, history_json
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
        params![
            unit.id,
            unit.bank_id,
            unit.fact_type.as_str(),
            unit.text,
            embedding_blob,
            tags_json,
            unit.document_id,
            unit.event_date.map(|d| d.to_rfc3339()),
            unit.occurred_start.map(|d| d.to_rfc3339()),
            unit.occurred_end.map(|d| d.to_rfc3339()),
            unit.mentioned_at.map(|d| d.to_rfc3339()),
            unit.created_at.to_rfc3339(),
            unit.updated_at.to_rfc3339(),
            unit.consolidated_at.map(|d| d.to_rfc3339()),
            source_ids_json,
            unit.proof_count as i64,
            history_json,
        ],
    )?;
    Ok(())
}

fn update_memory_row(conn: &Connection, unit: &MemoryUnit) -> rusqlite::Result<()> {
    let tags_json = serde_json::to_string(&unit.tags.as_vec()).unwrap_or_else(|_| "[]".to_string());
    let source_ids_json = serde_json::to_string(&unit.source_memory_ids).unwrap_or_else(|_| "[]".to_string());
    let history_json = serde_json::to_string(&unit.history).unwrap_or_else(|_| "[]".to_string());
    let embedding_blob = unit.embedding.as_ref().map(|v| Embedding::new(v.clone()).to_bytes());

    conn.execute(
        "UPDATE memory_units SET
            fact_type = ?1, text = ?2, embedding = ?3, tags_json = ?4, document_id = ?5,
            event_date = ?6, occurred_start = ?7, occurred_end = ?8, mentioned_at = ?9,
            updated_at = ?10, consolidated_at = ?11, source_memory_ids_json = ?12,
            proof_count = ?13, history_json = ?14
         WHERE id = ?15",
        params![
            unit.fact_type.as_str(),
            unit.text,
            embedding_blob,
            tags_json,
            unit.document_id,
            unit.event_date.map(|d| d.to_rfc3339()),
            unit.occurred_start.map(|d| d.to_rfc3339()),
            unit.occurred_end.map(|d| d.to_rfc3339()),
            unit.mentioned_at.map(|d| d.to_rfc3339()),
            unit.updated_at.to_rfc3339(),
            unit.consolidated_at.map(|d| d.to_rfc3339()),
            source_ids_json,
            unit.proof_count as i64,
            history_json,
            unit.id,
        ],
    )?;
    Ok(())
}

fn row_to_bank(row: &Row) -> rusqlite::Result<Bank> {
    let config_json: String = row.get(4)?;
    let config: BankConfig = serde_json::from_str(&config_json).unwrap_or_default();
    Ok(Bank {
        id: row.get(0)?,
        name: row.get(1)?,
        embedding_dim: row.get::<_, i64>(2)? as usize,
        created_at: parse_dt(&row.get::<_, String>(3)?)?,
        config,
    })
}

fn row_to_document(row: &Row) -> rusqlite::Result<Document> {
    let tags_json: String = row.get(4)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    Ok(Document {
        id: row.get(0)?,
        bank_id: row.get(1)?,
        title: row.get(2)?,
        raw_text: row.get(3)?,
        tags: TagSet::from(tags),
        created_at: parse_dt(&row.get::<_, String>(5)?)?,
    })
}

fn row_to_mental_model(row: &Row) -> rusqlite::Result<MentalModel> {
    let tags_json: String = row.get(2)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    let based_on_json: String = row.get(4)?;
    let based_on: Vec<String> = serde_json::from_str(&based_on_json).unwrap_or_default();
    Ok(MentalModel {
        id: row.get(0)?,
        bank_id: row.get(1)?,
        tags: TagSet::from(tags),
        summary: row.get(3)?,
        based_on,
        updated_at: parse_dt(&row.get::<_, String>(5)?)?,
    })
}

fn row_to_directive(row: &Row) -> rusqlite::Result<Directive> {
    let tags_json: String = row.get(2)?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    Ok(Directive {
        id: row.get(0)?,
        bank_id: row.get(1)?,
        tags: TagSet::from(tags),
        text: row.get(3)?,
        created_at: parse_dt(&row.get::<_, String>(4)?)?,
    })
}

fn row_to_operation(row: &Row) -> rusqlite::Result<OperationRow> {
    Ok(OperationRow {
        id: row.get(0)?,
        bank_id: row.get(1)?,
        kind: row.get(2)?,
        status: row.get(3)?,
        created_at: parse_dt(&row.get::<_, String>(4)?)?,
        completed_at: parse_opt_dt(row.get(5)?)?,
        error: row.get(6)?,
        result_metadata_json: row.get(7)?,
    })
}
