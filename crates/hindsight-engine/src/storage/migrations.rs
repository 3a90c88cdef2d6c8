//! Database Migrations
//!
//! Schema migration definitions for the storage layer. Applied in order
//! at `Storage::new()` against `schema_version` in `PRAGMA user_version`,
//! the same idiom the teacher uses.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: banks, memory_units, documents",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "FTS5 lexical index over memory_units with sync triggers",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Async operations, mental models, directives",
        up: MIGRATION_V3_UP,
    },
    Migration {
        version: 4,
        description: "Performance: page_size 8192, busy_timeout, incremental vacuum",
        up: MIGRATION_V4_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

/// V1: banks, memory_units, documents. See SPEC_FULL.md §6 for the
/// logical schema this realizes.
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS banks (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    embedding_dim INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    config_json TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    title TEXT,
    raw_text TEXT NOT NULL,
    tags_json TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_bank ON documents(bank_id);

CREATE TABLE IF NOT EXISTS memory_units (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    fact_type TEXT NOT NULL,
    text TEXT NOT NULL,
    embedding BLOB,
    tags_json TEXT NOT NULL DEFAULT '[]',
    document_id TEXT REFERENCES documents(id) ON DELETE SET NULL,

    event_date TEXT,
    occurred_start TEXT,
    occurred_end TEXT,
    mentioned_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    consolidated_at TEXT,

    source_memory_ids_json TEXT NOT NULL DEFAULT '[]',
    proof_count INTEGER NOT NULL DEFAULT 0,
    history_json TEXT NOT NULL DEFAULT '[]'
);

-- Composite index supporting the bank + tag-scope + best-date access
-- path shared by recall's temporal pool, consolidation batching, and
-- dedup's bucketed window query.
CREATE INDEX IF NOT EXISTS idx_memory_units_bank_created
    ON memory_units(bank_id, created_at);
CREATE INDEX IF NOT EXISTS idx_memory_units_bank_consolidated
    ON memory_units(bank_id, consolidated_at);
CREATE INDEX IF NOT EXISTS idx_memory_units_document
    ON memory_units(document_id);
"#;

/// V2: FTS5 external-content table + sync triggers, the teacher's
/// pattern for keeping a lexical index consistent with the row table
/// without duplicating storage of `text`.
const MIGRATION_V2_UP: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS memory_units_fts USING fts5(
    text,
    content='memory_units',
    content_rowid='rowid',
    tokenize='porter'
);

CREATE TRIGGER IF NOT EXISTS memory_units_ai AFTER INSERT ON memory_units BEGIN
    INSERT INTO memory_units_fts(rowid, text) VALUES (new.rowid, new.text);
END;

CREATE TRIGGER IF NOT EXISTS memory_units_ad AFTER DELETE ON memory_units BEGIN
    INSERT INTO memory_units_fts(memory_units_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
END;

CREATE TRIGGER IF NOT EXISTS memory_units_au AFTER UPDATE ON memory_units BEGIN
    INSERT INTO memory_units_fts(memory_units_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
    INSERT INTO memory_units_fts(rowid, text) VALUES (new.rowid, new.text);
END;
"#;

/// V3: async operation tracker, mental models, directives.
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS async_operations (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    completed_at TEXT,
    error TEXT,
    result_metadata_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_async_operations_bank_status
    ON async_operations(bank_id, status);

CREATE TABLE IF NOT EXISTS mental_models (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    tags_json TEXT NOT NULL DEFAULT '[]',
    summary TEXT NOT NULL,
    based_on_json TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mental_models_bank ON mental_models(bank_id);

CREATE TABLE IF NOT EXISTS directives (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    tags_json TEXT NOT NULL DEFAULT '[]',
    text TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_directives_bank ON directives(bank_id);
"#;

/// V4: pragma-level tuning applied as a migration so it runs exactly
/// once per fresh database the same way schema changes do, even though
/// it touches no tables.
const MIGRATION_V4_UP: &str = r#"
PRAGMA page_size = 8192;
"#;
