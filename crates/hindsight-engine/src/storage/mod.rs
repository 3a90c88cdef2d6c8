//! Storage Module
//!
//! SQLite-based storage layer: banks, memory units, documents, async
//! operations, mental models, and directives, backed by a
//! reader/writer connection split plus an FTS5 lexical index and an
//! in-memory brute-force dense index per bank.

mod migrations;
mod sqlite;

pub use migrations::{Migration, MIGRATIONS};
pub use sqlite::{BankExport, OperationRow, Storage};
