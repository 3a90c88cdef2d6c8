//! Test bank harness: wraps `Storage` + bank creation so each scenario
//! test gets an isolated, pre-registered bank without repeating the
//! open/create boilerplate `hindsight-engine`'s own unit tests already
//! use throughout the crate.

use std::path::PathBuf;

use hindsight_engine::{create_bank, Bank, BankConfig, Storage};
use tempfile::TempDir;

/// One bank plus the storage instance it lives in. Most scenarios want
/// [`TestBank::new_in_memory`]; the backup/restore scenario needs a
/// real file path so a second `Storage` can reopen it, hence
/// [`TestBank::new_on_disk`].
pub struct TestBank {
    pub storage: Storage,
    pub bank: Bank,
    _temp_dir: Option<TempDir>,
}

impl TestBank {
    /// An isolated in-memory bank with a fixed 4-dimensional embedding
    /// space, matching the `ScriptedEmbedder` fixtures' default.
    pub fn new_in_memory(name: &str) -> Self {
        Self::new_in_memory_with_dim(name, 4)
    }

    pub fn new_in_memory_with_dim(name: &str, embedding_dim: usize) -> Self {
        let storage = Storage::open_in_memory(name).expect("open in-memory storage");
        let bank = create_bank(&storage, name, embedding_dim, BankConfig::default()).expect("create bank");
        Self { storage, bank, _temp_dir: None }
    }

    /// A bank backed by a real database file; returns the harness plus
    /// the path, so a caller can reopen the same file as a fresh
    /// `Storage` (the backup/restore scenario's "restart the process"
    /// stand-in).
    pub fn new_on_disk(name: &str) -> (Self, PathBuf) {
        let temp_dir = TempDir::new().expect("create temp dir");
        let db_path = temp_dir.path().join("hindsight.db");
        let storage = Storage::open_at(&db_path).expect("open file-backed storage");
        let bank = create_bank(&storage, name, 4, BankConfig::default()).expect("create bank");
        let path = db_path.clone();
        (Self { storage, bank, _temp_dir: Some(temp_dir) }, path)
    }

    pub fn bank_id(&self) -> &str {
        &self.bank.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_bank_is_created_and_addressable() {
        let test_bank = TestBank::new_in_memory("harness_smoke");
        let fetched = hindsight_engine::get_bank(&test_bank.storage, test_bank.bank_id()).unwrap();
        assert_eq!(fetched.name, "harness_smoke");
    }

    #[test]
    fn on_disk_bank_survives_reopening_the_same_path() {
        let (test_bank, path) = TestBank::new_on_disk("harness_disk");
        let bank_id = test_bank.bank_id().to_string();
        drop(test_bank);

        let reopened = Storage::open_at(&path).expect("reopen storage file");
        let fetched = hindsight_engine::get_bank(&reopened, &bank_id).unwrap();
        assert_eq!(fetched.name, "harness_disk");
    }
}
