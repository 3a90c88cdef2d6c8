//! Bank lifecycle and hierarchical config resolution (§3.1, §9).
//!
//! A bank is created once with a fixed `embedding_dim` — SPEC_FULL.md's
//! Fatal-error rule (no recovery path) fires if a caller ever tries to
//! change it on a bank with existing rows, so `create_bank` is the only
//! writer of that field. Everything else (dedup threshold, diversity
//! threshold, consolidation batch size) resolves through three layers,
//! narrowest wins: engine defaults → bank-level `BankConfig` overrides
//! → an explicit call-site override, the same three-layer shape the
//! teacher's own runtime config resolves through.

use chrono::Utc;

use crate::consolidation::DEFAULT_BATCH_THRESHOLD;
use crate::dedup::DEFAULT_SIMILARITY_THRESHOLD;
use crate::error::{EngineError, Result};
use crate::memory::{new_id, Bank, BankConfig};
use crate::search::RecallConfig;
use crate::storage::Storage;

/// Engine-wide defaults, overridden per bank by `BankConfig` and per
/// call by an explicit argument. Mirrors `RecallConfig::default` (§4.6)
/// for the recall-facing knobs it doesn't already own.
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    pub dedup_similarity_threshold: f32,
    pub diversity_similarity_threshold: f32,
    pub consolidation_batch_size: usize,
    pub consolidation_llm_batch_size: usize,
}

/// No canonical default survived the distillation for the per-LLM-call
/// chunk size (§4.5.1 step 3); chosen conservatively — large enough to
/// amortize one LLM round-trip over several facts, small enough that a
/// single prompt never approaches a typical 8k-context budget.
pub const DEFAULT_LLM_BATCH_SIZE: usize = 10;

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            dedup_similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            diversity_similarity_threshold: RecallConfig::default().diversity_threshold,
            consolidation_batch_size: DEFAULT_BATCH_THRESHOLD,
            consolidation_llm_batch_size: DEFAULT_LLM_BATCH_SIZE,
        }
    }
}

/// Resolved config for one call, after layering defaults under the
/// bank's overrides under an explicit call-site override (narrowest
/// non-`None` value wins at each field independently).
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub dedup_similarity_threshold: f32,
    pub diversity_similarity_threshold: f32,
    pub consolidation_batch_size: usize,
    pub consolidation_llm_batch_size: usize,
}

/// Resolve one bank's effective config. `call_site` overrides, when
/// present, win over both the bank and the engine defaults.
pub fn resolve_config(defaults: &EngineDefaults, bank: &BankConfig, call_site: &BankConfig) -> ResolvedConfig {
    ResolvedConfig {
        dedup_similarity_threshold: call_site
            .dedup_similarity_threshold
            .or(bank.dedup_similarity_threshold)
            .unwrap_or(defaults.dedup_similarity_threshold),
        diversity_similarity_threshold: call_site
            .diversity_similarity_threshold
            .or(bank.diversity_similarity_threshold)
            .unwrap_or(defaults.diversity_similarity_threshold),
        consolidation_batch_size: call_site
            .consolidation_batch_size
            .or(bank.consolidation_batch_size)
            .unwrap_or(defaults.consolidation_batch_size),
        consolidation_llm_batch_size: call_site
            .consolidation_llm_batch_size
            .or(bank.consolidation_llm_batch_size)
            .unwrap_or(defaults.consolidation_llm_batch_size),
    }
}

/// Create a new bank with a fixed embedding dimension. Dimension is
/// immutable thereafter — changing it on a bank with existing rows
/// would silently corrupt every stored embedding's meaning, so there
/// is deliberately no `update_embedding_dim` operation at all.
pub fn create_bank(storage: &Storage, name: impl Into<String>, embedding_dim: usize, config: BankConfig) -> Result<Bank> {
    if embedding_dim == 0 {
        return Err(EngineError::Validation("embedding_dim must be positive".to_string()));
    }
    let bank = Bank { id: new_id(), name: name.into(), embedding_dim, created_at: Utc::now(), config };
    storage.create_bank(&bank)?;
    Ok(bank)
}

pub fn get_bank(storage: &Storage, bank_id: &str) -> Result<Bank> {
    storage.get_bank(bank_id)
}

pub fn list_banks(storage: &Storage) -> Result<Vec<Bank>> {
    storage.list_banks()
}

/// Delete a bank and every row scoped to it. Irreversible; callers
/// that want a safety net should `export_bank` first (§4.9).
pub fn delete_bank(storage: &Storage, bank_id: &str) -> Result<()> {
    storage.delete_bank(bank_id)
}
