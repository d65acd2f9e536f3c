//! Whole-scope eviction
//!
//! Before a save the total size of the job scope is compared with the configured
//! maximum. An oversized scope is deleted entirely and the save is skipped; there
//! is no per-item eviction.

use anyhow::Result;
use tracing::{debug, info, warn};

use super::repository::ObjectRepository;

/// Result of comparing a scope against the size limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionDecision {
    /// No limit configured
    Disabled,
    /// Scope size is at or below the limit
    WithinLimit(u64),
    /// Scope size is above the limit
    Exceeded { total: u64, max: u64 },
}

impl EvictionDecision {
    pub fn status_line(&self) -> Option<String> {
        match self {
            EvictionDecision::Exceeded { total, max } => Some(format!(
                "Cache size {} bytes exceeds maximum of {} bytes; cache cleared and will be empty on the next build",
                total, max
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionPolicy {
    /// 0 disables the check
    max_bytes: u64,
}

impl EvictionPolicy {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    /// Compare the scope's current size with the limit
    pub async fn evaluate(&self, repo: &ObjectRepository) -> Result<EvictionDecision> {
        if self.max_bytes == 0 {
            return Ok(EvictionDecision::Disabled);
        }
        let total = repo.total_size().await?;
        if total > self.max_bytes {
            Ok(EvictionDecision::Exceeded {
                total,
                max: self.max_bytes,
            })
        } else {
            Ok(EvictionDecision::WithinLimit(total))
        }
    }

    /// Evaluate, and delete the whole scope if it is over the limit
    pub async fn enforce(&self, repo: &ObjectRepository) -> Result<EvictionDecision> {
        let decision = self.evaluate(repo).await?;
        match decision {
            EvictionDecision::Exceeded { total, max } => {
                warn!(
                    scope = %repo.scope().prefix,
                    total = total,
                    max = max,
                    "Cache scope over size limit, clearing"
                );
                let deleted = repo.delete_all().await?;
                info!(scope = %repo.scope().prefix, deleted = deleted, "Cache scope cleared");
            }
            EvictionDecision::WithinLimit(total) => {
                debug!(scope = %repo.scope().prefix, total = total, "Cache scope within size limit");
            }
            EvictionDecision::Disabled => {}
        }
        Ok(decision)
    }
}
