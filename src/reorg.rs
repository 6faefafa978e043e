//! Detects and recovers from blockchain reorganizations (§4.8).

use log::{error, info, warn};

use crate::error::IndexerError;
use crate::repository::Repository;
use crate::rpc::RpcClient;

pub struct ReorgHandler<'a> {
    repo: &'a dyn Repository,
    rpc: &'a RpcClient,
    start_block_height: u64,
    max_reorg_depth: u64,
}

impl<'a> ReorgHandler<'a> {
    pub fn new(repo: &'a dyn Repository, rpc: &'a RpcClient, start_block_height: u64, max_reorg_depth: u64) -> Self {
        ReorgHandler {
            repo,
            rpc,
            start_block_height,
            max_reorg_depth,
        }
    }

    /// True if the stored hash for `height` disagrees with the chain's current hash.
    /// A height with no stored row is treated as "no reorg to detect here" rather
    /// than a mismatch.
    pub async fn detect_reorg(&self, height: u64) -> bool {
        let Ok(Some(processed)) = self.repo.get_processed_block(height).await else {
            return false;
        };
        match self.rpc.get_block_hash(height).await {
            Ok(current_hash) => processed.block_hash != current_hash.to_string(),
            Err(e) => {
                error!("error detecting reorg at height {height}: {e}");
                false
            }
        }
    }

    /// Walks backward from `reorg_height`, bounded by `max_reorg_depth`, until it
    /// finds a height whose stored hash still matches the chain. Heights with no
    /// stored row are skipped rather than treated as a mismatch. Falls back to
    /// `reorg_height - max_reorg_depth` (clamped to `start_block_height`) if no
    /// match is found within the bound.
    async fn find_common_ancestor(&self, reorg_height: u64) -> u64 {
        let max_depth = self.max_reorg_depth.min(reorg_height.saturating_sub(self.start_block_height));
        let mut height = reorg_height;

        for _ in 0..max_depth {
            if height == 0 {
                break;
            }
            match self.repo.get_processed_block(height).await {
                Ok(Some(processed)) => match self.rpc.get_block_hash(height).await {
                    Ok(current_hash) if processed.block_hash == current_hash.to_string() => {
                        return height;
                    }
                    Ok(_) => height -= 1,
                    Err(e) => {
                        error!("error walking back to find common ancestor at height {height}: {e}");
                        height -= 1;
                    }
                },
                Ok(None) => height -= 1,
                Err(e) => {
                    error!("error reading processed block at height {height}: {e}");
                    height -= 1;
                }
            }
        }

        let fallback = reorg_height.saturating_sub(self.max_reorg_depth).max(self.start_block_height);
        warn!("could not find common ancestor within {max_depth} blocks, falling back to height {fallback}");
        fallback
    }

    /// Handles a detected reorg at `reorg_height`, returning the height processing
    /// should resume from. Rolls back every `ProcessedBlock`/`BRC20Operation` row
    /// above the common ancestor and rebuilds balances by full replay (§9).
    pub async fn handle_reorg(&self, reorg_height: u64) -> Result<u64, IndexerError> {
        warn!("handling reorg detected at height {reorg_height}");

        let common_ancestor = self.find_common_ancestor(reorg_height).await;
        info!(
            "found common ancestor at height {common_ancestor}, rolling back {} blocks",
            reorg_height.saturating_sub(common_ancestor)
        );

        self.repo
            .rollback_and_rebuild(common_ancestor)
            .await
            .map_err(|e| IndexerError::Fatal(format!("reorg rollback failed: {e}")))?;

        Ok(common_ancestor + 1)
    }
}
