//! Main block-processing driver (§4.7): pulls blocks from RPC, pre-scans for
//! BRC-20 candidates, prioritizes marketplace transfers, drives each candidate
//! through the processor, and commits per-block progress.

use bitcoin::{Block, Network, Transaction};
use chrono::{TimeZone, Utc};
use log::{error, info, warn};

use crate::config::Settings;
use crate::error::IndexerError;
use crate::model::{Brc20Operation, IntermediateState, ProcessedBlock};
use crate::processor::{BlockContext, Processor, TransferType};
use crate::reorg::ReorgHandler;
use crate::repository::Repository;
use crate::rpc::RpcClient;
use crate::script;
use crate::utxo::AddressResolver;

/// ASCII bytes of `"p":"brc-20"` hex-encoded, used for the pre-scan described in
/// §4.7/§9: cheaper than decoding JSON for every nulldata output.
pub const BRC20_MARKER_HEX: &str = "6272632d3230";

/// Observability snapshot: how far behind the RPC-reported tip the indexer is.
#[derive(Debug, Clone, Copy)]
pub struct SyncStatus {
    pub current_height: u64,
    pub target_height: u64,
    pub blocks_behind: u64,
    pub is_caught_up: bool,
}

pub struct Indexer<'a> {
    rpc: &'a RpcClient,
    repo: &'a dyn Repository,
    utxo: &'a dyn AddressResolver,
    settings: &'a Settings,
    network: Network,
    current_height: std::sync::atomic::AtomicU64,
}

/// One transaction's classification against the pre-scan + marketplace priority
/// queue (§4.7 step 3-4): `candidate_index` preserves original block order so the
/// result list handed back to callers reflects it, not processing order.
enum QueueClass {
    Marketplace,
    Other,
}

struct QueuedTx<'b> {
    candidate_index: usize,
    tx: &'b Transaction,
    class: QueueClass,
}

impl<'a> Indexer<'a> {
    pub fn new(rpc: &'a RpcClient, repo: &'a dyn Repository, utxo: &'a dyn AddressResolver, settings: &'a Settings, network: Network) -> Self {
        Indexer {
            rpc,
            repo,
            utxo,
            settings,
            network,
            current_height: std::sync::atomic::AtomicU64::new(settings.start_block_height),
        }
    }

    pub fn sync_status_blocking(&self, target_height: u64) -> SyncStatus {
        let current = self.current_height.load(std::sync::atomic::Ordering::SeqCst);
        let blocks_behind = target_height.saturating_sub(current);
        SyncStatus {
            current_height: current,
            target_height,
            blocks_behind,
            is_caught_up: blocks_behind == 0,
        }
    }

    /// Processes blocks `[start_height, start_height + max_blocks)`, or until the
    /// RPC-reported chain tip is reached if `max_blocks` is `None`.
    pub async fn start_indexing(&self, start_height: u64, max_blocks: Option<u64>) -> Result<(), IndexerError> {
        let mut height = start_height;
        let chain_tip = self.rpc.get_block_count().await?;
        let end_height = match max_blocks {
            Some(n) => (start_height + n).min(chain_tip + 1),
            None => chain_tip + 1,
        };

        while height < end_height {
            height = self.process_one_height(height).await?;
            height += 1;
        }
        Ok(())
    }

    /// Follows the chain tip indefinitely, tolerating up to
    /// `max_consecutive_rpc_failures` transient RPC errors before surfacing fatally.
    pub async fn start_continuous_indexing(&self, start_height: u64, max_blocks: Option<u64>) -> Result<(), IndexerError> {
        const MAX_CONSECUTIVE_RPC_FAILURES: u32 = 10;
        let mut height = start_height;
        let mut processed = 0u64;
        let mut consecutive_failures = 0u32;

        loop {
            if let Some(limit) = max_blocks {
                if processed >= limit {
                    return Ok(());
                }
            }

            let tip = match self.rpc.get_block_count().await {
                Ok(tip) => {
                    consecutive_failures = 0;
                    tip
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!("rpc failure fetching chain tip ({consecutive_failures}/{MAX_CONSECUTIVE_RPC_FAILURES}): {e}");
                    if consecutive_failures >= MAX_CONSECUTIVE_RPC_FAILURES {
                        return Err(IndexerError::Fatal(format!(
                            "exceeded max_consecutive_rpc_failures ({MAX_CONSECUTIVE_RPC_FAILURES}): {e}"
                        )));
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(self.settings.retry_delay_secs)).await;
                    continue;
                }
            };

            if height > tip {
                tokio::time::sleep(std::time::Duration::from_secs(self.settings.retry_delay_secs)).await;
                continue;
            }

            match self.process_one_height(height).await {
                Ok(resume_height) => {
                    height = resume_height + 1;
                    processed += 1;
                    consecutive_failures = 0;
                }
                Err(IndexerError::Fatal(msg)) => return Err(IndexerError::Fatal(msg)),
                Err(e) => {
                    consecutive_failures += 1;
                    error!("error processing height {height} ({consecutive_failures}/{MAX_CONSECUTIVE_RPC_FAILURES}): {e}");
                    if consecutive_failures >= MAX_CONSECUTIVE_RPC_FAILURES {
                        return Err(IndexerError::Fatal(format!(
                            "exceeded max_consecutive_rpc_failures at height {height}: {e}"
                        )));
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(self.settings.retry_delay_secs)).await;
                }
            }
        }
    }

    /// Runs the block loop body for one requested height, returning the height
    /// actually settled (equal to the request unless a reorg rewound it).
    async fn process_one_height(&self, requested_height: u64) -> Result<u64, IndexerError> {
        let mut height = requested_height;

        if height > self.settings.start_block_height {
            let reorg = ReorgHandler::new(self.repo, self.rpc, self.settings.start_block_height, self.settings.max_reorg_depth);
            if height > 0 && reorg.detect_reorg(height.saturating_sub(1)).await {
                let resume = reorg.handle_reorg(height.saturating_sub(1)).await?;
                info!("reorg handled, resuming at height {resume}");
                height = resume;
            }
        }

        let block_hash = self.rpc.get_block_hash(height).await?;
        let block = self.rpc.get_block(block_hash).await?;

        if let Some(existing) = self.repo.get_processed_block(height).await? {
            if existing.block_hash == block_hash.to_string() {
                info!("height {height} already processed with matching hash, skipping");
                self.current_height.store(height, std::sync::atomic::Ordering::SeqCst);
                return Ok(height);
            }
            warn!("height {height} persisted with a different hash than the current chain, reprocessing as a late reorg");
        }

        self.process_block(&block, height, block_hash.to_string()).await?;
        self.current_height.store(height, std::sync::atomic::Ordering::SeqCst);
        Ok(height)
    }

    /// Pre-scans, prioritizes, and processes every transaction in `block`, then
    /// flushes `intermediate_state` and commits the `ProcessedBlock` row.
    async fn process_block(&self, block: &Block, height: u64, block_hash: String) -> Result<Vec<Brc20Operation>, IndexerError> {
        let block_timestamp = Utc
            .timestamp_opt(block.header.time as i64, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let ctx = BlockContext {
            height,
            block_hash: block_hash.clone(),
            timestamp: block_timestamp,
        };

        let processor = Processor::new(self.utxo, self.repo, self.network, self.settings.mint_op_return_position_block_height);

        // Step 3: pre-scan, skipping the coinbase transaction.
        let mut candidate_indices = Vec::new();
        for (i, tx) in block.txdata.iter().enumerate() {
            if i == 0 {
                continue;
            }
            if is_brc20_candidate(tx) {
                candidate_indices.push(i);
            }
        }

        // Step 4: classify transfers among candidates, build a priority queue that
        // puts valid marketplace transfers first while preserving original order
        // within each class.
        let mut queue: Vec<QueuedTx> = Vec::with_capacity(candidate_indices.len());
        for &idx in &candidate_indices {
            let tx = &block.txdata[idx];
            let is_single_transfer = matches!(
                crate::parser::parse_transaction(tx),
                crate::parser::ParseOutcome::Ok(parsed) if parsed.payload.op == "transfer"
            );
            let is_multi_transfer = crate::parser::is_multi_transfer_candidate(tx).is_some();

            let class = if is_single_transfer || is_multi_transfer {
                match processor.classify_transfer(tx, height).await {
                    TransferType::Marketplace => QueueClass::Marketplace,
                    _ => QueueClass::Other,
                }
            } else {
                QueueClass::Other
            };
            queue.push(QueuedTx {
                candidate_index: idx,
                tx,
                class,
            });
        }
        queue.sort_by_key(|q| match q.class {
            QueueClass::Marketplace => (0, q.candidate_index),
            QueueClass::Other => (1, q.candidate_index),
        });

        // Step 5: process each candidate, accumulating into one intermediate state.
        let mut intermediate = IntermediateState::new();
        let mut results_by_index: std::collections::HashMap<usize, Vec<Brc20Operation>> = std::collections::HashMap::new();
        for queued in &queue {
            let ops = processor
                .process_transaction(queued.tx, &ctx, queued.candidate_index as u32, &mut intermediate)
                .await;
            results_by_index.insert(queued.candidate_index, ops);
        }

        // Step 6: flush balances, persist operation rows, upsert ProcessedBlock.
        self.flush_pending_balances(&intermediate).await?;

        let mut found = 0u32;
        let mut valid = 0u32;
        for ops in results_by_index.values() {
            for op in ops {
                found += 1;
                if op.is_valid {
                    valid += 1;
                }
                self.repo.insert_operation(op).await?;
            }
        }

        let processed_block = ProcessedBlock {
            height,
            block_hash,
            tx_count: block.txdata.len() as u32,
            brc20_operations_found: found,
            brc20_operations_valid: valid,
            timestamp: block_timestamp,
            processed_at: Utc::now(),
        };
        self.repo.upsert_processed_block(&processed_block).await?;

        for deploy in intermediate.deploys.values() {
            // A fresh ticker is inserted once; an existing one is updated so that
            // `remaining_supply` (and therefore `get_total_minted`) reflects every
            // mint processed in this block, not just the deploy's original values.
            if self.repo.get_deploy(&deploy.ticker).await?.is_none() {
                self.repo.insert_deploy(deploy).await?;
            } else {
                self.repo.update_deploy(deploy).await?;
            }
        }

        info!(
            "processed block {height} ({block_hash_display}): {found} brc20 ops found, {valid} valid",
            block_hash_display = processed_block.block_hash,
        );

        // Step: output ordering must reflect original transaction order.
        let mut ordered = Vec::with_capacity(candidate_indices.len());
        for idx in candidate_indices {
            if let Some(ops) = results_by_index.remove(&idx) {
                ordered.extend(ops);
            }
        }
        Ok(ordered)
    }

    /// §4.6.3: writes every pending delta in `intermediate_state.balances` to the
    /// persistent store. A write failure here is fatal — it would otherwise leave
    /// the operation log and the balance table silently inconsistent.
    async fn flush_pending_balances(&self, intermediate: &IntermediateState) -> Result<(), IndexerError> {
        for ((address, ticker), amount) in &intermediate.balances {
            self.repo
                .upsert_balance(address, ticker, *amount)
                .await
                .map_err(|e| IndexerError::Fatal(format!("balance flush failed for {address}/{ticker}: {e}")))?;
        }
        Ok(())
    }
}

/// Cheap pre-scan filter (§4.7 step 3 / §9): looks for the hex substring of
/// `"p":"brc-20"` in any nulldata output before paying for a full JSON parse.
pub fn is_brc20_candidate(tx: &Transaction) -> bool {
    for output in &tx.output {
        let spk = output.script_pubkey.as_bytes();
        if !script::is_op_return(spk) {
            continue;
        }
        let hex_encoded = hex::encode(spk);
        if hex_encoded.contains(BRC20_MARKER_HEX) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::ScriptBuf;
    use bitcoin::TxOut;

    fn op_return_output(json: &str) -> TxOut {
        let mut script = vec![0x6a];
        let bytes = json.as_bytes();
        script.push(bytes.len() as u8);
        script.extend_from_slice(bytes);
        TxOut {
            value: 0,
            script_pubkey: ScriptBuf::from_bytes(script),
        }
    }

    fn tx_with_outputs(outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: outputs,
        }
    }

    #[test]
    fn pre_scan_flags_brc20_marker() {
        let tx = tx_with_outputs(vec![op_return_output(
            r#"{"p":"brc-20","op":"mint","tick":"OPQT","amt":"500"}"#,
        )]);
        assert!(is_brc20_candidate(&tx));
    }

    #[test]
    fn pre_scan_skips_unrelated_nulldata() {
        let tx = tx_with_outputs(vec![op_return_output(r#"{"foo":"bar"}"#)]);
        assert!(!is_brc20_candidate(&tx));
    }
}
