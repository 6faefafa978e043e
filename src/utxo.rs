//! Resolves a transaction input to the address controlling the UTXO it spends.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Network, Txid};
use bitcoincore_rpc::bitcoincore_rpc_json::GetRawTransactionResult;
use log::error;
use lru::LruCache;
use tokio::sync::Mutex;

use crate::rpc::RpcClient;
use crate::script;

const DEFAULT_CACHE_SIZE: usize = 1000;

/// The small surface the processor needs from a UTXO lookup service. Exists so
/// `processor.rs`/`indexer.rs` can be driven by a fixture resolver in tests
/// instead of a live `RpcClient`.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn get_input_address(&self, prev_txid: Txid, vout: u32) -> Option<String>;
}

pub struct UtxoResolver {
    rpc: Arc<RpcClient>,
    network: Network,
    cache: Mutex<LruCache<Txid, GetRawTransactionResult>>,
}

impl UtxoResolver {
    pub fn new(rpc: Arc<RpcClient>, network: Network) -> Self {
        UtxoResolver::with_cache_size(rpc, network, DEFAULT_CACHE_SIZE)
    }

    pub fn with_cache_size(rpc: Arc<RpcClient>, network: Network, cache_size: usize) -> Self {
        let size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap());
        UtxoResolver {
            rpc,
            network,
            cache: Mutex::new(LruCache::new(size)),
        }
    }

    /// Returns the address controlling `(prev_txid, vout)`, or `None` on any
    /// failure. Never raises to the caller — a missing previous transaction is
    /// a fact about the chain, not an indexer error.
    pub async fn get_input_address(&self, prev_txid: Txid, vout: u32) -> Option<String> {
        let tx = self.get_transaction(prev_txid).await?;
        let output = tx.vout.get(vout as usize)?;
        let spk = &output.script_pub_key;

        if let Some(address) = spk.address.as_ref() {
            return Some(address.to_string());
        }
        if let Some(first) = spk.addresses.as_ref().and_then(|v| v.first()) {
            return Some(first.to_string());
        }

        script::extract_address_from_script(&spk.hex, self.network)
    }

    async fn get_transaction(&self, txid: Txid) -> Option<GetRawTransactionResult> {
        if let Some(tx) = self.cache.lock().await.get(&txid) {
            return Some(tx.clone());
        }

        match self.rpc.get_raw_transaction_info(txid).await {
            Ok(tx) => {
                self.cache.lock().await.put(txid, tx.clone());
                Some(tx)
            }
            Err(e) => {
                error!("failed to fetch prev tx {txid}: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl AddressResolver for UtxoResolver {
    async fn get_input_address(&self, prev_txid: Txid, vout: u32) -> Option<String> {
        UtxoResolver::get_input_address(self, prev_txid, vout).await
    }
}

/// Fixture resolver keyed by `(txid, vout)`, used by processor/indexer tests that
/// need deterministic sender/recipient addresses without a live RPC backend.
#[cfg(test)]
#[derive(Default)]
pub struct FixtureResolver {
    addresses: std::collections::HashMap<(Txid, u32), String>,
}

#[cfg(test)]
impl FixtureResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, txid: Txid, vout: u32, address: impl Into<String>) -> Self {
        self.addresses.insert((txid, vout), address.into());
        self
    }
}

#[cfg(test)]
#[async_trait]
impl AddressResolver for FixtureResolver {
    async fn get_input_address(&self, prev_txid: Txid, vout: u32) -> Option<String> {
        self.addresses.get(&(prev_txid, vout)).cloned()
    }
}
