//! Bitcoin RPC client wrapper: connection lifecycle, health check and classified
//! retry/backoff, so callers never have to reason about "Request-sent" style
//! connection errors directly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bitcoin::{Block, BlockHash};
use bitcoincore_rpc::{Auth, Client, RpcApi};
use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::error::IndexerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Healthy,
    Degraded,
    Failed,
}

const CONNECTION_ERROR_INDICATORS: &[&str] = &[
    "request-sent",
    "connection refused",
    "connection reset",
    "connection aborted",
    "timeout",
    "socket error",
    "cannotsendrequest",
    "connection closed",
];

fn is_connection_error(err: &bitcoincore_rpc::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    CONNECTION_ERROR_INDICATORS.iter().any(|ind| msg.contains(ind))
}

/// Owns the underlying blocking `bitcoincore_rpc::Client`, plus health/retry state.
/// RPC calls block a worker thread via `spawn_blocking`; the client itself is not
/// `Clone`, so it is shared behind an `Arc<Mutex<_>>` and rebuilt on forced reconnect.
pub struct RpcClient {
    inner: Mutex<Arc<Client>>,
    url: String,
    user: String,
    password: String,
    state: Mutex<ConnectionState>,
    consecutive_failures: AtomicU32,
    max_consecutive_failures: u32,
    last_health_check: Mutex<Option<Instant>>,
    health_check_interval: Duration,
}

impl RpcClient {
    pub fn new(url: &str, user: &str, password: &str) -> Result<Self, IndexerError> {
        if password == "your_rpc_password_here" {
            return Err(IndexerError::Config(
                "RPC_PASSWORD is set to a placeholder value".to_string(),
            ));
        }
        let client = Client::new(url, Auth::UserPass(user.to_string(), password.to_string()))?;
        info!("bitcoin rpc client initialized, url={url}");
        Ok(RpcClient {
            inner: Mutex::new(Arc::new(client)),
            url: url.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            state: Mutex::new(ConnectionState::Healthy),
            consecutive_failures: AtomicU32::new(0),
            max_consecutive_failures: 5,
            last_health_check: Mutex::new(None),
            health_check_interval: Duration::from_secs(30),
        })
    }

    async fn force_reconnect(&self) -> Result<(), IndexerError> {
        let client = Client::new(
            &self.url,
            Auth::UserPass(self.user.clone(), self.password.clone()),
        )?;
        *self.inner.lock().await = Arc::new(client);
        warn!("forced rpc reconnection");
        Ok(())
    }

    async fn client(&self) -> Arc<Client> {
        self.inner.lock().await.clone()
    }

    /// Runs a blocking RPC call with exponential backoff + jitter (base 1s, max 60s),
    /// forcing a reconnect whenever the failure looks connection-related.
    async fn call_with_retry<T, F>(&self, op_name: &str, f: F) -> Result<T, IndexerError>
    where
        T: Send + 'static,
        F: Fn(Arc<Client>) -> Result<T, bitcoincore_rpc::Error> + Send + Sync + 'static,
    {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Some(Duration::from_secs(300)),
            ..Default::default()
        };

        loop {
            let client = self.client().await;
            let result =
                tokio::task::spawn_blocking(move || f(client))
                    .await
                    .map_err(|e| IndexerError::Connection(format!("rpc task panicked: {e}")))?;

            match result {
                Ok(value) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    *self.state.lock().await = ConnectionState::Healthy;
                    return Ok(value);
                }
                Err(err) => {
                    if is_connection_error(&err) {
                        warn!("rpc connection error on {op_name}, forcing reconnect: {err}");
                        self.force_reconnect().await?;
                        *self.state.lock().await = ConnectionState::Degraded;
                    }
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures >= self.max_consecutive_failures {
                        *self.state.lock().await = ConnectionState::Failed;
                    }
                    match backoff.next_backoff() {
                        Some(delay) => {
                            debug!("{op_name} failed, retrying in {delay:?}: {err}");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            error!("{op_name} failed after all retries: {err}");
                            return Err(IndexerError::Rpc(err));
                        }
                    }
                }
            }
        }
    }

    pub async fn get_block_count(&self) -> Result<u64, IndexerError> {
        self.call_with_retry("getblockcount", |c| c.get_block_count()).await
    }

    pub async fn get_best_block_hash(&self) -> Result<BlockHash, IndexerError> {
        self.call_with_retry("getbestblockhash", |c| c.get_best_block_hash()).await
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<BlockHash, IndexerError> {
        self.call_with_retry("getblockhash", move |c| c.get_block_hash(height)).await
    }

    pub async fn get_block(&self, hash: BlockHash) -> Result<Block, IndexerError> {
        self.call_with_retry("getblock", move |c| c.get_block(&hash)).await
    }

    pub async fn get_raw_transaction_info(
        &self,
        txid: bitcoin::Txid,
    ) -> Result<bitcoincore_rpc::bitcoincore_rpc_json::GetRawTransactionResult, IndexerError> {
        self.call_with_retry("getrawtransaction", move |c| {
            c.get_raw_transaction_info(&txid, None)
        })
        .await
    }

    /// Pings the node and updates connection state. Cheap to call repeatedly;
    /// actually hits the wire at most once per `health_check_interval`.
    pub async fn health_check(&self) -> bool {
        let now = Instant::now();
        {
            let mut last = self.last_health_check.lock().await;
            if let Some(prev) = *last {
                if now.duration_since(prev) < self.health_check_interval {
                    return *self.state.lock().await == ConnectionState::Healthy;
                }
            }
            *last = Some(now);
        }

        match self.get_block_count().await {
            Ok(_) => {
                *self.state.lock().await = ConnectionState::Healthy;
                true
            }
            Err(e) => {
                warn!("rpc health check failed: {e}");
                false
            }
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    pub async fn reset_connection(&self) -> anyhow::Result<()> {
        self.force_reconnect().await.context("forced reconnect during reset")?;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.state.lock().await = ConnectionState::Healthy;
        *self.last_health_check.lock().await = None;
        if !self.health_check().await {
            anyhow::bail!("rpc connection test failed after reset");
        }
        Ok(())
    }
}
