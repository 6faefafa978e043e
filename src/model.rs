//! Core entities: Deploy, Balance, BRC20Operation, ProcessedBlock, IntermediateState.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use mongodb::bson::{doc, Document};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::amount::format_amount;
use crate::error::BrcErrorCode;

/// Wire payload decoded from an OP_RETURN push. Numeric fields stay strings until
/// the validator parses them into `Decimal`, matching the wire format in full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Brc20Payload {
    pub p: String,
    pub op: String,
    pub tick: String,
    pub amt: Option<String>,
    pub max: Option<String>,
    pub lim: Option<String>,
}

pub trait ToDocument {
    fn to_document(&self) -> Document;
}

impl ToDocument for Brc20Payload {
    fn to_document(&self) -> Document {
        doc! {
            "p": &self.p,
            "op": &self.op,
            "tick": &self.tick,
            "amt": &self.amt,
            "max": &self.max,
            "lim": &self.lim,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Deploy,
    Mint,
    Transfer,
    Invalid,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Deploy => "deploy",
            OperationType::Mint => "mint",
            OperationType::Transfer => "transfer",
            OperationType::Invalid => "invalid",
        }
    }
}

/// Immutable record per ticker, created by the first valid deploy.
#[derive(Debug, Clone)]
pub struct Deploy {
    pub ticker: String,
    pub max_supply: Decimal,
    pub limit_per_op: Option<Decimal>,
    pub deploy_txid: String,
    pub deploy_height: u64,
    pub deploy_timestamp: DateTime<Utc>,
    pub deployer_address: String,
    pub remaining_supply: Decimal,
}

impl Deploy {
    pub fn to_document(&self) -> Document {
        doc! {
            "ticker": &self.ticker,
            "max_supply": self.max_supply.to_string(),
            "limit_per_op": self.limit_per_op.map(|v| v.to_string()),
            "deploy_txid": &self.deploy_txid,
            "deploy_height": self.deploy_height as i64,
            "deploy_timestamp": self.deploy_timestamp.to_rfc3339(),
            "deployer_address": &self.deployer_address,
            "remaining_supply": self.remaining_supply.to_string(),
        }
    }
}

/// One record per detected BRC-20 operation, valid or invalid. Immutable once written.
#[derive(Debug, Clone)]
pub struct Brc20Operation {
    pub txid: String,
    pub vout_index: u32,
    pub operation: OperationType,
    pub ticker: Option<String>,
    pub amount: Option<Decimal>,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub block_height: u64,
    pub block_hash: String,
    pub tx_index: u32,
    pub timestamp: DateTime<Utc>,
    pub is_valid: bool,
    pub error_code: Option<BrcErrorCode>,
    pub error_message: Option<String>,
    pub raw_op_return: String,
    pub parsed_json: Option<String>,
    pub is_marketplace: bool,
    pub is_multi_transfer: bool,
    pub multi_transfer_step: Option<u32>,
}

impl Brc20Operation {
    pub fn to_document(&self) -> Document {
        doc! {
            "txid": &self.txid,
            "vout_index": self.vout_index as i64,
            "operation": self.operation.as_str(),
            "ticker": &self.ticker,
            "amount": self.amount.map(format_amount),
            "from_address": &self.from_address,
            "to_address": &self.to_address,
            "block_height": self.block_height as i64,
            "block_hash": &self.block_hash,
            "tx_index": self.tx_index as i64,
            "timestamp": self.timestamp.to_rfc3339(),
            "is_valid": self.is_valid,
            "error_code": self.error_code.map(|c| c.as_str()),
            "error_message": &self.error_message,
            "raw_op_return": &self.raw_op_return,
            "parsed_json": &self.parsed_json,
            "is_marketplace": self.is_marketplace,
            "is_multi_transfer": self.is_multi_transfer,
            "multi_transfer_step": self.multi_transfer_step.map(|v| v as i64),
        }
    }
}

/// `(height PK, block_hash, ...)`, exactly one row per processed height.
#[derive(Debug, Clone)]
pub struct ProcessedBlock {
    pub height: u64,
    pub block_hash: String,
    pub tx_count: u32,
    pub brc20_operations_found: u32,
    pub brc20_operations_valid: u32,
    pub timestamp: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedBlock {
    pub fn to_document(&self) -> Document {
        doc! {
            "height": self.height as i64,
            "block_hash": &self.block_hash,
            "tx_count": self.tx_count as i64,
            "brc20_operations_found": self.brc20_operations_found as i64,
            "brc20_operations_valid": self.brc20_operations_valid as i64,
            "timestamp": self.timestamp.to_rfc3339(),
            "processed_at": self.processed_at.to_rfc3339(),
        }
    }
}

/// Per-block, in-memory uncommitted deltas. Exclusively owned by one block-processing
/// invocation; discarded on failure, flushed on success.
#[derive(Debug, Default)]
pub struct IntermediateState {
    pub balances: HashMap<(String, String), Decimal>,
    pub total_minted: HashMap<String, Decimal>,
    pub deploys: HashMap<String, Deploy>,
    pub pending_operations: Vec<Brc20Operation>,
    pub pending_balance_updates: Vec<(String, String, Decimal)>,
}

impl IntermediateState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_balance(&self, address: &str, ticker: &str, store_balance: Decimal) -> Decimal {
        self.balances
            .get(&(address.to_string(), ticker.to_uppercase()))
            .copied()
            .unwrap_or(store_balance)
    }

    pub fn get_total_minted(&self, ticker: &str, store_total: Decimal) -> Decimal {
        self.total_minted
            .get(&ticker.to_uppercase())
            .copied()
            .unwrap_or(store_total)
    }

    pub fn get_deploy(&self, ticker: &str) -> Option<&Deploy> {
        self.deploys.get(&ticker.to_uppercase())
    }
}
