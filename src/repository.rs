//! Persistence for deploys, balances, the operation log and processed-block
//! progress. The `Repository` trait is the small set of operations the core
//! pipeline needs; production binds it to MongoDB, tests bind it to an
//! in-memory map.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::{ClientOptions, FindOneOptions, UpdateOptions};
use mongodb::Client;
use rust_decimal::Decimal;

use crate::error::IndexerError;
use crate::model::{Brc20Operation, Deploy, ProcessedBlock};

pub mod collections {
    pub const DEPLOYS: &str = "brc20_deploys";
    pub const BALANCES: &str = "brc20_balances";
    pub const OPERATIONS: &str = "brc20_operations";
    pub const PROCESSED_BLOCKS: &str = "brc20_processed_blocks";
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_deploy(&self, ticker: &str) -> Result<Option<Deploy>, IndexerError>;
    async fn insert_deploy(&self, deploy: &Deploy) -> Result<(), IndexerError>;
    /// Persists a deploy row already known to exist, most importantly its
    /// `remaining_supply` after a mint consumes part of the supply. Without this,
    /// `get_total_minted` (derived as `max_supply - remaining_supply`) would reset
    /// to zero at the start of every block.
    async fn update_deploy(&self, deploy: &Deploy) -> Result<(), IndexerError>;
    async fn get_balance(&self, address: &str, ticker: &str) -> Result<Decimal, IndexerError>;
    async fn upsert_balance(&self, address: &str, ticker: &str, amount: Decimal) -> Result<(), IndexerError>;
    async fn get_total_minted(&self, ticker: &str) -> Result<Decimal, IndexerError>;
    async fn insert_operation(&self, op: &Brc20Operation) -> Result<(), IndexerError>;
    async fn upsert_processed_block(&self, block: &ProcessedBlock) -> Result<(), IndexerError>;
    async fn get_processed_block(&self, height: u64) -> Result<Option<ProcessedBlock>, IndexerError>;
    async fn get_last_processed_height(&self) -> Result<Option<u64>, IndexerError>;
    async fn delete_above(&self, height: u64) -> Result<(), IndexerError>;
    /// Deletes every operation row above `height`, then replays the remaining
    /// log in order to reconstruct every balance from scratch (§9, resolved
    /// in favor of full replay over reversible deltas).
    async fn rollback_and_rebuild(&self, height: u64) -> Result<(), IndexerError>;
}

pub struct MongoRepository {
    client: Client,
    db_name: String,
}

impl MongoRepository {
    pub async fn new(connection_string: &str, db_name: &str) -> Result<Self, IndexerError> {
        let client_options = ClientOptions::parse(connection_string)
            .await
            .map_err(IndexerError::Persistence)?;
        let client = Client::with_options(client_options).map_err(IndexerError::Persistence)?;
        Ok(MongoRepository {
            client,
            db_name: db_name.to_string(),
        })
    }

    fn collection(&self, name: &str) -> mongodb::Collection<Document> {
        self.client.database(&self.db_name).collection(name)
    }

    fn decimal_field(doc: &Document, field: &str) -> Decimal {
        doc.get_str(field)
            .ok()
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO)
    }

    fn datetime_field(doc: &Document, field: &str) -> DateTime<Utc> {
        doc.get_str(field)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
    }

    fn deploy_from_document(doc: &Document) -> Option<Deploy> {
        Some(Deploy {
            ticker: doc.get_str("ticker").ok()?.to_string(),
            max_supply: Self::decimal_field(doc, "max_supply"),
            limit_per_op: doc
                .get_str("limit_per_op")
                .ok()
                .and_then(|s| Decimal::from_str(s).ok()),
            deploy_txid: doc.get_str("deploy_txid").ok()?.to_string(),
            deploy_height: doc.get_i64("deploy_height").ok()? as u64,
            deploy_timestamp: Self::datetime_field(doc, "deploy_timestamp"),
            deployer_address: doc.get_str("deployer_address").ok()?.to_string(),
            remaining_supply: Self::decimal_field(doc, "remaining_supply"),
        })
    }

    fn processed_block_from_document(doc: &Document) -> Option<ProcessedBlock> {
        Some(ProcessedBlock {
            height: doc.get_i64("height").ok()? as u64,
            block_hash: doc.get_str("block_hash").ok()?.to_string(),
            tx_count: doc.get_i64("tx_count").ok()? as u32,
            brc20_operations_found: doc.get_i64("brc20_operations_found").ok()? as u32,
            brc20_operations_valid: doc.get_i64("brc20_operations_valid").ok()? as u32,
            timestamp: Self::datetime_field(doc, "timestamp"),
            processed_at: Self::datetime_field(doc, "processed_at"),
        })
    }
}

#[async_trait]
impl Repository for MongoRepository {
    async fn get_deploy(&self, ticker: &str) -> Result<Option<Deploy>, IndexerError> {
        let filter = doc! { "ticker": ticker.to_uppercase() };
        let found = self
            .collection(collections::DEPLOYS)
            .find_one(filter, None)
            .await
            .map_err(IndexerError::Persistence)?;
        Ok(found.as_ref().and_then(Self::deploy_from_document))
    }

    async fn insert_deploy(&self, deploy: &Deploy) -> Result<(), IndexerError> {
        self.collection(collections::DEPLOYS)
            .insert_one(deploy.to_document(), None)
            .await
            .map_err(IndexerError::Persistence)?;
        Ok(())
    }

    async fn update_deploy(&self, deploy: &Deploy) -> Result<(), IndexerError> {
        let filter = doc! { "ticker": &deploy.ticker };
        let update = doc! { "$set": deploy.to_document() };
        self.collection(collections::DEPLOYS)
            .update_one(filter, update, None)
            .await
            .map_err(IndexerError::Persistence)?;
        Ok(())
    }

    async fn get_balance(&self, address: &str, ticker: &str) -> Result<Decimal, IndexerError> {
        let filter = doc! { "address": address, "ticker": ticker.to_uppercase() };
        let found = self
            .collection(collections::BALANCES)
            .find_one(filter, None)
            .await
            .map_err(IndexerError::Persistence)?;
        Ok(found.as_ref().map(|d| Self::decimal_field(d, "amount")).unwrap_or(Decimal::ZERO))
    }

    async fn upsert_balance(&self, address: &str, ticker: &str, amount: Decimal) -> Result<(), IndexerError> {
        let filter = doc! { "address": address, "ticker": ticker.to_uppercase() };
        let update = doc! {
            "$set": {
                "address": address,
                "ticker": ticker.to_uppercase(),
                "amount": amount.to_string(),
                "updated_at": Utc::now().to_rfc3339(),
            }
        };
        let options = UpdateOptions::builder().upsert(true).build();
        self.collection(collections::BALANCES)
            .update_one(filter, update, options)
            .await
            .map_err(IndexerError::Persistence)?;
        Ok(())
    }

    async fn get_total_minted(&self, ticker: &str) -> Result<Decimal, IndexerError> {
        let deploy = self.get_deploy(ticker).await?;
        Ok(deploy
            .map(|d| d.max_supply - d.remaining_supply)
            .unwrap_or(Decimal::ZERO))
    }

    async fn insert_operation(&self, op: &Brc20Operation) -> Result<(), IndexerError> {
        self.collection(collections::OPERATIONS)
            .insert_one(op.to_document(), None)
            .await
            .map_err(IndexerError::Persistence)?;
        Ok(())
    }

    async fn upsert_processed_block(&self, block: &ProcessedBlock) -> Result<(), IndexerError> {
        let filter = doc! { "height": block.height as i64 };
        let update = doc! { "$set": block.to_document() };
        let options = UpdateOptions::builder().upsert(true).build();
        self.collection(collections::PROCESSED_BLOCKS)
            .update_one(filter, update, options)
            .await
            .map_err(IndexerError::Persistence)?;
        Ok(())
    }

    async fn get_processed_block(&self, height: u64) -> Result<Option<ProcessedBlock>, IndexerError> {
        let filter = doc! { "height": height as i64 };
        let found = self
            .collection(collections::PROCESSED_BLOCKS)
            .find_one(filter, None)
            .await
            .map_err(IndexerError::Persistence)?;
        Ok(found.as_ref().and_then(Self::processed_block_from_document))
    }

    async fn get_last_processed_height(&self) -> Result<Option<u64>, IndexerError> {
        let sort = doc! { "height": -1 };
        let options = FindOneOptions::builder().sort(sort).build();
        let found = self
            .collection(collections::PROCESSED_BLOCKS)
            .find_one(None, options)
            .await
            .map_err(IndexerError::Persistence)?;
        Ok(found.and_then(|d| d.get_i64("height").ok().map(|h| h as u64)))
    }

    async fn delete_above(&self, height: u64) -> Result<(), IndexerError> {
        let gt = doc! { "$gt": height as i64 };
        self.collection(collections::PROCESSED_BLOCKS)
            .delete_many(doc! { "height": gt.clone() }, None)
            .await
            .map_err(IndexerError::Persistence)?;
        self.collection(collections::OPERATIONS)
            .delete_many(doc! { "block_height": gt }, None)
            .await
            .map_err(IndexerError::Persistence)?;
        Ok(())
    }

    async fn rollback_and_rebuild(&self, height: u64) -> Result<(), IndexerError> {
        self.delete_above(height).await?;

        let cursor = self
            .collection(collections::OPERATIONS)
            .find(doc! { "is_valid": true }, None)
            .await
            .map_err(IndexerError::Persistence)?;
        let mut ops: Vec<Document> = cursor.try_collect().await.map_err(IndexerError::Persistence)?;
        ops.sort_by_key(|d| {
            (
                d.get_i64("block_height").unwrap_or(0),
                d.get_i64("tx_index").unwrap_or(0),
                d.get_i64("multi_transfer_step").unwrap_or(-1),
            )
        });

        let mut balances: HashMap<(String, String), Decimal> = HashMap::new();
        for op in &ops {
            let Ok(ticker) = op.get_str("ticker") else { continue };
            let Ok(amount_str) = op.get_str("amount") else { continue };
            let Ok(amount) = Decimal::from_str(amount_str) else { continue };
            let operation = op.get_str("operation").unwrap_or("");

            match operation {
                "mint" => {
                    if let Ok(to) = op.get_str("to_address") {
                        let entry = balances.entry((to.to_string(), ticker.to_string())).or_insert(Decimal::ZERO);
                        *entry += amount;
                    }
                }
                "transfer" => {
                    if let Ok(from) = op.get_str("from_address") {
                        let entry = balances.entry((from.to_string(), ticker.to_string())).or_insert(Decimal::ZERO);
                        *entry -= amount;
                    }
                    if let Ok(to) = op.get_str("to_address") {
                        let entry = balances.entry((to.to_string(), ticker.to_string())).or_insert(Decimal::ZERO);
                        *entry += amount;
                    }
                }
                _ => {}
            }
        }

        self.collection(collections::BALANCES)
            .delete_many(doc! {}, None)
            .await
            .map_err(IndexerError::Persistence)?;
        for ((address, ticker), amount) in balances {
            self.upsert_balance(&address, &ticker, amount).await?;
        }

        Ok(())
    }
}

/// In-memory binding used by unit/integration tests exercising the core pipeline
/// without a running MongoDB instance (§4.12).
#[derive(Default)]
pub struct InMemoryRepository {
    deploys: tokio::sync::Mutex<HashMap<String, Deploy>>,
    balances: tokio::sync::Mutex<HashMap<(String, String), Decimal>>,
    operations: tokio::sync::Mutex<Vec<Brc20Operation>>,
    processed_blocks: tokio::sync::Mutex<HashMap<u64, ProcessedBlock>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn operations(&self) -> Vec<Brc20Operation> {
        self.operations.lock().await.clone()
    }

    pub async fn processed_block_count(&self) -> usize {
        self.processed_blocks.lock().await.len()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_deploy(&self, ticker: &str) -> Result<Option<Deploy>, IndexerError> {
        Ok(self.deploys.lock().await.get(&ticker.to_uppercase()).cloned())
    }

    async fn insert_deploy(&self, deploy: &Deploy) -> Result<(), IndexerError> {
        self.deploys
            .lock()
            .await
            .insert(deploy.ticker.to_uppercase(), deploy.clone());
        Ok(())
    }

    async fn update_deploy(&self, deploy: &Deploy) -> Result<(), IndexerError> {
        self.deploys
            .lock()
            .await
            .insert(deploy.ticker.to_uppercase(), deploy.clone());
        Ok(())
    }

    async fn get_balance(&self, address: &str, ticker: &str) -> Result<Decimal, IndexerError> {
        Ok(self
            .balances
            .lock()
            .await
            .get(&(address.to_string(), ticker.to_uppercase()))
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn upsert_balance(&self, address: &str, ticker: &str, amount: Decimal) -> Result<(), IndexerError> {
        self.balances
            .lock()
            .await
            .insert((address.to_string(), ticker.to_uppercase()), amount);
        Ok(())
    }

    async fn get_total_minted(&self, ticker: &str) -> Result<Decimal, IndexerError> {
        let deploy = self.get_deploy(ticker).await?;
        Ok(deploy
            .map(|d| d.max_supply - d.remaining_supply)
            .unwrap_or(Decimal::ZERO))
    }

    async fn insert_operation(&self, op: &Brc20Operation) -> Result<(), IndexerError> {
        self.operations.lock().await.push(op.clone());
        Ok(())
    }

    async fn upsert_processed_block(&self, block: &ProcessedBlock) -> Result<(), IndexerError> {
        self.processed_blocks.lock().await.insert(block.height, block.clone());
        Ok(())
    }

    async fn get_processed_block(&self, height: u64) -> Result<Option<ProcessedBlock>, IndexerError> {
        Ok(self.processed_blocks.lock().await.get(&height).cloned())
    }

    async fn get_last_processed_height(&self) -> Result<Option<u64>, IndexerError> {
        Ok(self.processed_blocks.lock().await.keys().max().copied())
    }

    async fn delete_above(&self, height: u64) -> Result<(), IndexerError> {
        self.processed_blocks.lock().await.retain(|h, _| *h <= height);
        self.operations.lock().await.retain(|op| op.block_height <= height);
        Ok(())
    }

    async fn rollback_and_rebuild(&self, height: u64) -> Result<(), IndexerError> {
        self.delete_above(height).await?;

        let mut ops = self.operations.lock().await.clone();
        ops.sort_by_key(|op| (op.block_height, op.tx_index, op.multi_transfer_step.unwrap_or(0)));

        let mut rebuilt: HashMap<(String, String), Decimal> = HashMap::new();
        for op in &ops {
            if !op.is_valid {
                continue;
            }
            let Some(ticker) = &op.ticker else { continue };
            let Some(amount) = op.amount else { continue };
            match op.operation {
                crate::model::OperationType::Mint => {
                    if let Some(to) = &op.to_address {
                        *rebuilt.entry((to.clone(), ticker.clone())).or_insert(Decimal::ZERO) += amount;
                    }
                }
                crate::model::OperationType::Transfer => {
                    if let Some(from) = &op.from_address {
                        *rebuilt.entry((from.clone(), ticker.clone())).or_insert(Decimal::ZERO) -= amount;
                    }
                    if let Some(to) = &op.to_address {
                        *rebuilt.entry((to.clone(), ticker.clone())).or_insert(Decimal::ZERO) += amount;
                    }
                }
                _ => {}
            }
        }

        *self.balances.lock().await = rebuilt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn deploy(ticker: &str) -> Deploy {
        Deploy {
            ticker: ticker.to_string(),
            max_supply: Decimal::from_str("21000000").unwrap(),
            limit_per_op: Some(Decimal::from_str("1000").unwrap()),
            deploy_txid: "deadbeef".into(),
            deploy_height: 1,
            deploy_timestamp: Utc::now(),
            deployer_address: "addr-a".into(),
            remaining_supply: Decimal::from_str("21000000").unwrap(),
        }
    }

    #[tokio::test]
    async fn deploy_lookup_is_case_insensitive() {
        let repo = InMemoryRepository::new();
        repo.insert_deploy(&deploy("test")).await.unwrap();
        assert!(repo.get_deploy("TEST").await.unwrap().is_some());
        assert!(repo.get_deploy("test").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rollback_and_rebuild_replays_valid_operations_in_order() {
        let repo = InMemoryRepository::new();
        repo.upsert_balance("addr-a", "TEST", Decimal::from_str("500").unwrap())
            .await
            .unwrap();

        let mk_op = |height: u64, tx_index: u32, op: crate::model::OperationType, from: Option<&str>, to: Option<&str>, amt: &str, valid: bool| {
            Brc20Operation {
                txid: format!("tx-{height}-{tx_index}"),
                vout_index: 0,
                operation: op,
                ticker: Some("TEST".into()),
                amount: Some(Decimal::from_str(amt).unwrap()),
                from_address: from.map(str::to_string),
                to_address: to.map(str::to_string),
                block_height: height,
                block_hash: format!("hash-{height}"),
                tx_index,
                timestamp: Utc::now(),
                is_valid: valid,
                error_code: None,
                error_message: None,
                raw_op_return: String::new(),
                parsed_json: None,
                is_marketplace: false,
                is_multi_transfer: false,
                multi_transfer_step: None,
            }
        };

        repo.insert_operation(&mk_op(1, 0, crate::model::OperationType::Mint, None, Some("addr-a"), "500", true))
            .await
            .unwrap();
        repo.insert_operation(&mk_op(2, 0, crate::model::OperationType::Transfer, Some("addr-a"), Some("addr-b"), "200", true))
            .await
            .unwrap();
        repo.insert_operation(&mk_op(3, 0, crate::model::OperationType::Transfer, Some("addr-a"), Some("addr-b"), "999999", false))
            .await
            .unwrap();

        repo.rollback_and_rebuild(2).await.unwrap();

        assert_eq!(repo.get_last_processed_height().await.unwrap(), None);
        assert_eq!(repo.get_balance("addr-a", "TEST").await.unwrap(), Decimal::from_str("300").unwrap());
        assert_eq!(repo.get_balance("addr-b", "TEST").await.unwrap(), Decimal::from_str("200").unwrap());
    }
}

