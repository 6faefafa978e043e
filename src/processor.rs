//! Orchestrates parse -> classify -> validate -> apply per transaction, and is the
//! sole mutator of `IntermediateState` (§4.6).

use std::collections::HashSet;

use bitcoin::{Network, Transaction};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{BrcErrorCode, ValidationResult};
use crate::model::{Brc20Operation, Brc20Payload, IntermediateState, OperationType};
use crate::parser::{self, ParseOutcome, ParsedOperation};
use crate::repository::Repository;
use crate::script;
use crate::utxo::AddressResolver;
use crate::validator;

pub const EARLY_MARKETPLACE_TEMPLATE_HEIGHT: u64 = 901_350;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Simple,
    Marketplace,
    InvalidMarketplace,
}

#[derive(Debug, Clone)]
pub struct BlockContext {
    pub height: u64,
    pub block_hash: String,
    pub timestamp: DateTime<Utc>,
}

pub struct Processor<'a> {
    pub utxo: &'a dyn AddressResolver,
    pub repo: &'a dyn Repository,
    pub network: Network,
    pub mint_position_gate_height: u64,
}

impl<'a> Processor<'a> {
    pub fn new(
        utxo: &'a dyn AddressResolver,
        repo: &'a dyn Repository,
        network: Network,
        mint_position_gate_height: u64,
    ) -> Self {
        Processor {
            utxo,
            repo,
            network,
            mint_position_gate_height,
        }
    }

    /// §4.6.2: classifies a candidate transfer by its inputs' sighash usage and
    /// the height-gated marketplace template. Only called for `op == "transfer"`.
    pub async fn classify_transfer(&self, tx: &Transaction, block_height: u64) -> TransferType {
        let mut sighash_83 = Vec::with_capacity(tx.input.len());
        for input in &tx.input {
            let witness: Vec<Vec<u8>> = input.witness.to_vec();
            let asm = input.script_sig.to_asm_string();
            let is_83 = script::extract_signature_from_input(&witness, &asm)
                .map(|sig| script::is_sighash_single_anyonecanpay(&sig))
                .unwrap_or(false);
            sighash_83.push(is_83);
        }

        if !sighash_83.iter().any(|b| *b) {
            return TransferType::Simple;
        }

        let mut addresses = Vec::with_capacity(tx.input.len());
        for input in &tx.input {
            let addr = self
                .utxo
                .get_input_address(input.previous_output.txid, input.previous_output.vout)
                .await;
            addresses.push(addr);
        }
        let distinct: HashSet<&String> = addresses.iter().flatten().collect();
        let n = tx.input.len();

        let template_ok = if block_height >= EARLY_MARKETPLACE_TEMPLATE_HEIGHT {
            n >= 3
                && sighash_83.first() == Some(&true)
                && sighash_83.get(1) == Some(&true)
                && addresses.first().and_then(|a| a.as_ref()).is_some()
                && addresses.get(0) == addresses.get(1)
                && distinct.len() >= 3
        } else {
            n >= 3 && distinct.len() >= 3
        };

        if template_ok {
            TransferType::Marketplace
        } else {
            TransferType::InvalidMarketplace
        }
    }

    async fn resolve_sender(&self, tx: &Transaction) -> Option<String> {
        let first_input = tx.input.first()?;
        if first_input.previous_output.is_null() {
            return None; // coinbase
        }
        self.utxo
            .get_input_address(first_input.previous_output.txid, first_input.previous_output.vout)
            .await
    }

    /// First standard (non-OP_RETURN, recognized) output strictly after `after_vout`.
    fn first_standard_output_after(&self, tx: &Transaction, after_vout: u32) -> Option<(u32, String)> {
        for (i, output) in tx.output.iter().enumerate() {
            if (i as u32) <= after_vout {
                continue;
            }
            let spk = output.script_pubkey.as_bytes();
            if script::is_standard_output(spk) {
                if let Some(addr) = script::extract_address_from_script(spk, self.network) {
                    return Some((i as u32, addr));
                }
            }
        }
        None
    }

    fn output_address(&self, tx: &Transaction, vout: u32) -> Option<String> {
        let output = tx.output.get(vout as usize)?;
        let spk = output.script_pubkey.as_bytes();
        if !script::is_standard_output(spk) {
            return None;
        }
        script::extract_address_from_script(spk, self.network)
    }

    fn build_operation(
        &self,
        tx: &Transaction,
        ctx: &BlockContext,
        tx_index: u32,
        vout_index: u32,
        operation: OperationType,
        ticker: Option<String>,
        amount: Option<Decimal>,
        from_address: Option<String>,
        to_address: Option<String>,
        is_valid: bool,
        error: Option<ValidationResult>,
        raw_hex: String,
        parsed_json: Option<&Brc20Payload>,
        is_marketplace: bool,
        is_multi_transfer: bool,
        multi_transfer_step: Option<u32>,
    ) -> Brc20Operation {
        Brc20Operation {
            txid: tx.txid().to_string(),
            vout_index,
            operation,
            ticker,
            amount,
            from_address,
            to_address,
            block_height: ctx.height,
            block_hash: ctx.block_hash.clone(),
            tx_index,
            timestamp: ctx.timestamp,
            is_valid,
            error_code: error.as_ref().and_then(|e| e.error_code),
            error_message: error.and_then(|e| e.error_message),
            raw_op_return: raw_hex,
            parsed_json: parsed_json.and_then(|p| serde_json::to_string(p).ok()),
            is_marketplace,
            is_multi_transfer,
            multi_transfer_step,
        }
    }

    /// §4.6.3: applies a signed delta to `intermediate_state.balances`. A negative
    /// delta that would drive the balance below zero is refused without mutating.
    pub fn update_balance(
        intermediate: &mut IntermediateState,
        address: &str,
        ticker: &str,
        delta: Decimal,
        store_balance: Decimal,
    ) -> bool {
        let key = (address.to_string(), ticker.to_uppercase());
        let current = intermediate.balances.get(&key).copied().unwrap_or(store_balance);
        let updated = current + delta;
        if updated < Decimal::ZERO {
            return false;
        }
        intermediate.balances.insert(key, updated);
        intermediate
            .pending_balance_updates
            .push((address.to_string(), ticker.to_uppercase(), updated));
        true
    }

    pub async fn process_transaction(
        &self,
        tx: &Transaction,
        ctx: &BlockContext,
        tx_index: u32,
        intermediate: &mut IntermediateState,
    ) -> Vec<Brc20Operation> {
        if let Some(steps) = parser::is_multi_transfer_candidate(tx) {
            return self.process_multi_transfer(tx, steps, ctx, tx_index, intermediate).await;
        }

        let (vout_index, raw_hex, payload, parse_failure) = match parser::parse_transaction(tx) {
            ParseOutcome::NotBrc20 => return vec![],
            ParseOutcome::Invalid { vout_index, raw_hex, result } => (vout_index, raw_hex, None, Some(result)),
            ParseOutcome::Ok(ParsedOperation { payload, vout_index, raw_hex }) => {
                (vout_index, raw_hex, Some(payload), None)
            }
        };

        let sender = if payload.as_ref().map(|p| p.op.as_str()) == Some("mint") {
            None
        } else {
            self.resolve_sender(tx).await
        };

        if let Some(failure) = parse_failure {
            return vec![self.build_operation(
                tx, ctx, tx_index, vout_index, OperationType::Invalid, None, None, sender, None,
                false, Some(failure), raw_hex, None, false, false, None,
            )];
        }

        let payload = payload.expect("payload present when no parse failure");

        let transfer_type = if payload.op == "transfer" {
            Some(self.classify_transfer(tx, ctx.height).await)
        } else {
            None
        };

        if transfer_type == Some(TransferType::InvalidMarketplace) {
            let failure = ValidationResult::reject(
                BrcErrorCode::InvalidMarketplaceTransaction,
                "sighash 0x83 present but marketplace template failed",
            );
            return vec![self.build_operation(
                tx, ctx, tx_index, vout_index, OperationType::Invalid, Some(payload.tick.clone()),
                None, sender, None, false, Some(failure), raw_hex, Some(&payload), false, false, None,
            )];
        }

        let is_marketplace = transfer_type == Some(TransferType::Marketplace);

        if !is_marketplace {
            if let Err(failure) =
                parser::check_position_rule(&payload.op, vout_index, ctx.height, self.mint_position_gate_height)
            {
                return vec![self.build_operation(
                    tx, ctx, tx_index, vout_index, OperationType::Invalid, Some(payload.tick.clone()),
                    None, sender, None, false, Some(failure), raw_hex, Some(&payload), is_marketplace, false, None,
                )];
            }
        }

        match payload.op.as_str() {
            "deploy" => vec![self.process_deploy(tx, ctx, tx_index, vout_index, &payload, sender, raw_hex, intermediate).await],
            "mint" => vec![self.process_mint(tx, ctx, tx_index, vout_index, &payload, raw_hex, intermediate).await],
            "transfer" => vec![self
                .process_transfer(tx, ctx, tx_index, vout_index, &payload, sender, raw_hex, is_marketplace, intermediate)
                .await],
            _ => unreachable!("parser only admits deploy/mint/transfer"),
        }
    }

    async fn process_deploy(
        &self,
        tx: &Transaction,
        ctx: &BlockContext,
        tx_index: u32,
        vout_index: u32,
        payload: &Brc20Payload,
        sender: Option<String>,
        raw_hex: String,
        intermediate: &mut IntermediateState,
    ) -> Brc20Operation {
        let deployer = sender.or_else(|| self.first_standard_output_after(tx, vout_index).map(|(_, a)| a));

        let deployer = match deployer {
            Some(addr) => addr,
            None => {
                let failure = ValidationResult::reject(BrcErrorCode::NoStandardOutput, "no deployer address resolvable");
                return self.build_operation(
                    tx, ctx, tx_index, vout_index, OperationType::Invalid, Some(payload.tick.clone()),
                    None, None, None, false, Some(failure), raw_hex, Some(payload), false, false, None,
                );
            }
        };

        match validator::validate_deploy(payload, intermediate, self.repo).await {
            Ok(check) => {
                let deploy = crate::model::Deploy {
                    ticker: payload.tick.clone(),
                    max_supply: check.max_supply,
                    limit_per_op: check.limit_per_op,
                    deploy_txid: tx.txid().to_string(),
                    deploy_height: ctx.height,
                    deploy_timestamp: ctx.timestamp,
                    deployer_address: deployer.clone(),
                    remaining_supply: check.max_supply,
                };
                intermediate.deploys.insert(payload.tick.clone(), deploy);

                self.build_operation(
                    tx, ctx, tx_index, vout_index, OperationType::Deploy, Some(payload.tick.clone()),
                    Some(check.max_supply), Some(deployer), None, true, None, raw_hex, Some(payload), false, false, None,
                )
            }
            Err(failure) => self.build_operation(
                tx, ctx, tx_index, vout_index, OperationType::Invalid, Some(payload.tick.clone()),
                None, Some(deployer), None, false, Some(failure), raw_hex, Some(payload), false, false, None,
            ),
        }
    }

    async fn process_mint(
        &self,
        tx: &Transaction,
        ctx: &BlockContext,
        tx_index: u32,
        vout_index: u32,
        payload: &Brc20Payload,
        raw_hex: String,
        intermediate: &mut IntermediateState,
    ) -> Brc20Operation {
        let recipient = self.first_standard_output_after(tx, vout_index);

        let stored_deploy = match self.repo.get_deploy(&payload.tick).await {
            Ok(d) => d,
            Err(e) => {
                let failure = ValidationResult::reject(BrcErrorCode::TickerNotDeployed, e.to_string());
                return self.build_operation(
                    tx, ctx, tx_index, vout_index, OperationType::Invalid, Some(payload.tick.clone()),
                    None, None, None, false, Some(failure), raw_hex, Some(payload), false, false, None,
                );
            }
        };

        let deploy = match validator::require_deploy(payload, intermediate, stored_deploy.as_ref()) {
            Ok(d) => d.clone(),
            Err(failure) => {
                return self.build_operation(
                    tx, ctx, tx_index, vout_index, OperationType::Invalid, Some(payload.tick.clone()),
                    None, None, None, false, Some(failure), raw_hex, Some(payload), false, false, None,
                )
            }
        };

        let store_total_minted = match self.repo.get_total_minted(&payload.tick).await {
            Ok(v) => v,
            Err(_) => Decimal::ZERO,
        };
        let current_total = intermediate.get_total_minted(&payload.tick, store_total_minted);

        let check = match validator::validate_mint(payload, &deploy, current_total) {
            Ok(c) => c,
            Err(failure) => {
                return self.build_operation(
                    tx, ctx, tx_index, vout_index, OperationType::Invalid, Some(payload.tick.clone()),
                    None, None, recipient.map(|(_, a)| a), false, Some(failure), raw_hex, Some(payload), false, false, None,
                )
            }
        };

        let (recipient_vout, recipient_addr) = match recipient {
            Some(r) => r,
            None => {
                let failure = ValidationResult::reject(BrcErrorCode::NoValidReceiver, "no standard output after OP_RETURN");
                return self.build_operation(
                    tx, ctx, tx_index, vout_index, OperationType::Invalid, Some(payload.tick.clone()),
                    None, None, None, false, Some(failure), raw_hex, Some(payload), false, false, None,
                );
            }
        };
        let _ = recipient_vout;

        let store_balance = self.repo.get_balance(&recipient_addr, &payload.tick).await.unwrap_or(Decimal::ZERO);
        Self::update_balance(intermediate, &recipient_addr, &payload.tick, check.amount, store_balance);

        let new_total = current_total + check.amount;
        intermediate.total_minted.insert(payload.tick.to_uppercase(), new_total);
        let remaining = deploy.max_supply - new_total;
        intermediate
            .deploys
            .entry(payload.tick.to_uppercase())
            .and_modify(|d| d.remaining_supply = remaining)
            .or_insert_with(|| {
                let mut d = deploy.clone();
                d.remaining_supply = remaining;
                d
            });

        self.build_operation(
            tx, ctx, tx_index, vout_index, OperationType::Mint, Some(payload.tick.clone()),
            Some(check.amount), None, Some(recipient_addr), true, None, raw_hex, Some(payload), false, false, None,
        )
    }

    async fn process_transfer(
        &self,
        tx: &Transaction,
        ctx: &BlockContext,
        tx_index: u32,
        vout_index: u32,
        payload: &Brc20Payload,
        sender: Option<String>,
        raw_hex: String,
        is_marketplace: bool,
        intermediate: &mut IntermediateState,
    ) -> Brc20Operation {
        let sender = match sender {
            Some(s) => s,
            None => {
                let failure = ValidationResult::reject(BrcErrorCode::NoValidReceiver, "no sender address resolvable");
                return self.build_operation(
                    tx, ctx, tx_index, vout_index, OperationType::Invalid, Some(payload.tick.clone()),
                    None, None, None, false, Some(failure), raw_hex, Some(payload), is_marketplace, false, None,
                );
            }
        };

        let recipient = self.first_standard_output_after(tx, vout_index);
        let recipient_addr = match &recipient {
            Some((_, a)) => Some(a.clone()),
            None => None,
        };

        let stored_deploy = self.repo.get_deploy(&payload.tick).await.ok().flatten();
        let deploy = match validator::require_deploy(payload, intermediate, stored_deploy.as_ref()) {
            Ok(d) => d.clone(),
            Err(failure) => {
                return self.build_operation(
                    tx, ctx, tx_index, vout_index, OperationType::Invalid, Some(payload.tick.clone()),
                    None, Some(sender), recipient_addr, false, Some(failure), raw_hex, Some(payload), is_marketplace, false, None,
                )
            }
        };

        let recipient_addr = match recipient_addr {
            Some(a) => a,
            None => {
                let failure = ValidationResult::reject(BrcErrorCode::NoValidReceiver, "no recipient output after OP_RETURN");
                return self.build_operation(
                    tx, ctx, tx_index, vout_index, OperationType::Invalid, Some(payload.tick.clone()),
                    None, Some(sender), None, false, Some(failure), raw_hex, Some(payload), is_marketplace, false, None,
                );
            }
        };

        let store_sender_balance = self.repo.get_balance(&sender, &payload.tick).await.unwrap_or(Decimal::ZERO);
        let current_sender_balance = intermediate.get_balance(&sender, &payload.tick, store_sender_balance);

        let check = match validator::validate_transfer(payload, &deploy, current_sender_balance) {
            Ok(c) => c,
            Err(failure) => {
                return self.build_operation(
                    tx, ctx, tx_index, vout_index, OperationType::Invalid, Some(payload.tick.clone()),
                    None, Some(sender), Some(recipient_addr), false, Some(failure), raw_hex, Some(payload), is_marketplace, false, None,
                )
            }
        };

        if !Self::update_balance(intermediate, &sender, &payload.tick, -check.amount, store_sender_balance) {
            let failure = ValidationResult::reject(BrcErrorCode::InsufficientBalance, "balance mutation refused");
            return self.build_operation(
                tx, ctx, tx_index, vout_index, OperationType::Invalid, Some(payload.tick.clone()),
                None, Some(sender), Some(recipient_addr), false, Some(failure), raw_hex, Some(payload), is_marketplace, false, None,
            );
        }
        let store_recipient_balance = self.repo.get_balance(&recipient_addr, &payload.tick).await.unwrap_or(Decimal::ZERO);
        Self::update_balance(intermediate, &recipient_addr, &payload.tick, check.amount, store_recipient_balance);

        self.build_operation(
            tx, ctx, tx_index, vout_index, OperationType::Transfer, Some(payload.tick.clone()),
            Some(check.amount), Some(sender), Some(recipient_addr), true, None, raw_hex, Some(payload), is_marketplace, false, None,
        )
    }

    /// §4.6.1: validates structural pairing and the single-ticker invariant, then
    /// simulates steps sequentially against a working copy of balances. Stops at
    /// the first `INSUFFICIENT_BALANCE`; other per-step failures don't halt the
    /// batch. Commits only if at least one step succeeded.
    async fn process_multi_transfer(
        &self,
        tx: &Transaction,
        steps: Vec<ParsedOperation>,
        ctx: &BlockContext,
        tx_index: u32,
        intermediate: &mut IntermediateState,
    ) -> Vec<Brc20Operation> {
        for (i, step) in steps.iter().enumerate() {
            let expected_vout = (2 * i) as u32;
            if step.vout_index != expected_vout || self.output_address(tx, expected_vout + 1).is_none() {
                let failure = ValidationResult::reject(
                    BrcErrorCode::InvalidOutputPosition,
                    format!("multi-transfer step {i} has malformed OP_RETURN/recipient pairing"),
                );
                return vec![self.build_operation(
                    tx, ctx, tx_index, step.vout_index, OperationType::Invalid, Some(step.payload.tick.clone()),
                    None, None, None, false, Some(failure), step.raw_hex.clone(), Some(&step.payload), false, true, Some(i as u32),
                )];
            }
        }

        let ticker = steps[0].payload.tick.clone();
        if steps.iter().any(|s| s.payload.tick != ticker) {
            let failure = ValidationResult::reject(BrcErrorCode::MultiTransferMixedTickers, "multi-transfer steps must share one ticker");
            return vec![self.build_operation(
                tx, ctx, tx_index, steps[0].vout_index, OperationType::Invalid, None,
                None, None, None, false, Some(failure), steps[0].raw_hex.clone(), None, false, true, Some(0),
            )];
        }

        let sender = self.resolve_sender(tx).await;
        let stored_deploy = self.repo.get_deploy(&ticker).await.ok().flatten();

        let sender = match sender {
            Some(s) => s,
            None => {
                let failure = ValidationResult::reject(BrcErrorCode::NoValidReceiver, "no sender address resolvable");
                return vec![self.build_operation(
                    tx, ctx, tx_index, steps[0].vout_index, OperationType::Invalid, Some(ticker),
                    None, None, None, false, Some(failure), steps[0].raw_hex.clone(), None, false, true, Some(0),
                )];
            }
        };

        let deploy = match validator::require_deploy(&steps[0].payload, intermediate, stored_deploy.as_ref()) {
            Ok(d) => d.clone(),
            Err(failure) => {
                return vec![self.build_operation(
                    tx, ctx, tx_index, steps[0].vout_index, OperationType::Invalid, Some(ticker),
                    None, Some(sender), None, false, Some(failure), steps[0].raw_hex.clone(), None, false, true, Some(0),
                )]
            }
        };

        let store_balance = self.repo.get_balance(&sender, &ticker).await.unwrap_or(Decimal::ZERO);
        let mut working_balance = intermediate.get_balance(&sender, &ticker, store_balance);

        struct StepOutcome {
            index: usize,
            vout_index: u32,
            recipient: Option<String>,
            amount: Option<Decimal>,
            raw_hex: String,
            payload: Brc20Payload,
            result: ValidationResult,
        }
        let mut outcomes = Vec::with_capacity(steps.len());
        let mut any_valid = false;

        for (i, step) in steps.iter().enumerate() {
            let recipient_addr = self.output_address(tx, 2 * i as u32 + 1);
            let recipient_addr = match recipient_addr {
                Some(a) => a,
                None => {
                    outcomes.push(StepOutcome {
                        index: i,
                        vout_index: step.vout_index,
                        recipient: None,
                        amount: None,
                        raw_hex: step.raw_hex.clone(),
                        payload: step.payload.clone(),
                        result: ValidationResult::reject(BrcErrorCode::NoReceiverOutput, "recipient output not a standard address"),
                    });
                    continue;
                }
            };

            let amount = match validator::validate_transfer(&step.payload, &deploy, working_balance) {
                Ok(c) => c.amount,
                Err(failure) => {
                    let is_insufficient = failure.error_code == Some(BrcErrorCode::InsufficientBalance);
                    outcomes.push(StepOutcome {
                        index: i,
                        vout_index: step.vout_index,
                        recipient: Some(recipient_addr),
                        amount: None,
                        raw_hex: step.raw_hex.clone(),
                        payload: step.payload.clone(),
                        result: failure,
                    });
                    if is_insufficient {
                        break;
                    }
                    continue;
                }
            };

            working_balance -= amount;
            any_valid = true;
            outcomes.push(StepOutcome {
                index: i,
                vout_index: step.vout_index,
                recipient: Some(recipient_addr),
                amount: Some(amount),
                raw_hex: step.raw_hex.clone(),
                payload: step.payload.clone(),
                result: ValidationResult::ok(),
            });
        }

        if any_valid {
            Self::update_balance(intermediate, &sender, &ticker, working_balance - store_balance, store_balance);
            for outcome in &outcomes {
                if let (Some(recipient), Some(amount)) = (&outcome.recipient, outcome.amount) {
                    let store_recipient_balance = self.repo.get_balance(recipient, &ticker).await.unwrap_or(Decimal::ZERO);
                    Self::update_balance(intermediate, recipient, &ticker, amount, store_recipient_balance);
                }
            }
        }

        outcomes
            .into_iter()
            .map(|o| {
                self.build_operation(
                    tx,
                    ctx,
                    tx_index,
                    o.vout_index,
                    if o.result.is_valid { OperationType::Transfer } else { OperationType::Invalid },
                    Some(ticker.clone()),
                    o.amount,
                    Some(sender.clone()),
                    o.recipient,
                    o.result.is_valid,
                    if o.result.is_valid { None } else { Some(o.result) },
                    o.raw_hex,
                    Some(&o.payload),
                    false,
                    true,
                    Some(o.index as u32),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    use bitcoin::absolute::LockTime;
    use bitcoin::{OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};

    use crate::model::{Deploy, IntermediateState};
    use crate::repository::InMemoryRepository;
    use crate::utxo::FixtureResolver;

    const OPQT_DEPLOY_HEIGHT: u64 = 895_534;

    fn dummy_txid() -> Txid {
        Txid::from_str(&"11".repeat(32)).unwrap()
    }

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

    fn p2wpkh_output(tag: u8) -> TxOut {
        let mut script = vec![0x00, 0x14];
        script.extend_from_slice(&[tag; 20]);
        TxOut {
            value: 1000,
            script_pubkey: ScriptBuf::from_bytes(script),
        }
    }

    fn input_at(vout: u32, witness_last_byte: Option<u8>) -> TxIn {
        let witness = match witness_last_byte {
            Some(b) => {
                let mut sig = vec![0u8; 70];
                sig[69] = b;
                Witness::from_slice(&[sig.as_slice()])
            }
            None => Witness::new(),
        };
        TxIn {
            previous_output: OutPoint {
                txid: dummy_txid(),
                vout,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness,
        }
    }

    fn tx(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: outputs,
        }
    }

    fn block_ctx(height: u64) -> BlockContext {
        BlockContext {
            height,
            block_hash: format!("hash-{height}"),
            timestamp: Utc::now(),
        }
    }

    fn opqt_deploy() -> Deploy {
        Deploy {
            ticker: "OPQT".into(),
            max_supply: Decimal::from_str("21000000").unwrap(),
            limit_per_op: Some(Decimal::from_str("1000").unwrap()),
            deploy_txid: "deploy-tx".into(),
            deploy_height: OPQT_DEPLOY_HEIGHT,
            deploy_timestamp: Utc::now(),
            deployer_address: "deployer-addr".into(),
            remaining_supply: Decimal::from_str("21000000").unwrap(),
        }
    }

    // Scenario seed 1 (§8): first valid deploy creates the ticker.
    #[tokio::test]
    async fn deploy_creates_ticker_from_first_valid_deploy() {
        let repo = InMemoryRepository::new();
        let resolver = FixtureResolver::new().with(dummy_txid(), 0, "deployer-addr");
        let processor = Processor::new(&resolver, &repo, Network::Bitcoin, 984_444);
        let mut intermediate = IntermediateState::new();

        let txn = tx(
            vec![input_at(0, None)],
            vec![op_return_output(r#"{"p":"brc-20","op":"deploy","tick":"OPQT","m":"21000000","l":"1000"}"#)],
        );

        let ops = processor
            .process_transaction(&txn, &block_ctx(OPQT_DEPLOY_HEIGHT), 0, &mut intermediate)
            .await;

        assert_eq!(ops.len(), 1);
        assert!(ops[0].is_valid);
        assert_eq!(ops[0].ticker.as_deref(), Some("OPQT"));
        assert_eq!(ops[0].from_address.as_deref(), Some("deployer-addr"));
        let deploy = intermediate.get_deploy("OPQT").expect("deploy recorded in-block");
        assert_eq!(deploy.max_supply, Decimal::from_str("21000000").unwrap());
        assert_eq!(deploy.limit_per_op, Some(Decimal::from_str("1000").unwrap()));
    }

    // Scenario seed 2 (§8): mint above the per-op limit is rejected outright.
    #[tokio::test]
    async fn mint_above_limit_is_rejected() {
        let repo = InMemoryRepository::new();
        repo.insert_deploy(&opqt_deploy()).await.unwrap();
        let resolver = FixtureResolver::new();
        let processor = Processor::new(&resolver, &repo, Network::Bitcoin, 984_444);
        let mut intermediate = IntermediateState::new();

        let txn = tx(
            vec![input_at(0, None)],
            vec![
                op_return_output(r#"{"p":"brc-20","op":"mint","tick":"OPQT","amt":"1500"}"#),
                p2wpkh_output(1),
            ],
        );

        let ops = processor
            .process_transaction(&txn, &block_ctx(OPQT_DEPLOY_HEIGHT + 1), 0, &mut intermediate)
            .await;

        assert_eq!(ops.len(), 1);
        assert!(!ops[0].is_valid);
        assert_eq!(ops[0].error_code, Some(BrcErrorCode::ExceedsMintLimit));
        assert!(intermediate.balances.is_empty());
    }

    // Scenario seed 3 (§8): mint/transfer OP_RETURN position is only enforced
    // at/after the configured gate height.
    #[tokio::test]
    async fn mint_position_rule_is_height_gated() {
        let repo = InMemoryRepository::new();
        repo.insert_deploy(&opqt_deploy()).await.unwrap();
        let resolver = FixtureResolver::new();
        let gate = 984_444;
        let processor = Processor::new(&resolver, &repo, Network::Bitcoin, gate);

        let build_tx = || {
            tx(
                vec![input_at(0, None)],
                vec![
                    p2wpkh_output(9),
                    op_return_output(r#"{"p":"brc-20","op":"mint","tick":"OPQT","amt":"500"}"#),
                    p2wpkh_output(8),
                ],
            )
        };

        let mut before = IntermediateState::new();
        let ops_before = processor
            .process_transaction(&build_tx(), &block_ctx(900_000), 0, &mut before)
            .await;
        assert!(ops_before[0].is_valid, "vout-1 OP_RETURN is fine before the gate height");

        let mut after = IntermediateState::new();
        let ops_after = processor
            .process_transaction(&build_tx(), &block_ctx(985_000), 0, &mut after)
            .await;
        assert!(!ops_after[0].is_valid);
        assert_eq!(ops_after[0].error_code, Some(BrcErrorCode::OpReturnNotFirst));
    }

    // Scenario seed 4 (§8): a transfer within balance debits the sender and
    // credits the recipient; mint's `limit_per_op` does not constrain transfers.
    #[tokio::test]
    async fn transfer_moves_balance_and_ignores_mint_limit() {
        let repo = InMemoryRepository::new();
        let mut deploy = opqt_deploy();
        deploy.ticker = "TEST".into();
        repo.insert_deploy(&deploy).await.unwrap();
        repo.upsert_balance("B", "TEST", Decimal::from_str("5000").unwrap())
            .await
            .unwrap();

        let resolver = FixtureResolver::new().with(dummy_txid(), 0, "B");
        let processor = Processor::new(&resolver, &repo, Network::Bitcoin, 984_444);
        let mut intermediate = IntermediateState::new();

        let txn = tx(
            vec![input_at(0, None)],
            vec![
                op_return_output(r#"{"p":"brc-20","op":"transfer","tick":"TEST","amt":"3000"}"#),
                p2wpkh_output(7),
            ],
        );

        let ops = processor
            .process_transaction(&txn, &block_ctx(900_000), 0, &mut intermediate)
            .await;

        assert_eq!(ops.len(), 1);
        assert!(ops[0].is_valid);
        let recipient = ops[0].to_address.clone().expect("recipient resolved");
        assert_eq!(
            intermediate.balances.get(&("B".to_string(), "TEST".to_string())),
            Some(&Decimal::from_str("2000").unwrap())
        );
        assert_eq!(
            intermediate.balances.get(&(recipient, "TEST".to_string())),
            Some(&Decimal::from_str("3000").unwrap())
        );
    }

    // Scenario seed 5 (§8): multi-transfer stops at the first insufficient-balance
    // step; earlier steps remain committed.
    #[tokio::test]
    async fn multi_transfer_stops_at_first_insufficient_balance() {
        let repo = InMemoryRepository::new();
        let mut deploy = opqt_deploy();
        deploy.ticker = "TEST".into();
        repo.insert_deploy(&deploy).await.unwrap();
        repo.upsert_balance("B2", "TEST", Decimal::from_str("350").unwrap())
            .await
            .unwrap();

        let resolver = FixtureResolver::new().with(dummy_txid(), 0, "B2");
        let processor = Processor::new(&resolver, &repo, Network::Bitcoin, 984_444);
        let mut intermediate = IntermediateState::new();

        let txn = tx(
            vec![input_at(0, None)],
            vec![
                op_return_output(r#"{"p":"brc-20","op":"transfer","tick":"TEST","amt":"100"}"#),
                p2wpkh_output(1),
                op_return_output(r#"{"p":"brc-20","op":"transfer","tick":"TEST","amt":"200"}"#),
                p2wpkh_output(2),
                op_return_output(r#"{"p":"brc-20","op":"transfer","tick":"TEST","amt":"999999"}"#),
                p2wpkh_output(3),
            ],
        );

        let ops = processor
            .process_transaction(&txn, &block_ctx(900_000), 0, &mut intermediate)
            .await;

        assert_eq!(ops.len(), 3);
        assert!(ops[0].is_valid && ops[0].multi_transfer_step == Some(0));
        assert!(ops[1].is_valid && ops[1].multi_transfer_step == Some(1));
        assert!(!ops[2].is_valid && ops[2].multi_transfer_step == Some(2));
        assert_eq!(ops[2].error_code, Some(BrcErrorCode::InsufficientBalance));

        assert_eq!(
            intermediate.balances.get(&("B2".to_string(), "TEST".to_string())),
            Some(&Decimal::from_str("50").unwrap())
        );
    }

    // Marketplace template tests (§4.6.2, §8).
    #[tokio::test]
    async fn early_template_accepts_three_distinct_addresses_with_one_sighash_83() {
        let repo = InMemoryRepository::new();
        let resolver = FixtureResolver::new()
            .with(dummy_txid(), 0, "addr-a")
            .with(dummy_txid(), 1, "addr-b")
            .with(dummy_txid(), 2, "addr-c");
        let processor = Processor::new(&resolver, &repo, Network::Bitcoin, 984_444);

        let txn = tx(
            vec![input_at(0, Some(0x83)), input_at(1, None), input_at(2, None)],
            vec![],
        );

        assert_eq!(
            processor.classify_transfer(&txn, 900_000).await,
            TransferType::Marketplace
        );
    }

    #[tokio::test]
    async fn marketplace_with_only_two_distinct_addresses_is_invalid() {
        let repo = InMemoryRepository::new();
        let resolver = FixtureResolver::new()
            .with(dummy_txid(), 0, "addr-a")
            .with(dummy_txid(), 1, "addr-a")
            .with(dummy_txid(), 2, "addr-b");
        let processor = Processor::new(&resolver, &repo, Network::Bitcoin, 984_444);

        let txn = tx(
            vec![input_at(0, Some(0x83)), input_at(1, None), input_at(2, None)],
            vec![],
        );

        assert_eq!(
            processor.classify_transfer(&txn, 900_000).await,
            TransferType::InvalidMarketplace
        );
    }

    #[tokio::test]
    async fn new_template_requires_first_two_inputs_to_share_address_and_sighash() {
        let repo = InMemoryRepository::new();
        let resolver = FixtureResolver::new()
            .with(dummy_txid(), 0, "addr-a")
            .with(dummy_txid(), 1, "addr-a")
            .with(dummy_txid(), 2, "addr-b")
            .with(dummy_txid(), 3, "addr-c");
        let processor = Processor::new(&resolver, &repo, Network::Bitcoin, 984_444);

        let txn = tx(
            vec![
                input_at(0, Some(0x83)),
                input_at(1, Some(0x83)),
                input_at(2, None),
                input_at(3, None),
            ],
            vec![],
        );

        assert_eq!(
            processor.classify_transfer(&txn, EARLY_MARKETPLACE_TEMPLATE_HEIGHT).await,
            TransferType::Marketplace
        );
    }

    #[tokio::test]
    async fn no_sighash_83_input_is_always_simple() {
        let repo = InMemoryRepository::new();
        let resolver = FixtureResolver::new();
        let processor = Processor::new(&resolver, &repo, Network::Bitcoin, 984_444);

        let txn = tx(vec![input_at(0, None), input_at(1, None), input_at(2, None)], vec![]);

        assert_eq!(processor.classify_transfer(&txn, 900_000).await, TransferType::Simple);
    }
}

