//! Locates and decodes the BRC-20 payload(s) carried by a transaction's OP_RETURN outputs.

use bitcoin::Transaction;

use crate::error::{BrcErrorCode, ValidationResult};
use crate::model::Brc20Payload;
use crate::script;

pub const MAX_OP_RETURN_PAYLOAD_LEN: usize = 80;
/// Default for `MINT_OP_RETURN_POSITION_BLOCK_HEIGHT`; the indexer threads the
/// env-configured value through `check_position_rule` instead of reading this
/// constant directly, so it is only the fallback used by tests and `Settings`.
pub const DEFAULT_MINT_OP_RETURN_POSITION_BLOCK_HEIGHT: u64 = 984_444;

/// ASCII bytes of `"p":"brc-20"`, used for the cheap pre-scan filter (§4.4, §4.7).
pub const BRC20_MARKER: &[u8] = br#""p":"brc-20""#;

pub struct ParsedOperation {
    pub payload: Brc20Payload,
    pub vout_index: u32,
    pub raw_hex: String,
}

pub enum ParseOutcome {
    /// No BRC-20 OP_RETURN found at all; the caller should silently skip the tx.
    NotBrc20,
    /// A single BRC-20 candidate was found but failed structural validation.
    Invalid {
        vout_index: u32,
        raw_hex: String,
        result: ValidationResult,
    },
    Ok(ParsedOperation),
}

struct Candidate {
    vout_index: u32,
    raw: Vec<u8>,
}

fn collect_candidates(tx: &Transaction) -> Vec<Candidate> {
    let mut out = Vec::new();
    for (i, output) in tx.output.iter().enumerate() {
        let spk = output.script_pubkey.as_bytes();
        if !script::is_op_return(spk) {
            continue;
        }
        let Some(payload) = script::extract_op_return_data(spk) else {
            continue;
        };
        if payload.windows(BRC20_MARKER.len()).any(|w| w == BRC20_MARKER) {
            out.push(Candidate {
                vout_index: i as u32,
                raw: payload,
            });
        }
    }
    out
}

/// Parses a single candidate's bytes into a structurally-checked `Brc20Payload`.
fn parse_candidate(raw: &[u8]) -> Result<Brc20Payload, ValidationResult> {
    if raw.len() > MAX_OP_RETURN_PAYLOAD_LEN {
        return Err(ValidationResult::reject(
            BrcErrorCode::OpReturnTooLarge,
            format!("OP_RETURN payload is {} bytes, max {MAX_OP_RETURN_PAYLOAD_LEN}", raw.len()),
        ));
    }

    let text = String::from_utf8_lossy(raw);
    let json: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| ValidationResult::reject(BrcErrorCode::InvalidJson, e.to_string()))?;

    let p = json.get("p").and_then(|v| v.as_str());
    match p {
        None => return Err(ValidationResult::reject(BrcErrorCode::MissingProtocol, "missing 'p' field")),
        Some("brc-20") => {}
        Some(other) => {
            return Err(ValidationResult::reject(
                BrcErrorCode::InvalidProtocol,
                format!("unsupported protocol '{other}'"),
            ))
        }
    }

    let op = json
        .get("op")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ValidationResult::reject(BrcErrorCode::MissingOperation, "missing 'op' field"))?;
    if !matches!(op, "deploy" | "mint" | "transfer") {
        return Err(ValidationResult::reject(
            BrcErrorCode::InvalidOperation,
            format!("unrecognized op '{op}'"),
        ));
    }

    let tick = json
        .get("tick")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ValidationResult::reject(BrcErrorCode::MissingTicker, "missing 'tick' field"))?;
    if tick.is_empty() {
        return Err(ValidationResult::reject(BrcErrorCode::EmptyTicker, "ticker is empty"));
    }

    let amt = json.get("amt").and_then(|v| v.as_str()).map(str::to_string);
    let max = json.get("m").and_then(|v| v.as_str()).map(str::to_string);
    let lim = json.get("l").and_then(|v| v.as_str()).map(str::to_string);

    match op {
        "deploy" if max.is_none() => {
            return Err(ValidationResult::reject(BrcErrorCode::InvalidAmount, "deploy missing 'm' field"))
        }
        "mint" | "transfer" if amt.is_none() => {
            return Err(ValidationResult::reject(BrcErrorCode::InvalidAmount, format!("{op} missing 'amt' field")))
        }
        _ => {}
    }

    Ok(Brc20Payload {
        p: "brc-20".to_string(),
        op: op.to_string(),
        tick: tick.to_uppercase(),
        amt,
        max,
        lim,
    })
}

/// Enforces the vout-0 position rule for mint/transfer at/after the gate height.
/// Deploys and marketplace transfers are exempt (the latter is checked by the caller).
pub fn check_position_rule(
    op: &str,
    vout_index: u32,
    block_height: u64,
    gate_height: u64,
) -> Result<(), ValidationResult> {
    if op == "deploy" {
        return Ok(());
    }
    if block_height >= gate_height && vout_index != 0 {
        return Err(ValidationResult::reject(
            BrcErrorCode::OpReturnNotFirst,
            format!("{op} OP_RETURN must be at vout 0 at height {block_height}"),
        ));
    }
    Ok(())
}

/// Locates the single BRC-20 OP_RETURN in a non-multi-transfer transaction.
pub fn parse_transaction(tx: &Transaction) -> ParseOutcome {
    let candidates = collect_candidates(tx);
    if candidates.is_empty() {
        return ParseOutcome::NotBrc20;
    }
    if candidates.len() > 1 {
        let raw_hex = hex::encode(&candidates[0].raw);
        return ParseOutcome::Invalid {
            vout_index: candidates[0].vout_index,
            raw_hex,
            result: ValidationResult::reject(
                BrcErrorCode::MultipleOpReturns,
                "multiple BRC-20 OP_RETURN outputs in a non-multi-transfer transaction",
            ),
        };
    }

    let candidate = &candidates[0];
    let raw_hex = hex::encode(&candidate.raw);
    match parse_candidate(&candidate.raw) {
        Ok(payload) => ParseOutcome::Ok(ParsedOperation {
            payload,
            vout_index: candidate.vout_index,
            raw_hex,
        }),
        Err(result) => ParseOutcome::Invalid {
            vout_index: candidate.vout_index,
            raw_hex,
            result,
        },
    }
}

/// A transaction is a multi-transfer batch when it carries 2+ OP_RETURN outputs that
/// each parse as a `transfer` (§4.4). Structural pairing is checked separately by
/// the processor (§4.6.1); this only detects candidacy.
pub fn is_multi_transfer_candidate(tx: &Transaction) -> Option<Vec<ParsedOperation>> {
    let candidates = collect_candidates(tx);
    if candidates.len() < 2 {
        return None;
    }

    let mut steps = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        match parse_candidate(&candidate.raw) {
            Ok(payload) if payload.op == "transfer" => {
                steps.push(ParsedOperation {
                    payload,
                    vout_index: candidate.vout_index,
                    raw_hex: hex::encode(&candidate.raw),
                });
            }
            _ => return None,
        }
    }
    Some(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::{ScriptBuf, TxOut};

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
    fn parses_deploy() {
        let tx = tx_with_outputs(vec![op_return_output(
            r#"{"p":"brc-20","op":"deploy","tick":"OPQT","m":"21000000","l":"1000"}"#,
        )]);
        match parse_transaction(&tx) {
            ParseOutcome::Ok(parsed) => {
                assert_eq!(parsed.payload.op, "deploy");
                assert_eq!(parsed.payload.tick, "OPQT");
            }
            _ => panic!("expected Ok"),
        }
    }

    #[test]
    fn rejects_ticker_zero_as_valid_nonempty() {
        let tx = tx_with_outputs(vec![op_return_output(
            r#"{"p":"brc-20","op":"mint","tick":"0","amt":"5"}"#,
        )]);
        match parse_transaction(&tx) {
            ParseOutcome::Ok(parsed) => assert_eq!(parsed.payload.tick, "0"),
            _ => panic!("expected Ok"),
        }
    }

    #[test]
    fn non_brc20_nulldata_is_silently_skipped() {
        let tx = tx_with_outputs(vec![op_return_output(r#"{"foo":"bar"}"#)]);
        assert!(matches!(parse_transaction(&tx), ParseOutcome::NotBrc20));
    }

    #[test]
    fn detects_multi_transfer_candidate() {
        let tx = tx_with_outputs(vec![
            op_return_output(r#"{"p":"brc-20","op":"transfer","tick":"TEST","amt":"100"}"#),
            TxOut {
                value: 0,
                script_pubkey: ScriptBuf::new(),
            },
            op_return_output(r#"{"p":"brc-20","op":"transfer","tick":"TEST","amt":"200"}"#),
            TxOut {
                value: 0,
                script_pubkey: ScriptBuf::new(),
            },
        ]);
        let steps = is_multi_transfer_candidate(&tx).expect("should detect multi-transfer");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].vout_index, 0);
        assert_eq!(steps[1].vout_index, 2);
    }

    #[test]
    fn position_rule_gates_by_height() {
        let gate = DEFAULT_MINT_OP_RETURN_POSITION_BLOCK_HEIGHT;
        assert!(check_position_rule("mint", 1, 900_000, gate).is_ok());
        assert!(check_position_rule("mint", 1, 985_000, gate).is_err());
        assert!(check_position_rule("deploy", 5, 985_000, gate).is_ok());
    }
}
