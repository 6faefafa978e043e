//! Stateful rule engine. Pure over `(op, sender, IntermediateState, store reads)` —
//! the validator never mutates anything; the processor is the sole state mutator.

use rust_decimal::Decimal;

use crate::amount::parse_amount;
use crate::error::{BrcErrorCode, ValidationResult};
use crate::model::{Brc20Payload, Deploy, IntermediateState};
use crate::repository::Repository;

pub struct DeployCheck {
    pub max_supply: Decimal,
    pub limit_per_op: Option<Decimal>,
}

/// Rejects if the ticker is already deployed (store or in-block); validates
/// `m`/`l` are positive valid amounts. Does not check for a deployer fallback
/// output — that is an address-resolution concern (§4.6.4), not a validity gate.
pub async fn validate_deploy(
    payload: &Brc20Payload,
    intermediate: &IntermediateState,
    repo: &dyn Repository,
) -> Result<DeployCheck, ValidationResult> {
    if intermediate.get_deploy(&payload.tick).is_some() {
        return Err(ValidationResult::reject(
            BrcErrorCode::TickerAlreadyExists,
            format!("ticker {} already deployed in this block", payload.tick),
        ));
    }
    if repo
        .get_deploy(&payload.tick)
        .await
        .map_err(|e| ValidationResult::reject(BrcErrorCode::TickerAlreadyExists, e.to_string()))?
        .is_some()
    {
        return Err(ValidationResult::reject(
            BrcErrorCode::TickerAlreadyExists,
            format!("ticker {} already deployed", payload.tick),
        ));
    }

    let max_supply = parse_amount(payload.max.as_deref().unwrap_or(""))?;
    let limit_per_op = match &payload.lim {
        Some(raw) => Some(parse_amount(raw)?),
        None => None,
    };

    Ok(DeployCheck {
        max_supply,
        limit_per_op,
    })
}

pub struct MintCheck {
    pub amount: Decimal,
}

/// Requires an active deploy; rejects if the mint would push total minted past
/// max supply (outright, never clamped), or past the per-op limit.
pub fn validate_mint(
    payload: &Brc20Payload,
    deploy: &Deploy,
    current_total_minted: Decimal,
) -> Result<MintCheck, ValidationResult> {
    let amount = parse_amount(payload.amt.as_deref().unwrap_or(""))?;

    if let Some(limit) = deploy.limit_per_op {
        if amount > limit {
            return Err(ValidationResult::reject(
                BrcErrorCode::ExceedsMintLimit,
                format!("mint amount {amount} exceeds limit {limit}"),
            ));
        }
    }

    let new_total = current_total_minted + amount;
    if new_total > deploy.max_supply {
        return Err(ValidationResult::reject(
            BrcErrorCode::ExceedsMaxSupply,
            format!("mint would push total minted to {new_total}, max supply is {}", deploy.max_supply),
        ));
    }

    Ok(MintCheck { amount })
}

pub struct TransferCheck {
    pub amount: Decimal,
}

/// Requires an active deploy and a sender balance covering the transfer.
/// `limit_per_op` does not constrain transfers, only mints.
pub fn validate_transfer(
    payload: &Brc20Payload,
    _deploy: &Deploy,
    sender_balance: Decimal,
) -> Result<TransferCheck, ValidationResult> {
    let amount = parse_amount(payload.amt.as_deref().unwrap_or(""))?;

    if sender_balance < amount {
        return Err(ValidationResult::reject(
            BrcErrorCode::InsufficientBalance,
            format!("sender balance {sender_balance} is less than transfer amount {amount}"),
        ));
    }

    Ok(TransferCheck { amount })
}

pub fn require_deploy<'a>(
    payload: &Brc20Payload,
    intermediate: &'a IntermediateState,
    stored: Option<&'a Deploy>,
) -> Result<&'a Deploy, ValidationResult> {
    intermediate
        .get_deploy(&payload.tick)
        .or(stored)
        .ok_or_else(|| {
            ValidationResult::reject(
                BrcErrorCode::TickerNotDeployed,
                format!("ticker {} has not been deployed", payload.tick),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn deploy(max: &str, limit: Option<&str>) -> Deploy {
        Deploy {
            ticker: "TEST".into(),
            max_supply: Decimal::from_str(max).unwrap(),
            limit_per_op: limit.map(|l| Decimal::from_str(l).unwrap()),
            deploy_txid: "deadbeef".into(),
            deploy_height: 1,
            deploy_timestamp: chrono::Utc::now(),
            deployer_address: "addr".into(),
            remaining_supply: Decimal::from_str(max).unwrap(),
        }
    }

    #[test]
    fn mint_rejects_over_limit() {
        let d = deploy("21000000", Some("1000"));
        let payload = Brc20Payload {
            p: "brc-20".into(),
            op: "mint".into(),
            tick: "TEST".into(),
            amt: Some("1500".into()),
            max: None,
            lim: None,
        };
        let result = validate_mint(&payload, &d, Decimal::ZERO);
        assert!(result.is_err());
    }

    #[test]
    fn mint_rejects_outright_when_exceeding_max_supply_without_clamping() {
        let d = deploy("1000", None);
        let payload = Brc20Payload {
            p: "brc-20".into(),
            op: "mint".into(),
            tick: "TEST".into(),
            amt: Some("1500".into()),
            max: None,
            lim: None,
        };
        let result = validate_mint(&payload, &d, Decimal::ZERO);
        assert!(result.is_err());
    }

    #[test]
    fn transfer_requires_sufficient_balance() {
        let d = deploy("21000000", Some("1000"));
        let payload = Brc20Payload {
            p: "brc-20".into(),
            op: "transfer".into(),
            tick: "TEST".into(),
            amt: Some("3000".into()),
            max: None,
            lim: None,
        };
        assert!(validate_transfer(&payload, &d, Decimal::from_str("5000").unwrap()).is_ok());
        assert!(validate_transfer(&payload, &d, Decimal::from_str("1000").unwrap()).is_err());
    }
}
