use thiserror::Error;

/// Error codes attached to a logged `BRC20Operation` row. These are data describing
/// a rejected operation, never propagated as a Rust `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrcErrorCode {
    // parse
    InvalidJson,
    MissingProtocol,
    InvalidProtocol,
    MissingOperation,
    InvalidOperation,
    MissingTicker,
    EmptyTicker,
    InvalidAmount,
    MultipleOpReturns,
    OpReturnTooLarge,
    OpReturnNotFirst,
    // business
    TickerNotDeployed,
    TickerAlreadyExists,
    InsufficientBalance,
    ExceedsMaxSupply,
    ExceedsMintLimit,
    NoStandardOutput,
    NoValidReceiver,
    // transfer-type
    InvalidMarketplaceTransaction,
    InvalidSighashType,
    MultiTransferMixedTickers,
    InvalidOutputPosition,
    NoReceiverOutput,
}

impl BrcErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrcErrorCode::InvalidJson => "INVALID_JSON",
            BrcErrorCode::MissingProtocol => "MISSING_PROTOCOL",
            BrcErrorCode::InvalidProtocol => "INVALID_PROTOCOL",
            BrcErrorCode::MissingOperation => "MISSING_OPERATION",
            BrcErrorCode::InvalidOperation => "INVALID_OPERATION",
            BrcErrorCode::MissingTicker => "MISSING_TICKER",
            BrcErrorCode::EmptyTicker => "EMPTY_TICKER",
            BrcErrorCode::InvalidAmount => "INVALID_AMOUNT",
            BrcErrorCode::MultipleOpReturns => "MULTIPLE_OP_RETURNS",
            BrcErrorCode::OpReturnTooLarge => "OP_RETURN_TOO_LARGE",
            BrcErrorCode::OpReturnNotFirst => "OP_RETURN_NOT_FIRST",
            BrcErrorCode::TickerNotDeployed => "TICKER_NOT_DEPLOYED",
            BrcErrorCode::TickerAlreadyExists => "TICKER_ALREADY_EXISTS",
            BrcErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            BrcErrorCode::ExceedsMaxSupply => "EXCEEDS_MAX_SUPPLY",
            BrcErrorCode::ExceedsMintLimit => "EXCEEDS_MINT_LIMIT",
            BrcErrorCode::NoStandardOutput => "NO_STANDARD_OUTPUT",
            BrcErrorCode::NoValidReceiver => "NO_VALID_RECEIVER",
            BrcErrorCode::InvalidMarketplaceTransaction => "INVALID_MARKETPLACE_TRANSACTION",
            BrcErrorCode::InvalidSighashType => "INVALID_SIGHASH_TYPE",
            BrcErrorCode::MultiTransferMixedTickers => "MULTI_TRANSFER_MIXED_TICKERS",
            BrcErrorCode::InvalidOutputPosition => "INVALID_OUTPUT_POSITION",
            BrcErrorCode::NoReceiverOutput => "NO_RECEIVER_OUTPUT",
        }
    }
}

impl std::fmt::Display for BrcErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a validation pass: either the operation is admissible, or it carries
/// the code/message pair that will be written to the operation log.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub error_code: Option<BrcErrorCode>,
    pub error_message: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        ValidationResult {
            is_valid: true,
            error_code: None,
            error_message: None,
        }
    }

    pub fn reject(code: BrcErrorCode, message: impl Into<String>) -> Self {
        ValidationResult {
            is_valid: false,
            error_code: Some(code),
            error_message: Some(message.into()),
        }
    }
}

impl std::ops::Not for &ValidationResult {
    type Output = bool;
    fn not(self) -> bool {
        !self.is_valid
    }
}

/// System-level failures: RPC, persistence, configuration. These propagate as real
/// `Result::Err` values and are handled by retry/halt policy in the indexer loop.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("rpc call failed: {0}")]
    Rpc(#[from] bitcoincore_rpc::Error),

    #[error("rpc connection failed: {0}")]
    Connection(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] mongodb::error::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("data corruption prevented: {0}")]
    Fatal(String),
}
