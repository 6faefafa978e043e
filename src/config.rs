//! Environment-driven settings, loaded once at startup via `dotenv` + `std::env`.

use std::env;

use crate::error::IndexerError;

fn env_var(key: &str) -> Result<String, IndexerError> {
    env::var(key).map_err(|_| IndexerError::Config(format!("missing required env var {key}")))
}

fn env_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,

    pub mongo_connection_string: String,
    pub mongo_db_name: String,

    pub start_block_height: u64,
    pub batch_size: u32,
    pub max_reorg_depth: u64,
    pub mint_op_return_position_block_height: u64,

    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub stop_on_error: bool,

    pub log_non_brc20_operations: bool,
}

impl Settings {
    /// Loads settings from the process environment. `dotenv().ok()` should be
    /// called by the binary before this, so a `.env` file is merged in first.
    pub fn from_env() -> Result<Self, IndexerError> {
        let settings = Settings {
            rpc_url: env_var("RPC_URL")?,
            rpc_user: env_var("RPC_USER")?,
            rpc_password: env_var("RPC_PASSWORD")?,

            mongo_connection_string: env_var_or("MONGO_DB_HOST", "mongodb://localhost:27017"),
            mongo_db_name: env_var_or("MONGO_DB_NAME", "brc20_indexer"),

            start_block_height: env_parse_or("START_BLOCK_HEIGHT", 895_534),
            batch_size: env_parse_or("BATCH_SIZE", 10),
            max_reorg_depth: env_parse_or("MAX_REORG_DEPTH", 100),
            mint_op_return_position_block_height: env_parse_or(
                "MINT_OP_RETURN_POSITION_BLOCK_HEIGHT",
                984_444,
            ),

            max_retries: env_parse_or("MAX_RETRIES", 3),
            retry_delay_secs: env_parse_or("RETRY_DELAY", 5),
            stop_on_error: env_parse_or("STOP_ON_ERROR", false),

            log_non_brc20_operations: env_parse_or("LOG_NON_BRC20_OPERATIONS", false),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), IndexerError> {
        if self.rpc_url.is_empty() {
            return Err(IndexerError::Config("RPC_URL must not be empty".into()));
        }
        if self.max_reorg_depth == 0 {
            return Err(IndexerError::Config("MAX_REORG_DEPTH must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(IndexerError::Config("BATCH_SIZE must be positive".into()));
        }
        Ok(())
    }
}
