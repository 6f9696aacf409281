use crate::domain::Address;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub ledger_rpc_url: String,
    pub contract_address: Address,
    /// Node-managed account that signs settlement transactions.
    pub settlement_sender: Address,
    pub ledger_decimals: u32,
    pub start_block: u64,
    pub poll_interval: Duration,
    pub log_block_range: u64,
    pub read_timeout: Duration,
    pub settlement_timeout: Duration,
    pub sweep_interval: Duration,
    pub settlement_max_attempts: u32,
    /// Run-now trigger is disabled when unset.
    pub indexer_secret: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_or(&env_map, "PORT", 8080u16, "must be a valid u16")?;

        let database_path = required(&env_map, "DATABASE_PATH")?;
        let ledger_rpc_url = required(&env_map, "LEDGER_RPC_URL")?;
        let contract_address = required_address(&env_map, "LEDGER_CONTRACT_ADDRESS")?;
        let settlement_sender = required_address(&env_map, "SETTLEMENT_SENDER")?;

        let ledger_decimals = parse_or(&env_map, "LEDGER_DECIMALS", 18u32, "must be a valid u32")?;
        if ledger_decimals > 28 {
            return Err(ConfigError::InvalidValue(
                "LEDGER_DECIMALS".to_string(),
                "must be at most 28".to_string(),
            ));
        }

        let start_block = parse_or(&env_map, "START_BLOCK", 0u64, "must be a valid u64")?;
        let poll_interval = millis_or(&env_map, "POLL_INTERVAL_MS", 2000)?;
        let log_block_range = parse_or(&env_map, "LOG_BLOCK_RANGE", 2000u64, "must be a valid u64")?;
        if log_block_range == 0 {
            return Err(ConfigError::InvalidValue(
                "LOG_BLOCK_RANGE".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        let read_timeout = millis_or(&env_map, "READ_TIMEOUT_MS", 10_000)?;
        let settlement_timeout = millis_or(&env_map, "SETTLEMENT_TIMEOUT_MS", 60_000)?;
        let sweep_interval = millis_or(&env_map, "SWEEP_INTERVAL_MS", 30_000)?;
        let settlement_max_attempts =
            parse_or(&env_map, "SETTLEMENT_MAX_ATTEMPTS", 5u32, "must be a valid u32")?;

        let indexer_secret = env_map
            .get("INDEXER_SECRET")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Config {
            port,
            database_path,
            ledger_rpc_url,
            contract_address,
            settlement_sender,
            ledger_decimals,
            start_block,
            poll_interval,
            log_block_range,
            read_timeout,
            settlement_timeout,
            sweep_interval,
            settlement_max_attempts,
            indexer_secret,
        })
    }
}

fn required(env_map: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    env_map
        .get(key)
        .cloned()
        .ok_or_else(|| ConfigError::MissingEnv(key.to_string()))
}

fn required_address(env_map: &HashMap<String, String>, key: &str) -> Result<Address, ConfigError> {
    let raw = required(env_map, key)?;
    Address::from_str(&raw).map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))
}

fn parse_or<T: FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
    message: &str,
) -> Result<T, ConfigError> {
    match env_map.get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), message.to_string())),
        None => Ok(default),
    }
}

fn millis_or(
    env_map: &HashMap<String, String>,
    key: &str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    parse_or(env_map, key, default_ms, "must be a valid number of milliseconds")
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_required_env() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DATABASE_PATH".to_string(), "/tmp/test.db".to_string());
        map.insert(
            "LEDGER_RPC_URL".to_string(),
            "http://127.0.0.1:8545".to_string(),
        );
        map.insert(
            "LEDGER_CONTRACT_ADDRESS".to_string(),
            "0x00000000000000000000000000000000000000C0".to_string(),
        );
        map.insert(
            "SETTLEMENT_SENDER".to_string(),
            "0x00000000000000000000000000000000000000a5".to_string(),
        );
        map
    }

    #[test]
    fn test_missing_required_vars() {
        for key in [
            "DATABASE_PATH",
            "LEDGER_RPC_URL",
            "LEDGER_CONTRACT_ADDRESS",
            "SETTLEMENT_SENDER",
        ] {
            let mut env_map = setup_required_env();
            env_map.remove(key);
            match Config::from_env_map(env_map) {
                Err(ConfigError::MissingEnv(s)) => assert_eq!(s, key),
                other => panic!("Expected MissingEnv for {}, got {:?}", key, other),
            }
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_env_map(setup_required_env()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.ledger_decimals, 18);
        assert_eq!(config.start_block, 0);
        assert_eq!(config.poll_interval, Duration::from_millis(2000));
        assert_eq!(config.log_block_range, 2000);
        assert_eq!(config.read_timeout, Duration::from_secs(10));
        assert_eq!(config.settlement_timeout, Duration::from_secs(60));
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.settlement_max_attempts, 5);
        assert_eq!(config.indexer_secret, None);
        assert_eq!(
            config.contract_address.as_str(),
            "0x00000000000000000000000000000000000000c0"
        );
    }

    #[test]
    fn test_invalid_port() {
        let mut env_map = setup_required_env();
        env_map.insert("PORT".to_string(), "not_a_number".to_string());
        match Config::from_env_map(env_map) {
            Err(ConfigError::InvalidValue(key, _)) => assert_eq!(key, "PORT"),
            other => panic!("Expected InvalidValue error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_contract_address() {
        let mut env_map = setup_required_env();
        env_map.insert("LEDGER_CONTRACT_ADDRESS".to_string(), "0x1234".to_string());
        assert!(matches!(
            Config::from_env_map(env_map),
            Err(ConfigError::InvalidValue(key, _)) if key == "LEDGER_CONTRACT_ADDRESS"
        ));
    }

    #[test]
    fn test_decimals_upper_bound() {
        let mut env_map = setup_required_env();
        env_map.insert("LEDGER_DECIMALS".to_string(), "30".to_string());
        assert!(matches!(
            Config::from_env_map(env_map),
            Err(ConfigError::InvalidValue(key, _)) if key == "LEDGER_DECIMALS"
        ));
    }

    #[test]
    fn test_blank_secret_disables_trigger() {
        let mut env_map = setup_required_env();
        env_map.insert("INDEXER_SECRET".to_string(), "  ".to_string());
        assert_eq!(Config::from_env_map(env_map).unwrap().indexer_secret, None);

        let mut env_map = setup_required_env();
        env_map.insert("INDEXER_SECRET".to_string(), "s3cret".to_string());
        assert_eq!(
            Config::from_env_map(env_map).unwrap().indexer_secret.as_deref(),
            Some("s3cret")
        );
    }

    #[test]
    fn test_custom_timeouts() {
        let mut env_map = setup_required_env();
        env_map.insert("SETTLEMENT_TIMEOUT_MS".to_string(), "1500".to_string());
        env_map.insert("POLL_INTERVAL_MS".to_string(), "250".to_string());
        let config = Config::from_env_map(env_map).unwrap();
        assert_eq!(config.settlement_timeout, Duration::from_millis(1500));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
    }
}
