use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    /// SHA-256 hex of the operator API key (mint one with `cargo run --bin genkey`).
    pub api_key_hash: String,
    /// Scope key for the per-operator settings store.
    pub operator_id: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let api_key_hash = env::var("API_KEY_HASH")?;
        let operator_id = env::var("OPERATOR_ID").unwrap_or_else(|_| "default".to_string());

        Ok(Self {
            database_url,
            bind_addr,
            api_key_hash,
            operator_id,
        })
    }
}
