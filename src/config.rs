use anyhow::Context;

/// Server configuration, read from the environment (a `.env` file is honored).
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub database_url: String,
    /// Per-room history cap; oldest messages are evicted first once reached.
    pub history_cap: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let addr = dotenv::var("STAFFROOM_ADDR").unwrap_or("0.0.0.0:8080".to_owned());
        let database_url = dotenv::var("DATABASE_URL").unwrap_or("sqlite::memory:".to_owned());
        let history_cap = match dotenv::var("STAFFROOM_HISTORY_CAP") {
            Ok(cap) => cap
                .parse()
                .with_context(|| format!("bad STAFFROOM_HISTORY_CAP: {cap}"))?,
            Err(_) => 50,
        };

        Ok(Self {
            addr,
            database_url,
            history_cap,
        })
    }
}
