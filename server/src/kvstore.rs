//! Key/value operations on the backplane.
//!
//! Keys live under `<prefix>:kv:` so clients cannot touch the cache or
//! rate-limit keyspace. Gated by `enable_kvstore`.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::backplane::Backplane;
use crate::config::Config;
use crate::error::Error;

pub struct KvStore {
    conn: ConnectionManager,
    prefix: String,
    enabled: bool,
}

impl KvStore {
    pub fn new(cfg: &Config, backplane: &Backplane) -> Self {
        Self {
            conn: backplane.connection(),
            prefix: backplane.prefix().to_string(),
            enabled: cfg.enable_kvstore,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            format!("kv:{key}")
        } else {
            format!("{}:kv:{key}", self.prefix)
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut con = self.conn.clone();
        Ok(con.get(self.key(key)).await?)
    }

    /// Stores a value; a `ttl` of 0 stores without expiry.
    pub async fn set(&self, key: &str, value: &str, ttl: u64) -> Result<(), Error> {
        let mut con = self.conn.clone();
        if ttl > 0 {
            let _: () = con.set_ex(self.key(key), value, ttl).await?;
        } else {
            let _: () = con.set(self.key(key), value).await?;
        }
        Ok(())
    }

    /// Deletes a key; returns the number of keys removed.
    pub async fn del(&self, key: &str) -> Result<i64, Error> {
        let mut con = self.conn.clone();
        Ok(con.del(self.key(key)).await?)
    }
}
