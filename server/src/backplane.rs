//! Redis-backed backplane: cross-instance fan-out, the bounded message
//! cache, and the per-subject rate limiter.
//!
//! Key layout (all keys carry the configured prefix):
//!
//! | purpose            | key                                  | type       |
//! |--------------------|--------------------------------------|------------|
//! | fan-out channel    | `<prefix>:<topic>`                   | pub/sub    |
//! | message blobs      | `<prefix>:<topic>:cache`             | hash       |
//! | score index        | `<prefix>:<topic>:scores`            | sorted set |
//! | per-subject window | `<prefix>:limits:<rule>:<subject>`   | int + TTL  |
//! | topics seen        | `<prefix>:pub_count`                 | hash       |
//! | id sequence        | `<prefix>:last_seq:<topic>:<ms>`     | int + TTL  |

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Error;
use crate::topic::is_filter_matched;

/// TTL for the per-millisecond sequence keys. They are only needed while
/// appends share a wall-clock millisecond.
const SEQ_KEY_TTL_SECS: i64 = 10;

/// A message as it travels over the fan-out channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub topic: String,
    #[serde(default)]
    pub id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,
}

/// Cache blob metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheItemMeta {
    pub id: String,
    #[serde(rename = "expireAt")]
    pub expire_at: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,
}

/// One cached message as stored in the blob hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheItem {
    pub topic: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,
    pub meta: CacheItemMeta,
}

fn prefixed(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}:{key}")
    }
}

/// Formats a cache id. Zero-padding keeps lexicographic order equal to
/// `(ms, seq)` order, which replay relies on.
pub fn format_cache_id(ms: i64, seq: i64) -> String {
    format!("{ms:013}-{seq:04}")
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Client for the backplane. Command traffic goes over one multiplexed,
/// auto-reconnecting connection; the subscriber side opens its own
/// connection via [`Backplane::pubsub`].
pub struct Backplane {
    client: Client,
    conn: ConnectionManager,
    prefix: String,
    max_cache_length: u64,
    default_cache_ttl: u64,
}

impl Backplane {
    pub async fn connect(cfg: &Config) -> Result<Self, Error> {
        let client = Client::open(cfg.redis_url())?;
        let conn = ConnectionManager::new(client.clone()).await?;

        Ok(Self {
            client,
            conn,
            prefix: cfg.redis_prefix.clone(),
            max_cache_length: cfg.max_cache_length,
            default_cache_ttl: cfg.default_cache_ttl,
        })
    }

    fn key(&self, key: &str) -> String {
        prefixed(&self.prefix, key)
    }

    fn data_key(&self, topic: &str) -> String {
        self.key(&format!("{topic}:cache"))
    }

    fn score_key(&self, topic: &str) -> String {
        self.key(&format!("{topic}:scores"))
    }

    /// The psubscribe pattern covering every fan-out channel.
    pub fn channel_pattern(&self) -> String {
        self.key("*")
    }

    /// Maps a raw pub/sub channel name back to its topic.
    pub fn topic_from_channel<'a>(&self, channel: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            channel
        } else {
            channel
                .strip_prefix(&self.prefix)
                .and_then(|rest| rest.strip_prefix(':'))
                .unwrap_or(channel)
        }
    }

    /// Opens a fresh subscriber connection. The consume loop calls this
    /// again after any error.
    pub async fn pubsub(&self) -> Result<redis::aio::PubSub, Error> {
        Ok(self.client.get_async_pubsub().await?)
    }

    /// Publishes an event on the topic's fan-out channel.
    pub async fn publish_message(
        &self,
        topic: &str,
        id: &str,
        message: &str,
        origin: &str,
    ) -> Result<(), Error> {
        let event = PublishedEvent {
            topic: topic.to_string(),
            id: id.to_string(),
            message: message.to_string(),
            origin: origin.to_string(),
        };

        let payload = serde_json::to_string(&event)?;
        let mut con = self.conn.clone();
        let _: () = con.publish(self.key(topic), payload).await?;
        Ok(())
    }

    /// Allocates the next cache id for `topic` at time `ms`. Appends within
    /// one millisecond get increasing sequence numbers through an atomic
    /// counter on the backplane.
    async fn next_cache_id(&self, topic: &str, ms: i64) -> Result<String, Error> {
        let seq_key = self.key(&format!("last_seq:{topic}:{ms}"));
        let mut con = self.conn.clone();

        let seq: i64 = con.incr(&seq_key, 1).await?;
        if seq == 1 {
            let _: () = con.expire(&seq_key, SEQ_KEY_TTL_SECS).await?;
        }

        Ok(format_cache_id(ms, seq - 1))
    }

    /// Appends a message to the topic's cache and returns its id.
    ///
    /// `timestamp` of 0 means now; `ttl` of 0 means the configured default.
    /// The sorted-set index is trimmed to `max_cache_length` by dropping the
    /// oldest entries and their blobs.
    pub async fn cache_message(
        &self,
        topic: &str,
        payload: &str,
        origin: &str,
        timestamp: i64,
        ttl: u64,
    ) -> Result<String, Error> {
        let timestamp = if timestamp == 0 { now_ms() } else { timestamp };
        let ttl = if ttl == 0 { self.default_cache_ttl } else { ttl };
        let expire_at = timestamp + (ttl as i64) * 1000;

        let id = self.next_cache_id(topic, timestamp).await?;

        let item = CacheItem {
            topic: topic.to_string(),
            message: payload.to_string(),
            origin: origin.to_string(),
            meta: CacheItemMeta {
                id: id.clone(),
                expire_at,
                origin: origin.to_string(),
            },
        };

        let blob = serde_json::to_string(&item)?;
        let data_key = self.data_key(topic);
        let score_key = self.score_key(topic);
        let mut con = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.hset(&data_key, &id, &blob)
            .ignore()
            .zadd(&score_key, &id, timestamp)
            .ignore()
            .hincr(self.key("pub_count"), topic, 1)
            .ignore();
        let _: () = pipe.query_async(&mut con).await?;

        self.trim_topic(&data_key, &score_key).await?;

        Ok(id)
    }

    /// Drops the lowest-scored entries past `max_cache_length`.
    async fn trim_topic(&self, data_key: &str, score_key: &str) -> Result<(), Error> {
        let mut con = self.conn.clone();
        let count: u64 = con.zcard(score_key).await?;

        if count <= self.max_cache_length {
            return Ok(());
        }

        let overflow = (count - self.max_cache_length) as isize;
        let stale: Vec<String> = con.zrange(score_key, 0, overflow - 1).await?;
        if stale.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.hdel(data_key, &stale)
            .ignore()
            .zremrangebyrank(score_key, 0, overflow - 1)
            .ignore();
        let _: () = pipe.query_async(&mut con).await?;

        Ok(())
    }

    /// Topics we have seen publishes on that match `pattern`.
    async fn topics_seen(&self, pattern: &str) -> Result<Vec<String>, Error> {
        let mut con = self.conn.clone();
        let all: Vec<String> = con.hkeys(self.key("pub_count")).await?;

        Ok(all
            .into_iter()
            .filter(|t| is_filter_matched(pattern, t))
            .collect())
    }

    /// Replays cached messages with append time >= `since_ms`, merged in
    /// ascending score order across every matching topic and truncated to
    /// `limit`.
    pub async fn get_cache_since(
        &self,
        topic_pattern: &str,
        since_ms: i64,
        limit: u64,
        is_pattern: bool,
    ) -> Result<Vec<CacheItem>, Error> {
        let topics = if is_pattern {
            self.topics_seen(topic_pattern).await?
        } else {
            vec![topic_pattern.to_string()]
        };

        let mut scored: Vec<(i64, CacheItem)> = Vec::new();
        for topic in &topics {
            self.collect_topic_items(topic, since_ms.to_string(), limit, &mut scored)
                .await?;
        }

        scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.meta.id.cmp(&b.1.meta.id)));
        scored.truncate(limit as usize);

        Ok(scored.into_iter().map(|(_, item)| item).collect())
    }

    /// Replays cached messages newer than `since_id`. An unknown id behaves
    /// like a replay from the beginning of time.
    pub async fn get_cache_since_id(
        &self,
        topic_pattern: &str,
        since_id: &str,
        limit: u64,
        is_pattern: bool,
    ) -> Result<Vec<CacheItem>, Error> {
        let topics = if is_pattern {
            self.topics_seen(topic_pattern).await?
        } else {
            vec![topic_pattern.to_string()]
        };

        let mut scored: Vec<(i64, CacheItem)> = Vec::new();
        let mut con = self.conn.clone();

        for topic in &topics {
            let score: Option<f64> = con.zscore(self.score_key(topic), since_id).await?;
            let min = match score {
                Some(s) => format!("({s}"),
                None => "0".to_string(),
            };
            self.collect_topic_items(topic, min, limit, &mut scored)
                .await?;
        }

        scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.meta.id.cmp(&b.1.meta.id)));
        scored.truncate(limit as usize);

        Ok(scored.into_iter().map(|(_, item)| item).collect())
    }

    async fn collect_topic_items(
        &self,
        topic: &str,
        min_score: String,
        limit: u64,
        out: &mut Vec<(i64, CacheItem)>,
    ) -> Result<(), Error> {
        let score_key = self.score_key(topic);
        let data_key = self.data_key(topic);
        let mut con = self.conn.clone();

        let ids: Vec<(String, f64)> = con
            .zrangebyscore_limit_withscores(&score_key, min_score, "+inf", 0, limit as isize)
            .await?;

        if ids.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for (id, _) in &ids {
            pipe.hget(&data_key, id);
        }
        let blobs: Vec<Option<String>> = pipe.query_async(&mut con).await?;

        for ((id, score), blob) in ids.into_iter().zip(blobs) {
            let Some(blob) = blob else { continue };
            match serde_json::from_str::<CacheItem>(&blob) {
                Ok(item) => out.push((score as i64, item)),
                Err(e) => warn!(topic, id = %id, error = %e, "undecodable cache blob"),
            }
        }

        Ok(())
    }

    /// Removes cached messages whose `expireAt` has passed. Returns the
    /// number of purged items.
    pub async fn purge_expired_cache_items(&self) -> Result<u64, Error> {
        let mut con = self.conn.clone();
        let topics: Vec<String> = con.hkeys(self.key("pub_count")).await?;
        let now = now_ms();
        let mut purged = 0u64;

        for topic in topics {
            let score_key = self.score_key(topic.as_str());
            let data_key = self.data_key(topic.as_str());

            // Skip topics whose oldest entry is still within the default
            // retention window.
            let oldest: Vec<(String, f64)> = con.zrange_withscores(&score_key, 0, 0).await?;
            match oldest.first() {
                Some((_, score)) if now - (*score as i64) >= (self.default_cache_ttl as i64) * 1000 => {}
                _ => continue,
            }

            let entries: Vec<(String, String)> = con.hgetall(&data_key).await?;
            let mut stale: Vec<String> = Vec::new();

            for (id, blob) in entries {
                match serde_json::from_str::<CacheItem>(&blob) {
                    Ok(item) if item.meta.expire_at != 0 && item.meta.expire_at < now => {
                        stale.push(id);
                    }
                    Ok(_) => {}
                    Err(_) => stale.push(id),
                }
            }

            if stale.is_empty() {
                continue;
            }

            let mut pipe = redis::pipe();
            pipe.hdel(&data_key, &stale)
                .ignore()
                .zrem(&score_key, &stale)
                .ignore();
            let _: () = pipe.query_async(&mut con).await?;

            purged += stale.len() as u64;
            debug!(topic = %topic, purged = stale.len(), "purged expired cache items");
        }

        Ok(purged)
    }

    /// Counts a publish against the subject's window for `rule_topic` and
    /// reports whether the limit is now exceeded. The window key expires
    /// `interval_ms` after its first increment (fixed window with reset);
    /// the tripping increment persists, so callers stay limited until the
    /// window lapses.
    pub async fn hit_rate_limit(
        &self,
        rule_topic: &str,
        subject: &str,
        interval_ms: u64,
        max: u64,
    ) -> Result<bool, Error> {
        let key = self.key(&format!("limits:{rule_topic}:{subject}"));
        let mut con = self.conn.clone();

        let count: u64 = con.incr(&key, 1).await?;
        if count == 1 {
            let ttl = ((interval_ms / 1000).max(1)) as i64;
            let _: () = con.expire(&key, ttl).await?;
        }

        Ok(count > max)
    }

    /// A clone of the command connection, for collaborators such as the KV
    /// store.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}
