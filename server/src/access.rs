//! Per-connection access control.
//!
//! A bearer token (HS256 JWT) carries `write` and `read` allow-lists of
//! topics or filters, an optional `sub` subject, and optional `rlimit`
//! rate-limit rules. When `disable_auth` is set every check passes.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::trace;

use crate::topic;

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    write: Vec<String>,
    #[serde(default)]
    read: Vec<String>,
    #[serde(default)]
    rlimit: Vec<serde_json::Value>,
}

/// One rate-limit rule from the token's `rlimit` claim.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitRule {
    pub topic: String,
    /// Window length in milliseconds.
    pub interval: u64,
    /// Maximum publishes per window.
    pub max: u64,
}

/// Rate-limit rules for a connection.
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfig {
    rules: Vec<RateLimitRule>,
}

impl RateLimitConfig {
    fn load(claims: &[serde_json::Value]) -> Self {
        let rules = claims
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect();

        Self { rules }
    }

    /// Returns the rule covering `topic`, if any. An exact topic match has
    /// the highest precedence; otherwise the longest matching filter wins.
    pub fn rate_limit_for_topic(&self, topic_name: &str) -> Option<&RateLimitRule> {
        let mut found: Option<&RateLimitRule> = None;
        let mut matched_len = 0usize;

        for rule in &self.rules {
            if rule.topic == topic_name {
                return Some(rule);
            }

            if topic::is_filter_matched(&rule.topic, topic_name) && rule.topic.len() > matched_len {
                matched_len = rule.topic.len();
                found = Some(rule);
            }
        }

        found
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Access state for one connection.
#[derive(Debug, Clone)]
pub struct AccessController {
    disable_auth: bool,
    token_loaded: bool,
    subject: String,
    publish_acl: Vec<String>,
    subscribe_acl: Vec<String>,
    rlimit: RateLimitConfig,
}

impl AccessController {
    pub fn new(disable_auth: bool) -> Self {
        Self {
            disable_auth,
            token_loaded: false,
            subject: String::new(),
            publish_acl: Vec::new(),
            subscribe_acl: Vec::new(),
            rlimit: RateLimitConfig::default(),
        }
    }

    /// Loads a JWT token and extracts the publish/subscribe allow-lists.
    ///
    /// Allow-list entries that are not valid topics or filters are dropped.
    /// A token with an empty `write ∪ read` is rejected. Returns true when
    /// the token was accepted (always true with auth disabled).
    pub fn authenticate(&mut self, token: &str, secret: &str) -> bool {
        if self.disable_auth {
            self.token_loaded = true;
            return true;
        }

        let key = DecodingKey::from_secret(secret.as_bytes());
        let claims = match decode::<TokenClaims>(token, &key, &Validation::new(Algorithm::HS256)) {
            Ok(data) => data.claims,
            Err(e) => {
                trace!(error = %e, "token rejected");
                return false;
            }
        };

        self.publish_acl = claims
            .write
            .into_iter()
            .filter(|f| topic::is_valid_topic_or_filter(f))
            .collect();

        self.subscribe_acl = claims
            .read
            .into_iter()
            .filter(|f| topic::is_valid_topic_or_filter(f))
            .collect();

        if self.publish_acl.is_empty() && self.subscribe_acl.is_empty() {
            trace!("token rejected: no publish or subscribe ACL");
            return false;
        }

        if let Some(sub) = claims.sub {
            self.subject = sub;
        }

        self.rlimit = RateLimitConfig::load(&claims.rlimit);
        self.token_loaded = true;

        true
    }

    pub fn is_authenticated(&self) -> bool {
        self.disable_auth || self.token_loaded
    }

    pub fn allow_publish(&self, topic_name: &str) -> bool {
        self.allowed_by(&self.publish_acl, topic_name)
    }

    pub fn allow_subscribe(&self, topic_name: &str) -> bool {
        self.allowed_by(&self.subscribe_acl, topic_name)
    }

    fn allowed_by(&self, acl: &[String], topic_name: &str) -> bool {
        if self.disable_auth {
            return true;
        }

        if !self.token_loaded {
            return false;
        }

        acl.iter()
            .any(|filter| topic::is_filter_matched(filter, topic_name))
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn rate_limit_config(&self) -> &RateLimitConfig {
        &self.rlimit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "eventhub_secret";

    fn token(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn valid_token_loads_acls() {
        let t = token(json!({
            "exp": far_future(),
            "sub": "user@example.com",
            "write": ["test1/#", "test2/#"],
            "read": ["test1/#", "test2/#"],
        }));

        let mut acs = AccessController::new(false);
        assert!(acs.authenticate(&t, SECRET));
        assert!(acs.is_authenticated());
        assert_eq!(acs.subject(), "user@example.com");

        assert!(acs.allow_subscribe("test1/mychannel"));
        assert!(acs.allow_publish("test1/mychannel"));
        assert!(!acs.allow_subscribe("my/very/private/channel"));
        assert!(!acs.allow_publish("my/very/private/channel"));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let t = token(json!({
            "exp": far_future(),
            "write": ["test1/#"],
            "read": ["test1/#"],
        }));

        let mut acs = AccessController::new(false);
        assert!(!acs.authenticate(&t, "wrong_secret"));
        assert!(!acs.is_authenticated());
        assert!(!acs.allow_subscribe("test1/mychannel"));
        assert!(!acs.allow_publish("test1/mychannel"));
    }

    #[test]
    fn token_without_any_acl_is_rejected() {
        let t = token(json!({ "exp": far_future(), "sub": "user" }));

        let mut acs = AccessController::new(false);
        assert!(!acs.authenticate(&t, SECRET));
    }

    #[test]
    fn invalid_acl_entries_are_dropped() {
        let t = token(json!({
            "exp": far_future(),
            "write": ["/bad", "ok/topic"],
            "read": ["also bad!"],
        }));

        let mut acs = AccessController::new(false);
        assert!(acs.authenticate(&t, SECRET));
        assert!(acs.allow_publish("ok/topic"));
        assert!(!acs.allow_subscribe("also bad!"));
    }

    #[test]
    fn disabled_auth_allows_everything() {
        let mut acs = AccessController::new(true);
        assert!(acs.authenticate("not-even-a-token", "whatever"));
        assert!(acs.is_authenticated());
        assert!(acs.allow_subscribe("my/very/private/channel"));
        assert!(acs.allow_publish("my/very/private/channel"));
    }

    #[test]
    fn rate_limit_rules_are_loaded_and_matched() {
        let t = token(json!({
            "exp": far_future(),
            "write": ["#"],
            "read": ["#"],
            "rlimit": [
                { "topic": "broadcast/#", "interval": 1000, "max": 2 },
                { "topic": "broadcast/news", "interval": 500, "max": 10 },
                { "not": "a rule" },
            ],
        }));

        let mut acs = AccessController::new(false);
        assert!(acs.authenticate(&t, SECRET));

        // Exact match wins over the filter.
        let rule = acs
            .rate_limit_config()
            .rate_limit_for_topic("broadcast/news")
            .unwrap();
        assert_eq!(rule.topic, "broadcast/news");
        assert_eq!(rule.max, 10);

        // Filter match for other subtopics.
        let rule = acs
            .rate_limit_config()
            .rate_limit_for_topic("broadcast/weather")
            .unwrap();
        assert_eq!(rule.topic, "broadcast/#");

        assert!(acs
            .rate_limit_config()
            .rate_limit_for_topic("unrelated/topic")
            .is_none());
    }

    #[test]
    fn longest_matching_filter_wins() {
        let cfg = RateLimitConfig {
            rules: vec![
                RateLimitRule {
                    topic: "a/#".to_string(),
                    interval: 1000,
                    max: 1,
                },
                RateLimitRule {
                    topic: "a/b/#".to_string(),
                    interval: 1000,
                    max: 2,
                },
            ],
        };

        assert_eq!(cfg.rate_limit_for_topic("a/b/c").unwrap().max, 2);
        assert_eq!(cfg.rate_limit_for_topic("a/x").unwrap().max, 1);
    }
}
