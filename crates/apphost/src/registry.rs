//! Pull credentials for images hosted on the platform registry.
//!
//! Tokens are cached per scope with their own expiry. The cache is an explicit
//! object handed to the reconciler, not process-global state.
use base64::Engine;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::{collections::HashMap, sync::Mutex, time::Duration};
use tokio::time::Instant;

/// Refresh this long before the hard expiry so a pull never races it.
const EXPIRY_SLACK: Duration = Duration::from_secs(30);
pub const REGISTRY_USER: &str = "apphost";

pub trait TokenIssuer: Send + Sync {
    fn issue(&self, scope: &str, ttl: Duration) -> String;
}

/// Deterministic keyed digest over scope and issue time.
pub struct SigningIssuer { key: String }

impl SigningIssuer {
    pub fn new(key: impl Into<String>) -> Self { Self { key: key.into() } }
}

impl TokenIssuer for SigningIssuer {
    fn issue(&self, scope: &str, ttl: Duration) -> String {
        let expires = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        let mut h = Sha256::new();
        h.update(self.key.as_bytes());
        h.update(scope.as_bytes());
        h.update(expires.to_be_bytes());
        format!("{expires}.{}", hex::encode(h.finalize()))
    }
}

pub struct TokenCache {
    ttl: Duration,
    issuer: Box<dyn TokenIssuer>,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl TokenCache {
    pub fn new(ttl: Duration, issuer: Box<dyn TokenIssuer>) -> Self {
        Self { ttl, issuer, entries: Mutex::new(HashMap::new()) }
    }

    pub fn get_or_issue(&self, scope: &str) -> String {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((token, exp)) = entries.get(scope) {
            if *exp > now + EXPIRY_SLACK { return token.clone(); }
        }
        let token = self.issuer.issue(scope, self.ttl);
        tracing::debug!(scope, "registry_token_issued");
        entries.insert(scope.to_string(), (token.clone(), now + self.ttl));
        token
    }
}

/// Pull scope for one registry repository.
pub fn pull_scope(registry: &str) -> String { format!("repository:{registry}/*:pull") }

/// Docker config JSON authenticating `host` with the given token.
pub fn dockerconfigjson(host: &str, token: &str) -> String {
    let auth = base64::engine::general_purpose::STANDARD.encode(format!("{REGISTRY_USER}:{token}"));
    json!({"auths": {host: {"username": REGISTRY_USER, "password": token, "auth": auth}}}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting(Arc<AtomicUsize>);
    impl TokenIssuer for Counting {
        fn issue(&self, scope: &str, _ttl: Duration) -> String {
            format!("{scope}-{}", self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reuses_until_expiry() {
        let n = Arc::new(AtomicUsize::new(0));
        let cache = TokenCache::new(Duration::from_secs(120), Box::new(Counting(n.clone())));
        let a = cache.get_or_issue("s");
        assert_eq!(cache.get_or_issue("s"), a);
        tokio::time::advance(Duration::from_secs(95)).await;
        assert_ne!(cache.get_or_issue("s"), a);
        assert_eq!(n.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn config_json_shape() {
        let raw = dockerconfigjson("registry.test", "tok");
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["auths"]["registry.test"]["auth"], "YXBwaG9zdDp0b2s=");
    }

    #[test]
    fn signing_issuer_embeds_expiry() {
        let t = SigningIssuer::new("k").issue("scope", Duration::from_secs(60));
        let (exp, sig) = t.split_once('.').unwrap();
        assert!(exp.parse::<i64>().unwrap() > chrono::Utc::now().timestamp());
        assert_eq!(sig.len(), 64);
    }
}
