//! Best-effort distributed advisory lock over Redis (SET NX + token-checked
//! release). With no Redis configured the lock degrades to run-anyway and
//! callers rely on idempotent writes.

use redis::AsyncCommands;
use tracing::warn;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct AdvisoryLock {
    redis: Option<redis::aio::ConnectionManager>,
    key: String,
    ttl_secs: u64,
}

pub struct LockToken(Option<String>);

impl AdvisoryLock {
    pub fn new(
        redis: Option<redis::aio::ConnectionManager>,
        key: impl Into<String>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            redis,
            key: key.into(),
            ttl_secs,
        }
    }

    /// None when another holder has the lock; Some(token) otherwise.
    pub async fn acquire(&self) -> Option<LockToken> {
        let Some(redis) = &self.redis else {
            return Some(LockToken(None));
        };
        let token = uuid::Uuid::new_v4().to_string();
        let mut conn = redis.clone();
        let outcome: Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await;
        match outcome {
            Ok(Some(_)) => Some(LockToken(Some(token))),
            Ok(None) => None,
            Err(err) => {
                // Broker unavailable: degrade to run-anyway.
                warn!(error = %err, key = %self.key, "advisory lock unavailable, running anyway");
                Some(LockToken(None))
            }
        }
    }

    pub async fn release(&self, token: LockToken) {
        let (Some(redis), Some(token)) = (&self.redis, token.0) else {
            return;
        };
        let mut conn = redis.clone();
        let released: Result<i64, redis::RedisError> = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&token)
            .invoke_async(&mut conn)
            .await;
        if let Err(err) = released {
            warn!(error = %err, key = %self.key, "advisory lock release failed");
        }
    }
}
