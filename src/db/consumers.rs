//! Consumer membership per queue.
//!
//! Members live in a sorted set scored by their expiry time (unix ms).
//! The set's own key expiry is pushed out to the latest member expiry on
//! every registration, so it disappears once every consumer has stopped
//! heartbeating. Lapsed members are filtered out on read, never deleted.
//! Membership is informational; nothing here affects claim correctness.

use std::time::Duration;

use redis::AsyncCommands;

use super::keys::{self, QueueName};
use super::scripts::Script;
use crate::error::{Error, Result};

/// Latest expiry a registration can carry. Sorted set scores are doubles,
/// and past 2^53 they come back in exponent form, which `PEXPIREAT`
/// rejects.
const MAX_EXPIRY_MS: i64 = (1 << 53) - 1;

fn expiry_ms(now_ms: i64, ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_add(ttl_ms).min(MAX_EXPIRY_MS)
}

impl super::Db {
    /// Register or refresh a consumer for `ttl`. Call periodically as a
    /// heartbeat.
    pub async fn register_consumer(&self, queue: &QueueName, consumer: &str, ttl: Duration) -> Result<()> {
        let expires_at = expiry_ms(chrono::Utc::now().timestamp_millis(), ttl);

        let mut conn = self.conn().await?;
        let _: i64 = self
            .scripts
            .invoke(
                &mut conn,
                Script::RegisterConsumer,
                &[keys::consumers(queue)],
                (consumer, expires_at),
            )
            .await?;
        tracing::debug!(queue = %queue, consumer, expires_at, "consumer heartbeat");
        Ok(())
    }

    /// Consumers whose registration has not lapsed, sorted by id.
    pub async fn list_consumers(&self, queue: &QueueName) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let key = keys::consumers(queue);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut consumers: Vec<String> = conn
            .zrangebyscore(&key, format!("({now_ms}"), "+inf")
            .await
            .map_err(|e| Error::redis("ZRANGEBYSCORE", &key, e))?;
        consumers.sort();
        Ok(consumers)
    }

    /// Remove a consumer immediately, e.g. on clean shutdown.
    pub async fn deregister_consumer(&self, queue: &QueueName, consumer: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let key = keys::consumers(queue);
        let _: i64 = conn
            .zrem(&key, consumer)
            .await
            .map_err(|e| Error::redis("ZREM", &key, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_now_plus_ttl() {
        assert_eq!(expiry_ms(1_000, Duration::from_secs(2)), 3_000);
    }

    #[test]
    fn huge_ttls_stay_exact_as_scores() {
        let now = 1_760_000_000_000;
        assert_eq!(expiry_ms(now, Duration::MAX), MAX_EXPIRY_MS);
        assert_eq!(expiry_ms(now, Duration::from_secs(u64::MAX / 2)), MAX_EXPIRY_MS);
        // Representable exactly as an f64, so the score prints as an integer.
        assert_eq!(MAX_EXPIRY_MS as f64 as i64, MAX_EXPIRY_MS);
    }
}
