//! Server-side Lua scripts and their handle cache.
//!
//! Scripts are loaded once with `SCRIPT LOAD` and executed by SHA1 with
//! `EVALSHA`. When the server has forgotten a script (restart, `SCRIPT
//! FLUSH`, failover) the `NOSCRIPT` reply triggers one reload and one retry.

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::KeyValue;
use redis::aio::ConnectionLike;
use redis::{ErrorKind, FromRedisValue, RedisError, ToRedisArgs};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// Error code the server uses for an unknown script SHA.
pub const NOSCRIPT_PREFIX: &str = "NOSCRIPT";

/// Conditional list move shared by every script that crosses an item
/// between the unclaimed and claimed lists. Leaves the removed count in `n`;
/// the moved value is `ARGV[1]` unless another Lua expression is given.
macro_rules! move_item_lua {
    ($src:literal, $dst:literal) => {
        move_item_lua!($src, $dst, "ARGV[1]")
    };
    ($src:literal, $dst:literal, $value:literal) => {
        concat!(
            "local n = redis.call(\"LREM\", ",
            $src,
            ", 1, ",
            $value,
            ")\n",
            "if n > 0 then\n",
            "    redis.call(\"RPUSH\", ",
            $dst,
            ", ",
            $value,
            ")\n",
            "end\n",
        )
    };
}

/// Every atomic operation the queue runs server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    /// `KEYS[1]` source list, `KEYS[2]` destination list, `ARGV[1]` value.
    /// Returns the number of occurrences moved (0 or 1).
    MoveItem,
    /// `KEYS[1]` unclaimed, `KEYS[2]` items, `KEYS[3]` channel;
    /// `ARGV[1]` event id, `ARGV[2]` payload. Returns the unclaimed length.
    Enqueue,
    /// `KEYS[1]` unclaimed, `KEYS[2]` claimed, `KEYS[3]` items, `KEYS[4]` lock,
    /// `KEYS[5]` restore; `ARGV[1]` event id, `ARGV[2]` consumer,
    /// `ARGV[3]` lease ms, `ARGV[4]` queue name, `ARGV[5]` claim time ms.
    /// Returns nil if the id was no longer unclaimed, otherwise an array
    /// holding the payload, empty when the items hash had none.
    Claim,
    /// `KEYS[1]` claimed, `KEYS[2]` lock, `KEYS[3]` restore, `KEYS[4]` items,
    /// `KEYS[5]` unclaimed; `ARGV[1]` event id. Returns the number of claimed
    /// entries removed. The payload is kept while another copy of the id is
    /// still queued.
    Acknowledge,
    /// `KEYS[1]` claimed, `KEYS[2]` unclaimed, `KEYS[3]` lock, `KEYS[4]` restore,
    /// `KEYS[5]` items; `ARGV[1]` event id. Returns -1 while the lease is
    /// held, otherwise the number of entries moved back.
    Recover,
    /// `KEYS[1]` claimed, `KEYS[2]` unclaimed, `KEYS[3]` items; `ARGV[1]` lock
    /// key prefix, `ARGV[2]` restore key prefix, `ARGV[3]` how many claimed
    /// entries to inspect from the head (0 for all). Returns the restored ids.
    RecoverExpired,
    /// `KEYS[1]` claimed, `KEYS[2]` unclaimed, `KEYS[3]` lock, `KEYS[4]` restore;
    /// `ARGV[1]` event id, `ARGV[2]` consumer. Returns 1 if released.
    Release,
    /// `KEYS[1]` lock; `ARGV[1]` consumer, `ARGV[2]` lease ms.
    /// Returns 1 if the lease was extended.
    ExtendLease,
    /// `KEYS[1]` consumers; `ARGV[1]` consumer, `ARGV[2]` expiry (unix ms).
    RegisterConsumer,
}

impl Script {
    pub const ALL: [Script; 9] = [
        Script::MoveItem,
        Script::Enqueue,
        Script::Claim,
        Script::Acknowledge,
        Script::Recover,
        Script::RecoverExpired,
        Script::Release,
        Script::ExtendLease,
        Script::RegisterConsumer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Script::MoveItem => "LREMRPUSH",
            Script::Enqueue => "ENQUEUE",
            Script::Claim => "CLAIM",
            Script::Acknowledge => "ACKNOWLEDGE",
            Script::Recover => "RECOVER",
            Script::RecoverExpired => "RECOVER_EXPIRED",
            Script::Release => "RELEASE",
            Script::ExtendLease => "EXTEND_LEASE",
            Script::RegisterConsumer => "REGISTER_CONSUMER",
        }
    }

    pub fn body(self) -> &'static str {
        match self {
            Script::MoveItem => concat!(move_item_lua!("KEYS[1]", "KEYS[2]"), "return n\n"),
            Script::Enqueue => {
                r#"redis.call("HSET", KEYS[2], ARGV[1], ARGV[2])
local len = redis.call("RPUSH", KEYS[1], ARGV[1])
redis.call("PUBLISH", KEYS[3], ARGV[1])
return len
"#
            }
            Script::Claim => concat!(
                move_item_lua!("KEYS[1]", "KEYS[2]"),
                r#"if n == 0 then
    return false
end
redis.call("SET", KEYS[4], ARGV[2], "PX", ARGV[3])
local payload = redis.call("HGET", KEYS[3], ARGV[1])
local record = {"queue", ARGV[4], "event_id", ARGV[1], "consumer", ARGV[2], "claimed_at", ARGV[5]}
if payload then
    table.insert(record, "payload")
    table.insert(record, payload)
end
redis.call("HSET", KEYS[5], unpack(record))
if payload then
    return {payload}
end
redis.log(redis.LOG_WARNING, "redeque: claimed " .. ARGV[1] .. " in " .. ARGV[4] .. " without a stored payload")
return {}
"#
            ),
            Script::Acknowledge => {
                r#"local n = redis.call("LREM", KEYS[1], 1, ARGV[1])
if n > 0 then
    redis.call("DEL", KEYS[2], KEYS[3])
    if not redis.call("LPOS", KEYS[1], ARGV[1]) and not redis.call("LPOS", KEYS[5], ARGV[1]) then
        redis.call("HDEL", KEYS[4], ARGV[1])
    end
end
return n
"#
            }
            Script::Recover => concat!(
                r#"if redis.call("EXISTS", KEYS[3]) == 1 then
    return -1
end
"#,
                move_item_lua!("KEYS[1]", "KEYS[2]"),
                r#"if n > 0 then
    local payload = redis.call("HGET", KEYS[4], "payload")
    if payload then
        redis.call("HSETNX", KEYS[5], ARGV[1], payload)
    end
end
redis.call("DEL", KEYS[4])
return n
"#
            ),
            Script::RecoverExpired => concat!(
                r#"local restored = {}
local ids = redis.call("LRANGE", KEYS[1], 0, tonumber(ARGV[3]) - 1)
for _, id in ipairs(ids) do
    if redis.call("EXISTS", ARGV[1] .. id) == 0 then
"#,
                move_item_lua!("KEYS[1]", "KEYS[2]", "id"),
                r#"        if n > 0 then
            local restore = ARGV[2] .. id
            local payload = redis.call("HGET", restore, "payload")
            if payload then
                redis.call("HSETNX", KEYS[3], id, payload)
            end
            redis.call("DEL", restore)
            table.insert(restored, id)
        end
    end
end
return restored
"#
            ),
            Script::Release => concat!(
                r#"if redis.call("GET", KEYS[3]) ~= ARGV[2] then
    return 0
end
"#,
                move_item_lua!("KEYS[1]", "KEYS[2]"),
                r#"redis.call("DEL", KEYS[3], KEYS[4])
return n
"#
            ),
            Script::ExtendLease => {
                r#"if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#
            }
            Script::RegisterConsumer => {
                r#"redis.call("ZADD", KEYS[1], ARGV[2], ARGV[1])
local last = redis.call("ZRANGE", KEYS[1], -1, -1, "WITHSCORES")
redis.call("PEXPIREAT", KEYS[1], last[2])
return 1
"#
            }
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether an error means the server does not know the script SHA.
pub fn is_script_missing(err: &RedisError) -> bool {
    err.kind() == ErrorKind::NoScriptError || err.code() == Some(NOSCRIPT_PREFIX)
}

/// Cached SHA1 handles, one slot per [`Script`].
///
/// Shared by every connection of the pool. Two tasks loading the same
/// script at once both store the same SHA, so load races are harmless.
pub struct ScriptRegistry {
    handles: [RwLock<Option<String>>; Script::ALL.len()],
    reloads: AtomicU64,
}

impl Default for ScriptRegistry {
    fn default() -> Self {
        Self {
            handles: std::array::from_fn(|_| RwLock::new(None)),
            reloads: AtomicU64::new(0),
        }
    }
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every script up front so the first invocations skip `SCRIPT LOAD`.
    pub async fn load_all<C>(&self, conn: &mut C) -> Result<()>
    where
        C: ConnectionLike + Send,
    {
        for script in Script::ALL {
            self.load(conn, script).await?;
        }
        Ok(())
    }

    /// The cached handle for a script, if it has been loaded.
    pub async fn handle(&self, script: Script) -> Option<String> {
        self.handles[script.slot()].read().await.clone()
    }

    /// Number of `NOSCRIPT` recoveries performed since construction.
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    /// Run a script by handle, reloading it once if the server lost it.
    pub async fn invoke<C, A, T>(
        &self,
        conn: &mut C,
        script: Script,
        keys: &[String],
        args: A,
    ) -> Result<T>
    where
        C: ConnectionLike + Send,
        A: ToRedisArgs,
        T: FromRedisValue,
    {
        let sha = match self.handle(script).await {
            Some(sha) => sha,
            None => self.load(conn, script).await?,
        };

        let key = keys.first().cloned().unwrap_or_default();
        match evalsha(conn, &sha, keys, &args).await {
            Ok(value) => return Ok(value),
            Err(e) if is_script_missing(&e) => {
                tracing::debug!(script = script.name(), "script evicted from server cache, reloading");
            }
            Err(e) => return Err(Error::redis(script.name(), key, e)),
        }

        self.reloads.fetch_add(1, Ordering::Relaxed);
        metrics::script_reloads().add(1, &[KeyValue::new("script", script.name())]);

        let sha = self.load(conn, script).await?;
        match evalsha(conn, &sha, keys, &args).await {
            Ok(value) => Ok(value),
            Err(e) if is_script_missing(&e) => Err(Error::ScriptNotRetained {
                script: script.name(),
            }),
            Err(e) => Err(Error::redis(script.name(), key, e)),
        }
    }

    async fn load<C>(&self, conn: &mut C, script: Script) -> Result<String>
    where
        C: ConnectionLike + Send,
    {
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script.body())
            .query_async(conn)
            .await
            .map_err(|e| Error::redis("SCRIPT LOAD", script.name(), e))?;
        *self.handles[script.slot()].write().await = Some(sha.clone());
        Ok(sha)
    }
}

async fn evalsha<C, A, T>(conn: &mut C, sha: &str, keys: &[String], args: &A) -> redis::RedisResult<T>
where
    C: ConnectionLike + Send,
    A: ToRedisArgs,
    T: FromRedisValue,
{
    redis::cmd("EVALSHA")
        .arg(sha)
        .arg(keys.len())
        .arg(keys)
        .arg(args)
        .query_async(conn)
        .await
}
