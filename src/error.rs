//! Error types for redeque.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// The pool could not be built. Fatal at startup.
    #[error("failed to create redis pool: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),

    /// A connection could not be checked out (timeout, refused, closed pool).
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// A command or script failed on the server or in transit.
    #[error("redis {op} on {key} failed: {source}")]
    Redis {
        op: &'static str,
        key: String,
        #[source]
        source: redis::RedisError,
    },

    /// The server dropped a script again right after it was reloaded.
    #[error("script {script} was not retained by the server after reload")]
    ScriptNotRetained { script: &'static str },

    /// Every claim attempt lost the race for the head of the queue.
    #[error("queue {queue} is contended: no claim succeeded after {attempts} attempts")]
    Contention { queue: String, attempts: u32 },

    #[error("invalid queue name {0:?}: must be non-empty and contain no braces")]
    InvalidQueueName(String),

    #[error("invalid lease {0:?}: must be at least 1ms")]
    InvalidLease(std::time::Duration),

    /// An item was claimed but its payload was gone from the items hash.
    /// The claim stands; acknowledge the id to discard it.
    #[error("item {event_id} in queue {queue} has no stored payload")]
    MissingPayload { queue: String, event_id: String },

    #[error("malformed queue key {key:?}: {reason}")]
    KeyFormat { key: String, reason: &'static str },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a redis error with the operation and key it was issued against.
    pub(crate) fn redis(op: &'static str, key: impl Into<String>, source: redis::RedisError) -> Self {
        Error::Redis {
            op,
            key: key.into(),
            source,
        }
    }

    /// Whether retrying may succeed. Only idempotent operations
    /// (acknowledge, recover, sweep) should be retried on these.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Pool(_) | Error::Contention { .. } => true,
            Error::Redis { source, .. } => {
                source.is_timeout()
                    || source.is_connection_dropped()
                    || source.is_connection_refusal()
                    || source.is_io_error()
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use redis::{ErrorKind, RedisError};
    use std::io;

    #[test]
    fn transport_failures_and_contention_are_transient() {
        let timeout = RedisError::from(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        assert!(Error::redis("EVALSHA", "queue:{orders}", timeout).is_transient());

        let refused = RedisError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(Error::redis("LINDEX", "queue:{orders}", refused).is_transient());

        let contention = Error::Contention {
            queue: "orders".to_string(),
            attempts: 3,
        };
        assert!(contention.is_transient());
    }

    #[test]
    fn server_and_input_errors_are_not_transient() {
        let wrongtype = RedisError::from((ErrorKind::TypeError, "WRONGTYPE"));
        assert!(!Error::redis("LPOS", "queue:{orders}", wrongtype).is_transient());

        let response = RedisError::from((ErrorKind::ResponseError, "ERR invalid expire time"));
        assert!(!Error::redis("EVALSHA", "queue:{orders}", response).is_transient());

        assert!(!Error::InvalidQueueName("a{b".to_string()).is_transient());
        assert!(!Error::InvalidLease(std::time::Duration::ZERO).is_transient());
        assert!(!Error::ScriptNotRetained { script: "CLAIM" }.is_transient());
        assert!(
            !Error::MissingPayload {
                queue: "orders".to_string(),
                event_id: "e1".to_string(),
            }
            .is_transient()
        );
    }
}
