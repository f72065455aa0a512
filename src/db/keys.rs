//! Key namespace for queue collections.
//!
//! Every key of a queue has the form `queue:{<name>}:<part>:...`. The
//! braces let the name be recovered from a full key even when it contains
//! colons, and double as a Redis Cluster hash tag so all of a queue's keys
//! land in one slot and can be touched by a single script.

use crate::error::{Error, Result};

const PREFIX: &str = "queue";
const DELIMITER: char = ':';

/// A validated queue name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueName(String);

impl QueueName {
    /// Validate a queue name. Names must be non-empty and must not contain
    /// `{` or `}`, which would make the wrapped segment ambiguous.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.contains(['{', '}']) {
            return Err(Error::InvalidQueueName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for QueueName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Build `queue:{<name>}` followed by each part, colon-joined.
///
/// Takes a raw `&str` so the discovery pattern can pass `*` as the name.
pub fn queue_key(queue: &str, parts: &[&str]) -> String {
    let mut key = format!("{PREFIX}{DELIMITER}{{{queue}}}");
    for part in parts {
        key.push(DELIMITER);
        key.push_str(part);
    }
    key
}

/// FIFO list of unclaimed event ids.
pub fn unclaimed(queue: &QueueName) -> String {
    queue_key(queue.as_str(), &[])
}

/// List of claimed event ids, oldest claim first.
pub fn claimed(queue: &QueueName) -> String {
    queue_key(queue.as_str(), &["claimed"])
}

/// Sorted set of consumer ids scored by expiry.
pub fn consumers(queue: &QueueName) -> String {
    queue_key(queue.as_str(), &["consumers"])
}

/// Hash of event id to payload. Its existence is what makes a queue
/// discoverable.
pub fn items(queue: &QueueName) -> String {
    queue_key(queue.as_str(), &["items"])
}

/// Lease key for one claimed item.
pub fn lock(queue: &QueueName, event_id: &str) -> String {
    queue_key(queue.as_str(), &["lock", event_id])
}

/// Restore record for one claimed item.
pub fn restore(queue: &QueueName, event_id: &str) -> String {
    queue_key(queue.as_str(), &["restore", event_id])
}

/// Prefix that [`lock`] keys share; the event id follows it directly.
pub fn lock_prefix(queue: &QueueName) -> String {
    let mut key = queue_key(queue.as_str(), &["lock"]);
    key.push(DELIMITER);
    key
}

/// Prefix that [`restore`] keys share.
pub fn restore_prefix(queue: &QueueName) -> String {
    let mut key = queue_key(queue.as_str(), &["restore"]);
    key.push(DELIMITER);
    key
}

/// Pub/sub channel notified with the event id of each enqueued item.
pub fn channel(queue: &QueueName) -> String {
    queue_key(queue.as_str(), &[])
}

/// Glob matching the items key of every queue.
pub fn items_pattern() -> String {
    queue_key("*", &["items"])
}

/// Extract the queue name from a fully-qualified key.
pub fn queue_name_from_key(key: &str) -> Result<String> {
    let malformed = |reason| Error::KeyFormat {
        key: key.to_string(),
        reason,
    };

    let (_, rest) = key
        .split_once(DELIMITER)
        .ok_or_else(|| malformed("not enough segments"))?;

    // The wrapped name may itself contain colons, so look for the closing
    // brace instead of the next delimiter.
    let segment = match rest.find('}') {
        Some(end) => &rest[..=end],
        None => rest.split(DELIMITER).next().unwrap_or(rest),
    };
    if segment.len() < 3 {
        return Err(malformed("queue segment too short"));
    }
    if !segment.starts_with('{') || !segment.ends_with('}') {
        return Err(malformed("queue segment is not wrapped in braces"));
    }
    Ok(segment[1..segment.len() - 1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> QueueName {
        QueueName::new("orders").unwrap()
    }

    #[test]
    fn keys_match_wire_format() {
        let q = orders();
        assert_eq!(unclaimed(&q), "queue:{orders}");
        assert_eq!(claimed(&q), "queue:{orders}:claimed");
        assert_eq!(consumers(&q), "queue:{orders}:consumers");
        assert_eq!(items(&q), "queue:{orders}:items");
        assert_eq!(lock(&q, "e1"), "queue:{orders}:lock:e1");
        assert_eq!(restore(&q, "e1"), "queue:{orders}:restore:e1");
        assert_eq!(channel(&q), "queue:{orders}");
        assert_eq!(items_pattern(), "queue:{*}:items");
    }

    #[test]
    fn every_key_maps_back_to_its_queue() {
        let q = orders();
        for key in [
            unclaimed(&q),
            claimed(&q),
            consumers(&q),
            items(&q),
            lock(&q, "e1"),
            restore(&q, "e1"),
            queue_key(q.as_str(), &["items"]),
        ] {
            assert_eq!(queue_name_from_key(&key).unwrap(), "orders", "{key}");
        }
    }

    #[test]
    fn prefixes_extend_to_per_item_keys() {
        let q = QueueName::new("billing:eu").unwrap();
        assert_eq!(format!("{}e1", lock_prefix(&q)), lock(&q, "e1"));
        assert_eq!(format!("{}e1", restore_prefix(&q)), restore(&q, "e1"));
    }

    #[test]
    fn names_with_colons_round_trip() {
        let q = QueueName::new("billing:eu").unwrap();
        assert_eq!(items(&q), "queue:{billing:eu}:items");
        assert_eq!(queue_name_from_key(&items(&q)).unwrap(), "billing:eu");
        assert_eq!(queue_name_from_key(&lock(&q, "x:y")).unwrap(), "billing:eu");
    }

    #[test]
    fn inverse_rejects_malformed_keys() {
        assert!(matches!(
            queue_name_from_key("queue"),
            Err(Error::KeyFormat { .. })
        ));
        assert!(matches!(
            queue_name_from_key("queue:{}:items"),
            Err(Error::KeyFormat { .. })
        ));
        assert!(matches!(
            queue_name_from_key("queue:ab:items"),
            Err(Error::KeyFormat { .. })
        ));
        assert!(matches!(
            queue_name_from_key("queue:"),
            Err(Error::KeyFormat { .. })
        ));
    }

    #[test]
    fn queue_names_are_validated() {
        assert!(QueueName::new("").is_err());
        assert!(QueueName::new("a{b").is_err());
        assert!(QueueName::new("a}b").is_err());
        assert!("jobs/high".parse::<QueueName>().is_ok());
    }
}
