//! Claim/restore engine: enqueue, claim, acknowledge, recover.
//!
//! Every state change is a single script run on the server, so no
//! in-process locking is needed. The only client-side read that feeds a
//! write is the head of the unclaimed list in [`Db::claim`], and the claim
//! script re-checks it.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use redis::AsyncCommands;
use tracing::Instrument;

use super::keys::{self, QueueName};
use super::scripts::Script;
use crate::error::{Error, Result};
use crate::model::{Ack, Item, ItemState, QueueStats, Recovery, SweepReport};
use crate::telemetry::metrics;
use crate::telemetry::queue::{record_event_id, record_state_transition, start_queue_span};

/// Which of a queue's two item lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum List {
    Unclaimed,
    Claimed,
}

impl List {
    fn key(self, queue: &QueueName) -> String {
        match self {
            List::Unclaimed => keys::unclaimed(queue),
            List::Claimed => keys::claimed(queue),
        }
    }
}

/// What caused a recovery, for metrics.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    Explicit,
    Lazy,
    Sweep,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Explicit => "explicit",
            Trigger::Lazy => "lazy",
            Trigger::Sweep => "sweep",
        }
    }
}

/// Claimed entries inspected from the head on every claim. When the
/// unclaimed list turns out empty the whole claimed list is walked instead.
const LAZY_RECOVERY_LIMIT: usize = 64;

fn lease_millis(lease: Duration) -> Result<u64> {
    let ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX);
    if ms == 0 {
        return Err(Error::InvalidLease(lease));
    }
    Ok(ms)
}

fn count_operation(queue: &QueueName, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

fn record_duration(operation: &'static str, started: Instant) {
    metrics::operation_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", operation)],
    );
}

impl super::Db {
    /// Append an item to the tail of the unclaimed list and notify the
    /// queue's channel. Returns the unclaimed length after the append.
    ///
    /// Event ids are not deduplicated; keeping them unique is up to the
    /// caller. Enqueueing an id that is already present adds a second list
    /// entry and overwrites the stored payload, which both entries then
    /// share. The payload is dropped only when the last entry is
    /// acknowledged.
    pub async fn enqueue(&self, queue: &QueueName, event_id: &str, payload: &[u8]) -> Result<u64> {
        let span = start_queue_span("enqueue", queue.as_str());
        record_event_id(&span, event_id);
        let started = Instant::now();

        async {
            let mut conn = self.conn().await?;
            let len: u64 = self
                .scripts
                .invoke(
                    &mut conn,
                    Script::Enqueue,
                    &[keys::unclaimed(queue), keys::items(queue), keys::channel(queue)],
                    (event_id, payload),
                )
                .await?;

            count_operation(queue, "enqueue");
            record_duration("queue.enqueue", started);
            Ok(len)
        }
        .instrument(span)
        .await
    }

    /// Claim the head of the unclaimed list for `consumer` with a lease of
    /// `lease`. Returns `None` when there is no work.
    ///
    /// Expired claims are recovered first, so a queue makes progress even
    /// when nobody runs a sweep. Every claim inspects the oldest 64
    /// claimed entries; before reporting an empty queue the whole claimed
    /// list is inspected.
    ///
    /// An item whose payload has gone missing is still claimed and yields
    /// [`Error::MissingPayload`].
    ///
    /// A transport error leaves the outcome unknown. Do not retry blindly;
    /// check [`Db::lock_owner`] for the item instead.
    pub async fn claim(
        &self,
        queue: &QueueName,
        consumer: &str,
        lease: Duration,
    ) -> Result<Option<Item>> {
        let lease_ms = lease_millis(lease)?;
        let span = start_queue_span("claim", queue.as_str());
        let started = Instant::now();

        async {
            let mut conn = self.conn().await?;
            self.recover_expired(&mut conn, queue, LAZY_RECOVERY_LIMIT)
                .await?;

            let unclaimed_key = keys::unclaimed(queue);
            let mut walked_all_claims = false;
            let mut attempt = 0;
            while attempt < self.claim_retries {
                let head: Option<String> = conn
                    .lindex(&unclaimed_key, 0)
                    .await
                    .map_err(|e| Error::redis("LINDEX", &unclaimed_key, e))?;
                let Some(event_id) = head else {
                    if !walked_all_claims {
                        walked_all_claims = true;
                        if self.recover_expired(&mut conn, queue, 0).await? > 0 {
                            continue;
                        }
                    }
                    count_operation(queue, "claim_empty");
                    return Ok(None);
                };
                attempt += 1;

                let now_ms = chrono::Utc::now().timestamp_millis();
                let claimed: Option<Vec<Vec<u8>>> = self
                    .scripts
                    .invoke(
                        &mut conn,
                        Script::Claim,
                        &[
                            unclaimed_key.clone(),
                            keys::claimed(queue),
                            keys::items(queue),
                            keys::lock(queue, &event_id),
                            keys::restore(queue, &event_id),
                        ],
                        (&event_id, consumer, lease_ms, queue.as_str(), now_ms),
                    )
                    .await?;

                if let Some(mut found) = claimed {
                    let span = tracing::Span::current();
                    record_event_id(&span, &event_id);
                    record_state_transition(&span, "unclaimed", "claimed_leased");
                    count_operation(queue, "claim");
                    record_duration("queue.claim", started);

                    let Some(payload) = found.pop() else {
                        tracing::warn!(%event_id, "claimed an item with no stored payload");
                        return Err(Error::MissingPayload {
                            queue: queue.to_string(),
                            event_id,
                        });
                    };
                    return Ok(Some(Item { event_id, payload }));
                }

                tracing::debug!(attempt, %event_id, "lost claim race, re-reading head");
                metrics::claim_contention().add(1, &[KeyValue::new("queue", queue.to_string())]);
            }

            Err(Error::Contention {
                queue: queue.to_string(),
                attempts: self.claim_retries,
            })
        }
        .instrument(span)
        .await
    }

    /// Finish an item: remove it from the claimed list and drop its lease,
    /// restore record and payload. Idempotent; an item that is not claimed
    /// yields [`Ack::NotClaimed`].
    pub async fn acknowledge(&self, queue: &QueueName, event_id: &str) -> Result<Ack> {
        let span = start_queue_span("acknowledge", queue.as_str());
        record_event_id(&span, event_id);

        async {
            let mut conn = self.conn().await?;
            let removed: i64 = self
                .scripts
                .invoke(
                    &mut conn,
                    Script::Acknowledge,
                    &[
                        keys::claimed(queue),
                        keys::lock(queue, event_id),
                        keys::restore(queue, event_id),
                        keys::items(queue),
                        keys::unclaimed(queue),
                    ],
                    event_id,
                )
                .await?;

            if removed == 0 {
                tracing::debug!("acknowledged an item that was not claimed");
                return Ok(Ack::NotClaimed);
            }
            record_state_transition(&tracing::Span::current(), "claimed", "acknowledged");
            count_operation(queue, "acknowledge");
            Ok(Ack::Acknowledged)
        }
        .instrument(span)
        .await
    }

    /// Return an item whose lease has expired to the tail of the unclaimed
    /// list. A no-op while the lease is held or if the item is not claimed.
    pub async fn recover(&self, queue: &QueueName, event_id: &str) -> Result<Recovery> {
        let span = start_queue_span("recover", queue.as_str());
        record_event_id(&span, event_id);

        async {
            let mut conn = self.conn().await?;
            self.recover_on(&mut conn, queue, event_id, Trigger::Explicit)
                .await
        }
        .instrument(span)
        .await
    }

    async fn recover_on(
        &self,
        conn: &mut deadpool_redis::Connection,
        queue: &QueueName,
        event_id: &str,
        trigger: Trigger,
    ) -> Result<Recovery> {
        let moved: i64 = self
            .scripts
            .invoke(
                conn,
                Script::Recover,
                &[
                    keys::claimed(queue),
                    keys::unclaimed(queue),
                    keys::lock(queue, event_id),
                    keys::restore(queue, event_id),
                    keys::items(queue),
                ],
                event_id,
            )
            .await?;

        let recovery = match moved {
            m if m < 0 => Recovery::LeaseValid,
            0 => Recovery::NotClaimed,
            _ => Recovery::Restored,
        };
        if recovery == Recovery::Restored {
            tracing::info!(queue = %queue, event_id, trigger = trigger.as_str(), "restored expired claim");
            metrics::recoveries().add(
                1,
                &[
                    KeyValue::new("queue", queue.to_string()),
                    KeyValue::new("trigger", trigger.as_str()),
                ],
            );
        }
        Ok(recovery)
    }

    /// Recover up to `limit` expired claims from the head of the claimed
    /// list in one script run (0 walks the whole list). Returns how many
    /// were restored.
    async fn recover_expired(
        &self,
        conn: &mut deadpool_redis::Connection,
        queue: &QueueName,
        limit: usize,
    ) -> Result<usize> {
        let restored: Vec<String> = self
            .scripts
            .invoke(
                conn,
                Script::RecoverExpired,
                &[keys::claimed(queue), keys::unclaimed(queue), keys::items(queue)],
                (keys::lock_prefix(queue), keys::restore_prefix(queue), limit),
            )
            .await?;

        if !restored.is_empty() {
            tracing::info!(
                queue = %queue,
                event_ids = ?restored,
                trigger = Trigger::Lazy.as_str(),
                "restored expired claims"
            );
            metrics::recoveries().add(
                restored.len() as u64,
                &[
                    KeyValue::new("queue", queue.to_string()),
                    KeyValue::new("trigger", Trigger::Lazy.as_str()),
                ],
            );
        }
        Ok(restored.len())
    }

    /// Recover every expired claim of a queue.
    pub async fn sweep(&self, queue: &QueueName) -> Result<SweepReport> {
        let span = start_queue_span("sweep", queue.as_str());
        let started = Instant::now();

        async {
            let mut conn = self.conn().await?;
            let claimed_key = keys::claimed(queue);
            let claimed: Vec<String> = conn
                .lrange(&claimed_key, 0, -1)
                .await
                .map_err(|e| Error::redis("LRANGE", &claimed_key, e))?;

            let mut report = SweepReport {
                queue: queue.to_string(),
                scanned: claimed.len(),
                ..SweepReport::default()
            };
            for event_id in &claimed {
                match self
                    .recover_on(&mut conn, queue, event_id, Trigger::Sweep)
                    .await?
                {
                    Recovery::Restored => report.restored += 1,
                    Recovery::LeaseValid => report.leased += 1,
                    // Acknowledged between the read and the script.
                    Recovery::NotClaimed => {}
                }
            }

            record_duration("queue.sweep", started);
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Sweep every discovered queue. Queues are swept one after another;
    /// an error on one queue is logged and does not stop the others.
    pub async fn sweep_all(&self) -> Result<Vec<SweepReport>> {
        let mut reports = Vec::new();
        for name in self.list_queues().await? {
            let queue = match QueueName::new(name) {
                Ok(queue) => queue,
                Err(e) => {
                    tracing::warn!("skipping undiscoverable queue: {e}");
                    continue;
                }
            };
            match self.sweep(&queue).await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(queue = %queue, "sweep failed: {e}"),
            }
        }
        Ok(reports)
    }

    /// Give a claimed item back without processing it. Only the consumer
    /// holding the lease can release it. Returns whether it was released.
    pub async fn release(&self, queue: &QueueName, event_id: &str, consumer: &str) -> Result<bool> {
        let span = start_queue_span("release", queue.as_str());
        record_event_id(&span, event_id);

        async {
            let mut conn = self.conn().await?;
            let moved: i64 = self
                .scripts
                .invoke(
                    &mut conn,
                    Script::Release,
                    &[
                        keys::claimed(queue),
                        keys::unclaimed(queue),
                        keys::lock(queue, event_id),
                        keys::restore(queue, event_id),
                    ],
                    (event_id, consumer),
                )
                .await?;
            if moved > 0 {
                record_state_transition(&tracing::Span::current(), "claimed_leased", "unclaimed");
                count_operation(queue, "release");
            }
            Ok(moved > 0)
        }
        .instrument(span)
        .await
    }

    /// Push a held lease out to `lease` from now. Only succeeds for the
    /// consumer that holds it.
    pub async fn extend_lease(
        &self,
        queue: &QueueName,
        event_id: &str,
        consumer: &str,
        lease: Duration,
    ) -> Result<bool> {
        let lease_ms = lease_millis(lease)?;
        let mut conn = self.conn().await?;
        let extended: i64 = self
            .scripts
            .invoke(
                &mut conn,
                Script::ExtendLease,
                &[keys::lock(queue, event_id)],
                (consumer, lease_ms),
            )
            .await?;
        Ok(extended == 1)
    }

    /// The consumer currently holding the lease on an item, if any.
    pub async fn lock_owner(&self, queue: &QueueName, event_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let key = keys::lock(queue, event_id);
        conn.get(&key).await.map_err(|e| Error::redis("GET", key, e))
    }

    /// Where an item currently is. `None` means it is in neither list,
    /// i.e. acknowledged or never enqueued.
    pub async fn item_state(&self, queue: &QueueName, event_id: &str) -> Result<Option<ItemState>> {
        let mut conn = self.conn().await?;
        let unclaimed = keys::unclaimed(queue);
        let (in_unclaimed, in_claimed, leased): (Option<i64>, Option<i64>, bool) = redis::pipe()
            .atomic()
            .cmd("LPOS")
            .arg(&unclaimed)
            .arg(event_id)
            .cmd("LPOS")
            .arg(keys::claimed(queue))
            .arg(event_id)
            .exists(keys::lock(queue, event_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::redis("LPOS", unclaimed, e))?;

        Ok(match (in_unclaimed, in_claimed) {
            (_, Some(_)) if leased => Some(ItemState::ClaimedLeased),
            (_, Some(_)) => Some(ItemState::ClaimedExpired),
            (Some(_), None) => Some(ItemState::Unclaimed),
            (None, None) => None,
        })
    }

    /// Sizes of a queue's collections. Lapsed consumers are not counted.
    pub async fn stats(&self, queue: &QueueName) -> Result<QueueStats> {
        let mut conn = self.conn().await?;
        let unclaimed = keys::unclaimed(queue);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let (unclaimed_len, claimed_len, consumers): (u64, u64, u64) = redis::pipe()
            .llen(&unclaimed)
            .llen(keys::claimed(queue))
            .zcount(keys::consumers(queue), format!("({now_ms}"), "+inf")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::redis("LLEN", unclaimed, e))?;
        Ok(QueueStats {
            unclaimed: unclaimed_len,
            claimed: claimed_len,
            consumers,
        })
    }

    /// The event ids currently in one of a queue's lists, head first.
    pub async fn list_items(&self, queue: &QueueName, list: List) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let key = list.key(queue);
        conn.lrange(&key, 0, -1)
            .await
            .map_err(|e| Error::redis("LRANGE", key, e))
    }

    /// The atomic move primitive on its own: move the first occurrence of
    /// `event_id` from one list to the tail of the other. Leases and
    /// restore records are untouched. Returns whether anything moved.
    pub async fn move_item(
        &self,
        queue: &QueueName,
        from: List,
        to: List,
        event_id: &str,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let moved: i64 = self
            .scripts
            .invoke(
                &mut conn,
                Script::MoveItem,
                &[from.key(queue), to.key(queue)],
                event_id,
            )
            .await?;
        Ok(moved > 0)
    }

    /// Every queue that currently holds items, found by scanning for
    /// items keys. An empty set is not an error.
    pub async fn list_queues(&self) -> Result<BTreeSet<String>> {
        let mut conn = self.conn().await?;
        let pattern = keys::items_pattern();
        let mut names = BTreeSet::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::redis("SCAN", &pattern, e))?;
            for key in batch {
                match keys::queue_name_from_key(&key) {
                    Ok(name) => {
                        names.insert(name);
                    }
                    Err(e) => tracing::warn!("ignoring key during queue discovery: {e}"),
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(names)
    }
}
