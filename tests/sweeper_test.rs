//! Sweeping every discovered queue against a live Redis.
//!
//! Flushes its database, so it is the only test in this binary and uses
//! a database index of its own.

use std::sync::Arc;
use std::time::Duration;

use redeque::db::queue::List;
use redeque::engine::{SweepConfig, Sweeper};
use redeque::{Db, QueueName};

#[tokio::test]
#[ignore] // Requires running Redis; flushes database 13
async fn sweep_all_and_sweeper_cover_discovered_queues() {
    let url = std::env::var("REDEQUE_SWEEP_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379/13".to_string());
    let client = redis::Client::open(url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await.unwrap();

    let db = Db::connect(&url).await.unwrap();
    let jobs: QueueName = "jobs".parse().unwrap();
    let mail: QueueName = "mail".parse().unwrap();

    db.enqueue(&jobs, "j1", b"x").await.unwrap();
    db.enqueue(&jobs, "j2", b"x").await.unwrap();
    db.enqueue(&mail, "m1", b"x").await.unwrap();
    db.claim(&jobs, "crashed", Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    db.claim(&jobs, "alive", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let reports = db.sweep_all().await.unwrap();
    assert_eq!(reports.len(), 2);
    let jobs_report = reports.iter().find(|r| r.queue == "jobs").unwrap();
    assert_eq!((jobs_report.scanned, jobs_report.restored, jobs_report.leased), (2, 1, 1));
    let mail_report = reports.iter().find(|r| r.queue == "mail").unwrap();
    assert_eq!((mail_report.scanned, mail_report.restored), (0, 0));
    assert_eq!(db.list_items(&jobs, List::Unclaimed).await.unwrap(), ["j1"]);

    // With no queues configured the sweeper discovers them itself.
    db.claim(&mail, "crashed", Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let sweeper = Sweeper::new(
        Arc::new(db.clone()),
        SweepConfig {
            interval: Duration::from_secs(60),
            queues: Vec::new(),
        },
    );
    let reports = sweeper.sweep_once().await.unwrap();
    let mail_report = reports.iter().find(|r| r.queue == "mail").unwrap();
    assert_eq!(mail_report.restored, 1);
    assert_eq!(db.list_items(&mail, List::Unclaimed).await.unwrap(), ["m1"]);
}
