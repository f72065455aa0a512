//! redeque CLI: operator interface to Redis-backed work queues.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use redeque::config::Config;
use redeque::engine::{SweepConfig, Sweeper};
use redeque::model::{Ack, Recovery};
use redeque::telemetry::{TelemetryConfig, init_telemetry};
use redeque::{Db, DbOptions, QueueName};
use secrecy::ExposeSecret;

#[derive(Parser)]
#[command(name = "redeque", about = "Lease-based work queues on Redis")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the recovery sweeper until interrupted
    Serve {
        /// Seconds between sweeps
        #[arg(long, default_value_t = 5)]
        interval: u64,
        /// Queues to sweep (default: every discovered queue)
        #[arg(long = "queue")]
        queues: Vec<QueueName>,
    },
    /// Append an item to a queue
    Enqueue {
        queue: QueueName,
        /// Item payload
        payload: String,
        /// Event id (default: a random UUID)
        #[arg(long)]
        event_id: Option<String>,
    },
    /// Claim the next item of a queue
    Claim {
        queue: QueueName,
        /// Consumer id holding the lease
        #[arg(long)]
        consumer: String,
        /// Lease length in seconds
        #[arg(long, default_value_t = 30)]
        lease: u64,
    },
    /// Acknowledge a claimed item
    Ack { queue: QueueName, event_id: String },
    /// Return an expired claim to its queue
    Recover { queue: QueueName, event_id: String },
    /// Recover every expired claim of a queue
    Sweep { queue: QueueName },
    /// List queues that hold items
    Queues,
    /// List live consumers of a queue
    Consumers { queue: QueueName },
    /// Register or refresh a consumer
    Heartbeat {
        queue: QueueName,
        consumer: String,
        /// Registration lifetime in seconds
        #[arg(long, default_value_t = 60)]
        ttl: u64,
    },
    /// Show collection sizes for a queue
    Stats { queue: QueueName },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "redeque".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = match Db::connect_with(config.redis_url.expose_secret(), DbOptions::from(&config)).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!("cannot connect to redis: {e}");
            return Err(e.into());
        }
    };

    let result = run(&db, cli.command).await;
    db.close();
    result
}

async fn run(db: &Db, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Serve { interval, queues } => cmd_serve(db.clone(), interval, queues).await,
        Command::Enqueue {
            queue,
            payload,
            event_id,
        } => {
            let event_id = event_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let len = db.enqueue(&queue, &event_id, payload.as_bytes()).await?;
            println!("Enqueued: {event_id} ({len} unclaimed)");
            Ok(())
        }
        Command::Claim {
            queue,
            consumer,
            lease,
        } => {
            match db
                .claim(&queue, &consumer, Duration::from_secs(lease))
                .await?
            {
                Some(item) => println!("{}\t{}", item.event_id, item.payload_lossy()),
                None => println!("No work available."),
            }
            Ok(())
        }
        Command::Ack { queue, event_id } => {
            match db.acknowledge(&queue, &event_id).await? {
                Ack::Acknowledged => println!("Acknowledged: {event_id}"),
                Ack::NotClaimed => println!("Not claimed: {event_id} (nothing to do)"),
            }
            Ok(())
        }
        Command::Recover { queue, event_id } => {
            match db.recover(&queue, &event_id).await? {
                Recovery::Restored => println!("Restored: {event_id}"),
                Recovery::LeaseValid => println!("Lease still held: {event_id}"),
                Recovery::NotClaimed => println!("Not claimed: {event_id} (nothing to do)"),
            }
            Ok(())
        }
        Command::Sweep { queue } => {
            let report = db.sweep(&queue).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Queues => {
            let queues = db.list_queues().await?;
            if queues.is_empty() {
                println!("No queues found.");
            }
            for name in queues {
                println!("{name}");
            }
            Ok(())
        }
        Command::Consumers { queue } => {
            for consumer in db.list_consumers(&queue).await? {
                println!("{consumer}");
            }
            Ok(())
        }
        Command::Heartbeat {
            queue,
            consumer,
            ttl,
        } => {
            db.register_consumer(&queue, &consumer, Duration::from_secs(ttl))
                .await?;
            println!("Registered: {consumer} for {ttl}s");
            Ok(())
        }
        Command::Stats { queue } => {
            let stats = db.stats(&queue).await?;
            println!("Unclaimed:  {}", stats.unclaimed);
            println!("Claimed:    {}", stats.claimed);
            println!("Consumers:  {}", stats.consumers);
            Ok(())
        }
    }
}

async fn cmd_serve(db: Db, interval: u64, queues: Vec<QueueName>) -> anyhow::Result<()> {
    let sweeper = Sweeper::new(
        Arc::new(db),
        SweepConfig {
            interval: Duration::from_secs(interval.max(1)),
            queues,
        },
    );

    let handle = sweeper.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    sweeper.run().await?;
    Ok(())
}
