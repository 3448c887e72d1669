//! relq CLI: operator interface to a relq queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::TimeDelta;
use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use relq::config::secrets::{ExposeSecret, redacted_url};
use relq::config::{Config, StaleTimeouts};
use relq::db::Db;
use relq::engine::Engine;
use relq::model::{NewItem, QueueItemId, Selector};
use relq::store::{MemoryStore, QueueStore};
use relq::telemetry::{MEMORY_STORE, POSTGRES_STORE, TelemetryConfig, init_telemetry};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "relq", about = "Durable work queue over PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or upgrade the queue schema
    Migrate,
    /// Add an item to the queue
    Enqueue {
        /// Item type (acquire filters on it)
        item_type: String,
        /// Producer correlation id
        external_id: String,
        /// Opaque payload
        data: String,
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Acquire the oldest matching item
    Acquire {
        /// Acquirer identity
        acquirer: String,
        #[arg(long = "type", conflicts_with = "id")]
        item_type: Option<String>,
        /// Acquire this item only
        #[arg(long)]
        id: Option<QueueItemId>,
    },
    /// Hand an acquired item back to the queue
    Release { acquirer: String, id: QueueItemId },
    /// Complete an acquired item
    Dequeue { acquirer: String, id: QueueItemId },
    /// Show the item acquire would pick, without acquiring it
    Peek {
        #[arg(long = "type", conflicts_with_all = ["id", "external_id"])]
        item_type: Option<String>,
        #[arg(long, conflicts_with = "external_id")]
        id: Option<QueueItemId>,
        #[arg(long)]
        external_id: Option<String>,
    },
    /// Show an active item
    Show {
        id: QueueItemId,
        /// Include the audit trail
        #[arg(long)]
        audit: bool,
    },
    /// Show a dequeued item
    History { id: QueueItemId },
    /// Enqueued / acquired counts
    Stats {
        #[arg(long = "type")]
        item_type: Option<String>,
    },
    /// List stale items
    Stale {
        #[arg(value_enum)]
        partition: StalePartition,
        #[arg(long = "type")]
        item_type: Option<String>,
        /// Age threshold in seconds (0 lists every acquired item)
        #[arg(long, default_value_t = 86_400, allow_negative_numbers = true)]
        secs: i64,
    },
    /// Force-release items acquired longer than the threshold
    Requeue {
        #[arg(long = "type")]
        item_type: Option<String>,
        #[arg(long, default_value_t = 86_400, allow_negative_numbers = true)]
        secs: i64,
    },
    /// Requeue stale items for every type using the stale timeout table
    Sweep {
        /// Timeout table (defaults to RELQ_STALE_TIMEOUTS, then one day for every type)
        #[arg(long)]
        table: Option<PathBuf>,
    },
    /// Run a synthetic producer/consumer workload
    Load(LoadArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum StalePartition {
    Acquired,
    Enqueued,
}

#[derive(clap::Args)]
struct LoadArgs {
    /// Use an in-process store instead of PostgreSQL
    #[arg(long)]
    memory: bool,
    #[arg(long, default_value_t = 2)]
    producers: usize,
    #[arg(long, default_value_t = 4)]
    consumers: usize,
    /// Items enqueued by each producer
    #[arg(long, default_value_t = 100)]
    items: usize,
    /// Item types to spread the workload over
    #[arg(long, value_delimiter = ',', default_value = "email,report,index")]
    types: Vec<String>,
    /// Fraction of acquired items that are dequeued rather than released (0 < ratio <= 1)
    #[arg(long, default_value_t = 0.8, allow_negative_numbers = true)]
    dequeue_ratio: f64,
}

impl LoadArgs {
    /// Consumers stop once the queue drains, so some acquisitions must dequeue.
    fn validate(&self) -> anyhow::Result<()> {
        if self.types.is_empty() {
            anyhow::bail!("--types must name at least one item type");
        }
        if !(self.dequeue_ratio > 0.0 && self.dequeue_ratio <= 1.0) {
            anyhow::bail!("--dequeue-ratio must be greater than 0 and at most 1");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env();

    let in_memory = matches!(&cli.command, Command::Load(args) if args.memory);
    // A memory load test runs without database settings.
    let telemetry = match &config {
        Ok(config) => TelemetryConfig::from(config),
        Err(_) => TelemetryConfig::local("info"),
    };
    let store = if in_memory { MEMORY_STORE } else { POSTGRES_STORE };
    let _guard = init_telemetry(telemetry.with_store(store))?;

    if let Command::Load(args) = &cli.command {
        if args.memory {
            args.validate()?;
            let queue = config.map(|c| c.queue).unwrap_or_default();
            let engine = Engine::new(Arc::new(MemoryStore::new()), queue);
            return cmd_load(engine, args).await;
        }
    }

    let config = config?;
    info!(database = %redacted_url(&config.database_url), "connecting");
    let db = Db::connect_with(
        config.database_url.expose_secret(),
        config.max_connections,
        config.queue.operation_timeout,
    )
    .await?;

    if let Command::Migrate = cli.command {
        db.migrate().await?;
        info!("schema is up to date");
        return Ok(());
    }

    let engine = Engine::new(Arc::new(db), config.queue.clone());

    match cli.command {
        Command::Migrate => Ok(()),
        Command::Enqueue {
            item_type,
            external_id,
            data,
            metadata,
        } => {
            let mut item = NewItem::new(item_type, external_id, data);
            if let Some(metadata) = metadata {
                item = item.metadata(metadata);
            }
            print_json(&engine.enqueue(item).await?)
        }
        Command::Acquire {
            acquirer,
            item_type,
            id,
        } => {
            let selector = match id {
                Some(id) => Selector::Item(id),
                None => Selector::for_type(item_type.as_deref()),
            };
            print_json(&engine.acquire(&acquirer, &selector).await?)
        }
        Command::Release { acquirer, id } => print_json(&engine.release(&acquirer, id).await?),
        Command::Dequeue { acquirer, id } => print_json(&engine.dequeue(&acquirer, id).await?),
        Command::Peek {
            item_type,
            id,
            external_id,
        } => {
            let item = match (id, external_id) {
                (Some(id), _) => engine.peek(&Selector::Item(id)).await?,
                (None, Some(external_id)) => engine.peek_external_id(&external_id).await?,
                (None, None) => engine.peek(&Selector::for_type(item_type.as_deref())).await?,
            };
            print_json(&item)
        }
        Command::Show { id, audit } => {
            let item = engine.get(id).await?;
            if audit {
                let trail = engine.audit_trail(id).await?;
                print_json(&serde_json::json!({ "item": item, "audit": trail }))
            } else {
                print_json(&item)
            }
        }
        Command::History { id } => print_json(&engine.history(id).await?),
        Command::Stats { item_type } => {
            let counts = engine.counts(item_type.as_deref()).await?;
            print_json(&serde_json::json!({
                "enqueued": counts.enqueued,
                "acquired": counts.acquired,
                "total": counts.total(),
            }))
        }
        Command::Stale {
            partition,
            item_type,
            secs,
        } => {
            let age = seconds(secs)?;
            let ids = match partition {
                StalePartition::Acquired => {
                    engine.list_stale_acquired(item_type.as_deref(), age).await?
                }
                StalePartition::Enqueued => {
                    engine.list_stale_enqueued(item_type.as_deref(), age).await?
                }
            };
            print_json(&ids)
        }
        Command::Requeue { item_type, secs } => {
            let count = engine
                .requeue_stale(item_type.as_deref(), seconds(secs)?)
                .await;
            print_json(&count)?;
            if !count.ran() {
                anyhow::bail!("stale items could not be listed");
            }
            Ok(())
        }
        Command::Sweep { table } => {
            let table = match table {
                Some(path) => StaleTimeouts::load(&path)?,
                None => config.stale_timeouts()?,
            };
            print_json(&engine.sweep(&table).await)
        }
        Command::Load(args) => {
            args.validate()?;
            cmd_load(engine, &args).await
        }
    }
}

fn seconds(secs: i64) -> anyhow::Result<TimeDelta> {
    TimeDelta::try_seconds(secs).ok_or_else(|| anyhow::anyhow!("--secs {secs} is out of range"))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Synthetic workload
// ---------------------------------------------------------------------------

/// A consumer gives up after this many acquire errors in a row.
const MAX_CONSECUTIVE_FAILURES: u32 = 20;

#[derive(Default)]
struct LoadCounters {
    enqueued: AtomicU64,
    acquired: AtomicU64,
    dequeued: AtomicU64,
    released: AtomicU64,
    empty: AtomicU64,
    errors: AtomicU64,
}

#[derive(Serialize)]
struct LoadReport {
    enqueued: u64,
    acquired: u64,
    dequeued: u64,
    released: u64,
    empty_acquires: u64,
    errors: u64,
    remaining_enqueued: u64,
    remaining_acquired: u64,
    elapsed_ms: u128,
}

async fn cmd_load<S: QueueStore + 'static>(engine: Engine<S>, args: &LoadArgs) -> anyhow::Result<()> {
    let dequeue_ratio = args.dequeue_ratio;
    let counters = Arc::new(LoadCounters::default());
    let producing = Arc::new(AtomicBool::new(true));
    let started = Instant::now();

    let mut producers = Vec::with_capacity(args.producers);
    for p in 0..args.producers {
        let engine = engine.clone();
        let counters = Arc::clone(&counters);
        let types = args.types.clone();
        let items = args.items;
        producers.push(tokio::spawn(async move {
            for n in 0..items {
                let item_type = &types[n % types.len()];
                let item = NewItem::new(item_type.as_str(), format!("p{p}-{n}"), format!("payload {n}"));
                match engine.enqueue(item).await {
                    Ok(_) => counters.enqueued.fetch_add(1, Ordering::Relaxed),
                    Err(e) => {
                        warn!(producer = p, error = %e, "enqueue failed");
                        counters.errors.fetch_add(1, Ordering::Relaxed)
                    }
                };
            }
        }));
    }

    let mut consumers = Vec::with_capacity(args.consumers);
    for c in 0..args.consumers {
        let engine = engine.clone();
        let counters = Arc::clone(&counters);
        let producing = Arc::clone(&producing);
        let types = args.types.clone();
        consumers.push(tokio::spawn(async move {
            let acquirer = format!("consumer-{c}");
            let mut round = 0usize;
            let mut failures = 0u32;
            loop {
                // Alternate between typed and untyped acquires.
                round += 1;
                let selector = if round % 2 == 0 {
                    Selector::Any
                } else {
                    Selector::Type(types[(c + round) % types.len()].clone())
                };
                let item = match engine.acquire(&acquirer, &selector).await {
                    Ok(Some(item)) => item,
                    Ok(None) => {
                        counters.empty.fetch_add(1, Ordering::Relaxed);
                        let idle = engine.counts(None).await.map(|n| n.enqueued == 0);
                        if !producing.load(Ordering::Acquire) && matches!(idle, Ok(true)) {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        continue;
                    }
                    Err(e) => {
                        warn!(consumer = c, error = %e, "acquire failed");
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                        failures += 1;
                        if failures >= MAX_CONSECUTIVE_FAILURES {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                failures = 0;
                counters.acquired.fetch_add(1, Ordering::Relaxed);

                let complete = rand::thread_rng().gen_bool(dequeue_ratio);
                let done = if complete {
                    engine.dequeue(&acquirer, item.id).await.map(|r| r.is_some())
                } else {
                    engine.release(&acquirer, item.id).await.map(|r| r.is_some())
                };
                match (done, complete) {
                    (Ok(true), true) => counters.dequeued.fetch_add(1, Ordering::Relaxed),
                    (Ok(true), false) => counters.released.fetch_add(1, Ordering::Relaxed),
                    (Ok(false), _) | (Err(_), _) => counters.errors.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }

    for producer in producers {
        producer.await?;
    }
    producing.store(false, Ordering::Release);
    for consumer in consumers {
        consumer.await?;
    }

    let remaining = engine.counts(None).await?;
    print_json(&LoadReport {
        enqueued: counters.enqueued.load(Ordering::Relaxed),
        acquired: counters.acquired.load(Ordering::Relaxed),
        dequeued: counters.dequeued.load(Ordering::Relaxed),
        released: counters.released.load(Ordering::Relaxed),
        empty_acquires: counters.empty.load(Ordering::Relaxed),
        errors: counters.errors.load(Ordering::Relaxed),
        remaining_enqueued: remaining.enqueued,
        remaining_acquired: remaining.acquired,
        elapsed_ms: started.elapsed().as_millis(),
    })
}
