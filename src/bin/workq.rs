//! workq CLI: runs the queue service and inspects its records.

use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use workq::clock::SystemClock;
use workq::config::secrets::{ExposeSecret, redact_url};
use workq::config::{Config, DEFAULT_QUEUE};
use workq::discovery::enqueuer::InsightEnqueuer;
use workq::discovery::{DefinitionSource, EnqueuerConfig, FileSource, StaticSource};
use workq::engine::{ControlPlane, PeriodicRoutine, StallReclaimer};
use workq::model::{State, WorkId};
use workq::server::{QueueOptions, Readiness, Server, ServerOptions};
use workq::store::{PgStore, QueueStore};
use workq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "workq", about = "Leased work queue for insight queries")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the queue API, the enqueuer and the stall reclaimer
    Serve,
    /// Run one discovery pass now and exit
    Discover,
    /// Show the queued count of every configured queue
    Stats,
    /// List records on a queue, newest first
    List {
        /// Queue name
        #[arg(default_value = DEFAULT_QUEUE)]
        queue: String,
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Maximum records to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one record
    Show {
        /// Record ID
        id: String,
    },
    /// Cancel a queued record
    Cancel {
        /// Record ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let store = connect(&config).await?;

    match cli.command {
        Command::Serve => cmd_serve(&config, store).await,
        Command::Discover => cmd_discover(&config, store).await,
        Command::Stats => cmd_stats(&config, store.as_ref()).await,
        Command::List {
            queue,
            state,
            limit,
        } => cmd_list(store.as_ref(), &queue, state, limit).await,
        Command::Show { id } => cmd_show(store.as_ref(), &id).await,
        Command::Cancel { id } => cmd_cancel(store.as_ref(), &id).await,
    }
}

async fn connect(config: &Config) -> anyhow::Result<Arc<dyn QueueStore>> {
    let url = config.database_url.expose_secret();
    tracing::info!(database = %redact_url(url), "connecting to store");

    let mut store = PgStore::connect(url).await?;
    for queue in &config.queues {
        store = store.queue_config(queue.name.clone(), queue.store_config());
    }
    store.migrate().await?;
    store.health_check().await?;
    Ok(Arc::new(store))
}

fn enqueuer(config: &Config, store: Arc<dyn QueueStore>) -> InsightEnqueuer {
    let source: Arc<dyn DefinitionSource> = match &config.definitions_path {
        Some(path) => Arc::new(FileSource::new(path)),
        None => {
            tracing::warn!("DEFINITIONS_PATH not set, discovery passes will find nothing");
            Arc::new(StaticSource::default())
        }
    };

    let queue_name = if config.queue_names().contains(&DEFAULT_QUEUE) {
        DEFAULT_QUEUE.to_string()
    } else {
        config.queues[0].name.clone()
    };

    InsightEnqueuer::new(
        store,
        source,
        EnqueuerConfig {
            queue_name,
            ..EnqueuerConfig::default()
        },
        Arc::new(SystemClock),
    )
}

async fn cmd_serve(config: &Config, store: Arc<dyn QueueStore>) -> anyhow::Result<()> {
    let queues: HashMap<String, QueueOptions> = config
        .queues
        .iter()
        .map(|q| (q.name.clone(), QueueOptions::new(&q.name, Arc::clone(&store))))
        .collect();

    let readiness = Readiness::default();
    let server = Server::new(
        ServerOptions {
            listen_addr: config.listen_addr,
        },
        queues,
        readiness.clone(),
    );

    let reclaimer = StallReclaimer::new(
        config
            .queues
            .iter()
            .map(|q| (q.name.clone(), Arc::clone(&store)))
            .collect(),
    );

    let control = ControlPlane::new(readiness)
        .routine(PeriodicRoutine::new(
            "insights_enqueuer",
            config.enqueuer_interval,
            Arc::new(enqueuer(config, Arc::clone(&store))),
        ))
        .routine(PeriodicRoutine::new(
            "stall_reclaimer",
            config.reclaim_interval,
            Arc::new(reclaimer),
        ))
        .server(server);

    let token = control.shutdown_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        token.cancel();
    });

    control.run().await?;
    Ok(())
}

async fn cmd_discover(config: &Config, store: Arc<dyn QueueStore>) -> anyhow::Result<()> {
    let summary = enqueuer(config, store).run_once().await?;
    println!("Unique series:   {}", summary.unique);
    println!("Enqueued:        {}", summary.enqueued);
    println!("Already queued:  {}", summary.already_queued);
    println!("Repeated:        {}", summary.repeated);
    Ok(())
}

async fn cmd_stats(config: &Config, store: &dyn QueueStore) -> anyhow::Result<()> {
    println!("{:<24}  QUEUED", "QUEUE");
    for name in config.queue_names() {
        let queued = store.queued_count(name).await?;
        println!("{name:<24}  {queued}");
    }
    Ok(())
}

async fn cmd_list(
    store: &dyn QueueStore,
    queue: &str,
    state: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let state_filter: Option<State> = match state {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid state: {s}"))?,
        ),
        None => None,
    };

    let records = store.list(queue, state_filter, limit).await?;
    if records.is_empty() {
        println!("No records found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:<4}  {:<4}  {:<20}  QUEUED",
        "ID", "STATE", "PRI", "TRY", "PROCESS_AFTER"
    );
    println!("{}", "-".repeat(80));

    for record in &records {
        let short_id = &record.id.to_string()[..8];
        println!(
            "{:<8}  {:<10}  {:<4}  {:<4}  {:<20}  {}",
            short_id,
            record.state,
            record.priority,
            record.attempt_count,
            record.process_after.format("%Y-%m-%d %H:%M:%S"),
            record.queued_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} record(s)", records.len());
    Ok(())
}

async fn cmd_show(store: &dyn QueueStore, id: &str) -> anyhow::Result<()> {
    let id: WorkId = id.parse()?;
    let record = store.get(id).await?;

    println!("ID:            {}", record.id);
    println!("Queue:         {}", record.queue_name);
    println!("Identity:      {}", record.identity);
    println!("State:         {}", record.state);
    println!("Priority:      {}", record.priority);
    println!("Cost:          {}", record.cost);
    println!(
        "Payload:       {}",
        serde_json::to_string_pretty(&record.payload)?
    );
    println!("Attempts:      {}", record.attempt_count);
    println!("Queued:        {}", record.queued_at);
    println!("Process After: {}", record.process_after);
    if let Some(ref worker) = record.worker_id {
        println!("Worker:        {worker}");
    }
    if let Some(leased_until) = record.leased_until {
        println!("Leased Until:  {leased_until}");
    }
    if let Some(ref err) = record.last_error {
        println!("Last Error:    {err}");
    }
    if let Some(finished) = record.finished_at {
        println!("Finished:      {finished}");
    }
    Ok(())
}

async fn cmd_cancel(store: &dyn QueueStore, id: &str) -> anyhow::Result<()> {
    let id: WorkId = id.parse()?;
    let record = store.cancel(id).await?;
    println!("Canceled: {} (queue: {})", record.id, record.queue_name);
    Ok(())
}
