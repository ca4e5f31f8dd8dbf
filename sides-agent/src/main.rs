//! Sides Agent: command-line host for the offline sync core.
//!
//! Opens the shared local store, then queues writes, flushes them to the
//! remote endpoint, or installs and queries the offline cache, against real
//! HTTP.

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sides_sync::cache::registration::UpdateOutcome;
use sides_sync::storage::QueueStore;
use sides_sync::{
    open_persistent_stores, open_stores, AppInstance, Connectivity, FetchEvent, FlushOutcome,
    HeadlessPlatform, HttpFetcher, HttpUploader, InstallSummary, InstanceEvent, OfflineWorker,
    Outbox, Request, RouteDecision, SessionIdentity, Stores, SyncConfig, WakeChannel,
    WriteOutcome,
};

type AgentResult<T = ()> = Result<T, Box<dyn Error>>;

/// How often `run` re-reads the config file for a new cache version.
const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Parser, Debug)]
#[command(name = "sides-agent", version, about = "Offline write queue and cache host")]
struct Cli {
    /// JSON configuration file
    #[arg(long, env = "SIDES_CONFIG")]
    config: Option<PathBuf>,

    /// Local store directory (overrides the config file)
    #[arg(long, env = "SIDES_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Upload endpoint (overrides the config file)
    #[arg(long, env = "SIDES_UPLOAD_ENDPOINT")]
    endpoint: Option<String>,

    /// Bearer token sent with uploads
    #[arg(long, env = "SIDES_UPLOAD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Signed-in identity
    #[arg(long, env = "SIDES_USER")]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a JSON payload now, or queue it if that fails
    Enqueue {
        /// Payload, e.g. '{"kind":"note","text":"hi"}'
        payload: String,
        /// Skip the immediate attempt and queue directly
        #[arg(long)]
        offline: bool,
    },
    /// Upload every queued item of the current user
    Flush,
    /// Show queued items and storage durability
    Status,
    /// Precache the configured generation
    Install,
    /// Route one request through the offline cache
    Fetch {
        url: String,
        /// Treat as a page navigation
        #[arg(long)]
        navigate: bool,
    },
    /// Stay up: flush on wake-ups and pick up new cache versions until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{e}");
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> AgentResult<SyncConfig> {
    let mut config = match cli.config {
        Some(ref path) => SyncConfig::from_json_file(path)?,
        None => SyncConfig::default(),
    };
    if let Some(dir) = cli.data_dir.clone() {
        config.data_dir = dir;
    }
    if let Some(endpoint) = cli.endpoint.clone() {
        config.upload_endpoint = Some(endpoint);
    }
    Ok(config)
}

/// Stores for a one-shot command. Anything queued into memory would be
/// gone when the command exits, so the fallback is refused.
fn durable_stores(config: &SyncConfig) -> AgentResult<Stores> {
    open_persistent_stores(config.store_config()).map_err(|e| {
        Box::<dyn Error>::from(format!(
            "cannot open {} ({e}); is another sides-agent running on it?",
            config.data_dir.display()
        ))
    })
}

/// Stores for commands that queue nothing; memory is good enough.
fn any_stores(config: &SyncConfig) -> Stores {
    let (stores, opened) = open_stores(config.store_config());
    if opened.is_degraded() {
        warn!("Running without persistence: {opened}");
    }
    stores
}

async fn run(cli: Cli) -> AgentResult {
    let config = load_config(&cli)?;

    let identity = Arc::new(match cli.user {
        Some(ref user) => SessionIdentity::signed_in(user.as_str()),
        None => SessionIdentity::signed_out(),
    });

    match cli.command {
        Command::Enqueue {
            ref payload,
            offline,
        } => {
            let stores = durable_stores(&config)?;
            let payload: serde_json::Value = serde_json::from_str(payload)?;
            let connectivity = Connectivity::new(!offline);
            let outbox = build_outbox(&config, &cli.token, &stores, identity, connectivity)?;
            match outbox.enqueue_or_write(payload).await? {
                WriteOutcome::WroteNow => println!("written"),
                WriteOutcome::Queued => println!("queued ({} pending)", outbox.pending_count()?),
            }
        }
        Command::Flush => {
            let stores = durable_stores(&config)?;
            let outbox =
                build_outbox(&config, &cli.token, &stores, identity, Connectivity::online())?;
            match outbox.flush().await? {
                FlushOutcome::Completed(report) => println!(
                    "uploaded {}, failed {}, claimed elsewhere {}, other users {}",
                    report.uploaded(),
                    report.failed(),
                    report.claim_lost(),
                    report.foreign
                ),
                other => println!("flush skipped: {other:?}"),
            }
        }
        Command::Status => {
            let stores = durable_stores(&config)?;
            println!("storage: {:?}", stores.durability);
            let items = stores.queue.list_items()?;
            println!("{} queued item(s)", items.len());
            for item in items {
                let lease = item
                    .claim
                    .as_ref()
                    .map(|l| format!(" leased by {}", l.holder))
                    .unwrap_or_default();
                println!("  {} owner={}{lease}", item.id, item.owner);
            }
        }
        Command::Install => {
            let worker = build_worker(&any_stores(&config), Connectivity::online());
            let summary = worker.install(config.cache.clone()).await?;
            print_install(&summary);
            worker.shutdown().await;
        }
        Command::Fetch { ref url, navigate } => {
            let worker = build_worker(&any_stores(&config), Connectivity::online());
            worker.install(config.cache.clone()).await?;
            let request = if navigate {
                Request::navigate(url.as_str())
            } else {
                Request::get(url.as_str())
            };
            match worker.fetch(FetchEvent::new(request)).await {
                RouteDecision::Passthrough => println!("passthrough"),
                RouteDecision::Respond(response) => println!(
                    "{} {:?}, {} bytes",
                    response.status,
                    response.kind,
                    response.body.len()
                ),
            }
            worker.shutdown().await;
        }
        Command::Run => {
            // Long-lived: a memory store still flushes what it queues.
            let stores = any_stores(&config);
            let connectivity = Connectivity::online();
            let channel = Arc::new(WakeChannel::new(config.wake_channel_capacity));
            // No OS scheduler delivers background-sync events to this process.
            let worker = Arc::new(OfflineWorker::new(
                stores.cache.clone(),
                Arc::new(HttpFetcher::new()),
                Arc::new(HeadlessPlatform::new(false, false)),
                channel,
                connectivity.clone(),
            ));
            print_install(&worker.install(config.cache.clone()).await?);

            let outbox = build_outbox(&config, &cli.token, &stores, identity, connectivity)?
                .with_wake(worker.coordinator().clone());
            let mut instance = AppInstance::attach(Arc::new(outbox), worker.clone()).await;
            let mut events = instance.take_event_rx().ok_or("event stream already taken")?;
            info!("Running; Ctrl-C to stop");

            let mut update_check = tokio::time::interval(UPDATE_CHECK_INTERVAL);
            update_check.tick().await;
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    signal = &mut ctrl_c => {
                        signal?;
                        break;
                    }
                    _ = update_check.tick() => check_for_update(&cli, &instance).await,
                    Some(event) = events.recv() => log_event(event),
                }
            }
            instance.shutdown().await;
            worker.shutdown().await;
        }
    }
    Ok(())
}

/// Re-read the config file and move to its cache version if it changed.
async fn check_for_update(cli: &Cli, instance: &AppInstance) {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            warn!("Update check skipped: {e}");
            return;
        }
    };
    match instance.check_for_update(config.cache).await {
        Ok(Some(UpdateOutcome::Unchanged)) | Ok(None) => {}
        Ok(Some(outcome)) => info!("Update check: {outcome:?}"),
        Err(e) => warn!("Update check failed: {e}"),
    }
}

fn log_event(event: InstanceEvent) {
    match event {
        InstanceEvent::Flushed { trigger, report } if !report.items.is_empty() => info!(
            "Flush ({trigger:?}): {} uploaded, {} failed",
            report.uploaded(),
            report.failed()
        ),
        InstanceEvent::FlushFailed { trigger, error } => warn!("Flush ({trigger:?}) failed: {error}"),
        InstanceEvent::ControllerChanged { generation } => info!(
            "Serving from {}",
            generation.as_deref().unwrap_or("the network")
        ),
        _ => {}
    }
}

fn build_outbox(
    config: &SyncConfig,
    token: &Option<String>,
    stores: &Stores,
    identity: Arc<SessionIdentity>,
    connectivity: Connectivity,
) -> AgentResult<Outbox> {
    let endpoint = config
        .upload_endpoint
        .as_deref()
        .ok_or("no upload endpoint configured (--endpoint or SIDES_UPLOAD_ENDPOINT)")?;
    let mut uploader = HttpUploader::new(endpoint)?;
    if let Some(token) = token {
        uploader = uploader.with_bearer_token(token.clone());
    }
    Ok(Outbox::new(
        stores.queue.clone(),
        identity,
        Arc::new(uploader),
        connectivity,
        config.outbox_config(),
    ))
}

fn build_worker(stores: &Stores, connectivity: Connectivity) -> OfflineWorker {
    OfflineWorker::new(
        stores.cache.clone(),
        Arc::new(HttpFetcher::new()),
        Arc::new(HeadlessPlatform::new(false, false)),
        Arc::new(WakeChannel::default()),
        connectivity,
    )
}

fn print_install(summary: &InstallSummary) {
    use sides_sync::cache::registration::UpdateOutcome;
    match summary.update {
        UpdateOutcome::Unchanged => println!("generation unchanged"),
        UpdateOutcome::Activated(ref installed, ref activated) => println!(
            "{} active: {} cached, {} skipped, removed {:?}",
            installed.generation,
            installed.cached(),
            installed.skipped(),
            activated.removed_generations
        ),
        UpdateOutcome::Waiting(ref installed) => println!(
            "{} waiting: {} cached, {} skipped",
            installed.generation,
            installed.cached(),
            installed.skipped()
        ),
    }
    println!("background wake: {}", summary.wake);
}
