use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use omnigate_common::{GatewayConfig, GatewayConfigPatch};
use omnigate_dispatch::client::ClientPool;
use omnigate_dispatch::{Dispatcher, DispatcherConfig};
use omnigate_health::{HealthConfig, HealthManager};
use omnigate_nodes::{NodeRegistry, TunnelManager, sweep_once};
use omnigate_router::AppState;
use omnigate_scheduler::{Schedule, Scheduler};
use omnigate_storage::GatewayStorage;
use omnigate_tasks::{PollerConfig, VideoTaskPoller};
use omnigate_telemetry::writer::LogLevel;
use omnigate_telemetry::{
    DirectTelemetryWriter, QueueTelemetryWriter, TelemetryWriter, UsageQueueConsumer,
};
use omnigate_transform::{GeminiCliEnvelope, UrlPool, VariantHook};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = cli::Cli::parse();
    match args.command.clone() {
        Some(cli::Command::GenerateSecret { bytes }) => {
            println!("{}", generate_secret(bytes));
            Ok(())
        }
        Some(cli::Command::Serve) | None => serve(args).await,
    }
}

fn generate_secret(bytes: usize) -> String {
    let mut buffer = vec![0u8; bytes.clamp(16, 128)];
    rand::rng().fill_bytes(&mut buffer);
    buffer.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn hash_admin_key(plain: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plain.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

async fn serve(args: cli::Cli) -> Result<()> {
    let dsn = args
        .dsn
        .clone()
        .filter(|dsn| !dsn.trim().is_empty())
        .context("OMNIGATE_DSN is required")?;

    let connection = omnigate_storage::connect_shared(&dsn)
        .await
        .context("connect storage")?;
    let storage = GatewayStorage::new(connection);
    storage.sync_schema().await.context("schema sync")?;

    // Merge config: CLI/ENV (clap already applied CLI > ENV) over defaults.
    let admin_key_hash = match args.admin_key.as_deref() {
        Some(plain) => hash_admin_key(plain),
        None => {
            let plain = generate_secret(32);
            eprintln!("generated admin key: {plain}");
            hash_admin_key(&plain)
        }
    };
    let mut patch = GatewayConfigPatch {
        dsn: Some(dsn),
        admin_key_hash: Some(admin_key_hash),
        ..Default::default()
    };
    patch.overlay(GatewayConfigPatch {
        host: args.host.clone(),
        port: args.port,
        redis_url: args.redis_url.clone(),
        proxy: args.proxy.clone(),
        timezone: args.timezone.clone(),
        strict_billing: args.strict_billing,
        ..Default::default()
    });
    let config: GatewayConfig = patch.into_config().context("finalize gateway config")?;

    // Redis: usage stream + advisory locks. Absent → direct telemetry.
    let redis = match &config.redis_url {
        Some(url) => match redis::Client::open(url.as_str()) {
            Ok(client) => match redis::aio::ConnectionManager::new(client).await {
                Ok(manager) => Some(manager),
                Err(err) => {
                    warn!(error = %err, "redis unavailable, falling back to direct telemetry");
                    None
                }
            },
            Err(err) => {
                warn!(error = %err, "invalid redis url, falling back to direct telemetry");
                None
            }
        },
        None => None,
    };

    let telemetry: Arc<dyn TelemetryWriter> = match &redis {
        Some(manager) => Arc::new(QueueTelemetryWriter::new(
            manager.clone(),
            config.usage_queue.clone(),
            LogLevel::Basic,
            config.max_request_body_bytes,
            config.max_response_body_bytes,
        )),
        None => Arc::new(DirectTelemetryWriter::new(storage.clone())),
    };
    if let Some(manager) = &redis {
        UsageQueueConsumer::new(storage.clone(), manager.clone(), config.usage_queue.clone())
            .spawn();
    }

    let health = Arc::new(HealthManager::new(storage.clone(), HealthConfig::default()));
    let clients = Arc::new(ClientPool::new());

    let mut hooks: HashMap<String, Arc<dyn VariantHook>> = HashMap::new();
    hooks.insert(
        "gemini_cli".to_string(),
        Arc::new(GeminiCliEnvelope::new(
            std::env::var("OMNIGATE_GEMINI_CLI_PROJECT").unwrap_or_default(),
            UrlPool::new(
                vec![
                    "https://cloudcode-pa.googleapis.com".to_string(),
                    "https://daily-cloudcode-pa.sandbox.googleapis.com".to_string(),
                ],
                Duration::from_secs(300),
            ),
        )),
    );

    let dispatcher = Arc::new(Dispatcher::new(
        storage.clone(),
        health.clone(),
        telemetry,
        clients.clone(),
        hooks,
        DispatcherConfig {
            strict_billing: config.strict_billing,
            ..Default::default()
        },
    ));

    let tunnels = Arc::new(TunnelManager::new());
    let nodes = Arc::new(NodeRegistry::new(storage.clone(), tunnels.clone()));

    // Background jobs share one scheduler; singleton jobs take an advisory
    // lock themselves.
    let scheduler = Arc::new(Scheduler::new(&config.timezone));
    register_jobs(
        &scheduler,
        &storage,
        &clients,
        redis.clone(),
        &tunnels,
        &config,
    );

    let state = AppState {
        dispatcher,
        storage,
        nodes,
        key_limiter: Arc::new(omnigate_dispatch::KeyLimiter::new()),
    };
    let app = omnigate_router::gateway_router(state);

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(%bind, "omnigate listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn register_jobs(
    scheduler: &Arc<Scheduler>,
    storage: &GatewayStorage,
    clients: &Arc<ClientPool>,
    redis: Option<redis::aio::ConnectionManager>,
    tunnels: &Arc<TunnelManager>,
    config: &GatewayConfig,
) {
    // Video job poller.
    let poller = Arc::new(VideoTaskPoller::new(
        storage.clone(),
        clients.clone(),
        redis,
        PollerConfig {
            strict_billing: config.strict_billing,
            ..Default::default()
        },
    ));
    scheduler.register(
        "video-task-poller",
        "poll async video jobs",
        Schedule::Interval(Duration::from_secs(10)),
        Arc::new(move || {
            let poller = poller.clone();
            Box::pin(async move { poller.tick().await })
        }),
    );

    // Retention tiers.
    let retention_storage = storage.clone();
    let retention = config.retention;
    scheduler.register(
        "usage-retention",
        "usage retention tiers",
        Schedule::cron("0 0 4 * * * *")
            .unwrap_or(Schedule::Interval(Duration::from_secs(24 * 3600))),
        Arc::new(move || {
            let storage = retention_storage.clone();
            Box::pin(async move {
                if let Err(err) = storage.run_retention(&retention).await {
                    warn!(error = %err, "usage retention run failed");
                }
            })
        }),
    );

    // Daily aggregation with bounded misfire backfill.
    let aggregate_storage = storage.clone();
    scheduler.register(
        "daily-aggregation",
        "aggregate daily usage",
        Schedule::cron("0 30 0 * * * *")
            .unwrap_or(Schedule::Interval(Duration::from_secs(24 * 3600))),
        Arc::new(move || {
            let storage = aggregate_storage.clone();
            Box::pin(async move {
                let yesterday = time::OffsetDateTime::now_utc().date()
                    - time::Duration::days(1);
                if let Err(err) = storage.aggregate_day(yesterday, true).await {
                    warn!(error = %err, "daily aggregation failed");
                }
                if let Err(err) = storage.backfill_incomplete_days(7).await {
                    warn!(error = %err, "aggregation backfill failed");
                }
            })
        }),
    );

    // Pending-request reaper.
    let reaper_storage = storage.clone();
    scheduler.register(
        "pending-request-reaper",
        "reap stuck usage rows",
        Schedule::Interval(Duration::from_secs(300)),
        Arc::new(move || {
            let storage = reaper_storage.clone();
            Box::pin(async move {
                match storage.reap_stuck_requests(1800).await {
                    Ok(0) => {}
                    Ok(reaped) => info!(reaped, "reaped stuck usage rows"),
                    Err(err) => warn!(error = %err, "request reaper failed"),
                }
            })
        }),
    );

    // Proxy node health sweep.
    let sweep_storage = storage.clone();
    let sweep_tunnels = tunnels.clone();
    scheduler.register(
        "proxy-node-sweeper",
        "sweep proxy node health",
        Schedule::Interval(Duration::from_secs(60)),
        Arc::new(move || {
            let storage = sweep_storage.clone();
            let tunnels = sweep_tunnels.clone();
            Box::pin(async move {
                if let Err(err) = sweep_once(&storage, &tunnels, 7).await {
                    warn!(error = %err, "proxy node sweep failed");
                }
            })
        }),
    );

    // Keep the scheduler alive for the process lifetime.
    std::mem::forget(scheduler.clone());
}
