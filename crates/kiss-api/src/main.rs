//! Messaging gateway: receives inbound webhooks, dispatches them, and
//! exposes the admin/operational HTTP surface (§6.3, §6.7).

mod worker;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use kiss_core::config::Config;
use kiss_core::dedup::Deduplicator;
use kiss_core::kv::{DualKv, KvStore, SqliteKv};
use kiss_core::lock::LockManager;
use kiss_core::ratelimit::RateLimiter;
use kiss_collaborators::outbound::{GatewayConfig, OutboundGateway};
use kiss_collaborators::payments::{PaymentProvider, RestPaymentProvider};
use kiss_collaborators::LoggingChannel;
use kiss_flow::admin::AdminState;
use kiss_flow::blocklist::Blocklist;
use kiss_flow::flow_state::{FlowStateService, NullMirror};
use kiss_flow::history_cache::HistoryCache;
use kiss_flow::rate_limit_middleware::{RateLimitLayer, Tier};
use kiss_flow::webhook::{WebhookState, MESSAGING_QUEUE};
use kiss_queue::worker::{JobHandler, WorkerConfig, WorkerPool};
use kiss_queue::{DeadLetterQueue, JobQueue};
use tracing::info;

use crate::worker::MessagingJobHandler;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    kiss_telemetry::logging::init_logging("kiss-api", "info");

    let config = Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });

    let sqlite_path = expand_home(&config.kv.sqlite_path);
    std::fs::create_dir_all(sqlite_path.parent().unwrap_or(std::path::Path::new("."))).ok();
    let sqlite = SqliteKv::open(&sqlite_path)
        .await
        .with_context(|| format!("failed to open KV store at {}", sqlite_path.display()))?;
    let kv: Arc<dyn KvStore> = Arc::new(DualKv::new(sqlite));

    let queue = Arc::new(JobQueue::new(kv.clone()));
    let blocklist = Arc::new(Blocklist::new(kv.clone(), vec![]));
    let history = Arc::new(HistoryCache::new(10_000, 50, None, "default"));
    let events = kiss_flow::event_bus::EventBus::new();

    let mut payment_providers: HashMap<String, Arc<dyn PaymentProvider>> = HashMap::new();
    for provider_cfg in &config.payments.providers {
        let provider = RestPaymentProvider::new(
            provider_cfg.name.clone(),
            provider_cfg.base_url.clone(),
            provider_cfg.api_key.clone().unwrap_or_default(),
            provider_cfg.webhook_secret.clone().unwrap_or_default(),
        );
        payment_providers.insert(provider_cfg.name.clone(), Arc::new(provider));
    }

    let webhook_state = Arc::new(WebhookState {
        dedup: Deduplicator::new(kv.clone()),
        queue: queue.clone(),
        blocklist: blocklist.clone(),
        payment_providers,
        events: events.clone(),
    });

    let admin_state = Arc::new(AdminState {
        queue: queue.clone(),
        dlq: DeadLetterQueue::new(kv.clone(), queue.clone()),
        blocklist: blocklist.clone(),
        history: history.clone(),
        admin_token: config.admin.token.clone(),
        queues: vec![config.queue.default_queue_name.clone(), MESSAGING_QUEUE.to_string()],
    });

    let limiter = Arc::new(RateLimiter::new(kv.clone()));
    let rate_limit = RateLimitLayer::new(limiter, Tier::per_second(200), Tier::per_second(20), Tier::per_second(50));

    let app = kiss_flow::app(webhook_state, admin_state, rate_limit, config.admin.token.clone());

    let timezone = chrono_tz::Tz::from_str(&config.timezone.name).unwrap_or(chrono_tz::UTC);
    let mut outbound = OutboundGateway::new(queue.clone(), kv.clone(), GatewayConfig::default());
    for channel_name in ["sms", "whatsapp", "messenger", "email"] {
        outbound.register_channel(Arc::new(LoggingChannel::new(channel_name)));
    }
    let outbound = Arc::new(outbound);

    let messaging_handler: Arc<dyn JobHandler> = Arc::new(MessagingJobHandler {
        flow_states: Arc::new(FlowStateService::new(kv.clone(), Arc::new(NullMirror))),
        history,
        blocklist: blocklist.clone(),
        outbound,
        events,
        timezone,
    });

    let worker_pool = Arc::new(WorkerPool::new(
        queue.clone(),
        Arc::new(DeadLetterQueue::new(kv.clone(), queue.clone())),
        Arc::new(LockManager::new(kv.clone())),
        Arc::new(kiss_telemetry::metrics::MetricsCollector::new()),
        WorkerConfig {
            concurrency: config.queue.concurrency,
            ..Default::default()
        },
    ));
    let shutdown = kiss_harness::shutdown::ShutdownSignal::new();
    let worker_handles = worker_pool.spawn(MESSAGING_QUEUE, messaging_handler, shutdown.subscribe());

    let addr = std::env::var("KISS_API_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "kiss-api listening");

    tokio::select! {
        result = axum::serve(listener, app) => result.context("server error")?,
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            shutdown.trigger();
        }
    }
    for handle in worker_handles {
        let _ = handle.await;
    }
    Ok(())
}

fn expand_home(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    std::path::PathBuf::from(path)
}
