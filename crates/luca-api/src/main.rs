//! Intelligence service: detector scheduling and execution (C11/C12), case
//! lifecycle, and action governance (C13/C14).

mod intelligence_api;
mod stores;
mod two_factor;
mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use kiss_cases::action_bus::ActionBus;
use kiss_core::config::Config;
use kiss_core::kv::{DualKv, KvStore, SqliteKv};
use kiss_core::lock::LockManager;
use kiss_core::ratelimit::RateLimiter;
use kiss_detect::{Detector, DetectorRegistry, DetectorRunner, DetectorScheduler, SchedulerConfig, StaticSource};
use kiss_queue::worker::{JobHandler, WorkerConfig, WorkerPool};
use tracing::info;

use crate::intelligence_api::{router, IntelligenceState};
use crate::stores::{KvAlertStore, KvCaseStore, KvFindingStore, KvRunStore};
use crate::two_factor::SharedCodeVerifier;
use crate::worker::DetectorsJobHandler;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    kiss_telemetry::logging::init_logging("luca-api", "info");

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

    let queue = Arc::new(kiss_queue::JobQueue::new(kv.clone()));

    let registry = Arc::new(DetectorRegistry::new(
        vec![],
        Arc::new(StaticSource(vec![])),
    ));

    let scheduler = Arc::new(
        DetectorScheduler::new(
            registry.clone(),
            queue.clone(),
            RateLimiter::new(kv.clone()),
            SchedulerConfig {
                timezone: config.timezone.name.clone(),
                max_starts_per_minute: config.detectors.starts_per_minute,
                ..Default::default()
            },
        )
        .context("failed to construct detector scheduler")?,
    );

    let cases = Arc::new(KvCaseStore(kv.clone()));
    let two_factor = Arc::new(SharedCodeVerifier::new(std::env::var("KISS_2FA_CODE").ok()));
    let mut action_bus = ActionBus::new(kv.clone(), two_factor);
    register_action_types(&mut action_bus);
    let actions = Arc::new(action_bus);

    let state = Arc::new(IntelligenceState {
        scheduler: scheduler.clone(),
        actions,
        cases,
        events: kiss_flow::event_bus::EventBus::new(),
    });

    let runner = Arc::new(DetectorRunner::new(
        Arc::new(KvRunStore(kv.clone())),
        Arc::new(KvFindingStore(kv.clone())),
        Arc::new(KvAlertStore(kv.clone())),
        Arc::new(KvCaseStore(kv.clone())),
        RateLimiter::new(kv.clone()),
    ));
    // No concrete detectors ship by default (see DESIGN.md); operators
    // register implementations here as they're built.
    let detectors: HashMap<String, Arc<dyn Detector>> = HashMap::new();
    let detectors_handler: Arc<dyn JobHandler> = Arc::new(DetectorsJobHandler { runner, detectors });

    let worker_pool = Arc::new(WorkerPool::new(
        queue.clone(),
        Arc::new(kiss_queue::DeadLetterQueue::new(kv.clone(), queue.clone())),
        Arc::new(LockManager::new(kv.clone())),
        Arc::new(kiss_telemetry::metrics::MetricsCollector::new()),
        WorkerConfig {
            concurrency: config.detectors.concurrency_cap,
            ..Default::default()
        },
    ));

    let shutdown = kiss_harness::shutdown::ShutdownSignal::new();
    tokio::spawn(scheduler.clone().run_loop(shutdown.subscribe()));
    tokio::spawn(registry.clone().run_refresh_loop(std::time::Duration::from_secs(60), shutdown.subscribe()));
    let worker_handles = worker_pool.spawn(kiss_detect::DETECTORS_QUEUE, detectors_handler, shutdown.subscribe());

    let app = router(state);
    let addr = std::env::var("LUCA_API_ADDR").unwrap_or_else(|_| "0.0.0.0:8081".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "luca-api listening");

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

/// Action types recognized by the governance pipeline. Handlers are left
/// unregistered until a collaborator (CRM/payments) executor is wired in;
/// an unregistered handler fails the action safely rather than erroring the
/// request (§4.14).
fn register_action_types(bus: &mut ActionBus) {
    use kiss_api_types::AutonomyLevel;
    use kiss_cases::action_bus::ActionConfig;
    use std::time::Duration;

    bus.register_type(ActionConfig {
        action_type: "send_refund".to_string(),
        autonomy_level: AutonomyLevel::Approval,
        handler: "payments".to_string(),
        max_per_hour: Some(20),
        max_per_day: Some(100),
        ttl: Duration::from_secs(24 * 3600),
    });
    bus.register_type(ActionConfig {
        action_type: "send_message".to_string(),
        autonomy_level: AutonomyLevel::Auto,
        handler: "outbound".to_string(),
        max_per_hour: Some(60),
        max_per_day: Some(500),
        ttl: Duration::from_secs(3600),
    });
    bus.register_type(ActionConfig {
        action_type: "cancel_subscription".to_string(),
        autonomy_level: AutonomyLevel::Critical,
        handler: "crm".to_string(),
        max_per_hour: None,
        max_per_day: Some(50),
        ttl: Duration::from_secs(24 * 3600),
    });
}

fn expand_home(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    std::path::PathBuf::from(path)
}
