//! §6.5 Registry — read-through detector configuration.
//!
//! Consumers read the latest snapshot via [`DetectorRegistry::snapshot`];
//! a background task periodically calls [`DetectorRegistry::refresh`] to
//! re-read the source. If the source is unreachable, the previous snapshot
//! (or the baked-in defaults on first boot) is kept rather than surfaced as
//! an error — resilience over freshness, as in §6.5.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use kiss_api_types::DetectorSpec;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry source unavailable: {0}")]
    SourceUnavailable(String),
}

/// Where detector configuration actually lives. Production wires this to a
/// config table or file watch; tests use [`StaticSource`].
#[async_trait]
pub trait RegistrySource: Send + Sync {
    async fn load(&self) -> Result<Vec<DetectorSpec>, RegistryError>;
}

pub struct StaticSource(pub Vec<DetectorSpec>);

#[async_trait]
impl RegistrySource for StaticSource {
    async fn load(&self) -> Result<Vec<DetectorSpec>, RegistryError> {
        Ok(self.0.clone())
    }
}

pub struct DetectorRegistry {
    source: Arc<dyn RegistrySource>,
    snapshot: RwLock<Vec<DetectorSpec>>,
}

impl DetectorRegistry {
    pub fn new(defaults: Vec<DetectorSpec>, source: Arc<dyn RegistrySource>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(defaults),
        }
    }

    pub async fn snapshot(&self) -> Vec<DetectorSpec> {
        self.snapshot.read().await.clone()
    }

    pub async fn active(&self) -> Vec<DetectorSpec> {
        self.snapshot.read().await.iter().filter(|d| d.is_active).cloned().collect()
    }

    /// Re-read the source and replace the snapshot. On failure, logs and
    /// keeps serving the prior snapshot.
    pub async fn refresh(&self) {
        match self.source.load().await {
            Ok(specs) => {
                *self.snapshot.write().await = specs;
            }
            Err(e) => {
                tracing::warn!(error = %e, "detector registry refresh failed, keeping prior snapshot");
            }
        }
    }

    pub async fn run_refresh_loop(self: Arc<Self>, interval: Duration, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("detector registry refresh loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.refresh().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiss_api_types::{DetectorOutputType, RunStatus};

    fn spec(id: &str, active: bool) -> DetectorSpec {
        DetectorSpec {
            detector_id: id.to_string(),
            category: "billing".to_string(),
            input_data_products: vec![],
            schedule: "0 */5 * * * *".to_string(),
            thresholds: serde_json::json!({}),
            output_type: DetectorOutputType::Alert,
            cooldown_hours: 6,
            max_alerts_per_day: 10,
            is_active: active,
            last_run_id: None,
            last_run_status: None::<RunStatus>,
        }
    }

    #[tokio::test]
    async fn refresh_replaces_snapshot() {
        let registry = DetectorRegistry::new(vec![spec("a", true)], Arc::new(StaticSource(vec![spec("a", true), spec("b", false)])));
        assert_eq!(registry.snapshot().await.len(), 1);
        registry.refresh().await;
        assert_eq!(registry.snapshot().await.len(), 2);
        assert_eq!(registry.active().await.len(), 1);
    }

    struct FailingSource;
    #[async_trait]
    impl RegistrySource for FailingSource {
        async fn load(&self) -> Result<Vec<DetectorSpec>, RegistryError> {
            Err(RegistryError::SourceUnavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn refresh_keeps_prior_snapshot_on_failure() {
        let registry = DetectorRegistry::new(vec![spec("a", true)], Arc::new(FailingSource));
        registry.refresh().await;
        assert_eq!(registry.snapshot().await.len(), 1);
    }
}
