use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::Database;
use crate::ephemeral::{EphemeralStore, MemoryStore};
use crate::redis_client::RedisClient;
use crate::security::{
    ActionSynchronizer, AdapterRegistry, ConfigStore, ContentFilter, Gatekeeper, HttpPlatformAdapter,
    HttpReputationSink, RateLimiter, ReputationSink, RetryPolicy, SpamDetector, WarningLedger,
};
use crate::settings::Settings;

#[derive(Clone)]
pub struct AppState {
    pub gatekeeper: Gatekeeper,
    pub db: Database,
    pub store: Arc<dyn EphemeralStore>,
    pub metrics: PrometheusHandle,
    pub internal_secret: Arc<str>,
}

/// Collaborators wired into the gatekeeper.
pub struct Components {
    pub db: Database,
    pub store: Arc<dyn EphemeralStore>,
    pub adapters: AdapterRegistry,
    pub reputation: Option<Arc<dyn ReputationSink>>,
    pub policy: RetryPolicy,
    pub internal_secret: String,
}

impl AppState {
    /// Connect the stores and adapters described by `settings`.
    pub async fn new(settings: &Settings, metrics: PrometheusHandle, shutdown: CancellationToken) -> Result<Self> {
        let store: Arc<dyn EphemeralStore> = if settings.redis_url == "memory" {
            info!("using in-process ephemeral store");
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(RedisClient::new(&settings.redis_url).await?)
        };

        let db = Database::new(&settings.database_url)
            .await
            .with_context(|| format!("failed to open database {}", settings.database_url))?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("gatekeeper-server/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        let mut adapters = AdapterRegistry::new();
        for (platform, url) in &settings.platform_adapters {
            info!(platform = %platform, url = %url, "registering platform adapter");
            adapters.register(Arc::new(HttpPlatformAdapter::new(platform, url, http.clone())));
        }

        if adapters.is_empty() {
            warn!("no platform adapters configured; actions are recorded but not synced");
        } else {
            info!(count = adapters.len(), "platform adapters ready");
        }

        let reputation = settings
            .reputation_url
            .as_deref()
            .map(|url| Arc::new(HttpReputationSink::new(url, http.clone())) as Arc<dyn ReputationSink>);

        let components = Components {
            db,
            store,
            adapters,
            reputation,
            policy: settings.retry_policy(),
            internal_secret: settings.server_secret.clone(),
        };
        Ok(Self::from_components(components, metrics, shutdown))
    }

    pub fn from_components(components: Components, metrics: PrometheusHandle, shutdown: CancellationToken) -> Self {
        let Components {
            db,
            store,
            adapters,
            reputation,
            policy,
            internal_secret,
        } = components;

        let synchronizer = ActionSynchronizer::new(adapters, store.clone(), db.clone(), policy, shutdown);
        let gatekeeper = Gatekeeper::new(
            ConfigStore::new(db.clone()),
            RateLimiter::new(store.clone()),
            SpamDetector::new(store.clone()),
            ContentFilter::new(db.clone()),
            WarningLedger::new(db.clone()),
            synchronizer,
            reputation,
        );

        Self {
            gatekeeper,
            db,
            store,
            metrics,
            internal_secret: internal_secret.into(),
        }
    }
}
