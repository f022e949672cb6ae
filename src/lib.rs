//! EMSTrack synchronization engine
//!
//! Keeps a retained-message bus consistent with the EMS entity store:
//! - Outbound publisher republishing every committed change
//! - Per-principal sessions that seed visible state and apply inbound commands
//! - Permission resolution from profile grants
//! - Call-scoped ambulance history

pub mod error;
pub mod events;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_helpers;

use anyhow::{Context, Result};
use events::{MessageBus, QoS};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use store::{EntityStore, Principal};
use sync::{
    CommandProcessor, HistoryResolver, OutboundPublisher, PermissionResolver, Seeder, Session,
    SessionConfig, SessionHandle,
};

// ============================================================================
// YAML config structs (deserialization targets)
// ============================================================================

/// Top-level YAML configuration file structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub bus: BusYamlConfig,
    pub sync: SyncYamlConfig,
    /// YAML store snapshot loaded at startup
    pub fixtures: Option<String>,
    /// Sessions run by `serve`
    pub principals: Vec<PrincipalConfig>,
}

/// Bus configuration section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusYamlConfig {
    /// NATS server; when absent the in-process bus is used
    pub nats_url: Option<String>,
    pub bucket: String,
    pub subject_prefix: String,
}

impl Default for BusYamlConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            bucket: "emstrack-retained".into(),
            subject_prefix: "emstrack".into(),
        }
    }
}

/// Synchronization section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncYamlConfig {
    pub default_qos: u8,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for SyncYamlConfig {
    fn default() -> Self {
        Self {
            default_qos: 1,
            reconnect_min_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrincipalConfig {
    pub username: String,
    #[serde(default)]
    pub admin: bool,
}

// ============================================================================
// Runtime config (what the application actually uses)
// ============================================================================

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub nats_url: Option<String>,
    pub bucket: String,
    pub subject_prefix: String,
    pub default_qos: QoS,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub fixtures: Option<PathBuf>,
    pub principals: Vec<Principal>,
}

impl Config {
    /// Load configuration from environment variables only.
    /// Equivalent to from_yaml_and_env(None).
    pub fn from_env() -> Result<Self> {
        Self::from_yaml_and_env(None)
    }

    /// Load configuration from an optional YAML file, then override with env vars.
    ///
    /// Priority: env var > YAML > default
    ///
    /// If `yaml_path` is None, tries "config.yaml" in CWD. If the file doesn't
    /// exist, falls back to pure env var / defaults.
    pub fn from_yaml_and_env(yaml_path: Option<&Path>) -> Result<Self> {
        let yaml = Self::load_yaml(yaml_path);

        let qos_level = env_number("SYNC_DEFAULT_QOS")?.unwrap_or(yaml.sync.default_qos);
        let default_qos = QoS::try_from(qos_level).map_err(anyhow::Error::msg)?;

        let reconnect_min_ms =
            env_number("SYNC_RECONNECT_MIN_MS")?.unwrap_or(yaml.sync.reconnect_min_ms);
        let reconnect_max_ms =
            env_number("SYNC_RECONNECT_MAX_MS")?.unwrap_or(yaml.sync.reconnect_max_ms);
        if reconnect_min_ms == 0 || reconnect_min_ms > reconnect_max_ms {
            anyhow::bail!(
                "reconnect backoff must satisfy 0 < min ({}) <= max ({})",
                reconnect_min_ms,
                reconnect_max_ms
            );
        }

        Ok(Self {
            nats_url: std::env::var("NATS_URL").ok().or(yaml.bus.nats_url),
            bucket: std::env::var("SYNC_BUCKET").unwrap_or(yaml.bus.bucket),
            subject_prefix: std::env::var("SYNC_SUBJECT_PREFIX").unwrap_or(yaml.bus.subject_prefix),
            default_qos,
            reconnect_min_ms,
            reconnect_max_ms,
            fixtures: std::env::var("SYNC_FIXTURES")
                .ok()
                .or(yaml.fixtures)
                .map(PathBuf::from),
            principals: yaml
                .principals
                .into_iter()
                .map(|p| Principal {
                    username: p.username,
                    is_admin: p.admin,
                })
                .collect(),
        })
    }

    /// Try to load and parse a YAML config file. Returns defaults on any failure.
    fn load_yaml(yaml_path: Option<&Path>) -> YamlConfig {
        let default_path = Path::new("config.yaml");
        let path = yaml_path.unwrap_or(default_path);

        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    YamlConfig::default()
                }
            },
            Err(_) => {
                tracing::debug!(
                    "No config file at {}, using env vars / defaults",
                    path.display()
                );
                YamlConfig::default()
            }
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            qos: self.default_qos,
            reconnect_min: Duration::from_millis(self.reconnect_min_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
        }
    }
}

/// Numeric env override; unset is `None`, unparsable is an error
fn env_number<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{} is not a valid number: {}", name, value)),
        Err(_) => Ok(None),
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Store, bus and the components wired between them.
///
/// Starting the engine registers the outbound publisher with the store;
/// sessions are opened per principal with [`SyncEngine::connect`].
///
/// ```
/// # tokio_test::block_on(async {
/// use emstrack_sync::{events::MemoryBus, store::MemoryStore, sync::SessionConfig, SyncEngine};
/// use std::sync::Arc;
///
/// let engine = SyncEngine::start(
///     Arc::new(MemoryStore::new()),
///     Arc::new(MemoryBus::new()),
///     SessionConfig::default(),
/// );
/// engine.wait_idle().await;
/// engine.shutdown().await;
/// # });
/// ```
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn EntityStore>,
    bus: Arc<dyn MessageBus>,
    permissions: PermissionResolver,
    publisher: Arc<OutboundPublisher>,
    seeder: Seeder,
    history: HistoryResolver,
    session_config: SessionConfig,
}

impl SyncEngine {
    /// Spawn the outbound publisher and register it with the store.
    /// Must be called inside a Tokio runtime.
    pub fn start(
        store: Arc<dyn EntityStore>,
        bus: Arc<dyn MessageBus>,
        session_config: SessionConfig,
    ) -> Self {
        let permissions = PermissionResolver::new(store.clone());
        let publisher = OutboundPublisher::spawn(
            store.clone(),
            bus.clone(),
            session_config.qos,
            session_config.reconnect_min,
        );
        store.on_change(publisher.clone());

        let seeder = Seeder::new(
            store.clone(),
            bus.clone(),
            permissions.clone(),
            session_config.qos,
        )
        .with_gate(publisher.gate());
        let history = HistoryResolver::new(store.clone(), permissions.clone());

        Self {
            store,
            bus,
            permissions,
            publisher,
            seeder,
            history,
            session_config,
        }
    }

    /// Open a session for an authenticated principal
    pub fn connect(&self, principal: Principal) -> SessionHandle {
        let processor =
            CommandProcessor::new(principal, self.store.clone(), self.permissions.clone());
        Session::new(
            self.bus.clone(),
            self.seeder.clone(),
            processor,
            self.session_config.clone(),
        )
        .spawn()
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn permissions(&self) -> &PermissionResolver {
        &self.permissions
    }

    pub fn seeder(&self) -> &Seeder {
        &self.seeder
    }

    pub fn history(&self) -> &HistoryResolver {
        &self.history
    }

    /// Wait until every committed change has been published
    pub async fn wait_idle(&self) {
        self.publisher.wait_idle().await;
    }

    /// Stop the outbound publisher. Open sessions are closed by their handles.
    pub async fn shutdown(&self) {
        self.publisher.shutdown().await;
    }
}

// ============================================================================
// Tests
// ============================================================================
