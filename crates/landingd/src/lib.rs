//! landingd - task finalize and PR reconciliation daemon
//!
//! Library components for the daemon process.

pub mod ci;
pub mod executor;
pub mod finalize;
pub mod git;
pub mod github;
pub mod poller;
pub mod projects;
pub mod publisher;
pub mod server;
pub mod storage;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use finalize::{FinalizeTracker, FinalizeTrigger};
use github::GhPrClient;
use landing_core::config::{ConfigError, WORKSPACE_CONFIG_PATH};
use landing_core::{Config, Event, PrStatus, Task};
use poller::{PrPoller, StatusListener};
use projects::{Project, ProjectRegistry};
use publisher::{Broadcaster, EventPublisher};
use storage::{MemoryStore, SqliteStore, StorageError, TaskStore};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Id of the daemon's own workspace.
pub const DEFAULT_PROJECT: &str = "default";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("config error in {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("HTTP server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// HTTP server port (default: 7710).
    pub port: u16,
    /// Bearer token for the HTTP API.
    pub auth_token: Option<String>,
    /// Default project workspace.
    pub workspace_root: PathBuf,
    /// Config file applied on top of `<workspace>/.landing/config`.
    pub config_path: Option<PathBuf>,
    /// `key=value` overrides applied last.
    pub overrides: Vec<(String, String)>,
    /// Additional projects as (id, workspace root).
    pub projects: Vec<(String, PathBuf)>,
    /// Keep tasks in memory only.
    pub ephemeral: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: 7710,
            auth_token: std::env::var("LANDINGD_AUTH_TOKEN").ok(),
            workspace_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config_path: None,
            overrides: Vec::new(),
            projects: Vec::new(),
            ephemeral: false,
        }
    }
}

/// Get the default database path (~/.local/share/landingd/landingd.db).
fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("landingd").join("landingd.db")
}

/// Publishes `task_updated` for every PR status change and starts finalize
/// when a PR becomes approved.
#[derive(Clone)]
pub struct ApprovalListener {
    trigger: FinalizeTrigger,
    publisher: Arc<dyn EventPublisher>,
}

impl std::fmt::Debug for ApprovalListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalListener")
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

impl ApprovalListener {
    pub fn new(trigger: FinalizeTrigger, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { trigger, publisher }
    }
}

#[async_trait]
impl StatusListener for ApprovalListener {
    async fn on_status_change(&self, project_id: &str, task: &Task) {
        self.publisher.publish(Event::task_updated(task));

        if task.pr_status() != PrStatus::Approved {
            return;
        }
        match self.trigger.trigger_on_approval(&task.id, project_id).await {
            Ok(true) => {}
            Ok(false) => debug!(task_id = %task.id, "approval did not trigger finalize"),
            Err(e) => error!(task_id = %task.id, error = %e, "failed to auto-trigger finalize"),
        }
    }
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    token: CancellationToken,
    broadcaster: Arc<Broadcaster>,
    trigger: FinalizeTrigger,
    poller: Arc<PrPoller>,
}

impl Daemon {
    /// Create a new daemon with the given configuration.
    pub async fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let broadcaster = Arc::new(Broadcaster::default());
        let publisher = Arc::clone(&broadcaster) as Arc<dyn EventPublisher>;

        let store: Arc<dyn TaskStore> = if config.ephemeral {
            Arc::new(MemoryStore::new())
        } else {
            let store = SqliteStore::new(&config.db_path).await?;
            store.migrate_embedded().await?;
            Arc::new(store)
        };
        let default = Project::open(
            DEFAULT_PROJECT,
            config.workspace_root.clone(),
            load_project_config(&config, &config.workspace_root, config.config_path.as_deref())?,
            store,
            Arc::clone(&publisher),
        );

        let mut registry = ProjectRegistry::new(default);
        for (id, root) in &config.projects {
            let store: Arc<dyn TaskStore> = if config.ephemeral {
                Arc::new(MemoryStore::new())
            } else {
                let store = SqliteStore::new(&root.join(".landing/landingd.db")).await?;
                store.migrate_embedded().await?;
                Arc::new(store)
            };
            let project_config = load_project_config(&config, root, None)?;
            registry = registry.with_project(Project::open(
                id.clone(),
                root.clone(),
                project_config,
                store,
                Arc::clone(&publisher),
            ));
        }
        let registry = Arc::new(registry);

        let token = CancellationToken::new();
        let trigger = FinalizeTrigger::new(
            Arc::clone(&registry),
            Arc::new(FinalizeTracker::new()),
            Arc::clone(&publisher),
            token.clone(),
        );
        let listener = ApprovalListener::new(trigger.clone(), Arc::clone(&publisher));
        let poller = PrPoller::new(registry, Arc::new(GhPrClient::new()), publisher)
            .with_listener(Arc::new(listener));

        Ok(Self {
            config,
            token,
            broadcaster,
            trigger,
            poller: Arc::new(poller),
        })
    }

    pub fn trigger(&self) -> &FinalizeTrigger {
        &self.trigger
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Run until shutdown: tracker cleanup, PR poller and the HTTP server.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let default = self.trigger.projects().default_project();
        info!("landingd starting on port {}", self.config.port);
        info!("workspace: {}", default.work_dir.display());
        if self.config.ephemeral {
            info!("database: in-memory");
        } else {
            info!("database: {}", self.config.db_path.display());
        }
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }
        info!("PR poll interval: {}s", self.poller.interval().as_secs());

        self.prune_worktrees().await;

        let cleanup = self.trigger.tracker().start_cleanup(
            self.token.clone(),
            default.config.finalize_cleanup_interval(),
            default.config.finalize_retention(),
        );
        self.poller.start(self.token.clone());

        let state = Arc::new(server::AppState {
            trigger: self.trigger.clone(),
            broadcaster: Arc::clone(&self.broadcaster),
            auth_token: self.config.auth_token.clone(),
        });
        let result = server::start_server(state, self.config.port, self.token.clone()).await;

        self.shutdown();
        if let Err(e) = cleanup.await {
            warn!(error = %e, "finalize cleanup task failed");
        }
        self.poller.join().await;
        info!("landingd stopped");
        result.map_err(DaemonError::from)
    }

    /// Cancel every in-flight finalize run and stop background loops.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.token.is_cancelled() {
            return;
        }
        info!("shutting down");
        self.token.cancel();
        let cancelled = self.trigger.tracker().cancel_all();
        if cancelled > 0 {
            info!(cancelled, "cancelled in-flight finalize runs");
        }
        self.poller.stop();
    }

    /// Drop git's bookkeeping for worktrees deleted out from under it.
    async fn prune_worktrees(&self) {
        for project in self.trigger.projects().all() {
            if !project.work_dir.join(".git").exists() {
                continue;
            }
            if let Err(e) = git::prune_worktrees(&project.work_dir).await {
                warn!(project = %project.id, error = %e, "failed to prune stale worktrees");
            }
        }
    }
}

/// Workspace config, then the explicit file, then command-line overrides.
fn load_project_config(
    daemon: &DaemonConfig,
    root: &Path,
    explicit: Option<&Path>,
) -> Result<Config, DaemonError> {
    let path = explicit.map_or_else(|| root.join(WORKSPACE_CONFIG_PATH), Path::to_path_buf);
    let config_error = |source| DaemonError::Config {
        path: path.clone(),
        source,
    };
    let mut config = Config::load(root, explicit).map_err(config_error)?;
    for (key, value) in &daemon.overrides {
        config.apply_value(key, value).map_err(config_error)?;
    }
    config.resolve_paths(root);
    Ok(config)
}
