//! Registry snapshots with background saves and a graceful-shutdown flush.
//!
//! Task metadata lives in memory; the on-disk JSON snapshot exists so a
//! restart picks up where it left off. Record query mechanics beyond
//! load/save stay out of scope.

use crate::config::Config;
use crate::tasks::{SharedStore, Task, TaskStore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::interval;
use tracing::{error, info};

const PERSISTENCE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    tasks: Vec<Task>,
    version: u32,
    saved_at: u64,
}

#[derive(Clone)]
pub struct PersistenceManager {
    config: Config,
}

impl PersistenceManager {
    pub fn new(config: Config) -> Self {
        if let Err(e) = fs::create_dir_all(&config.data_dir) {
            error!("failed to create data directory {:?}: {}", config.data_dir, e);
        }
        Self { config }
    }

    pub fn load_store(&self) -> Result<TaskStore, Box<dyn std::error::Error>> {
        let path = self.config.registry_path();
        if !path.exists() {
            return Ok(TaskStore::new());
        }
        let data = fs::read(&path)?;
        let state: PersistedState = serde_json::from_slice(&data)?;
        info!("loaded {} task(s) from {:?}", state.tasks.len(), path);
        Ok(TaskStore::from_tasks(state.tasks))
    }

    pub fn save_store(&self, store: &TaskStore) -> Result<(), Box<dyn std::error::Error>> {
        let state = PersistedState {
            tasks: store.all(),
            version: PERSISTENCE_VERSION,
            saved_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let data = serde_json::to_vec(&state)?;

        // Write to a temp file first, then rename into place.
        let path = self.config.registry_path();
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &data)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    pub async fn start_background_snapshots(
        &self,
        store: SharedStore,
    ) -> tokio::task::JoinHandle<()> {
        let persistence = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(
                persistence.config.snapshot_interval_secs,
            ));
            loop {
                ticker.tick().await;
                if let Err(e) = persistence.save_store(&store) {
                    error!("background snapshot failed: {}", e);
                }
            }
        })
    }
}

/// Flushes a final snapshot on SIGINT/SIGTERM, then exits.
pub async fn setup_shutdown_handler(persistence: PersistenceManager, store: SharedStore) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                    .expect("Failed to create SIGINT handler");
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to create SIGTERM handler");
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down gracefully...");
        }

        if let Err(e) = persistence.save_store(&store) {
            error!("failed to save final snapshot: {}", e);
        } else {
            info!("final snapshot saved");
        }
        std::process::exit(0);
    });
}

/// True when a snapshot file exists at the registry path.
pub fn snapshot_exists(config: &Config) -> bool {
    Path::new(&config.registry_path()).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::Task;

    #[test]
    fn round_trips_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::new(dir.path());
        let persistence = PersistenceManager::new(cfg.clone());

        let store = TaskStore::new();
        let id = store.insert(Task::new("p1"));
        persistence.save_store(&store).unwrap();
        assert!(snapshot_exists(&cfg));

        let loaded = persistence.load_store().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.get(&id).is_some());
    }

    #[test]
    fn missing_snapshot_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::new(dir.path());
        let persistence = PersistenceManager::new(cfg);
        let store = persistence.load_store().unwrap();
        assert!(store.is_empty());
    }
}
