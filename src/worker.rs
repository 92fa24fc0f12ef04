use crate::config::Config;
use crate::tasks::{PendingAction, SharedStore, TaskStatus, TaskStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("worker queue is full")]
    Full,
    #[error("worker queue is closed")]
    Closed,
}

/// Seam to the external processing pipeline. The pipeline consumes a task
/// identifier and produces status/result updates through the store; what it
/// computes is not this crate's concern.
pub trait PipelineClient: Send + Sync + 'static {
    /// Hands a committed task to the pipeline.
    fn process(&self, store: &TaskStore, config: &Config, id: Uuid);
    /// Hands an imported assets archive to the pipeline.
    fn import(&self, store: &TaskStore, config: &Config, id: Uuid);
}

/// Handle for submitting task ids to the background worker.
///
/// Enqueue is fire-and-forget: callers persist their state transition first
/// and never block on worker completion. A full or closed queue is logged
/// and reported, not rolled back.
pub struct WorkerQueue {
    sender: mpsc::Sender<Uuid>,
}

impl WorkerQueue {
    /// Starts the consumer loop and returns the submission handle.
    pub fn start(
        store: SharedStore,
        config: Config,
        client: Arc<dyn PipelineClient>,
    ) -> Arc<WorkerQueue> {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(run_loop(rx, store, config, client));
        Arc::new(Self { sender: tx })
    }

    /// A queue with no consumer attached; the receiver is handed back so
    /// tests can observe exactly what would have reached the worker.
    pub fn detached() -> (Arc<WorkerQueue>, mpsc::Receiver<Uuid>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (Arc::new(Self { sender: tx }), rx)
    }

    pub fn enqueue(&self, id: Uuid) -> Result<(), EnqueueError> {
        self.sender.try_send(id).map_err(|e| {
            warn!("failed to enqueue task {}: {}", id, e);
            match e {
                mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
            }
        })
    }
}

async fn run_loop(
    mut rx: mpsc::Receiver<Uuid>,
    store: SharedStore,
    config: Config,
    client: Arc<dyn PipelineClient>,
) {
    while let Some(id) = rx.recv().await {
        consume(&store, &config, client.as_ref(), id);
    }
}

/// Consumes a task's pending action exactly once and applies it. Dispatch
/// and consumption happen in one store update so a retried delivery of the
/// same id sees `None` and becomes a no-op.
fn consume(store: &TaskStore, config: &Config, client: &dyn PipelineClient, id: Uuid) {
    let Some((action, partial)) = store.update(&id, |t| {
        let action = std::mem::take(&mut t.pending_action);
        (action, t.partial)
    }) else {
        debug!("worker: task {} disappeared before processing", id);
        return;
    };

    match action {
        PendingAction::Remove => {
            store.remove(&id);
            let dir = config.task_dir(&id);
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!("failed to remove storage for task {}: {}", id, e);
                }
            }
            info!("worker: removed task {}", id);
        }
        PendingAction::Cancel => {
            store.update(&id, |t| {
                t.status = TaskStatus::Canceled;
                t.console.push("Task canceled".to_string());
            });
            info!("worker: canceled task {}", id);
        }
        PendingAction::Restart => {
            store.update(&id, |t| {
                t.status = TaskStatus::Queued;
                t.console.clear();
                t.last_error = None;
            });
            info!("worker: restarting task {}", id);
            client.process(store, config, id);
        }
        PendingAction::Import => {
            client.import(store, config, id);
        }
        PendingAction::Resize | PendingAction::None => {
            // A partial task is still accepting uploads and must never be
            // processed; the controller should not have enqueued it.
            if partial {
                warn!("worker: skipping partial task {}", id);
                return;
            }
            client.process(store, config, id);
        }
    }
}

/// Marks every known selector whose output file exists on disk as
/// available. The pipeline writes results under the task's assets root.
pub fn register_available_assets(store: &TaskStore, config: &Config, id: Uuid) {
    let assets_root = config.assets_dir(&id);
    let found: Vec<String> = crate::assets::known_selectors()
        .iter()
        .filter(|(_, rel)| assets_root.join(rel).is_file())
        .map(|(name, _)| name.to_string())
        .collect();
    store.update(&id, |t| {
        for name in found {
            t.available_assets.insert(name);
        }
        if !t.available_assets.is_empty() {
            t.available_assets.insert("all".to_string());
        }
    });
}

/// Default pipeline client. Marks the hand-off in the console and settles
/// the task, registering whatever outputs exist on disk; a deployment
/// wires a real node client in its place.
pub struct LocalNode;

impl PipelineClient for LocalNode {
    fn process(&self, store: &TaskStore, config: &Config, id: Uuid) {
        store.update(&id, |t| {
            t.status = TaskStatus::Running;
            t.console.push("Processing node accepted task".to_string());
        });
        register_available_assets(store, config, id);
        store.update(&id, |t| {
            t.status = TaskStatus::Completed;
            t.console.push("Processing complete".to_string());
        });
    }

    fn import(&self, store: &TaskStore, config: &Config, id: Uuid) {
        store.update(&id, |t| {
            t.console.push("Importing assets archive".to_string());
        });
        register_available_assets(store, config, id);
        store.update(&id, |t| {
            t.status = TaskStatus::Completed;
            t.console.push("Import complete".to_string());
        });
    }
}
