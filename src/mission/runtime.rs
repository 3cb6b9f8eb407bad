//! Fire-and-forget mission triggering.
//!
//! Job creation enqueues onto a bounded in-process task set: one controller
//! task per job, capped by a semaphore so a burst of triggers cannot stampede
//! the container host. Shutdown is cooperative via a cancellation token.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::controller::MissionController;

/// Default cap on concurrently running controllers.
pub const DEFAULT_MAX_CONCURRENT_MISSIONS: usize = 4;

pub struct MissionRuntime {
    controller: Arc<MissionController>,
    permits: Arc<Semaphore>,
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl MissionRuntime {
    pub fn new(controller: Arc<MissionController>, max_concurrent: usize) -> Self {
        Self {
            controller,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tasks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Enqueue a controller task for `job_id`. Returns immediately; the task
    /// waits for a permit before touching the container host.
    pub async fn dispatch(&self, job_id: Uuid) {
        let controller = Arc::clone(&self.controller);
        let permits = Arc::clone(&self.permits);
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
                _ = shutdown.cancelled() => return,
            };
            if shutdown.is_cancelled() {
                return;
            }
            match controller.run_job(job_id).await {
                Ok(()) => tracing::info!("Job {job_id} finished"),
                Err(e) => tracing::error!("Job {job_id} failed: {e:#}"),
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(job_id, handle);
    }

    /// Number of controller tasks still running.
    pub async fn active_count(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, task| !task.is_finished());
        tasks.len()
    }

    /// Request cooperative shutdown: queued tasks stop before starting,
    /// running controllers finish their current mission.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every dispatched task to finish.
    pub async fn join_all(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::error!("Mission task panicked: {e}");
                }
            }
        }
    }
}
