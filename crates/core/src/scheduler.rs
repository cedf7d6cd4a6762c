use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::Error;
use crate::config::SLICING_LANES;
use crate::progress::ProgressState;
use crate::slicer::Slicer;

/// Upload-session lifecycle notifications. Either one invalidates queued slicing work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    Reset,
    Prepared,
}

/// Runs slicing jobs on a fixed number of lanes. Jobs submitted before the last
/// `reset()` are dropped when their turn comes.
#[derive(Debug, Clone)]
pub struct SlicingScheduler {
    lanes: Arc<Semaphore>,
    generation: Arc<AtomicU64>,
}

impl Default for SlicingScheduler {
    fn default() -> Self {
        Self::new(SLICING_LANES)
    }
}

impl SlicingScheduler {
    pub fn new(lanes: usize) -> Self {
        Self {
            lanes: Arc::new(Semaphore::new(lanes.max(1))),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(event = "slicing.reset", generation, "slicing.reset");
    }

    /// Returns at once with the job's progress state; slicing starts when a lane frees up.
    pub fn enqueue(&self, slicer: Slicer) -> Arc<ProgressState> {
        let progress = slicer.progress.clone();
        let submitted = self.generation();
        let lanes = self.lanes.clone();
        let generation = self.generation.clone();

        tokio::spawn(async move {
            let _lane = match lanes.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    discard(slicer, Error::Shutdown {
                        message: "slicing lanes closed".to_string(),
                    });
                    return;
                }
            };
            let current = generation.load(Ordering::Acquire);
            if current != submitted {
                debug!(
                    event = "slicing.stale",
                    file_id = %slicer.progress.file_id(),
                    submitted,
                    current,
                    "slicing.stale"
                );
                discard(slicer, Error::Cancelled);
                return;
            }
            slicer.run().await;
        });

        progress
    }

    /// Resets on every session event until the sender goes away.
    pub fn watch_session(&self, mut events: broadcast::Receiver<SessionEvent>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(kind) => {
                        debug!(event = "session.event", kind = ?kind, "session.event");
                        scheduler.reset();
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "session.lagged", skipped, "session.lagged");
                        scheduler.reset();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Fails a job that will never run so the upload it belongs to does not wait on it.
fn discard(slicer: Slicer, error: Error) {
    slicer.progress.record_failure(error);
    slicer.coordinator.signal_error();
    slicer.producer.close();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Mutex;

    use super::*;
    use crate::config::{ControllerSettings, PipelineSettings};
    use crate::controller::AdaptiveController;
    use crate::coordinator::{Completion, Coordinator};
    use crate::source::{ChunkSource, InMemorySource};

    fn job(bytes: usize) -> (Slicer, Arc<Coordinator>) {
        let coordinator = Arc::new(Coordinator::new(64));
        let controller = ControllerSettings {
            initial_chunk_bytes: 1024,
            min_chunk_bytes: 1024,
            ..ControllerSettings::default()
        };
        let source: Box<dyn ChunkSource> = Box::new(InMemorySource::new(vec![3u8; bytes], 1024));
        let slicer = Slicer {
            source: Arc::new(Mutex::new(source)),
            producer: coordinator.producer().unwrap(),
            progress: Arc::new(ProgressState::new("f_1", None)),
            controller: Arc::new(AdaptiveController::new(controller)),
            coordinator: coordinator.clone(),
            settings: PipelineSettings::default(),
        };
        (slicer, coordinator)
    }

    #[tokio::test]
    async fn enqueued_job_slices_in_the_background() {
        let scheduler = SlicingScheduler::default();
        let (slicer, coordinator) = job(2048);
        let progress = scheduler.enqueue(slicer);

        let mut parts = Vec::new();
        while let Some(chunk) = coordinator.recv().await {
            parts.push(chunk.part_number);
        }
        assert_eq!(parts, vec![1, 2]);
        assert_eq!(progress.chunks_created(), 2);
    }

    #[tokio::test]
    async fn stale_job_is_a_no_op_that_fails_the_upload() {
        let scheduler = SlicingScheduler::new(1);
        // Occupy the only lane so the job is still queued when the reset lands.
        let held = scheduler.lanes.clone().acquire_owned().await.unwrap();

        let (slicer, coordinator) = job(4096);
        let progress = scheduler.enqueue(slicer);
        scheduler.reset();
        drop(held);

        assert_eq!(coordinator.wait_for_completion().await, Completion::Failed);
        assert!(coordinator.recv().await.is_none());
        assert_eq!(progress.chunks_created(), 0);
        assert!(matches!(progress.take_last_failure(), Some(Error::Cancelled)));
    }

    #[tokio::test]
    async fn session_events_bump_the_generation() {
        let scheduler = SlicingScheduler::default();
        let (tx, rx) = broadcast::channel(4);
        let watcher = scheduler.watch_session(rx);

        tx.send(SessionEvent::Reset).unwrap();
        tx.send(SessionEvent::Prepared).unwrap();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(scheduler.generation(), 2);
    }
}
