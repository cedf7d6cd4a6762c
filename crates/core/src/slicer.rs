use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::Result;
use crate::config::PipelineSettings;
use crate::controller::AdaptiveController;
use crate::coordinator::{Coordinator, QueueProducer};
use crate::progress::ProgressState;
use crate::source::ChunkSource;

pub type SharedSource = Arc<Mutex<Box<dyn ChunkSource>>>;

enum SliceEnd {
    Exhausted(u64),
    Aborted,
}

/// Producer half of one file upload: drains the chunk source into the bounded queue.
pub struct Slicer {
    pub source: SharedSource,
    pub producer: QueueProducer,
    pub progress: Arc<ProgressState>,
    pub controller: Arc<AdaptiveController>,
    pub coordinator: Arc<Coordinator>,
    pub settings: PipelineSettings,
}

impl Slicer {
    /// Never fails outward: errors land in the progress state and raise the error signal.
    /// The queue is closed on every exit path.
    pub async fn run(self) {
        let file_id = self.progress.file_id().to_string();
        match self.slice_all().await {
            Ok(SliceEnd::Exhausted(parts)) => {
                self.progress.mark_slicing_complete();
                debug!(event = "slicing.finished", file_id = %file_id, parts, "slicing.finished");
            }
            Ok(SliceEnd::Aborted) => {
                debug!(event = "slicing.aborted", file_id = %file_id, "slicing.aborted");
            }
            Err(e) => {
                error!(event = "slicing.failed", file_id = %file_id, error = %e, "slicing.failed");
                self.progress.record_failure(e);
                self.coordinator.signal_error();
            }
        }
        self.producer.close();
    }

    async fn slice_all(&self) -> Result<SliceEnd> {
        let mut parts = 0u64;
        loop {
            if self.coordinator.is_failed() {
                return Ok(SliceEnd::Aborted);
            }
            if !self.wait_for_backlog().await {
                return Ok(SliceEnd::Aborted);
            }

            let chunk_size = self.controller.next_chunk_size();
            let chunk = {
                let mut source = self.source.lock().await;
                source.set_max_chunk_size(chunk_size);
                source.next_chunk().await?
            };
            let Some(chunk) = chunk else {
                return Ok(SliceEnd::Exhausted(parts));
            };

            self.progress.record_chunk_created(chunk.len());
            parts += 1;
            tokio::select! {
                sent = self.producer.send(chunk) => sent?,
                _ = self.coordinator.wait_for_error() => return Ok(SliceEnd::Aborted),
            }
        }
    }

    /// Holds the producer while more than `factor × parallelism` chunks are unconfirmed.
    /// Returns false if the upload failed while waiting.
    async fn wait_for_backlog(&self) -> bool {
        loop {
            let limit = (self.settings.backpressure_factor * self.controller.parallelism()) as u64;
            if self.progress.pending_chunks() <= limit {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.backpressure_poll()) => {}
                _ = self.coordinator.wait_for_error() => return false,
            }
        }
    }
}
