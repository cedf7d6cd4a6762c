use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::admission::AdmissionSlotPool;
use crate::config::UploadSettings;
use crate::controller::{AdaptiveController, ControllerSnapshot};
use crate::coordinator::{Completion, Coordinator};
use crate::parallelism::ParallelismManager;
use crate::progress::{ProgressSink, ProgressSnapshot, ProgressState};
use crate::remote::{AssertFinishedParams, FileDefinition, TransferApi};
use crate::retry::RetryPolicyFactory;
use crate::run_log::{UploadLogGuard, start_upload_log};
use crate::scheduler::SlicingScheduler;
use crate::slicer::{SharedSource, Slicer};
use crate::source::ChunkSource;
use crate::storage::StrategyRegistry;
use crate::worker::{Worker, WorkerContext};
use crate::{Error, Result};

pub struct UploadRequest {
    pub session_id: String,
    pub file: FileDefinition,
    pub source: Box<dyn ChunkSource>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Cancelling this token fails the upload with `Error::Cancelled`.
    pub cancel: Option<CancellationToken>,
    /// When set, the upload's events are also written to an NDJSON log under this
    /// directory (see `run_log::start_upload_log`).
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub upload_id: String,
    pub session_id: String,
    pub file_id: String,
    pub parts: u64,
    pub bytes_uploaded: u64,
    pub duration_ms: u64,
    pub max_concurrent_uploads: usize,
    pub bandwidth_bytes_per_sec: u64,
    pub controller: ControllerSnapshot,
    pub progress: ProgressSnapshot,
}

/// Uploads files one request at a time. The adaptive controller is shared across
/// requests so tuning carries over from one file to the next.
pub struct Processor {
    settings: UploadSettings,
    api: Arc<dyn TransferApi>,
    strategies: Arc<StrategyRegistry>,
    retry: Arc<dyn RetryPolicyFactory>,
    controller: Arc<AdaptiveController>,
    scheduler: SlicingScheduler,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl Processor {
    pub fn new(
        settings: UploadSettings,
        api: Arc<dyn TransferApi>,
        strategies: Arc<StrategyRegistry>,
        retry: Arc<dyn RetryPolicyFactory>,
    ) -> Self {
        let controller = Arc::new(AdaptiveController::new(settings.controller.clone()));
        let scheduler = SlicingScheduler::new(settings.pipeline.slicing_lanes);
        Self {
            settings,
            api,
            strategies,
            retry,
            controller,
            scheduler,
            sink: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: SlicingScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn controller(&self) -> &Arc<AdaptiveController> {
        &self.controller
    }

    pub fn scheduler(&self) -> &SlicingScheduler {
        &self.scheduler
    }

    pub async fn process(
        &self,
        request: UploadRequest,
        options: UploadOptions,
    ) -> Result<UploadSummary> {
        let UploadRequest {
            session_id,
            file,
            source,
        } = request;
        let pipeline = &self.settings.pipeline;
        let started = Instant::now();
        let upload_id = format!("upl_{}", uuid::Uuid::new_v4().simple());
        let _log = options
            .log_dir
            .as_deref()
            .and_then(|dir| open_upload_log(&file, &upload_id, dir));

        let cancel = options.cancel.map(|c| c.child_token()).unwrap_or_default();
        let coordinator = Arc::new(Coordinator::new(pipeline.queue_capacity));
        let progress = Arc::new(ProgressState::new(
            file.file_id.clone(),
            file.source_name.clone(),
        ));
        progress.mark_started();
        let source: SharedSource = Arc::new(Mutex::new(source));
        let slots = AdmissionSlotPool::new();

        info!(
            event = "upload.start",
            upload_id = %upload_id,
            session_id = %session_id,
            file_id = %file.file_id,
            source_name = %file.display_name(),
            size = file.size,
            chunk_bytes = self.controller.chunk_size(),
            parallelism = self.controller.parallelism(),
            "upload.start"
        );

        self.scheduler.enqueue(Slicer {
            source: source.clone(),
            producer: coordinator.producer()?,
            progress: progress.clone(),
            controller: self.controller.clone(),
            coordinator: coordinator.clone(),
            settings: pipeline.clone(),
        });

        let ctx = Arc::new(WorkerContext {
            session_id: session_id.clone(),
            file: file.clone(),
            coordinator: coordinator.clone(),
            progress: progress.clone(),
            controller: self.controller.clone(),
            slots: slots.clone(),
            api: self.api.clone(),
            strategies: self.strategies.clone(),
            retry: self.retry.clone(),
            settings: pipeline.clone(),
            cancel: cancel.clone(),
        });

        let mut manager =
            ParallelismManager::new(self.controller.clone(), slots.clone(), pipeline.max_workers);
        let mut workers = JoinSet::new();
        let mut forwarded = 0u64;
        self.tick(&mut manager, &mut workers, &ctx, &mut forwarded);

        let mut ticker = tokio::time::interval(pipeline.reconcile_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                completion = coordinator.wait_for_completion() => {
                    if completion == Completion::Failed {
                        warn!(
                            event = "upload.failing",
                            file_id = %file.file_id,
                            failures = progress.failure_count(),
                            "upload.failing"
                        );
                    }
                    break;
                }
                _ = cancel.cancelled() => {
                    warn!(event = "upload.cancelled", file_id = %file.file_id, "upload.cancelled");
                    progress.record_failure(Error::Cancelled);
                    coordinator.signal_error();
                    break;
                }
                _ = ticker.tick() => {
                    self.tick(&mut manager, &mut workers, &ctx, &mut forwarded);
                }
            }
        }

        source.lock().await.dispose();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(
                    event = "worker.panicked",
                    file_id = %file.file_id,
                    error = %e,
                    "worker.panicked"
                );
                progress.record_failure(Error::Shutdown {
                    message: format!("upload worker stopped unexpectedly: {e}"),
                });
            }
        }
        slots.close();
        self.forward_progress(&ctx, &mut forwarded);

        if let Some(cause) = progress.take_last_failure() {
            return Err(self.fail(&file, cause, started));
        }

        let total_parts = progress.chunks_created();
        let snapshot = progress.snapshot();
        let finished = AssertFinishedParams {
            session_id: session_id.clone(),
            file_id: file.file_id.clone(),
            total_parts,
            total_bytes: snapshot.bytes_uploaded,
        };
        let api = &self.api;
        let assert_finished = self
            .retry
            .assert_policy()
            .run(&cancel, move |_| api.assert_upload_finished(finished.clone()))
            .await;
        if let Err(cause) = assert_finished {
            return Err(self.fail(&file, cause, started));
        }

        progress.mark_finished();
        let duration = started.elapsed();
        let bytes = progress.bytes_uploaded();
        let bandwidth = if duration.as_millis() > 0 {
            (bytes as u128 * 1000 / duration.as_millis()) as u64
        } else {
            bytes
        };
        let snapshot = progress.snapshot();
        info!(
            event = "upload.finished",
            upload_id = %upload_id,
            session_id = %session_id,
            file_id = %file.file_id,
            source_name = %file.display_name(),
            parts = total_parts,
            bytes,
            duration_ms = duration.as_millis() as u64,
            max_concurrent_uploads = snapshot.max_concurrent_uploads,
            bandwidth_bytes_per_sec = bandwidth,
            "upload.finished"
        );

        Ok(UploadSummary {
            upload_id,
            session_id,
            file_id: file.file_id,
            parts: total_parts,
            bytes_uploaded: bytes,
            duration_ms: duration.as_millis() as u64,
            max_concurrent_uploads: snapshot.max_concurrent_uploads,
            bandwidth_bytes_per_sec: bandwidth,
            controller: self.controller.snapshot(),
            progress: snapshot,
        })
    }

    fn tick(
        &self,
        manager: &mut ParallelismManager,
        workers: &mut JoinSet<()>,
        ctx: &Arc<WorkerContext>,
        forwarded: &mut u64,
    ) {
        let r = manager.reconcile();
        for n in 0..r.workers_to_start {
            let id = r.started_workers - r.workers_to_start + n;
            workers.spawn(Worker::new(id, ctx.clone()).run());
        }
        self.forward_progress(ctx, forwarded);
    }

    /// Inventory files report uploaded-byte deltas to the sink; sink errors never fail
    /// the upload.
    fn forward_progress(&self, ctx: &WorkerContext, forwarded: &mut u64) {
        if !ctx.file.inventory {
            return;
        }
        let Some(sink) = &self.sink else {
            return;
        };
        let uploaded = ctx.progress.bytes_uploaded();
        let delta = uploaded.saturating_sub(*forwarded);
        if delta == 0 {
            return;
        }
        *forwarded = uploaded;
        if let Err(e) = sink.on_bytes_uploaded(&ctx.file.file_id, delta) {
            warn!(
                event = "progress.sink_failed",
                file_id = %ctx.file.file_id,
                delta,
                error = %e,
                "progress.sink_failed"
            );
        }
    }

    fn fail(&self, file: &FileDefinition, cause: Error, started: Instant) -> Error {
        error!(
            event = "upload.failed",
            file_id = %file.file_id,
            source_name = %file.display_name(),
            duration_ms = started.elapsed().as_millis() as u64,
            error = %cause,
            "upload.failed"
        );
        Error::UploadFailed {
            source_name: file.display_name().to_string(),
            file_id: file.file_id.clone(),
            cause: Box::new(cause),
        }
    }
}

/// Best effort: only one upload log can be open at a time, and a busy or unwritable log
/// never fails the upload.
fn open_upload_log(file: &FileDefinition, upload_id: &str, dir: &Path) -> Option<UploadLogGuard> {
    let kind = if file.inventory {
        "inventory"
    } else if file.source_name.is_none() {
        "stream"
    } else {
        "file"
    };
    match start_upload_log(kind, upload_id, dir) {
        Ok(guard) => Some(guard),
        Err(e) => {
            warn!(
                event = "upload.log_unavailable",
                upload_id = %upload_id,
                file_id = %file.file_id,
                error = %e,
                "upload.log_unavailable"
            );
            None
        }
    }
}
