use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::admission::AdmissionSlotPool;
use crate::config::PipelineSettings;
use crate::controller::{AdaptiveController, AttemptOutcome};
use crate::coordinator::Coordinator;
use crate::progress::ProgressState;
use crate::remote::{AssertPartParams, FileDefinition, TransferApi};
use crate::retry::RetryPolicyFactory;
use crate::source::Chunk;
use crate::storage::{StorageOutcome, StorageProvider, StrategyRegistry};
use crate::{Error, Result};

/// Everything the workers of one file upload share.
pub struct WorkerContext {
    pub session_id: String,
    pub file: FileDefinition,
    pub coordinator: Arc<Coordinator>,
    pub progress: Arc<ProgressState>,
    pub controller: Arc<AdaptiveController>,
    pub slots: AdmissionSlotPool,
    pub api: Arc<dyn TransferApi>,
    pub strategies: Arc<StrategyRegistry>,
    pub retry: Arc<dyn RetryPolicyFactory>,
    pub settings: PipelineSettings,
    pub cancel: CancellationToken,
}

struct Sent {
    provider: StorageProvider,
    outcome: StorageOutcome,
    elapsed: Duration,
}

/// Consumer half of one file upload. Pulls chunks until the queue is drained or the
/// upload fails.
pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<WorkerContext>) -> Self {
        Self { id, ctx }
    }

    pub async fn run(self) {
        let ctx = &*self.ctx;
        debug!(
            event = "worker.start",
            worker = self.id,
            file_id = %ctx.file.file_id,
            "worker.start"
        );

        loop {
            if ctx.coordinator.is_failed() {
                break;
            }
            let chunk = tokio::select! {
                biased;
                _ = ctx.coordinator.wait_for_error() => break,
                chunk = ctx.coordinator.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };

            let part_number = chunk.part_number;
            if let Err(e) = self.process_chunk(chunk).await {
                error!(
                    event = "upload.part_failed",
                    worker = self.id,
                    file_id = %ctx.file.file_id,
                    part_number,
                    status_code = e.status_code(),
                    error = %e,
                    "upload.part_failed"
                );
                ctx.progress.record_failure(e);
                ctx.coordinator.signal_error();
                return;
            }
        }

        if !ctx.coordinator.is_failed()
            && ctx.progress.is_upload_complete()
            && ctx.coordinator.signal_finished()
        {
            debug!(
                event = "upload.parts_confirmed",
                worker = self.id,
                file_id = %ctx.file.file_id,
                parts = ctx.progress.chunks_created(),
                "upload.parts_confirmed"
            );
        }
        debug!(
            event = "worker.stop",
            worker = self.id,
            file_id = %ctx.file.file_id,
            "worker.stop"
        );
    }

    async fn process_chunk(&self, chunk: Chunk) -> Result<()> {
        let progress = &self.ctx.progress;
        progress.begin_upload();
        let started = Instant::now();
        let result = self.upload_and_confirm(&chunk).await;
        progress.end_upload();
        result?;
        progress.record_chunk_uploaded(chunk.len(), started.elapsed());
        Ok(())
    }

    async fn upload_and_confirm(&self, chunk: &Chunk) -> Result<()> {
        let ctx = &*self.ctx;
        let timeout = ctx.settings.attempt_timeout(chunk.plaintext_len);

        ctx.retry
            .chunk_upload_policy()
            .run(&ctx.cancel, move |attempt| self.attempt(chunk, attempt, timeout))
            .await?;

        let params = AssertPartParams {
            session_id: ctx.session_id.clone(),
            file_id: ctx.file.file_id.clone(),
            part_number: chunk.part_number,
            byte_count: chunk.len(),
            digest: chunk.digest.clone(),
        };
        let api = &ctx.api;
        let policy = ctx.retry.assert_policy();
        let confirm = policy.run(&ctx.cancel, move |_| api.assert_part_uploaded(params.clone()));
        self.with_heartbeat("assert_part", chunk.part_number, confirm)
            .await
    }

    /// One transfer attempt. The admission slot is released before the controller hears
    /// about the outcome, and it hears exactly once. Only time spent in the storage
    /// upload counts as elapsed; waiting for a slot or a location does not.
    async fn attempt(&self, chunk: &Chunk, attempt: u32, timeout: Duration) -> Result<()> {
        let ctx = &*self.ctx;
        let result = self
            .with_heartbeat("upload", chunk.part_number, self.transfer(chunk, timeout))
            .await;

        let (success, status_code, elapsed) = match &result {
            Ok(sent) => (sent.outcome.success, sent.outcome.status_code, sent.elapsed),
            Err(Error::Timeout { .. }) => (false, None, timeout),
            Err(_) => (false, None, Duration::ZERO),
        };
        ctx.controller.record_outcome(AttemptOutcome {
            elapsed,
            success,
            part_number: chunk.part_number,
            status_code,
            byte_count: Some(chunk.plaintext_len),
        });

        let Sent {
            provider, outcome, ..
        } = result?;
        if outcome.success {
            debug!(
                event = "upload.part_sent",
                worker = self.id,
                file_id = %ctx.file.file_id,
                part_number = chunk.part_number,
                attempt,
                bytes = chunk.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "upload.part_sent"
            );
            return Ok(());
        }
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Err(Error::Storage {
            provider: provider.to_string(),
            status_code: outcome.status_code,
            message: outcome
                .error_message
                .unwrap_or_else(|| "upload rejected".to_string()),
        })
    }

    async fn transfer(&self, chunk: &Chunk, timeout: Duration) -> Result<Sent> {
        let ctx = &*self.ctx;
        let _slot = tokio::select! {
            slot = ctx.slots.acquire() => slot?,
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
        };

        let request = ctx
            .api
            .get_upload_location(&ctx.session_id, &ctx.file, chunk.part_number);
        let location = tokio::select! {
            location = request => location?,
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
        };
        let strategy = ctx.strategies.get(location.provider)?;

        let attempt_cancel = ctx.cancel.child_token();
        let started = Instant::now();
        let outcome = tokio::select! {
            outcome = strategy.upload(chunk, &location, &attempt_cancel) => outcome,
            _ = tokio::time::sleep(timeout) => {
                attempt_cancel.cancel();
                return Err(Error::Timeout { seconds: timeout.as_secs() });
            }
        };
        Ok(Sent {
            provider: location.provider,
            outcome,
            elapsed: started.elapsed(),
        })
    }

    /// Logs a heartbeat every interval while `fut` is pending.
    async fn with_heartbeat<F: Future>(
        &self,
        stage: &'static str,
        part_number: u32,
        fut: F,
    ) -> F::Output {
        let period = self
            .ctx
            .settings
            .heartbeat_interval()
            .max(Duration::from_millis(1));
        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                _ = ticker.tick() => {
                    info!(
                        event = "upload.heartbeat",
                        worker = self.id,
                        file_id = %self.ctx.file.file_id,
                        part_number,
                        stage,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "upload.heartbeat"
                    );
                }
            }
        }
    }
}
