use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ControllerSettings;

/// Statuses the remote uses to signal bandwidth exhaustion rather than a generic failure.
pub const OVERLOAD_STATUS_CODES: [u16; 4] = [429, 500, 503, 507];

pub fn is_overload_status(status_code: u16) -> bool {
    OVERLOAD_STATUS_CODES.contains(&status_code)
}

#[derive(Debug, Clone, Copy)]
pub struct AttemptOutcome {
    pub elapsed: Duration,
    pub success: bool,
    pub part_number: u32,
    pub status_code: Option<u16>,
    /// `None` when the attempt's byte count is unknown.
    pub byte_count: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDecision {
    Hold,
    OverloadReset,
    ParallelismDown,
    ChunkDown,
    ChunkUp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSnapshot {
    pub chunk_size: u64,
    pub parallelism: usize,
    pub window_len: usize,
    pub window_successes: usize,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    elapsed: Duration,
    success: bool,
    byte_count: Option<u64>,
}

#[derive(Debug)]
struct ControllerState {
    chunk_size: u64,
    parallelism: usize,
    window: VecDeque<Sample>,
    successes: usize,
}

impl ControllerState {
    fn push(&mut self, sample: Sample) {
        if sample.success {
            self.successes += 1;
        }
        self.window.push_back(sample);
        while self.window.len() > self.parallelism {
            if let Some(evicted) = self.window.pop_front()
                && evicted.success
            {
                self.successes -= 1;
            }
        }
    }

    fn clear_window(&mut self) {
        self.window.clear();
        self.successes = 0;
    }

    fn set_parallelism(&mut self, parallelism: usize) {
        self.parallelism = parallelism;
        self.window = VecDeque::with_capacity(parallelism + 1);
        self.successes = 0;
    }

    fn max_elapsed(&self) -> Duration {
        self.window
            .iter()
            .map(|s| s.elapsed)
            .max()
            .unwrap_or_default()
    }
}

/// Tunes chunk size and upload parallelism from per-attempt feedback.
///
/// Slow windows shrink parallelism first and chunk size second; fast, fully successful
/// windows of representative chunks grow the chunk size, which in turn raises the
/// parallelism floor. Overload statuses bypass the window and reset the chunk size.
#[derive(Debug)]
pub struct AdaptiveController {
    settings: ControllerSettings,
    state: Mutex<ControllerState>,
}

impl AdaptiveController {
    pub fn new(settings: ControllerSettings) -> Self {
        let chunk_size = settings
            .initial_chunk_bytes
            .clamp(settings.min_chunk_bytes, settings.max_chunk_bytes);
        let parallelism = settings
            .initial_parallelism
            .clamp(settings.min_parallelism, settings.max_parallelism);
        Self {
            settings,
            state: Mutex::new(ControllerState {
                chunk_size,
                parallelism,
                window: VecDeque::with_capacity(parallelism + 1),
                successes: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state.lock().expect("controller mutex poisoned")
    }

    pub fn chunk_size(&self) -> u64 {
        self.lock().chunk_size
    }

    /// The chunk size the producer should request next; reflects any decision made since
    /// the previous chunk was sliced.
    pub fn next_chunk_size(&self) -> u64 {
        self.chunk_size()
    }

    pub fn parallelism(&self) -> usize {
        self.lock().parallelism
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let state = self.lock();
        ControllerSnapshot {
            chunk_size: state.chunk_size,
            parallelism: state.parallelism,
            window_len: state.window.len(),
            window_successes: state.successes,
        }
    }

    pub fn record_outcome(&self, outcome: AttemptOutcome) -> ScalingDecision {
        let s = &self.settings;
        let mut state = self.lock();

        if !outcome.success
            && let Some(code) = outcome.status_code
            && is_overload_status(code)
        {
            let previous = state.chunk_size;
            state.chunk_size = s
                .initial_chunk_bytes
                .clamp(s.min_chunk_bytes, s.max_chunk_bytes);
            state.clear_window();
            info!(
                event = "controller.overload_reset",
                part_number = outcome.part_number,
                status_code = code,
                previous_chunk_bytes = previous,
                chunk_bytes = state.chunk_size,
                parallelism = state.parallelism,
                "controller.overload_reset"
            );
            return ScalingDecision::OverloadReset;
        }

        state.push(Sample {
            elapsed: outcome.elapsed,
            success: outcome.success,
            byte_count: outcome.byte_count,
        });

        if state.window.len() < state.parallelism {
            return ScalingDecision::Hold;
        }

        if state.max_elapsed() > s.downscale_threshold() {
            if state.parallelism > s.min_parallelism {
                let parallelism = state.parallelism - 1;
                state.set_parallelism(parallelism);
                info!(
                    event = "controller.downscale",
                    target = "parallelism",
                    part_number = outcome.part_number,
                    chunk_bytes = state.chunk_size,
                    parallelism,
                    "controller.downscale"
                );
                return ScalingDecision::ParallelismDown;
            }

            let shrunk = state.chunk_size * u64::from(100 - s.scale_step_percent) / 100;
            state.chunk_size = shrunk.max(s.min_chunk_bytes);
            state.clear_window();
            info!(
                event = "controller.downscale",
                target = "chunk_size",
                part_number = outcome.part_number,
                chunk_bytes = state.chunk_size,
                parallelism = state.parallelism,
                "controller.downscale"
            );
            return ScalingDecision::ChunkDown;
        }

        // A full window can only upscale when every sample in it succeeded.
        if state.successes < state.parallelism {
            return ScalingDecision::Hold;
        }

        let chunk_size = state.chunk_size;
        let ratio = u64::from(s.eligible_ratio_percent);
        let eligible: Vec<&Sample> = state
            .window
            .iter()
            .filter(|sample| {
                sample
                    .byte_count
                    .is_none_or(|bytes| bytes.saturating_mul(100) >= chunk_size * ratio)
            })
            .collect();
        if eligible.len() < state.parallelism {
            debug!(
                event = "controller.upscale_skipped",
                eligible = eligible.len(),
                parallelism = state.parallelism,
                chunk_bytes = chunk_size,
                "controller.upscale_skipped"
            );
            return ScalingDecision::Hold;
        }

        let recent = &eligible[eligible.len() - state.parallelism..];
        let fast = recent
            .iter()
            .all(|sample| sample.success && sample.elapsed <= s.upscale_threshold());
        if !fast {
            return ScalingDecision::Hold;
        }

        let grown = chunk_size * u64::from(100 + s.scale_step_percent) / 100;
        state.chunk_size = grown.min(s.max_chunk_bytes);

        let mut floor = state.parallelism;
        if state.chunk_size >= s.parallelism_3_from_bytes {
            floor = floor.max(3);
        }
        if state.chunk_size >= s.parallelism_4_from_bytes {
            floor = floor.max(4);
        }
        let floor = floor.min(s.max_parallelism);
        if floor != state.parallelism {
            state.set_parallelism(floor);
        } else {
            state.clear_window();
        }

        info!(
            event = "controller.upscale",
            part_number = outcome.part_number,
            chunk_bytes = state.chunk_size,
            parallelism = state.parallelism,
            "controller.upscale"
        );
        ScalingDecision::ChunkUp
    }
}
