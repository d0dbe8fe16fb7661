//! Pipeline lifecycle events
//!
//! Events go out over a broadcast channel. Publishing never waits on
//! subscribers: with nobody listening the event is dropped, and a slow
//! subscriber only sees `Lagged` on its own receiver.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::types::FailureKind;

const DEFAULT_CAPACITY: usize = 256;

/// Event emitted while a pipeline runs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PipelineStarted {
        run_id: String,
        stage_count: usize,
    },
    PipelineCompleted {
        run_id: String,
        success: bool,
        duration_ms: u64,
    },
    PipelineError {
        run_id: String,
        error: String,
    },
    StageStarted {
        run_id: String,
        stage: String,
        attempt: u32,
    },
    /// Streamed text or a retry notice for a running stage
    StageProgress {
        run_id: String,
        stage: String,
        message: String,
    },
    StageCompleted {
        run_id: String,
        stage: String,
        duration_ms: u64,
        skipped: bool,
    },
    StageError {
        run_id: String,
        stage: String,
        error: String,
        kind: Option<FailureKind>,
        attempt: u32,
    },
    CacheHit {
        run_id: String,
        stage: String,
        fingerprint: String,
    },
}

impl PipelineEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::PipelineStarted { run_id, .. }
            | Self::PipelineCompleted { run_id, .. }
            | Self::PipelineError { run_id, .. }
            | Self::StageStarted { run_id, .. }
            | Self::StageProgress { run_id, .. }
            | Self::StageCompleted { run_id, .. }
            | Self::StageError { run_id, .. }
            | Self::CacheHit { run_id, .. } => run_id,
        }
    }
}

/// Fire-and-forget event publisher
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; never blocks and never fails
    pub fn publish(&self, event: PipelineEvent) {
        // No receivers is not an error for the publisher
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Mirror every event to `tracing` until the bus is dropped
    pub fn spawn_logger(&self) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event logger lagging; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn log_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::PipelineStarted {
            run_id,
            stage_count,
        } => info!(run_id = %run_id, stage_count, "Pipeline started"),
        PipelineEvent::PipelineCompleted {
            run_id,
            success,
            duration_ms,
        } => info!(run_id = %run_id, success, duration_ms, "Pipeline completed"),
        PipelineEvent::PipelineError { run_id, error } => {
            error!(run_id = %run_id, error = %error, "Pipeline error")
        }
        PipelineEvent::StageStarted {
            run_id,
            stage,
            attempt,
        } => info!(run_id = %run_id, stage = %stage, attempt, "Stage started"),
        PipelineEvent::StageProgress {
            run_id,
            stage,
            message,
        } => debug!(run_id = %run_id, stage = %stage, message = %message, "Stage progress"),
        PipelineEvent::StageCompleted {
            run_id,
            stage,
            duration_ms,
            skipped,
        } => info!(run_id = %run_id, stage = %stage, duration_ms, skipped, "Stage completed"),
        PipelineEvent::StageError {
            run_id,
            stage,
            error,
            kind,
            attempt,
        } => warn!(
            run_id = %run_id,
            stage = %stage,
            error = %error,
            kind = ?kind,
            attempt,
            "Stage error"
        ),
        PipelineEvent::CacheHit {
            run_id,
            stage,
            fingerprint,
        } => info!(run_id = %run_id, stage = %stage, fingerprint = %fingerprint, "Cache hit"),
    }
}
