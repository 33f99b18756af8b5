//! Liveness publishing while an invocation runs.
//!
//! The heartbeat says "a process is alive and working on this job" and
//! nothing more. It only ever writes `heartbeat_at`; progress and stage are
//! written by the orchestrator when work is committed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use draftmill_core::JobId;

use crate::store::JobStore;

/// What the invocation is doing right now, attached to heartbeat logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatContext {
    pub substage: String,
    pub progress: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatPublisher {
    interval: Duration,
}

impl HeartbeatPublisher {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start beating for `job_id`. The first beat is written immediately.
    pub fn start<S: JobStore>(
        &self,
        store: Arc<S>,
        job_id: JobId,
        initial: HeartbeatContext,
    ) -> HeartbeatHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (context_tx, context_rx) = watch::channel(initial);
        let period = self.interval;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut beats = 0u64;

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let ctx = context_rx.borrow().clone();
                        match store.touch_heartbeat(job_id, Utc::now()).await {
                            Ok(()) => {
                                beats += 1;
                                debug!(
                                    job_id = %job_id,
                                    substage = %ctx.substage,
                                    progress = ctx.progress,
                                    "heartbeat"
                                );
                            }
                            Err(e) => warn!(job_id = %job_id, error = %e, "heartbeat write failed"),
                        }
                    }
                }
            }
            beats
        });

        HeartbeatHandle {
            stop: Some(stop_tx),
            context: context_tx,
            join: Some(join),
        }
    }
}

/// Handle to a running heartbeat. Dropping it aborts the task.
#[derive(Debug)]
pub struct HeartbeatHandle {
    stop: Option<oneshot::Sender<()>>,
    context: watch::Sender<HeartbeatContext>,
    join: Option<JoinHandle<u64>>,
}

impl HeartbeatHandle {
    pub fn update_context(&self, substage: impl Into<String>, progress: u8) {
        let _ = self.context.send(HeartbeatContext {
            substage: substage.into(),
            progress,
        });
    }

    /// Stop beating and wait for the task. Returns the number of beats written.
    pub async fn stop(mut self) -> u64 {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.join.take() {
            Some(join) => join.await.unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}
