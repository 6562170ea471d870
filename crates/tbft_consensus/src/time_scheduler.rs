//! A single-timer scheduler for round timeouts.

#[cfg(test)]
#[path = "time_scheduler_test.rs"]
mod time_scheduler_test;

use tbft_protobuf::consensus::TimeoutInfo;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::types::ValidatorId;

/// Keeps at most one armed timer.
///
/// A request is armed only if its (height, round, step) is strictly after the last armed one, in
/// which case it replaces the pending timer. Older and equal requests are dropped, even once the
/// armed timer has fired, so expiries come out in non-decreasing (height, round, step) order.
#[derive(Debug)]
pub struct TimeScheduler {
    requests: mpsc::UnboundedSender<TimeoutInfo>,
    task: JoinHandle<()>,
}

impl TimeScheduler {
    /// Spawns the scheduler task. Expired timeouts are delivered on the returned receiver.
    pub fn start(id: ValidatorId, capacity: usize) -> (Self, mpsc::Receiver<TimeoutInfo>) {
        let (requests, requests_receiver) = mpsc::unbounded_channel();
        let (timeouts_sender, timeouts) = mpsc::channel(capacity);
        let task = tokio::spawn(run(id, requests_receiver, timeouts_sender));
        (Self { requests, task }, timeouts)
    }

    pub fn add_timeout_info(&self, timeout: TimeoutInfo) {
        trace!("Timeout requested: {timeout}");
        if self.requests.send(timeout).is_err() {
            debug!("Time scheduler stopped, dropping timeout request.");
        }
    }
}

impl Drop for TimeScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    id: ValidatorId,
    mut requests: mpsc::UnboundedReceiver<TimeoutInfo>,
    timeouts: mpsc::Sender<TimeoutInfo>,
) {
    debug!(%id, "Time scheduler started.");
    let mut armed: Option<TimeoutInfo> = None;
    let mut deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else { break };
                if armed.as_ref().is_some_and(|armed| request.position() <= armed.position()) {
                    trace!(%id, "Dropping stale timeout {request}.");
                    continue;
                }
                debug!(%id, "Scheduling timeout {request}.");
                deadline = Some(Instant::now() + request.duration);
                armed = Some(request);
            }
            () = wait_for(deadline) => {
                deadline = None;
                let Some(expired) = armed.clone() else { continue };
                debug!(%id, "Timeout expired {expired}.");
                if timeouts.send(expired).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!(%id, "Time scheduler stopped.");
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
