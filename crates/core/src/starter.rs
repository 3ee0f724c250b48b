//! The request starter: the loop that feeds a scheduler's chosen blocks
//! to the network layer.

use crate::scheduler::*;
use blockswarm_api::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Repeatedly grabs a block from one scheduler and hands it to the
/// matching [RequestSender], keeping at most
/// `starterMaxInFlight` sends outstanding.
///
/// When nothing is eligible the starter sleeps until the scheduler wakes
/// it, the next cooldown expires, or the poll interval passes.
///
/// The loop is aborted when the starter is dropped.
#[derive(Debug)]
pub struct RequestStarter {
    abort_handle: tokio::task::AbortHandle,
}

impl Drop for RequestStarter {
    fn drop(&mut self) {
        tracing::debug!("RequestStarter is being dropped, aborting loop");
        self.abort_handle.abort();
    }
}

impl RequestStarter {
    /// Spawn a starter for `scheduler`. Must be called within a tokio
    /// runtime.
    pub fn spawn(scheduler: ClientRequestScheduler, senders: RequestSenders) -> Self {
        let abort_handle = tokio::task::spawn(run(scheduler, senders)).abort_handle();
        Self { abort_handle }
    }
}

async fn run(scheduler: ClientRequestScheduler, senders: RequestSenders) {
    let config = scheduler.config().clone();
    let in_flight = Arc::new(Semaphore::new(config.starter_max_in_flight));
    let poll = Duration::from_millis(config.starter_poll_interval_ms as u64);

    tracing::debug!("{}: request starter running", scheduler.id());

    loop {
        let Ok(permit) = in_flight.clone().acquire_owned().await else {
            return;
        };

        if let Some(chosen) = scheduler.grab_request() {
            let Dispatch { blocking, fut } = chosen.send(&senders);
            if blocking {
                tokio::task::spawn(async move {
                    fut.await;
                    drop(permit);
                });
            } else {
                fut.await;
                drop(permit);
            }
            continue;
        }
        drop(permit);

        let now = Timestamp::now();
        let sleep = scheduler
            .next_wakeup()
            .map(|wakeup| wakeup.saturating_duration_since(now).min(poll))
            .unwrap_or(poll);

        tokio::select! {
            _ = scheduler.wait_for_wake() => (),
            _ = tokio::time::sleep(sleep) => (),
        }
    }
}
