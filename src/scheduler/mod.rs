use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::time::DelayQueue;
use uuid::Uuid;

/// Deferred work items. One scheduler loop per node owns every timer —
/// grace windows, sweeps — instead of one timer task per flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Re-check a user's fleet-wide socket count and publish `offline` if it
    /// is still zero.
    OfflineGrace { user_id: Uuid },
    /// Close local sockets whose last heartbeat is older than the TTL.
    /// Reschedules itself.
    HeartbeatSweep,
}

/// Cheap handle for scheduling jobs from any component.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<(Job, Duration)>,
}

impl Scheduler {
    pub fn new() -> (Scheduler, JobRunner) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Scheduler { tx }, JobRunner { rx })
    }

    pub fn schedule(&self, job: Job, delay: Duration) {
        if self.tx.send((job, delay)).is_err() {
            tracing::warn!("Scheduler loop is gone; dropping job");
        }
    }
}

/// The consuming half: a single loop over a [`DelayQueue`].
pub struct JobRunner {
    rx: mpsc::UnboundedReceiver<(Job, Duration)>,
}

impl JobRunner {
    /// Run until every [`Scheduler`] handle is dropped and the queue drains.
    /// `handler` runs inline on the loop; it should stay short and spawn
    /// anything heavy.
    pub async fn run<F, Fut>(mut self, handler: F)
    where
        F: Fn(Job) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut queue: DelayQueue<Job> = DelayQueue::new();
        let mut closed = false;

        loop {
            tokio::select! {
                maybe = self.rx.recv(), if !closed => match maybe {
                    Some((job, delay)) => {
                        queue.insert(job, delay);
                    }
                    None => closed = true,
                },
                Some(expired) = queue.next(), if !queue.is_empty() => {
                    handler(expired.into_inner()).await;
                }
                else => break,
            }

            if closed && queue.is_empty() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn scheduled_job_fires_after_its_delay() {
        let (scheduler, runner) = Scheduler::new();
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();

        tokio::spawn(runner.run(move |job| {
            let fired_tx = fired_tx.clone();
            async move {
                let _ = fired_tx.send(job);
            }
        }));

        let user_id = Uuid::new_v4();
        scheduler.schedule(Job::OfflineGrace { user_id }, Duration::from_secs(30));

        // Nothing before the deadline.
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(fired_rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        let job = fired_rx.recv().await.expect("job should fire");
        assert_eq!(job, Job::OfflineGrace { user_id });
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_fire_in_deadline_order() {
        let (scheduler, runner) = Scheduler::new();
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();

        tokio::spawn(runner.run(move |job| {
            let fired_tx = fired_tx.clone();
            async move {
                let _ = fired_tx.send(job);
            }
        }));

        let early = Uuid::new_v4();
        let late = Uuid::new_v4();
        // Inserted out of order.
        scheduler.schedule(Job::OfflineGrace { user_id: late }, Duration::from_secs(60));
        scheduler.schedule(Job::OfflineGrace { user_id: early }, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(
            fired_rx.recv().await,
            Some(Job::OfflineGrace { user_id: early })
        );
        assert_eq!(
            fired_rx.recv().await,
            Some(Job::OfflineGrace { user_id: late })
        );
    }
}
