//! In-memory schedule queue: one-shot timers for agent-initiated follow-up
//! runs, with a shared cap. Pending tasks do not survive a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{info, warn};

use crate::{EventSender, TriggerEvent};

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Maximum scheduled tasks ({0}) reached. Cannot schedule more.")]
    CapacityExceeded(usize),
}

struct ScheduledTask {
    prompt: String,
    run_id: String,
    abort: AbortHandle,
    cancelled: bool,
}

pub struct ScheduleQueue {
    events: EventSender,
    max_total: usize,
    pending: Mutex<HashMap<String, ScheduledTask>>,
}

impl ScheduleQueue {
    pub fn new(events: EventSender, max_total: usize) -> Arc<Self> {
        warn!("scheduled tasks are in-memory only and will be lost on restart");
        Arc::new(Self {
            events,
            max_total,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Arm a one-shot timer that emits a `scheduled` event after
    /// `delay_seconds`. Returns the new task id.
    pub fn schedule(
        self: &Arc<Self>,
        prompt: impl Into<String>,
        delay_seconds: f64,
        run_id: impl Into<String>,
    ) -> Result<String, ScheduleError> {
        let prompt = prompt.into();
        let run_id = run_id.into();

        // The lock is held across spawn + insert so the timer task cannot
        // observe the map before its own entry exists.
        let mut pending = self.pending.lock();
        if pending.len() >= self.max_total {
            return Err(ScheduleError::CapacityExceeded(self.max_total));
        }

        let task_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let queue = Arc::clone(self);
        let timer_task_id = task_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(delay_seconds.max(0.0))).await;
            queue.fire(&timer_task_id).await;
        });

        pending.insert(
            task_id.clone(),
            ScheduledTask {
                prompt,
                run_id,
                abort: handle.abort_handle(),
                cancelled: false,
            },
        );
        info!(%task_id, delay_seconds, "scheduled follow-up task");
        Ok(task_id)
    }

    async fn fire(&self, task_id: &str) {
        // Whoever removes the entry first wins; the loser is a no-op.
        let Some(task) = self.pending.lock().remove(task_id) else {
            return;
        };
        if task.cancelled {
            return;
        }
        let event = TriggerEvent::new("scheduled", task.prompt)
            .with_metadata("scheduled_task_id", task_id)
            .with_metadata("scheduled_by_run", task.run_id);
        if self.events.send(event).await.is_err() {
            warn!(task_id, "event channel closed, dropping scheduled task");
        }
    }

    /// Cancel every pending task. Returns how many were drained.
    pub fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        for task in pending.values_mut() {
            task.cancelled = true;
            task.abort.abort();
        }
        pending.clear();
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_queue(max_total: usize) -> (Arc<ScheduleQueue>, mpsc::Receiver<TriggerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (ScheduleQueue::new(tx, max_total), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_fires_event() {
        let (queue, mut rx) = make_queue(10);
        let task_id = queue.schedule("test prompt", 0.1, "run-1").unwrap();
        assert_eq!(task_id.len(), 12);
        assert_eq!(queue.pending_count(), 1);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("fired")
            .expect("channel open");
        assert_eq!(event.trigger_type, "scheduled");
        assert_eq!(event.prompt, "test prompt");
        assert_eq!(
            event.metadata.get("scheduled_task_id").map(String::as_str),
            Some(task_id.as_str())
        );
        assert_eq!(
            event.metadata.get("scheduled_by_run").map(String::as_str),
            Some("run-1")
        );
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_returns_count_and_nothing_fires() {
        let (queue, mut rx) = make_queue(10);
        queue.schedule("p1", 10.0, "r1").unwrap();
        queue.schedule("p2", 10.0, "r2").unwrap();
        assert_eq!(queue.pending_count(), 2);

        assert_eq!(queue.cancel_all(), 2);
        assert_eq!(queue.pending_count(), 0);

        tokio::time::advance(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_is_enforced() {
        let (queue, _rx) = make_queue(2);
        queue.schedule("p1", 10.0, "r1").unwrap();
        queue.schedule("p2", 10.0, "r2").unwrap();
        let err = queue.schedule("p3", 10.0, "r3").unwrap_err();
        assert!(matches!(err, ScheduleError::CapacityExceeded(2)));
        assert!(err.to_string().contains("Maximum scheduled tasks"));
        queue.cancel_all();
    }

    #[tokio::test(start_paused = true)]
    async fn pending_count_decrements_after_fire() {
        let (queue, mut rx) = make_queue(10);
        queue.schedule("prompt", 0.05, "r1").unwrap();
        assert_eq!(queue.pending_count(), 1);
        let _ = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("fired");
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn multiple_schedules_all_fire() {
        let (queue, mut rx) = make_queue(10);
        queue.schedule("p1", 0.05, "r1").unwrap();
        queue.schedule("p2", 0.10, "r2").unwrap();
        queue.schedule("p3", 0.15, "r3").unwrap();

        let mut prompts = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("fired")
                .expect("open");
            prompts.push(event.prompt);
        }
        prompts.sort();
        assert_eq!(prompts, vec!["p1", "p2", "p3"]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_frees_after_fire() {
        let (queue, mut rx) = make_queue(1);
        queue.schedule("p1", 0.01, "r1").unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("fired");
        // Entry is gone, so a new task fits.
        queue.schedule("p2", 5.0, "r2").unwrap();
        assert_eq!(queue.cancel_all(), 1);
    }
}
