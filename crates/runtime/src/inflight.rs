//! In-flight work gauge: lets the shutdown path wait (bounded) for active
//! dispatches to drain.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Clone)]
pub struct InFlight {
    count: Arc<watch::Sender<usize>>,
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlight {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { count: Arc::new(tx) }
    }

    /// Increment the gauge; the returned guard decrements on drop, so every
    /// exit path of the holder releases exactly once.
    pub fn enter(&self) -> InFlightGuard {
        self.count.send_modify(|c| *c += 1);
        InFlightGuard {
            count: Arc::clone(&self.count),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no work is in flight. Returns false if `limit` elapsed
    /// first.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let mut rx = self.count.subscribe();
        let result = tokio::time::timeout(limit, rx.wait_for(|c| *c == 0)).await;
        result.is_ok()
    }
}

pub struct InFlightGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
    }
}
