//! Trigger lifecycle: build one driver task per config, stop them all on
//! shutdown. The dispatcher owns no policy; admission, budgets, and routing
//! live with the consumer of the event channel.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vigil_config::TriggerConfig;

use crate::EventSender;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

struct TriggerHandle {
    name: &'static str,
    task: JoinHandle<()>,
}

/// Handles for all running driver tasks. Flip the stop watch to `true`, then
/// call [`TriggerSet::join_all`] to wait for them (bounded per driver).
pub struct TriggerSet {
    handles: Vec<TriggerHandle>,
}

impl TriggerSet {
    pub fn count(&self) -> usize {
        self.handles.len()
    }

    pub async fn join_all(self) {
        for handle in self.handles {
            match tokio::time::timeout(JOIN_TIMEOUT, handle.task).await {
                Ok(_) => debug!(trigger = handle.name, "trigger stopped"),
                Err(_) => warn!(trigger = handle.name, "trigger still alive after stop timeout"),
            }
        }
    }
}

/// Build and start one driver per config. Unknown config variants are
/// skipped. Driver startup failures (missing token env, port in use) are
/// logged inside the driver task; the others keep running.
pub fn spawn_triggers(
    configs: &[TriggerConfig],
    events: EventSender,
    stop: watch::Receiver<bool>,
) -> TriggerSet {
    let mut handles = Vec::new();
    for config in configs {
        let events = events.clone();
        let stop = stop.clone();
        let handle = match config {
            TriggerConfig::Cron(c) => {
                let c = c.clone();
                TriggerHandle {
                    name: "cron",
                    task: tokio::spawn(crate::cron::run(c, events, stop)),
                }
            }
            TriggerConfig::FileWatch(c) => {
                let c = c.clone();
                TriggerHandle {
                    name: "file_watch",
                    task: tokio::spawn(crate::file_watch::run(c, events, stop)),
                }
            }
            TriggerConfig::Webhook(c) => {
                let c = c.clone();
                TriggerHandle {
                    name: "webhook",
                    task: tokio::spawn(crate::webhook::run(c, events, stop)),
                }
            }
            TriggerConfig::Telegram(c) => {
                let c = c.clone();
                TriggerHandle {
                    name: "telegram",
                    task: tokio::spawn(crate::telegram::run(c, events, stop)),
                }
            }
            TriggerConfig::Discord(c) => {
                let c = c.clone();
                TriggerHandle {
                    name: "discord",
                    task: tokio::spawn(crate::discord::run(c, events, stop)),
                }
            }
            TriggerConfig::Unknown => {
                debug!("skipping unrecognized trigger config");
                continue;
            }
        };
        info!(trigger = handle.name, "trigger started");
        handles.push(handle);
    }
    TriggerSet { handles }
}
