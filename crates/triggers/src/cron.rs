//! Cron trigger: fires the configured prompt on a schedule.
//!
//! No catch-up semantics: each pass computes the next occurrence strictly
//! after "now", so ticks missed while the process slept are not replayed.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::watch;
use tracing::{error, warn};

use vigil_config::CronTriggerConfig;

use crate::{EventSender, TriggerEvent};

/// The `cron` crate wants a seconds field; plain 5-field crontab
/// expressions get `0` prepended so both forms work in role files.
fn normalize_expression(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

pub(crate) async fn run(
    config: CronTriggerConfig,
    events: EventSender,
    mut stop: watch::Receiver<bool>,
) {
    let expr = normalize_expression(&config.schedule);
    let schedule = match Schedule::from_str(&expr) {
        Ok(s) => s,
        Err(err) => {
            error!(schedule = %config.schedule, %err, "invalid cron expression, trigger not started");
            return;
        }
    };
    let tz: Tz = config.timezone.parse().unwrap_or_else(|_| {
        warn!(tz = %config.timezone, "unrecognized timezone, falling back to UTC");
        chrono_tz::UTC
    });

    while !*stop.borrow() {
        let now = Utc::now().with_timezone(&tz);
        let Some(next) = schedule.after(&now).next() else {
            warn!(schedule = %config.schedule, "cron expression has no future occurrence");
            return;
        };

        // Sleep in <=1s slices so shutdown stays responsive.
        loop {
            let remaining = (next - Utc::now().with_timezone(&tz)).num_milliseconds();
            if remaining <= 0 {
                break;
            }
            let slice = Duration::from_millis(remaining.min(1000) as u64);
            tokio::select! {
                _ = tokio::time::sleep(slice) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
        if *stop.borrow() {
            return;
        }

        let event = TriggerEvent::new("cron", &config.prompt)
            .with_metadata("schedule", &config.schedule);
        if events.send(event).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expressions_gain_seconds() {
        assert_eq!(normalize_expression("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_expression("*/5 9-17 * * 1-5"), "0 */5 9-17 * * 1-5");
    }

    #[test]
    fn six_field_expressions_pass_through() {
        assert_eq!(normalize_expression("0 0 12 * * *"), "0 0 12 * * *");
    }

    #[test]
    fn normalized_standard_expression_parses() {
        let expr = normalize_expression("* * * * *");
        let schedule = Schedule::from_str(&expr).unwrap();
        // Every-minute schedule always has a next occurrence.
        assert!(schedule.after(&Utc::now()).next().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flag_ends_the_wait() {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let config = CronTriggerConfig {
            schedule: "0 0 0 1 1 *".to_string(), // far away
            prompt: "tick".to_string(),
            timezone: "UTC".to_string(),
            autonomous: false,
        };
        let task = tokio::spawn(run(config, tx, stop_rx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        stop_tx.send(true).ok();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("driver should stop promptly")
            .unwrap();
    }

    // Real-clock test: the driver computes due times from wall time, so an
    // every-second schedule must deliver within a couple of seconds.
    #[tokio::test]
    async fn fires_with_schedule_metadata() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let config = CronTriggerConfig {
            schedule: "* * * * * *".to_string(), // every second
            prompt: "tick".to_string(),
            timezone: "UTC".to_string(),
            autonomous: false,
        };
        let task = tokio::spawn(run(config, tx, stop_rx));
        let event = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("event within one schedule period")
            .expect("channel open");
        assert_eq!(event.trigger_type, "cron");
        assert_eq!(event.prompt, "tick");
        assert_eq!(event.metadata.get("schedule").map(String::as_str), Some("* * * * * *"));
        stop_tx.send(true).ok();
        let _ = task.await;
    }
}
