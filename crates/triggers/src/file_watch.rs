//! File-watch trigger: emits an event per changed path, with an optional
//! startup sweep of files that already exist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

use vigil_config::FileWatchTriggerConfig;

use crate::{EventSender, TriggerEvent};

fn matches_extensions(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let name = path.to_string_lossy();
    extensions.iter().any(|ext| name.ends_with(ext.as_str()))
}

fn render_prompt(template: &str, path: &Path) -> String {
    template.replace("{path}", &path.to_string_lossy())
}

/// Emit one event per existing regular file under each watched directory,
/// sorted, honoring the stop flag between files.
async fn sweep_existing(
    config: &FileWatchTriggerConfig,
    events: &EventSender,
    stop: &watch::Receiver<bool>,
) {
    for watch_path in &config.paths {
        let dir = Path::new(watch_path);
        if !dir.is_dir() {
            continue;
        }
        let mut children: Vec<PathBuf> = match std::fs::read_dir(dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(err) => {
                warn!(path = %dir.display(), %err, "cannot list watch path");
                continue;
            }
        };
        children.sort();
        for child in children {
            if *stop.borrow() {
                return;
            }
            if !child.is_file() || !matches_extensions(&child, &config.extensions) {
                continue;
            }
            let event = TriggerEvent::new("file_watch", render_prompt(&config.prompt_template, &child))
                .with_metadata("path", child.to_string_lossy());
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}

pub(crate) async fn run(
    config: FileWatchTriggerConfig,
    events: EventSender,
    mut stop: watch::Receiver<bool>,
) {
    if config.process_existing {
        sweep_existing(&config, &events, &stop).await;
        if *stop.borrow() {
            return;
        }
    }

    // notify runs its own thread; bridge its callback into the async loop.
    let (raw_tx, mut raw_rx) = mpsc::channel::<notify::Event>(1024);
    let mut watcher: RecommendedWatcher =
        match notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = raw_tx.blocking_send(event);
            }
        }) {
            Ok(w) => w,
            Err(err) => {
                error!(%err, "failed to create file watcher, trigger not started");
                return;
            }
        };

    let mut watching = 0usize;
    for path in &config.paths {
        match watcher.watch(Path::new(path), RecursiveMode::Recursive) {
            Ok(()) => watching += 1,
            Err(err) => warn!(%path, %err, "cannot watch path"),
        }
    }
    if watching == 0 {
        error!("no watchable paths, file_watch trigger not started");
        return;
    }

    let debounce = Duration::from_secs_f64(config.debounce_seconds.max(0.0));
    let mut last_emitted: HashMap<PathBuf, tokio::time::Instant> = HashMap::new();

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
            }
            raw = raw_rx.recv() => {
                let Some(raw) = raw else { return };
                if matches!(raw.kind, notify::EventKind::Access(_)) {
                    continue;
                }
                for path in raw.paths {
                    if !matches_extensions(&path, &config.extensions) {
                        continue;
                    }
                    let now = tokio::time::Instant::now();
                    if let Some(last) = last_emitted.get(&path) {
                        if now.duration_since(*last) < debounce {
                            debug!(path = %path.display(), "debounced");
                            continue;
                        }
                    }
                    last_emitted.insert(path.clone(), now);
                    let event = TriggerEvent::new(
                        "file_watch",
                        render_prompt(&config.prompt_template, &path),
                    )
                    .with_metadata("path", path.to_string_lossy());
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
