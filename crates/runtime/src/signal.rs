//! Double-signal shutdown: the first SIGINT/SIGTERM requests a graceful
//! stop, the second forces the process out with status 1.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignalAction {
    RequestStop,
    ForceExit,
}

#[derive(Default)]
pub(crate) struct ShutdownState {
    shutting_down: AtomicBool,
}

impl ShutdownState {
    pub(crate) fn on_signal(&self) -> SignalAction {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            SignalAction::ForceExit
        } else {
            SignalAction::RequestStop
        }
    }
}

/// Install the SIGINT/SIGTERM handler. On the first signal `on_first` runs
/// (cleanup, user messaging) and the stop flag flips; a repeat signal exits
/// immediately with status 1.
pub fn install_shutdown_handler(
    stop: watch::Sender<bool>,
    on_first: impl FnOnce() + Send + 'static,
) {
    let state = Arc::new(ShutdownState::default());
    let mut on_first = Some(on_first);

    tokio::spawn(async move {
        let mut interrupt = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()) {
            Ok(s) => s,
            Err(err) => {
                error!(%err, "failed to install SIGINT handler");
                return;
            }
        };
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            match state.on_signal() {
                SignalAction::RequestStop => {
                    if let Some(hook) = on_first.take() {
                        hook();
                    }
                    let _ = stop.send(true);
                }
                SignalAction::ForceExit => {
                    eprintln!("\nForce shutdown.");
                    std::process::exit(1);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_signal_requests_second_forces() {
        let state = ShutdownState::default();
        assert_eq!(state.on_signal(), SignalAction::RequestStop);
        assert_eq!(state.on_signal(), SignalAction::ForceExit);
        assert_eq!(state.on_signal(), SignalAction::ForceExit);
    }
}
