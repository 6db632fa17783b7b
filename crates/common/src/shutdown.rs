//! Cooperative shutdown flag (spec.md §5). `SIGINT`/`SIGTERM` flip a
//! shared atomic; every suspension point (before `Pack()`, before each
//! per-file network op) checks it and unwinds cleanly instead of being
//! killed mid-flight. Shaped after the teacher's
//! `common::shutdown::ShutdownSignal`, but simplified to a bare
//! `AtomicBool` since this system has a single subscriber per process
//! (the one control loop), not a broadcast fan-out.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[derive(Clone)]
pub struct ShutdownSignal {
    running: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// A signal that never fires, for call sites that need a
    /// `ShutdownSignal` without a `SIGINT`/`SIGTERM` listener behind it
    /// (single-tick test harnesses, library callers driving their own
    /// cancellation).
    pub fn for_tests_running() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Installs `SIGINT`/`SIGTERM` handlers and returns a handle that
    /// tracks whether the process should keep running.
    pub fn install() -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let signal = Self {
            running: running.clone(),
        };
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => tracing::info!("caught SIGINT"),
                    _ = term.recv() => tracing::info!("caught SIGTERM"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
                tracing::info!("caught ctrl-c");
            }
            running.store(false, Ordering::SeqCst);
        });
        signal
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        let running = Arc::new(AtomicBool::new(true));
        let signal = ShutdownSignal { running };
        assert!(signal.is_running());
    }
}
