//! OS signal handling.
//!
//! # Responsibilities
//! - Watch the enabled subset of SIGHUP/SIGTERM/SIGINT
//! - Report which one fired first, as a stop reason
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A non-primary cluster worker skips the interrupt handler so it does
//!   not race the primary's own shutdown
//! - With everything disabled the watcher stays pending forever; the
//!   caller cancels it during stop

use crate::config::schema::ShutdownConfig;

/// Resolve when the first enabled signal fires, naming it.
#[cfg(unix)]
pub async fn wait_for_signal(config: &ShutdownConfig) -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = if config.sighup {
        signal(SignalKind::hangup()).ok()
    } else {
        None
    };
    let mut terminate = if config.sigterm {
        signal(SignalKind::terminate()).ok()
    } else {
        None
    };
    let mut interrupt = if config.sigint && !config.worker {
        signal(SignalKind::interrupt()).ok()
    } else {
        None
    };

    // A disabled signal becomes a forever-pending branch.
    async fn recv(
        stream: &mut Option<tokio::signal::unix::Signal>,
        name: &'static str,
    ) -> &'static str {
        match stream {
            Some(s) => {
                s.recv().await;
                name
            }
            None => std::future::pending().await,
        }
    }

    tokio::select! {
        name = recv(&mut hangup, "SIGHUP") => name,
        name = recv(&mut terminate, "SIGTERM") => name,
        name = recv(&mut interrupt, "SIGINT") => name,
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal(config: &ShutdownConfig) -> &'static str {
    if config.sigint && !config.worker {
        if tokio::signal::ctrl_c().await.is_ok() {
            return "SIGINT";
        }
    }
    std::future::pending().await
}
