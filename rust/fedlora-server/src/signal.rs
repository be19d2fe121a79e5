//! Operator interrupts.
//!
//! [`shutdown()`] resolves on SIGINT or SIGTERM. The binary turns it into an [`Interrupt`] which the
//! orchestrator checks before it starts a round or a participant training job. Work that already
//! started runs to completion, so an aggregated adapter is never left half-written.

use tokio::sync::watch;

/// Creates a connected interrupt trigger and interrupt.
pub fn interrupt() -> (InterruptTrigger, Interrupt) {
    let (tx, rx) = watch::channel(false);
    (InterruptTrigger(tx), Interrupt(rx))
}

#[derive(Debug)]
/// The sending half of an [`Interrupt`].
pub struct InterruptTrigger(watch::Sender<bool>);

impl InterruptTrigger {
    /// Interrupts all connected [`Interrupt`]s.
    pub fn trigger(&self) {
        // there may be no orchestrator listening anymore
        let _ = self.0.send(true);
    }
}

#[derive(Debug, Clone)]
/// A cloneable interrupt flag.
pub struct Interrupt(watch::Receiver<bool>);

impl Interrupt {
    /// An interrupt that is never triggered.
    pub fn never() -> Self {
        let (_, interrupt) = interrupt();
        interrupt
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }
}

/// Returns a `Future` that completes when the coordinator should stop.
pub async fn shutdown() {
    imp::shutdown().await
}

#[cfg(unix)]
mod imp {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        tokio::select! {
            // SIGINT  - Ctrl-C in a terminal.
            () = sig(SignalKind::interrupt(), "SIGINT") => {}
            // SIGTERM - sent by process supervisors.
            () = sig(SignalKind::terminate(), "SIGTERM") => {}
        };
    }

    async fn sig(kind: SignalKind, name: &'static str) {
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
                info!(
                    // use target to remove 'imp' from output
                    target: "fedlora_server::signal",
                    "received {}, stopping after the current work",
                    name,
                );
            }
            Err(err) => {
                error!(
                    target: "fedlora_server::signal",
                    "failed to register the {} handler: {}",
                    name,
                    err,
                );
                futures::future::pending::<()>().await
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(
                target: "fedlora_server::signal",
                "received Ctrl-C, stopping after the current work",
            ),
            Err(err) => {
                error!(
                    target: "fedlora_server::signal",
                    "failed to register the Ctrl-C handler: {}",
                    err,
                );
                futures::future::pending::<()>().await
            }
        }
    }
}
