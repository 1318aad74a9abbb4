//! Reconnection supervisor.
//!
//! Runs on the connection's own event-loop task after an unexpected loss and
//! keeps polling the link at a fixed interval until it comes back or shutdown
//! is requested. Every transition is published on the connection's state
//! channel, so observers are never blocked by the retry loop.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::connection::ConnectionState;
use crate::error::TransportError;
use crate::link::{LinkDriver, LinkEvent};

/// Outcome of a recovery run.
#[derive(Debug, PartialEq)]
pub enum Recovery {
    /// The link produced an event again; the first one is handed back.
    Resumed(LinkEvent),
    /// Shutdown was requested while recovering.
    Shutdown,
}

/// Hook run once the link is back, before the state flips to connected.
pub type RestoreHook = Box<dyn Fn() + Send + Sync>;

pub struct ReconnectSupervisor {
    interval: Duration,
    restore: Option<RestoreHook>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    attempts: u32,
    total_reconnects: u64,
}

impl ReconnectSupervisor {
    pub fn new(
        interval: Duration,
        state_tx: watch::Sender<ConnectionState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            interval,
            restore: None,
            state_tx,
            shutdown_rx,
            attempts: 0,
            total_reconnects: 0,
        }
    }

    /// Run `restore` on every recovery, ahead of the connected transition.
    pub fn with_restore<F>(mut self, restore: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.restore = Some(Box::new(restore));
        self
    }

    /// Attempts made during the last recovery run.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Successful recoveries over the supervisor's lifetime.
    pub fn total_reconnects(&self) -> u64 {
        self.total_reconnects
    }

    /// Re-establish the link after `cause` took it down.
    ///
    /// The first attempt is immediate; later ones wait `interval`. There is no
    /// attempt limit.
    pub async fn recover<D>(&mut self, driver: &mut D, cause: &TransportError) -> Recovery
    where
        D: LinkDriver + ?Sized,
    {
        self.state_tx.send_replace(ConnectionState::Reconnecting);
        warn!("Unexpected disconnection ({}), attempting to reconnect", cause);
        self.attempts = 0;

        loop {
            self.attempts += 1;

            let polled = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown_rx) => return Recovery::Shutdown,
                polled = driver.poll() => polled,
            };

            match polled {
                Ok(event) => {
                    if event == LinkEvent::Connected {
                        if let Some(restore) = &self.restore {
                            restore();
                        }
                        self.state_tx.send_replace(ConnectionState::Connected);
                    }
                    self.total_reconnects += 1;
                    info!("Reconnected successfully after {} attempt(s)", self.attempts);
                    return Recovery::Resumed(event);
                }
                Err(e) => {
                    warn!(
                        "Reconnection attempt {} failed: {}; retrying in {:?}",
                        self.attempts, e, self.interval
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut self.shutdown_rx) => {
                            info!("Shutdown signal received during reconnection delay, stopping");
                            return Recovery::Shutdown;
                        }
                        _ = tokio::time::sleep(self.interval) => {}
                    }
                }
            }
        }
    }
}

/// Resolves once shutdown is signalled or the signalling side is gone.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
