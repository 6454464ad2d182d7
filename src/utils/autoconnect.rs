//! Auto-reconnect supervision
//!
//! Watches one registered device and reopens its channel when the link drops.
//! A reconnect keeps the device identifier but resets transient state, so
//! streaming must be configured again afterwards.

use crate::config::ReconnectSettings;
use crate::core::device::DeviceId;
use crate::core::registry::DeviceRegistry;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

/// Reconnect configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay between checks and between attempts
    pub delay: Duration,
    /// Maximum consecutive failed attempts (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            max_attempts: 0,
        }
    }
}

impl From<&ReconnectSettings> for ReconnectConfig {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            delay: Duration::from_millis(settings.delay_ms),
            max_attempts: settings.max_attempts,
        }
    }
}

/// Reconnect events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    /// Link found down, attempting to reopen
    Reconnecting { id: DeviceId, attempt: u32, max: u32 },
    /// Link reopened
    Reconnected { id: DeviceId },
    /// Attempt failed
    ReconnectFailed { id: DeviceId, attempt: u32 },
    /// Max attempts reached, giving up
    GaveUp { id: DeviceId },
    /// Device no longer registered
    Removed { id: DeviceId },
}

#[derive(Debug, Clone, Default)]
struct ReconnectState {
    attempts: u32,
    is_reconnecting: bool,
    reconnects: u32,
}

/// Background reconnect supervisor for one device
pub struct Reconnector {
    config: ReconnectConfig,
    registry: Arc<DeviceRegistry>,
    id: DeviceId,
    state: Arc<RwLock<ReconnectState>>,
    event_tx: Sender<ReconnectEvent>,
    cancel_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Reconnector {
    pub fn new(
        config: ReconnectConfig,
        registry: Arc<DeviceRegistry>,
        id: DeviceId,
        event_tx: Sender<ReconnectEvent>,
    ) -> Self {
        Self {
            config,
            registry,
            id,
            state: Arc::new(RwLock::new(ReconnectState::default())),
            event_tx,
            cancel_tx: None,
            worker: None,
        }
    }

    /// Start supervising on a background thread
    pub fn start(&mut self) -> std::io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
        self.cancel_tx = Some(cancel_tx);

        let config = self.config.clone();
        let registry = Arc::clone(&self.registry);
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let id = self.id;

        let handle = thread::Builder::new()
            .name(format!("3space-reconnect {id}"))
            .spawn(move || supervise(config, registry, id, state, event_tx, cancel_rx))?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Stop supervising and wait for the thread
    pub fn stop(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    /// Consecutive failed attempts so far
    pub fn attempts(&self) -> u32 {
        self.state.read().attempts
    }

    /// Successful reconnects since start
    pub fn reconnects(&self) -> u32 {
        self.state.read().reconnects
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state.read().is_reconnecting
    }

    /// Reset the attempt counter
    pub fn reset(&self) {
        self.state.write().attempts = 0;
    }
}

impl Drop for Reconnector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn supervise(
    config: ReconnectConfig,
    registry: Arc<DeviceRegistry>,
    id: DeviceId,
    state: Arc<RwLock<ReconnectState>>,
    event_tx: Sender<ReconnectEvent>,
    cancel_rx: Receiver<()>,
) {
    loop {
        match cancel_rx.recv_timeout(config.delay) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                info!(%id, "Reconnect supervision stopped");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        if registry.get(id).is_err() {
            let _ = event_tx.send(ReconnectEvent::Removed { id });
            break;
        }
        if registry.is_device_there(id, false) {
            state.write().attempts = 0;
            continue;
        }

        let attempt = {
            let mut s = state.write();
            if config.max_attempts > 0 && s.attempts >= config.max_attempts {
                drop(s);
                let _ = event_tx.send(ReconnectEvent::GaveUp { id });
                break;
            }
            s.attempts += 1;
            s.is_reconnecting = true;
            s.attempts
        };
        let _ = event_tx.send(ReconnectEvent::Reconnecting {
            id,
            attempt,
            max: config.max_attempts,
        });

        if registry.is_device_there(id, true) {
            {
                let mut s = state.write();
                s.attempts = 0;
                s.is_reconnecting = false;
                s.reconnects += 1;
            }
            info!(%id, "Reconnected");
            let _ = event_tx.send(ReconnectEvent::Reconnected { id });
        } else {
            state.write().is_reconnecting = false;
            warn!(%id, attempt, "Reconnect failed");
            let _ = event_tx.send(ReconnectEvent::ReconnectFailed { id, attempt });
        }
    }
}
