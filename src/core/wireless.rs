//! Wireless multiplexer
//!
//! Routes commands for wireless sensors through their dongle's channel. The
//! dongle accepts at most [`WIRELESS_SLOTS`] commands in flight; past that,
//! [`WirelessMux::submit`] fails fast with `StreamSlotsFull` before writing
//! anything. On top of the dongle's own hardware retries, a bounded software
//! retry resends a command whose response timed out.

use super::channel::{Pending, RawResponse, TransportChannel};
use super::error::{Error, Result};
use super::protocol::framing::{Addressing, MAX_LOGICAL_ID};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outstanding-command capacity of a dongle, and its logical id table size
pub const WIRELESS_SLOTS: usize = 15;
/// Default software retries per wireless command
pub const DEFAULT_SOFTWARE_RETRIES: u8 = 3;
/// Upper bound on software retries
pub const MAX_SOFTWARE_RETRIES: u8 = 10;
/// Upper bound on the dongle's own per-command retries
pub const MAX_HARDWARE_RETRIES: u8 = 3;

/// Logical id to serial number mapping of one dongle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WirelessTable {
    serials: [u32; WIRELESS_SLOTS],
}

impl WirelessTable {
    fn check(idx: u8) -> Result<usize> {
        if idx > MAX_LOGICAL_ID {
            return Err(Error::InvalidIndex(idx));
        }
        Ok(usize::from(idx))
    }

    /// Serial at `idx`; 0 means empty
    pub fn get(&self, idx: u8) -> Result<u32> {
        Ok(self.serials[Self::check(idx)?])
    }

    pub fn set(&mut self, idx: u8, serial: u32) -> Result<()> {
        self.serials[Self::check(idx)?] = serial;
        Ok(())
    }

    /// Logical id holding `serial`
    pub fn find(&self, serial: u32) -> Option<u8> {
        if serial == 0 {
            return None;
        }
        self.serials
            .iter()
            .position(|&s| s == serial)
            .and_then(|p| u8::try_from(p).ok())
    }

    /// Occupied `(logical id, serial)` pairs
    pub fn entries(&self) -> Vec<(u8, u32)> {
        self.serials
            .iter()
            .enumerate()
            .filter(|(_, &s)| s != 0)
            .filter_map(|(i, &s)| u8::try_from(i).ok().map(|i| (i, s)))
            .collect()
    }
}

#[derive(Debug, Default)]
struct Outstanding {
    generation: u64,
    count: usize,
}

/// Per-dongle wireless command router
pub struct WirelessMux {
    channel: Arc<TransportChannel>,
    outstanding: Mutex<Outstanding>,
    capacity: usize,
    retries: AtomicU8,
    table: RwLock<WirelessTable>,
}

impl WirelessMux {
    pub fn new(channel: Arc<TransportChannel>, retries: u8) -> Arc<Self> {
        Arc::new(Self {
            channel,
            outstanding: Mutex::new(Outstanding::default()),
            capacity: WIRELESS_SLOTS,
            retries: AtomicU8::new(retries.min(MAX_SOFTWARE_RETRIES)),
            table: RwLock::new(WirelessTable::default()),
        })
    }

    /// The dongle's channel
    pub fn channel(&self) -> &Arc<TransportChannel> {
        &self.channel
    }

    /// Commands currently awaiting a response
    pub fn outstanding(&self) -> usize {
        let generation = self.channel.generation();
        let out = self.outstanding.lock();
        if out.generation == generation {
            out.count
        } else {
            0
        }
    }

    pub fn software_retries(&self) -> u8 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn set_software_retries(&self, retries: u8) -> Result<()> {
        if retries > MAX_SOFTWARE_RETRIES {
            return Err(Error::Parameter(format!(
                "software retries {retries} exceeds maximum {MAX_SOFTWARE_RETRIES}"
            )));
        }
        self.retries.store(retries, Ordering::Relaxed);
        Ok(())
    }

    /// Snapshot of the logical id table
    pub fn table(&self) -> WirelessTable {
        *self.table.read()
    }

    pub fn set_table_entry(&self, idx: u8, serial: u32) -> Result<()> {
        self.table.write().set(idx, serial)
    }

    fn acquire(&self) -> Result<u64> {
        let generation = self.channel.generation();
        let mut out = self.outstanding.lock();
        if out.generation != generation {
            out.generation = generation;
            out.count = 0;
        }
        if out.count >= self.capacity {
            return Err(Error::StreamSlotsFull(out.count));
        }
        out.count += 1;
        Ok(generation)
    }

    fn release(&self, generation: u64) {
        let mut out = self.outstanding.lock();
        if out.generation == generation {
            out.count = out.count.saturating_sub(1);
        }
    }

    /// Queue a command for the sensor at `logical_id` without waiting
    pub fn submit(
        self: &Arc<Self>,
        logical_id: u8,
        command: u8,
        payload: Bytes,
    ) -> Result<WirelessPending> {
        if logical_id > MAX_LOGICAL_ID {
            return Err(Error::InvalidIndex(logical_id));
        }
        let generation = self.acquire()?;
        let pending = match self
            .channel
            .send(Addressing::Wireless(logical_id), command, &payload)
        {
            Ok(p) => p,
            Err(e) => {
                self.release(generation);
                return Err(e);
            }
        };

        Ok(WirelessPending {
            mux: Arc::clone(self),
            logical_id,
            command,
            payload,
            pending: Some(pending),
            generation,
            attempts: 1,
        })
    }
}

/// A wireless command in flight; holds one outstanding slot until dropped
pub struct WirelessPending {
    mux: Arc<WirelessMux>,
    logical_id: u8,
    command: u8,
    payload: Bytes,
    pending: Option<Pending>,
    generation: u64,
    attempts: u32,
}

impl WirelessPending {
    /// Transmissions so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait for the response, resending on timeout up to the retry bound.
    ///
    /// `timeout` applies to each attempt.
    pub fn wait(mut self, timeout: Duration) -> Result<RawResponse> {
        let max_attempts = u32::from(self.mux.software_retries()) + 1;
        loop {
            let result = match self.pending.take() {
                Some(pending) => pending.wait(timeout).and_then(|resp| {
                    if resp.header.is_ok() {
                        Ok(resp)
                    } else {
                        debug!(
                            lid = self.logical_id,
                            cmd = self.command,
                            "Dongle gave up after hardware retries"
                        );
                        Err(Error::Timeout(timeout.as_millis() as u64))
                    }
                }),
                None => Err(Error::Read("no command in flight".into())),
            };

            match result {
                Err(e) if e.is_retryable() && self.attempts < max_attempts => {
                    warn!(
                        lid = self.logical_id,
                        cmd = self.command,
                        attempt = self.attempts + 1,
                        "Wireless command timed out, retrying"
                    );
                    self.pending = Some(self.mux.channel.send(
                        Addressing::Wireless(self.logical_id),
                        self.command,
                        &self.payload,
                    )?);
                    self.attempts += 1;
                }
                other => return other,
            }
        }
    }
}

impl Drop for WirelessPending {
    fn drop(&mut self) {
        self.mux.release(self.generation);
    }
}
