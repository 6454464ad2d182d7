//! Core module containing the 3-Space protocol engine
//!
//! This module provides:
//! - Frame codec and command table for the 3-Space binary protocol
//! - Transport channels with a delivery thread per link
//! - Device sessions with a `Created -> Active -> Closed` lifecycle
//! - Wireless multiplexing through dongles, with bounded retries and backpressure
//! - Streaming engine with cached, blocking, callback and channel delivery
//! - Device registry, port discovery and traffic capture
//! - A virtual device for running without hardware

pub mod capability;
pub mod capture;
pub mod channel;
pub mod device;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod simulator;
pub mod stream;
pub mod transport;
pub mod wireless;
