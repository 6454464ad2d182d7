//! Utilities

pub mod autoconnect;
