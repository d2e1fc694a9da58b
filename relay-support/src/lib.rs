//! Shared support code for the relay workspace: error taxonomy, logging
//! setup, time helpers and configuration loading. Kept separate from
//! `relay-core` so the engine crate stays free of anything that isn't
//! directly part of packet relaying.

pub mod config;
pub mod error;
pub mod logging;
pub mod time;

pub use error::{FatalReason, RelayError, RelayResult, ResultExt};
