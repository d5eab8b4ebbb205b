//! Telemetry synchronization layer for the drowsiness-detection operator dashboard.
//!
//! Three live feeds are kept consistent with an unreliable backend:
//! metric samples over a WebSocket ([`buffer`]), event notifications over a
//! WebSocket resolved through HTTP lookups ([`events`]), and polled camera
//! frames with fallback and recovery ([`feed`]). [`dashboard`] wires them
//! together and owns their lifecycles.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod events;
pub mod feed;
pub mod logging;

use std::sync::{Mutex, MutexGuard};

/// Lock a component's state, recovering it if a previous holder panicked.
/// Critical sections never await, so the data is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
