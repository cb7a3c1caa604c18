//! Porter: local port reservation with per-port dispatch values.
//!
//! Ports in `[PORTER_MIN_EPHEMERAL, 65535]` are handed out by
//! `reserve_ephemeral` from a moving cursor; any port can be claimed
//! explicitly with `reserve`. Releasing is idempotent and a released port
//! is immediately reusable.

use crate::error::{AppError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// First port of the ephemeral range.
pub const PORTER_MIN_EPHEMERAL: u16 = 49152;

struct PorterState<V> {
    ports: HashMap<u16, V>,
    cursor: u16,
}

struct PorterInner<V> {
    state: Mutex<PorterState<V>>,
}

/// Reservation table for local ports.
pub struct Porter<V> {
    inner: Arc<PorterInner<V>>,
}

impl<V> Clone for Porter<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Default for Porter<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Porter<V> {
    /// Create an empty porter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PorterInner {
                state: Mutex::new(PorterState {
                    ports: HashMap::new(),
                    cursor: PORTER_MIN_EPHEMERAL,
                }),
            }),
        }
    }

    /// Bind a specific `port` to `value`.
    ///
    /// Returns the release handle, or `None` if the port is taken.
    #[must_use]
    pub fn reserve(&self, port: u16, value: V) -> Option<PortGuard<V>> {
        let mut state = self.lock();
        if state.ports.contains_key(&port) {
            return None;
        }
        state.ports.insert(port, value);
        Some(PortGuard::new(Arc::clone(&self.inner), port))
    }

    /// Bind the next free ephemeral port to `value`.
    ///
    /// # Errors
    ///
    /// `PortsExhausted` when the whole range is reserved.
    pub fn reserve_ephemeral(&self, value: V) -> Result<(u16, PortGuard<V>)> {
        let mut state = self.lock();
        let span = usize::from(u16::MAX - PORTER_MIN_EPHEMERAL) + 1;
        for _ in 0..span {
            let port = state.cursor;
            state.cursor = if port == u16::MAX {
                PORTER_MIN_EPHEMERAL
            } else {
                port + 1
            };
            if !state.ports.contains_key(&port) {
                state.ports.insert(port, value);
                return Ok((port, PortGuard::new(Arc::clone(&self.inner), port)));
            }
        }
        Err(AppError::PortsExhausted)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PorterState<V>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<V: Clone> Porter<V> {
    /// Value stored under `port`, if reserved.
    #[must_use]
    pub fn value(&self, port: u16) -> Option<V> {
        self.lock().ports.get(&port).cloned()
    }
}

/// Idempotent release handle for one reserved port.
///
/// Dropping the guard releases the port as well.
pub struct PortGuard<V> {
    inner: Arc<PorterInner<V>>,
    port: u16,
    released: AtomicBool,
}

impl<V> PortGuard<V> {
    fn new(inner: Arc<PorterInner<V>>, port: u16) -> Self {
        Self {
            inner,
            port,
            released: AtomicBool::new(false),
        }
    }

    /// The reserved port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Release the port. Safe to call any number of times.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .ports
            .remove(&self.port);
    }
}

impl<V> Drop for PortGuard<V> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_conflict() {
        let porter: Porter<u8> = Porter::new();
        let guard = porter.reserve(80, 1).unwrap();
        assert!(porter.reserve(80, 2).is_none());
        assert_eq!(porter.value(80), Some(1));
        drop(guard);
        assert!(porter.reserve(80, 3).is_some());
    }

    #[test]
    fn test_release_is_idempotent() {
        let porter: Porter<u8> = Porter::new();
        let guard = porter.reserve(80, 1).unwrap();
        guard.release();
        guard.release();
        assert!(porter.value(80).is_none());

        // a released port is immediately reusable
        let _again = porter.reserve(80, 2).unwrap();
        assert_eq!(porter.value(80), Some(2));
    }

    #[test]
    fn test_ephemeral_cursor_moves() {
        let porter: Porter<u8> = Porter::new();
        let (p1, _g1) = porter.reserve_ephemeral(1).unwrap();
        let (p2, _g2) = porter.reserve_ephemeral(2).unwrap();
        assert!(p1 >= PORTER_MIN_EPHEMERAL);
        assert!(p2 >= PORTER_MIN_EPHEMERAL);
        assert_ne!(p1, p2);
    }

    #[test]
    fn test_ephemeral_skips_reserved() {
        let porter: Porter<u8> = Porter::new();
        let _explicit = porter.reserve(PORTER_MIN_EPHEMERAL, 0).unwrap();
        let (port, _guard) = porter.reserve_ephemeral(1).unwrap();
        assert_ne!(port, PORTER_MIN_EPHEMERAL);
    }

    #[test]
    fn test_ephemeral_reuses_released_port() {
        let porter: Porter<u8> = Porter::new();
        let (port, guard) = porter.reserve_ephemeral(1).unwrap();
        guard.release();
        assert!(porter.reserve(port, 2).is_some());
    }
}
