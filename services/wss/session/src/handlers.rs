//! Single-slot application callbacks.
//!
//! Each event kind has one slot. Setting a handler replaces the previous one;
//! invocation clones the current handler out of the slot first, so a handler
//! may replace itself without deadlocking.

use std::sync::{Arc, RwLock};

use crate::registry::SessionId;
use crate::transport::CloseInfo;

/// Server text handler
pub type SessionTextFn = dyn Fn(SessionId, &str) + Send + Sync;
/// Server binary handler
pub type SessionBinaryFn = dyn Fn(SessionId, &[u8]) + Send + Sync;
/// Server lifecycle handler
pub type SessionEventFn = dyn Fn(SessionId) + Send + Sync;
/// Client text handler
pub type TextFn = dyn Fn(&str) + Send + Sync;
/// Client binary handler
pub type BinaryFn = dyn Fn(&[u8]) + Send + Sync;
/// Client open handler
pub type OpenFn = dyn Fn() + Send + Sync;
/// Client close handler
pub type CloseFn = dyn Fn(&CloseInfo) + Send + Sync;

/// Holds at most one handler
pub struct Slot<F: ?Sized> {
    inner: RwLock<Option<Arc<F>>>,
}

impl<F: ?Sized> Slot<F> {
    /// Empty slot
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Install `handler`, replacing any previous one
    pub fn set(&self, handler: Arc<F>) {
        *self.inner.write().unwrap_or_else(|p| p.into_inner()) = Some(handler);
    }

    /// Remove the handler
    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Current handler
    pub fn get(&self) -> Option<Arc<F>> {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Whether a handler is installed
    pub fn is_set(&self) -> bool {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).is_some()
    }
}

impl<F: ?Sized> Default for Slot<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-side handler slots
#[derive(Default)]
pub struct ServerHandlers {
    /// A connection was registered
    pub open: Slot<SessionEventFn>,
    /// A connection passed authentication
    pub authenticated: Slot<SessionEventFn>,
    /// Text payload from a session
    pub text: Slot<SessionTextFn>,
    /// Binary payload from a session
    pub binary: Slot<SessionBinaryFn>,
    /// A session was unregistered
    pub close: Slot<SessionEventFn>,
}

/// Client-side handler slots
#[derive(Default)]
pub struct ClientHandlers {
    /// Connection established
    pub open: Slot<OpenFn>,
    /// Text payload from the server
    pub text: Slot<TextFn>,
    /// Binary payload from the server
    pub binary: Slot<BinaryFn>,
    /// Connection ended
    pub close: Slot<CloseFn>,
}
