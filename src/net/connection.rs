//! Connection state machine.
//!
//! # Responsibilities
//! - Track state (Uninitialized → Connecting → Connected → Closed)
//! - Hold the engine transport once the dial or accept path installs it
//! - Release tasks waiting for the connection to become usable
//! - Own the idle timer
//!
//! # Design Decisions
//! - The installed transport is the source of truth for "connected"; the
//!   wake on `connected` is best effort and may be missed harmlessly
//! - State moves by compare-and-swap only, so exactly one caller wins
//!   each transition
//! - `end` and `close` bookkeeping lives here so each is emitted once

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::Notify;

use crate::engine::TransportConn;
use crate::error::{BridgeError, Result};
use crate::net::timeout::{Arming, IdleTimer, TimerState};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created, no connect requested yet.
    Uninitialized = 0,
    /// Dial in flight.
    Connecting = 1,
    /// Transport installed.
    Connected = 2,
    /// Terminal.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Closed,
        }
    }
}

pub struct Connection {
    state: AtomicU8,
    transport: OnceLock<Arc<dyn TransportConn>>,
    connected: Notify,
    idle: IdleTimer,
    ended: AtomicBool,
    close_emitted: AtomicBool,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Uninitialized as u8),
            transport: OnceLock::new(),
            connected: Notify::new(),
            idle: IdleTimer::default(),
            ended: AtomicBool::new(false),
            close_emitted: AtomicBool::new(false),
        }
    }

    /// Wrap a transport produced by an accept loop.
    pub fn accepted(transport: Arc<dyn TransportConn>) -> Self {
        let connection = Self::new();
        let _ = connection.transport.set(transport);
        connection
            .state
            .store(ConnectionState::Connected as u8, Ordering::SeqCst);
        connection
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn transport(&self) -> Option<Arc<dyn TransportConn>> {
        self.transport.get().cloned()
    }

    pub fn idle(&self) -> &IdleTimer {
        &self.idle
    }

    pub fn timer_state(&self) -> TimerState {
        self.idle.state()
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Uninitialized → Connecting.
    pub fn begin_connect(&self) -> Result<()> {
        if self.transition(ConnectionState::Uninitialized, ConnectionState::Connecting) {
            Ok(())
        } else {
            Err(BridgeError::AlreadyConnected)
        }
    }

    /// Connecting → Connected with `transport`.
    ///
    /// Returns `false` if the socket closed while the dial was in flight; the
    /// transport is closed then.
    pub fn install(&self, transport: Arc<dyn TransportConn>) -> bool {
        if self.transport.set(Arc::clone(&transport)).is_err() {
            let _ = transport.close();
            return false;
        }
        let installed = self.transition(ConnectionState::Connecting, ConnectionState::Connected);
        if !installed {
            let _ = transport.close();
        }
        self.connected.notify_waiters();
        installed
    }

    /// Connecting → Closed after a failed dial.
    pub fn fail(&self) -> bool {
        let failed = self.transition(ConnectionState::Connecting, ConnectionState::Closed);
        self.connected.notify_waiters();
        failed
    }

    /// Move to Closed from any state. Returns `true` for the caller that
    /// made the transition; only that caller tears the transport down.
    pub fn shutdown(&self) -> bool {
        let previous = self.state.swap(ConnectionState::Closed as u8, Ordering::SeqCst);
        if ConnectionState::from_u8(previous) == ConnectionState::Closed {
            return false;
        }
        self.idle.cancel();
        self.connected.notify_waiters();
        true
    }

    /// Wait until a transport is installed.
    pub async fn wait_connected(&self) -> Result<Arc<dyn TransportConn>> {
        loop {
            let notified = self.connected.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state() == ConnectionState::Closed {
                return Err(BridgeError::NotConnected);
            }
            if let Some(transport) = self.transport.get() {
                return Ok(Arc::clone(transport));
            }
            notified.await;
        }
    }

    /// Record activity for the idle timer.
    pub fn pulse(&self) {
        self.idle.pulse();
    }

    /// Configure the idle timeout. A closed connection keeps the value but
    /// is never armed.
    pub(crate) fn set_idle_timeout(&self, timeout: Duration) -> Option<Arming> {
        let arming = self.idle.rearm(timeout);
        if self.state() == ConnectionState::Closed {
            self.idle.cancel();
            return None;
        }
        arming
    }

    /// Claim the single `end` emission.
    pub(crate) fn mark_ended(&self) -> bool {
        !self.close_emitted.load(Ordering::SeqCst) && !self.ended.swap(true, Ordering::SeqCst)
    }

    /// Claim the single `close` emission.
    pub(crate) fn mark_close_emitted(&self) -> bool {
        !self.close_emitted.swap(true, Ordering::SeqCst)
    }

    /// Whether `end` or `close` has been emitted; no data follows either.
    pub(crate) fn is_finished(&self) -> bool {
        self.ended.load(Ordering::SeqCst) || self.close_emitted.load(Ordering::SeqCst)
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("installed", &self.transport.get().is_some())
            .field("idle_timeout", &self.idle.timeout())
            .finish_non_exhaustive()
    }
}
