//! Idle-timeout supervision for one connection.
//!
//! # Responsibilities
//! - Hold the configured idle timeout and its armed/disarmed sub-state
//! - Coalesce activity pulses from reads and writes
//! - Run one supervisor task per arming, retiring the previous one first
//!
//! # Design Decisions
//! - Each arming gets a fresh epoch; the host-side fire checks it, so a
//!   superseded supervisor can never emit `timeout`
//! - Firing disarms; later activity does not re-arm
//! - A callback belongs to its arming: it runs only if that arming fires
//!   and is discarded when the arming is retired
//! - The socket stays open when the timeout fires

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::host::{CallbackId, Completion, CompletionGuard, DeferredInvoker, Event, Host, HostObject};
use crate::net::connection::Connection;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Armed,
    Disarmed,
}

#[derive(Debug, Default)]
struct IdleInner {
    timeout: Duration,
    epoch: u64,
    armed: bool,
    pulse: Option<mpsc::Sender<()>>,
    reset: Option<oneshot::Sender<()>>,
    last: Option<Completion>,
}

impl IdleInner {
    /// Tell the current supervisor (if any) to exit.
    fn retire(&mut self) {
        self.epoch += 1;
        self.armed = false;
        self.pulse = None;
        if let Some(reset) = self.reset.take() {
            let _ = reset.send(());
        }
        if self.last.as_ref().is_some_and(Completion::is_done) {
            self.last = None;
        }
    }
}

#[derive(Debug, Default)]
pub struct IdleTimer {
    inner: Mutex<IdleInner>,
}

/// Everything a new supervisor needs, handed out by [`IdleTimer::rearm`].
#[derive(Debug)]
pub(crate) struct Arming {
    epoch: u64,
    timeout: Duration,
    pulses: mpsc::Receiver<()>,
    reset: oneshot::Receiver<()>,
    previous: Option<Completion>,
    guard: CompletionGuard,
    completion: Completion,
}

impl Arming {
    pub(crate) fn completion(&self) -> Completion {
        self.completion.clone()
    }
}

impl IdleTimer {
    pub fn timeout(&self) -> Duration {
        self.inner.lock().expect("idle timer mutex poisoned").timeout
    }

    pub fn state(&self) -> TimerState {
        if self.inner.lock().expect("idle timer mutex poisoned").armed {
            TimerState::Armed
        } else {
            TimerState::Disarmed
        }
    }

    /// Replace the timeout. A zero duration only cancels.
    pub(crate) fn rearm(&self, timeout: Duration) -> Option<Arming> {
        let mut inner = self.inner.lock().expect("idle timer mutex poisoned");
        inner.retire();
        inner.timeout = timeout;
        if timeout.is_zero() {
            return None;
        }

        let (pulse_tx, pulses) = mpsc::channel(1);
        let (reset_tx, reset) = oneshot::channel();
        let (guard, completion) = Completion::tracked();
        inner.armed = true;
        inner.pulse = Some(pulse_tx);
        inner.reset = Some(reset_tx);
        let previous = inner
            .last
            .replace(completion.clone())
            .filter(|previous| !previous.is_done());

        Some(Arming {
            epoch: inner.epoch,
            timeout,
            pulses,
            reset,
            previous,
            guard,
            completion,
        })
    }

    /// Stop supervising. The configured value is kept.
    pub(crate) fn cancel(&self) {
        self.inner.lock().expect("idle timer mutex poisoned").retire();
    }

    /// Record activity. Never blocks; pulses coalesce.
    pub(crate) fn pulse(&self) {
        let inner = self.inner.lock().expect("idle timer mutex poisoned");
        if let Some(pulse) = &inner.pulse {
            let _ = pulse.try_send(());
        }
    }

    /// Claim the right to emit `timeout` for `epoch`. Runs on the host.
    fn fire(&self, epoch: u64) -> bool {
        let mut inner = self.inner.lock().expect("idle timer mutex poisoned");
        if !inner.armed || inner.epoch != epoch {
            return false;
        }
        inner.armed = false;
        inner.pulse = None;
        inner.reset = None;
        // The firing supervisor finishes on this same host turn.
        inner.last = None;
        true
    }
}

/// Watch `connection` for idleness until reset or fired.
///
/// `callback` runs just before the `timeout` event, and only if this arming
/// is still current when it fires.
pub(crate) async fn supervise(
    connection: Arc<Connection>,
    arming: Arming,
    callback: Option<CallbackId<()>>,
    invoker: DeferredInvoker,
    target: HostObject,
) {
    let Arming {
        epoch,
        timeout,
        mut pulses,
        mut reset,
        previous,
        guard,
        completion: _,
    } = arming;

    if let Some(previous) = previous {
        previous.wait().await;
    }

    let elapsed = watch(&connection, timeout, &mut pulses, &mut reset).await;
    if !elapsed && callback.is_none() {
        return;
    }

    invoker.defer(move |host| {
        if elapsed && connection.idle().fire(epoch) {
            metrics::record_idle_timeout();
            tracing::debug!(object = %target, timeout_ms = timeout.as_millis() as u64, "Idle timeout");
            if let Some(callback) = callback {
                host.invoke_callback(callback, ());
            }
            host.emit(target, Event::Timeout);
        } else if let Some(callback) = callback {
            discard(host, callback);
        }
        drop(guard);
    });
}

/// `true` once `timeout` passes without activity; `false` on reset or if
/// the connection never comes up.
async fn watch(
    connection: &Connection,
    timeout: Duration,
    pulses: &mut mpsc::Receiver<()>,
    reset: &mut oneshot::Receiver<()>,
) -> bool {
    tokio::select! {
        _ = &mut *reset => return false,
        connected = connection.wait_connected() => {
            if connected.is_err() {
                return false;
            }
        }
    }

    loop {
        tokio::select! {
            _ = &mut *reset => return false,
            _ = tokio::time::sleep(timeout) => return true,
            Some(()) = pulses.recv() => continue,
        }
    }
}

fn discard(host: &mut Host, callback: CallbackId<()>) {
    if host.take_callback(callback).is_some() {
        tracing::trace!(callback = ?callback, "Retired timeout callback dropped");
    }
}
