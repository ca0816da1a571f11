//! Outbound packet pump.
//!
//! # Data Flow
//! ```text
//! engine thread: ChannelEndpoint::write_packet
//!     → WriteNotify::write_notify → drain (under drain lock)
//!     → bounded hand-off channel
//!     → forwarding task (one per endpoint)
//!     → DeferredInvoker → host event
//! ```
//!
//! # Design Decisions
//! - Draining never blocks the notifying thread; when the hand-off channel
//!   is full, units stay queued in the endpoint
//! - The forwarding task re-drains after every delivery, so nothing queued
//!   is stranded
//! - One drain lock plus one consumer keeps delivery in production order

use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::host::deferred::DeferredInvoker;
use crate::host::events::Event;
use crate::host::HostObject;
use crate::link::endpoint::{ChannelEndpoint, WriteNotify};
use crate::observability::metrics;

/// Where pumped units surface on the host.
#[derive(Debug, Clone, Copy)]
pub struct PumpTarget {
    pub object: HostObject,
    pub make_event: fn(Bytes) -> Event,
    /// Metrics label.
    pub direction: &'static str,
}

pub struct PacketPump {
    endpoint: Arc<ChannelEndpoint>,
    tx: mpsc::Sender<Bytes>,
    drain_lock: Mutex<()>,
}

impl PacketPump {
    /// Register on `endpoint` and spawn the forwarding task.
    ///
    /// Must be called from within a tokio runtime. The task ends once the
    /// returned pump is dropped or the host loop goes away.
    pub fn start(
        endpoint: Arc<ChannelEndpoint>,
        depth: usize,
        invoker: DeferredInvoker,
        target: PumpTarget,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let pump = Arc::new(Self {
            endpoint: Arc::clone(&endpoint),
            tx,
            drain_lock: Mutex::new(()),
        });
        let weak = Arc::downgrade(&pump);
        endpoint.add_notify(weak.clone() as Weak<dyn WriteNotify>);
        tokio::spawn(forward(weak, rx, invoker, target));

        // Units written before registration.
        pump.drain();
        pump
    }

    pub fn endpoint(&self) -> &Arc<ChannelEndpoint> {
        &self.endpoint
    }

    /// Move queued units into the hand-off channel until it is full or the
    /// endpoint is empty.
    fn drain(&self) {
        let _guard = self.drain_lock.lock().expect("pump drain mutex poisoned");
        loop {
            let Ok(permit) = self.tx.try_reserve() else {
                return;
            };
            match self.endpoint.read() {
                Some(unit) => permit.send(unit),
                None => return,
            }
        }
    }
}

impl WriteNotify for PacketPump {
    fn write_notify(&self) {
        self.drain();
    }
}

async fn forward(
    pump: Weak<PacketPump>,
    mut rx: mpsc::Receiver<Bytes>,
    invoker: DeferredInvoker,
    target: PumpTarget,
) {
    while let Some(unit) = rx.recv().await {
        if let Some(pump) = pump.upgrade() {
            pump.drain();
        }
        metrics::record_frame_forwarded(target.direction);

        let PumpTarget { object, make_event, .. } = target;
        if !invoker.defer(move |host| {
            host.emit(object, make_event(unit));
        }) {
            break;
        }
    }
    tracing::debug!(target_object = %target.object, "Packet pump stopped");
}

impl std::fmt::Debug for PacketPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketPump")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
