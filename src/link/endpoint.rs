//! Channel link endpoint shared between the engine and the bridge.
//!
//! # Responsibilities
//! - Queue outbound units written by the engine, bounded by depth
//! - Notify registered pumps after every accepted write
//! - Hand inbound units to the engine's network dispatcher

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytes::Bytes;

use crate::engine::EngineError;
use crate::link::frame::{MacAddress, NetworkProtocol};
use crate::observability::metrics;

/// Called after the engine queued an outbound unit. May run on any thread.
pub trait WriteNotify: Send + Sync {
    fn write_notify(&self);
}

/// Engine side of a NIC: accepts inbound units.
pub trait NetworkDispatcher: Send + Sync {
    fn deliver_network_packet(&self, protocol: NetworkProtocol, packet: Bytes);
}

pub struct ChannelEndpoint {
    queue: Mutex<VecDeque<Bytes>>,
    depth: usize,
    mtu: u32,
    link_address: Option<MacAddress>,
    notify: Mutex<Vec<Weak<dyn WriteNotify>>>,
    dispatcher: OnceLock<Arc<dyn NetworkDispatcher>>,
}

impl ChannelEndpoint {
    /// Ethernet endpoints carry a link address; IP endpoints don't.
    pub fn new(depth: usize, mtu: u32, link_address: Option<MacAddress>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(depth.min(64))),
            depth,
            mtu,
            link_address,
            notify: Mutex::new(Vec::new()),
            dispatcher: OnceLock::new(),
        }
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn link_address(&self) -> Option<MacAddress> {
        self.link_address
    }

    /// Register a notification target. Dropped targets are pruned on write.
    pub fn add_notify(&self, target: Weak<dyn WriteNotify>) {
        self.notify.lock().expect("notify list mutex poisoned").push(target);
    }

    /// Attach the engine dispatcher. Only the first attachment takes effect.
    pub fn attach(&self, dispatcher: Arc<dyn NetworkDispatcher>) -> bool {
        self.dispatcher.set(dispatcher).is_ok()
    }

    /// Queue an outbound unit. Fails without blocking when the queue is full.
    pub fn write_packet(&self, packet: Bytes) -> Result<(), EngineError> {
        {
            let mut queue = self.queue.lock().expect("endpoint queue mutex poisoned");
            if queue.len() >= self.depth {
                metrics::record_frame_dropped();
                return Err(EngineError::new("endpoint queue is full"));
            }
            queue.push_back(packet);
        }

        let targets: Vec<Arc<dyn WriteNotify>> = {
            let mut notify = self.notify.lock().expect("notify list mutex poisoned");
            notify.retain(|target| target.strong_count() > 0);
            notify.iter().filter_map(Weak::upgrade).collect()
        };
        for target in targets {
            target.write_notify();
        }
        Ok(())
    }

    /// Pop the oldest queued unit without blocking.
    pub fn read(&self) -> Option<Bytes> {
        self.queue.lock().expect("endpoint queue mutex poisoned").pop_front()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().expect("endpoint queue mutex poisoned").len()
    }

    /// Deliver an inbound unit to the engine.
    pub fn inject_inbound(&self, protocol: NetworkProtocol, packet: Bytes) -> Result<(), EngineError> {
        let dispatcher = self
            .dispatcher
            .get()
            .ok_or_else(|| EngineError::new("endpoint is not attached to a NIC"))?;
        dispatcher.deliver_network_packet(protocol, packet);
        Ok(())
    }
}

impl fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEndpoint")
            .field("depth", &self.depth)
            .field("mtu", &self.mtu)
            .field("link_address", &self.link_address)
            .field("attached", &self.dispatcher.get().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl WriteNotify for Counter {
        fn write_notify(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn queue_is_fifo_and_notifies() {
        let endpoint = ChannelEndpoint::new(4, 1500, None);
        let counter = Arc::new(Counter::default());
        let weak: Weak<dyn WriteNotify> = Arc::downgrade(&counter) as Weak<dyn WriteNotify>;
        endpoint.add_notify(weak);

        endpoint.write_packet(Bytes::from_static(b"one")).unwrap();
        endpoint.write_packet(Bytes::from_static(b"two")).unwrap();

        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        assert_eq!(endpoint.read().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(endpoint.read().unwrap(), Bytes::from_static(b"two"));
        assert!(endpoint.read().is_none());
    }

    #[test]
    fn full_queue_rejects_writes() {
        let endpoint = ChannelEndpoint::new(1, 1500, None);
        endpoint.write_packet(Bytes::from_static(b"a")).unwrap();
        assert!(endpoint.write_packet(Bytes::from_static(b"b")).is_err());
        assert_eq!(endpoint.queued(), 1);
    }

    #[test]
    fn inject_without_nic_fails() {
        let endpoint = ChannelEndpoint::new(1, 1500, None);
        assert!(endpoint
            .inject_inbound(NetworkProtocol::IPV4, Bytes::from_static(b"x"))
            .is_err());
    }
}
