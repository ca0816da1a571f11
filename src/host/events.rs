//! Named event listeners per host object.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;

use crate::error::BridgeError;
use crate::host::Host;
use crate::net::socket::Socket;

/// Events observable on host objects.
#[derive(Debug)]
pub enum Event {
    Connect,
    Data(Bytes),
    End,
    Error(BridgeError),
    Timeout,
    Close,
    Listening,
    Connection(Socket),
    /// Ethernet frame leaving a tap interface.
    Frame(Bytes),
    /// IP packet leaving a tun interface.
    Packet(Bytes),
    /// Ethernet frame leaving a stack's own NIC.
    OutboundEthernetFrame(Bytes),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connect => "connect",
            Event::Data(_) => "data",
            Event::End => "end",
            Event::Error(_) => "error",
            Event::Timeout => "timeout",
            Event::Close => "close",
            Event::Listening => "listening",
            Event::Connection(_) => "connection",
            Event::Frame(_) => "frame",
            Event::Packet(_) => "packet",
            Event::OutboundEthernetFrame(_) => "outbound-ethernet-frame",
        }
    }
}

/// Identity of one registered listener, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub(crate) type Listener = Rc<dyn Fn(&mut Host, &Event)>;

struct Registration {
    id: ListenerId,
    once: bool,
    listener: Listener,
}

/// Ordered listener lists keyed by event name.
#[derive(Default)]
pub struct EventEmitter {
    listeners: HashMap<&'static str, Vec<Registration>>,
    next_id: u64,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&mut self, name: &'static str, listener: F) -> ListenerId
    where
        F: Fn(&mut Host, &Event) + 'static,
    {
        self.register(name, false, Rc::new(listener))
    }

    /// Register a listener that is removed before its first call.
    pub fn once<F>(&mut self, name: &'static str, listener: F) -> ListenerId
    where
        F: FnOnce(&mut Host, &Event) + 'static,
    {
        let slot = RefCell::new(Some(listener));
        self.register(
            name,
            true,
            Rc::new(move |host: &mut Host, event: &Event| {
                if let Some(listener) = slot.borrow_mut().take() {
                    listener(host, event);
                }
            }),
        )
    }

    pub fn off(&mut self, name: &str, id: ListenerId) -> bool {
        let Some(list) = self.listeners.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|registration| registration.id != id);
        before != list.len()
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.get(name).map_or(0, Vec::len)
    }

    /// Snapshot the listeners for one emission, dropping once-listeners.
    pub(crate) fn take_for_emit(&mut self, name: &str) -> Vec<Listener> {
        let Some(list) = self.listeners.get_mut(name) else {
            return Vec::new();
        };
        let snapshot = list.iter().map(|registration| Rc::clone(&registration.listener)).collect();
        list.retain(|registration| !registration.once);
        snapshot
    }

    fn register(&mut self, name: &'static str, once: bool, listener: Listener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners
            .entry(name)
            .or_default()
            .push(Registration { id, once, listener });
        id
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<_, _> = self.listeners.iter().map(|(name, list)| (*name, list.len())).collect();
        f.debug_struct("EventEmitter").field("listeners", &counts).finish()
    }
}
