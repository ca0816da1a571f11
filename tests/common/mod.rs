//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use tcpip_bridge::engine::memory::MemoryEngine;
use tcpip_bridge::observability::logging;
use tcpip_bridge::{
    BridgeConfig, ConnectOptions, Event, Host, HostLoop, HostObject, InterfaceOptions, ListenOptions, Server, Socket,
    Stack, StackOptions,
};

pub const LIMIT: Duration = Duration::from_secs(5);

pub fn host_loop() -> HostLoop {
    host_loop_with(BridgeConfig::default())
}

pub fn host_loop_with(config: BridgeConfig) -> HostLoop {
    logging::init_logging("debug");
    HostLoop::new(Arc::new(MemoryEngine::new(config.engine.clone())), config)
}

/// A stack with a loopback interface on 127.0.0.1/8.
pub fn loopback_stack(host: &mut Host) -> Stack {
    let stack = Stack::create(host, StackOptions::new("10.0.0.1/24")).unwrap();
    stack
        .create_interface(host, InterfaceOptions::loopback("127.0.0.1/8"))
        .unwrap();
    stack
}

/// One recorded event.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub name: &'static str,
    pub at: Duration,
    pub data: Option<Bytes>,
    pub socket: Option<Socket>,
    pub error: Option<String>,
}

/// Records events from any number of host objects, in emission order.
#[derive(Clone)]
pub struct Recorder {
    events: Rc<RefCell<Vec<Recorded>>>,
    start: Rc<RefCell<Instant>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            events: Rc::new(RefCell::new(Vec::new())),
            start: Rc::new(RefCell::new(Instant::now())),
        }
    }

    /// Measure `at` from now on.
    pub fn restart_clock(&self) {
        *self.start.borrow_mut() = Instant::now();
    }

    pub fn watch(&self, host: &mut Host, target: impl Into<HostObject>, names: &[&'static str]) {
        let target = target.into();
        for &name in names {
            let events = Rc::clone(&self.events);
            let start = Rc::clone(&self.start);
            host.on(target, name, move |_, event| {
                let mut recorded = Recorded {
                    name: event.name(),
                    at: start.borrow().elapsed(),
                    data: None,
                    socket: None,
                    error: None,
                };
                match event {
                    Event::Data(bytes) | Event::Frame(bytes) | Event::Packet(bytes) | Event::OutboundEthernetFrame(bytes) => {
                        recorded.data = Some(bytes.clone());
                    }
                    Event::Connection(socket) => recorded.socket = Some(*socket),
                    Event::Error(e) => recorded.error = Some(e.to_string()),
                    _ => {}
                }
                events.borrow_mut().push(recorded);
            });
        }
    }

    pub fn all(&self) -> Vec<Recorded> {
        self.events.borrow().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.borrow().iter().map(|event| event.name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.borrow().iter().filter(|event| event.name == name).count()
    }

    pub fn first_at(&self, name: &str) -> Option<Duration> {
        self.events
            .borrow()
            .iter()
            .find(|event| event.name == name)
            .map(|event| event.at)
    }

    /// Concatenated `data` payloads.
    pub fn data(&self) -> Vec<u8> {
        self.events
            .borrow()
            .iter()
            .filter(|event| event.name == "data")
            .filter_map(|event| event.data.as_ref())
            .flat_map(|bytes| bytes.iter().copied())
            .collect()
    }

    /// Payloads of frame-like events, in order.
    pub fn units(&self, name: &str) -> Vec<Bytes> {
        self.events
            .borrow()
            .iter()
            .filter(|event| event.name == name)
            .filter_map(|event| event.data.clone())
            .collect()
    }

    pub fn sockets(&self) -> Vec<Socket> {
        self.events.borrow().iter().filter_map(|event| event.socket).collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events.borrow().iter().filter_map(|event| event.error.clone()).collect()
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Start a server that echoes everything it reads, and wait until it listens.
pub async fn start_echo_server(rt: &mut HostLoop, stack: Stack, port: u16) -> Server {
    let host = rt.host();
    let server = stack.create_server(host).unwrap();
    host.on(server, "connection", |host, event| {
        let Event::Connection(socket) = event else {
            return;
        };
        let socket = *socket;
        host.on(socket, "data", move |host, event| {
            if let Event::Data(bytes) = event {
                socket.write(host, bytes.clone()).unwrap();
                socket.read(host, 4096).unwrap();
            }
        });
        socket.read(host, 4096).unwrap();
    });
    server
        .listen(host, ListenOptions::new(port).host("127.0.0.1"))
        .unwrap();
    assert!(rt.run_until(LIMIT, |host| server.listening(host).unwrap()).await);
    server
}

/// Start a server that only records accepted sockets.
pub async fn start_recording_server(rt: &mut HostLoop, stack: Stack, port: u16) -> (Server, Recorder) {
    let recorder = Recorder::new();
    let host = rt.host();
    let server = stack.create_server(host).unwrap();
    recorder.watch(host, server, &["listening", "connection", "error", "close"]);
    server
        .listen(host, ListenOptions::new(port).host("127.0.0.1"))
        .unwrap();
    assert!(rt.run_until(LIMIT, |host| server.listening(host).unwrap()).await);
    (server, recorder)
}

/// Connect a new client and wait for `connect`. Returns the client recorder.
pub async fn connect_client(rt: &mut HostLoop, stack: Stack, port: u16) -> (Socket, Recorder) {
    let recorder = Recorder::new();
    let host = rt.host();
    let client = stack.create_socket(host).unwrap();
    recorder.watch(host, client, &["connect", "data", "end", "error", "timeout", "close"]);
    client.connect(host, ConnectOptions::new(port)).unwrap();
    let connected = {
        let recorder = recorder.clone();
        rt.run_until(LIMIT, move |_| recorder.count("connect") == 1).await
    };
    assert!(connected, "client did not connect: {:?}", recorder.names());
    (client, recorder)
}
