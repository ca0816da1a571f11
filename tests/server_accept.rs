//! Listen, accept and close behavior of stream servers.

mod common;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use common::{connect_client, host_loop, loopback_stack, start_recording_server, Recorder, LIMIT};
use ipnet::IpNet;
use tcpip_bridge::engine::memory::MemoryEngine;
use tcpip_bridge::engine::{
    EngineError, EngineStack, LinkKind, NetworkEngine, NicId, Route, TcpAcceptor, TransportConn,
};
use tcpip_bridge::net::ServerAddress;
use tcpip_bridge::observability::logging;
use tcpip_bridge::{BridgeConfig, BridgeError, ConnectOptions, Event, HostLoop, ListenOptions};

/// Memory engine whose acceptors take a while to close.
#[derive(Debug, Default)]
struct SlowCloseEngine(MemoryEngine);

#[derive(Debug)]
struct SlowCloseStack(Arc<dyn EngineStack>);

#[derive(Debug)]
struct SlowCloseAcceptor(Arc<dyn TcpAcceptor>);

const CLOSE_DELAY: Duration = Duration::from_millis(150);

impl NetworkEngine for SlowCloseEngine {
    fn create_stack(&self) -> Result<Arc<dyn EngineStack>, EngineError> {
        Ok(Arc::new(SlowCloseStack(self.0.create_stack()?)))
    }
}

impl EngineStack for SlowCloseStack {
    fn create_nic(&self, nic: NicId, link: LinkKind) -> Result<(), EngineError> {
        self.0.create_nic(nic, link)
    }

    fn add_protocol_address(&self, nic: NicId, address: IpNet) -> Result<(), EngineError> {
        self.0.add_protocol_address(nic, address)
    }

    fn set_route_table(&self, routes: Vec<Route>) {
        self.0.set_route_table(routes)
    }

    fn add_route(&self, route: Route) {
        self.0.add_route(route)
    }

    fn set_nic_forwarding(&self, nic: NicId, enabled: bool) -> Result<(), EngineError> {
        self.0.set_nic_forwarding(nic, enabled)
    }

    fn dial_tcp(&self, remote: SocketAddr) -> Result<Arc<dyn TransportConn>, EngineError> {
        self.0.dial_tcp(remote)
    }

    fn listen_tcp(&self, local: SocketAddr) -> Result<Arc<dyn TcpAcceptor>, EngineError> {
        Ok(Arc::new(SlowCloseAcceptor(self.0.listen_tcp(local)?)))
    }
}

impl TcpAcceptor for SlowCloseAcceptor {
    fn accept(&self) -> Result<Arc<dyn TransportConn>, EngineError> {
        self.0.accept()
    }

    fn close(&self) -> Result<(), EngineError> {
        std::thread::sleep(CLOSE_DELAY);
        self.0.close()
    }

    fn local_address(&self) -> Result<SocketAddr, EngineError> {
        self.0.local_address()
    }
}

#[tokio::test]
async fn accepted_sockets_are_tracked_until_they_close() {
    let mut rt = host_loop();
    let stack = loopback_stack(rt.host());
    let (server, accepted) = start_recording_server(&mut rt, stack, 7200).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let (client, _) = connect_client(&mut rt, stack, 7200).await;
        clients.push(client);
    }
    {
        let accepted = accepted.clone();
        assert!(rt.run_until(LIMIT, move |_| accepted.sockets().len() == 3).await);
    }
    assert_eq!(server.connection_count(rt.host()).unwrap(), 3);

    // Local close.
    let sockets = accepted.sockets();
    let closed = sockets[0].close(rt.host()).unwrap();
    rt.drive(closed.wait(), LIMIT).await.unwrap();
    assert_eq!(server.connection_count(rt.host()).unwrap(), 2);

    // Peer close observed through end of stream.
    let host = rt.host();
    for socket in &sockets[1..] {
        socket.read(host, 64).unwrap();
    }
    for client in &clients {
        client.close(host).unwrap();
    }
    assert!(rt.run_until(LIMIT, |host| server.connection_count(host).unwrap() == 0).await);
    assert!(server.listening(rt.host()).unwrap());
}

#[tokio::test]
async fn get_connections_requires_a_listener() {
    let mut rt = host_loop();
    let stack = loopback_stack(rt.host());
    let (server, _) = start_recording_server(&mut rt, stack, 7201).await;
    connect_client(&mut rt, stack, 7201).await;
    assert!(rt.run_until(LIMIT, |host| server.connection_count(host).unwrap() == 1).await);

    let counts = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&counts);
    let reported = server
        .get_connections(rt.host(), move |_, count| sink.borrow_mut().push(count))
        .unwrap();
    rt.drive(reported.wait(), LIMIT).await.unwrap();

    let closed = server.close(rt.host()).unwrap();
    rt.drive(closed.wait(), LIMIT).await.unwrap();
    let sink = Rc::clone(&counts);
    let reported = server
        .get_connections(rt.host(), move |_, count| sink.borrow_mut().push(count))
        .unwrap();
    rt.drive(reported.wait(), LIMIT).await.unwrap();

    let counts = counts.borrow();
    assert!(matches!(counts[0], Ok(1)));
    assert!(matches!(counts[1], Err(BridgeError::NotListening)));
}

#[tokio::test]
async fn closing_an_idle_server_reports_not_listening() {
    let mut rt = host_loop();
    let stack = loopback_stack(rt.host());
    let host = rt.host();
    let server = stack.create_server(host).unwrap();
    let recorder = Recorder::new();
    recorder.watch(host, server, &["error", "close"]);

    let outcome = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&outcome);
    let reported = server
        .close_then(host, move |_, result| *sink.borrow_mut() = Some(result))
        .unwrap();
    rt.drive(reported.wait(), LIMIT).await.unwrap();
    assert!(matches!(outcome.borrow_mut().take(), Some(Err(BridgeError::NotListening))));
    assert!(recorder.names().is_empty());

    let reported = server.close(rt.host()).unwrap();
    rt.drive(reported.wait(), LIMIT).await.unwrap();
    assert_eq!(recorder.names(), vec!["error"]);
    assert_eq!(recorder.errors()[0], "Server is not running.");
}

#[tokio::test]
async fn listen_rejects_a_second_bind() {
    let mut rt = host_loop();
    let stack = loopback_stack(rt.host());
    let (server, _) = start_recording_server(&mut rt, stack, 7203).await;
    assert!(matches!(
        server.listen(rt.host(), ListenOptions::new(7204)),
        Err(BridgeError::AlreadyListening)
    ));

    let host = rt.host();
    let rival = stack.create_server(host).unwrap();
    let recorder = Recorder::new();
    recorder.watch(host, rival, &["listening", "error"]);
    let bound = rival
        .listen(host, ListenOptions::new(7203).host("127.0.0.1"))
        .unwrap();
    rt.drive(bound.wait(), LIMIT).await.unwrap();

    assert_eq!(recorder.names(), vec!["error"]);
    assert!(recorder.errors()[0].contains("port is in use"));
    assert!(!rival.listening(rt.host()).unwrap());

    // A failed bind leaves the server free to try again.
    let bound = rival.listen(rt.host(), ListenOptions::new(7204)).unwrap();
    rt.drive(bound.wait(), LIMIT).await.unwrap();
    assert_eq!(recorder.names(), vec!["error", "listening"]);
}

#[tokio::test]
async fn listen_options_are_validated_synchronously() {
    let mut rt = host_loop();
    let stack = loopback_stack(rt.host());
    let host = rt.host();
    let server = stack.create_server(host).unwrap();

    assert!(matches!(
        server.listen(host, ListenOptions::default()),
        Err(BridgeError::MissingOption("port"))
    ));
    assert!(matches!(
        server.listen(host, ListenOptions::new(80).host("nope")),
        Err(BridgeError::AddrParse(_))
    ));
    assert!(!server.listening(host).unwrap());
    assert_eq!(server.address(host).unwrap(), None);
}

#[tokio::test]
async fn address_reports_the_bound_endpoint() {
    let mut rt = host_loop();
    let stack = loopback_stack(rt.host());
    let (server, _) = start_recording_server(&mut rt, stack, 7205).await;
    assert_eq!(
        server.address(rt.host()).unwrap(),
        Some(ServerAddress {
            address: "127.0.0.1".to_string(),
            port: 7205,
            family: "IPv4",
        })
    );

    let host = rt.host();
    let ephemeral = stack.create_server(host).unwrap();
    let bound = ephemeral.listen(host, ListenOptions::new(0)).unwrap();
    rt.drive(bound.wait(), LIMIT).await.unwrap();
    let address = ephemeral.address(rt.host()).unwrap().unwrap();
    assert_eq!(address.address, "0.0.0.0");
    assert!(address.port >= 49152);
}

#[tokio::test]
async fn close_stops_accepting_but_keeps_sockets() {
    let mut rt = host_loop();
    let stack = loopback_stack(rt.host());
    let (server, accepted) = start_recording_server(&mut rt, stack, 7206).await;
    let (client, client_events) = connect_client(&mut rt, stack, 7206).await;
    {
        let accepted = accepted.clone();
        assert!(rt.run_until(LIMIT, move |_| accepted.sockets().len() == 1).await);
    }

    let outcome = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&outcome);
    let closed = server
        .close_then(rt.host(), move |_, result| *sink.borrow_mut() = Some(result))
        .unwrap();
    rt.drive(closed.wait(), LIMIT).await.unwrap();
    assert!(matches!(outcome.borrow_mut().take(), Some(Ok(()))));
    assert_eq!(accepted.count("close"), 1);
    assert!(!server.listening(rt.host()).unwrap());
    // The acceptor itself closes in the background.
    rt.run_for(Duration::from_millis(50)).await;

    // The accepted socket still carries traffic.
    let host = rt.host();
    let peer = accepted.sockets()[0];
    peer.write(host, bytes::Bytes::from_static(b"still here")).unwrap();
    client.read(host, 64).unwrap();
    {
        let client_events = client_events.clone();
        assert!(rt.run_until(LIMIT, move |_| !client_events.data().is_empty()).await);
    }
    assert_eq!(client_events.data(), b"still here");

    let host = rt.host();
    let late = stack.create_socket(host).unwrap();
    let late_events = Recorder::new();
    late_events.watch(host, late, &["connect", "error"]);
    let dialed = late.connect(host, ConnectOptions::new(7206)).unwrap();
    rt.drive(dialed.wait(), LIMIT).await.unwrap();
    assert_eq!(late_events.names(), vec!["error"]);
    assert!(late_events.errors()[0].contains("connection refused"));
}

#[tokio::test]
async fn connection_events_carry_usable_sockets() {
    let mut rt = host_loop();
    let stack = loopback_stack(rt.host());
    let host = rt.host();
    let server = stack.create_server(host).unwrap();
    let peers = Rc::new(RefCell::new(Vec::new()));
    {
        let peers = Rc::clone(&peers);
        host.on(server, "connection", move |host, event| {
            if let Event::Connection(socket) = event {
                peers.borrow_mut().push(socket.remote_port(host).unwrap());
            }
        });
    }
    let bound = server
        .listen(host, ListenOptions::new(7207).host("localhost"))
        .unwrap();
    rt.drive(bound.wait(), LIMIT).await.unwrap();

    let (client, _) = connect_client(&mut rt, stack, 7207).await;
    {
        let peers = Rc::clone(&peers);
        assert!(rt.run_until(LIMIT, move |_| peers.borrow().len() == 1).await);
    }
    assert_eq!(peers.borrow()[0], client.local_port(rt.host()).unwrap());
}

#[tokio::test]
async fn relisten_survives_a_slow_acceptor_close() {
    logging::init_logging("debug");
    let mut rt = HostLoop::new(Arc::new(SlowCloseEngine::default()), BridgeConfig::default());
    let stack = loopback_stack(rt.host());
    let host = rt.host();
    let server = stack.create_server(host).unwrap();
    let recorder = Recorder::new();
    recorder.watch(host, server, &["listening", "close", "error"]);

    let bound = server.listen(host, ListenOptions::new(7500)).unwrap();
    rt.drive(bound.wait(), LIMIT).await.unwrap();
    let closed = server.close(rt.host()).unwrap();
    rt.drive(closed.wait(), LIMIT).await.unwrap();
    let bound = server.listen(rt.host(), ListenOptions::new(7501)).unwrap();
    rt.drive(bound.wait(), LIMIT).await.unwrap();

    // Outlast the first acceptor's close and its accept loop.
    rt.run_for(CLOSE_DELAY * 2).await;
    assert_eq!(recorder.names(), vec!["listening", "close", "listening"]);
    assert!(server.listening(rt.host()).unwrap());
    assert_eq!(server.address(rt.host()).unwrap().unwrap().port, 7501);

    let (_client, _) = connect_client(&mut rt, stack, 7501).await;
    assert!(rt.run_until(LIMIT, |host| server.connection_count(host).unwrap() == 1).await);

    let closed = server.close(rt.host()).unwrap();
    rt.drive(closed.wait(), LIMIT).await.unwrap();
    assert_eq!(recorder.names(), vec!["listening", "close", "listening", "close"]);
}
