//! tcpip-bridge demo binary.
//!
//! Drives a host loop over the in-process engine:
//! - `echo`: a server and a client exchange one message over loopback
//! - `frames`: a frame injected into a reflecting tap interface comes back out

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};

use tcpip_bridge::config::{load_config, BridgeConfig};
use tcpip_bridge::engine::memory::MemoryEngine;
use tcpip_bridge::observability::{logging, metrics};
use tcpip_bridge::{ConnectOptions, Event, HostLoop, InterfaceOptions, ListenOptions, Stack, StackOptions};

#[derive(Parser)]
#[command(name = "tcpip-bridge")]
#[command(about = "Userspace TCP/IP stack bridge demos", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `observability.log_level`.
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Echo a message through a loopback server
    Echo {
        #[arg(short, long, default_value = "hello over the bridge")]
        message: String,

        #[arg(short, long, default_value_t = 7000)]
        port: u16,
    },
    /// Reflect a frame through a tap interface
    Frames,
}

const DEMO_LIMIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    logging::init_logging(&config.observability.log_level);
    metrics::set_enabled(config.observability.metrics_enabled);

    tracing::info!("tcpip-bridge v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Echo { message, port } => echo(config, message, port).await,
        Commands::Frames => frames(config).await,
    }
}

async fn echo(config: BridgeConfig, message: String, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Arc::new(MemoryEngine::new(config.engine.clone()));
    let chunk = config.socket.read_chunk;
    let mut rt = HostLoop::new(engine, config);
    let host = rt.host();

    let stack = Stack::create(host, StackOptions::new("10.0.0.1/24"))?;
    stack.create_interface(host, InterfaceOptions::loopback("127.0.0.1/8"))?;

    let server = stack.create_server(host)?;
    host.on(server, "connection", move |host, event| {
        let Event::Connection(socket) = event else {
            return;
        };
        let socket = *socket;
        host.on(socket, "data", move |host, event| {
            if let Event::Data(bytes) = event {
                if let Err(e) = socket.write(host, bytes.clone()).and_then(|_| socket.read(host, chunk)) {
                    tracing::warn!(error = %e, "Echo failed");
                }
            }
        });
        if let Err(e) = socket.read(host, chunk) {
            tracing::warn!(error = %e, "Echo read failed");
        }
    });
    server.listen(host, ListenOptions::new(port).host("127.0.0.1"))?;
    rt.run_until(DEMO_LIMIT, |host| server.listening(host).unwrap_or(false)).await;
    if let Some(address) = server.address(rt.host())? {
        println!("listening: {}", serde_json::to_string(&address)?);
    }

    let reply = Rc::new(RefCell::new(None::<Bytes>));
    let host = rt.host();
    let client = stack.create_socket(host)?;
    {
        let reply = Rc::clone(&reply);
        host.on(client, "data", move |host, event| {
            if let Event::Data(bytes) = event {
                *reply.borrow_mut() = Some(bytes.clone());
                let _ = client.close(host);
            }
        });
    }
    let payload = Bytes::from(message.into_bytes());
    client.connect_then(host, ConnectOptions::new(port), move |host| {
        let sent = client
            .write(host, payload)
            .and_then(|_| client.read(host, chunk));
        if let Err(e) = sent {
            tracing::warn!(error = %e, "Client exchange failed");
        }
    })?;

    let done = {
        let reply = Rc::clone(&reply);
        rt.run_until(DEMO_LIMIT, move |_| reply.borrow().is_some()).await
    };
    match reply.borrow_mut().take() {
        Some(bytes) if done => println!("reply: {}", String::from_utf8_lossy(&bytes)),
        _ => return Err("no reply before the deadline".into()),
    }
    Ok(())
}

async fn frames(mut config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.engine.reflect_inbound = true;
    let engine = Arc::new(MemoryEngine::new(config.engine.clone()));
    let mut rt = HostLoop::new(engine, config);
    let host = rt.host();

    let stack = Stack::create(host, StackOptions::new("10.1.0.1/24"))?;
    let tap = stack.create_interface(host, InterfaceOptions::tap("192.168.7.1/24", "02:00:00:00:00:07"))?;

    let echoed = Rc::new(RefCell::new(None::<Bytes>));
    {
        let echoed = Rc::clone(&echoed);
        host.on(tap, "frame", move |_, event| {
            if let Event::Frame(frame) = event {
                *echoed.borrow_mut() = Some(frame.clone());
            }
        });
    }

    let mut frame = vec![0xff; 6];
    frame.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x42]);
    frame.extend_from_slice(&[0x08, 0x00]);
    frame.extend_from_slice(b"payload");
    tap.inject(host, Bytes::from(frame))?;

    let done = {
        let echoed = Rc::clone(&echoed);
        rt.run_until(DEMO_LIMIT, move |_| echoed.borrow().is_some()).await
    };
    match echoed.borrow_mut().take() {
        Some(frame) if done => {
            let hex: Vec<String> = frame.iter().map(|byte| format!("{byte:02x}")).collect();
            println!("frame: {}", hex.join(" "));
        }
        _ => return Err("no frame before the deadline".into()),
    }
    Ok(())
}
