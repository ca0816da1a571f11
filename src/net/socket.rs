//! Host-visible stream socket.
//!
//! Every asynchronous operation returns a [`Completion`] that finishes once
//! its result has been delivered to the host.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

use crate::config::SocketConfig;
use crate::engine::{self, EngineError, TransportConn};
use crate::error::{BridgeError, Result};
use crate::handle::Handle;
use crate::host::{CallbackId, Completion, Event, Host, HostObject};
use crate::net::connection::{Connection, ConnectionState};
use crate::net::run_blocking;
use crate::net::timeout::{self, TimerState};
use crate::observability::metrics;
use crate::stack::StackContext;

/// Options for [`Socket::connect`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Required.
    pub port: Option<u16>,
    /// Literal IP address or `localhost`; falls back to `socket.default_host`.
    pub host: Option<String>,
    pub no_delay: Option<bool>,
}

impl ConnectOptions {
    pub fn new(port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::default()
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    fn remote(&self, defaults: &SocketConfig) -> Result<SocketAddr> {
        let port = self.port.ok_or(BridgeError::MissingOption("port"))?;
        let host = self.host.as_deref().unwrap_or(&defaults.default_host);
        StackContext::socket_address(host, port)
    }
}

type WriteCallback = CallbackId<Result<()>>;

/// Stream socket handle: (stack, socket) ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Socket {
    stack: Handle,
    id: Handle,
}

impl From<Socket> for HostObject {
    fn from(socket: Socket) -> Self {
        HostObject::Socket {
            stack: socket.stack,
            socket: socket.id,
        }
    }
}

impl Socket {
    pub(crate) fn from_parts(stack: Handle, id: Handle) -> Self {
        Self { stack, id }
    }

    pub fn id(&self) -> Handle {
        self.id
    }

    pub fn stack_id(&self) -> Handle {
        self.stack
    }

    fn connection(&self, host: &Host) -> Result<Arc<Connection>> {
        host.stacks().get(self.stack)?.socket(self.id)
    }

    pub fn state(&self, host: &Host) -> Result<ConnectionState> {
        Ok(self.connection(host)?.state())
    }

    /// Dial `options` on the next host turn.
    ///
    /// Emits `connect` on success; `error` then `close` on failure.
    pub fn connect(&self, host: &mut Host, options: ConnectOptions) -> Result<Completion> {
        let context = host.stacks().get(self.stack)?;
        let connection = context.socket(self.id)?;
        let remote = options.remote(&host.config().socket)?;
        let no_delay = options.no_delay.unwrap_or(host.config().socket.no_delay);
        connection.begin_connect()?;

        let (guard, completion) = Completion::tracked();
        let socket = *self;
        host.defer(move |host| {
            let invoker = host.invoker();
            tokio::spawn(async move {
                let engine = Arc::clone(context.engine());
                let dialed = run_blocking(move || {
                    let transport = engine.dial_tcp(remote)?;
                    transport.set_no_delay(no_delay);
                    Ok(transport)
                })
                .await;
                invoker.defer(move |host| {
                    socket.finish_connect(host, &connection, remote, dialed);
                    drop(guard);
                });
            });
        });
        Ok(completion)
    }

    /// [`Socket::connect`] with `callback` bound as a one-shot `connect` listener.
    pub fn connect_then<F>(&self, host: &mut Host, options: ConnectOptions, callback: F) -> Result<Completion>
    where
        F: FnOnce(&mut Host) + 'static,
    {
        let completion = self.connect(host, options)?;
        host.once(*self, "connect", move |host, _| callback(host));
        Ok(completion)
    }

    fn finish_connect(
        &self,
        host: &mut Host,
        connection: &Connection,
        remote: SocketAddr,
        dialed: std::result::Result<Arc<dyn TransportConn>, EngineError>,
    ) {
        match dialed {
            Ok(transport) => {
                if connection.install(transport) {
                    tracing::debug!(stack_id = %self.stack, socket_id = %self.id, peer = %remote, "Connected");
                    host.emit(*self, Event::Connect);
                }
            }
            Err(e) => {
                metrics::record_dial_failure();
                tracing::debug!(stack_id = %self.stack, socket_id = %self.id, peer = %remote, error = %e, "Dial failed");
                if connection.fail() {
                    host.emit(*self, Event::Error(e.into()));
                    self.emit_close(host, connection);
                }
            }
        }
    }

    /// Read up to `size` bytes once connected.
    ///
    /// Emits `data`, or `end` then `close` at end of stream, or `error`
    /// then `close` on failure.
    pub fn read(&self, host: &mut Host, size: usize) -> Result<Completion> {
        if size == 0 {
            return Err(BridgeError::InvalidOption {
                field: "size",
                reason: "must be greater than zero".to_string(),
            });
        }
        let connection = self.connection(host)?;
        let invoker = host.invoker();
        let (guard, completion) = Completion::tracked();
        let socket = *self;

        tokio::spawn(async move {
            let outcome = match connection.wait_connected().await {
                Ok(transport) => run_blocking(move || {
                    let mut buf = vec![0u8; size];
                    let n = transport.read(&mut buf)?;
                    buf.truncate(n);
                    Ok(Bytes::from(buf))
                })
                .await
                .map_err(BridgeError::from),
                Err(e) => Err(e),
            };
            if matches!(&outcome, Ok(data) if !data.is_empty()) {
                connection.pulse();
            }
            invoker.defer(move |host| {
                socket.finish_read(host, &connection, outcome);
                drop(guard);
            });
        });
        Ok(completion)
    }

    fn finish_read(&self, host: &mut Host, connection: &Connection, outcome: Result<Bytes>) {
        match outcome {
            Ok(data) if !data.is_empty() => {
                if connection.is_finished() {
                    tracing::trace!(socket_id = %self.id, len = data.len(), "Data after end dropped");
                    return;
                }
                host.emit(*self, Event::Data(data));
            }
            Ok(_) => {
                // An explicit close already won the teardown; stay quiet.
                if self.teardown(connection) && connection.mark_ended() {
                    host.emit(*self, Event::End);
                    self.emit_close(host, connection);
                }
            }
            Err(e) => {
                if connection.is_finished() || !self.teardown(connection) {
                    tracing::trace!(socket_id = %self.id, error = %e, "Read failed after close");
                    return;
                }
                host.emit(*self, Event::Error(e));
                self.emit_close(host, connection);
            }
        }
    }

    /// Write all of `data` once connected. Failures surface as `error`.
    pub fn write(&self, host: &mut Host, data: Bytes) -> Result<Completion> {
        let connection = self.connection(host)?;
        Ok(self.start_write(host, connection, data, None))
    }

    /// Write all of `data`; `callback` receives the outcome instead of an
    /// `error` event.
    pub fn write_then<F>(&self, host: &mut Host, data: Bytes, callback: F) -> Result<Completion>
    where
        F: FnOnce(&mut Host, Result<()>) + 'static,
    {
        let connection = self.connection(host)?;
        let callback = host.store_callback(callback);
        Ok(self.start_write(host, connection, data, Some(callback)))
    }

    fn start_write(
        &self,
        host: &mut Host,
        connection: Arc<Connection>,
        data: Bytes,
        callback: Option<WriteCallback>,
    ) -> Completion {
        let invoker = host.invoker();
        let (guard, completion) = Completion::tracked();
        let socket = *self;

        tokio::spawn(async move {
            let outcome = match connection.wait_connected().await {
                Ok(transport) => run_blocking(move || engine::write_all(transport.as_ref(), &data))
                    .await
                    .map_err(BridgeError::from),
                Err(e) => Err(e),
            };
            if outcome.is_ok() {
                connection.pulse();
            }
            invoker.defer(move |host| {
                let outcome = outcome.map(|_| ());
                match callback {
                    Some(callback) => {
                        host.invoke_callback(callback, outcome);
                    }
                    None => {
                        if let Err(e) = outcome {
                            host.emit(socket, Event::Error(e));
                        }
                    }
                }
                drop(guard);
            });
        });
        completion
    }

    /// Set the idle timeout in milliseconds; 0 cancels it.
    pub fn set_timeout(&self, host: &mut Host, millis: u64) -> Result<Completion> {
        let connection = self.connection(host)?;
        Ok(self.arm_timeout(host, connection, millis, None))
    }

    /// [`Socket::set_timeout`] with `callback` run when this timeout fires.
    ///
    /// The callback is dropped unrun if the timeout is cancelled or
    /// replaced first.
    pub fn set_timeout_then<F>(&self, host: &mut Host, millis: u64, callback: F) -> Result<Completion>
    where
        F: FnOnce(&mut Host) + 'static,
    {
        let connection = self.connection(host)?;
        let callback = (millis > 0).then(|| host.store_callback(move |host, ()| callback(host)));
        Ok(self.arm_timeout(host, connection, millis, callback))
    }

    fn arm_timeout(
        &self,
        host: &mut Host,
        connection: Arc<Connection>,
        millis: u64,
        callback: Option<CallbackId<()>>,
    ) -> Completion {
        let Some(arming) = connection.set_idle_timeout(Duration::from_millis(millis)) else {
            if let Some(callback) = callback {
                host.take_callback(callback);
            }
            return Completion::ready();
        };
        let completion = arming.completion();
        tokio::spawn(timeout::supervise(
            connection,
            arming,
            callback,
            host.invoker(),
            HostObject::from(*self),
        ));
        completion
    }

    pub fn timeout(&self, host: &Host) -> Result<Duration> {
        Ok(self.connection(host)?.idle().timeout())
    }

    pub fn timer_state(&self, host: &Host) -> Result<TimerState> {
        Ok(self.connection(host)?.timer_state())
    }

    /// Apply no-delay once connected.
    pub fn set_no_delay(&self, host: &mut Host, enabled: bool) -> Result<Completion> {
        let connection = self.connection(host)?;
        let (guard, completion) = Completion::tracked();
        tokio::spawn(async move {
            if let Ok(transport) = connection.wait_connected().await {
                transport.set_no_delay(enabled);
            }
            drop(guard);
        });
        Ok(completion)
    }

    /// Close the socket. `close` is emitted on the next turn.
    pub fn close(&self, host: &mut Host) -> Result<Completion> {
        let connection = self.connection(host)?;
        if !self.teardown(&connection) {
            return Ok(Completion::ready());
        }
        let (guard, completion) = Completion::tracked();
        let socket = *self;
        host.defer(move |host| {
            socket.emit_close(host, &connection);
            drop(guard);
        });
        Ok(completion)
    }

    /// Move to Closed and close the transport in the background.
    fn teardown(&self, connection: &Connection) -> bool {
        if !connection.shutdown() {
            return false;
        }
        if let Some(transport) = connection.transport() {
            let socket_id = self.id;
            tokio::spawn(async move {
                if let Err(e) = run_blocking(move || transport.close()).await {
                    tracing::debug!(socket_id = %socket_id, error = %e, "Transport close failed");
                }
            });
        }
        true
    }

    fn emit_close(&self, host: &mut Host, connection: &Connection) {
        if connection.mark_close_emitted() {
            host.emit(*self, Event::Close);
        }
    }

    pub fn local_address(&self, host: &Host) -> Result<Option<IpAddr>> {
        Ok(self.local(host)?.map(|addr| addr.ip()))
    }

    pub fn local_port(&self, host: &Host) -> Result<Option<u16>> {
        Ok(self.local(host)?.map(|addr| addr.port()))
    }

    pub fn remote_address(&self, host: &Host) -> Result<Option<IpAddr>> {
        Ok(self.remote(host)?.map(|addr| addr.ip()))
    }

    pub fn remote_port(&self, host: &Host) -> Result<Option<u16>> {
        Ok(self.remote(host)?.map(|addr| addr.port()))
    }

    fn local(&self, host: &Host) -> Result<Option<SocketAddr>> {
        let connection = self.connection(host)?;
        Ok(connection.transport().and_then(|t| t.local_address().ok()))
    }

    fn remote(&self, host: &Host) -> Result<Option<SocketAddr>> {
        let connection = self.connection(host)?;
        Ok(connection.transport().and_then(|t| t.remote_address().ok()))
    }
}
