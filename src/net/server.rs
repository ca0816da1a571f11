//! Host-visible stream server.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::handle::Handle;
use crate::host::{CallbackId, Completion, Event, Host, HostObject};
use crate::net::listener::{self, ListenSession};
use crate::net::run_blocking;
use crate::stack::StackContext;

/// Options for [`Server::listen`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListenOptions {
    /// Required; 0 picks an ephemeral port.
    pub port: Option<u16>,
    /// Defaults to the unspecified IPv4 address.
    pub host: Option<String>,
}

impl ListenOptions {
    pub fn new(port: u16) -> Self {
        Self {
            port: Some(port),
            host: None,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

/// Bound address as reported by [`Server::address`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerAddress {
    pub address: String,
    pub port: u16,
    pub family: &'static str,
}

/// Server handle: (stack, server) ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Server {
    stack: Handle,
    id: Handle,
}

impl From<Server> for HostObject {
    fn from(server: Server) -> Self {
        HostObject::Server {
            stack: server.stack,
            server: server.id,
        }
    }
}

impl Server {
    pub(crate) fn from_parts(stack: Handle, id: Handle) -> Self {
        Self { stack, id }
    }

    pub fn id(&self) -> Handle {
        self.id
    }

    fn resolve(&self, host: &Host) -> Result<(Arc<StackContext>, Arc<ListenSession>)> {
        let context = host.stacks().get(self.stack)?;
        let session = context.server(self.id)?;
        Ok((context, session))
    }

    /// Bind and start accepting on the next host turn.
    ///
    /// The completion finishes once `listening` or the bind `error` has
    /// been emitted.
    pub fn listen(&self, host: &mut Host, options: ListenOptions) -> Result<Completion> {
        let (context, session) = self.resolve(host)?;
        let port = options.port.ok_or(BridgeError::MissingOption("port"))?;
        let local = match options.host.as_deref() {
            Some(address) => StackContext::socket_address(address, port)?,
            None => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into(),
        };
        let generation = session.begin_listen()?;

        let (guard, completion) = Completion::tracked();
        let server = HostObject::from(*self);
        host.defer(move |host| {
            tokio::spawn(listener::serve(
                context,
                session,
                server,
                local,
                generation,
                host.invoker(),
                guard,
            ));
        });
        Ok(completion)
    }

    /// Stop accepting on the next host turn and emit `close`.
    ///
    /// Accepted sockets stay open. Without an active listener an `error` is
    /// emitted instead.
    pub fn close(&self, host: &mut Host) -> Result<Completion> {
        self.start_close(host, None)
    }

    /// [`Server::close`] reporting to `callback`; on success it runs as a
    /// one-shot `close` listener.
    pub fn close_then<F>(&self, host: &mut Host, callback: F) -> Result<Completion>
    where
        F: FnOnce(&mut Host, Result<()>) + 'static,
    {
        self.resolve(host)?;
        let callback = host.store_callback(callback);
        self.start_close(host, Some(callback))
    }

    fn start_close(
        &self,
        host: &mut Host,
        callback: Option<CallbackId<Result<()>>>,
    ) -> Result<Completion> {
        let (_, session) = self.resolve(host)?;
        let (guard, completion) = Completion::tracked();
        let server = *self;

        host.defer(move |host| {
            match session.stop() {
                Err(e) => match callback {
                    Some(callback) => {
                        host.invoke_callback(callback, Err(e));
                    }
                    None => {
                        host.emit(server, Event::Error(e));
                    }
                },
                Ok(acceptor) => {
                    if let Some(acceptor) = acceptor {
                        let server_id = server.id;
                        tokio::spawn(async move {
                            if let Err(e) = run_blocking(move || acceptor.close()).await {
                                tracing::debug!(server_id = %server_id, error = %e, "Acceptor close failed");
                            }
                        });
                    }
                    if let Some(callback) = callback {
                        host.once(server, "close", move |host, _| {
                            host.invoke_callback(callback, Ok(()));
                        });
                    }
                    tracing::info!(stack_id = %server.stack, server_id = %server.id, "Server closed");
                    host.emit(server, Event::Close);
                }
            }
            drop(guard);
        });
        Ok(completion)
    }

    pub fn listening(&self, host: &Host) -> Result<bool> {
        Ok(self.resolve(host)?.1.is_listening())
    }

    pub fn address(&self, host: &Host) -> Result<Option<ServerAddress>> {
        let (_, session) = self.resolve(host)?;
        Ok(session.local_address().map(|local| ServerAddress {
            address: local.ip().to_string(),
            port: local.port(),
            family: if local.is_ipv4() { "IPv4" } else { "IPv6" },
        }))
    }

    /// Live accepted sockets, read directly.
    pub fn connection_count(&self, host: &Host) -> Result<usize> {
        Ok(self.resolve(host)?.1.connection_count())
    }

    /// Report the live connection count to `callback` on the next turn.
    pub fn get_connections<F>(&self, host: &mut Host, callback: F) -> Result<Completion>
    where
        F: FnOnce(&mut Host, Result<usize>) + 'static,
    {
        let (_, session) = self.resolve(host)?;
        let callback = host.store_callback(callback);
        let (guard, completion) = Completion::tracked();
        host.defer(move |host| {
            let count = if session.is_listening() {
                Ok(session.connection_count())
            } else {
                Err(BridgeError::NotListening)
            };
            host.invoke_callback(callback, count);
            drop(guard);
        });
        Ok(completion)
    }
}
