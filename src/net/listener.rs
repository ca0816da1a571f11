//! Listen session state and the accept loop.
//!
//! # Responsibilities
//! - Bind on the engine stack and report `listening` or `error`
//! - Accept connections and install each as a socket of the stack
//! - Track live accepted sockets until they close
//! - Exit quietly when closed, loudly on accept failure

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::engine::TcpAcceptor;
use crate::error::{BridgeError, Result};
use crate::handle::{Handle, HandleTable};
use crate::host::{CompletionGuard, DeferredInvoker, Event, HostObject};
use crate::net::connection::Connection;
use crate::net::run_blocking;
use crate::net::socket::Socket;
use crate::observability::metrics;
use crate::stack::StackContext;

enum ListenState {
    Idle,
    Binding,
    Listening(Arc<dyn TcpAcceptor>),
    Closed,
}

impl fmt::Debug for ListenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ListenState::Idle => "Idle",
            ListenState::Binding => "Binding",
            ListenState::Listening(_) => "Listening",
            ListenState::Closed => "Closed",
        })
    }
}

#[derive(Debug)]
struct SessionInner {
    state: ListenState,
    /// Bumped by every `listen`; an accept loop only touches the state it
    /// was started for.
    generation: u64,
}

#[derive(Debug)]
pub struct ListenSession {
    inner: Mutex<SessionInner>,
    connections: HandleTable<Socket>,
}

impl ListenSession {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                state: ListenState::Idle,
                generation: 0,
            }),
            connections: HandleTable::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("listen state mutex poisoned")
    }

    /// Idle or Closed → Binding. Returns the generation of the new listen.
    pub(crate) fn begin_listen(&self) -> Result<u64> {
        let mut inner = self.lock();
        match inner.state {
            ListenState::Idle | ListenState::Closed => {
                inner.state = ListenState::Binding;
                inner.generation += 1;
                Ok(inner.generation)
            }
            ListenState::Binding | ListenState::Listening(_) => Err(BridgeError::AlreadyListening),
        }
    }

    /// Binding → Listening. `false` if the server closed (or listened
    /// again) during the bind.
    fn bound(&self, generation: u64, acceptor: Arc<dyn TcpAcceptor>) -> bool {
        let mut inner = self.lock();
        if inner.generation == generation && matches!(inner.state, ListenState::Binding) {
            inner.state = ListenState::Listening(acceptor);
            true
        } else {
            false
        }
    }

    fn bind_failed(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && matches!(inner.state, ListenState::Binding) {
            inner.state = ListenState::Idle;
        }
    }

    /// `true` if the loop's own listen is still active, i.e. the failure is
    /// real.
    fn accept_failed(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation == generation && matches!(inner.state, ListenState::Listening(_)) {
            inner.state = ListenState::Idle;
            true
        } else {
            false
        }
    }

    /// Stop listening. Returns the acceptor to close, if bound yet.
    pub(crate) fn stop(&self) -> Result<Option<Arc<dyn TcpAcceptor>>> {
        let mut inner = self.lock();
        match std::mem::replace(&mut inner.state, ListenState::Closed) {
            ListenState::Listening(acceptor) => Ok(Some(acceptor)),
            ListenState::Binding => Ok(None),
            previous @ (ListenState::Idle | ListenState::Closed) => {
                inner.state = previous;
                Err(BridgeError::NotListening)
            }
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.lock().state, ListenState::Listening(_))
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        match &self.lock().state {
            ListenState::Listening(acceptor) => acceptor.local_address().ok(),
            _ => None,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }

    pub(crate) fn untrack(&self, entry: Handle) {
        if self.connections.remove(entry).is_some() {
            metrics::record_server_connection_closed();
        }
    }
}

impl Default for ListenSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind `local`, then accept until closed or failed.
pub(crate) async fn serve(
    context: Arc<StackContext>,
    session: Arc<ListenSession>,
    server: HostObject,
    local: SocketAddr,
    generation: u64,
    invoker: DeferredInvoker,
    bound_guard: CompletionGuard,
) {
    let engine = Arc::clone(context.engine());
    let acceptor = match run_blocking(move || engine.listen_tcp(local)).await {
        Ok(acceptor) => acceptor,
        Err(e) => {
            session.bind_failed(generation);
            tracing::warn!(object = %server, address = %local, error = %e, "Bind failed");
            invoker.defer(move |host| {
                host.emit(server, Event::Error(e.into()));
                drop(bound_guard);
            });
            return;
        }
    };

    if !session.bound(generation, Arc::clone(&acceptor)) {
        if let Err(e) = run_blocking(move || acceptor.close()).await {
            tracing::debug!(object = %server, error = %e, "Acceptor close failed");
        }
        return;
    }
    let bound_at = acceptor.local_address().unwrap_or(local);
    tracing::info!(object = %server, address = %bound_at, "Server listening");
    invoker.defer(move |host| {
        host.emit(server, Event::Listening);
        drop(bound_guard);
    });

    loop {
        let next = Arc::clone(&acceptor);
        let transport = match run_blocking(move || next.accept()).await {
            Ok(transport) => transport,
            Err(e) => {
                if session.accept_failed(generation) {
                    tracing::warn!(object = %server, error = %e, "Accept failed");
                    invoker.defer(move |host| {
                        host.emit(server, Event::Error(e.into()));
                    });
                } else {
                    tracing::debug!(object = %server, "Accept loop stopped");
                }
                return;
            }
        };

        let peer = transport.remote_address().ok();
        let installed = context.install_socket(Arc::new(Connection::accepted(Arc::clone(&transport))));
        let socket = match installed {
            Ok(id) => Socket::from_parts(context.id(), id),
            Err(e) => {
                tracing::warn!(object = %server, error = %e, "Accepted connection dropped");
                let _ = transport.close();
                continue;
            }
        };
        let entry = session.connections.insert(socket);
        metrics::record_connection_accepted();
        tracing::debug!(object = %server, socket_id = %socket.id(), peer = ?peer, "Connection accepted");

        let session = Arc::clone(&session);
        invoker.defer(move |host| {
            match entry {
                Ok(entry) => {
                    host.once(socket, "close", move |_, _| session.untrack(entry));
                }
                Err(e) => {
                    tracing::warn!(object = %server, error = %e, "Connection not tracked");
                }
            }
            host.emit(server, Event::Connection(socket));
        });
    }
}
