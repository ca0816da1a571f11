//! Stream sockets and servers on top of engine transports.
//!
//! # Data Flow
//! ```text
//! Socket::connect → (next turn) dial on blocking pool → install → `connect`
//! Socket::read / write → wait for install → blocking engine I/O → host event or callback
//! Server::listen → (next turn) bind → `listening` → accept loop
//!     → Connection::accepted → StackContext::install_socket → `connection`
//! ```
//!
//! Connection States:
//!     Uninitialized → Connecting → Connected → Closed
//!
//! # Design Decisions
//! - Host objects only carry handles; the native `Connection` and
//!   `ListenSession` live in the stack's tables
//! - Results reach the host only through the deferred invoker
//! - No retries; engine failures surface once

pub mod connection;
pub mod listener;
pub mod server;
pub mod socket;
pub mod timeout;

pub use connection::{Connection, ConnectionState};
pub use listener::ListenSession;
pub use server::{ListenOptions, Server, ServerAddress};
pub use socket::{ConnectOptions, Socket};
pub use timeout::TimerState;

use crate::engine::EngineError;

/// Run a blocking engine call on the blocking pool.
///
/// A panic inside `work` is resumed on the awaiting task.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(EngineError::new("blocking task cancelled")),
    }
}
