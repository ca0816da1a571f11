//! Single-threaded host runtime.
//!
//! # Data Flow
//! ```text
//! background task → DeferredInvoker::defer → task queue
//!     → HostLoop (one task at a time) → &mut Host
//!     → listeners / callbacks registered on host objects
//! ```
//!
//! # Design Decisions
//! - Host state is only reachable through `&mut Host`, which only the loop owns
//! - Listeners and callbacks need not be `Send`; tasks do
//! - Callbacks that outlive a host call are parked in the host and named by
//!   a `CallbackId`, so background tasks carry only the id

pub mod deferred;
pub mod events;

pub use deferred::{Completion, CompletionGuard, DeferredInvoker, Task};
pub use events::{Event, EventEmitter, ListenerId};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::BridgeConfig;
use crate::engine::NetworkEngine;
use crate::handle::Handle;
use crate::stack::registry::StackRegistry;

/// Identity of an object that can carry listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostObject {
    Stack(Handle),
    Socket { stack: Handle, socket: Handle },
    Server { stack: Handle, server: Handle },
    Interface { stack: Handle, interface: Handle },
}

impl fmt::Display for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostObject::Stack(stack) => write!(f, "stack {stack}"),
            HostObject::Socket { stack, socket } => write!(f, "socket {stack}/{socket}"),
            HostObject::Server { stack, server } => write!(f, "server {stack}/{server}"),
            HostObject::Interface { stack, interface } => write!(f, "interface {stack}/{interface}"),
        }
    }
}

/// Parked host callback receiving a `T`.
pub struct CallbackId<T> {
    raw: u64,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for CallbackId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CallbackId<T> {}

impl<T> fmt::Debug for CallbackId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallbackId({})", self.raw)
    }
}

type BoxedCallback<T> = Box<dyn FnOnce(&mut Host, T)>;

/// Host object model: listeners, parked callbacks and the stack registry.
pub struct Host {
    invoker: DeferredInvoker,
    emitters: HashMap<HostObject, EventEmitter>,
    callbacks: HashMap<u64, Box<dyn Any>>,
    next_callback: u64,
    stacks: Arc<StackRegistry>,
    engine: Arc<dyn NetworkEngine>,
    config: Arc<BridgeConfig>,
}

impl Host {
    pub fn invoker(&self) -> DeferredInvoker {
        self.invoker.clone()
    }

    /// Schedule `task` for a later turn.
    pub fn defer<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut Host) + Send + 'static,
    {
        self.invoker.defer(task)
    }

    pub fn stacks(&self) -> &Arc<StackRegistry> {
        &self.stacks
    }

    pub fn engine(&self) -> &Arc<dyn NetworkEngine> {
        &self.engine
    }

    pub fn config(&self) -> &Arc<BridgeConfig> {
        &self.config
    }

    pub fn on<F>(&mut self, target: impl Into<HostObject>, name: &'static str, listener: F) -> ListenerId
    where
        F: Fn(&mut Host, &Event) + 'static,
    {
        self.emitters.entry(target.into()).or_default().on(name, listener)
    }

    pub fn once<F>(&mut self, target: impl Into<HostObject>, name: &'static str, listener: F) -> ListenerId
    where
        F: FnOnce(&mut Host, &Event) + 'static,
    {
        self.emitters.entry(target.into()).or_default().once(name, listener)
    }

    pub fn off(&mut self, target: impl Into<HostObject>, name: &str, id: ListenerId) -> bool {
        self.emitters
            .get_mut(&target.into())
            .is_some_and(|emitter| emitter.off(name, id))
    }

    pub fn listener_count(&self, target: impl Into<HostObject>, name: &str) -> usize {
        self.emitters
            .get(&target.into())
            .map_or(0, |emitter| emitter.listener_count(name))
    }

    /// Call every listener for `event` on `target`, in registration order.
    ///
    /// Returns whether any listener ran. An `error` nobody listens for is
    /// logged instead.
    pub fn emit(&mut self, target: impl Into<HostObject>, event: Event) -> bool {
        let target = target.into();
        let listeners = self
            .emitters
            .get_mut(&target)
            .map(|emitter| emitter.take_for_emit(event.name()))
            .unwrap_or_default();

        if listeners.is_empty() {
            if let Event::Error(error) = &event {
                tracing::warn!(object = %target, error = %error, "Unhandled error event");
            }
            return false;
        }
        for listener in listeners {
            listener(self, &event);
        }
        true
    }

    /// Park a callback until a background task hands its argument back.
    pub fn store_callback<T, F>(&mut self, callback: F) -> CallbackId<T>
    where
        T: 'static,
        F: FnOnce(&mut Host, T) + 'static,
    {
        self.next_callback += 1;
        let boxed: BoxedCallback<T> = Box::new(callback);
        self.callbacks.insert(self.next_callback, Box::new(boxed));
        CallbackId {
            raw: self.next_callback,
            _marker: PhantomData,
        }
    }

    /// Remove a parked callback without running it.
    pub fn take_callback<T: 'static>(&mut self, id: CallbackId<T>) -> Option<BoxedCallback<T>> {
        self.callbacks
            .remove(&id.raw)?
            .downcast::<BoxedCallback<T>>()
            .ok()
            .map(|callback| *callback)
    }

    /// Run a parked callback. Returns `false` if it was already taken.
    pub fn invoke_callback<T: 'static>(&mut self, id: CallbackId<T>, value: T) -> bool {
        match self.take_callback(id) {
            Some(callback) => {
                callback(self, value);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("objects", &self.emitters.len())
            .field("parked_callbacks", &self.callbacks.len())
            .field("stacks", &self.stacks.count())
            .finish_non_exhaustive()
    }
}

/// Owns the host and runs its tasks one at a time.
pub struct HostLoop {
    tasks: mpsc::UnboundedReceiver<Task>,
    host: Host,
}

impl HostLoop {
    pub fn new(engine: Arc<dyn NetworkEngine>, config: BridgeConfig) -> Self {
        let (invoker, tasks) = DeferredInvoker::channel();
        Self {
            tasks,
            host: Host {
                invoker,
                emitters: HashMap::new(),
                callbacks: HashMap::new(),
                next_callback: 0,
                stacks: Arc::new(StackRegistry::new()),
                engine,
                config: Arc::new(config),
            },
        }
    }

    pub fn host(&mut self) -> &mut Host {
        &mut self.host
    }

    /// Run every task already queued, including tasks they queue.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.tasks.try_recv() {
            task(&mut self.host);
            ran += 1;
        }
        ran
    }

    /// Wait for one task, run it, then run whatever else is queued.
    pub async fn turn(&mut self) -> usize {
        match self.tasks.recv().await {
            Some(task) => {
                task(&mut self.host);
                1 + self.run_pending()
            }
            None => 0,
        }
    }

    /// Run tasks as they arrive until `duration` has elapsed.
    pub async fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                task = self.tasks.recv() => match task {
                    Some(task) => task(&mut self.host),
                    None => return,
                },
            }
        }
    }

    /// Run tasks until `done` holds or `limit` elapses. Returns whether
    /// `done` held.
    pub async fn run_until<P>(&mut self, limit: Duration, mut done: P) -> bool
    where
        P: FnMut(&mut Host) -> bool,
    {
        self.run_pending();
        if done(&mut self.host) {
            return true;
        }
        let deadline = Instant::now() + limit;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                task = self.tasks.recv() => match task {
                    Some(task) => task(&mut self.host),
                    None => return false,
                },
            }
            if done(&mut self.host) {
                return true;
            }
        }
    }

    /// Run tasks while `future` is pending, up to `limit`.
    ///
    /// Tasks queued by the time the future resolves are run before returning.
    pub async fn drive<F: Future>(&mut self, future: F, limit: Duration) -> Option<F::Output> {
        let deadline = Instant::now() + limit;
        tokio::pin!(future);
        loop {
            tokio::select! {
                biased;
                output = &mut future => {
                    self.run_pending();
                    return Some(output);
                }
                _ = tokio::time::sleep_until(deadline) => return None,
                task = self.tasks.recv() => match task {
                    Some(task) => task(&mut self.host),
                    None => return None,
                },
            }
        }
    }
}

impl fmt::Debug for HostLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostLoop").field("host", &self.host).finish_non_exhaustive()
    }
}
