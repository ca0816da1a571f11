//! Process-wide registry of live stacks.

use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::handle::{Handle, HandleTable};
use crate::stack::context::StackContext;

/// Arena of stack contexts owned by the host. Entries are never reclaimed.
#[derive(Debug, Default)]
pub struct StackRegistry {
    stacks: HandleTable<Arc<StackContext>>,
}

impl StackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a stack handle and build the context that owns it.
    pub fn register_with<F>(&self, build: F) -> Result<Handle>
    where
        F: FnOnce(Handle) -> Result<Arc<StackContext>>,
    {
        self.stacks.try_insert_with(build)
    }

    pub fn get(&self, id: Handle) -> Result<Arc<StackContext>> {
        self.stacks.get(id).ok_or(BridgeError::UnknownStack(id))
    }

    pub fn count(&self) -> usize {
        self.stacks.count()
    }
}
