//! Opaque handles for native objects.
//!
//! # Data Flow
//! ```text
//! Host call carrying (stack id, object id)
//!     → StackRegistry lookup (stack id → StackContext)
//!     → per-stack table lookup (object id → Connection / ListenSession / InterfaceBinding)
//!     → native operation
//! ```
//!
//! # Design Decisions
//! - Host code never holds a native object, only a `Handle`
//! - Handles are issued by one table and mean nothing outside it
//! - Values are never reused, even after removal

pub mod table;

pub use table::{Handle, HandleTable, HandlesExhausted};
