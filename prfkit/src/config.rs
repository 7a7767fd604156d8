//! Stack configuration.
//!
//! Which profiles are compiled in is chosen with Cargo features (`bass`, `hrps`, ..., or the
//! `servers` and `clients` groups). The sizes of the bounded buffers are fixed here.

use crate::{att::AttributeDb, kernel::Kernel};
use heapless::consts::{U16, U4, U6};

/// Trait for platform configurations.
///
/// Defines the implementations of the two services provided by the vendor stack. Every
/// application defines a type implementing this trait and hands it to the [`Dispatcher`].
///
/// [`Dispatcher`]: ../dispatch/struct.Dispatcher.html
pub trait Config {
    /// The attribute database.
    type Db: AttributeDb;

    /// Kernel messaging, task states and the GAP connection table.
    type Kernel: Kernel;
}

/// Maximum length of an attribute value handled by the profiles.
pub const MAX_VALUE_LEN: usize = 64;

/// Number of simultaneous connections (and so of per-connection task instances).
pub const MAX_CONNECTIONS: usize = 2;

/// Messages a task instance can hold back while it is busy.
pub type DeferredDepth = U4;

/// Outbound messages a single transition may emit.
pub type OutboxDepth = U6;

/// Task instances and application handlers a dispatcher can hold.
pub type MaxTasks = U16;
