//! # greeter-core
//!
//! Shared vocabulary for the greeter streaming server:
//!
//! - **Session identifiers**: [`SessionId`] newtype and the never-reusing
//!   [`SessionIdAllocator`]
//! - **Completion tags**: [`Tag`] and [`EventKind`], plus the `u64` packing the
//!   transport carries through its completion queues
//! - **Logging**: subscriber bootstrap and an in-memory capture layer for tests

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;
pub mod tag;

pub use ids::{SessionId, SessionIdAllocator};
pub use tag::{EVENT_BITS, EventKind, MAX_SESSION_ID, Tag};
