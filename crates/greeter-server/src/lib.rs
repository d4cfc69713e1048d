//! # greeter-server
//!
//! Dispatch core of the greeter streaming server.
//!
//! - [`GreeterServer`] binds the transport, then `run()` drives two
//!   [`Dispatcher`] loops (call and notification queues) and a
//!   [`BroadcastTicker`] until `stop()` shuts them down in order
//! - [`SessionRegistry`] maps session ids to [`Session`]s and keeps one
//!   session waiting for the next client
//! - [`Session`] is the per-call state machine; it issues transport
//!   operations through [`CallOps`] and gets broadcast payloads from a
//!   [`ReplySource`]
//!
//! Lock order: registry, then session. Only shutdown nests the two.

#![deny(unsafe_code)]

pub mod call;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod metrics;
pub mod registry;
pub mod reply;
pub mod server;
pub mod session;
pub mod ticker;

#[cfg(test)]
mod test_support;

pub use call::{CallOps, CallSource, TransportCalls};
pub use config::ServerConfig;
pub use dispatcher::{CompletionStream, DispatchOutcome, Dispatcher};
pub use errors::{Result, ServerError};
pub use registry::{SessionRegistry, StatusCounts};
pub use reply::{GreetingReplies, ReplyContext, ReplySource};
pub use server::{GreeterServer, ServerStats};
pub use session::{Session, SessionRef, SessionStatus, Transition};
pub use ticker::BroadcastTicker;
