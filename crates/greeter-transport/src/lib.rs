//! # greeter-transport
//!
//! Asynchronous, completion-queue style transport for bidirectional streaming
//! calls.
//!
//! Callers never await individual operations. Instead they issue an operation
//! with an opaque `u64` tag and later drain a [`CompletionQueue`], which yields
//! `(tag, ok)` pairs in completion order:
//!
//! - [`ServerBuilder`] binds a TCP listener and creates completion queues
//! - [`Server::request_call`] arms a [`CallContext`] to accept the next client
//! - [`CallContext::read`] / [`CallContext::write`] move one length-delimited
//!   frame each
//! - [`CallContext::notify_when_done`] reports the end of a call
//! - [`Server::shutdown`] fails pending accepts, cancels live calls and waits
//!   for every in-flight operation to report before returning
//! - [`ClientStream`] is the peer side, for tools and tests

#![deny(unsafe_code)]

pub mod call;
pub mod client;
pub mod errors;
pub mod queue;
pub mod server;

pub use call::CallContext;
pub use client::ClientStream;
pub use errors::{Result, TransportError};
pub use queue::{Completion, CompletionQueue};
pub use server::{Server, ServerBuilder};

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// Default number of accepted connections held while no call is armed.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 128;

pub(crate) fn frame_codec(max_frame_length: usize) -> tokio_util::codec::LengthDelimitedCodec {
    tokio_util::codec::LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}
