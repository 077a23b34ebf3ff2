//! Transport-agnostic RPC call execution.
//!
//! This crate provides the pieces a call travels through between a caller
//! and a transport: ordered backpressured streams, interceptor pipelines,
//! per-method retry policy with a shared throttle, and the client/server
//! transport abstractions (plus type-erased wrappers for heterogeneous
//! transport collections).
//!
//! ## Modules
//!
//! - [`error`]: Status codes and error types
//! - [`method`]: Method descriptors
//! - [`stream`]: Stream primitives bound to a call attempt
//! - [`message`]: Parts and streaming request/response envelopes
//! - [`context`]: Call options and per-call contexts
//! - [`config`]: Per-method retry and timeout policy
//! - [`throttle`]: The transport-wide retry throttle
//! - [`interceptor`]: Client and server interceptor chains
//! - [`transport`]: Transport traits and type-erased wrappers
//! - [`call`]: The client call executor
//! - [`server`]: The server-side stream pipeline

mod call;
mod config;
mod context;
mod error;
mod interceptor;
mod message;
mod method;
mod server;
mod stream;
mod throttle;
mod transport;

pub use call::*;
pub use config::*;
pub use context::*;
pub use error::*;
pub use interceptor::*;
pub use message::*;
pub use method::*;
pub use server::*;
pub use stream::*;
pub use throttle::*;
pub use transport::*;
