//! # heron-amqp
//!
//! Call/response RPC over an AMQP 0.9.1 broker for HeronStack services.
//!
//! The transport turns the broker's asynchronous publish/subscribe into a
//! synchronous-looking call primitive:
//!
//! - [`AmqpTransport::publish_call`] publishes a named, correlation-tagged
//!   request and waits for the reply on the transport's private reply queue.
//! - [`AmqpTransport::subscribe_on_call`] binds a handler to a call name and
//!   publishes each handler result back to the requester's reply address.
//!
//! Replies are matched to calls solely by correlation id, so out-of-order
//! replies under concurrent calls are expected and supported. Failures with
//! no waiting caller (ack failures, handler panics, reply publish failures)
//! are observable on the [`ErrorEvent`] channel. A lost broker connection
//! suspends publish/subscribe behind a gate while a supervisor reconnects
//! with capped exponential backoff.
//!
//! ## Example
//!
//! ```rust,no_run
//! use heron_amqp::{AmqpConfig, AmqpTransport, SubscribeOptions};
//! use heron_std::env::SystemEnv;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), heron_errors::Error> {
//!     let transport = AmqpTransport::connect(AmqpConfig::from_env(&SystemEnv)).await?;
//!     transport
//!         .subscribe_on_call(
//!             "echo",
//!             |body| async move { Ok::<_, heron_errors::Error>(body) },
//!             SubscribeOptions::new(),
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod config;
pub mod events;
pub mod headers;
pub mod publish;
pub mod subscribe;
pub mod transport;

mod gate;
mod registry;
mod supervisor;

pub use call::{CallHandler, CallRequest, HandlerFuture};
pub use config::{AmqpConfig, DIRECT_REPLY_TO};
pub use events::ErrorEvent;
pub use headers::{headers_with_trace_context, inject_trace_context};
pub use publish::CallOptions;
pub use subscribe::SubscribeOptions;
pub use transport::AmqpTransport;
