//! A framework for building servers that speak the Redis Serialization
//! Protocol (RESP) over TCP or TLS.
//!
//! The crate supplies the protocol codec, the per-connection runtime, the
//! accept loop with admission control and idle sweeping, and a dispatch
//! pipeline of middleware ending in a registered command handler. Storage
//! and command semantics belong to the embedder:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use respkit::{Command, Config, Connection, Frame, Server};
//!
//! #[tokio::main]
//! async fn main() -> respkit::Result<()> {
//!     let server = Arc::new(Server::new(Config::default()));
//!
//!     server.register("TIME", |_conn: &Connection, _cmd: &Command| {
//!         Frame::simple("nope, still no clock here")
//!     })?;
//!
//!     let accept = tokio::spawn(Arc::clone(&server).serve());
//!     // ... until some signal arrives ...
//!     server.shutdown(Duration::from_secs(5)).await?;
//!     accept.await.expect("accept loop panicked")
//! }
//! ```

pub mod command;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handler;
pub mod registry;
pub mod server;

pub use command::Command;
pub use config::{Config, StateObserver};
pub use connection::{ClientStream, ConnState, Connection, FrameStream};
pub use error::ServerError;
pub use frame::Frame;
pub use handler::{Handler, Middleware, MiddlewareChain};
pub use registry::CommandRegistry;
pub use server::Server;

pub type Result<T> = std::result::Result<T, ServerError>;
