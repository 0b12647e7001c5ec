//! # trellis
//!
//! A small request-dispatch layer for HTTP/1.1: exact-match routing, an
//! abortable handler chain, a one-shot response writer and panic recovery.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use trellis::{Engine, EngineConfig, RouteTable, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut routes = RouteTable::new();
//!     routes.get("/hello", |ctx| {
//!         ctx.write_str("Hello, World!")?;
//!         Ok(())
//!     });
//!
//!     let engine = Arc::new(Engine::new(EngineConfig::default(), routes));
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.serve(engine).await?;
//!     Ok(())
//! }
//! ```

// ── Protocol primitives and the host listener ─────────────────────────────────
pub mod http;
pub mod server;

// ── Dispatch core ─────────────────────────────────────────────────────────────
pub mod chain;
pub mod context;
pub mod engine;
pub mod error;
pub mod router;

// ── Supporting modules ────────────────────────────────────────────────────────
pub mod config;
pub mod security;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use chain::{Handler, HandlerChain, handler};
pub use config::{EngineConfig, Mode};
pub use context::{Context, Cookie};
pub use engine::{Engine, Strategy};
pub use error::{Error, HandlerResult};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::{RouteTable, normalize_path};
pub use server::{Server, ServerError};
