//! Security middleware.
//!
//! Currently implemented:
//!
//! - [`Cors`]: Cross-Origin Resource Sharing header injection and preflight
//!   (`OPTIONS`) short-circuiting.

use std::sync::Arc;

use tracing::trace;

use crate::chain::{Handler, handler};
use crate::context::Context;
use crate::error::HandlerResult;
use crate::http::{Method, StatusCode};

/// CORS policy. Validates the `Origin` header, answers preflight requests and
/// adds `Access-Control-*` headers to actual responses.
///
/// Turned into a chain handler with [`into_handler`](Self::into_handler) and
/// registered as global middleware.
///
/// # Behavior
///
/// - If no `Origin` header is present the chain continues unmodified.
/// - If the origin is not in the allow-list the chain continues unmodified.
/// - `OPTIONS` preflight requests are answered with `204 No Content` and the
///   `Access-Control-*` headers, and the chain is aborted; no later handler runs.
/// - For all other requests the headers are set before later handlers write.
/// - A `Vary: Origin` header is added when a specific origin is echoed back.
///
/// # Examples
///
/// ```rust
/// use trellis::router::RouteTable;
/// use trellis::security::Cors;
///
/// let cors = Cors::new()
///     .allow_origin("https://example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Custom-Header");
///
/// let mut routes = RouteTable::new();
/// routes.add_middleware(cors.into_handler());
/// ```
#[derive(Debug, Clone)]
pub struct Cors {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    max_age: u32,
}

impl Default for Cors {
    fn default() -> Self {
        Self::new()
    }
}

impl Cors {
    /// Creates a permissive policy.
    ///
    /// | Setting          | Default value                          |
    /// |------------------|----------------------------------------|
    /// | Allowed origins  | any (`*`) until one is added           |
    /// | Allowed methods  | `GET`, `POST`, `PUT`, `DELETE`         |
    /// | Allowed headers  | `Content-Type`, `Authorization`        |
    /// | Preflight max age| 3600 seconds                           |
    pub fn new() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_methods: ["GET", "POST", "PUT", "DELETE"].map(String::from).to_vec(),
            allowed_headers: ["Content-Type", "Authorization"].map(String::from).to_vec(),
            max_age: 3600,
        }
    }

    /// Adds an allowed origin. Once any origin is added only listed origins
    /// pass; add `"*"` to allow every origin explicitly.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// Adds an allowed HTTP method, sent verbatim in `Access-Control-Allow-Methods`.
    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    /// Adds an allowed request header, sent verbatim in `Access-Control-Allow-Headers`.
    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    /// Sets the preflight cache lifetime in seconds.
    #[must_use]
    pub fn max_age(mut self, seconds: u32) -> Self {
        self.max_age = seconds;
        self
    }

    /// The `Access-Control-Allow-Origin` value for `origin`, or `None` if rejected.
    pub fn allow_origin_value(&self, origin: &str) -> Option<String> {
        if self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == "*") {
            Some("*".to_owned())
        } else if self.allowed_origins.iter().any(|o| o == origin) {
            Some(origin.to_owned())
        } else {
            None
        }
    }

    /// Converts the policy into a chain handler.
    pub fn into_handler(self) -> Handler {
        let policy = Arc::new(self);
        handler(move |ctx| policy.apply(ctx))
    }

    fn apply(&self, ctx: &mut Context) -> HandlerResult {
        let Some(origin) = ctx.header("origin").map(str::to_owned) else {
            return Ok(());
        };
        let Some(allow) = self.allow_origin_value(&origin) else {
            trace!(origin = %origin, "origin not allowed");
            return Ok(());
        };
        let is_wildcard = allow == "*";

        ctx.set_header("Access-Control-Allow-Origin", allow);
        ctx.set_header("Access-Control-Allow-Methods", self.allowed_methods.join(", "));
        ctx.set_header("Access-Control-Allow-Headers", self.allowed_headers.join(", "));
        if !is_wildcard {
            ctx.writer_mut().add_header("Vary", "Origin");
        }

        if *ctx.method() == Method::Options {
            ctx.set_header("Access-Control-Max-Age", self.max_age.to_string());
            ctx.set_status(StatusCode::NO_CONTENT);
            ctx.commit_now();
            ctx.abort();
        }
        Ok(())
    }
}
