//! Handler chain, the ordered, abortable list of handlers run for one request.
//!
//! ## Core types
//!
//! - [`Handler`]: type-erased, cheaply-cloneable handler function.
//! - [`handler`]: converts a closure or `fn` into a [`Handler`].
//! - [`HandlerChain`]: the handler list plus its cursor and abort flag.
//!
//! The chain is driven through [`Context::next`], which owns the chain for the
//! lifetime of the request. A handler may call `next()` itself to run the rest
//! of the chain inline (and then act after it), call [`Context::abort`] to stop
//! later handlers without failing, or return an error to halt the chain and
//! surface the error to the engine.

use std::fmt;
use std::sync::Arc;

use crate::context::Context;
use crate::error::HandlerResult;

/// A type-erased, reference-counted handler function.
///
/// Every handler in a chain or in the route table is stored as a `Handler`.
/// The [`Arc`] wrapper makes it cheap for the engine to copy handlers out of the
/// shared route table into each request's chain.
///
/// ```rust
/// use trellis::chain::{Handler, handler};
///
/// let hello: Handler = handler(|ctx| {
///     ctx.write_str("hello")?;
///     Ok(())
/// });
/// ```
pub type Handler = Arc<dyn Fn(&mut Context) -> HandlerResult + Send + Sync + 'static>;

/// Wraps a closure or function into a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&mut Context) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The handler list for a single request, with a cursor and an abort flag.
///
/// The cursor only moves forward during one execution. Once the abort flag is
/// set (by [`abort`](Self::abort) or by running off the end) no further handler
/// runs until [`reset`](Self::reset).
///
/// Adding handlers while the chain is running is the caller's responsibility;
/// the engine only adds them before the first `next()`.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Handler>,
    cursor: usize,
    aborted: bool,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self {
            handlers: Vec::with_capacity(5),
            cursor: 0,
            aborted: false,
        }
    }

    /// Appends a handler.
    pub fn add(&mut self, handler: Handler) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Index of the next handler to run.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// `true` once every handler has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.handlers.len()
    }

    /// Stops the chain. Later handlers are skipped until [`reset`](Self::reset).
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Rewinds the cursor and clears the abort flag.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.aborted = false;
    }

    // Hands out the handler under the cursor and moves past it.
    pub(crate) fn advance(&mut self) -> Option<Handler> {
        let handler = self.handlers.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(handler)
    }
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("len", &self.handlers.len())
            .field("cursor", &self.cursor)
            .field("aborted", &self.aborted)
            .finish()
    }
}
