//! Errors that travel through the handler chain.

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Boxed application error carried by [`Error::Handler`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// The result type every handler returns.
pub type HandlerResult = Result<(), Error>;

/// A failure raised while driving a handler chain.
///
/// [`Error::ChainEnd`] is the end-of-chain condition; it only reaches a caller
/// who calls `next()` on a chain that has already run to completion. Everything
/// else halts the chain and surfaces to the dispatch engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("handler chain reached end")]
    ChainEnd,

    #[error("recovered panic: {0}")]
    Panic(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Handler(BoxError),
}

impl Error {
    /// Wraps any application error.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Handler(err.into())
    }

    /// Builds a handler error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Handler(message.into().into())
    }

    /// Returns the wrapped application error when this is [`Error::Handler`].
    pub fn as_handler(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Self::Handler(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}
