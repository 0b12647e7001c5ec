//! Replaceable hooks around chain execution: panic recovery, the failure
//! debugger and the dispatch monitor.

use std::any::Any;
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::json;
use tracing::error;

use crate::config::Mode;
use crate::context::Context;
use crate::error::Error;
use crate::http::StatusCode;

use super::Strategy;

/// Converts a panic caught at the dispatch boundary into a chain error.
///
/// Receives the context (so it can still set a status) and the panic payload.
pub type Recovery = Arc<dyn Fn(&mut Context, &(dyn Any + Send)) -> Error + Send + Sync + 'static>;

/// Receives every error that escapes a chain, after recovery.
pub type Debugger = Arc<dyn Fn(&mut Context, &Error) + Send + Sync + 'static>;

/// Extracts the message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Forces status 500 if nothing was committed and returns [`Error::Panic`].
pub fn default_recovery() -> Recovery {
    Arc::new(|ctx: &mut Context, payload: &(dyn Any + Send)| {
        ctx.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        Error::Panic(panic_message(payload))
    })
}

/// Logs the failure. An uncommitted response without a status becomes a 500;
/// in [`Mode::Debug`] an uncommitted response also gets a JSON error body.
pub fn default_debugger(mode: Mode) -> Debugger {
    Arc::new(move |ctx: &mut Context, err: &Error| {
        error!(path = %ctx.path(), error = %err, "handler chain failed");
        if ctx.writer().is_committed() {
            return;
        }
        if ctx.status().is_none() {
            ctx.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        }
        if mode != Mode::Debug {
            return;
        }
        let status = ctx.writer().effective_status();
        let doc = json!({
            "path": ctx.path(),
            "status": status.as_u16(),
            "message": err.to_string(),
        });
        ctx.set_header("Content-Type", "application/json");
        if let Err(e) = ctx.write_str(&doc.to_string()) {
            error!(error = %e, "failed to write error document");
        }
    })
}

/// Snapshot handed to a [`Monitor`] before and after a dispatch.
#[derive(Debug, Clone)]
pub struct MonitorInfo {
    pub at: SystemTime,
    pub strategy: Strategy,
    pub method: String,
    pub path: String,
    /// Pending or committed status at the time of the snapshot.
    pub status: Option<StatusCode>,
}

impl MonitorInfo {
    pub(crate) fn capture(ctx: &Context, strategy: Strategy) -> Self {
        Self {
            at: SystemTime::now(),
            strategy,
            method: ctx.method().to_string(),
            path: ctx.path().to_owned(),
            status: ctx.status(),
        }
    }
}

/// Observes dispatches. Only called when monitoring is enabled in the config.
pub trait Monitor: Send + Sync {
    fn on_start(&self, info: &MonitorInfo);
    fn on_end(&self, info: &MonitorInfo);
}
