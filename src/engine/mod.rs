//! Dispatch engine. Picks one handling strategy per request, builds the
//! handler chain and runs it under a panic guard.
//!
//! Strategies are tried in a fixed order, first match wins:
//!
//! 1. [`Strategy::StaticFile`]: static serving is configured and a file
//!    exists for the (index-rewritten) path.
//! 2. [`Strategy::Upgrade`]: the request asks for a websocket upgrade and a
//!    `WS` route is registered at the path.
//! 3. [`Strategy::Dynamic`]: a route is registered for the request method.
//! 4. [`Strategy::NotFound`]: the route table's not-found handler.
//!
//! If none applies the result is [`Strategy::Unresolved`]: no handler is
//! selected and the response keeps its default status. Global middleware is
//! put at the front of the chain in every case.

mod hooks;
mod static_files;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

pub use hooks::{
    Debugger, Monitor, MonitorInfo, Recovery, default_debugger, default_recovery, panic_message,
};
pub use static_files::{StaticFiles, content_type};

use crate::chain::Handler;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{Error, HandlerResult};
use crate::http::{Request, Response, StatusCode};
use crate::router::{RouteMethod, RouteTable};

/// The handling path chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    StaticFile,
    Upgrade,
    Dynamic,
    NotFound,
    Unresolved,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaticFile => "file",
            Self::Upgrade => "ws",
            Self::Dynamic => "dynamic",
            Self::NotFound => "not_found",
            Self::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `true` if the request carries an `Upgrade` header asking for websocket.
pub fn is_upgrade(request: &Request) -> bool {
    request.headers().has_token("upgrade", "websocket")
}

/// Owns the route table, the configuration and the hooks. Shared read-only
/// between requests once serving starts.
///
/// # Examples
///
/// ```rust
/// use trellis::config::EngineConfig;
/// use trellis::engine::Engine;
/// use trellis::http::{Request, StatusCode};
/// use trellis::router::RouteTable;
///
/// let mut routes = RouteTable::new();
/// routes.get("/func", |ctx| {
///     ctx.write_str("hello get")?;
///     Ok(())
/// });
/// let engine = Engine::new(EngineConfig::default(), routes);
///
/// let (req, _) = Request::parse(b"GET /func HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
/// let resp = engine.serve(req);
/// assert_eq!(resp.status(), StatusCode::OK);
/// assert_eq!(resp.body_bytes(), b"hello get");
/// ```
pub struct Engine {
    config: EngineConfig,
    routes: RouteTable,
    static_files: Option<StaticFiles>,
    recovery: Recovery,
    debugger: Debugger,
    monitor: Option<Arc<dyn Monitor>>,
}

impl Engine {
    /// Builds an engine. Static serving is enabled when `config.static_dir` is set.
    pub fn new(config: EngineConfig, routes: RouteTable) -> Self {
        let static_files = config
            .static_dir
            .as_ref()
            .map(|dir| StaticFiles::new(dir, config.index_file.as_str()));
        for line in routes.routes() {
            debug!("{line}");
        }
        info!(
            mode = ?config.mode,
            routes = routes.len(),
            static_dir = ?config.static_dir,
            "engine ready"
        );
        Self {
            debugger: default_debugger(config.mode),
            recovery: default_recovery(),
            config,
            routes,
            static_files,
            monitor: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn static_files(&self) -> Option<&StaticFiles> {
        self.static_files.as_ref()
    }

    /// Replaces the panic-to-error conversion.
    pub fn set_recovery<F>(&mut self, f: F)
    where
        F: Fn(&mut Context, &(dyn std::any::Any + Send)) -> Error + Send + Sync + 'static,
    {
        self.recovery = Arc::new(f);
    }

    /// Replaces the hook that receives chain errors.
    pub fn set_debugger<F>(&mut self, f: F)
    where
        F: Fn(&mut Context, &Error) + Send + Sync + 'static,
    {
        self.debugger = Arc::new(f);
    }

    /// Installs a monitor. It only runs while `config.monitor` is on.
    pub fn set_monitor(&mut self, monitor: impl Monitor + 'static) {
        self.monitor = Some(Arc::new(monitor));
    }

    /// Creates the context for `request`.
    pub fn context(&self, request: Request) -> Context {
        Context::new(request, &self.config)
    }

    /// Chooses the strategy for `ctx` and fills its chain accordingly.
    ///
    /// A request for the index file is rewritten to its directory before
    /// anything else is consulted.
    pub fn check(&self, ctx: &mut Context) -> Strategy {
        let (strategy, selected) = self.resolve(ctx);
        let chain = ctx.chain_mut();
        for mw in self.routes.middleware() {
            chain.add(Arc::clone(mw));
        }
        if let Some(handler) = selected {
            chain.add(handler);
        }
        strategy
    }

    fn resolve(&self, ctx: &mut Context) -> (Strategy, Option<Handler>) {
        if let Some(files) = &self.static_files {
            if let Some(rewritten) = files.rewrite_index(ctx.path()) {
                debug!(from = %ctx.path(), to = %rewritten, "index path rewritten");
                ctx.request_mut().set_path(rewritten);
            }
            if let Some(file) = files.resolve(ctx.path()) {
                return (Strategy::StaticFile, Some(files.handler(file)));
            }
        }

        if is_upgrade(ctx.request()) {
            if let Ok(h) = self.routes.lookup(RouteMethod::Ws.as_str(), ctx.path()) {
                return (Strategy::Upgrade, Some(h));
            }
        }

        let dynamic = RouteMethod::from_method(ctx.method())
            .and_then(|m| self.routes.lookup(m.as_str(), ctx.path()).ok());
        if let Some(h) = dynamic {
            return (Strategy::Dynamic, Some(h));
        }

        match self.routes.not_found() {
            Some(h) => (Strategy::NotFound, Some(Arc::clone(h))),
            None => (Strategy::Unresolved, None),
        }
    }

    /// Runs the chain under a panic guard.
    ///
    /// A panic is turned into an error by the installed [`Recovery`]. Reaching
    /// the end of the chain is success.
    ///
    /// # Errors
    ///
    /// The first handler error, or the recovered panic.
    pub fn handle(&self, ctx: &mut Context) -> HandlerResult {
        match panic::catch_unwind(AssertUnwindSafe(|| ctx.next())) {
            Ok(Err(Error::ChainEnd)) => Ok(()),
            Ok(result) => result,
            Err(payload) => Err((self.recovery)(ctx, payload.as_ref())),
        }
    }

    /// Dispatches one request end to end and returns the finished response.
    pub fn serve(&self, request: Request) -> Response {
        let started = Instant::now();
        let mut ctx = self.context(request);
        for e in ctx.errors() {
            debug!(error = %e, "request parse error");
        }

        let strategy = self.check(&mut ctx);
        let monitor = self.monitor.as_ref().filter(|_| self.config.monitor);
        if let Some(m) = monitor {
            m.on_start(&MonitorInfo::capture(&ctx, strategy));
        }
        if let Err(err) = self.handle(&mut ctx) {
            (self.debugger)(&mut ctx, &err);
        }
        if let Some(m) = monitor {
            m.on_end(&MonitorInfo::capture(&ctx, strategy));
        }
        if self.config.log {
            access_log(&ctx, strategy, started.elapsed());
        }

        ctx.close().unwrap_or_else(|e| {
            error!(error = %e, "failed to finish response");
            Response::new(StatusCode::INTERNAL_SERVER_ERROR)
        })
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("routes", &self.routes)
            .field("static_files", &self.static_files)
            .field("monitor", &self.monitor.is_some())
            .finish()
    }
}

fn access_log(ctx: &Context, strategy: Strategy, elapsed: Duration) {
    let status = ctx.writer().effective_status();
    let code = status.as_u16();
    let method = ctx.method().as_str();
    let path = ctx.path();
    let bytes = ctx.byte_count();
    let client = ctx.client_ip().unwrap_or_default();
    let strategy = strategy.as_str();
    if status.is_server_error() {
        error!(method, path, status = code, bytes, client = %client, strategy, ?elapsed, "request");
    } else if status.is_client_error() {
        warn!(method, path, status = code, bytes, client = %client, strategy, ?elapsed, "request");
    } else {
        info!(method, path, status = code, bytes, client = %client, strategy, ?elapsed, "request");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;

    use super::*;
    use crate::config::Mode;

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn get(path: &str) -> Request {
        request(&format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\n"))
    }

    fn quiet() -> EngineConfig {
        EngineConfig::default().log(false)
    }

    fn body(resp: &Response) -> &str {
        std::str::from_utf8(resp.body_bytes()).unwrap()
    }

    #[test]
    fn dynamic_route_default_status() {
        let mut routes = RouteTable::new();
        routes.get("func", |ctx| {
            ctx.write_str("hello get")?;
            Ok(())
        });
        let engine = Engine::new(quiet(), routes);
        let resp = engine.serve(get("/func"));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(&resp), "hello get");
    }

    #[test]
    fn strategies_in_priority_order() {
        let mut routes = RouteTable::new();
        routes.get("chat", |_ctx| Ok(()));
        routes.ws("chat", |_ctx| Ok(()));
        routes.post("only-post", |_ctx| Ok(()));
        let engine = Engine::new(quiet(), routes);

        let mut ctx = engine.context(get("/chat"));
        assert_eq!(engine.check(&mut ctx), Strategy::Dynamic);

        let upgrade = request("GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: WebSocket\r\n\r\n");
        let mut ctx = engine.context(upgrade);
        assert_eq!(engine.check(&mut ctx), Strategy::Upgrade);

        let upgrade_miss = request("GET /only-post HTTP/1.1\r\nUpgrade: websocket\r\n\r\n");
        let mut ctx = engine.context(upgrade_miss);
        assert_eq!(engine.check(&mut ctx), Strategy::Unresolved);
        assert!(ctx.chain().is_empty());
    }

    #[test]
    fn upgrade_miss_falls_back_to_method_route() {
        let mut routes = RouteTable::new();
        routes.get("plain", |_ctx| Ok(()));
        let engine = Engine::new(quiet(), routes);
        let req = request("GET /plain HTTP/1.1\r\nUpgrade: websocket\r\n\r\n");
        let mut ctx = engine.context(req);
        assert_eq!(engine.check(&mut ctx), Strategy::Dynamic);
    }

    #[test]
    fn not_found_runs_through_middleware() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut routes = RouteTable::new();
        let t = Arc::clone(&trace);
        routes.use_middleware(move |_ctx| {
            t.lock().unwrap().push("mw");
            Ok(())
        });
        let t = Arc::clone(&trace);
        routes.set_not_found(move |ctx| {
            t.lock().unwrap().push("404");
            ctx.set_status(StatusCode::NOT_FOUND);
            ctx.commit_now();
            Ok(())
        });
        let engine = Engine::new(quiet(), routes);

        let req = request("DELETE /missing HTTP/1.1\r\nHost: x\r\n\r\n");
        let resp = engine.serve(req);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.body_bytes().is_empty());
        assert_eq!(*trace.lock().unwrap(), vec!["mw", "404"]);
    }

    #[test]
    fn unresolved_keeps_default_status() {
        let engine = Engine::new(quiet(), RouteTable::new());
        let mut ctx = engine.context(get("/nothing"));
        assert_eq!(engine.check(&mut ctx), Strategy::Unresolved);
        assert!(engine.handle(&mut ctx).is_ok());
        assert_eq!(ctx.status(), None);
        let resp = engine.serve(get("/nothing"));
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.body_bytes().is_empty());
    }

    #[test]
    fn panic_becomes_500_and_reaches_hooks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut routes = RouteTable::new();
        routes.get("boom", |_ctx| panic!("handler exploded"));
        let mut engine = Engine::new(quiet().mode(Mode::Production), routes);
        let s = Arc::clone(&seen);
        engine.set_debugger(move |_ctx, err| s.lock().unwrap().push(err.to_string()));

        let resp = engine.serve(get("/boom"));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["recovered panic: handler exploded".to_owned()]
        );
    }

    #[test]
    fn custom_recovery_is_used() {
        let mut routes = RouteTable::new();
        routes.get("boom", |_ctx| panic!("{}", String::from("dynamic message")));
        let mut engine = Engine::new(quiet(), routes);
        engine.set_recovery(|ctx, payload| {
            ctx.set_status(StatusCode::SERVICE_UNAVAILABLE);
            Error::msg(format!("caught: {}", panic_message(payload)))
        });

        let mut ctx = engine.context(get("/boom"));
        engine.check(&mut ctx);
        let err = engine.handle(&mut ctx).unwrap_err();
        assert_eq!(err.to_string(), "caught: dynamic message");
        assert_eq!(ctx.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn handler_error_reaches_default_debugger() {
        let mut routes = RouteTable::new();
        routes.get("fail", |_ctx| Err(Error::msg("no database")));
        let engine = Engine::new(quiet(), routes);
        let resp = engine.serve(get("/fail"));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body(&resp).contains("no database"));
    }

    #[test]
    fn middleware_at_end_of_chain_is_not_an_error() {
        let engine = Engine::new(quiet(), RouteTable::new());
        let mut ctx = engine.context(get("/x"));
        ctx.chain_mut().add(crate::chain::handler(|ctx| ctx.next()));
        assert!(engine.handle(&mut ctx).is_ok());
        assert!(ctx.is_aborted());
    }

    struct Recorder(Mutex<Vec<(Strategy, Option<StatusCode>)>>);

    impl Monitor for Arc<Recorder> {
        fn on_start(&self, info: &MonitorInfo) {
            self.0.lock().unwrap().push((info.strategy, info.status));
        }

        fn on_end(&self, info: &MonitorInfo) {
            self.0.lock().unwrap().push((info.strategy, info.status));
        }
    }

    #[test]
    fn monitor_runs_only_when_enabled() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut routes = RouteTable::new();
        routes.post("save", |ctx| {
            ctx.set_status(StatusCode::CREATED);
            Ok(())
        });

        let mut engine = Engine::new(quiet(), routes);
        engine.set_monitor(Arc::clone(&recorder));
        engine.serve(request("POST /save HTTP/1.1\r\nHost: x\r\n\r\n"));
        assert!(recorder.0.lock().unwrap().is_empty());

        let mut routes = RouteTable::new();
        routes.post("save", |ctx| {
            ctx.set_status(StatusCode::CREATED);
            Ok(())
        });
        let mut engine = Engine::new(quiet().monitor(true), routes);
        engine.set_monitor(Arc::clone(&recorder));
        engine.serve(request("POST /save HTTP/1.1\r\nHost: x\r\n\r\n"));
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                (Strategy::Dynamic, None),
                (Strategy::Dynamic, Some(StatusCode::CREATED)),
            ]
        );
    }

    #[test]
    fn static_index_and_root_share_the_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<p>home</p>").unwrap();
        let mut routes = RouteTable::new();
        routes.get("/", |ctx| {
            ctx.write_str("route")?;
            Ok(())
        });
        let engine = Engine::new(quiet().static_dir(dir.path()), routes);

        let mut root = engine.context(get("/"));
        assert_eq!(engine.check(&mut root), Strategy::StaticFile);

        let mut explicit = engine.context(get("/index.html"));
        assert_eq!(engine.check(&mut explicit), Strategy::StaticFile);
        assert_eq!(explicit.path(), "/");

        let resp = engine.serve(get("/index.html"));
        assert_eq!(body(&resp), "<p>home</p>");
        assert_eq!(
            resp.headers().get("content-type"),
            Some("text/html; charset=utf-8")
        );
    }

    #[test]
    fn index_rewrite_happens_before_route_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut routes = RouteTable::new();
        routes.get("/", |ctx| {
            ctx.write_str("root route")?;
            Ok(())
        });
        let engine = Engine::new(quiet().static_dir(dir.path()), routes);
        let resp = engine.serve(get("/index.html"));
        assert_eq!(body(&resp), "root route");
    }

    #[test]
    fn compression_is_negotiated() {
        let mut routes = RouteTable::new();
        routes.get("z", |ctx| {
            ctx.write_str(&"squeeze me ".repeat(50))?;
            Ok(())
        });
        let engine = Engine::new(quiet().compression(true), routes);
        let req = request("GET /z HTTP/1.1\r\nAccept-Encoding: gzip, deflate\r\n\r\n");
        let resp = engine.serve(req);
        assert_eq!(resp.headers().get("content-encoding"), Some("gzip"));
        assert!(resp.body_bytes().len() < 550);
    }

    #[test]
    fn upgrade_detection() {
        assert!(is_upgrade(&request("GET / HTTP/1.1\r\nupgrade: websocket\r\n\r\n")));
        assert!(!is_upgrade(&request("GET / HTTP/1.1\r\nUpgrade: h2c\r\n\r\n")));
        assert!(!is_upgrade(&get("/")));
        assert_eq!(Strategy::NotFound.to_string(), "not_found");
    }
}
